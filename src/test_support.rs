use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use crate::{
    codec::Codec,
    connection::Connection,
    context::ConnectionContext,
    dispatch::DispatchRegistry,
    framing::FramingMode,
    id::ConnectionKey,
    peer::Peer,
};

/// Returns both ends of a loopback TCP connection.
pub(crate) async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (dialed.unwrap(), accepted.unwrap().0)
}

/// Opens a boundary-framed connection without a peer, returning it with the remote end.
pub(crate) async fn open_connection() -> (Connection, TcpStream) {
    let (local, remote) = tcp_pair().await;
    let connection = Connection::open(
        local,
        FramingMode::Boundary,
        ConnectionKey::DEFAULT,
        Arc::new(Codec::new()),
    )
    .unwrap();
    (connection, remote)
}

/// Builds a context over a fresh connection and peer, returning it with the remote end.
pub(crate) async fn context() -> (ConnectionContext, TcpStream) {
    let (connection, remote) = open_connection().await;
    let peer = Peer::new(Arc::new(Codec::new()), Arc::new(DispatchRegistry::new()));
    connection.set_peer(&peer);
    (ConnectionContext::new(connection, peer), remote)
}
