//! The per-message view handed to receive handlers.

use crate::{
    connection::Connection,
    error::ConnectionError,
    id::{ClientId, ConnectionKey},
    message::Message,
    peer::Peer,
    session::Session,
};

/// The connection a message arrived on, bound to the peer owning it.
///
/// Receive handlers get a context to reply on the same connection, or to reach the peer's other connections.
#[derive(Clone, Debug)]
pub struct ConnectionContext {
    connection: Connection,
    peer: Peer,
}

impl ConnectionContext {
    /// Binds a connection to a peer.
    pub fn new(connection: Connection, peer: Peer) -> Self {
        ConnectionContext { connection, peer }
    }

    /// Returns the connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Returns the peer.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Returns the peer's current session.
    pub fn session(&self) -> Session {
        self.peer.session()
    }

    /// Returns the key of the connection.
    pub fn key(&self) -> ConnectionKey {
        self.connection.key()
    }

    /// Returns the peer's id.
    pub fn client_id(&self) -> ClientId {
        self.peer.id()
    }

    /// Sends a message back over this connection.
    pub fn send<M: Message>(&self, message: &M) -> Result<(), ConnectionError> {
        self.connection.send(message)
    }

    /// Sends a message over the peer's connection stored under `key`.
    pub fn send_to<M: Message>(&self, key: &ConnectionKey, message: &M) -> Result<(), ConnectionError> {
        self.peer
            .connection(key)
            .ok_or_else(|| ConnectionError::NoConnection { key: key.clone() })?
            .send(message)
    }

    /// Closes this connection.
    pub fn close(&self) {
        self.connection.close();
    }
}
