//! A single physical TCP connection.
//!
//! A [`Connection`] owns one socket. Its read half is handed to an [event loop](crate::event_loop) which feeds the
//! received bytes back through [`Connection::receive`]; its write half is owned by a writer task fed through an
//! unbounded channel, so sending never blocks and works from synchronous receive handlers.
//!
//! Every connection belongs to a [`Peer`] under a logical [`ConnectionKey`]. When it is closed, its shutdown hooks
//! fire in registration order; this is how connections detach from their event loop and from their peer.

use std::{
    fmt, mem,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError, RwLock, Weak,
    },
};

use bytes::Bytes;
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{mpsc, watch},
};
use tracing::{debug, info_span, trace, warn, Instrument};

use crate::{
    codec::Codec,
    error::ConnectionError,
    framing::{Framer, FramingMode},
    id::{ConnectionId, ConnectionKey},
    message::{Envelope, Message},
    peer::{Peer, WeakPeer},
    rendezvous::Rendezvous,
};

type ShutdownHook = Box<dyn FnOnce(&Connection) + Send>;

/// A handle to an open TCP connection.
///
/// Handles are cheap to clone and compare with [`Connection::ptr_eq`].
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    mode: FramingMode,
    key: RwLock<ConnectionKey>,
    setup: AtomicBool,
    framer: Mutex<Framer>,
    reader: Mutex<Option<OwnedReadHalf>>,
    outbound: mpsc::UnboundedSender<Bytes>,
    closed: watch::Sender<bool>,
    hooks: Mutex<Vec<ShutdownHook>>,
    connected: Rendezvous,
    peer: RwLock<Option<WeakPeer>>,
    codec: RwLock<Arc<Codec>>,
}

impl Connection {
    /// Takes ownership of a socket and spawns its writer task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(
        stream: TcpStream,
        mode: FramingMode,
        key: ConnectionKey,
        codec: Arc<Codec>,
    ) -> std::io::Result<Connection> {
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (closed, closed_rx) = watch::channel(false);

        let connection = Connection {
            inner: Arc::new(ConnectionInner {
                id: ConnectionId::generate(),
                peer_addr,
                mode,
                key: RwLock::new(key),
                setup: AtomicBool::new(false),
                framer: Mutex::new(Framer::new(mode)),
                reader: Mutex::new(Some(reader)),
                outbound,
                closed,
                hooks: Mutex::new(Vec::new()),
                connected: Rendezvous::new(1),
                peer: RwLock::new(None),
                codec: RwLock::new(codec),
            }),
        };

        let span = info_span!("connection", id = %connection.id(), peer = ?peer_addr);
        tokio::spawn(
            write_loop(
                Arc::downgrade(&connection.inner),
                writer,
                outbound_rx,
                closed_rx,
            )
            .instrument(span),
        );

        Ok(connection)
    }

    /// Returns the process-local id.
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Returns the remote address, if it was known when the connection was opened.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Returns the framing mode.
    pub fn mode(&self) -> FramingMode {
        self.inner.mode
    }

    /// Returns the logical key.
    pub fn key(&self) -> ConnectionKey {
        self.inner
            .key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-keys the connection.
    pub fn set_key(&self, key: ConnectionKey) {
        *self.inner.key.write().unwrap_or_else(PoisonError::into_inner) = key;
    }

    /// Returns `true` while the connection is being established as a keyed secondary connection.
    pub fn is_setup(&self) -> bool {
        self.inner.setup.load(Ordering::Acquire)
    }

    /// Sets the setup flag.
    pub fn set_setup(&self, setup: bool) {
        self.inner.setup.store(setup, Ordering::Release);
    }

    /// The gate released once the connection may carry application traffic.
    pub fn connected(&self) -> &Rendezvous {
        &self.inner.connected
    }

    /// Returns `true` once [`close`](Connection::close) has been called.
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Returns a receiver that observes the connection being closed.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.inner.closed.subscribe()
    }

    /// Returns the peer this connection currently belongs to.
    pub fn peer(&self) -> Option<Peer> {
        self.inner
            .peer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(WeakPeer::upgrade)
    }

    /// Moves the connection to `peer`, adopting its codec.
    pub fn set_peer(&self, peer: &Peer) {
        *self.inner.peer.write().unwrap_or_else(PoisonError::into_inner) = Some(peer.downgrade());
        *self.inner.codec.write().unwrap_or_else(PoisonError::into_inner) = peer.codec().clone();
    }

    /// Returns the codec used by this connection.
    pub fn codec(&self) -> Arc<Codec> {
        self.inner
            .codec
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Takes the read half of the socket, leaving `None` behind.
    pub fn take_reader(&self) -> Option<OwnedReadHalf> {
        self.inner
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Queues a codec-encoded unit for writing.
    pub fn write(&self, wire: String) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed { id: self.id() });
        }

        let frame = Bytes::from(self.inner.mode.frame(wire));
        self.inner
            .outbound
            .send(frame)
            .map_err(|_| ConnectionError::Closed { id: self.id() })
    }

    /// Encodes an envelope and queues it for writing.
    pub fn send_envelope(&self, envelope: &Envelope) -> Result<(), ConnectionError> {
        let wire = self.codec().serialize(envelope)?;
        trace!(id = %self.id(), tag = %envelope.tag, "sending");
        self.write(wire)
    }

    /// Encodes a message and queues it for writing.
    pub fn send<M: Message>(&self, message: &M) -> Result<(), ConnectionError> {
        self.send_envelope(&Envelope::wrap(message)?)
    }

    /// Feeds bytes read from the socket.
    ///
    /// Every complete unit is decoded and dispatched to the owning peer in arrival order. Units that fail to decode
    /// are dropped with a warning.
    pub fn receive(&self, chunk: &[u8]) {
        let units = self
            .inner
            .framer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .feed(chunk);
        if units.is_empty() {
            return;
        }

        let codec = self.codec();
        for unit in units {
            match codec.deserialize(&unit) {
                Ok(envelope) => self.deliver(envelope),
                Err(err) => warn!(id = %self.id(), error = %err, "dropping undecodable unit"),
            }
        }
    }

    fn deliver(&self, envelope: Envelope) {
        match self.peer() {
            Some(peer) => peer.dispatch(self, envelope),
            None => warn!(id = %self.id(), tag = %envelope.tag, "connection has no peer, dropping message"),
        }
    }

    /// Registers a hook to run when the connection is closed.
    ///
    /// Hooks run in registration order on the thread calling [`close`](Connection::close). A hook registered after
    /// the connection was closed runs immediately.
    pub fn on_shutdown(&self, hook: impl FnOnce(&Connection) + Send + 'static) {
        let mut hooks = self.inner.hooks.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            drop(hooks);
            hook(self);
            return;
        }
        hooks.push(Box::new(hook));
    }

    /// Closes the connection and fires its shutdown hooks. Closing twice is a no-op.
    ///
    /// Frames queued before the call are still flushed by the writer task.
    pub fn close(&self) {
        if self.inner.closed.send_replace(true) {
            return;
        }
        debug!(id = %self.id(), key = %self.key(), "connection closed");

        let hooks = mem::take(&mut *self.inner.hooks.lock().unwrap_or_else(PoisonError::into_inner));
        for hook in hooks {
            hook(self);
        }
    }

    /// Returns `true` if both handles point to the same connection.
    pub fn ptr_eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("key", &self.key())
            .field("peer_addr", &self.peer_addr())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Resolves once `flag` is raised or its sender is gone.
pub(crate) async fn raised(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|raised| *raised).await;
}

async fn write_loop(
    connection: Weak<ConnectionInner>,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(err) = writer.write_all(&frame).await {
                        warn!(error = %err, "write failed, closing connection");
                        if let Some(inner) = connection.upgrade() {
                            Connection { inner }.close();
                        }
                        return;
                    }
                }
                None => break,
            },
            _ = raised(&mut closed) => break,
        }
    }

    while let Ok(frame) = outbound.try_recv() {
        if writer.write_all(&frame).await.is_err() {
            break;
        }
    }
    if let Err(err) = writer.shutdown().await {
        trace!(error = %err, "socket shutdown failed");
    }
}

/// Creates connections for freshly accepted or dialed sockets.
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Wraps `stream` in a connection owned by `peer` under `key`.
    fn create(
        &self,
        stream: TcpStream,
        peer: &Peer,
        key: ConnectionKey,
    ) -> std::io::Result<Connection>;
}

/// Opens connections with a fixed framing mode and detaches them from their peer when closed.
///
/// Closing the default connection disconnects the whole peer.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultConnectionFactory {
    mode: FramingMode,
}

impl DefaultConnectionFactory {
    /// Creates a factory for the given framing mode.
    pub fn new(mode: FramingMode) -> Self {
        DefaultConnectionFactory { mode }
    }
}

impl ConnectionFactory for DefaultConnectionFactory {
    fn create(
        &self,
        stream: TcpStream,
        peer: &Peer,
        key: ConnectionKey,
    ) -> std::io::Result<Connection> {
        let connection = Connection::open(stream, self.mode, key, peer.codec().clone())?;
        connection.set_peer(peer);
        connection.on_shutdown(detach_from_peer);
        Ok(connection)
    }
}

fn detach_from_peer(connection: &Connection) {
    let Some(peer) = connection.peer() else {
        return;
    };

    let key = connection.key();
    let removed = peer.with_state(|state| match state.connections.get(&key) {
        Some(current) if current.ptr_eq(connection) => state.connections.remove(&key).is_some(),
        _ => false,
    });

    if removed && key.is_default() {
        peer.disconnect();
    }
}
