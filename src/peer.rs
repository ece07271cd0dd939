//! The logical remote endpoint.
//!
//! A [`Peer`] aggregates every connection opened to one remote process, keyed by [`ConnectionKey`], together with
//! the peer's session, codec and the temporary ("false") ids collected while keyed connections are reconciled.
//! The server keeps its peers in a [`PeerList`].

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak,
    },
};

use tracing::{debug, warn};

use crate::{
    codec::Codec,
    connection::Connection,
    context::ConnectionContext,
    dispatch::DispatchRegistry,
    error::ConnectionError,
    handshake::PendingConnections,
    id::{ClientId, ConnectionKey},
    message::{Envelope, Message},
    session::Session,
};

type DisconnectCallback = Box<dyn FnOnce(&Peer) + Send>;

/// Callback invoked once a peer completed its Ping handshake.
pub type ConnectedCallback = Arc<dyn Fn(&Peer) + Send + Sync>;

/// Connections and false ids of a peer, guarded by one mutex.
///
/// Use [`Peer::with_state`] for any read-then-write sequence.
#[derive(Debug, Default)]
pub struct PeerState {
    /// Open connections by key. At most one connection per key.
    pub connections: HashMap<ConnectionKey, Connection>,
    /// Ids superseded while keyed connections are being reconciled.
    pub false_ids: HashSet<ClientId>,
}

/// A handle to a logical peer.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

/// A weak handle to a [`Peer`], held by its connections.
#[derive(Clone, Debug)]
pub struct WeakPeer {
    inner: Weak<PeerInner>,
}

struct PeerInner {
    id: RwLock<ClientId>,
    state: Mutex<PeerState>,
    session: RwLock<Session>,
    codec: Arc<Codec>,
    registry: Arc<DispatchRegistry>,
    pending: PendingConnections,
    disconnect_callbacks: Mutex<Vec<DisconnectCallback>>,
    connected_callbacks: Mutex<Vec<ConnectedCallback>>,
    disconnected: AtomicBool,
}

impl Peer {
    /// Creates a peer without id or connections.
    pub fn new(codec: Arc<Codec>, registry: Arc<DispatchRegistry>) -> Self {
        Peer {
            inner: Arc::new(PeerInner {
                id: RwLock::new(ClientId::EMPTY),
                state: Mutex::new(PeerState::default()),
                session: RwLock::new(Session::new()),
                codec,
                registry,
                pending: PendingConnections::default(),
                disconnect_callbacks: Mutex::new(Vec::new()),
                connected_callbacks: Mutex::new(Vec::new()),
                disconnected: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the current id, which is [`ClientId::EMPTY`] until the handshake assigned one.
    pub fn id(&self) -> ClientId {
        *self.inner.id.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Assigns the id. Returns `false`, leaving the id untouched, if one is already set.
    pub fn set_id(&self, id: ClientId) -> bool {
        let mut current = self.inner.id.write().unwrap_or_else(PoisonError::into_inner);
        if !current.is_empty() {
            return false;
        }
        *current = id;
        true
    }

    /// Resets the id to [`ClientId::EMPTY`].
    pub fn clear_id(&self) {
        *self.inner.id.write().unwrap_or_else(PoisonError::into_inner) = ClientId::EMPTY;
    }

    /// Runs `f` while holding the state lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut PeerState) -> R) -> R {
        f(&mut *self.state())
    }

    /// Returns the connection stored under `key`.
    pub fn connection(&self, key: &ConnectionKey) -> Option<Connection> {
        self.state().connections.get(key).cloned()
    }

    /// Stores a connection under `key`, returning the one it replaced.
    pub fn set_connection(&self, key: ConnectionKey, connection: Connection) -> Option<Connection> {
        self.state().connections.insert(key, connection)
    }

    /// Removes the connection stored under `key`.
    pub fn remove_connection(&self, key: &ConnectionKey) -> Option<Connection> {
        self.state().connections.remove(key)
    }

    /// Returns the keys of every open connection.
    pub fn keys(&self) -> Vec<ConnectionKey> {
        self.state().connections.keys().cloned().collect()
    }

    /// Records a superseded id.
    pub fn add_false_id(&self, id: ClientId) {
        self.state().false_ids.insert(id);
    }

    /// Forgets a superseded id, returning whether it was recorded.
    pub fn remove_false_id(&self, id: &ClientId) -> bool {
        self.state().false_ids.remove(id)
    }

    /// Returns `true` if `id` is a recorded false id.
    pub fn has_false_id(&self, id: &ClientId) -> bool {
        self.state().false_ids.contains(id)
    }

    /// Returns the current session.
    pub fn session(&self) -> Session {
        self.inner
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the session with a fresh, unprimed one and returns it.
    pub fn reset_session(&self) -> Session {
        let session = Session::new();
        *self.inner.session.write().unwrap_or_else(PoisonError::into_inner) = session.clone();
        session
    }

    /// Returns the peer's codec.
    pub fn codec(&self) -> &Arc<Codec> {
        &self.inner.codec
    }

    /// Returns the registry received messages are dispatched through.
    pub fn registry(&self) -> &Arc<DispatchRegistry> {
        &self.inner.registry
    }

    pub(crate) fn pending(&self) -> &PendingConnections {
        &self.inner.pending
    }

    /// Sends a message over the default connection once the session is primed.
    pub async fn send<M: Message>(&self, message: &M) -> Result<(), ConnectionError> {
        self.send_via(&ConnectionKey::DEFAULT, message).await
    }

    /// Sends a message over the connection stored under `key` once the session is primed.
    pub async fn send_via<M: Message>(
        &self,
        key: &ConnectionKey,
        message: &M,
    ) -> Result<(), ConnectionError> {
        self.session().primed().synchronize().await;
        let connection = self
            .connection(key)
            .ok_or_else(|| ConnectionError::NoConnection { key: key.clone() })?;
        connection.send(message)
    }

    /// Registers a callback run once when the peer disconnects, before its id is cleared.
    pub fn on_disconnect(&self, callback: impl FnOnce(&Peer) + Send + 'static) {
        self.inner
            .disconnect_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(callback));
    }

    /// Closes every connection, runs the disconnect callbacks and clears the id.
    ///
    /// Only the first call has an effect.
    pub fn disconnect(&self) {
        if self.inner.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(id = %self.id(), "disconnecting peer");

        let connections: Vec<_> = self
            .with_state(|state| state.connections.drain().map(|(_, connection)| connection).collect());
        for connection in connections {
            connection.close();
        }

        let callbacks = std::mem::take(
            &mut *self
                .inner
                .disconnect_callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for callback in callbacks {
            callback(self);
        }

        self.clear_id();
    }

    /// Returns `true` once [`disconnect`](Peer::disconnect) has been called.
    pub fn is_disconnected(&self) -> bool {
        self.inner.disconnected.load(Ordering::Acquire)
    }

    /// Prepares a disconnected peer for a new handshake.
    ///
    /// The id is cleared and the session replaced with an unprimed one. Disconnect callbacks already ran and are
    /// not restored; connected callbacks stay registered.
    pub(crate) fn reset_for_reconnect(&self) {
        self.clear_id();
        self.reset_session();
        self.with_state(|state| state.false_ids.clear());
        self.inner.disconnected.store(false, Ordering::Release);
        debug!("peer reset for reconnect");
    }

    /// Registers a callback run when the peer becomes fully connected.
    pub fn on_connected(&self, callback: ConnectedCallback) {
        self.inner
            .connected_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    pub(crate) fn fire_connected(&self) {
        let callbacks = self
            .inner
            .connected_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback(self);
        }
    }

    /// Routes a received envelope through the registry.
    pub fn dispatch(&self, connection: &Connection, envelope: Envelope) {
        let context = ConnectionContext::new(connection.clone(), self.clone());
        let session = self.session();
        if let Err(err) = self.inner.registry.trigger(&context, &session, envelope) {
            warn!(id = %self.id(), connection = %connection.id(), error = %err, "undeliverable message");
        }
    }

    /// Creates a weak handle.
    pub fn downgrade(&self) -> WeakPeer {
        WeakPeer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Returns `true` if both handles point to the same peer.
    pub fn ptr_eq(&self, other: &Peer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn state(&self) -> MutexGuard<'_, PeerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id())
            .field("keys", &self.keys())
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

impl WeakPeer {
    /// Attempts to upgrade to a strong handle.
    pub fn upgrade(&self) -> Option<Peer> {
        self.inner.upgrade().map(|inner| Peer { inner })
    }
}

/// The server's peers by id.
#[derive(Debug, Default)]
pub struct PeerList {
    peers: Mutex<HashMap<ClientId, Peer>>,
}

impl PeerList {
    /// Creates an empty list.
    pub fn new() -> Self {
        PeerList::default()
    }

    /// Adds a peer under its current id, returning the peer it replaced.
    pub fn add(&self, peer: Peer) -> Option<Peer> {
        let id = peer.id();
        self.lock().insert(id, peer)
    }

    /// Returns the peer with `id`.
    pub fn get(&self, id: &ClientId) -> Option<Peer> {
        self.lock().get(id).cloned()
    }

    /// Removes the peer with `id`.
    pub fn remove(&self, id: &ClientId) -> Option<Peer> {
        self.lock().remove(id)
    }

    /// Returns the peer that recorded `id` as a false id.
    pub fn find_by_false_id(&self, id: &ClientId) -> Option<Peer> {
        self.lock()
            .values()
            .find(|peer| peer.has_false_id(id))
            .cloned()
    }

    /// Returns every peer.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.lock().values().cloned().collect()
    }

    /// Returns the number of peers.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if there are no peers.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ClientId, Peer>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Produces peers for new sockets.
pub trait PeerFactory: Send + Sync + 'static {
    /// Creates a fresh peer with a new session.
    fn produce(&self) -> Peer;
}

/// Produces peers with a default [`Codec`] dispatching through a shared registry.
#[derive(Clone)]
pub struct DefaultPeerFactory {
    registry: Arc<DispatchRegistry>,
    connected: Vec<ConnectedCallback>,
}

impl DefaultPeerFactory {
    /// Creates a factory dispatching through `registry`.
    pub fn new(registry: Arc<DispatchRegistry>) -> Self {
        DefaultPeerFactory {
            registry,
            connected: Vec::new(),
        }
    }

    /// Wires a connected callback into every produced peer.
    pub fn with_connected_callback(mut self, callback: ConnectedCallback) -> Self {
        self.connected.push(callback);
        self
    }
}

impl PeerFactory for DefaultPeerFactory {
    fn produce(&self) -> Peer {
        let peer = Peer::new(Arc::new(Codec::new()), self.registry.clone());
        for callback in &self.connected {
            peer.on_connected(callback.clone());
        }
        peer
    }
}

impl fmt::Debug for DefaultPeerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultPeerFactory")
            .field("connected_callbacks", &self.connected.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::{connection::ConnectionFactory, test_support::tcp_pair};

    fn peer() -> Peer {
        DefaultPeerFactory::new(Arc::new(DispatchRegistry::new())).produce()
    }

    #[test]
    fn id_is_set_only_while_empty() {
        let peer = peer();
        let id = ClientId::generate();
        assert!(peer.set_id(id));
        assert!(!peer.set_id(ClientId::generate()));
        assert_eq!(peer.id(), id);
        peer.clear_id();
        assert!(peer.id().is_empty());
    }

    #[test]
    fn peer_list_finds_false_ids() {
        let list = PeerList::new();
        let canonical = peer();
        canonical.set_id(ClientId::generate());
        let temporary = ClientId::generate();
        canonical.add_false_id(temporary);
        list.add(canonical.clone());

        let found = list.find_by_false_id(&temporary).unwrap();
        assert!(found.ptr_eq(&canonical));
        assert!(canonical.remove_false_id(&temporary));
        assert!(list.find_by_false_id(&temporary).is_none());
    }

    #[tokio::test]
    async fn disconnect_closes_connections_and_fires_once() {
        let peer = peer();
        peer.set_id(ClientId::generate());
        let (local, _remote) = tcp_pair().await;
        let connection = crate::connection::DefaultConnectionFactory::default()
            .create(local, &peer, ConnectionKey::DEFAULT)
            .unwrap();
        peer.set_connection(ConnectionKey::DEFAULT, connection.clone());

        let fired = Arc::new(AtomicUsize::new(0));
        peer.on_disconnect({
            let fired = fired.clone();
            move |peer| {
                assert!(!peer.id().is_empty());
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });

        connection.close();
        peer.disconnect();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(peer.id().is_empty());
        assert!(peer.keys().is_empty());
    }

    #[tokio::test]
    async fn closing_a_keyed_connection_only_detaches_it() {
        let peer = peer();
        let (local, _remote) = tcp_pair().await;
        let key = ConnectionKey::new("updates");
        let connection = crate::connection::DefaultConnectionFactory::default()
            .create(local, &peer, key.clone())
            .unwrap();
        peer.set_connection(key.clone(), connection.clone());

        connection.close();
        assert!(peer.connection(&key).is_none());
        assert!(!peer.is_disconnected());
    }
}
