//! Identity assignment and keyed connection reconciliation.
//!
//! # Ping handshake
//!
//! When the server accepts a socket it assigns a fresh [`ClientId`] and sends it in a [`Ping`]. The client, whose id
//! is still empty, adopts the id, echoes the Ping and releases its session's primed gate. The server releases its
//! own gate when the echo arrives. Connected callbacks fire when a gate is released.
//!
//! # Keyed connections
//!
//! A client asks for another connection with [`NewConnectionRequest`], which the server echoes. The client then dials
//! a new socket. The server cannot tell it apart from a new peer, so it runs the Ping handshake on it and assigns a
//! temporary id. The client records that id as a false id, echoes the Ping and sends a [`NewConnectionInitializer`]
//! naming both ids. The server moves the socket to the canonical peer under the requested key, drops the temporary
//! peer and echoes the initializer, after which the client stores the connection under the key as well.
//!
//! Every wait honours the configured handshake timeout. A handshake that fails or times out is abandoned and not
//! retried.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tracing::{debug, info, warn};

use crate::{
    connection::Connection,
    context::ConnectionContext,
    dispatch::{handler_fn, DispatchRegistry},
    error::{BoxError, ConnectionError, HandshakeError, StartError},
    id::{ClientId, ConnectionKey},
    peer::{Peer, PeerList},
    protocol::{NewConnectionInitializer, NewConnectionRequest, Ping},
    rendezvous::Rendezvous,
    session::Session,
};

/// Progress of a keyed connection being established by a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyedState {
    /// The request was sent and awaits the server's echo.
    Requested,
    /// The new socket was dialed and awaits its Ping.
    AwaitingPing,
    /// The initializer was sent and awaits the server's echo.
    Reconciling,
    /// The connection is stored under its key.
    Established,
}

#[derive(Debug, Default)]
pub(crate) struct PendingConnections {
    entries: Mutex<HashMap<ConnectionKey, Arc<PendingConnection>>>,
}

impl PendingConnections {
    pub(crate) fn begin(&self, key: &ConnectionKey) -> Result<Arc<PendingConnection>, HandshakeError> {
        let mut entries = self.entries();
        if entries.contains_key(key) {
            return Err(HandshakeError::AlreadyPending { key: key.clone() });
        }
        let pending = Arc::new(PendingConnection::new());
        entries.insert(key.clone(), pending.clone());
        Ok(pending)
    }

    pub(crate) fn get(&self, key: &ConnectionKey) -> Option<Arc<PendingConnection>> {
        self.entries().get(key).cloned()
    }

    pub(crate) fn finish(&self, key: &ConnectionKey) -> Option<Arc<PendingConnection>> {
        self.entries().remove(key)
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ConnectionKey, Arc<PendingConnection>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub(crate) struct PendingConnection {
    state: Mutex<KeyedState>,
    temporary_id: Mutex<ClientId>,
    connection: Mutex<Option<Connection>>,
    pub(crate) acknowledged: Rendezvous,
    pub(crate) established: Rendezvous,
}

impl PendingConnection {
    fn new() -> Self {
        PendingConnection {
            state: Mutex::new(KeyedState::Requested),
            temporary_id: Mutex::new(ClientId::EMPTY),
            connection: Mutex::new(None),
            acknowledged: Rendezvous::new(1),
            established: Rendezvous::new(1),
        }
    }

    pub(crate) fn state(&self) -> KeyedState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn advance(&self, state: KeyedState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub(crate) fn temporary_id(&self) -> ClientId {
        *self.temporary_id.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_temporary_id(&self, id: ClientId) {
        *self.temporary_id.lock().unwrap_or_else(PoisonError::into_inner) = id;
    }

    pub(crate) fn connection(&self) -> Option<Connection> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_connection(&self, connection: Connection) {
        *self.connection.lock().unwrap_or_else(PoisonError::into_inner) = Some(connection);
    }
}

/// The server side of the handshake.
#[derive(Clone, Debug)]
pub struct ServerHandshake {
    peers: Arc<PeerList>,
}

impl ServerHandshake {
    /// Binds the server's handshake handlers into `registry`.
    ///
    /// The handshake pipelines are sealed and cannot be changed afterwards.
    pub fn install(
        registry: &DispatchRegistry,
        peers: Arc<PeerList>,
        timeout: Option<Duration>,
    ) -> Result<Self, StartError> {
        registry.register::<Ping>()?.to(handler_fn(acknowledge_ping))?;
        registry
            .register::<NewConnectionRequest>()?
            .to(handler_fn(|context, _, request: &NewConnectionRequest| {
                debug!(id = %context.client_id(), key = %request.key, "accepting keyed connection request");
                context.send(request)?;
                Ok(())
            }))?;

        let reconciling = peers.clone();
        registry
            .register::<NewConnectionInitializer>()?
            .to(handler_fn(move |context, _, initializer: &NewConnectionInitializer| {
                tokio::spawn(reconcile(
                    reconciling.clone(),
                    context.clone(),
                    initializer.clone(),
                    timeout,
                ));
                Ok(())
            }))?;

        Ok(ServerHandshake { peers })
    }

    /// Assigns a fresh id to a newly accepted peer, lists it and sends the Ping.
    pub fn greet(&self, peer: &Peer, connection: &Connection) -> Result<ClientId, ConnectionError> {
        let id = ClientId::generate();
        peer.set_id(id);
        self.peers.add(peer.clone());
        connection.send(&Ping { client_id: id })?;
        debug!(%id, connection = %connection.id(), "sent ping");
        Ok(id)
    }
}

fn acknowledge_ping(context: &ConnectionContext, session: &Session, ping: &Ping) -> Result<(), BoxError> {
    let peer = context.peer();
    if peer.id() != ping.client_id {
        warn!(expected = %peer.id(), received = %ping.client_id, "ping echo does not carry the assigned id");
        return Ok(());
    }

    if session.primed().go_on() {
        session.set_identified(true);
        context.connection().connected().go_on();
        debug!(id = %ping.client_id, "peer primed");
        peer.fire_connected();
    }
    Ok(())
}

async fn reconcile(
    peers: Arc<PeerList>,
    context: ConnectionContext,
    initializer: NewConnectionInitializer,
    timeout: Option<Duration>,
) {
    let key = initializer.key.clone();
    if let Err(err) = try_reconcile(&peers, &context, initializer, timeout).await {
        warn!(%key, error = %err, "abandoning keyed connection");
    }
}

async fn try_reconcile(
    peers: &PeerList,
    context: &ConnectionContext,
    initializer: NewConnectionInitializer,
    timeout: Option<Duration>,
) -> Result<(), HandshakeError> {
    let NewConnectionInitializer {
        key,
        canonical_id,
        temporary_id,
    } = &initializer;

    let canonical = peers
        .get(canonical_id)
        .ok_or(HandshakeError::UnknownPeer { id: *canonical_id })?;
    let temporary = peers
        .get(temporary_id)
        .ok_or(HandshakeError::UnknownPeer { id: *temporary_id })?;

    canonical
        .session()
        .primed()
        .synchronize_for(timeout)
        .await
        .map_err(|_| HandshakeError::Timeout {
            stage: "canonical peer to be primed",
        })?;
    temporary
        .session()
        .primed()
        .synchronize_for(timeout)
        .await
        .map_err(|_| HandshakeError::Timeout {
            stage: "temporary peer to be primed",
        })?;

    let connection = context.connection().clone();
    canonical.add_false_id(*temporary_id);

    temporary.with_state(|state| {
        if let Some(current) = state.connections.get(&ConnectionKey::DEFAULT) {
            if current.ptr_eq(&connection) {
                state.connections.remove(&ConnectionKey::DEFAULT);
            }
        }
    });

    connection.set_key(key.clone());
    connection.set_peer(&canonical);
    let replaced = canonical.set_connection(key.clone(), connection.clone());
    peers.remove(temporary_id);
    canonical.remove_false_id(temporary_id);
    connection.set_setup(false);
    connection.connected().go_on();

    if let Some(replaced) = replaced.filter(|replaced| !replaced.ptr_eq(&connection)) {
        replaced.close();
    }

    connection.send(&initializer)?;
    info!(id = %canonical_id, %key, "keyed connection established");
    Ok(())
}

/// The client side of the handshake.
#[derive(Clone, Copy, Debug, Default)]
pub struct ClientHandshake;

impl ClientHandshake {
    /// Binds the client's handshake handlers into `registry`.
    ///
    /// The handshake pipelines are sealed and cannot be changed afterwards.
    pub fn install(registry: &DispatchRegistry) -> Result<Self, StartError> {
        registry.register::<Ping>()?.to(handler_fn(adopt_ping))?;
        registry
            .register::<NewConnectionRequest>()?
            .to(handler_fn(request_acknowledged))?;
        registry
            .register::<NewConnectionInitializer>()?
            .to(handler_fn(initializer_acknowledged))?;
        Ok(ClientHandshake)
    }
}

fn adopt_ping(context: &ConnectionContext, session: &Session, ping: &Ping) -> Result<(), BoxError> {
    let connection = context.connection();
    let peer = context.peer();

    if connection.is_setup() {
        let key = connection.key();
        let Some(pending) = peer.pending().get(&key) else {
            warn!(%key, "ping on a setup connection nobody is waiting for");
            return Ok(());
        };

        peer.add_false_id(ping.client_id);
        pending.set_temporary_id(ping.client_id);
        connection.send(ping)?;
        connection.send(&NewConnectionInitializer {
            key,
            canonical_id: peer.id(),
            temporary_id: ping.client_id,
        })?;
        pending.advance(KeyedState::Reconciling);
        return Ok(());
    }

    if !peer.set_id(ping.client_id) {
        debug!(id = %peer.id(), received = %ping.client_id, "ignoring ping for an identified peer");
        return Ok(());
    }

    connection.send(ping)?;
    session.set_identified(true);
    if session.primed().go_on() {
        connection.connected().go_on();
        debug!(id = %ping.client_id, "adopted id");
        peer.fire_connected();
    }
    Ok(())
}

fn request_acknowledged(
    context: &ConnectionContext,
    _session: &Session,
    request: &NewConnectionRequest,
) -> Result<(), BoxError> {
    match context.peer().pending().get(&request.key) {
        Some(pending) => {
            pending.acknowledged.go_on();
        }
        None => warn!(key = %request.key, "unsolicited connection request acknowledgment"),
    }
    Ok(())
}

fn initializer_acknowledged(
    context: &ConnectionContext,
    _session: &Session,
    initializer: &NewConnectionInitializer,
) -> Result<(), BoxError> {
    let connection = context.connection();
    let peer = context.peer();
    let Some(pending) = peer.pending().get(&initializer.key) else {
        warn!(key = %initializer.key, "unsolicited initializer acknowledgment");
        return Ok(());
    };

    let replaced = peer.with_state(|state| {
        state.false_ids.remove(&initializer.temporary_id);
        state
            .connections
            .insert(initializer.key.clone(), connection.clone())
    });
    connection.set_setup(false);
    connection.connected().go_on();
    pending.advance(KeyedState::Established);
    pending.established.go_on();

    if let Some(replaced) = replaced.filter(|replaced| !replaced.ptr_eq(connection)) {
        replaced.close();
    }
    Ok(())
}
