//! Connecting to a server.
//!
//! [`ClientStart`] owns a single [`Peer`] representing the server. [`connect`](ClientStart::connect) opens the
//! default connection and waits for the Ping handshake; [`create_connection`](ClientStart::create_connection) adds
//! keyed connections to the same peer.
//!
//! # Example
//!
//! ```ignore
//! let client = ClientStart::new(Config::default())?;
//! let server = client.connect(addr).await?;
//! server.send(&ChatLine { text: "hello".into() }).await?;
//!
//! let updates = client.create_connection(ConnectionKey::of::<PriceUpdate>()).await?;
//! ```

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    connection::{Connection, ConnectionFactory, DefaultConnectionFactory},
    dispatch::DispatchRegistry,
    error::{HandshakeError, StartError},
    event_loop::EventLoopBalancer,
    handshake::{ClientHandshake, KeyedState, PendingConnection},
    id::ConnectionKey,
    peer::{DefaultPeerFactory, Peer, PeerFactory},
    protocol::NewConnectionRequest,
};

/// A client connected to one server.
#[derive(Debug)]
pub struct ClientStart {
    config: Config,
    registry: Arc<DispatchRegistry>,
    balancer: EventLoopBalancer,
    connection_factory: DefaultConnectionFactory,
    peer: Peer,
    server_addr: Mutex<Option<SocketAddr>>,
}

impl ClientStart {
    /// Creates a client. Nothing is connected until [`connect`](ClientStart::connect) is called.
    pub fn new(config: Config) -> Result<Self, StartError> {
        let registry = Arc::new(DispatchRegistry::new());
        ClientHandshake::install(&registry)?;
        let peer = DefaultPeerFactory::new(registry.clone()).produce();

        Ok(ClientStart {
            balancer: EventLoopBalancer::from_config(&config),
            connection_factory: DefaultConnectionFactory::new(config.framing()),
            config,
            registry,
            peer,
            server_addr: Mutex::new(None),
        })
    }

    /// Returns the registry received messages are dispatched through.
    pub fn registry(&self) -> &Arc<DispatchRegistry> {
        &self.registry
    }

    /// Returns the peer representing the server.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Registers a callback run once the Ping handshake completed.
    pub fn on_connected(&self, callback: impl Fn(&Peer) + Send + Sync + 'static) {
        self.peer.on_connected(Arc::new(callback));
    }

    /// Connects to the server and waits until the Ping handshake completed.
    ///
    /// After a [`disconnect`](ClientStart::disconnect) the peer is reset, so the new handshake assigns a fresh id.
    /// Fails with [`StartError::AlreadyConnected`] while the default connection is still open.
    pub async fn connect(&self, addr: SocketAddr) -> Result<Peer, StartError> {
        if self.peer.is_disconnected() {
            self.peer.reset_for_reconnect();
        } else if self
            .peer
            .connection(&ConnectionKey::DEFAULT)
            .is_some_and(|connection| !connection.is_closed())
        {
            return Err(StartError::AlreadyConnected);
        }

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| StartError::Connect { addr, source })?;
        let connection = self
            .connection_factory
            .create(stream, &self.peer, ConnectionKey::DEFAULT)?;
        self.peer
            .set_connection(ConnectionKey::DEFAULT, connection.clone());
        *self.server_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(addr);

        if let Err(err) = self.balancer.register(&connection) {
            connection.close();
            return Err(err.into());
        }

        let primed = self
            .peer
            .session()
            .primed()
            .synchronize_for(self.config.handshake_timeout())
            .await;
        if primed.is_err() {
            connection.close();
            return Err(HandshakeError::Timeout { stage: "ping" }.into());
        }

        info!(%addr, id = %self.peer.id(), "connected");
        Ok(self.peer.clone())
    }

    /// Opens a new connection to the server stored under `key`.
    ///
    /// Resolves once the server has merged the connection into this client's peer.
    pub async fn create_connection(&self, key: ConnectionKey) -> Result<Connection, HandshakeError> {
        let addr = self
            .server_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ok_or(HandshakeError::NotConnected)?;
        if !self.peer.session().primed().is_released() {
            return Err(HandshakeError::NotConnected);
        }

        let pending = self.peer.pending().begin(&key)?;
        let established = self.establish(addr, &key, &pending).await;
        self.peer.pending().finish(&key);

        match established {
            Ok(connection) => {
                debug!(%key, "keyed connection ready");
                Ok(connection)
            }
            Err(err) => {
                warn!(%key, state = ?pending.state(), error = %err, "abandoning keyed connection");
                self.peer.remove_false_id(&pending.temporary_id());
                if let Some(connection) = pending.connection() {
                    connection.close();
                }
                Err(err)
            }
        }
    }

    async fn establish(
        &self,
        addr: SocketAddr,
        key: &ConnectionKey,
        pending: &PendingConnection,
    ) -> Result<Connection, HandshakeError> {
        let timeout = self.config.handshake_timeout();
        let default = self
            .peer
            .connection(&ConnectionKey::DEFAULT)
            .ok_or(HandshakeError::NotConnected)?;
        default.send(&NewConnectionRequest { key: key.clone() })?;
        pending
            .acknowledged
            .synchronize_for(timeout)
            .await
            .map_err(|_| HandshakeError::Timeout {
                stage: "connection request acknowledgment",
            })?;

        pending.advance(KeyedState::AwaitingPing);
        let stream = TcpStream::connect(addr).await?;
        let connection = self
            .connection_factory
            .create(stream, &self.peer, key.clone())?;
        connection.set_setup(true);
        pending.set_connection(connection.clone());
        self.balancer.register(&connection)?;

        pending
            .established
            .synchronize_for(timeout)
            .await
            .map_err(|_| HandshakeError::Timeout {
                stage: "connection initializer acknowledgment",
            })?;
        Ok(connection)
    }

    /// Returns the progress of a keyed connection currently being established.
    pub fn connection_state(&self, key: &ConnectionKey) -> Option<KeyedState> {
        self.peer.pending().get(key).map(|pending| pending.state())
    }

    /// Closes every connection and stops reading.
    pub fn disconnect(&self) {
        self.peer.disconnect();
        self.balancer.shutdown_now();
    }
}
