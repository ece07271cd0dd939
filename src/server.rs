//! Accepting peers.
//!
//! [`ServerStart`] owns the listening socket, the event loop balancer, the list of connected peers and the dispatch
//! registry their messages are routed through. Every accepted socket becomes a new peer greeted with a Ping.
//!
//! # Example
//!
//! ```ignore
//! let server = ServerStart::new(Config::default())?;
//! server
//!     .registry()
//!     .register::<ChatLine>()?
//!     .add_last(handler_fn(|context, _session, line: &ChatLine| {
//!         context.send(line)?;
//!         Ok(())
//!     }));
//! let addr = server.launch("127.0.0.1:0".parse()?).await?;
//! ```

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    config::Config,
    connection::{raised, ConnectionFactory, DefaultConnectionFactory},
    dispatch::DispatchRegistry,
    error::StartError,
    event_loop::EventLoopBalancer,
    handshake::ServerHandshake,
    id::ConnectionKey,
    peer::{ConnectedCallback, DefaultPeerFactory, Peer, PeerFactory, PeerList},
};

const ERROR_BACKOFF: Duration = Duration::from_millis(150);
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// A server accepting peers.
#[derive(Clone, Debug)]
pub struct ServerStart {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: Config,
    registry: Arc<DispatchRegistry>,
    peers: Arc<PeerList>,
    balancer: EventLoopBalancer,
    handshake: ServerHandshake,
    connection_factory: Box<dyn ConnectionFactory>,
    peer_factory: Box<dyn PeerFactory>,
    connected: Mutex<Vec<ConnectedCallback>>,
    stop: watch::Sender<bool>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ServerStart {
    /// Creates a server with the default connection and peer factories.
    pub fn new(config: Config) -> Result<Self, StartError> {
        let registry = Arc::new(DispatchRegistry::new());
        let peer_factory = DefaultPeerFactory::new(registry.clone());
        let connection_factory = DefaultConnectionFactory::new(config.framing());
        ServerStart::with_factories(config, registry, connection_factory, peer_factory)
    }

    /// Creates a server with custom factories.
    ///
    /// Peers produced by `peer_factory` should dispatch through `registry`, where the handshake handlers are bound.
    pub fn with_factories(
        config: Config,
        registry: Arc<DispatchRegistry>,
        connection_factory: impl ConnectionFactory,
        peer_factory: impl PeerFactory,
    ) -> Result<Self, StartError> {
        let peers = Arc::new(PeerList::new());
        let handshake = ServerHandshake::install(&registry, peers.clone(), config.handshake_timeout())?;

        Ok(ServerStart {
            inner: Arc::new(ServerInner {
                balancer: EventLoopBalancer::from_config(&config),
                config,
                registry,
                peers,
                handshake,
                connection_factory: Box::new(connection_factory),
                peer_factory: Box::new(peer_factory),
                connected: Mutex::new(Vec::new()),
                stop: watch::channel(false).0,
                local_addr: Mutex::new(None),
            }),
        })
    }

    /// Returns the registry received messages are dispatched through.
    pub fn registry(&self) -> &Arc<DispatchRegistry> {
        &self.inner.registry
    }

    /// Returns the connected peers.
    pub fn peers(&self) -> &Arc<PeerList> {
        &self.inner.peers
    }

    /// Returns the event loop balancer.
    pub fn balancer(&self) -> &EventLoopBalancer {
        &self.inner.balancer
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Returns the address the server listens on, once launched.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a callback run whenever a peer completes its Ping handshake.
    ///
    /// Sockets dialed for keyed connections complete a Ping handshake of their own before they are merged into
    /// their canonical peer, so the callback also sees these short-lived peers.
    pub fn on_connected(&self, callback: impl Fn(&Peer) + Send + Sync + 'static) {
        self.inner
            .connected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Binds `addr` and starts accepting peers in the background, returning the bound address.
    pub async fn launch(&self, addr: SocketAddr) -> Result<SocketAddr, StartError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| StartError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        *self.inner.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(local_addr);

        let span = info_span!("server", addr = %local_addr);
        tokio::spawn(accept_loop(self.clone(), listener, self.inner.stop.subscribe()).instrument(span));
        info!(addr = %local_addr, "server listening");

        Ok(local_addr)
    }

    /// Turns an accepted socket into a greeted peer.
    pub fn adopt(&self, stream: TcpStream) -> Result<Peer, StartError> {
        let peer = self.inner.peer_factory.produce();
        for callback in self
            .inner
            .connected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            peer.on_connected(callback.clone());
        }

        let connection = self
            .inner
            .connection_factory
            .create(stream, &peer, ConnectionKey::DEFAULT)?;
        peer.set_connection(ConnectionKey::DEFAULT, connection.clone());

        let peers = Arc::downgrade(&self.inner.peers);
        peer.on_disconnect(move |peer| {
            let Some(peers) = peers.upgrade() else {
                return;
            };
            if peers.get(&peer.id()).is_some_and(|listed| listed.ptr_eq(peer)) {
                peers.remove(&peer.id());
                debug!(id = %peer.id(), "peer left");
            }
        });

        if let Err(err) = self.inner.balancer.register(&connection) {
            connection.close();
            return Err(err.into());
        }
        self.inner.handshake.greet(&peer, &connection)?;

        Ok(peer)
    }

    /// Stops accepting, closes every connection and disconnects every peer.
    pub fn shutdown(&self) {
        self.inner.stop.send_replace(true);
        self.inner.balancer.shutdown_now();
        for peer in self.inner.peers.snapshot() {
            peer.disconnect();
        }
        info!("server shut down");
    }
}

async fn accept_loop(server: ServerStart, listener: TcpListener, mut stop: watch::Receiver<bool>) {
    let mut backoff = ERROR_BACKOFF;

    loop {
        tokio::select! {
            _ = raised(&mut stop) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    backoff = ERROR_BACKOFF;
                    debug!(%peer_addr, "accepted connection");
                    if let Err(err) = server.adopt(stream) {
                        warn!(%peer_addr, error = %err, "failed to adopt connection");
                    }
                }
                Err(err) => {
                    error!(error = %err, ?backoff, "failed to accept connection");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_ERROR_BACKOFF);
                }
            },
        }
    }

    debug!("accept loop stopped");
}

impl std::fmt::Debug for ServerInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerInner")
            .field("config", &self.config)
            .field("peers", &self.peers.len())
            .field("balancer", &self.balancer)
            .finish_non_exhaustive()
    }
}
