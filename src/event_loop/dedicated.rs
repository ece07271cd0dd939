use std::{
    collections::HashMap,
    fmt, mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use tokio::{io::AsyncReadExt, net::tcp::OwnedReadHalf, sync::watch};
use tracing::{debug, info_span, warn, Instrument};

use super::{EventLoop, Lifecycle};
use crate::{
    connection::{raised, Connection},
    error::EventLoopError,
    id::ConnectionId,
};

/// An event loop spawning one reader task per connection.
#[derive(Clone)]
pub struct DedicatedEventLoop {
    inner: Arc<DedicatedInner>,
}

struct DedicatedInner {
    state: Mutex<DedicatedState>,
    stop: watch::Sender<bool>,
    read_buffer_size: usize,
}

struct DedicatedState {
    lifecycle: Lifecycle,
    connections: HashMap<ConnectionId, Registration>,
}

/// A served connection and the signal that stops its reader task.
struct Registration {
    connection: Connection,
    forgotten: watch::Sender<bool>,
}

impl DedicatedEventLoop {
    /// Creates an idle loop reading into buffers of `read_buffer_size` bytes.
    pub fn new(read_buffer_size: usize) -> Self {
        DedicatedEventLoop {
            inner: Arc::new(DedicatedInner {
                state: Mutex::new(DedicatedState {
                    lifecycle: Lifecycle::Idle,
                    connections: HashMap::new(),
                }),
                stop: watch::channel(false).0,
                read_buffer_size: read_buffer_size.max(1),
            }),
        }
    }
}

impl DedicatedInner {
    fn state(&self) -> MutexGuard<'_, DedicatedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn forget(&self, connection: &Connection) -> bool {
        match self.state().connections.remove(&connection.id()) {
            Some(registration) => {
                registration.forgotten.send_replace(true);
                true
            }
            None => false,
        }
    }

    fn stop(&self) -> Vec<Connection> {
        let connections = {
            let mut state = self.state();
            state.lifecycle = Lifecycle::Stopped;
            mem::take(&mut state.connections)
        };
        self.stop.send_replace(true);
        connections
            .into_values()
            .map(|registration| registration.connection)
            .collect()
    }
}

impl EventLoop for DedicatedEventLoop {
    fn register(&self, connection: &Connection) -> Result<(), EventLoopError> {
        {
            let mut state = self.inner.state();
            state.lifecycle.ensure_running()?;
            if state.connections.contains_key(&connection.id()) {
                return Err(EventLoopError::AlreadyRegistered { id: connection.id() });
            }
            let reader = connection
                .take_reader()
                .ok_or(EventLoopError::ReaderUnavailable { id: connection.id() })?;
            let (forgotten, forgotten_rx) = watch::channel(false);
            state.connections.insert(
                connection.id(),
                Registration {
                    connection: connection.clone(),
                    forgotten,
                },
            );

            let span = info_span!("connection", id = %connection.id(), peer = ?connection.peer_addr());
            tokio::spawn(
                read_loop(
                    connection.clone(),
                    reader,
                    self.inner.stop.subscribe(),
                    forgotten_rx,
                    self.inner.read_buffer_size,
                )
                .instrument(span),
            );
        }

        let inner: Weak<DedicatedInner> = Arc::downgrade(&self.inner);
        connection.on_shutdown(move |connection| {
            if let Some(inner) = inner.upgrade() {
                inner.forget(connection);
            }
        });

        Ok(())
    }

    fn unregister(&self, connection: &Connection) -> bool {
        self.inner.forget(connection)
    }

    fn start(&self) -> Result<(), EventLoopError> {
        let mut state = self.inner.state();
        match state.lifecycle {
            Lifecycle::Idle => {
                state.lifecycle = Lifecycle::Running;
                Ok(())
            }
            Lifecycle::Running => Ok(()),
            Lifecycle::Stopped => Err(EventLoopError::ShutDown),
        }
    }

    fn shutdown(&self) {
        let connections = self.inner.stop();
        debug!(connections = connections.len(), "dedicated event loop shut down");
    }

    fn shutdown_now(&self) {
        for connection in self.inner.stop() {
            connection.close();
        }
    }

    fn workload(&self) -> usize {
        self.inner.state().connections.len()
    }

    fn is_running(&self) -> bool {
        self.inner.state().lifecycle == Lifecycle::Running
    }
}

impl fmt::Debug for DedicatedEventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state();
        f.debug_struct("DedicatedEventLoop")
            .field("lifecycle", &state.lifecycle)
            .field("workload", &state.connections.len())
            .finish()
    }
}

async fn read_loop(
    connection: Connection,
    mut reader: OwnedReadHalf,
    mut stop: watch::Receiver<bool>,
    mut forgotten: watch::Receiver<bool>,
    buffer_size: usize,
) {
    let mut closed = connection.closed_signal();
    let mut buf = vec![0; buffer_size];

    loop {
        tokio::select! {
            _ = raised(&mut closed) => break,
            _ = raised(&mut stop) => break,
            _ = raised(&mut forgotten) => {
                debug!("connection unregistered, reader stopped");
                break;
            }
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("remote closed the connection");
                    connection.close();
                    break;
                }
                Ok(n) => connection.receive(&buf[..n]),
                Err(err) => {
                    warn!(error = %err, "read failed, closing connection");
                    connection.close();
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{io::AsyncWriteExt, sync::mpsc};

    use super::*;
    use crate::{
        codec::Codec, dispatch::DispatchRegistry, framing::FramingMode, id::ClientId, message::Envelope,
        peer::Peer, protocol::Ping, test_support::open_connection,
    };

    fn framed_ping() -> Vec<u8> {
        let envelope = Envelope::wrap(&Ping {
            client_id: ClientId::generate(),
        })
        .unwrap();
        FramingMode::Boundary
            .frame(Codec::new().serialize(&envelope).unwrap())
            .into_bytes()
    }

    #[tokio::test]
    async fn registration_requires_a_running_loop() {
        let event_loop = DedicatedEventLoop::new(1024);
        let (connection, _remote) = open_connection().await;
        assert!(matches!(
            event_loop.register(&connection),
            Err(EventLoopError::NotRunning)
        ));

        event_loop.start().unwrap();
        event_loop.register(&connection).unwrap();
        assert!(matches!(
            event_loop.register(&connection),
            Err(EventLoopError::AlreadyRegistered { .. })
        ));
        assert_eq!(event_loop.workload(), 1);
    }

    #[tokio::test]
    async fn remote_close_unregisters_the_connection() {
        let event_loop = DedicatedEventLoop::new(1024);
        event_loop.start().unwrap();
        let (connection, remote) = open_connection().await;
        event_loop.register(&connection).unwrap();

        drop(remote);
        tokio::time::timeout(Duration::from_secs(5), async {
            while event_loop.workload() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn shutdown_now_closes_connections() {
        let event_loop = DedicatedEventLoop::new(1024);
        event_loop.start().unwrap();
        let (connection, _remote) = open_connection().await;
        event_loop.register(&connection).unwrap();

        event_loop.shutdown_now();
        assert!(connection.is_closed());
        assert!(!event_loop.is_running());
        assert_eq!(event_loop.workload(), 0);
        assert!(matches!(
            event_loop.start(),
            Err(EventLoopError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn unregister_stops_reading() {
        let event_loop = DedicatedEventLoop::new(1024);
        event_loop.start().unwrap();
        let (connection, mut remote) = open_connection().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = Arc::new(DispatchRegistry::new());
        registry.add_default_handler(move |_, _, envelope| {
            let _ = tx.send(envelope.tag().to_string());
            Ok(())
        });
        let peer = Peer::new(Arc::new(Codec::new()), registry);
        connection.set_peer(&peer);
        event_loop.register(&connection).unwrap();

        remote.write_all(&framed_ping()).await.unwrap();
        let tag = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tag, "Ping");

        assert!(event_loop.unregister(&connection));
        assert!(!event_loop.unregister(&connection));
        assert_eq!(event_loop.workload(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;

        remote.write_all(&framed_ping()).await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err());
        assert!(!connection.is_closed());
    }
}
