use std::{
    collections::HashMap,
    fmt, io, mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use bytes::{Bytes, BytesMut};
use futures::{
    stream::{self, BoxStream},
    StreamExt,
};
use tokio::{
    io::AsyncReadExt,
    net::tcp::OwnedReadHalf,
    sync::{mpsc, watch},
};
use tokio_stream::StreamMap;
use tracing::{debug, info_span, trace, warn, Instrument};

use super::{EventLoop, Lifecycle};
use crate::{
    connection::{raised, Connection},
    error::EventLoopError,
    id::ConnectionId,
};

/// An event loop multiplexing every registered socket on one task.
///
/// Ready chunks are handed to a pool of workers, each owning a bounded queue. A full queue stalls the multiplexer,
/// which in turn stops reading from the sockets.
#[derive(Clone)]
pub struct SelectorEventLoop {
    inner: Arc<SelectorInner>,
}

struct SelectorInner {
    state: Mutex<SelectorState>,
    stop: watch::Sender<bool>,
    workers: usize,
    queue_capacity: usize,
    read_buffer_size: usize,
}

struct SelectorState {
    lifecycle: Lifecycle,
    commands: Option<mpsc::UnboundedSender<Command>>,
    connections: HashMap<ConnectionId, Connection>,
}

enum Command {
    Watch(Connection, OwnedReadHalf),
    Forget(ConnectionId),
}

enum Readiness {
    Data(Connection, Bytes),
    Closed(Connection, Option<io::Error>),
}

impl SelectorEventLoop {
    /// Creates an idle loop with `workers` workers, each queueing up to `queue_capacity` ready chunks.
    pub fn new(workers: usize, queue_capacity: usize, read_buffer_size: usize) -> Self {
        SelectorEventLoop {
            inner: Arc::new(SelectorInner {
                state: Mutex::new(SelectorState {
                    lifecycle: Lifecycle::Idle,
                    commands: None,
                    connections: HashMap::new(),
                }),
                stop: watch::channel(false).0,
                workers: workers.max(1),
                queue_capacity: queue_capacity.max(1),
                read_buffer_size: read_buffer_size.max(1),
            }),
        }
    }
}

impl SelectorInner {
    fn state(&self) -> MutexGuard<'_, SelectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn forget(&self, connection: &Connection) -> bool {
        let mut state = self.state();
        let removed = state.connections.remove(&connection.id()).is_some();
        if removed {
            if let Some(commands) = &state.commands {
                let _ = commands.send(Command::Forget(connection.id()));
            }
        }
        removed
    }

    fn stop(&self) -> Vec<Connection> {
        let connections = {
            let mut state = self.state();
            state.lifecycle = Lifecycle::Stopped;
            state.commands = None;
            mem::take(&mut state.connections)
        };
        self.stop.send_replace(true);
        connections.into_values().collect()
    }
}

impl EventLoop for SelectorEventLoop {
    fn register(&self, connection: &Connection) -> Result<(), EventLoopError> {
        {
            let mut state = self.inner.state();
            state.lifecycle.ensure_running()?;
            if state.connections.contains_key(&connection.id()) {
                return Err(EventLoopError::AlreadyRegistered { id: connection.id() });
            }
            let commands = state.commands.as_ref().ok_or(EventLoopError::ShutDown)?;
            let reader = connection
                .take_reader()
                .ok_or(EventLoopError::ReaderUnavailable { id: connection.id() })?;
            commands
                .send(Command::Watch(connection.clone(), reader))
                .map_err(|_| EventLoopError::ShutDown)?;
            state.connections.insert(connection.id(), connection.clone());
        }

        let inner: Weak<SelectorInner> = Arc::downgrade(&self.inner);
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
            Lifecycle::Running => return Ok(()),
            Lifecycle::Stopped => return Err(EventLoopError::ShutDown),
            Lifecycle::Idle => {}
        }

        let mut workers = Vec::with_capacity(self.inner.workers);
        for index in 0..self.inner.workers {
            let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
            tokio::spawn(work(rx).instrument(info_span!("selector_worker", index)));
            workers.push(tx);
        }

        let (commands, commands_rx) = mpsc::unbounded_channel();
        tokio::spawn(
            multiplex(
                commands_rx,
                workers,
                self.inner.stop.subscribe(),
                self.inner.read_buffer_size,
            )
            .instrument(info_span!("selector")),
        );

        state.commands = Some(commands);
        state.lifecycle = Lifecycle::Running;
        Ok(())
    }

    fn shutdown(&self) {
        let connections = self.inner.stop();
        debug!(connections = connections.len(), "selector event loop shut down");
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

impl fmt::Debug for SelectorEventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state();
        f.debug_struct("SelectorEventLoop")
            .field("lifecycle", &state.lifecycle)
            .field("workload", &state.connections.len())
            .field("workers", &self.inner.workers)
            .finish()
    }
}

async fn multiplex(
    mut commands: mpsc::UnboundedReceiver<Command>,
    workers: Vec<mpsc::Sender<Readiness>>,
    mut stop: watch::Receiver<bool>,
    buffer_size: usize,
) {
    let mut sockets: StreamMap<ConnectionId, BoxStream<'static, Readiness>> = StreamMap::new();

    loop {
        tokio::select! {
            _ = raised(&mut stop) => break,
            command = commands.recv() => match command {
                Some(Command::Watch(connection, reader)) => {
                    trace!(id = %connection.id(), "watching connection");
                    sockets.insert(connection.id(), readiness(connection, reader, buffer_size));
                }
                Some(Command::Forget(id)) => {
                    sockets.remove(&id);
                }
                None => break,
            },
            Some((id, ready)) = sockets.next(), if !sockets.is_empty() => {
                let worker = &workers[(id.as_u64() % workers.len() as u64) as usize];
                if worker.send(ready).await.is_err() {
                    break;
                }
            }
        }
    }

    debug!(sockets = sockets.len(), "selector stopped");
}

fn readiness(
    connection: Connection,
    reader: OwnedReadHalf,
    buffer_size: usize,
) -> BoxStream<'static, Readiness> {
    let closed = connection.closed_signal();
    let buf = BytesMut::with_capacity(buffer_size);

    stream::unfold(
        Some((connection, reader, closed, buf)),
        move |socket| async move {
            let Some((connection, mut reader, mut closed, mut buf)) = socket else {
                return None;
            };
            buf.reserve(buffer_size);

            tokio::select! {
                _ = raised(&mut closed) => None,
                read = reader.read_buf(&mut buf) => match read {
                    Ok(0) => Some((Readiness::Closed(connection, None), None)),
                    Ok(_) => {
                        let chunk = buf.split().freeze();
                        let ready = Readiness::Data(connection.clone(), chunk);
                        Some((ready, Some((connection, reader, closed, buf))))
                    }
                    Err(err) => Some((Readiness::Closed(connection, Some(err)), None)),
                },
            }
        },
    )
    .boxed()
}

async fn work(mut queue: mpsc::Receiver<Readiness>) {
    while let Some(ready) = queue.recv().await {
        match ready {
            Readiness::Data(connection, chunk) => connection.receive(&chunk),
            Readiness::Closed(connection, None) => {
                debug!(id = %connection.id(), "remote closed the connection");
                connection.close();
            }
            Readiness::Closed(connection, Some(err)) => {
                warn!(id = %connection.id(), error = %err, "read failed, closing connection");
                connection.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::test_support::open_connection;

    #[tokio::test]
    async fn remote_close_reaches_a_worker() {
        let event_loop = SelectorEventLoop::new(2, 8, 64);
        event_loop.start().unwrap();

        let mut connections = Vec::new();
        for _ in 0..3 {
            let (connection, mut remote) = open_connection().await;
            event_loop.register(&connection).unwrap();
            remote.write_all(b"noise").await.unwrap();
            connections.push((connection, remote));
        }
        assert_eq!(event_loop.workload(), 3);

        let (first, remote) = connections.remove(0);
        drop(remote);
        tokio::time::timeout(Duration::from_secs(5), async {
            while event_loop.workload() > 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(first.is_closed());
    }

    #[tokio::test]
    async fn graceful_shutdown_leaves_connections_open() {
        let event_loop = SelectorEventLoop::new(1, 1, 64);
        event_loop.start().unwrap();
        let (connection, _remote) = open_connection().await;
        event_loop.register(&connection).unwrap();

        event_loop.shutdown();
        assert!(!connection.is_closed());
        assert_eq!(event_loop.workload(), 0);
        assert!(matches!(
            event_loop.register(&connection),
            Err(EventLoopError::ShutDown)
        ));
    }
}
