//! Event loops reading real sockets, fed by hand-written wire data.

use std::{collections::HashMap, sync::Arc, time::Duration};

use comlink::{
    codec::Codec,
    connection::Connection,
    event_loop::{DedicatedEventLoop, EventLoop, EventLoopBalancer, SelectorEventLoop},
    framing::FramingMode,
    ConnectionKey, DispatchRegistry, Envelope, Message, Peer,
};
use serde::{Deserialize, Serialize};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Message, Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
struct Numbered {
    stream: u32,
    seq: u32,
}

async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (dialed.unwrap(), accepted.unwrap().0)
}

/// A peer whose registry forwards every received `Numbered` from the reading task.
fn recording_peer() -> (Peer, mpsc::UnboundedReceiver<Numbered>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let registry = Arc::new(DispatchRegistry::new());
    registry.add_default_handler(move |_context, _session, envelope| {
        let _ = tx.send(envelope.open::<Numbered>()?);
        Ok(())
    });
    (Peer::new(Arc::new(Codec::new()), registry), rx)
}

async fn open(peer: &Peer, mode: FramingMode) -> (Connection, TcpStream) {
    let (local, remote) = tcp_pair().await;
    let connection = Connection::open(local, mode, ConnectionKey::DEFAULT, peer.codec().clone()).unwrap();
    connection.set_peer(peer);
    (connection, remote)
}

fn wire(mode: FramingMode, messages: impl IntoIterator<Item = Numbered>) -> Vec<u8> {
    let codec = Codec::new();
    messages
        .into_iter()
        .flat_map(|message| {
            let envelope = Envelope::wrap(&message).unwrap();
            mode.frame(codec.serialize(&envelope).unwrap()).into_bytes()
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn selector_keeps_per_connection_order_across_loops() {
    let balancer = EventLoopBalancer::new(4, || SelectorEventLoop::new(2, 16, 64));
    let (peer, mut received) = recording_peer();

    let mut remotes = Vec::new();
    for _ in 0..6 {
        let (connection, remote) = open(&peer, FramingMode::Boundary).await;
        balancer.register(&connection).unwrap();
        remotes.push((connection, remote));
    }
    assert_eq!(balancer.workloads(), vec![4, 2]);

    for (stream, (_, remote)) in remotes.iter_mut().enumerate() {
        let messages = (0..50).map(|seq| Numbered {
            stream: stream as u32,
            seq,
        });
        remote.write_all(&wire(FramingMode::Boundary, messages)).await.unwrap();
    }

    let mut next: HashMap<u32, u32> = HashMap::new();
    for _ in 0..300 {
        let message = timeout(WAIT, received.recv()).await.unwrap().unwrap();
        let expected = next.entry(message.stream).or_default();
        assert_eq!(message.seq, *expected, "stream {} out of order", message.stream);
        *expected += 1;
    }
    assert!(next.values().all(|count| *count == 50));

    balancer.shutdown_now();
    assert_eq!(balancer.loop_count(), 0);
    assert!(remotes.iter().all(|(connection, _)| connection.is_closed()));
}

#[tokio::test(flavor = "multi_thread")]
async fn dedicated_loop_reads_lines_split_across_writes() {
    let event_loop = DedicatedEventLoop::new(16);
    event_loop.start().unwrap();
    let (peer, mut received) = recording_peer();
    let (connection, mut remote) = open(&peer, FramingMode::Line).await;
    event_loop.register(&connection).unwrap();

    let bytes = wire(
        FramingMode::Line,
        (0..3).map(|seq| Numbered { stream: 0, seq }),
    );
    let (head, tail) = bytes.split_at(bytes.len() / 2 + 1);
    remote.write_all(head).await.unwrap();
    remote.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    remote.write_all(tail).await.unwrap();

    for seq in 0..3 {
        let message = timeout(WAIT, received.recv()).await.unwrap().unwrap();
        assert_eq!(message, Numbered { stream: 0, seq });
    }

    event_loop.shutdown_now();
    assert!(connection.is_closed());
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_close_unregisters_the_connection() {
    let balancer = EventLoopBalancer::new(8, || SelectorEventLoop::new(1, 4, 256));
    let (peer, _received) = recording_peer();
    let (connection, remote) = open(&peer, FramingMode::Boundary).await;
    let event_loop = balancer.register(&connection).unwrap();
    assert_eq!(event_loop.workload(), 1);

    drop(remote);
    timeout(WAIT, async {
        while event_loop.workload() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(connection.is_closed());
    assert!(event_loop.is_running());

    balancer.shutdown();
    assert!(!event_loop.is_running());
}

#[tokio::test(flavor = "multi_thread")]
async fn stopped_loops_reject_connections() {
    let event_loop = SelectorEventLoop::new(1, 4, 256);
    event_loop.start().unwrap();
    event_loop.shutdown();

    let (peer, _received) = recording_peer();
    let (connection, _remote) = open(&peer, FramingMode::Boundary).await;
    assert!(event_loop.register(&connection).is_err());
    assert!(event_loop.start().is_err());
}
