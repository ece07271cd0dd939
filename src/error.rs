//! Defines error handling constructs for comlink.
//!
//! Each concern of the crate gets its own error type: encoding objects, managing receive pipelines, dispatching
//! received objects, writing to connections, running event loops, and performing handshakes. None of these are
//! fatal to the process; every failure is scoped to a single connection, peer or message.

use std::{error, io, net::SocketAddr};

use itertools::Itertools;
use thiserror::Error;

use crate::id::{ClientId, ConnectionId, ConnectionKey};

/// A dyn boxed error.
pub type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

fn join_causes(causes: &[BoxError]) -> String {
    causes.iter().map(|cause| cause.to_string()).join("; ")
}

/// Error produced by the [`Codec`](crate::codec::Codec) when every adapter failed.
///
/// The failure of each adapter that was tried is kept in order as a suppressed cause.
#[derive(Debug, Error)]
pub enum CodecError {
    /// No serialization adapter could encode the object.
    #[error("failed to serialize `{tag}` after {} attempt(s): {}", .causes.len(), join_causes(.causes))]
    Serialize {
        /// Type tag of the object being encoded.
        tag: String,
        /// Failure of every adapter tried, in order.
        causes: Vec<BoxError>,
    },
    /// No deserialization adapter could decode the wire unit.
    #[error("failed to deserialize wire unit after {} attempt(s): {}", .causes.len(), join_causes(.causes))]
    Deserialize {
        /// Failure of every adapter tried, in order.
        causes: Vec<BoxError>,
    },
}

impl CodecError {
    /// Returns the failure of every adapter that was tried.
    pub fn suppressed(&self) -> &[BoxError] {
        match self {
            CodecError::Serialize { causes, .. } | CodecError::Deserialize { causes } => causes,
        }
    }
}

/// Misuse of a [`ReceivePipeline`](crate::dispatch::ReceivePipeline).
///
/// These are programmer errors and are never retried.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// The pipeline is sealed and its state can no longer change.
    #[error("receive pipeline for `{tag}` is sealed")]
    Sealed {
        /// Type tag of the pipeline.
        tag: &'static str,
    },
    /// The pipeline is closed and rejects new handlers.
    #[error("receive pipeline for `{tag}` is closed")]
    Closed {
        /// Type tag of the pipeline.
        tag: &'static str,
    },
    /// The pipeline's policy does not allow binding handler objects.
    #[error("receive pipeline for `{tag}` does not allow binding handler objects")]
    HandlerNotAllowed {
        /// Type tag of the pipeline.
        tag: &'static str,
    },
}

/// Error returned when routing a received object to its handlers.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No pipeline and no default handler exist for the type tag; the object is undeliverable.
    #[error("no communication specified for `{tag}`")]
    NotSpecified {
        /// Type tag of the undeliverable object.
        tag: String,
    },
    /// The type tag is already registered for a different Rust type.
    #[error("type tag `{tag}` is already registered for a different message type")]
    TagConflict {
        /// The conflicting type tag.
        tag: &'static str,
    },
    /// The payload could not be decoded into the pipeline's message type.
    #[error("failed to decode `{tag}` payload: {source}")]
    Decode {
        /// Type tag of the object.
        tag: String,
        /// The underlying decode error.
        #[source]
        source: serde_json::Error,
    },
}

/// Error returned when sending over a [`Connection`](crate::connection::Connection).
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection has been closed.
    #[error("connection {id} is closed")]
    Closed {
        /// Id of the closed connection.
        id: ConnectionId,
    },
    /// The peer has no connection under the key.
    #[error("no connection for key `{key}`")]
    NoConnection {
        /// The missing key.
        key: ConnectionKey,
    },
    /// The message could not be converted into an envelope.
    #[error("failed to build envelope: {0}")]
    Envelope(#[from] serde_json::Error),
    /// The codec failed to encode the envelope.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// A socket operation failed.
    #[error("network error: {0}")]
    Network(#[from] io::Error),
}

/// Error returned by [`EventLoop`](crate::event_loop::EventLoop) operations.
#[derive(Debug, Error)]
pub enum EventLoopError {
    /// The loop was asked to do work before being started.
    #[error("event loop is not running")]
    NotRunning,
    /// The loop has been shut down and accepts no more connections.
    #[error("event loop has been shut down")]
    ShutDown,
    /// The connection's read half was already taken by another loop.
    #[error("connection {id} has no readable half left")]
    ReaderUnavailable {
        /// Id of the connection.
        id: ConnectionId,
    },
    /// The connection is already registered with this loop.
    #[error("connection {id} is already registered")]
    AlreadyRegistered {
        /// Id of the connection.
        id: ConnectionId,
    },
}

/// Error returned by the handshake coordinator.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The configured handshake timeout elapsed.
    #[error("timed out waiting for {stage}")]
    Timeout {
        /// The handshake stage that timed out.
        stage: &'static str,
    },
    /// A peer referenced by the handshake does not exist.
    #[error("peer {id} is not known")]
    UnknownPeer {
        /// The unknown id.
        id: ClientId,
    },
    /// A connection for the key is already being established.
    #[error("a connection for key `{key}` is already being established")]
    AlreadyPending {
        /// The contested key.
        key: ConnectionKey,
    },
    /// The peer has no primed default connection.
    #[error("peer is not connected")]
    NotConnected,
    /// Sending a handshake message failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// Dialing a new socket failed.
    #[error("network error: {0}")]
    Network(#[from] io::Error),
    /// Registering the new connection with an event loop failed.
    #[error(transparent)]
    EventLoop(#[from] EventLoopError),
}

/// Error returned when starting a server or client.
#[derive(Debug, Error)]
pub enum StartError {
    /// Binding the listening socket failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address that could not be bound.
        addr: SocketAddr,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
    /// Connecting to the server failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// The server address.
        addr: SocketAddr,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
    /// The client already holds an open default connection.
    #[error("already connected")]
    AlreadyConnected,
    /// Another socket operation failed.
    #[error("network error: {0}")]
    Network(#[from] io::Error),
    /// Registering a connection with an event loop failed.
    #[error(transparent)]
    EventLoop(#[from] EventLoopError),
    /// The primary handshake failed.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    /// Sending the first handshake message failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// Registering the handshake handlers failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// Binding the handshake handlers to their pipelines failed.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_error_lists_every_cause() {
        let err = CodecError::Serialize {
            tag: "Ping".to_string(),
            causes: vec!["primary broke".into(), "fallback broke".into()],
        };
        assert_eq!(err.suppressed().len(), 2);
        assert_eq!(
            err.to_string(),
            "failed to serialize `Ping` after 2 attempt(s): primary broke; fallback broke"
        );
    }

    #[test]
    fn pipeline_error_names_the_tag() {
        let err = PipelineError::Sealed { tag: "Ping" };
        assert_eq!(err.to_string(), "receive pipeline for `Ping` is sealed");
    }
}
