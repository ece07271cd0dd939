//! Settings shared by [`ServerStart`](crate::server::ServerStart) and [`ClientStart`](crate::client::ClientStart).

use std::time::Duration;

use crate::framing::FramingMode;

/// How connections are read, which also determines how units are framed.
///
/// Both ends of a connection must use the same transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransportMode {
    /// One reader task per connection, with line framing.
    Dedicated,
    /// Multiplexed reads with a worker pool, with boundary-marker framing.
    #[default]
    Selector,
}

/// Configuration for servers and clients.
#[derive(Clone, Debug)]
pub struct Config {
    transport: TransportMode,
    max_workload: usize,
    workers: usize,
    queue_capacity: usize,
    read_buffer_size: usize,
    handshake_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: TransportMode::default(),
            max_workload: 1024,
            workers: 4,
            queue_capacity: 256,
            read_buffer_size: 8 * 1024,
            handshake_timeout: None,
        }
    }
}

impl Config {
    /// Sets the transport.
    pub fn with_transport(mut self, transport: TransportMode) -> Self {
        self.transport = transport;
        self
    }

    /// Sets the maximum number of connections per event loop.
    pub fn with_max_workload(mut self, max_workload: usize) -> Self {
        self.max_workload = max_workload;
        self
    }

    /// Sets the number of workers of each selector event loop.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the number of ready chunks each selector worker can queue.
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// Sets the size of the buffer sockets are read into.
    pub fn with_read_buffer_size(mut self, bytes: usize) -> Self {
        self.read_buffer_size = bytes;
        self
    }

    /// Sets how long each handshake wait may take. `None`, the default, waits indefinitely.
    ///
    /// A handshake that times out is abandoned and not retried.
    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Returns the transport.
    pub fn transport(&self) -> TransportMode {
        self.transport
    }

    /// Returns the maximum number of connections per event loop.
    pub fn max_workload(&self) -> usize {
        self.max_workload
    }

    /// Returns the number of workers of each selector event loop.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Returns the capacity of each selector worker queue.
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Returns the read buffer size.
    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer_size
    }

    /// Returns the handshake timeout.
    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout
    }

    /// Returns the framing mode implied by the transport.
    pub fn framing(&self) -> FramingMode {
        match self.transport {
            TransportMode::Dedicated => FramingMode::Line,
            TransportMode::Selector => FramingMode::Boundary,
        }
    }
}
