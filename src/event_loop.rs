//! Event loops read from registered connections and feed the received bytes back into them.
//!
//! Two strategies are provided:
//!
//! - [`DedicatedEventLoop`] spawns one reader task per connection, suited to line-framed transports.
//! - [`SelectorEventLoop`] multiplexes every registered socket on a single task and hands ready chunks to a bounded
//!   worker pool. A connection is always processed by the same worker so its bytes stay ordered.
//!
//! The [`EventLoopBalancer`] spreads connections over as many loops as needed to keep each one under a maximum
//! workload.
//!
//! Connections unregister themselves from their loop through a shutdown hook when they are closed.

mod balancer;
mod dedicated;
mod selector;

use std::fmt;

pub use balancer::EventLoopBalancer;
pub use dedicated::DedicatedEventLoop;
pub use selector::SelectorEventLoop;

use crate::{connection::Connection, error::EventLoopError};

/// Reads from a set of connections.
pub trait EventLoop: fmt::Debug + Send + Sync + 'static {
    /// Starts reading from the connection.
    ///
    /// The loop takes the connection's read half and installs a shutdown hook unregistering it.
    fn register(&self, connection: &Connection) -> Result<(), EventLoopError>;

    /// Stops reading from the connection without closing it. Returns whether it was registered.
    fn unregister(&self, connection: &Connection) -> bool;

    /// Starts the loop. Starting a running loop is a no-op.
    fn start(&self) -> Result<(), EventLoopError>;

    /// Stops reading new data and lets in-flight work finish.
    fn shutdown(&self);

    /// Stops the loop and closes every registered connection.
    ///
    /// Shutdown hooks of the connections run on the calling thread.
    fn shutdown_now(&self);

    /// Returns the number of registered connections.
    fn workload(&self) -> usize;

    /// Returns `true` between [`start`](EventLoop::start) and shutdown.
    fn is_running(&self) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

impl Lifecycle {
    fn ensure_running(self) -> Result<(), EventLoopError> {
        match self {
            Lifecycle::Idle => Err(EventLoopError::NotRunning),
            Lifecycle::Running => Ok(()),
            Lifecycle::Stopped => Err(EventLoopError::ShutDown),
        }
    }
}
