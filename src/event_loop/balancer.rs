use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::debug;

use super::{DedicatedEventLoop, EventLoop, SelectorEventLoop};
use crate::{
    config::{Config, TransportMode},
    connection::Connection,
    error::EventLoopError,
};

type LoopFactory = Box<dyn Fn() -> Arc<dyn EventLoop> + Send + Sync>;

/// Spreads connections over event loops, creating loops on demand.
///
/// A connection goes to the current loop while it is under `max_workload`, otherwise to the first loop with spare
/// capacity, otherwise to a freshly started loop.
pub struct EventLoopBalancer {
    state: Mutex<BalancerState>,
    max_workload: usize,
    factory: LoopFactory,
}

struct BalancerState {
    loops: Vec<Arc<dyn EventLoop>>,
    current: usize,
}

impl EventLoopBalancer {
    /// Creates a balancer producing loops with `factory`.
    pub fn new<F, L>(max_workload: usize, factory: F) -> Self
    where
        F: Fn() -> L + Send + Sync + 'static,
        L: EventLoop,
    {
        EventLoopBalancer {
            state: Mutex::new(BalancerState {
                loops: Vec::new(),
                current: 0,
            }),
            max_workload: max_workload.max(1),
            factory: Box::new(move || Arc::new(factory()) as Arc<dyn EventLoop>),
        }
    }

    /// Creates a balancer producing the loop type selected by the config's transport.
    pub fn from_config(config: &Config) -> Self {
        let read_buffer_size = config.read_buffer_size();
        match config.transport() {
            TransportMode::Dedicated => EventLoopBalancer::new(config.max_workload(), move || {
                DedicatedEventLoop::new(read_buffer_size)
            }),
            TransportMode::Selector => {
                let workers = config.workers();
                let queue_capacity = config.queue_capacity();
                EventLoopBalancer::new(config.max_workload(), move || {
                    SelectorEventLoop::new(workers, queue_capacity, read_buffer_size)
                })
            }
        }
    }

    /// Registers a connection with a loop that has spare capacity, returning that loop.
    pub fn register(&self, connection: &Connection) -> Result<Arc<dyn EventLoop>, EventLoopError> {
        let mut state = self.state();
        let chosen = self.choose(&mut state)?;
        chosen.register(connection)?;
        Ok(chosen)
    }

    fn choose(&self, state: &mut BalancerState) -> Result<Arc<dyn EventLoop>, EventLoopError> {
        let has_capacity =
            |event_loop: &Arc<dyn EventLoop>| event_loop.is_running() && event_loop.workload() < self.max_workload;

        if let Some(current) = state.loops.get(state.current).filter(|l| has_capacity(l)) {
            return Ok(current.clone());
        }

        if let Some(index) = state.loops.iter().position(has_capacity) {
            state.current = index;
            return Ok(state.loops[index].clone());
        }

        let event_loop = (self.factory)();
        event_loop.start()?;
        state.loops.push(event_loop.clone());
        state.current = state.loops.len() - 1;
        debug!(loops = state.loops.len(), "started a new event loop");
        Ok(event_loop)
    }

    /// Returns the number of loops.
    pub fn loop_count(&self) -> usize {
        self.state().loops.len()
    }

    /// Returns the workload of every loop, in creation order.
    pub fn workloads(&self) -> Vec<usize> {
        self.state()
            .loops
            .iter()
            .map(|event_loop| event_loop.workload())
            .collect()
    }

    /// Shuts every loop down gracefully.
    pub fn shutdown(&self) {
        let loops = std::mem::take(&mut self.state().loops);
        for event_loop in loops {
            event_loop.shutdown();
        }
    }

    /// Shuts every loop down, closing their connections, and forgets them.
    pub fn shutdown_now(&self) {
        let loops = {
            let mut state = self.state();
            state.current = 0;
            std::mem::take(&mut state.loops)
        };
        for event_loop in loops {
            event_loop.shutdown_now();
        }
    }

    fn state(&self) -> MutexGuard<'_, BalancerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for EventLoopBalancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopBalancer")
            .field("max_workload", &self.max_workload)
            .field("loops", &self.state().loops)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::open_connection;

    #[tokio::test]
    async fn full_loops_spill_over_to_new_ones() {
        let balancer = EventLoopBalancer::new(2, || SelectorEventLoop::new(1, 4, 256));
        let mut held = Vec::new();

        for _ in 0..5 {
            let (connection, remote) = open_connection().await;
            balancer.register(&connection).unwrap();
            held.push((connection, remote));
        }
        assert_eq!(balancer.workloads(), vec![2, 2, 1]);

        held[0].0.close();
        let (connection, remote) = open_connection().await;
        balancer.register(&connection).unwrap();
        held.push((connection, remote));
        assert_eq!(balancer.workloads(), vec![1, 2, 2]);

        let (connection, remote) = open_connection().await;
        balancer.register(&connection).unwrap();
        held.push((connection, remote));
        assert_eq!(balancer.workloads(), vec![2, 2, 2]);
        assert_eq!(balancer.loop_count(), 3);

        balancer.shutdown_now();
        assert_eq!(balancer.loop_count(), 0);
        assert!(held.iter().all(|(connection, _)| connection.is_closed()));
    }
}
