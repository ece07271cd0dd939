//! A resettable countdown gate.
//!
//! A [`Rendezvous`] starts at a count of `N` and releases every waiter once [`go_on`](Rendezvous::go_on) has been
//! called `N` times. It gates "not ready yet" state throughout the crate: a peer's session is primed once the Ping
//! handshake completes, a keyed connection is connected once reconciliation completes.
//!
//! Resets are tracked with a generation counter. A reset releases everything that was parked on the previous
//! generation, so a waiter never observes a gate that was reinitialized underneath it.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use comlink::rendezvous::Rendezvous;
//!
//! # tokio_test::block_on(async {
//! let gate = Arc::new(Rendezvous::new(1));
//! let waiter = tokio::spawn({
//!     let gate = gate.clone();
//!     async move { gate.synchronize().await }
//! });
//!
//! assert!(gate.go_on());
//! waiter.await.unwrap();
//! # })
//! ```

use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{sync::Notify, time::error::Elapsed};

/// A countdown gate released after a fixed number of [`go_on`](Rendezvous::go_on) calls.
#[derive(Debug)]
pub struct Rendezvous {
    initial: usize,
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Debug)]
struct State {
    remaining: usize,
    epoch: u64,
}

impl Rendezvous {
    /// Creates a gate that is released after `count` calls to [`go_on`](Rendezvous::go_on).
    pub fn new(count: usize) -> Self {
        Rendezvous {
            initial: count,
            state: Mutex::new(State {
                remaining: count,
                epoch: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Waits until the gate is released, or until it is reset.
    pub async fn synchronize(&self) {
        let epoch = {
            let state = self.lock();
            if state.remaining == 0 {
                return;
            }
            state.epoch
        };

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.lock();
                if state.remaining == 0 || state.epoch != epoch {
                    return;
                }
            }

            notified.await;
        }
    }

    /// Waits until the gate is released, failing once `timeout` has elapsed.
    pub async fn synchronize_timeout(&self, timeout: Duration) -> Result<(), Elapsed> {
        tokio::time::timeout(timeout, self.synchronize()).await
    }

    /// Waits until the gate is released, with an optional timeout. `None` waits indefinitely.
    pub async fn synchronize_for(&self, timeout: Option<Duration>) -> Result<(), Elapsed> {
        match timeout {
            Some(timeout) => self.synchronize_timeout(timeout).await,
            None => {
                self.synchronize().await;
                Ok(())
            }
        }
    }

    /// Counts the gate down by one.
    ///
    /// Returns `true` only for the call that released the gate. Counting down a released gate is a no-op.
    pub fn go_on(&self) -> bool {
        let released = {
            let mut state = self.lock();
            if state.remaining == 0 {
                return false;
            }
            state.remaining -= 1;
            state.remaining == 0
        };

        if released {
            self.notify.notify_waiters();
        }

        released
    }

    /// Releases every current waiter and rearms the gate with its initial count.
    pub fn reset(&self) {
        {
            let mut state = self.lock();
            state.remaining = self.initial;
            state.epoch = state.epoch.wrapping_add(1);
        }
        self.notify.notify_waiters();
    }

    /// Returns the number of [`go_on`](Rendezvous::go_on) calls still needed.
    pub fn remaining(&self) -> usize {
        self.lock().remaining
    }

    /// Returns `true` once the gate has been released.
    pub fn is_released(&self) -> bool {
        self.remaining() == 0
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Rendezvous {
    fn default() -> Self {
        Rendezvous::new(1)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn released_gate_does_not_block() {
        let gate = Rendezvous::new(0);
        assert!(gate.is_released());
        gate.synchronize().await;
        assert!(!gate.go_on());
    }

    #[tokio::test]
    async fn only_the_final_go_on_releases() {
        let gate = Rendezvous::new(2);
        assert!(!gate.go_on());
        assert!(!gate.is_released());
        assert!(gate.go_on());
        assert!(!gate.go_on());
        gate.synchronize().await;
    }

    #[tokio::test]
    async fn waiters_block_until_released() {
        let gate = Arc::new(Rendezvous::default());
        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.synchronize().await }
        });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        gate.go_on();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn reset_releases_parked_waiters_and_rearms() {
        let gate = Arc::new(Rendezvous::default());
        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.synchronize().await }
        });
        tokio::task::yield_now().await;

        gate.reset();
        waiter.await.unwrap();

        assert_eq!(gate.remaining(), 1);
        assert!(gate
            .synchronize_timeout(Duration::from_millis(20))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn synchronize_for_none_waits_for_release() {
        let gate = Arc::new(Rendezvous::default());
        let releaser = tokio::spawn({
            let gate = gate.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                gate.go_on();
            }
        });
        gate.synchronize_for(None).await.unwrap();
        releaser.await.unwrap();
    }
}
