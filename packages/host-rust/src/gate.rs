//! Counting concurrency gate.
//!
//! Bounds how many messages a single receiver has mid-processing. Waiters are
//! admitted in request order (tokio's semaphore is FIFO), and a slot is
//! returned on every exit path because the permit releases on drop.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Reasons [`ConcurrencyGate::acquire`] gives up without a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    #[error("cancelled while waiting for a concurrency slot")]
    Cancelled,
    #[error("concurrency gate closed")]
    Closed,
}

/// FIFO-fair async counting semaphore sized to `max_concurrent_calls`.
///
/// Owned by exactly one channel receiver; never shared across receivers.
#[derive(Debug)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ConcurrencyGate {
    /// Create a gate admitting at most `capacity` holders at once.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Total number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Waits for a free slot.
    ///
    /// Cancellation wins over a simultaneously available slot so that a
    /// shutting-down receiver stops admitting new work.
    ///
    /// # Errors
    ///
    /// [`GateError::Cancelled`] if `cancel` fires first, [`GateError::Closed`]
    /// after [`close`](Self::close).
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<GatePermit, GateError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(GateError::Cancelled),
            permit = Arc::clone(&self.semaphore).acquire_owned() => permit
                .map(|permit| GatePermit { _permit: permit })
                .map_err(|_| GateError::Closed),
        }
    }

    /// Closes the gate. Pending and future `acquire` calls fail with
    /// [`GateError::Closed`]; outstanding permits stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

/// One occupied slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;

    #[tokio::test]
    async fn permit_release_on_drop() {
        let gate = ConcurrencyGate::new(2);
        let cancel = CancellationToken::new();

        let a = gate.acquire(&cancel).await.unwrap();
        let _b = gate.acquire(&cancel).await.unwrap();
        assert_eq!(gate.available(), 0);

        drop(a);
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test]
    async fn waiters_admitted_in_request_order() {
        let gate = Arc::new(ConcurrencyGate::new(1));
        let cancel = CancellationToken::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        // Hold the only slot so every spawned waiter queues up.
        let held = gate.acquire(&cancel).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let gate = Arc::clone(&gate);
            let cancel = cancel.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire(&cancel).await.unwrap();
                order.lock().push(i);
                tokio::task::yield_now().await;
            }));
            // Let waiter `i` register before spawning `i + 1`.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock(), (0..8).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn capacity_one_serializes_five_thousand_waiters() {
        const WAITERS: usize = 5000;

        let gate = Arc::new(ConcurrencyGate::new(1));
        let cancel = CancellationToken::new();
        // Single shared slot written under the gate, plus one result cell per waiter.
        let shared = Arc::new(Mutex::new(usize::MAX));
        let results = Arc::new(Mutex::new(vec![usize::MAX; WAITERS]));

        let mut handles = Vec::with_capacity(WAITERS);
        for i in 0..WAITERS {
            let gate = Arc::clone(&gate);
            let cancel = cancel.clone();
            let shared = Arc::clone(&shared);
            let results = Arc::clone(&results);
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire(&cancel).await.unwrap();
                *shared.lock() = i;
                tokio::task::yield_now().await;
                let seen = *shared.lock();
                results.lock()[i] = seen;
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        let results = results.lock();
        for (i, seen) in results.iter().enumerate() {
            assert_eq!(*seen, i, "slot {i} was overwritten by another holder");
        }
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_leak_a_slot() {
        let gate = Arc::new(ConcurrencyGate::new(1));
        let cancel = CancellationToken::new();

        let held = gate.acquire(&cancel).await.unwrap();

        let waiter = {
            let gate = Arc::clone(&gate);
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.acquire(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        cancel.cancel();

        assert_eq!(waiter.await.unwrap().unwrap_err(), GateError::Cancelled);
        drop(held);
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test]
    async fn close_fails_pending_waiters() {
        let gate = Arc::new(ConcurrencyGate::new(1));
        let cancel = CancellationToken::new();
        let _held = gate.acquire(&cancel).await.unwrap();

        let waiter = {
            let gate = Arc::clone(&gate);
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.acquire(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        gate.close();

        assert_eq!(waiter.await.unwrap().unwrap_err(), GateError::Closed);
    }
}
