//! Singleton coordinator: runs a component on at most one fleet member.
//!
//! A background task per coordinator drives the lease state machine:
//!
//! ```text
//! Unlocked -> PollingForLock <-> Locked
//!     ^              |              |
//!     +------ stop --+------ stop --+
//! ```
//!
//! While `Locked` the wrapped component runs and the lease is renewed every
//! `renew_interval`. A renewal that reports the lease lost, or that keeps
//! failing past `renew_retries`, stops the component, releases the lease and
//! returns to polling. Dual ownership inside the lock store's consistency
//! window is possible, so processors behind a singleton must be idempotent.

use std::sync::Arc;

use async_trait::async_trait;
use conveyor_core::{LockHandle, LockManager};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use crate::config::SingletonConfig;
use crate::host::{BackgroundTask, HostedComponent};

/// Lease state of one coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SingletonState {
    /// Not started, or stopped.
    Unlocked,
    /// Another member holds the lease, or the store was unreachable; retrying
    /// every `poll_interval`.
    PollingForLock,
    /// This member holds the lease and runs the component.
    Locked { lease_id: String },
}

impl SingletonState {
    /// Returns `true` while this member holds the lease.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }
}

/// How a held lease ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseEnd {
    Lost,
    Cancelled,
}

/// Outcome of one renewal round including retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Renewal {
    Renewed,
    Lost,
    Cancelled,
}

// ---------------------------------------------------------------------------
// SingletonCoordinator
// ---------------------------------------------------------------------------

/// Wraps a [`HostedComponent`] so that it only runs while this member holds
/// the lease on the component's lock id.
pub struct SingletonCoordinator {
    inner: Arc<Inner>,
    running: Mutex<Option<BackgroundTask>>,
}

struct Inner {
    component: Arc<dyn HostedComponent>,
    lock_manager: Arc<dyn LockManager>,
    config: SingletonConfig,
    lock_id: String,
    state: watch::Sender<SingletonState>,
}

impl SingletonCoordinator {
    /// Wrap `component`, leasing its lock id from `lock_manager`.
    #[must_use]
    pub fn new(
        component: Arc<dyn HostedComponent>,
        lock_manager: Arc<dyn LockManager>,
        config: SingletonConfig,
    ) -> Self {
        let lock_id = component.lock_id();
        let (state, _) = watch::channel(SingletonState::Unlocked);
        Self {
            inner: Arc::new(Inner {
                component,
                lock_manager,
                config,
                lock_id,
                state,
            }),
            running: Mutex::new(None),
        }
    }

    /// Current lease state.
    #[must_use]
    pub fn state(&self) -> SingletonState {
        self.inner.state.borrow().clone()
    }

    /// Receiver notified on every state transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SingletonState> {
        self.inner.state.subscribe()
    }
}

#[async_trait]
impl HostedComponent for SingletonCoordinator {
    fn name(&self) -> &str {
        self.inner.component.name()
    }

    fn lock_id(&self) -> String {
        self.inner.lock_id.clone()
    }

    async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            anyhow::bail!("singleton {} is already started", self.inner.lock_id);
        }
        let inner = Arc::clone(&self.inner);
        *running = Some(BackgroundTask::spawn(&cancel, |token| inner.run(token)));
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let Some(task) = self.running.lock().take() else {
            return Ok(());
        };
        task.stop()
            .await
            .map_err(|err| anyhow::anyhow!("singleton {} task failed: {err}", self.inner.lock_id))
    }
}

impl std::fmt::Debug for SingletonCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingletonCoordinator")
            .field("lock_id", &self.inner.lock_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Lease state machine
// ---------------------------------------------------------------------------

impl Inner {
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(lock_id = %self.lock_id, "singleton coordinator started");
        loop {
            if let Some(handle) = self.try_acquire().await {
                if self.hold(handle, &cancel).await == LeaseEnd::Cancelled {
                    break;
                }
            }

            self.publish(SingletonState::PollingForLock);
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        self.publish(SingletonState::Unlocked);
        info!(lock_id = %self.lock_id, "singleton coordinator stopped");
    }

    async fn try_acquire(&self) -> Option<Box<dyn LockHandle>> {
        match self
            .lock_manager
            .try_acquire(&self.lock_id, self.config.lease_period)
            .await
        {
            Ok(Some(handle)) => Some(handle),
            Ok(None) => {
                debug!(lock_id = %self.lock_id, "lock held elsewhere; polling");
                None
            }
            Err(err) => {
                warn!(lock_id = %self.lock_id, error = %err, "lock acquisition failed; polling");
                None
            }
        }
    }

    /// Runs the component for as long as the lease holds. `Locked` is only
    /// published once the component is running.
    async fn hold(&self, handle: Box<dyn LockHandle>, cancel: &CancellationToken) -> LeaseEnd {
        let lease_id = handle.lease_id().to_owned();
        info!(lock_id = %self.lock_id, lease_id = %lease_id, "lock acquired");

        let end = match self.component.start(cancel.child_token()).await {
            Ok(()) => {
                self.publish(SingletonState::Locked {
                    lease_id: lease_id.clone(),
                });
                self.set_locked_gauge(true);
                self.keep_lease(handle.as_ref(), cancel).await
            }
            Err(err) => {
                error!(
                    lock_id = %self.lock_id,
                    error = %err,
                    "singleton component failed to start; giving up the lock"
                );
                LeaseEnd::Lost
            }
        };

        if let Err(err) = self.component.stop().await {
            warn!(lock_id = %self.lock_id, error = %err, "singleton component failed to stop cleanly");
        }
        if let Err(err) = handle.release().await {
            warn!(lock_id = %self.lock_id, lease_id = %lease_id, error = %err, "lock release failed");
        }
        self.set_locked_gauge(false);
        info!(lock_id = %self.lock_id, lease_id = %lease_id, ?end, "lock relinquished");
        end
    }

    async fn keep_lease(&self, handle: &dyn LockHandle, cancel: &CancellationToken) -> LeaseEnd {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return LeaseEnd::Cancelled,
                () = tokio::time::sleep(self.config.renew_interval) => {}
            }
            match self.renew(handle, cancel).await {
                Renewal::Renewed => {}
                Renewal::Lost => return LeaseEnd::Lost,
                Renewal::Cancelled => return LeaseEnd::Cancelled,
            }
        }
    }

    /// One renewal, retried with growing delays on transient failure.
    async fn renew(&self, handle: &dyn LockHandle, cancel: &CancellationToken) -> Renewal {
        let timeout = self.config.renew_timeout;
        let mut delays = Backoff::new(self.config.renew_retry_delay, self.config.renew_retries);
        loop {
            match tokio::time::timeout(timeout, handle.renew(timeout)).await {
                Ok(Ok(true)) => {
                    debug!(lock_id = %self.lock_id, "lease renewed");
                    return Renewal::Renewed;
                }
                Ok(Ok(false)) => {
                    warn!(lock_id = %self.lock_id, "lease lost");
                    return Renewal::Lost;
                }
                Ok(Err(err)) => {
                    warn!(lock_id = %self.lock_id, error = %err, "lease renewal failed");
                }
                Err(_) => {
                    warn!(lock_id = %self.lock_id, ?timeout, "lease renewal timed out");
                }
            }

            let Some(delay) = delays.next() else {
                error!(
                    lock_id = %self.lock_id,
                    retries = self.config.renew_retries,
                    "lease renewal retries exhausted"
                );
                return Renewal::Lost;
            };
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Renewal::Cancelled,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn publish(&self, state: SingletonState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn set_locked_gauge(&self, locked: bool) {
        metrics::gauge!("conveyor_singleton_locked", "lock_id" => self.lock_id.clone())
            .set(if locked { 1.0 } else { 0.0 });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
