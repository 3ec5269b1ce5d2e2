//! Host lifecycle: wiring checks, startup, and graceful shutdown.
//!
//! A [`MessageHost`] owns a set of [`HostedComponent`]s (usually channel
//! receivers). On start it validates configuration, initializes the lock
//! store when any component is a singleton, wraps singletons in a
//! [`SingletonCoordinator`] and starts everything in registration order.
//! Shutdown cancels every component, stops them in reverse order and waits
//! for in-flight attempts to drain.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use conveyor_core::{LockError, LockManager, Serializer, Transport};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::HostConfig;
use crate::receiver::{ChannelReceiver, ChannelReceiverBuilder, ReceiverError};
use crate::registry::ProcessorRegistry;
use crate::shutdown::{HealthState, ShutdownController};
use crate::singleton::{SingletonCoordinator, SingletonState};

// ---------------------------------------------------------------------------
// HostedComponent
// ---------------------------------------------------------------------------

/// A long-running unit the host starts and stops.
///
/// `start` must return once the component is running; the work itself runs
/// in background tasks that observe `cancel`. `stop` waits for those tasks
/// to finish. A stopped component can be started again.
#[async_trait]
pub trait HostedComponent: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Stable identity used as the singleton lock id.
    fn lock_id(&self) -> String {
        self.name().to_owned()
    }

    /// Whether at most one fleet member may run this component at a time.
    fn is_singleton(&self) -> bool {
        false
    }

    async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;
}

/// A spawned loop plus the token that ends it.
#[derive(Debug)]
pub(crate) struct BackgroundTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Spawns `run` with a child of `parent`.
    pub(crate) fn spawn<F, Fut>(parent: &CancellationToken, run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = parent.child_token();
        let handle = tokio::spawn(run(cancel.clone()));
        Self { cancel, handle }
    }

    /// Cancels the loop and waits for it to return.
    pub(crate) async fn stop(self) -> Result<(), JoinError> {
        self.cancel.cancel();
        self.handle.await
    }
}

// ---------------------------------------------------------------------------
// HostError
// ---------------------------------------------------------------------------

/// Failures that abort host startup.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("invalid host configuration: {0}")]
    Configuration(String),
    #[error("singleton component {component} requires a lock manager")]
    MissingLockManager { component: String },
    #[error(transparent)]
    Receiver(#[from] ReceiverError),
    #[error("lock store initialization failed: {0}")]
    Lock(#[from] LockError),
    #[error("component {name} failed to start: {source:#}")]
    Component {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("host is already started")]
    AlreadyStarted,
}

// ---------------------------------------------------------------------------
// MessageHost
// ---------------------------------------------------------------------------

/// Owns hosted components and drives their lifecycle.
pub struct MessageHost {
    config: HostConfig,
    registry: Arc<ProcessorRegistry>,
    lock_manager: Option<Arc<dyn LockManager>>,
    components: Vec<Arc<dyn HostedComponent>>,
    started: Vec<Arc<dyn HostedComponent>>,
    coordinators: Vec<Arc<SingletonCoordinator>>,
    shutdown: ShutdownController,
}

impl MessageHost {
    /// Create a host with no components and no lock manager.
    #[must_use]
    pub fn new(config: HostConfig, registry: Arc<ProcessorRegistry>) -> Self {
        Self {
            config,
            registry,
            lock_manager: None,
            components: Vec::new(),
            started: Vec::new(),
            coordinators: Vec::new(),
            shutdown: ShutdownController::new(),
        }
    }

    /// Sets the lock store used for singleton components.
    #[must_use]
    pub fn with_lock_manager(mut self, lock_manager: Arc<dyn LockManager>) -> Self {
        self.lock_manager = Some(lock_manager);
        self
    }

    /// Sets the lock store used for singleton components.
    pub fn set_lock_manager(&mut self, lock_manager: Arc<dyn LockManager>) {
        self.lock_manager = Some(lock_manager);
    }

    /// Host configuration.
    #[must_use]
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Processor registry shared by this host's receivers.
    #[must_use]
    pub fn registry(&self) -> &Arc<ProcessorRegistry> {
        &self.registry
    }

    /// Builder for a receiver wired to this host's registry, receive-loop
    /// config and in-flight tracking.
    #[must_use]
    pub fn receiver<T>(
        &self,
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> ChannelReceiverBuilder<T>
    where
        T: serde::de::DeserializeOwned + Send + Sync + 'static,
    {
        ChannelReceiver::builder(name, transport)
            .registry(Arc::clone(&self.registry))
            .config(self.config.receiver.clone())
            .shutdown(self.shutdown.clone())
    }

    /// Registers a built receiver. Components start in registration order.
    pub fn add_receiver<T, S>(&mut self, receiver: ChannelReceiver<T, S>)
    where
        T: serde::de::DeserializeOwned + Send + Sync + 'static,
        S: Serializer,
    {
        self.add_component(Arc::new(receiver));
    }

    /// Registers an arbitrary hosted component.
    pub fn add_component(&mut self, component: Arc<dyn HostedComponent>) {
        self.components.push(component);
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn health_state(&self) -> HealthState {
        self.shutdown.health_state()
    }

    /// Shutdown handle shared with the receivers.
    #[must_use]
    pub fn shutdown_controller(&self) -> &ShutdownController {
        &self.shutdown
    }

    /// Lease state of the singleton component named `name`, once started.
    #[must_use]
    pub fn singleton_state(&self, name: &str) -> Option<SingletonState> {
        self.coordinators
            .iter()
            .find(|c| c.name() == name)
            .map(|c| c.state())
    }

    /// Validates wiring and starts every component in registration order.
    ///
    /// # Errors
    ///
    /// Any [`HostError`]; components already started are stopped again
    /// before the error is returned.
    pub async fn start(&mut self) -> Result<(), HostError> {
        if !self.started.is_empty() || self.shutdown.health_state() != HealthState::Starting {
            return Err(HostError::AlreadyStarted);
        }
        self.config.validate().map_err(HostError::Configuration)?;

        let has_singletons = self.components.iter().any(|c| c.is_singleton());
        if let Some(singleton) = self.components.iter().find(|c| c.is_singleton()) {
            if self.lock_manager.is_none() {
                return Err(HostError::MissingLockManager {
                    component: singleton.name().to_owned(),
                });
            }
        }
        if has_singletons {
            if let Some(lock_manager) = &self.lock_manager {
                lock_manager.initialize().await?;
            }
        }

        for component in self.components.clone() {
            let component = self.wrap(component);
            let name = component.name().to_owned();
            if let Err(source) = component.start(self.shutdown.child_token()).await {
                error!(component = %name, error = %source, "component failed to start");
                self.stop_started().await;
                return Err(HostError::Component { name, source });
            }
            info!(component = %name, "component started");
            self.started.push(component);
        }

        self.shutdown.set_ready();
        info!(
            instance_id = %self.config.instance_id,
            components = self.started.len(),
            "message host ready"
        );
        Ok(())
    }

    /// Cancels all components, stops them in reverse order and waits for
    /// in-flight attempts, all within `drain_timeout`.
    ///
    /// Returns `true` if everything drained in time.
    pub async fn shutdown(&mut self) -> bool {
        info!(instance_id = %self.config.instance_id, "message host shutting down");
        self.shutdown.trigger_shutdown();
        let deadline = Instant::now() + self.config.drain_timeout;

        let mut stopped_in_time = true;
        while let Some(component) = self.started.pop() {
            match tokio::time::timeout_at(deadline, component.stop()).await {
                Ok(Ok(())) => info!(component = component.name(), "component stopped"),
                Ok(Err(err)) => {
                    warn!(component = component.name(), error = %err, "component failed to stop cleanly");
                }
                Err(_) => {
                    warn!(component = component.name(), "component did not stop before drain timeout");
                    stopped_in_time = false;
                }
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let drained = self.shutdown.wait_for_drain(remaining).await;
        if !drained {
            warn!(
                in_flight = self.shutdown.in_flight_count(),
                "drain timeout expired with attempts still in flight"
            );
        }
        stopped_in_time && drained
    }

    /// Starts the host, waits for `signal`, then shuts down.
    ///
    /// # Errors
    ///
    /// Startup failures; nothing is running when this returns an error.
    pub async fn run_until<F>(mut self, signal: F) -> Result<(), HostError>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        signal.await;
        self.shutdown().await;
        Ok(())
    }

    /// Runs until Ctrl-C.
    ///
    /// # Errors
    ///
    /// Startup failures.
    pub async fn run(self) -> Result<(), HostError> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "failed to listen for ctrl-c; shutting down");
            }
        })
        .await
    }

    fn wrap(&mut self, component: Arc<dyn HostedComponent>) -> Arc<dyn HostedComponent> {
        let (true, Some(lock_manager)) = (component.is_singleton(), &self.lock_manager) else {
            return component;
        };
        let coordinator = Arc::new(SingletonCoordinator::new(
            component,
            Arc::clone(lock_manager),
            self.config.singleton.clone(),
        ));
        self.coordinators.push(Arc::clone(&coordinator));
        coordinator
    }

    async fn stop_started(&mut self) {
        while let Some(component) = self.started.pop() {
            if let Err(err) = component.stop().await {
                warn!(component = component.name(), error = %err, "component failed to stop cleanly");
            }
        }
    }
}

impl std::fmt::Debug for MessageHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHost")
            .field("instance_id", &self.config.instance_id)
            .field("components", &self.components.len())
            .field("health", &self.health_state())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
