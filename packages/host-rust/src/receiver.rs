//! Channel receiver: pumps one transport source through the message pipeline.
//!
//! The receive loop pulls batches sized to the free in-flight capacity
//! (`max_concurrent_calls + prefetch_count`), decodes each body, and spawns
//! one pipeline attempt per message. Bodies that fail to decode are
//! dead-lettered on the spot since no redelivery can fix them. Transport
//! receive failures are logged and retried after a backoff; nothing a single
//! message does can end the loop.

use std::any::type_name;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use conveyor_core::{
    JsonSerializer, ProcessingSettings, ReceivedMessage, Serializer, SerializerError,
    SettingsError, Transport, TransportError,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use crate::config::ReceiverConfig;
use crate::context::{body_preview, MessageContext};
use crate::gate::ConcurrencyGate;
use crate::host::{BackgroundTask, HostedComponent};
use crate::middleware::{build_message_pipeline, MessageService, Stage};
use crate::registry::ProcessorRegistry;
use crate::shutdown::ShutdownController;

/// Wiring defects detected when a receiver is built.
#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error("receiver {receiver} has no processor registry")]
    MissingRegistry { receiver: String },
    #[error("receiver {receiver}: no processor registered for {message_type}")]
    ProcessorNotRegistered {
        receiver: String,
        message_type: &'static str,
    },
    #[error("receiver {receiver}: {source}")]
    InvalidSettings {
        receiver: String,
        #[source]
        source: SettingsError,
    },
    #[error("receiver {receiver}: {reason}")]
    InvalidConfig { receiver: String, reason: String },
}

// ---------------------------------------------------------------------------
// ChannelReceiverBuilder
// ---------------------------------------------------------------------------

/// Builder for [`ChannelReceiver`]; see [`ChannelReceiver::builder`].
pub struct ChannelReceiverBuilder<T, S = JsonSerializer> {
    name: String,
    transport: Arc<dyn Transport>,
    registry: Option<Arc<ProcessorRegistry>>,
    settings: ProcessingSettings,
    config: ReceiverConfig,
    serializer: S,
    stages: Vec<Box<dyn Stage<T>>>,
    shutdown: Option<ShutdownController>,
}

impl<T, S> ChannelReceiverBuilder<T, S>
where
    T: DeserializeOwned + Send + Sync + 'static,
    S: Serializer,
{
    /// Sets the registry that resolves the processor for `T`. Required.
    #[must_use]
    pub fn registry(mut self, registry: Arc<ProcessorRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replaces the default processing settings.
    #[must_use]
    pub fn settings(mut self, settings: ProcessingSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replaces the default receive-loop timings.
    #[must_use]
    pub fn config(mut self, config: ReceiverConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds a custom stage. Custom stages run inside the built-in stages, in
    /// the order they are added.
    #[must_use]
    pub fn stage(mut self, stage: impl Stage<T>) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Tracks in-flight attempts on `controller` so host shutdown can wait
    /// for them.
    #[must_use]
    pub fn shutdown(mut self, controller: ShutdownController) -> Self {
        self.shutdown = Some(controller);
        self
    }

    /// Decodes bodies with `serializer` instead of JSON.
    #[must_use]
    pub fn serializer<S2: Serializer>(self, serializer: S2) -> ChannelReceiverBuilder<T, S2> {
        ChannelReceiverBuilder {
            name: self.name,
            transport: self.transport,
            registry: self.registry,
            settings: self.settings,
            config: self.config,
            serializer,
            stages: self.stages,
            shutdown: self.shutdown,
        }
    }

    /// Validates wiring and composes the pipeline.
    ///
    /// A processor registered as singleton forces single-message settings
    /// (`max_concurrent_calls = 1`, `prefetch_count = 0`).
    ///
    /// # Errors
    ///
    /// [`ReceiverError`] when the registry is missing, nothing is registered
    /// for `T`, or the settings/config are invalid.
    pub fn build(self) -> Result<ChannelReceiver<T, S>, ReceiverError> {
        let receiver = self.name;
        let Some(registry) = self.registry else {
            return Err(ReceiverError::MissingRegistry { receiver });
        };
        let Some(options) = registry.options::<T>() else {
            return Err(ReceiverError::ProcessorNotRegistered {
                receiver,
                message_type: type_name::<T>(),
            });
        };
        if let Err(source) = self.settings.validate() {
            return Err(ReceiverError::InvalidSettings { receiver, source });
        }
        if let Err(reason) = self.config.validate() {
            return Err(ReceiverError::InvalidConfig { receiver, reason });
        }

        let settings = if options.singleton {
            self.settings.for_singleton()
        } else {
            self.settings
        };
        let gate = Arc::new(ConcurrencyGate::new(settings.max_concurrent_calls));
        let pipeline = build_message_pipeline(Arc::clone(&registry), Arc::clone(&gate), self.stages);

        Ok(ChannelReceiver {
            shared: Arc::new(Shared {
                name: Arc::from(receiver),
                processor: options.name,
                singleton: options.singleton,
                transport: self.transport,
                registry,
                serializer: self.serializer,
                settings,
                config: self.config,
                gate,
                shutdown: self.shutdown,
                _message: PhantomData,
            }),
            pipeline: Mutex::new(pipeline),
            running: Mutex::new(None),
        })
    }
}

// ---------------------------------------------------------------------------
// ChannelReceiver
// ---------------------------------------------------------------------------

/// Receives messages of type `T` from one transport and processes them with
/// the processor registered for `T`.
pub struct ChannelReceiver<T, S = JsonSerializer> {
    shared: Arc<Shared<T, S>>,
    pipeline: Mutex<MessageService<T>>,
    running: Mutex<Option<BackgroundTask>>,
}

struct Shared<T, S> {
    name: Arc<str>,
    processor: &'static str,
    singleton: bool,
    transport: Arc<dyn Transport>,
    registry: Arc<ProcessorRegistry>,
    serializer: S,
    settings: ProcessingSettings,
    config: ReceiverConfig,
    gate: Arc<ConcurrencyGate>,
    shutdown: Option<ShutdownController>,
    _message: PhantomData<fn() -> T>,
}

impl<T> ChannelReceiver<T, JsonSerializer>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    /// Starts a builder with default settings and the JSON serializer.
    #[must_use]
    pub fn builder(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> ChannelReceiverBuilder<T, JsonSerializer> {
        ChannelReceiverBuilder {
            name: name.into(),
            transport,
            registry: None,
            settings: ProcessingSettings::default(),
            config: ReceiverConfig::default(),
            serializer: JsonSerializer,
            stages: Vec::new(),
            shutdown: None,
        }
    }
}

impl<T, S> ChannelReceiver<T, S> {
    /// Effective settings after singleton adjustment.
    #[must_use]
    pub fn settings(&self) -> &ProcessingSettings {
        &self.shared.settings
    }

    /// The receiver's concurrency gate.
    #[must_use]
    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.shared.gate
    }

    /// Returns `true` between `start` and `stop`.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

#[async_trait]
impl<T, S> HostedComponent for ChannelReceiver<T, S>
where
    T: DeserializeOwned + Send + Sync + 'static,
    S: Serializer,
{
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn lock_id(&self) -> String {
        self.shared.processor.to_owned()
    }

    fn is_singleton(&self) -> bool {
        self.shared.singleton
    }

    async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            anyhow::bail!("receiver {} is already started", self.shared.name);
        }
        let shared = Arc::clone(&self.shared);
        let pipeline = self.pipeline.lock().clone();
        *running = Some(BackgroundTask::spawn(&cancel, |token| {
            shared.receive_loop(pipeline, token)
        }));
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let Some(task) = self.running.lock().take() else {
            return Ok(());
        };
        task.stop()
            .await
            .map_err(|err| anyhow::anyhow!("receiver {} loop failed: {err}", self.shared.name))
    }
}

impl<T, S> std::fmt::Debug for ChannelReceiver<T, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelReceiver")
            .field("name", &self.shared.name)
            .field("processor", &self.shared.processor)
            .field("transport", &self.shared.transport.name())
            .field("settings", &self.shared.settings)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Receive loop
// ---------------------------------------------------------------------------

impl<T, S> Shared<T, S>
where
    T: DeserializeOwned + Send + Sync + 'static,
    S: Serializer,
{
    async fn receive_loop(self: Arc<Self>, pipeline: MessageService<T>, cancel: CancellationToken) {
        let capacity = self.settings.in_flight_capacity();
        info!(
            receiver = %self.name,
            transport = self.transport.name(),
            processor = self.processor,
            max_concurrent_calls = self.settings.max_concurrent_calls,
            prefetch_count = self.settings.prefetch_count,
            "receive loop started"
        );

        let mut in_flight = JoinSet::new();
        loop {
            while let Some(joined) = in_flight.try_join_next() {
                self.reap(joined);
            }

            let room = capacity.saturating_sub(in_flight.len());
            if room == 0 {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    Some(joined) = in_flight.join_next() => self.reap(joined),
                }
                continue;
            }

            let received = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                received = self.transport.receive(
                    room,
                    self.config.receive_wait,
                    self.settings.lock_timeout,
                ) => received,
            };

            match received {
                Ok(batch) => {
                    for message in batch {
                        match self.decode(&message) {
                            Ok(payload) => {
                                self.dispatch(message, payload, &pipeline, &cancel, &mut in_flight);
                            }
                            Err(err) => self.reject(&message, &err).await,
                        }
                    }
                }
                Err(TransportError::Closed) => {
                    warn!(receiver = %self.name, "transport closed; receive loop ending");
                    break;
                }
                Err(err) => {
                    warn!(
                        receiver = %self.name,
                        error = %err,
                        backoff = ?self.config.receive_error_backoff,
                        "receive failed; retrying"
                    );
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(self.config.receive_error_backoff) => {}
                    }
                }
            }
        }

        debug!(receiver = %self.name, in_flight = in_flight.len(), "draining in-flight attempts");
        while let Some(joined) = in_flight.join_next().await {
            self.reap(joined);
        }
        info!(receiver = %self.name, "receive loop stopped");
    }

    /// Spawns one pipeline attempt for a decoded message.
    fn dispatch(
        &self,
        message: ReceivedMessage,
        payload: T,
        pipeline: &MessageService<T>,
        cancel: &CancellationToken,
        in_flight: &mut JoinSet<()>,
    ) {
        let ctx = MessageContext::new(
            Arc::clone(&self.name),
            message,
            payload,
            self.settings.dead_letter_delivery_limit,
            self.registry.create_scope(),
            cancel.child_token(),
            Arc::clone(&self.transport),
        );
        let guard = self.shutdown.as_ref().map(ShutdownController::in_flight_guard);
        let service = pipeline.clone();
        in_flight.spawn(async move {
            let _guard = guard;
            if let Err(err) = service.oneshot(ctx).await {
                error!(error = %err, "pipeline returned an unhandled error");
            }
        });
    }

    fn decode(&self, message: &ReceivedMessage) -> Result<T, SerializerError> {
        self.serializer
            .check_content_type(message.content_type.as_deref())?;
        self.serializer.deserialize(&message.body)
    }

    /// Dead-letters a message whose body cannot be decoded.
    async fn reject(&self, message: &ReceivedMessage, err: &SerializerError) {
        error!(
            receiver = %self.name,
            message_id = %message.message_id,
            error = %err,
            body = %body_preview(&message.body),
            "undecodable message; dead-lettering"
        );
        metrics::counter!("conveyor_dead_lettered_total", "receiver" => self.name.to_string())
            .increment(1);
        let reason = format!("deserialization failed: {err}");
        if let Err(settle_err) = self
            .transport
            .dead_letter(&message.lock_token, &reason)
            .await
        {
            error!(
                receiver = %self.name,
                message_id = %message.message_id,
                error = %settle_err,
                "failed to dead-letter undecodable message"
            );
        }
    }

    fn reap(&self, joined: Result<(), JoinError>) {
        if let Err(err) = joined {
            error!(receiver = %self.name, error = %err, "processing task failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use bytes::Bytes;
    use parking_lot::Mutex as PlMutex;
    use serde::{Deserialize, Serialize};
    use tokio::sync::Semaphore;

    use super::*;
    use crate::processor::Processor;
    use crate::registry::ProcessorOptions;
    use crate::transport::{InMemoryTransport, OutgoingMessage};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Order {
        id: u32,
    }

    /// Fails order 1, records every other id.
    struct Fulfil {
        seen: Arc<PlMutex<Vec<u32>>>,
    }

    #[async_trait]
    impl Processor<Order> for Fulfil {
        async fn process(&self, ctx: &mut MessageContext<Order>) -> anyhow::Result<()> {
            let id = ctx.payload().id;
            if id == 1 {
                anyhow::bail!("order {id} is missing a shipping address");
            }
            self.seen.lock().push(id);
            Ok(())
        }
    }

    /// Blocks until the test hands out permits.
    struct Blocking {
        release: Arc<Semaphore>,
        invoked: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Processor<Order> for Blocking {
        async fn process(&self, _ctx: &mut MessageContext<Order>) -> anyhow::Result<()> {
            self.invoked.fetch_add(1, Ordering::SeqCst);
            let _permit = self.release.acquire().await?;
            Ok(())
        }
    }

    fn fast_config() -> ReceiverConfig {
        ReceiverConfig {
            receive_wait: Duration::from_millis(20),
            receive_error_backoff: Duration::from_millis(10),
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        let poll = async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), poll)
            .await
            .expect("condition not reached in time");
    }

    fn fulfil_registry(seen: &Arc<PlMutex<Vec<u32>>>) -> Arc<ProcessorRegistry> {
        let registry = ProcessorRegistry::new();
        let seen = Arc::clone(seen);
        registry.register::<Order, _, _>(ProcessorOptions::named("fulfil"), move |_| {
            Ok(Fulfil {
                seen: Arc::clone(&seen),
            })
        });
        Arc::new(registry)
    }

    fn send_orders(transport: &InMemoryTransport, ids: impl IntoIterator<Item = u32>) {
        for id in ids {
            transport.send(&JsonSerializer, &Order { id }).unwrap();
        }
    }

    #[tokio::test]
    async fn faulting_message_does_not_stop_the_loop() {
        let seen = Arc::default();
        let transport = Arc::new(InMemoryTransport::new("orders"));
        let receiver = ChannelReceiver::<Order>::builder("orders", transport.clone())
            .registry(fulfil_registry(&seen))
            .settings(ProcessingSettings {
                dead_letter_delivery_limit: 2,
                ..ProcessingSettings::default()
            })
            .config(fast_config())
            .build()
            .unwrap();

        send_orders(&transport, [1, 2, 3]);
        receiver.start(CancellationToken::new()).await.unwrap();

        // Order 1 is abandoned on deliveries 1 and 2, then quarantined on 3.
        eventually(|| transport.completed().len() == 2 && transport.dead_lettered().len() == 1)
            .await;
        let abandoned = transport.abandoned();
        assert_eq!(abandoned.len(), 2);
        assert!(abandoned
            .iter()
            .all(|m| m.reason.as_deref().unwrap().contains("missing a shipping address")));

        // The loop is still consuming.
        send_orders(&transport, [4]);
        eventually(|| transport.completed().len() == 3).await;

        receiver.stop().await.unwrap();
        let mut seen = seen.lock().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn undecodable_bodies_are_dead_lettered_without_processing() {
        let seen = Arc::default();
        let transport = Arc::new(InMemoryTransport::new("orders"));
        let receiver = ChannelReceiver::<Order>::builder("orders", transport.clone())
            .registry(fulfil_registry(&seen))
            .config(fast_config())
            .build()
            .unwrap();

        transport.send_message(
            OutgoingMessage::new(Bytes::from_static(b"{not json")).content_type("application/json"),
        );
        transport.send_message(
            OutgoingMessage::new(Bytes::from_static(b"{\"id\":9}"))
                .content_type("application/msgpack"),
        );
        receiver.start(CancellationToken::new()).await.unwrap();

        eventually(|| transport.dead_lettered().len() == 2).await;
        receiver.stop().await.unwrap();

        let reasons: Vec<_> = transport
            .dead_lettered()
            .into_iter()
            .filter_map(|m| m.reason)
            .collect();
        assert!(reasons.iter().all(|r| r.starts_with("deserialization failed")));
        assert!(seen.lock().is_empty());
        assert!(transport.abandoned().is_empty());
    }

    #[tokio::test]
    async fn receive_stops_pulling_at_in_flight_capacity() {
        let release = Arc::new(Semaphore::new(0));
        let invoked = Arc::new(AtomicU32::new(0));
        let registry = ProcessorRegistry::new();
        {
            let (release, invoked) = (Arc::clone(&release), Arc::clone(&invoked));
            registry.register::<Order, _, _>(ProcessorOptions::named("blocking"), move |_| {
                Ok(Blocking {
                    release: Arc::clone(&release),
                    invoked: Arc::clone(&invoked),
                })
            });
        }

        let transport = Arc::new(InMemoryTransport::new("orders"));
        let receiver = ChannelReceiver::<Order>::builder("orders", transport.clone())
            .registry(Arc::new(registry))
            .settings(ProcessingSettings {
                max_concurrent_calls: 2,
                prefetch_count: 1,
                ..ProcessingSettings::default()
            })
            .config(fast_config())
            .build()
            .unwrap();

        send_orders(&transport, 0..10);
        receiver.start(CancellationToken::new()).await.unwrap();

        eventually(|| invoked.load(Ordering::SeqCst) == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.in_flight(), 3);
        assert_eq!(transport.pending(), 7);
        assert_eq!(invoked.load(Ordering::SeqCst), 2);

        release.add_permits(100);
        eventually(|| transport.completed().len() == 10).await;
        receiver.stop().await.unwrap();
        assert_eq!(receiver.gate().available(), 2);
    }

    #[tokio::test]
    async fn receive_errors_back_off_and_recover() {
        let seen = Arc::default();
        let transport = Arc::new(InMemoryTransport::new("orders"));
        let receiver = ChannelReceiver::<Order>::builder("orders", transport.clone())
            .registry(fulfil_registry(&seen))
            .config(fast_config())
            .build()
            .unwrap();

        transport.fail_next_receives(3);
        send_orders(&transport, [5]);
        receiver.start(CancellationToken::new()).await.unwrap();

        eventually(|| transport.completed().len() == 1).await;
        receiver.stop().await.unwrap();
        assert_eq!(*seen.lock(), vec![5]);
    }

    #[tokio::test]
    async fn stop_abandons_attempts_waiting_for_a_slot() {
        let release = Arc::new(Semaphore::new(0));
        let invoked = Arc::new(AtomicU32::new(0));
        let registry = ProcessorRegistry::new();
        {
            let (release, invoked) = (Arc::clone(&release), Arc::clone(&invoked));
            registry.register::<Order, _, _>(ProcessorOptions::named("blocking"), move |_| {
                Ok(Blocking {
                    release: Arc::clone(&release),
                    invoked: Arc::clone(&invoked),
                })
            });
        }

        let transport = Arc::new(InMemoryTransport::new("orders"));
        let receiver = ChannelReceiver::<Order>::builder("orders", transport.clone())
            .registry(Arc::new(registry))
            .settings(ProcessingSettings {
                max_concurrent_calls: 1,
                prefetch_count: 2,
                ..ProcessingSettings::default()
            })
            .config(fast_config())
            .build()
            .unwrap();

        send_orders(&transport, 0..3);
        receiver.start(CancellationToken::new()).await.unwrap();
        eventually(|| invoked.load(Ordering::SeqCst) == 1 && transport.in_flight() == 3).await;

        // Let the running attempt finish once stop has cancelled the waiters.
        let stopping = receiver.stop();
        let releaser = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            release.add_permits(1);
        };
        let (stopped, ()) = tokio::join!(stopping, releaser);
        stopped.unwrap();

        assert_eq!(transport.completed().len(), 1);
        assert_eq!(transport.abandoned().len(), 2);
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        assert!(!receiver.is_running());
    }

    #[tokio::test]
    async fn singleton_processor_forces_single_message_settings() {
        let registry = ProcessorRegistry::new();
        registry.register::<Order, _, _>(ProcessorOptions::named("report").singleton(), |_| {
            Ok(Fulfil {
                seen: Arc::default(),
            })
        });
        let receiver = ChannelReceiver::<Order>::builder(
            "reports",
            Arc::new(InMemoryTransport::new("reports")),
        )
        .registry(Arc::new(registry))
        .settings(ProcessingSettings {
            max_concurrent_calls: 8,
            prefetch_count: 16,
            ..ProcessingSettings::default()
        })
        .build()
        .unwrap();

        assert!(receiver.is_singleton());
        assert_eq!(receiver.lock_id(), "report");
        assert_eq!(receiver.settings().max_concurrent_calls, 1);
        assert_eq!(receiver.settings().prefetch_count, 0);
        assert_eq!(receiver.gate().capacity(), 1);
    }

    #[test]
    fn unregistered_message_type_fails_build() {
        let err = ChannelReceiver::<Order>::builder("orders", Arc::new(InMemoryTransport::new("q")))
            .registry(Arc::new(ProcessorRegistry::new()))
            .build()
            .unwrap_err();
        assert!(matches!(err, ReceiverError::ProcessorNotRegistered { .. }));
    }

    #[test]
    fn missing_registry_fails_build() {
        let err = ChannelReceiver::<Order>::builder("orders", Arc::new(InMemoryTransport::new("q")))
            .build()
            .unwrap_err();
        assert!(matches!(err, ReceiverError::MissingRegistry { .. }));
    }

    #[test]
    fn invalid_settings_fail_build() {
        let seen = Arc::default();
        let err = ChannelReceiver::<Order>::builder("orders", Arc::new(InMemoryTransport::new("q")))
            .registry(fulfil_registry(&seen))
            .settings(ProcessingSettings {
                max_concurrent_calls: 0,
                ..ProcessingSettings::default()
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, ReceiverError::InvalidSettings { .. }));
    }

    /// Records delivery counts; the transport recovers once a redelivery
    /// arrives.
    struct RecoversOnRedelivery {
        transport: Arc<InMemoryTransport>,
        deliveries: Arc<PlMutex<Vec<u32>>>,
    }

    #[async_trait]
    impl Processor<Order> for RecoversOnRedelivery {
        async fn process(&self, ctx: &mut MessageContext<Order>) -> anyhow::Result<()> {
            self.deliveries.lock().push(ctx.delivery_count());
            if ctx.delivery_count() > 1 {
                self.transport.fail_settlements(false);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn unsettled_delivery_returns_after_lock_timeout() {
        let transport = Arc::new(InMemoryTransport::new("orders"));
        let deliveries: Arc<PlMutex<Vec<u32>>> = Arc::default();
        let registry = ProcessorRegistry::new();
        {
            let (transport, deliveries) = (Arc::clone(&transport), Arc::clone(&deliveries));
            registry.register::<Order, _, _>(ProcessorOptions::named("ledger"), move |_| {
                Ok(RecoversOnRedelivery {
                    transport: Arc::clone(&transport),
                    deliveries: Arc::clone(&deliveries),
                })
            });
        }
        let receiver = ChannelReceiver::<Order>::builder("orders", transport.clone())
            .registry(Arc::new(registry))
            .settings(ProcessingSettings {
                lock_timeout: Duration::from_millis(50),
                ..ProcessingSettings::default()
            })
            .config(fast_config())
            .build()
            .unwrap();

        // Completion and the fallback abandon both fail on the first delivery,
        // leaving the message locked until its lock expires.
        transport.fail_settlements(true);
        send_orders(&transport, [7]);
        receiver.start(CancellationToken::new()).await.unwrap();

        eventually(|| transport.completed().len() == 1).await;
        receiver.stop().await.unwrap();

        assert_eq!(*deliveries.lock(), vec![1, 2]);
        assert_eq!(transport.completed()[0].delivery_count, 2);
        assert!(transport.abandoned().is_empty());
        assert_eq!(transport.in_flight(), 0);
    }

    #[tokio::test]
    async fn receiver_restarts_after_stop() {
        let seen = Arc::default();
        let transport = Arc::new(InMemoryTransport::new("orders"));
        let receiver = ChannelReceiver::<Order>::builder("orders", transport.clone())
            .registry(fulfil_registry(&seen))
            .config(fast_config())
            .build()
            .unwrap();

        receiver.start(CancellationToken::new()).await.unwrap();
        receiver.stop().await.unwrap();
        receiver.start(CancellationToken::new()).await.unwrap();
        send_orders(&transport, [8]);
        eventually(|| transport.completed().len() == 1).await;
        receiver.stop().await.unwrap();
    }
}
