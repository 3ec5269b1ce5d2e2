//! Explicit processor registration and per-message dependency scopes.

use std::any::{type_name, Any, TypeId};
use std::sync::Arc;

use conveyor_core::ProcessingError;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::processor::Processor;

type AnyArc = Arc<dyn Any + Send + Sync>;

/// Factory producing a processor instance inside a per-message scope.
pub type ProcessorFactory<T> =
    dyn Fn(&ServiceScope) -> anyhow::Result<Box<dyn Processor<T>>> + Send + Sync;

// ---------------------------------------------------------------------------
// ProcessorOptions
// ---------------------------------------------------------------------------

/// Registration metadata for a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorOptions {
    /// Stable, human-readable processor name used in logs and lock ids.
    pub name: &'static str,
    /// Whether at most one fleet member may run this processor at a time.
    pub singleton: bool,
}

impl ProcessorOptions {
    /// Options for a regular (non-singleton) processor called `name`.
    #[must_use]
    pub fn named(name: &'static str) -> Self {
        Self {
            name,
            singleton: false,
        }
    }

    /// Marks the processor as fleet-wide singleton.
    #[must_use]
    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }
}

struct Registration<T> {
    options: ProcessorOptions,
    factory: Box<ProcessorFactory<T>>,
}

// ---------------------------------------------------------------------------
// ProcessorRegistry
// ---------------------------------------------------------------------------

/// Explicit processor registration and dependency resolution.
///
/// Two kinds of entries live here:
/// - **Processors**, keyed by message type: one factory per `T`.
/// - **Shared dependencies**, keyed by their own type, visible from every
///   scope (`provide`).
///
/// Every message gets a fresh [`ServiceScope`] so scoped dependencies and the
/// processor instance never outlive one attempt.
pub struct ProcessorRegistry {
    processors: DashMap<TypeId, AnyArc>,
    shared: Arc<DashMap<TypeId, AnyArc>>,
    /// Registration order, for diagnostics.
    order: RwLock<Vec<&'static str>>,
}

impl ProcessorRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            processors: DashMap::new(),
            shared: Arc::new(DashMap::new()),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Registers the processor for message type `T`, replacing any previous
    /// registration for the same type.
    pub fn register<T, P, F>(&self, options: ProcessorOptions, factory: F)
    where
        T: Send + Sync + 'static,
        P: Processor<T> + 'static,
        F: Fn(&ServiceScope) -> anyhow::Result<P> + Send + Sync + 'static,
    {
        let registration = Registration::<T> {
            options,
            factory: Box::new(move |scope: &ServiceScope| {
                factory(scope).map(|p| Box::new(p) as Box<dyn Processor<T>>)
            }),
        };
        self.processors
            .insert(TypeId::of::<T>(), Arc::new(registration) as AnyArc);
        self.order.write().push(options.name);
    }

    /// Makes `dependency` resolvable from every scope.
    pub fn provide<D: Send + Sync + 'static>(&self, dependency: D) {
        self.provide_arc(Arc::new(dependency));
    }

    /// Like [`provide`](Self::provide) for a dependency that is already shared.
    pub fn provide_arc<D: Send + Sync + 'static>(&self, dependency: Arc<D>) {
        self.shared.insert(TypeId::of::<D>(), dependency as AnyArc);
    }

    /// Options the processor for `T` was registered with.
    #[must_use]
    pub fn options<T: Send + Sync + 'static>(&self) -> Option<ProcessorOptions> {
        self.registration::<T>().map(|r| r.options)
    }

    /// Returns `true` if a processor is registered for `T`.
    #[must_use]
    pub fn is_registered<T: Send + Sync + 'static>(&self) -> bool {
        self.processors.contains_key(&TypeId::of::<T>())
    }

    /// Names of all registered processors in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.order.read().clone()
    }

    /// Opens a new resolution scope for one message.
    #[must_use]
    pub fn create_scope(&self) -> ServiceScope {
        ServiceScope {
            shared: Arc::clone(&self.shared),
            scoped: DashMap::new(),
        }
    }

    /// Resolves a processor for `T` inside `scope`.
    ///
    /// # Errors
    ///
    /// [`ProcessingError::ProcessorNotFound`] if nothing is registered for
    /// `T`; [`ProcessingError::Processor`] if the factory fails.
    pub fn resolve<T: Send + Sync + 'static>(
        &self,
        scope: &ServiceScope,
    ) -> Result<Box<dyn Processor<T>>, ProcessingError> {
        let registration =
            self.registration::<T>()
                .ok_or(ProcessingError::ProcessorNotFound {
                    message_type: type_name::<T>(),
                })?;
        (registration.factory)(scope).map_err(ProcessingError::Processor)
    }

    fn registration<T: Send + Sync + 'static>(&self) -> Option<Arc<Registration<T>>> {
        self.processors
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.value().clone().downcast::<Registration<T>>().ok())
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// ServiceScope
// ---------------------------------------------------------------------------

/// Dependency resolution handle for a single message.
///
/// Lookups check scoped instances first, then the registry's shared ones.
pub struct ServiceScope {
    shared: Arc<DashMap<TypeId, AnyArc>>,
    scoped: DashMap<TypeId, AnyArc>,
}

impl ServiceScope {
    /// Resolves `D` from this scope, falling back to shared dependencies.
    #[must_use]
    pub fn get<D: Send + Sync + 'static>(&self) -> Option<Arc<D>> {
        let key = TypeId::of::<D>();
        self.scoped
            .get(&key)
            .map(|entry| entry.value().clone())
            .or_else(|| self.shared.get(&key).map(|entry| entry.value().clone()))
            .and_then(|any| any.downcast::<D>().ok())
    }

    /// Adds (or replaces) a scoped instance.
    pub fn insert<D: Send + Sync + 'static>(&self, value: D) -> Arc<D> {
        let value = Arc::new(value);
        self.scoped
            .insert(TypeId::of::<D>(), Arc::clone(&value) as AnyArc);
        value
    }

    /// Returns the scoped instance of `D`, creating it on first use.
    pub fn get_or_insert_with<D, F>(&self, make: F) -> Arc<D>
    where
        D: Send + Sync + 'static,
        F: FnOnce() -> D,
    {
        let existing = self
            .scoped
            .get(&TypeId::of::<D>())
            .and_then(|entry| entry.value().clone().downcast::<D>().ok());
        match existing {
            Some(value) => value,
            None => self.insert(make()),
        }
    }
}

impl std::fmt::Debug for ServiceScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceScope")
            .field("shared", &self.shared.len())
            .field("scoped", &self.scoped.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
