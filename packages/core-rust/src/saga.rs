//! Conflict-aware store contract for long-running workflow state.
//!
//! A saga record is keyed by `(partition_key, id)` and carries an opaque
//! state payload plus a version used for optimistic concurrency. Backends
//! must provide atomic create and compare-and-swap update.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::serializer::{Serializer, SerializerError};

// ---------------------------------------------------------------------------
// Keys and records
// ---------------------------------------------------------------------------

/// Identity of one workflow instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SagaKey {
    pub partition_key: String,
    pub id: String,
}

impl SagaKey {
    /// Create a key from its partition key and workflow id.
    #[must_use]
    pub fn new(partition_key: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for SagaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.partition_key, self.id)
    }
}

/// Stored workflow state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaRecord {
    pub key: SagaKey,
    /// Serialized state payload.
    pub state: Vec<u8>,
    /// Concurrency token. Starts at 1 on create and increases by one on every
    /// successful update.
    pub version: u64,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Domain conflicts detected by the store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SagaConflict {
    /// `create` found an existing record: someone already started this saga.
    #[error("saga {key} already exists")]
    AlreadyExists { key: SagaKey },
    /// `update` carried a stale concurrency token.
    #[error("saga {key} is at version {actual}, expected {expected}")]
    VersionMismatch {
        key: SagaKey,
        expected: u64,
        actual: u64,
    },
}

/// Errors returned by [`SagaStore`] operations.
///
/// Conflicts and missing records are domain outcomes; [`SagaError::Storage`]
/// is reserved for an unreachable or failing backend.
#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    #[error(transparent)]
    Conflict(#[from] SagaConflict),
    #[error("saga {key} not found")]
    NotFound { key: SagaKey },
    #[error("saga state could not be encoded or decoded: {0}")]
    Serialization(#[from] SerializerError),
    #[error("saga store unavailable: {0:#}")]
    Storage(#[source] anyhow::Error),
}

impl SagaError {
    /// Returns `true` for domain conflicts (already exists, version mismatch).
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Returns `true` if the record does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` if the backend itself failed.
    #[must_use]
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

// ---------------------------------------------------------------------------
// SagaStore
// ---------------------------------------------------------------------------

/// Backend contract for saga persistence.
#[async_trait]
pub trait SagaStore: Send + Sync + 'static {
    /// Creates a record at version 1.
    ///
    /// Fails with [`SagaConflict::AlreadyExists`] if the key is taken; an
    /// existing record is never overwritten.
    async fn create(&self, key: &SagaKey, state: Vec<u8>) -> Result<SagaRecord, SagaError>;

    /// Loads a record, failing with [`SagaError::NotFound`] if absent.
    async fn get(&self, key: &SagaKey) -> Result<SagaRecord, SagaError>;

    /// Replaces the state if the stored version equals `expected_version`,
    /// returning the record at its new version.
    ///
    /// Fails with [`SagaError::NotFound`] if absent and with
    /// [`SagaConflict::VersionMismatch`] on a stale token.
    async fn update(
        &self,
        key: &SagaKey,
        state: Vec<u8>,
        expected_version: u64,
    ) -> Result<SagaRecord, SagaError>;

    /// Removes a record. Deleting a missing record succeeds.
    async fn delete(&self, key: &SagaKey) -> Result<(), SagaError>;
}

// ---------------------------------------------------------------------------
// TypedSagaStore
// ---------------------------------------------------------------------------

/// Decoded saga state together with its concurrency token.
#[derive(Debug, Clone, PartialEq)]
pub struct Saga<T> {
    pub key: SagaKey,
    pub state: T,
    pub version: u64,
}

/// Typed view over a byte-level [`SagaStore`].
pub struct TypedSagaStore<T, S> {
    store: Arc<dyn SagaStore>,
    serializer: S,
    _state: PhantomData<fn() -> T>,
}

impl<T, S> TypedSagaStore<T, S>
where
    T: Serialize + DeserializeOwned + Send,
    S: Serializer,
{
    /// Create a typed view over `store` that encodes state with `serializer`.
    #[must_use]
    pub fn new(store: Arc<dyn SagaStore>, serializer: S) -> Self {
        Self {
            store,
            serializer,
            _state: PhantomData,
        }
    }

    /// Starts a new saga.
    ///
    /// # Errors
    ///
    /// Propagates [`SagaStore::create`] errors and encoding failures.
    pub async fn start(&self, key: &SagaKey, state: T) -> Result<Saga<T>, SagaError> {
        let bytes = self.serializer.serialize(&state)?;
        let record = self.store.create(key, bytes).await?;
        Ok(Saga {
            key: record.key,
            state,
            version: record.version,
        })
    }

    /// Loads and decodes a saga.
    ///
    /// # Errors
    ///
    /// Propagates [`SagaStore::get`] errors and decoding failures.
    pub async fn load(&self, key: &SagaKey) -> Result<Saga<T>, SagaError> {
        let record = self.store.get(key).await?;
        let state = self.serializer.deserialize(&record.state)?;
        Ok(Saga {
            key: record.key,
            state,
            version: record.version,
        })
    }

    /// Writes back a previously loaded saga, guarded by its version.
    ///
    /// On success `saga.version` is advanced to the stored version.
    ///
    /// # Errors
    ///
    /// Propagates [`SagaStore::update`] errors and encoding failures.
    pub async fn save(&self, saga: &mut Saga<T>) -> Result<(), SagaError> {
        let bytes = self.serializer.serialize(&saga.state)?;
        let record = self.store.update(&saga.key, bytes, saga.version).await?;
        saga.version = record.version;
        Ok(())
    }

    /// Removes a finished saga.
    ///
    /// # Errors
    ///
    /// Propagates [`SagaStore::delete`] errors.
    pub async fn finish(&self, key: &SagaKey) -> Result<(), SagaError> {
        self.store.delete(key).await
    }
}
