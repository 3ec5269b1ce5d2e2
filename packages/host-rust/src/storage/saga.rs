//! In-memory [`SagaStore`] backed by [`DashMap`].
//!
//! Create and compare-and-swap update run under the map's per-shard entry
//! lock, which makes both atomic with respect to concurrent callers.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use conveyor_core::{SagaConflict, SagaError, SagaKey, SagaRecord, SagaStore};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Process-local saga store with the same conflict semantics as a shared
/// backend.
#[derive(Debug, Default)]
pub struct InMemorySagaStore {
    records: DashMap<SagaKey, SagaRecord>,
    unavailable: AtomicBool,
}

impl InMemorySagaStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live saga records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if no saga is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Toggles a full store outage: every call fails with
    /// [`SagaError::Storage`] while set. Stored records are kept.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), SagaError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SagaError::Storage(anyhow::anyhow!("saga store unreachable")));
        }
        Ok(())
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn create(&self, key: &SagaKey, state: Vec<u8>) -> Result<SagaRecord, SagaError> {
        self.check_available()?;
        match self.records.entry(key.clone()) {
            Entry::Occupied(_) => Err(SagaConflict::AlreadyExists { key: key.clone() }.into()),
            Entry::Vacant(entry) => {
                let record = SagaRecord {
                    key: key.clone(),
                    state,
                    version: 1,
                };
                entry.insert(record.clone());
                Ok(record)
            }
        }
    }

    async fn get(&self, key: &SagaKey) -> Result<SagaRecord, SagaError> {
        self.check_available()?;
        self.records
            .get(key)
            .map(|record| record.clone())
            .ok_or_else(|| SagaError::NotFound { key: key.clone() })
    }

    async fn update(
        &self,
        key: &SagaKey,
        state: Vec<u8>,
        expected_version: u64,
    ) -> Result<SagaRecord, SagaError> {
        self.check_available()?;
        let mut record = self
            .records
            .get_mut(key)
            .ok_or_else(|| SagaError::NotFound { key: key.clone() })?;
        if record.version != expected_version {
            return Err(SagaConflict::VersionMismatch {
                key: key.clone(),
                expected: expected_version,
                actual: record.version,
            }
            .into());
        }
        record.state = state;
        record.version += 1;
        Ok(record.clone())
    }

    async fn delete(&self, key: &SagaKey) -> Result<(), SagaError> {
        self.check_available()?;
        self.records.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use conveyor_core::{JsonSerializer, TypedSagaStore};
    use serde::{Deserialize, Serialize};

    use super::*;

    fn key() -> SagaKey {
        SagaKey::new("tenant-a", "order-17")
    }

    #[tokio::test]
    async fn create_then_get_returns_version_one() {
        let store = InMemorySagaStore::new();
        store.create(&key(), b"new".to_vec()).await.unwrap();

        let record = store.get(&key()).await.unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.state, b"new");
    }

    #[tokio::test]
    async fn duplicate_create_conflicts_without_overwriting() {
        let store = InMemorySagaStore::new();
        store.create(&key(), b"first".to_vec()).await.unwrap();

        let err = store.create(&key(), b"second".to_vec()).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.get(&key()).await.unwrap().state, b"first");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_have_exactly_one_winner() {
        let store = Arc::new(InMemorySagaStore::new());
        let mut handles = Vec::new();
        for i in 0..16u8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move { store.create(&key(), vec![i]).await }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(err) => assert!(err.is_conflict()),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_on_same_version_have_one_winner() {
        let store = Arc::new(InMemorySagaStore::new());
        store.create(&key(), Vec::new()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16u8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move { store.update(&key(), vec![i], 1).await }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(record) => {
                    winners += 1;
                    assert_eq!(record.version, 2);
                }
                Err(err) => assert!(err.is_conflict()),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.get(&key()).await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn missing_records_are_not_found() {
        let store = InMemorySagaStore::new();
        assert!(store.get(&key()).await.unwrap_err().is_not_found());
        assert!(store
            .update(&key(), Vec::new(), 1)
            .await
            .unwrap_err()
            .is_not_found());
        // Delete is idempotent.
        store.delete(&key()).await.unwrap();
    }

    #[tokio::test]
    async fn typed_store_round_trips_workflow_state() {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        struct Shipping {
            packed: bool,
            carrier: Option<String>,
        }

        let store: Arc<dyn SagaStore> = Arc::new(InMemorySagaStore::new());
        let typed = TypedSagaStore::new(Arc::clone(&store), JsonSerializer);

        let mut saga = typed
            .start(
                &key(),
                Shipping {
                    packed: false,
                    carrier: None,
                },
            )
            .await
            .unwrap();
        saga.state.packed = true;
        saga.state.carrier = Some("ups".into());
        typed.save(&mut saga).await.unwrap();

        let loaded = typed.load(&key()).await.unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.state.carrier.as_deref(), Some("ups"));

        typed.finish(&key()).await.unwrap();
        assert!(store.get(&key()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn outage_is_reported_as_storage_failure_not_conflict() {
        let store = Arc::new(InMemorySagaStore::new());
        let typed = TypedSagaStore::new(Arc::clone(&store) as Arc<dyn SagaStore>, JsonSerializer);
        let mut saga = typed.start(&key(), 3_u32).await.unwrap();

        store.set_unavailable(true);
        saga.state = 4;
        let err = typed.save(&mut saga).await.unwrap_err();
        assert!(err.is_storage());
        assert!(!err.is_conflict());
        assert_eq!(saga.version, 1);

        let err = typed.start(&key(), 5).await.unwrap_err();
        assert!(err.is_storage());
        assert!(!err.is_conflict());

        store.set_unavailable(false);
        typed.save(&mut saga).await.unwrap();
        assert_eq!(typed.load(&key()).await.unwrap().state, 4);
    }
}
