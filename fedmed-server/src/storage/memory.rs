//! In-memory storage backends for tests and single-process demos.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;

use fedmed_core::{ArtifactRef, Model, ModelVersion};

use crate::{
    state_machine::round::RoundRecord,
    storage::{ModelStorage, RoundStorage, StorageResult, VersionOrder},
};

/// An in-memory round ledger. Nothing survives a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryRoundStorage {
    rounds: Arc<Mutex<BTreeMap<u64, RoundRecord>>>,
}

impl MemoryRoundStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, RoundRecord>> {
        self.rounds.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RoundStorage for MemoryRoundStorage {
    async fn last_round_number(&mut self) -> StorageResult<u64> {
        Ok(self.lock().keys().next_back().copied().unwrap_or(0))
    }

    async fn set_round(&mut self, record: &RoundRecord) -> StorageResult<()> {
        self.lock().insert(record.round_number, record.clone());
        Ok(())
    }

    async fn round(&mut self, round_number: u64) -> StorageResult<Option<RoundRecord>> {
        Ok(self.lock().get(&round_number).cloned())
    }

    async fn rounds(&mut self) -> StorageResult<Vec<RoundRecord>> {
        Ok(self.lock().values().cloned().collect())
    }
}

#[derive(Debug, Default)]
struct MemoryModels {
    artifacts: HashMap<ArtifactRef, Model>,
    versions: Vec<ModelVersion>,
}

/// An in-memory model artifact store and version history.
#[derive(Debug, Clone, Default)]
pub struct MemoryModelStorage {
    inner: Arc<Mutex<MemoryModels>>,
}

impl MemoryModelStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryModels> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ModelStorage for MemoryModelStorage {
    async fn set_global_model(
        &mut self,
        round_number: u64,
        model: &Model,
    ) -> StorageResult<ArtifactRef> {
        let artifact = ArtifactRef::new(format!("memory://global-model/{}", round_number));
        self.lock().artifacts.insert(artifact.clone(), model.clone());
        Ok(artifact)
    }

    async fn global_model(&mut self, artifact: &ArtifactRef) -> StorageResult<Option<Model>> {
        Ok(self.lock().artifacts.get(artifact).cloned())
    }

    async fn record_version(&mut self, version: &ModelVersion) -> StorageResult<()> {
        self.lock().versions.push(version.clone());
        Ok(())
    }

    async fn latest_version(&mut self) -> StorageResult<Option<ModelVersion>> {
        Ok(self
            .lock()
            .versions
            .iter()
            .max_by_key(|version| version.version_number)
            .cloned())
    }

    async fn list_versions(
        &mut self,
        order: VersionOrder,
        min_accuracy: Option<f32>,
    ) -> StorageResult<Vec<ModelVersion>> {
        let mut versions: Vec<ModelVersion> = self
            .lock()
            .versions
            .iter()
            .filter(|version| min_accuracy.map_or(true, |min| version.avg_accuracy >= min))
            .cloned()
            .collect();
        versions.sort_by_key(|version| version.version_number);
        if order == VersionOrder::Descending {
            versions.reverse();
        }
        Ok(versions)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::state_machine::round::RoundState;

    fn version(number: u64, accuracy: f32) -> ModelVersion {
        ModelVersion {
            version_number: number,
            artifact_ref: ArtifactRef::new(format!("memory://global-model/{}", number)),
            avg_accuracy: accuracy,
            avg_loss: 1.0 - accuracy,
            num_clients: 3,
            created_at: Utc::now(),
            description: String::new(),
        }
    }

    #[tokio::test]
    async fn last_round_number_tracks_the_highest_round() {
        let mut storage = MemoryRoundStorage::new();
        assert_eq!(storage.last_round_number().await.unwrap(), 0);

        storage
            .set_round(&RoundRecord::open(3, 2, 60, vec![]))
            .await
            .unwrap();
        storage
            .set_round(&RoundRecord::open(1, 2, 60, vec![]))
            .await
            .unwrap();
        assert_eq!(storage.last_round_number().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn set_round_replaces_an_existing_record() {
        let mut storage = MemoryRoundStorage::new();
        let mut record = RoundRecord::open(1, 2, 60, vec![]);
        storage.set_round(&record).await.unwrap();

        record.state = RoundState::Collecting;
        storage.set_round(&record).await.unwrap();

        let stored = storage.round(1).await.unwrap().unwrap();
        assert_eq!(stored.state, RoundState::Collecting);
        assert_eq!(storage.rounds().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn latest_version_is_idempotent() {
        let mut storage = MemoryModelStorage::new();
        assert!(storage.latest_version().await.unwrap().is_none());

        storage.record_version(&version(1, 0.8)).await.unwrap();
        storage.record_version(&version(2, 0.9)).await.unwrap();

        let first = storage.latest_version().await.unwrap().unwrap();
        let second = storage.latest_version().await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.version_number, 2);
    }

    #[tokio::test]
    async fn list_versions_orders_and_filters() {
        let mut storage = MemoryModelStorage::new();
        for (number, accuracy) in [(1, 0.7), (2, 0.9), (3, 0.8)] {
            storage.record_version(&version(number, accuracy)).await.unwrap();
        }

        let descending = storage
            .list_versions(VersionOrder::Descending, None)
            .await
            .unwrap();
        let numbers: Vec<u64> = descending.iter().map(|v| v.version_number).collect();
        assert_eq!(numbers, vec![3, 2, 1]);

        let accurate = storage
            .list_versions(VersionOrder::Ascending, Some(0.75))
            .await
            .unwrap();
        let numbers: Vec<u64> = accurate.iter().map(|v| v.version_number).collect();
        assert_eq!(numbers, vec![2, 3]);
    }

    #[tokio::test]
    async fn stored_model_is_retrievable_by_artifact() {
        let mut storage = MemoryModelStorage::new();
        let model = Model::from_weights(vec![1.0, 2.0]);
        let artifact = storage.set_global_model(5, &model).await.unwrap();
        assert_eq!(storage.global_model(&artifact).await.unwrap(), Some(model));
        assert!(storage
            .global_model(&ArtifactRef::new("memory://global-model/99"))
            .await
            .unwrap()
            .is_none());
    }
}
