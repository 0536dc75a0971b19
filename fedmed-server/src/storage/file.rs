//! File-backed storage with bincode snapshots.
//!
//! Both backends keep their working set in memory and write a full snapshot
//! to disk after every mutation, so the ledger and version history survive a
//! coordinator restart. Snapshots are loaded once at startup.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::Context;
use async_trait::async_trait;
use tokio::fs;

use fedmed_core::{ArtifactRef, Model, ModelVersion};

use crate::{
    state_machine::round::RoundRecord,
    storage::{ModelStorage, RoundStorage, StorageResult, VersionOrder},
};

const ROUNDS_SNAPSHOT: &str = "rounds.bin";
const VERSIONS_SNAPSHOT: &str = "versions.bin";

/// Writes `bytes` through a temporary file and a rename, so an interrupted
/// write never clobbers the previous file at `path`.
async fn write_atomically(path: &Path, bytes: Vec<u8>) -> StorageResult<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("cannot write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("cannot move {} into place", tmp.display()))
}

/// A round ledger persisted as a bincode snapshot.
#[derive(Debug, Clone)]
pub struct FileRoundStorage {
    path: PathBuf,
    rounds: Arc<Mutex<BTreeMap<u64, RoundRecord>>>,
}

impl FileRoundStorage {
    /// Opens the ledger in `dir`, loading an existing snapshot if present.
    pub async fn open(dir: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("cannot create storage directory {}", dir.display()))?;
        let path = dir.join(ROUNDS_SNAPSHOT);

        let rounds = match fs::read(&path).await {
            Ok(bytes) => {
                let records: Vec<RoundRecord> = bincode::deserialize(&bytes)
                    .with_context(|| format!("corrupt round snapshot {}", path.display()))?;
                records
                    .into_iter()
                    .map(|record| (record.round_number, record))
                    .collect()
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("cannot read {}", path.display()))
            }
        };

        Ok(Self {
            path,
            rounds: Arc::new(Mutex::new(rounds)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, RoundRecord>> {
        self.rounds.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn persist(&self) -> StorageResult<()> {
        let bytes = {
            let rounds = self.lock();
            let records: Vec<&RoundRecord> = rounds.values().collect();
            bincode::serialize(&records).context("cannot serialize the round ledger")?
        };
        write_atomically(&self.path, bytes).await
    }
}

#[async_trait]
impl RoundStorage for FileRoundStorage {
    async fn last_round_number(&mut self) -> StorageResult<u64> {
        Ok(self.lock().keys().next_back().copied().unwrap_or(0))
    }

    async fn set_round(&mut self, record: &RoundRecord) -> StorageResult<()> {
        self.lock().insert(record.round_number, record.clone());
        self.persist().await
    }

    async fn round(&mut self, round_number: u64) -> StorageResult<Option<RoundRecord>> {
        Ok(self.lock().get(&round_number).cloned())
    }

    async fn rounds(&mut self) -> StorageResult<Vec<RoundRecord>> {
        Ok(self.lock().values().cloned().collect())
    }
}

/// A model store that writes one artifact file per round and keeps the
/// version history as a bincode snapshot.
#[derive(Debug, Clone)]
pub struct FileModelStorage {
    dir: PathBuf,
    versions_path: PathBuf,
    versions: Arc<Mutex<Vec<ModelVersion>>>,
}

impl FileModelStorage {
    /// Opens the model store in `dir`, loading an existing version history
    /// if present.
    pub async fn open(dir: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("cannot create storage directory {}", dir.display()))?;
        let versions_path = dir.join(VERSIONS_SNAPSHOT);

        let versions = match fs::read(&versions_path).await {
            Ok(bytes) => bincode::deserialize(&bytes)
                .with_context(|| format!("corrupt version snapshot {}", versions_path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("cannot read {}", versions_path.display()))
            }
        };

        Ok(Self {
            dir,
            versions_path,
            versions: Arc::new(Mutex::new(versions)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ModelVersion>> {
        self.versions.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn persist(&self) -> StorageResult<()> {
        let bytes = {
            let versions = self.lock();
            bincode::serialize(&*versions).context("cannot serialize the version history")?
        };
        write_atomically(&self.versions_path, bytes).await
    }
}

#[async_trait]
impl ModelStorage for FileModelStorage {
    async fn set_global_model(
        &mut self,
        round_number: u64,
        model: &Model,
    ) -> StorageResult<ArtifactRef> {
        let name = format!("global-model-{}.bin", round_number);
        let bytes = bincode::serialize(model).context("cannot serialize the global model")?;
        write_atomically(&self.dir.join(&name), bytes)
            .await
            .with_context(|| format!("cannot write the model artifact {}", name))?;
        Ok(ArtifactRef::new(name))
    }

    async fn global_model(&mut self, artifact: &ArtifactRef) -> StorageResult<Option<Model>> {
        match fs::read(self.dir.join(artifact.as_str())).await {
            Ok(bytes) => {
                let model = bincode::deserialize(&bytes)
                    .with_context(|| format!("corrupt model artifact {}", artifact))?;
                Ok(Some(model))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("cannot read {}", artifact)),
        }
    }

    async fn record_version(&mut self, version: &ModelVersion) -> StorageResult<()> {
        self.lock().push(version.clone());
        self.persist().await
    }

    async fn latest_version(&mut self) -> StorageResult<Option<ModelVersion>> {
        Ok(self
            .lock()
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
    use crate::state_machine::round::{RoundFailure, RoundState};

    fn scratch_dir(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("fedmed-{}-{}-{}", name, std::process::id(), nanos))
    }

    #[tokio::test]
    async fn round_ledger_survives_reopening() {
        let dir = scratch_dir("rounds");
        {
            let mut storage = FileRoundStorage::open(&dir).await.unwrap();
            let mut record = RoundRecord::open(1, 2, 60, vec!["a".into()]);
            record.state = RoundState::Failed(RoundFailure::NoQuorum);
            storage.set_round(&record).await.unwrap();
        }

        let mut reopened = FileRoundStorage::open(&dir).await.unwrap();
        assert_eq!(reopened.last_round_number().await.unwrap(), 1);
        let record = reopened.round(1).await.unwrap().unwrap();
        assert_eq!(record.state, RoundState::Failed(RoundFailure::NoQuorum));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn a_torn_snapshot_write_does_not_clobber_the_ledger() {
        let dir = scratch_dir("atomic");
        {
            let mut storage = FileRoundStorage::open(&dir).await.unwrap();
            let record = RoundRecord::open(1, 2, 60, vec!["a".into()]);
            storage.set_round(&record).await.unwrap();
        }

        // a crash mid-write leaves garbage next to the snapshot, never in it
        std::fs::write(dir.join("rounds.tmp"), b"torn").unwrap();

        let mut reopened = FileRoundStorage::open(&dir).await.unwrap();
        assert_eq!(reopened.last_round_number().await.unwrap(), 1);

        let record = RoundRecord::open(2, 2, 60, vec!["a".into()]);
        reopened.set_round(&record).await.unwrap();
        let mut again = FileRoundStorage::open(&dir).await.unwrap();
        assert_eq!(again.rounds().await.unwrap().len(), 2);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn model_artifacts_and_versions_survive_reopening() {
        let dir = scratch_dir("models");
        let model = Model::from_weights(vec![0.5, -0.5]);
        let artifact = {
            let mut storage = FileModelStorage::open(&dir).await.unwrap();
            let artifact = storage.set_global_model(1, &model).await.unwrap();
            storage
                .record_version(&ModelVersion {
                    version_number: 1,
                    artifact_ref: artifact.clone(),
                    avg_accuracy: 0.9,
                    avg_loss: 0.1,
                    num_clients: 3,
                    created_at: Utc::now(),
                    description: "first round".to_string(),
                })
                .await
                .unwrap();
            artifact
        };

        let mut reopened = FileModelStorage::open(&dir).await.unwrap();
        let latest = reopened.latest_version().await.unwrap().unwrap();
        assert_eq!(latest.version_number, 1);
        assert_eq!(latest.artifact_ref, artifact);
        assert_eq!(
            reopened.global_model(&artifact).await.unwrap(),
            Some(model)
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
