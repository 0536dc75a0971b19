//! Storage API.

use async_trait::async_trait;

use fedmed_core::{ArtifactRef, Model, ModelVersion};

use crate::state_machine::round::RoundRecord;

/// The error type for storage operations that are not directly related to application domain.
/// These include, for example IO errors like broken pipe, file not found, out-of-memory, etc.
pub type StorageError = anyhow::Error;

/// The result of the storage operation.
pub type StorageResult<T> = Result<T, StorageError>;

/// The order in which model versions are listed.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum VersionOrder {
    /// Oldest version first.
    Ascending,
    /// Newest version first.
    Descending,
}

#[async_trait]
/// The append-only round ledger.
pub trait RoundStorage
where
    Self: Clone + Send + Sync + 'static,
{
    /// Returns the highest round number in the ledger.
    ///
    /// # Behavior
    ///
    /// - If no round has ever been opened, return `StorageResult::Ok(0)`.
    /// - Otherwise return the highest round number, regardless of whether
    ///   that round closed or failed.
    async fn last_round_number(&mut self) -> StorageResult<u64>;

    /// Writes a round record.
    ///
    /// # Behavior
    ///
    /// - If no record with this round number exists, insert it.
    /// - If a record exists, replace it. Callers only ever advance a
    ///   record's state, never rewind it.
    async fn set_round(&mut self, record: &RoundRecord) -> StorageResult<()>;

    /// Returns the record of the given round.
    ///
    /// # Behavior
    ///
    /// - If the round is unknown, return `StorageResult::Ok(Option::None)`.
    /// - Otherwise return `StorageResult::Ok(Some(RoundRecord))`.
    async fn round(&mut self, round_number: u64) -> StorageResult<Option<RoundRecord>>;

    /// Returns all round records, ordered by round number.
    async fn rounds(&mut self) -> StorageResult<Vec<RoundRecord>>;
}

#[async_trait]
/// The model artifact store and append-only version history.
pub trait ModelStorage
where
    Self: Clone + Send + Sync + 'static,
{
    /// Stores the global model produced by a round and returns the
    /// reference under which the artifact can be retrieved.
    async fn set_global_model(
        &mut self,
        round_number: u64,
        model: &Model,
    ) -> StorageResult<ArtifactRef>;

    /// Returns the model behind an artifact reference.
    ///
    /// # Behavior
    ///
    /// - If the reference is unknown, return `StorageResult::Ok(Option::None)`.
    /// - Otherwise return `StorageResult::Ok(Some(Model))`.
    async fn global_model(&mut self, artifact: &ArtifactRef) -> StorageResult<Option<Model>>;

    /// Appends a version to the history.
    ///
    /// The history is append-only: versions are never updated or deleted,
    /// and version numbers arrive strictly increasing.
    async fn record_version(&mut self, version: &ModelVersion) -> StorageResult<()>;

    /// Returns the newest version in the history.
    ///
    /// # Behavior
    ///
    /// - If no version has been recorded, return `StorageResult::Ok(Option::None)`.
    /// - Otherwise return the version with the highest version number.
    ///   Repeated calls without intervening writes return the same version.
    async fn latest_version(&mut self) -> StorageResult<Option<ModelVersion>>;

    /// Returns the version history in the given order, keeping only
    /// versions with at least `min_accuracy` average accuracy if a bound is
    /// given.
    async fn list_versions(
        &mut self,
        order: VersionOrder,
        min_accuracy: Option<f32>,
    ) -> StorageResult<Vec<ModelVersion>>;
}

/// A convenience wrapper that bundles the round ledger and the model store.
#[derive(Clone)]
pub struct Store<R, M>
where
    R: RoundStorage,
    M: ModelStorage,
{
    rounds: R,
    models: M,
}

impl<R, M> Store<R, M>
where
    R: RoundStorage,
    M: ModelStorage,
{
    /// Creates a [`Store`] from the given storage backends.
    pub fn new(rounds: R, models: M) -> Self {
        Self { rounds, models }
    }
}

#[async_trait]
impl<R, M> RoundStorage for Store<R, M>
where
    R: RoundStorage,
    M: ModelStorage,
{
    async fn last_round_number(&mut self) -> StorageResult<u64> {
        self.rounds.last_round_number().await
    }

    async fn set_round(&mut self, record: &RoundRecord) -> StorageResult<()> {
        self.rounds.set_round(record).await
    }

    async fn round(&mut self, round_number: u64) -> StorageResult<Option<RoundRecord>> {
        self.rounds.round(round_number).await
    }

    async fn rounds(&mut self) -> StorageResult<Vec<RoundRecord>> {
        self.rounds.rounds().await
    }
}

#[async_trait]
impl<R, M> ModelStorage for Store<R, M>
where
    R: RoundStorage,
    M: ModelStorage,
{
    async fn set_global_model(
        &mut self,
        round_number: u64,
        model: &Model,
    ) -> StorageResult<ArtifactRef> {
        self.models.set_global_model(round_number, model).await
    }

    async fn global_model(&mut self, artifact: &ArtifactRef) -> StorageResult<Option<Model>> {
        self.models.global_model(artifact).await
    }

    async fn record_version(&mut self, version: &ModelVersion) -> StorageResult<()> {
        self.models.record_version(version).await
    }

    async fn latest_version(&mut self) -> StorageResult<Option<ModelVersion>> {
        self.models.latest_version().await
    }

    async fn list_versions(
        &mut self,
        order: VersionOrder,
        min_accuracy: Option<f32>,
    ) -> StorageResult<Vec<ModelVersion>> {
        self.models.list_versions(order, min_accuracy).await
    }
}
