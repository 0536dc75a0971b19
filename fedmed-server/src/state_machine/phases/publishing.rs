//! The publishing phase.
//!
//! The round's ciphertext aggregate is handed to the external decryption
//! authority, the resulting global model is stored as a new version, the
//! round is closed in the ledger, and the round metrics are shipped
//! fire-and-forget. A failure of the authority fails the round; a failure
//! of the metrics sink does not.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::info;

use fedmed_core::{ModelVersion, RoundMetrics};

use crate::{
    state_machine::{
        events::{ModelUpdate, RoundUpdate},
        phases::{Idle, Phase, PhaseName, PhaseState, PhaseStateError, Shared},
        round::{RoundFailure, RoundRecord, RoundState},
        StateMachine,
    },
    storage::{ModelStorage, RoundStorage, StorageError},
};

/// Error that occurs during the publishing phase.
#[derive(Debug, Error)]
pub enum PublishingStateError {
    #[error("no aggregate to publish")]
    MissingAggregate,
    #[error("storing the global model failed: {0}")]
    StoreModel(StorageError),
    #[error("recording the model version failed: {0}")]
    RecordVersion(StorageError),
    #[error("persisting the round ledger entry failed: {0}")]
    PersistRound(StorageError),
}

/// Publishing state.
#[derive(Debug)]
pub struct Publishing {
    record: RoundRecord,
}

#[async_trait]
impl<R, M> Phase<R, M> for PhaseState<Publishing, R, M>
where
    R: RoundStorage,
    M: ModelStorage,
{
    const NAME: PhaseName = PhaseName::Publishing;

    /// Decrypts the aggregate, records the new version and closes the round.
    async fn run(&mut self) -> Result<(), PhaseStateError> {
        let round = self.private.record.round_number;
        let aggregate = self
            .private
            .record
            .aggregate
            .clone()
            .ok_or(PublishingStateError::MissingAggregate)?;

        let evaluation = self
            .shared
            .authority
            .decrypt_aggregate(&aggregate.ciphertext)
            .await
            .map_err(|err| PhaseStateError::Round {
                round,
                failure: RoundFailure::Aggregation(format!("decryption authority: {:#}", err)),
            })?;

        let artifact_ref = self
            .shared
            .store
            .set_global_model(round, &evaluation.model)
            .await
            .map_err(PublishingStateError::StoreModel)?;

        let num_clients = aggregate.ciphertext.contributors;
        let version = ModelVersion {
            version_number: round,
            artifact_ref,
            avg_accuracy: evaluation.avg_accuracy,
            avg_loss: evaluation.avg_loss,
            num_clients,
            created_at: Utc::now(),
            description: format!("aggregate of {} institutions", num_clients),
        };
        self.shared
            .store
            .record_version(&version)
            .await
            .map_err(PublishingStateError::RecordVersion)?;

        self.private.record.state = RoundState::Closed;
        self.private.record.ended_at = Some(Utc::now());
        self.shared
            .store
            .set_round(&self.private.record)
            .await
            .map_err(PublishingStateError::PersistRound)?;

        self.shared.metrics.send(RoundMetrics {
            round_number: round,
            avg_accuracy: version.avg_accuracy,
            avg_loss: version.avg_loss,
            num_clients,
            timestamp: Utc::now(),
        });

        info!(round, version = version.version_number, "round closed");
        self.shared
            .events
            .broadcast_model(ModelUpdate::New(Arc::new(version)));
        self.shared.events.broadcast_round(RoundUpdate::Closed);

        Ok(())
    }

    fn next(self) -> Option<StateMachine<R, M>> {
        Some(PhaseState::<Idle, _, _>::new(self.shared).into())
    }
}

impl<R, M> PhaseState<Publishing, R, M>
where
    R: RoundStorage,
    M: ModelStorage,
{
    /// Creates a new publishing state for the given ledger entry.
    pub fn new(shared: Shared<R, M>, record: RoundRecord) -> Self {
        Self {
            private: Publishing { record },
            shared,
        }
    }
}
