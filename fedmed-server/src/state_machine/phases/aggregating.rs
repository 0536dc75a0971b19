//! The aggregating phase.
//!
//! The accepted updates of the round are combined into a single ciphertext
//! as the sample-count-weighted homomorphic sum. Nothing is decrypted here;
//! any incompatibility between an accepted update and the aggregate fails
//! the round, which is never retried in place.

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::info;

use fedmed_core::Aggregation;

use crate::{
    state_machine::{
        phases::{Phase, PhaseName, PhaseState, PhaseStateError, Publishing, Shared},
        round::{AggregateResult, RoundFailure, RoundRecord, RoundState},
        StateMachine,
    },
    storage::{ModelStorage, RoundStorage, StorageError},
};

/// Error that occurs during the aggregating phase.
#[derive(Debug, Error)]
pub enum AggregatingStateError {
    #[error("persisting the aggregate failed: {0}")]
    PersistAggregate(StorageError),
}

/// Aggregating state.
#[derive(Debug)]
pub struct Aggregating {
    record: RoundRecord,
}

#[async_trait]
impl<R, M> Phase<R, M> for PhaseState<Aggregating, R, M>
where
    R: RoundStorage,
    M: ModelStorage,
{
    const NAME: PhaseName = PhaseName::Aggregating;

    /// Combines the accepted updates in the ciphertext domain.
    async fn run(&mut self) -> Result<(), PhaseStateError> {
        let round = self.private.record.round_number;
        let fail = |failure: RoundFailure| PhaseStateError::Round { round, failure };

        let mut aggregation =
            Aggregation::new(self.shared.state.cipher, self.shared.state.model_length);
        for update in self.private.record.accepted_updates() {
            aggregation
                .validate_aggregation(&update.ciphertext, update.sample_count)
                .map_err(|err| fail(RoundFailure::Aggregation(err.to_string())))?;
            aggregation.aggregate(update.ciphertext.clone(), update.sample_count);
        }
        let aggregate = aggregation
            .finish()
            .map_err(|err| fail(RoundFailure::Aggregation(err.to_string())))?;

        info!(
            round,
            contributors = aggregate.contributors,
            total_weight = aggregate.total_weight,
            "aggregated the round"
        );

        self.private.record.aggregate = Some(AggregateResult {
            round_number: round,
            ciphertext: aggregate,
            aggregated_at: Utc::now(),
        });
        self.private.record.state = RoundState::Publishing;
        self.shared
            .store
            .set_round(&self.private.record)
            .await
            .map_err(AggregatingStateError::PersistAggregate)?;

        Ok(())
    }

    fn next(self) -> Option<StateMachine<R, M>> {
        let Self { private, shared } = self;
        Some(PhaseState::<Publishing, _, _>::new(shared, private.record).into())
    }
}

impl<R, M> PhaseState<Aggregating, R, M>
where
    R: RoundStorage,
    M: ModelStorage,
{
    /// Creates a new aggregating state for the given ledger entry.
    pub fn new(shared: Shared<R, M>, record: RoundRecord) -> Self {
        Self {
            private: Aggregating { record },
            shared,
        }
    }
}
