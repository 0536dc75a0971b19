//! The failure phase.
//!
//! Any error that escapes a phase lands here. Round-fatal failures are
//! recorded in the ledger and broadcast before the machine returns to the
//! idle phase for a fresh round; a broken request channel shuts the machine
//! down instead. A round that failed is never resumed.

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{error, warn};

use crate::{
    state_machine::{
        events::RoundUpdate,
        phases::{
            AggregatingStateError,
            CollectingStateError,
            Idle,
            IdleStateError,
            Phase,
            PhaseName,
            PhaseState,
            PublishingStateError,
            Shared,
            Shutdown,
        },
        round::{RoundFailure, RoundState},
        fail_open_rounds,
        StateMachine,
    },
    storage::{ModelStorage, RoundStorage},
};

/// Error that can occur during the execution of the [`StateMachine`].
///
/// [`StateMachine`]: crate::state_machine::StateMachine
#[derive(Debug, Error)]
pub enum PhaseStateError {
    #[error("request channel error: {0}")]
    RequestChannel(&'static str),

    #[error("round {round} failed: {failure}")]
    Round { round: u64, failure: RoundFailure },

    #[error("idle phase failed: {0}")]
    Idle(#[from] IdleStateError),

    #[error("collecting phase failed: {0}")]
    Collecting(#[from] CollectingStateError),

    #[error("aggregating phase failed: {0}")]
    Aggregating(#[from] AggregatingStateError),

    #[error("publishing phase failed: {0}")]
    Publishing(#[from] PublishingStateError),
}

#[async_trait]
impl<R, M> Phase<R, M> for PhaseState<PhaseStateError, R, M>
where
    R: RoundStorage,
    M: ModelStorage,
{
    const NAME: PhaseName = PhaseName::Failure;

    /// Records the failure in the ledger and broadcasts it.
    async fn run(&mut self) -> Result<(), PhaseStateError> {
        error!("phase state error: {}", self.private);

        match &self.private {
            PhaseStateError::RequestChannel(_) => {
                // nothing to record, the machine is about to shut down
            }
            PhaseStateError::Round { round, failure } => {
                let (round, failure) = (*round, failure.clone());
                self.record_round_failure(round, failure).await;
            }
            _ => self.record_interruption().await,
        }

        Ok(())
    }

    fn next(self) -> Option<StateMachine<R, M>> {
        let Self { private, shared } = self;
        Some(match private {
            PhaseStateError::RequestChannel(_) => PhaseState::<Shutdown, _, _>::new(shared).into(),
            _ => PhaseState::<Idle, _, _>::new(shared).into(),
        })
    }
}

impl<R, M> PhaseState<PhaseStateError, R, M>
where
    R: RoundStorage,
    M: ModelStorage,
{
    /// Creates a new failure state.
    pub fn new(shared: Shared<R, M>, error: PhaseStateError) -> Self {
        Self {
            private: error,
            shared,
        }
    }

    /// Marks the given round as failed in the ledger.
    ///
    /// Ledger errors are logged and swallowed: there is no better state to
    /// move to from here, and the restart policy covers the record.
    async fn record_round_failure(&mut self, round: u64, failure: RoundFailure) {
        match self.shared.store.round(round).await {
            Ok(Some(mut record)) => {
                record.state = RoundState::Failed(failure.clone());
                record.ended_at = Some(Utc::now());
                if let Err(err) = self.shared.store.set_round(&record).await {
                    warn!("failed to record the round failure: {:#}", err);
                }
            }
            Ok(None) => warn!(round, "no ledger entry for the failed round"),
            Err(err) => warn!("failed to load the failed round: {:#}", err),
        }
        self.shared.events.broadcast_round(RoundUpdate::Failed(failure));
    }

    /// Marks any non-terminal round as interrupted.
    async fn record_interruption(&mut self) {
        match fail_open_rounds(&mut self.shared.store, RoundFailure::Interrupted).await {
            Ok(failed) if !failed.is_empty() => {
                warn!(rounds = ?failed, "marked live rounds as interrupted");
                self.shared
                    .events
                    .broadcast_round(RoundUpdate::Failed(RoundFailure::Interrupted));
            }
            Ok(_) => {}
            Err(err) => warn!("failed to mark live rounds as interrupted: {:#}", err),
        }
    }
}
