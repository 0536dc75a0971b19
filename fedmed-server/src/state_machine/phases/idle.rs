//! The idle phase.
//!
//! The machine rests here between rounds. Updates are rejected since no
//! round is collecting; the first valid open request assigns the next round
//! number, snapshots the eligible nodes as the round's immutable invitee
//! set, persists the ledger entry and moves the machine to the collecting
//! phase.

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, Instrument};

use fedmed_core::NodeId;

use crate::{
    state_machine::{
        events::RoundUpdate,
        phases::{Collecting, Phase, PhaseName, PhaseState, PhaseStateError, Shared},
        requests::{
            OpenRoundRequest,
            RequestError,
            StateMachineRequest,
            StateMachineResponse,
        },
        round::RoundRecord,
        StateMachine,
    },
    storage::{ModelStorage, RoundStorage, StorageError},
};

/// Error that occurs during the idle phase.
#[derive(Debug, Error)]
pub enum IdleStateError {
    #[error("fetching the last round number failed: {0}")]
    LastRoundNumber(StorageError),
    #[error("persisting the round ledger entry failed: {0}")]
    PersistRound(StorageError),
}

/// Idle state.
#[derive(Debug, Default)]
pub struct Idle {
    next_round: Option<RoundRecord>,
}

#[async_trait]
impl<R, M> Phase<R, M> for PhaseState<Idle, R, M>
where
    R: RoundStorage,
    M: ModelStorage,
{
    const NAME: PhaseName = PhaseName::Idle;

    /// Waits for an open request and moves to the collecting phase.
    async fn run(&mut self) -> Result<(), PhaseStateError> {
        loop {
            let (req, span, resp_tx) = self.next_request().await?;

            let screened = span.in_scope(|| match req {
                StateMachineRequest::SubmitUpdate(_) => {
                    debug!("rejecting an update: no round is collecting");
                    let _ = resp_tx.send(Err(RequestError::RoundClosed));
                    None
                }
                StateMachineRequest::OpenRound(open) => {
                    if open.quorum == 0 {
                        let _ = resp_tx.send(Err(RequestError::InvalidRoundParameters(
                            "the quorum must be at least 1",
                        )));
                        return None;
                    }
                    if open.deadline.as_secs() == 0 {
                        let _ = resp_tx.send(Err(RequestError::InvalidRoundParameters(
                            "the deadline must be at least one second",
                        )));
                        return None;
                    }
                    Some((open, resp_tx))
                }
            });
            let (open, resp_tx) = match screened {
                Some(screened) => screened,
                None => continue,
            };

            match self.open_round(&open).instrument(span).await {
                Ok(record) => {
                    let round_number = record.round_number;
                    self.private.next_round = Some(record);
                    let _ = resp_tx.send(Ok(StateMachineResponse::RoundOpened(round_number)));
                    return Ok(());
                }
                Err(err) => {
                    let _ = resp_tx.send(Err(RequestError::InternalError(
                        "failed to open a new round",
                    )));
                    return Err(err.into());
                }
            }
        }
    }

    fn next(self) -> Option<StateMachine<R, M>> {
        let Self { private, shared } = self;
        // `run` only completes successfully after opening a round
        private
            .next_round
            .map(|record| PhaseState::<Collecting, _, _>::new(shared, record).into())
    }
}

impl<R, M> PhaseState<Idle, R, M>
where
    R: RoundStorage,
    M: ModelStorage,
{
    /// Creates a new idle state.
    pub fn new(shared: Shared<R, M>) -> Self {
        Self {
            private: Idle::default(),
            shared,
        }
    }

    /// Assigns the next round number, snapshots the invitees and persists
    /// the ledger entry.
    async fn open_round(
        &mut self,
        open: &OpenRoundRequest,
    ) -> Result<RoundRecord, IdleStateError> {
        let last = self
            .shared
            .store
            .last_round_number()
            .await
            .map_err(IdleStateError::LastRoundNumber)?;
        let round_number = last + 1;

        let invitees: Vec<NodeId> = self
            .shared
            .registry
            .eligible_nodes()
            .into_iter()
            .map(|node| node.id)
            .collect();

        let record = RoundRecord::open(
            round_number,
            open.quorum,
            open.deadline.as_secs(),
            invitees,
        );
        self.shared
            .store
            .set_round(&record)
            .await
            .map_err(IdleStateError::PersistRound)?;

        self.shared.set_round_id(round_number);
        info!(
            round = round_number,
            invitees = record.invitees.len(),
            quorum = open.quorum,
            "opened a new round"
        );
        self.shared.events.broadcast_round(RoundUpdate::Opened {
            quorum: open.quorum,
            deadline_secs: open.deadline.as_secs(),
        });

        Ok(record)
    }
}
