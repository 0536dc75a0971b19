//! The collecting phase.
//!
//! The open round accepts encrypted updates until its quorum of accepted
//! updates is reached or its fixed deadline passes. Every submission runs
//! through the update validator; accepted updates are appended to the
//! round's ledger entry in submission order, serialized through the single
//! state machine task. The transition out of this phase fires exactly once.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, info, Span};

use fedmed_core::NodeId;

use crate::{
    state_machine::{
        phases::{Aggregating, Phase, PhaseName, PhaseState, PhaseStateError, Shared},
        requests::{
            RequestError,
            ResponseSender,
            StateMachineRequest,
            StateMachineResponse,
            SubmitUpdateRequest,
        },
        round::{ClientUpdate, RoundFailure, RoundRecord, RoundState, UpdateOutcome},
        StateMachine,
    },
    storage::{ModelStorage, RoundStorage, StorageError},
};

/// How many submissions a node may make to one round. A rejected node may
/// retry once with a corrected update; an accepted update is final.
const MAX_SUBMISSION_ATTEMPTS: u32 = 2;

/// Error that occurs during the collecting phase.
#[derive(Debug, Error)]
pub enum CollectingStateError {
    #[error("persisting the round ledger entry failed: {0}")]
    PersistRound(StorageError),
}

/// Collecting state.
#[derive(Debug)]
pub struct Collecting {
    record: RoundRecord,
    deadline: Instant,
    invitees: HashSet<NodeId>,
    attempts: HashMap<NodeId, u32>,
    accepted: u32,
}

impl Collecting {
    fn new(record: RoundRecord) -> Self {
        let deadline = Instant::now() + Duration::from_secs(record.deadline_secs);
        let invitees = record.invitees.iter().cloned().collect();
        Self {
            record,
            deadline,
            invitees,
            attempts: HashMap::new(),
            accepted: 0,
        }
    }

    fn quorum_reached(&self) -> bool {
        self.accepted >= self.record.quorum
    }

    fn accepted_norms(&self) -> Vec<f64> {
        self.record
            .accepted_updates()
            .map(|update| update.norm_bound)
            .collect()
    }

    fn has_accepted(&self, node_id: &NodeId) -> bool {
        self.record
            .accepted_updates()
            .any(|update| &update.node_id == node_id)
    }
}

#[async_trait]
impl<R, M> Phase<R, M> for PhaseState<Collecting, R, M>
where
    R: RoundStorage,
    M: ModelStorage,
{
    const NAME: PhaseName = PhaseName::Collecting;

    /// Collects updates until quorum or deadline.
    async fn run(&mut self) -> Result<(), PhaseStateError> {
        self.private.record.state = RoundState::Collecting;
        self.shared
            .store
            .set_round(&self.private.record)
            .await
            .map_err(CollectingStateError::PersistRound)?;

        info!(
            round = self.private.record.round_number,
            quorum = self.private.record.quorum,
            deadline_secs = self.private.record.deadline_secs,
            "collecting updates"
        );

        let deadline = sleep_until(self.private.deadline);
        tokio::pin!(deadline);

        while !self.private.quorum_reached() {
            tokio::select! {
                _ = &mut deadline => {
                    debug!("deadline elapsed");
                    break;
                }
                next = self.next_request() => {
                    let (req, span, resp_tx) = next?;
                    self.process_single(req, span, resp_tx);
                }
            }
        }

        if self.private.accepted == 0 {
            return Err(PhaseStateError::Round {
                round: self.private.record.round_number,
                failure: RoundFailure::NoQuorum,
            });
        }

        info!(
            accepted = self.private.accepted,
            quorum_reached = self.private.quorum_reached(),
            "collection ended"
        );

        self.private.record.state = RoundState::Aggregating;
        self.shared
            .store
            .set_round(&self.private.record)
            .await
            .map_err(CollectingStateError::PersistRound)?;

        Ok(())
    }

    fn next(self) -> Option<StateMachine<R, M>> {
        let Self { private, shared } = self;
        Some(PhaseState::<Aggregating, _, _>::new(shared, private.record).into())
    }
}

impl<R, M> PhaseState<Collecting, R, M>
where
    R: RoundStorage,
    M: ModelStorage,
{
    /// Creates a new collecting state for the given ledger entry.
    pub fn new(shared: Shared<R, M>, record: RoundRecord) -> Self {
        Self {
            private: Collecting::new(record),
            shared,
        }
    }

    /// Processes a single request and answers its caller.
    fn process_single(
        &mut self,
        req: StateMachineRequest,
        span: Span,
        resp_tx: ResponseSender,
    ) {
        let _span_guard = span.enter();
        let res = self.handle_request(req);
        // This may error out if the receiver has already been dropped but it doesn't matter for us.
        let _ = resp_tx.send(res);
    }

    fn handle_request(
        &mut self,
        req: StateMachineRequest,
    ) -> Result<StateMachineResponse, RequestError> {
        match req {
            StateMachineRequest::OpenRound(_) => {
                debug!("rejecting an open request: a round is already live");
                Err(RequestError::RoundAlreadyOpen)
            }
            StateMachineRequest::SubmitUpdate(submit) => self
                .handle_submit(submit)
                .map(|_| StateMachineResponse::UpdateAccepted),
        }
    }

    fn handle_submit(&mut self, submit: SubmitUpdateRequest) -> Result<(), RequestError> {
        let round = &mut self.private;

        if submit.round_number != round.record.round_number {
            return Err(RequestError::RoundClosed);
        }
        if round.has_accepted(&submit.node_id) {
            debug!("rejecting a resubmission: the node already has an accepted update");
            return Err(RequestError::DuplicateSubmission);
        }
        let attempts = round.attempts.entry(submit.node_id.clone()).or_insert(0);
        if *attempts >= MAX_SUBMISSION_ATTEMPTS {
            debug!("rejecting a resubmission: the node has exhausted its attempts");
            return Err(RequestError::DuplicateSubmission);
        }
        *attempts += 1;

        let norms = round.accepted_norms();
        let outcome = self.shared.validator.validate(
            &self.shared.registry,
            &round.invitees,
            &norms,
            &submit.node_id,
            &submit.ciphertext,
            submit.sample_count,
            submit.norm_bound,
        );

        let SubmitUpdateRequest {
            node_id,
            ciphertext,
            sample_count,
            norm_bound,
            ..
        } = submit;

        match outcome {
            Ok(()) => {
                round.record.updates.push(ClientUpdate {
                    node_id: node_id.clone(),
                    ciphertext,
                    sample_count,
                    norm_bound,
                    submitted_at: Utc::now(),
                    outcome: UpdateOutcome::Accepted,
                });
                round.accepted += 1;
                info!(
                    node = %node_id,
                    accepted = round.accepted,
                    quorum = round.record.quorum,
                    "accepted an update"
                );
                Ok(())
            }
            Err(err) => {
                info!(node = %node_id, reason = %err, "rejected an update");
                round.record.updates.push(ClientUpdate {
                    node_id,
                    ciphertext,
                    sample_count,
                    norm_bound,
                    submitted_at: Utc::now(),
                    outcome: UpdateOutcome::Rejected(err.to_string()),
                });
                Err(err.into())
            }
        }
    }
}
