//! The state machine that runs the federated rounds.
//!
//! # Overview
//!
//! The [`StateMachine`] owns the one live round of the coordinator and runs
//! it through its phases. It is driven by [`StateMachineRequest`]s arriving
//! on the request channel and publishes its progress on the event bus.
//!
//! # Phase states
//!
//! **Idle**
//!
//! Publishes [`PhaseName::Idle`] and waits for an open request. Opening a
//! round assigns the next round number from the ledger (strictly
//! increasing, never reused), snapshots the currently active nodes as the
//! round's immutable invitee set and persists the ledger entry. Updates
//! arriving here are rejected.
//!
//! **Collecting**
//!
//! Publishes [`PhaseName::Collecting`] and accepts validated updates until
//! the quorum of accepted updates is reached or the fixed deadline passes.
//! A deadline without a single accepted update fails the round.
//!
//! **Aggregating**
//!
//! Publishes [`PhaseName::Aggregating`] and combines the accepted updates
//! into the sample-count-weighted homomorphic sum.
//!
//! **Publishing**
//!
//! Publishes [`PhaseName::Publishing`], hands the aggregate to the external
//! decryption authority, records the new model version, closes the round in
//! the ledger and ships the round metrics.
//!
//! **Failure**
//!
//! Publishes [`PhaseName::Failure`] and handles [`PhaseStateError`]s that
//! occur during the execution of the [`StateMachine`]. Round-fatal failures
//! are recorded in the ledger before a new round can be opened. If a
//! [`PhaseStateError::RequestChannel`] occurs, the [`StateMachine`] will
//! shut down.
//!
//! **Shutdown**
//!
//! Publishes [`PhaseName::Shutdown`] and shuts down the [`StateMachine`].
//! During the shutdown, the [`StateMachine`] performs a clean shutdown of
//! the request channel by closing it and consuming all remaining requests.
//!
//! # Requests
//!
//! By initiating a new [`StateMachine`] via [`StateMachineInitializer::init()`], a new
//! request channel is created, the function of which is to send [`StateMachineRequest`]s
//! to the [`StateMachine`]. The sender half of that channel ([`RequestSender`]) is
//! returned back to the caller of [`StateMachineInitializer::init()`], whereas the
//! receiver half ([`RequestReceiver`]) is used by the [`StateMachine`].
//!
//! # Events
//!
//! During the execution of the rounds, the [`StateMachine`] publishes various events
//! (see Phase states). Everyone who is interested in the events can subscribe to the
//! respective events via the [`EventSubscriber`]. An [`EventSubscriber`] is automatically
//! created when a new [`StateMachine`] is created through [`StateMachineInitializer::init()`].
//!
//! [`PhaseName::Idle`]: crate::state_machine::phases::PhaseName::Idle
//! [`PhaseName::Collecting`]: crate::state_machine::phases::PhaseName::Collecting
//! [`PhaseName::Aggregating`]: crate::state_machine::phases::PhaseName::Aggregating
//! [`PhaseName::Publishing`]: crate::state_machine::phases::PhaseName::Publishing
//! [`PhaseName::Failure`]: crate::state_machine::phases::PhaseName::Failure
//! [`PhaseName::Shutdown`]: crate::state_machine::phases::PhaseName::Shutdown
//! [`StateMachineRequest`]: crate::state_machine::requests::StateMachineRequest

pub mod coordinator;
pub mod events;
pub mod phases;
pub mod requests;
pub mod round;

use std::sync::Arc;

use derive_more::From;
use thiserror::Error;
use tracing::{info, warn};

use self::{
    coordinator::CoordinatorState,
    events::{EventPublisher, EventSubscriber, ModelUpdate, RoundUpdate},
    phases::{
        Aggregating,
        Collecting,
        Idle,
        PhaseName,
        PhaseState,
        PhaseStateError,
        Publishing,
        Shutdown,
    },
    requests::{RequestReceiver, RequestSender},
    round::{RoundFailure, RoundState},
};
use crate::{
    authority::DecryptionAuthority,
    metrics::MetricsSender,
    registry::NodeRegistry,
    settings::{CipherSettings, ValidationSettings},
    storage::{ModelStorage, RoundStorage, StorageError, StorageResult, Store},
    validator::UpdateValidator,
};

pub use self::requests::RequestError;

/// The state machine with all its states.
#[derive(From)]
pub enum StateMachine<R, M>
where
    R: RoundStorage,
    M: ModelStorage,
{
    Idle(PhaseState<Idle, R, M>),
    Collecting(PhaseState<Collecting, R, M>),
    Aggregating(PhaseState<Aggregating, R, M>),
    Publishing(PhaseState<Publishing, R, M>),
    Failure(PhaseState<PhaseStateError, R, M>),
    Shutdown(PhaseState<Shutdown, R, M>),
}

impl<R, M> StateMachine<R, M>
where
    R: RoundStorage,
    M: ModelStorage,
{
    /// Moves the [`StateMachine`] to the next state and consumes the current one.
    /// Returns the next state or `None` if the [`StateMachine`] reached the state [`Shutdown`].
    pub async fn next(self) -> Option<Self> {
        match self {
            StateMachine::Idle(state) => state.run_phase().await,
            StateMachine::Collecting(state) => state.run_phase().await,
            StateMachine::Aggregating(state) => state.run_phase().await,
            StateMachine::Publishing(state) => state.run_phase().await,
            StateMachine::Failure(state) => state.run_phase().await,
            StateMachine::Shutdown(state) => state.run_phase().await,
        }
    }

    /// Runs the state machine until it shuts down.
    /// The [`StateMachine`] shuts down once all [`RequestSender`] have been dropped.
    pub async fn run(mut self) -> Option<()> {
        loop {
            self = self.next().await?;
        }
    }
}

/// Marks every non-terminal round in the ledger as failed with the given
/// reason and returns the affected round numbers.
pub(crate) async fn fail_open_rounds<R>(
    storage: &mut R,
    failure: RoundFailure,
) -> StorageResult<Vec<u64>>
where
    R: RoundStorage,
{
    let mut failed = Vec::new();
    for mut record in storage.rounds().await? {
        if record.state.is_terminal() {
            continue;
        }
        record.state = RoundState::Failed(failure.clone());
        record.ended_at = Some(chrono::Utc::now());
        storage.set_round(&record).await?;
        failed.push(record.round_number);
    }
    Ok(failed)
}

type StateMachineInitializationResult<T> = Result<T, StateMachineInitializationError>;

/// Error that can occur during the initialization of the [`StateMachine`].
#[derive(Debug, Error)]
pub enum StateMachineInitializationError {
    #[error("storage request failed: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for StateMachineInitializationError {
    fn from(error: StorageError) -> Self {
        StateMachineInitializationError::Storage(error)
    }
}

/// The state machine initializer that initializes a new state machine.
pub struct StateMachineInitializer<R, M>
where
    R: RoundStorage,
    M: ModelStorage,
{
    cipher_settings: CipherSettings,
    validation_settings: ValidationSettings,
    store: Store<R, M>,
    registry: NodeRegistry,
    authority: Arc<dyn DecryptionAuthority>,
    metrics: MetricsSender,
}

impl<R, M> StateMachineInitializer<R, M>
where
    R: RoundStorage,
    M: ModelStorage,
{
    /// Creates a new [`StateMachineInitializer`].
    pub fn new(
        cipher_settings: CipherSettings,
        validation_settings: ValidationSettings,
        store: Store<R, M>,
        registry: NodeRegistry,
        authority: Arc<dyn DecryptionAuthority>,
        metrics: MetricsSender,
    ) -> Self {
        Self {
            cipher_settings,
            validation_settings,
            store,
            registry,
            authority,
            metrics,
        }
    }

    /// Initializes a new [`StateMachine`] on top of the (possibly
    /// pre-existing) ledger.
    ///
    /// # Behavior
    ///
    /// - Any round found in a non-terminal state is marked as
    ///   `Failed(Interrupted)`: a round does not survive the coordinator
    ///   that opened it.
    /// - Round numbers continue from the highest number in the ledger, so
    ///   they stay strictly increasing across restarts.
    /// - The latest recorded model version, if any, is published on the
    ///   event bus so that subscribers immediately see the current global
    ///   model.
    pub async fn init(
        mut self,
    ) -> StateMachineInitializationResult<(StateMachine<R, M>, RequestSender, EventSubscriber)>
    {
        let interrupted = fail_open_rounds(&mut self.store, RoundFailure::Interrupted).await?;
        if !interrupted.is_empty() {
            warn!(rounds = ?interrupted, "marked rounds left over from a previous run as interrupted");
        }

        let last_round_number = self.store.last_round_number().await?;
        info!(last_round_number, "restored the round ledger");

        let model = match self.store.latest_version().await? {
            Some(version) => ModelUpdate::New(Arc::new(version)),
            None => ModelUpdate::Invalidate,
        };

        let coordinator_state = CoordinatorState::new(self.cipher_settings, last_round_number);
        Ok(self.init_state_machine(coordinator_state, model))
    }

    // Initializes a new [`StateMachine`] with its components.
    fn init_state_machine(
        self,
        coordinator_state: CoordinatorState,
        model: ModelUpdate,
    ) -> (StateMachine<R, M>, RequestSender, EventSubscriber) {
        let (event_publisher, event_subscriber) = EventPublisher::init(
            coordinator_state.round_id,
            PhaseName::Idle,
            RoundUpdate::Invalidate,
            model,
        );

        let (request_rx, request_tx) = RequestReceiver::new();

        let validator = UpdateValidator::new(
            coordinator_state.cipher,
            coordinator_state.model_length,
            self.validation_settings,
        );

        let shared = phases::Shared::new(
            coordinator_state,
            event_publisher,
            request_rx,
            self.store,
            self.registry,
            validator,
            self.authority,
            self.metrics,
        );

        let state_machine = StateMachine::from(PhaseState::<Idle, _, _>::new(shared));
        (state_machine, request_tx, event_subscriber)
    }
}

#[cfg(test)]
pub(crate) mod tests;
