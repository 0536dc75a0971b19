//! This module provides the `PhaseStates` of the [`StateMachine`].
//!
//! [`StateMachine`]: crate::state_machine::StateMachine

mod aggregating;
mod collecting;
mod failure;
mod idle;
mod publishing;
mod shutdown;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use tracing::{debug, error, error_span, info, warn, Instrument, Span};

pub use self::{
    aggregating::{Aggregating, AggregatingStateError},
    collecting::{Collecting, CollectingStateError},
    failure::PhaseStateError,
    idle::{Idle, IdleStateError},
    publishing::{Publishing, PublishingStateError},
    shutdown::Shutdown,
};
use crate::{
    authority::DecryptionAuthority,
    metrics::MetricsSender,
    registry::NodeRegistry,
    state_machine::{
        coordinator::CoordinatorState,
        events::EventPublisher,
        requests::{RequestError, RequestReceiver, ResponseSender, StateMachineRequest},
        StateMachine,
    },
    storage::{ModelStorage, RoundStorage, Store},
    validator::UpdateValidator,
};

/// Name of the current phase.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PhaseName {
    Idle,
    Collecting,
    Aggregating,
    Publishing,
    Failure,
    Shutdown,
}

/// A trait that must be implemented by a state in order to move to a next state.
#[async_trait]
pub trait Phase<R, M>
where
    R: RoundStorage,
    M: ModelStorage,
{
    /// Name of the current phase.
    const NAME: PhaseName;

    /// Run this phase to completion.
    async fn run(&mut self) -> Result<(), PhaseStateError>;

    /// Moves from this state to the next state.
    fn next(self) -> Option<StateMachine<R, M>>;
}

/// A struct that contains the coordinator state and the I/O interfaces that are shared and
/// accessible by all `PhaseState`s.
pub struct Shared<R, M>
where
    R: RoundStorage,
    M: ModelStorage,
{
    /// The coordinator state.
    pub(in crate::state_machine) state: CoordinatorState,
    /// The request receiver half.
    pub(in crate::state_machine) request_rx: RequestReceiver,
    /// The event publisher.
    pub(in crate::state_machine) events: EventPublisher,
    /// The store for the round ledger and the model version history.
    pub(in crate::state_machine) store: Store<R, M>,
    /// The node registry.
    pub(in crate::state_machine) registry: NodeRegistry,
    /// The update validator.
    pub(in crate::state_machine) validator: UpdateValidator,
    /// The external decryption authority.
    pub(in crate::state_machine) authority: Arc<dyn DecryptionAuthority>,
    /// The metrics channel.
    pub(in crate::state_machine) metrics: MetricsSender,
}

impl<R, M> fmt::Debug for Shared<R, M>
where
    R: RoundStorage,
    M: ModelStorage,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("state", &self.state)
            .field("request_rx", &self.request_rx)
            .field("events", &self.events)
            .finish()
    }
}

impl<R, M> Shared<R, M>
where
    R: RoundStorage,
    M: ModelStorage,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: CoordinatorState,
        publisher: EventPublisher,
        request_rx: RequestReceiver,
        store: Store<R, M>,
        registry: NodeRegistry,
        validator: UpdateValidator,
        authority: Arc<dyn DecryptionAuthority>,
        metrics: MetricsSender,
    ) -> Self {
        Self {
            state,
            request_rx,
            events: publisher,
            store,
            registry,
            validator,
            authority,
            metrics,
        }
    }

    /// Set the round ID to the given value.
    pub fn set_round_id(&mut self, id: u64) {
        self.state.round_id = id;
        self.events.set_round_id(id);
    }

    /// Return the current round ID.
    pub fn round_id(&self) -> u64 {
        self.state.round_id
    }
}

/// The state corresponding to a phase of the round protocol.
///
/// This contains the state-dependent `private` state and the state-independent `shared` state
/// which is shared across state transitions.
pub struct PhaseState<S, R, M>
where
    R: RoundStorage,
    M: ModelStorage,
{
    /// The private state.
    pub(in crate::state_machine) private: S,
    /// The shared coordinator state and I/O interfaces.
    pub(in crate::state_machine) shared: Shared<R, M>,
}

impl<S, R, M> PhaseState<S, R, M>
where
    Self: Phase<R, M>,
    R: RoundStorage,
    M: ModelStorage,
{
    /// Run the current phase to completion, then transition to the
    /// next phase and return it.
    pub async fn run_phase(mut self) -> Option<StateMachine<R, M>> {
        let phase = <Self as Phase<_, _>>::NAME;
        let span = error_span!("run_phase", phase = ?phase);

        async move {
            info!("starting phase");
            self.shared.events.broadcast_phase(phase);

            if let Err(err) = self.run().await {
                return Some(self.into_error_state(err));
            }

            info!("phase ran successfully");

            if phase == PhaseName::Idle {
                // requests queued behind the open request belong to the
                // round that just opened; the collecting phase answers them
                debug!("leaving queued requests to the collecting phase");
            } else {
                debug!("purging outdated requests before transitioning");
                if let Err(err) = self.purge_outdated_requests() {
                    warn!("failed to purge outdated requests");
                    // If we're already in the failure state or shutdown state,
                    // ignore this error
                    match phase {
                        PhaseName::Failure | PhaseName::Shutdown => {
                            debug!("already in failure/shutdown state: ignoring error while purging outdated requests");
                        }
                        _ => return Some(self.into_error_state(err)),
                    }
                }
            }

            info!("transitioning to the next phase");
            self.next()
        }.instrument(span).await
    }

    /// Process all the pending requests that are now considered
    /// outdated. This happens at the end of each phase, before
    /// transitioning to the next phase.
    fn purge_outdated_requests(&mut self) -> Result<(), PhaseStateError> {
        loop {
            match self.try_next_request()? {
                Some((req, span, resp_tx)) => {
                    let _span_guard = span.enter();
                    info!("discarding outdated request");
                    // an opener raced the live round; a submitter missed it
                    let response = match req {
                        StateMachineRequest::OpenRound(_) => RequestError::RoundAlreadyOpen,
                        StateMachineRequest::SubmitUpdate(_) => RequestError::RoundClosed,
                    };
                    let _ = resp_tx.send(Err(response));
                }
                None => return Ok(()),
            }
        }
    }
}

// Functions that are available to all states
impl<S, R, M> PhaseState<S, R, M>
where
    R: RoundStorage,
    M: ModelStorage,
{
    /// Receives the next [`StateMachineRequest`].
    ///
    /// # Errors
    /// Returns [`PhaseStateError::RequestChannel`] when all sender halves have been dropped.
    async fn next_request(
        &mut self,
    ) -> Result<(StateMachineRequest, Span, ResponseSender), PhaseStateError> {
        debug!("waiting for the next incoming request");
        self.shared.request_rx.recv().await.ok_or_else(|| {
            error!("request receiver broken: senders have been dropped");
            PhaseStateError::RequestChannel("all message senders have been dropped!")
        })
    }

    fn try_next_request(
        &mut self,
    ) -> Result<Option<(StateMachineRequest, Span, ResponseSender)>, PhaseStateError> {
        match self.shared.request_rx.try_recv() {
            Some(Some(item)) => Ok(Some(item)),
            None => {
                debug!("no pending request");
                Ok(None)
            }
            Some(None) => {
                warn!("failed to get next pending request: channel shut down");
                Err(PhaseStateError::RequestChannel(
                    "all message senders have been dropped!",
                ))
            }
        }
    }

    fn into_error_state(self, err: PhaseStateError) -> StateMachine<R, M> {
        PhaseState::<PhaseStateError, _, _>::new(self.shared, err).into()
    }
}
