//! The shutdown phase.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::{
    state_machine::{
        phases::{Phase, PhaseName, PhaseState, PhaseStateError, Shared},
        requests::RequestError,
        StateMachine,
    },
    storage::{ModelStorage, RoundStorage},
};

/// Shutdown state.
#[derive(Debug)]
pub struct Shutdown;

#[async_trait]
impl<R, M> Phase<R, M> for PhaseState<Shutdown, R, M>
where
    R: RoundStorage,
    M: ModelStorage,
{
    const NAME: PhaseName = PhaseName::Shutdown;

    /// Performs a clean shutdown of the request channel by closing it and
    /// consuming all remaining requests.
    async fn run(&mut self) -> Result<(), PhaseStateError> {
        info!("shutting down");
        self.shared.request_rx.close();
        while let Some((_req, span, resp_tx)) = self.shared.request_rx.recv().await {
            let _span_guard = span.enter();
            debug!("discarding a request during shutdown");
            let _ = resp_tx.send(Err(RequestError::InternalError(
                "the state machine is shutting down",
            )));
        }
        Ok(())
    }

    fn next(self) -> Option<StateMachine<R, M>> {
        None
    }
}

impl<R, M> PhaseState<Shutdown, R, M>
where
    R: RoundStorage,
    M: ModelStorage,
{
    /// Creates a new shutdown state.
    pub fn new(shared: Shared<R, M>) -> Self {
        Self {
            private: Shutdown,
            shared,
        }
    }
}
