//! The request channel of the [`StateMachine`].
//!
//! [`StateMachine`]: crate::state_machine::StateMachine

use std::time::Duration;

use derive_more::From;
use displaydoc::Display;
use futures::future::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::Span;

use fedmed_core::{Ciphertext, NodeId};

use crate::{storage::StorageError, validator::ValidationError};

/// Errors which can occur while the state machine handles a request.
#[derive(Debug, Display, Error)]
pub enum RequestError {
    /// A round is already open.
    RoundAlreadyOpen,
    /// The round is not accepting updates.
    RoundClosed,
    /// The node has already submitted to this round.
    DuplicateSubmission,
    /// Invalid round parameters: {0}.
    InvalidRoundParameters(&'static str),
    /// The update was rejected: {0}.
    Validation(#[from] ValidationError),
    /// The request could not be processed due to an internal error: {0}.
    InternalError(&'static str),
    /// Storage request failed: {0}.
    Storage(StorageError),
}

impl From<StorageError> for RequestError {
    fn from(error: StorageError) -> Self {
        RequestError::Storage(error)
    }
}

/// A request to open a new round.
#[derive(Debug)]
pub struct OpenRoundRequest {
    /// The number of accepted updates at which the round closes early.
    pub quorum: u32,
    /// The fixed collection deadline of the round.
    pub deadline: Duration,
}

/// A request to submit an encrypted update to the open round.
#[derive(Debug)]
pub struct SubmitUpdateRequest {
    /// The round the update targets.
    pub round_number: u64,
    /// The submitting node.
    pub node_id: NodeId,
    /// The encrypted model update.
    pub ciphertext: Ciphertext,
    /// The self-reported number of training samples.
    pub sample_count: u64,
    /// The declared norm bound of the plaintext update.
    pub norm_bound: f64,
}

/// A [`StateMachine`] request.
///
/// [`StateMachine`]: crate::state_machine
#[derive(Debug, From)]
pub enum StateMachineRequest {
    OpenRound(OpenRoundRequest),
    SubmitUpdate(SubmitUpdateRequest),
}

/// A successful [`StateMachine`] response.
///
/// [`StateMachine`]: crate::state_machine
#[derive(Debug, Eq, PartialEq)]
pub enum StateMachineResponse {
    /// The round was opened with the given round number.
    RoundOpened(u64),
    /// The update was accepted into the open round.
    UpdateAccepted,
}

pub type StateMachineResult = Result<StateMachineResponse, RequestError>;

/// A handle to send requests to the [`StateMachine`].
///
/// [`StateMachine`]: crate::state_machine
#[derive(Clone, From, Debug)]
pub struct RequestSender(mpsc::UnboundedSender<(StateMachineRequest, Span, ResponseSender)>);

impl RequestSender {
    /// Sends a request to the [`StateMachine`].
    ///
    /// # Errors
    /// Fails if the [`StateMachine`] has already shut down and the `Request` channel has been
    /// closed as a result.
    ///
    /// [`StateMachine`]: crate::state_machine
    pub async fn request(
        &self,
        req: StateMachineRequest,
        span: Span,
    ) -> StateMachineResult {
        let (resp_tx, resp_rx) = oneshot::channel::<StateMachineResult>();
        self.0.send((req, span, resp_tx)).map_err(|_| {
            RequestError::InternalError(
                "failed to send request to the state machine: state machine is shutting down",
            )
        })?;
        resp_rx.await.map_err(|_| {
            RequestError::InternalError("failed to receive response from the state machine")
        })?
    }

    /// Opens a new round and returns its round number.
    ///
    /// # Errors
    /// Fails with [`RequestError::RoundAlreadyOpen`] while another round is
    /// live, or with [`RequestError::InvalidRoundParameters`] for an
    /// unusable quorum or deadline.
    pub async fn open_round(&self, quorum: u32, deadline: Duration) -> Result<u64, RequestError> {
        let req = OpenRoundRequest { quorum, deadline };
        match self.request(req.into(), Span::current()).await? {
            StateMachineResponse::RoundOpened(round_number) => Ok(round_number),
            _ => Err(RequestError::InternalError("unexpected response type")),
        }
    }

    /// Submits an encrypted update to the open round.
    ///
    /// Resolves as soon as the update is accepted or rejected; it never
    /// waits for the round to close.
    ///
    /// # Errors
    /// Fails if no round is collecting, the node has exhausted its
    /// submissions, or validation rejects the update.
    pub async fn submit_update(
        &self,
        round_number: u64,
        node_id: NodeId,
        ciphertext: Ciphertext,
        sample_count: u64,
        norm_bound: f64,
    ) -> Result<(), RequestError> {
        let req = SubmitUpdateRequest {
            round_number,
            node_id,
            ciphertext,
            sample_count,
            norm_bound,
        };
        match self.request(req.into(), Span::current()).await? {
            StateMachineResponse::UpdateAccepted => Ok(()),
            _ => Err(RequestError::InternalError("unexpected response type")),
        }
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// A channel for the state machine to send the response to a
/// [`StateMachineRequest`].
pub(in crate::state_machine) type ResponseSender = oneshot::Sender<StateMachineResult>;

/// The receiver half of the `Request` channel that is used by the [`StateMachine`] to receive
/// requests.
///
/// [`StateMachine`]: crate::state_machine
#[derive(From, Debug)]
pub struct RequestReceiver(mpsc::UnboundedReceiver<(StateMachineRequest, Span, ResponseSender)>);

impl RequestReceiver {
    /// Creates a new `Request` channel and returns the [`RequestReceiver`] as well as the
    /// [`RequestSender`] half.
    pub fn new() -> (Self, RequestSender) {
        let (tx, rx) = mpsc::unbounded_channel::<(StateMachineRequest, Span, ResponseSender)>();
        let receiver = RequestReceiver::from(rx);
        let handle = RequestSender::from(tx);
        (receiver, handle)
    }

    /// Closes the `Request` channel. Queued requests can still be received.
    pub fn close(&mut self) {
        self.0.close()
    }

    /// Receives the next request, or `None` once all senders have been
    /// dropped and the queue is drained.
    pub async fn recv(&mut self) -> Option<(StateMachineRequest, Span, ResponseSender)> {
        self.0.recv().await
    }

    /// Tries to retrieve the next request without blocking.
    ///
    /// Returns `None` when no request is pending and `Some(None)` when the
    /// channel has been closed and drained.
    pub fn try_recv(&mut self) -> Option<Option<(StateMachineRequest, Span, ResponseSender)>> {
        self.0.recv().now_or_never()
    }
}
