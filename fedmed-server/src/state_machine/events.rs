//! The event bus of the [`StateMachine`].
//!
//! Out-of-scope collaborators (dashboards, notification services, node
//! clients polling for a new global model) observe the coordinator through
//! watch channels: each listener always sees the latest event of its kind
//! and can await changes, but the state machine never blocks on a slow
//! consumer.
//!
//! [`StateMachine`]: crate::state_machine::StateMachine

use std::sync::Arc;

use tokio::sync::watch;

use fedmed_core::ModelVersion;

use crate::state_machine::{phases::PhaseName, round::RoundFailure};

/// An event emitted by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<E> {
    /// Metadata that associates this event to the round in which it is
    /// emitted.
    pub round_id: u64,
    /// The event itself.
    pub event: E,
}

/// Round lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundUpdate {
    /// No round has been opened yet.
    Invalidate,
    /// A round was opened with the given parameters.
    Opened {
        quorum: u32,
        deadline_secs: u64,
    },
    /// The round closed and published a model version.
    Closed,
    /// The round failed.
    Failed(RoundFailure),
}

/// Global model update event.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelUpdate {
    Invalidate,
    New(Arc<ModelVersion>),
}

/// A convenience type to emit any coordinator event.
#[derive(Debug)]
pub struct EventPublisher {
    /// Round ID that is attached to all the events.
    round_id: u64,
    phase_tx: EventBroadcaster<PhaseName>,
    round_tx: EventBroadcaster<RoundUpdate>,
    model_tx: EventBroadcaster<ModelUpdate>,
}

/// The `EventSubscriber` hands out `EventListener`s for any coordinator
/// event.
#[derive(Debug)]
pub struct EventSubscriber {
    phase_rx: EventListener<PhaseName>,
    round_rx: EventListener<RoundUpdate>,
    model_rx: EventListener<ModelUpdate>,
}

impl EventPublisher {
    /// Initialize a new event publisher with the given initial events.
    pub fn init(
        round_id: u64,
        phase: PhaseName,
        round: RoundUpdate,
        model: ModelUpdate,
    ) -> (Self, EventSubscriber) {
        let (phase_tx, phase_rx) = watch::channel::<Event<PhaseName>>(Event {
            round_id,
            event: phase,
        });

        let (round_tx, round_rx) = watch::channel::<Event<RoundUpdate>>(Event {
            round_id,
            event: round,
        });

        let (model_tx, model_rx) = watch::channel::<Event<ModelUpdate>>(Event {
            round_id,
            event: model,
        });

        let publisher = EventPublisher {
            round_id,
            phase_tx: phase_tx.into(),
            round_tx: round_tx.into(),
            model_tx: model_tx.into(),
        };

        let subscriber = EventSubscriber {
            phase_rx: phase_rx.into(),
            round_rx: round_rx.into(),
            model_rx: model_rx.into(),
        };

        (publisher, subscriber)
    }

    /// Set the round ID that is attached to the events the publisher broadcasts.
    pub fn set_round_id(&mut self, id: u64) {
        self.round_id = id;
    }

    fn event<T>(&self, event: T) -> Event<T> {
        Event {
            round_id: self.round_id,
            event,
        }
    }

    /// Emit a phase event.
    pub fn broadcast_phase(&mut self, phase: PhaseName) {
        let _ = self.phase_tx.broadcast(self.event(phase));
    }

    /// Emit a round lifecycle event.
    pub fn broadcast_round(&mut self, update: RoundUpdate) {
        let _ = self.round_tx.broadcast(self.event(update));
    }

    /// Emit a model event.
    pub fn broadcast_model(&mut self, update: ModelUpdate) {
        let _ = self.model_tx.broadcast(self.event(update));
    }
}

impl EventSubscriber {
    /// Get a listener for new phase events.
    pub fn phase_listener(&self) -> EventListener<PhaseName> {
        self.phase_rx.clone()
    }

    /// Get a listener for round lifecycle events.
    pub fn round_listener(&self) -> EventListener<RoundUpdate> {
        self.round_rx.clone()
    }

    /// Get a listener for new model events.
    pub fn model_listener(&self) -> EventListener<ModelUpdate> {
        self.model_rx.clone()
    }
}

/// A listener for coordinator events. It can be used to either retrieve the
/// latest `Event<E>` emitted by the coordinator (with
/// [`EventListener::get_latest`]) or to wait for changes (with
/// [`EventListener::next`]).
#[derive(Debug, Clone)]
pub struct EventListener<E>(watch::Receiver<Event<E>>);

impl<E> From<watch::Receiver<Event<E>>> for EventListener<E> {
    fn from(receiver: watch::Receiver<Event<E>>) -> Self {
        EventListener(receiver)
    }
}

impl<E> EventListener<E>
where
    E: Clone,
{
    /// The latest event of this kind.
    pub fn get_latest(&self) -> Event<E> {
        self.0.borrow().clone()
    }

    /// Waits for the next event of this kind. Returns `None` once the
    /// state machine has shut down.
    pub async fn next(&mut self) -> Option<Event<E>> {
        self.0.changed().await.ok()?;
        Some(self.0.borrow().clone())
    }
}

/// A channel to send `Event<E>` to all the `EventListener<E>`.
#[derive(Debug)]
pub struct EventBroadcaster<E>(watch::Sender<Event<E>>);

impl<E> EventBroadcaster<E> {
    /// Send `event` to all the `EventListener<E>`.
    fn broadcast(&self, event: Event<E>) {
        // We don't care whether there's a listener or not
        let _ = self.0.send(event);
    }
}

impl<E> From<watch::Sender<Event<E>>> for EventBroadcaster<E> {
    fn from(sender: watch::Sender<Event<E>>) -> Self {
        Self(sender)
    }
}
