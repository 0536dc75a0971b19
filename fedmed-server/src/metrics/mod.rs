//! Per-round metrics reporting.
//!
//! Round closure must never block on the reporting backend, so metrics are
//! shipped fire-and-forget: the state machine drops each [`RoundMetrics`]
//! record into an unbounded channel and a dispatcher task forwards it to the
//! configured [`RoundMetricsSink`]. Sink failures are logged and otherwise
//! ignored; delivery is at-least-once attempted, never guaranteed.

use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::warn;

use fedmed_core::RoundMetrics;

/// The error type for sink emissions.
pub type SinkError = anyhow::Error;

/// A reporting backend for round metrics.
#[async_trait]
pub trait RoundMetricsSink: Send + 'static {
    /// Delivers one metrics record to the backend.
    async fn emit(&mut self, metrics: RoundMetrics) -> Result<(), SinkError>;
}

/// The sending half of the metrics channel, held by the state machine.
#[derive(Debug, Clone)]
pub struct MetricsSender(UnboundedSender<RoundMetrics>);

impl MetricsSender {
    /// Hands a metrics record to the dispatcher without waiting for
    /// delivery.
    pub fn send(&self, metrics: RoundMetrics) {
        if let Err(err) = self.0.send(metrics) {
            warn!("cannot send metrics: {}", err);
        }
    }
}

/// The dispatcher task that drains the metrics channel into the sink.
pub struct MetricsDispatcher<S> {
    receiver: UnboundedReceiver<RoundMetrics>,
    sink: S,
}

impl<S> MetricsDispatcher<S>
where
    S: RoundMetricsSink,
{
    /// Forwards metrics records until all senders have been dropped.
    pub async fn run(mut self) {
        while let Some(metrics) = self.receiver.recv().await {
            if let Err(err) = self.sink.emit(metrics).await {
                warn!("metrics sink rejected a record: {:#}", err);
            }
        }
    }
}

/// Creates the metrics channel for the given sink.
///
/// The [`MetricsDispatcher`] must be spawned by the caller.
pub fn metrics_channel<S: RoundMetricsSink>(sink: S) -> (MetricsSender, MetricsDispatcher<S>) {
    let (tx, rx) = unbounded_channel();
    (MetricsSender(tx), MetricsDispatcher { receiver: rx, sink })
}

#[cfg(any(test, feature = "testutils"))]
pub use self::testutils::MemorySink;

#[cfg(any(test, feature = "testutils"))]
mod testutils {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// A sink that records every emitted metrics record in memory.
    #[derive(Debug, Clone, Default)]
    pub struct MemorySink {
        records: Arc<Mutex<Vec<RoundMetrics>>>,
    }

    impl MemorySink {
        pub fn new() -> Self {
            Self::default()
        }

        /// The records emitted so far.
        pub fn records(&self) -> Vec<RoundMetrics> {
            self.records
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        }
    }

    #[async_trait]
    impl RoundMetricsSink for MemorySink {
        async fn emit(&mut self, metrics: RoundMetrics) -> Result<(), SinkError> {
            self.records
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(metrics);
            Ok(())
        }
    }
}
