//! The round ledger records.
//!
//! Every round the coordinator runs leaves a [`RoundRecord`] in the ledger,
//! whether it closed with a published model or failed. Records only ever
//! move forward through the [`RoundState`]s and are never deleted, so the
//! ledger doubles as the audit trail of the consortium.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fedmed_core::{AggregateCiphertext, Ciphertext, NodeId};

/// The lifecycle state of a round, as recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoundState {
    /// The round has been opened and its invitees snapshotted.
    Open,
    /// The round is collecting updates until quorum or deadline.
    Collecting,
    /// The accepted updates are being combined in the ciphertext domain.
    Aggregating,
    /// The aggregate is with the decryption authority and the resulting
    /// version is being recorded.
    Publishing,
    /// The round produced a published model version. Terminal.
    Closed,
    /// The round failed and produced nothing. Terminal.
    Failed(RoundFailure),
}

impl RoundState {
    /// Whether the round can make no further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RoundState::Closed | RoundState::Failed(_))
    }
}

/// The reason a round failed.
///
/// A failed round is never resumed; recovery is opening a new round with a
/// fresh round number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoundFailure {
    /// The deadline passed without a single accepted update.
    NoQuorum,
    /// Combining or decrypting the updates failed.
    Aggregation(String),
    /// The coordinator was stopped while the round was live.
    Interrupted,
}

impl std::fmt::Display for RoundFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoundFailure::NoQuorum => write!(f, "no update was accepted before the deadline"),
            RoundFailure::Aggregation(reason) => write!(f, "aggregation failed: {}", reason),
            RoundFailure::Interrupted => write!(f, "the coordinator was interrupted"),
        }
    }
}

/// The outcome of a single submitted update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpdateOutcome {
    /// The update passed validation and entered the aggregate.
    Accepted,
    /// The update was rejected with the given reason.
    Rejected(String),
}

/// One submitted update, as recorded in the ledger.
///
/// At most one accepted update exists per node and round. Records are
/// immutable once their outcome is decided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientUpdate {
    /// The submitting node.
    pub node_id: NodeId,
    /// The encrypted model update.
    pub ciphertext: Ciphertext,
    /// The self-reported number of training samples, used as the
    /// aggregation weight.
    pub sample_count: u64,
    /// The declared norm bound of the plaintext update.
    pub norm_bound: f64,
    /// When the update was received.
    pub submitted_at: DateTime<Utc>,
    /// Whether the update was accepted into the aggregate.
    pub outcome: UpdateOutcome,
}

/// The ciphertext aggregate of a round, produced exactly once per
/// successfully aggregated round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    /// The round that produced this aggregate.
    pub round_number: u64,
    /// The weighted ciphertext sum with its contributor bookkeeping.
    pub ciphertext: AggregateCiphertext,
    /// When the aggregation completed.
    pub aggregated_at: DateTime<Utc>,
}

/// One round in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    /// The round number. Strictly increasing and never reused, including
    /// across failed rounds and restarts.
    pub round_number: u64,
    /// The current lifecycle state.
    pub state: RoundState,
    /// The number of accepted updates at which collection closes early.
    pub quorum: u32,
    /// The collection deadline, in seconds from opening.
    pub deadline_secs: u64,
    /// The eligibility snapshot taken when the round opened. Immutable for
    /// the lifetime of the round.
    pub invitees: Vec<NodeId>,
    /// When the round opened.
    pub opened_at: DateTime<Utc>,
    /// The updates submitted to this round, accepted and rejected alike.
    pub updates: Vec<ClientUpdate>,
    /// The ciphertext aggregate, once aggregation has succeeded.
    pub aggregate: Option<AggregateResult>,
    /// When the round reached a terminal state.
    pub ended_at: Option<DateTime<Utc>>,
}

impl RoundRecord {
    /// Creates the ledger entry for a freshly opened round.
    pub fn open(
        round_number: u64,
        quorum: u32,
        deadline_secs: u64,
        invitees: Vec<NodeId>,
    ) -> Self {
        Self {
            round_number,
            state: RoundState::Open,
            quorum,
            deadline_secs,
            invitees,
            opened_at: Utc::now(),
            updates: Vec::new(),
            aggregate: None,
            ended_at: None,
        }
    }

    /// The updates that were accepted into the aggregate.
    pub fn accepted_updates(&self) -> impl Iterator<Item = &ClientUpdate> {
        self.updates
            .iter()
            .filter(|update| update.outcome == UpdateOutcome::Accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_closed_and_failed_are_terminal() {
        assert!(RoundState::Closed.is_terminal());
        assert!(RoundState::Failed(RoundFailure::NoQuorum).is_terminal());
        for state in [
            RoundState::Open,
            RoundState::Collecting,
            RoundState::Aggregating,
            RoundState::Publishing,
        ] {
            assert!(!state.is_terminal());
        }
    }

    #[test]
    fn accepted_updates_filters_rejections() {
        let mut record = RoundRecord::open(1, 2, 60, vec!["a".into(), "b".into()]);
        record.updates.push(ClientUpdate {
            node_id: "a".into(),
            ciphertext: Ciphertext {
                params: fedmed_core::CipherParams {
                    context_id: 1,
                    scale_bits: 16,
                    weight_bits: 24,
                },
                slots: vec![0; 2],
            },
            sample_count: 10,
            norm_bound: 1.0,
            submitted_at: Utc::now(),
            outcome: UpdateOutcome::Accepted,
        });
        let rejected = ClientUpdate {
            outcome: UpdateOutcome::Rejected("anomalous".into()),
            node_id: "b".into(),
            ..record.updates[0].clone()
        };
        record.updates.push(rejected);
        assert_eq!(record.accepted_updates().count(), 1);
    }
}
