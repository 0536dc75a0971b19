//! Screening of submitted updates.
//!
//! Every submission passes through the [`UpdateValidator`] before it is
//! considered for aggregation. The checks run in a fixed order and
//! short-circuit on the first failure: structural well-formedness of the
//! ciphertext, invitation and current eligibility of the node, plausibility
//! of the self-reported sample count, and finally a statistical screen of
//! the declared update norm against the other updates of the round.
//!
//! Validation is side-effect free; it never touches the round ledger.

use std::collections::HashSet;

use thiserror::Error;

use fedmed_core::{CipherParams, Ciphertext, NodeId};

use crate::{registry::NodeRegistry, settings::ValidationSettings};

/// The reason a submitted update was rejected.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    /// The ciphertext is structurally unusable for aggregation.
    #[error("malformed ciphertext: expected {expected} slots under the deployment parameters")]
    MalformedCiphertext {
        /// The slot count the deployment expects.
        expected: usize,
    },

    /// The node is not part of the round's invitee snapshot.
    #[error("the node {0} was not invited to this round")]
    NotInvited(NodeId),

    /// The node was suspended after the round opened.
    #[error("the node {0} is suspended")]
    NodeSuspended(NodeId),

    /// The self-reported sample count is implausible.
    #[error("invalid sample count {count}: must be in 1..={max}")]
    InvalidSampleCount {
        /// The reported sample count.
        count: u64,
        /// The configured upper bound.
        max: u64,
    },

    /// The declared update norm is a statistical outlier among the accepted
    /// updates of the round.
    #[error("anomalous update norm {norm_bound}: z-score {z_score:.2} exceeds the threshold")]
    AnomalyDetected {
        /// The declared norm bound.
        norm_bound: f64,
        /// The robust z-score against the accepted peers.
        z_score: f64,
    },
}

/// Validates submitted updates against the deployment parameters and the
/// state of the round.
#[derive(Debug, Clone)]
pub struct UpdateValidator {
    params: CipherParams,
    model_length: usize,
    max_sample_count: u64,
    anomaly_threshold: f64,
    min_anomaly_peers: usize,
}

impl UpdateValidator {
    /// Creates a validator for the given deployment parameters.
    pub fn new(params: CipherParams, model_length: usize, settings: ValidationSettings) -> Self {
        Self {
            params,
            model_length,
            max_sample_count: settings.max_sample_count,
            anomaly_threshold: settings.anomaly_threshold,
            min_anomaly_peers: settings.min_anomaly_peers,
        }
    }

    /// Checks whether a submission may be accepted into the round.
    ///
    /// `invitees` is the eligibility snapshot taken when the round opened and
    /// `peer_norm_bounds` are the declared norms of the updates accepted so
    /// far. A node that was invited but has been suspended since the round
    /// opened cannot submit a new update.
    ///
    /// # Errors
    /// Fails with the first check that rejects the submission.
    pub fn validate(
        &self,
        registry: &NodeRegistry,
        invitees: &HashSet<NodeId>,
        peer_norm_bounds: &[f64],
        node_id: &NodeId,
        ciphertext: &Ciphertext,
        sample_count: u64,
        norm_bound: f64,
    ) -> Result<(), ValidationError> {
        if !ciphertext.is_well_formed(&self.params, self.model_length) {
            return Err(ValidationError::MalformedCiphertext {
                expected: self.model_length,
            });
        }

        if !invitees.contains(node_id) {
            return Err(ValidationError::NotInvited(node_id.clone()));
        }
        if !registry.is_active(node_id) {
            return Err(ValidationError::NodeSuspended(node_id.clone()));
        }

        if sample_count == 0 || sample_count > self.max_sample_count {
            return Err(ValidationError::InvalidSampleCount {
                count: sample_count,
                max: self.max_sample_count,
            });
        }

        if let Some(z_score) = self.z_score(norm_bound, peer_norm_bounds) {
            if z_score > self.anomaly_threshold {
                return Err(ValidationError::AnomalyDetected {
                    norm_bound,
                    z_score,
                });
            }
        }

        Ok(())
    }

    /// The robust z-score of `norm_bound` against the accepted peers, or
    /// `None` when there are too few peers or no spread to score against.
    ///
    /// Scored with the median and the median absolute deviation instead of
    /// the mean and standard deviation: a few tightly clustered peers must
    /// not flag an unremarkable neighbor.
    fn z_score(&self, norm_bound: f64, peers: &[f64]) -> Option<f64> {
        if peers.len() < self.min_anomaly_peers {
            return None;
        }
        let center = median(peers)?;
        let deviations: Vec<f64> = peers.iter().map(|x| (x - center).abs()).collect();
        let mad = median(&deviations)?;
        if mad == 0.0 {
            return None;
        }
        // 0.6745 scales the MAD to the standard deviation of a normal
        // distribution, so the threshold reads like an ordinary z-score
        Some(0.6745 * (norm_bound - center).abs() / mad)
    }
}

fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedmed_core::{NodePublicKey, PUBLIC_KEY_LENGTH};

    fn params() -> CipherParams {
        CipherParams {
            context_id: 1,
            scale_bits: 16,
            weight_bits: 24,
        }
    }

    fn settings() -> ValidationSettings {
        ValidationSettings {
            max_sample_count: 100_000,
            anomaly_threshold: 2.5,
            min_anomaly_peers: 2,
        }
    }

    fn validator() -> UpdateValidator {
        UpdateValidator::new(params(), 4, settings())
    }

    fn ciphertext() -> Ciphertext {
        Ciphertext {
            params: params(),
            slots: vec![0; 4],
        }
    }

    fn active_registry(ids: &[&str]) -> NodeRegistry {
        let registry = NodeRegistry::new();
        for id in ids {
            let key = NodePublicKey::from_slice(&[7; PUBLIC_KEY_LENGTH]).unwrap();
            registry.register(NodeId::from(*id), key).unwrap();
            registry.heartbeat(&NodeId::from(*id)).unwrap();
        }
        registry
    }

    fn invitees(ids: &[&str]) -> HashSet<NodeId> {
        ids.iter().map(|id| NodeId::from(*id)).collect()
    }

    #[test]
    fn wrong_slot_count_is_malformed() {
        let registry = active_registry(&["a"]);
        let ct = Ciphertext {
            params: params(),
            slots: vec![0; 3],
        };
        let err = validator()
            .validate(&registry, &invitees(&["a"]), &[], &"a".into(), &ct, 10, 1.0)
            .unwrap_err();
        assert_eq!(err, ValidationError::MalformedCiphertext { expected: 4 });
    }

    #[test]
    fn uninvited_node_is_rejected() {
        let registry = active_registry(&["a", "b"]);
        let err = validator()
            .validate(
                &registry,
                &invitees(&["a"]),
                &[],
                &"b".into(),
                &ciphertext(),
                10,
                1.0,
            )
            .unwrap_err();
        assert_eq!(err, ValidationError::NotInvited("b".into()));
    }

    #[test]
    fn node_suspended_mid_round_cannot_submit() {
        let registry = active_registry(&["a"]);
        registry.suspend(&"a".into(), "audit").unwrap();
        let err = validator()
            .validate(
                &registry,
                &invitees(&["a"]),
                &[],
                &"a".into(),
                &ciphertext(),
                10,
                1.0,
            )
            .unwrap_err();
        assert_eq!(err, ValidationError::NodeSuspended("a".into()));
    }

    #[test]
    fn sample_count_bounds_are_enforced() {
        let registry = active_registry(&["a"]);
        for count in [0, 100_001] {
            let err = validator()
                .validate(
                    &registry,
                    &invitees(&["a"]),
                    &[],
                    &"a".into(),
                    &ciphertext(),
                    count,
                    1.0,
                )
                .unwrap_err();
            assert!(matches!(err, ValidationError::InvalidSampleCount { .. }));
        }
    }

    #[test]
    fn outlier_norm_is_rejected_once_peers_exist() {
        let registry = active_registry(&["a"]);
        let v = validator();

        // no peers yet: the screen is skipped
        v.validate(
            &registry,
            &invitees(&["a"]),
            &[],
            &"a".into(),
            &ciphertext(),
            10,
            1000.0,
        )
        .unwrap();

        let peers = [1.0, 1.2, 0.9, 1.1];
        let err = v
            .validate(
                &registry,
                &invitees(&["a"]),
                &peers,
                &"a".into(),
                &ciphertext(),
                10,
                1000.0,
            )
            .unwrap_err();
        assert!(matches!(err, ValidationError::AnomalyDetected { .. }));

        // an unremarkable norm passes against the same peers
        v.validate(
            &registry,
            &invitees(&["a"]),
            &peers,
            &"a".into(),
            &ciphertext(),
            10,
            1.05,
        )
        .unwrap();
    }

    #[test]
    fn tightly_clustered_peers_do_not_flag_a_benign_neighbor() {
        let registry = active_registry(&["a"]);
        let v = validator();
        let peers = [1.0, 1.1];

        v.validate(
            &registry,
            &invitees(&["a"]),
            &peers,
            &"a".into(),
            &ciphertext(),
            10,
            0.9,
        )
        .unwrap();

        let err = v
            .validate(
                &registry,
                &invitees(&["a"]),
                &peers,
                &"a".into(),
                &ciphertext(),
                10,
                100.0,
            )
            .unwrap_err();
        assert!(matches!(err, ValidationError::AnomalyDetected { .. }));
    }

    #[test]
    fn identical_peer_norms_do_not_divide_by_zero() {
        let registry = active_registry(&["a"]);
        validator()
            .validate(
                &registry,
                &invitees(&["a"]),
                &[1.0, 1.0, 1.0],
                &"a".into(),
                &ciphertext(),
                10,
                5.0,
            )
            .unwrap();
    }
}
