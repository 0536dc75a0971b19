//! Weighted homomorphic aggregation of encrypted updates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cipher::{CipherParams, Ciphertext};

/// Errors related to the aggregation of encrypted updates.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum AggregationError {
    /// The update was encrypted under different scheme parameters than the
    /// aggregate.
    #[error("scheme parameter mismatch between update and aggregate")]
    ParamsMismatch,

    /// The update's slot count does not match the aggregate's.
    #[error("the update length {update} does not match the aggregate length {aggregate}")]
    LengthMismatch {
        /// Slot count of the offending update.
        update: usize,
        /// Slot count of the aggregate.
        aggregate: usize,
    },

    /// A zero weight would silently drop the update from the aggregate.
    #[error("the update weight must be positive")]
    ZeroWeight,

    /// Adding the update would exceed the weighting headroom of the scheme
    /// parameters and could overflow the plaintext encoding.
    #[error("total weight {total} exceeds the scheme headroom {max}")]
    WeightOverflow {
        /// The total weight the aggregate would carry.
        total: u64,
        /// The maximal total weight the parameters allow.
        max: u64,
    },

    /// No updates were aggregated. Only reachable through a coordinator bug,
    /// since a round may not start aggregating with zero accepted updates.
    #[error("no updates were aggregated")]
    NoUpdates,
}

/// The ciphertext sum produced by a completed aggregation, together with the
/// bookkeeping the decryption authority needs to turn it into an average.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateCiphertext {
    /// The weighted homomorphic sum of all combined updates.
    pub ciphertext: Ciphertext,
    /// How many updates were combined.
    pub contributors: u32,
    /// The sum of all update weights. The decrypted slot values must be
    /// divided by this to obtain the weighted average.
    pub total_weight: u64,
}

/// An aggregator for encrypted model updates.
///
/// Combines updates as `sum_i(weight_i * ciphertext_i)` purely on
/// ciphertexts. Aggregation follows the validate-then-aggregate two-step:
/// callers check [`validate_aggregation`] before [`aggregate`], since
/// aggregating an incompatible update would produce garbage.
///
/// The slot arithmetic is commutative and associative, so the decrypted
/// result is independent of the order in which updates are combined.
///
/// [`validate_aggregation`]: Aggregation::validate_aggregation
/// [`aggregate`]: Aggregation::aggregate
#[derive(Debug, Clone)]
pub struct Aggregation {
    params: CipherParams,
    slots: Vec<u64>,
    contributors: u32,
    total_weight: u64,
}

impl Aggregation {
    /// Creates a new, empty aggregator for updates of `model_len` slots
    /// under the given scheme parameters.
    pub fn new(params: CipherParams, model_len: usize) -> Self {
        Self {
            params,
            slots: vec![0; model_len],
            contributors: 0,
            total_weight: 0,
        }
    }

    /// The number of updates combined so far.
    pub fn contributors(&self) -> u32 {
        self.contributors
    }

    /// The total weight combined so far.
    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    /// Validates that `update` may be safely combined into the aggregate
    /// with the given weight.
    ///
    /// # Errors
    /// Fails if the scheme parameters or lengths don't coincide, if the
    /// weight is zero, or if the new total weight would exceed the headroom
    /// of the scheme parameters.
    pub fn validate_aggregation(
        &self,
        update: &Ciphertext,
        weight: u64,
    ) -> Result<(), AggregationError> {
        if update.params != self.params {
            return Err(AggregationError::ParamsMismatch);
        }

        if update.slots.len() != self.slots.len() {
            return Err(AggregationError::LengthMismatch {
                update: update.slots.len(),
                aggregate: self.slots.len(),
            });
        }

        if weight == 0 {
            return Err(AggregationError::ZeroWeight);
        }

        let total = self
            .total_weight
            .checked_add(weight)
            .ok_or(AggregationError::WeightOverflow {
                total: u64::MAX,
                max: self.params.max_total_weight(),
            })?;
        if total > self.params.max_total_weight() {
            return Err(AggregationError::WeightOverflow {
                total,
                max: self.params.max_total_weight(),
            });
        }

        Ok(())
    }

    /// Combines `update` into the aggregate with the given weight.
    ///
    /// It should be checked that [`validate_aggregation()`] succeeds before
    /// calling this, since combining an incompatible update produces garbage
    /// slots.
    ///
    /// [`validate_aggregation()`]: Aggregation::validate_aggregation
    pub fn aggregate(&mut self, update: Ciphertext, weight: u64) {
        debug_assert!(self.validate_aggregation(&update, weight).is_ok());
        for (acc, slot) in self.slots.iter_mut().zip(update.slots) {
            *acc = acc.wrapping_add(slot.wrapping_mul(weight));
        }
        self.contributors += 1;
        self.total_weight = self.total_weight.saturating_add(weight);
    }

    /// Finishes the aggregation and returns the weighted ciphertext sum.
    ///
    /// # Errors
    /// Fails with [`AggregationError::NoUpdates`] if nothing was aggregated.
    pub fn finish(self) -> Result<AggregateCiphertext, AggregationError> {
        if self.contributors == 0 {
            return Err(AggregationError::NoUpdates);
        }
        Ok(AggregateCiphertext {
            ciphertext: Ciphertext {
                params: self.params,
                slots: self.slots,
            },
            contributors: self.contributors,
            total_weight: self.total_weight,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::testutils::EncryptionContext;
    use crate::model::Model;

    fn params() -> CipherParams {
        CipherParams {
            context_id: 42,
            scale_bits: 16,
            weight_bits: 24,
        }
    }

    #[test]
    fn rejects_params_mismatch() {
        let agg = Aggregation::new(params(), 2);
        let other = CipherParams {
            context_id: 1,
            ..params()
        };
        let ct = Ciphertext {
            params: other,
            slots: vec![0, 0],
        };
        assert_eq!(
            agg.validate_aggregation(&ct, 1),
            Err(AggregationError::ParamsMismatch)
        );
    }

    #[test]
    fn rejects_length_mismatch() {
        let agg = Aggregation::new(params(), 2);
        let ct = Ciphertext {
            params: params(),
            slots: vec![0; 3],
        };
        assert_eq!(
            agg.validate_aggregation(&ct, 1),
            Err(AggregationError::LengthMismatch {
                update: 3,
                aggregate: 2
            })
        );
    }

    #[test]
    fn rejects_weight_overflow() {
        let ctx = EncryptionContext::new(params());
        let mut agg = Aggregation::new(params(), 1);
        let ct = ctx.encrypt(&Model::from_weights(vec![1.0]));

        let max = params().max_total_weight();
        agg.validate_aggregation(&ct.clone(), max).unwrap();
        agg.aggregate(ct.clone(), max);
        assert!(matches!(
            agg.validate_aggregation(&ct, 1),
            Err(AggregationError::WeightOverflow { .. })
        ));
    }

    #[test]
    fn empty_aggregation_fails() {
        let agg = Aggregation::new(params(), 4);
        assert_eq!(agg.finish().unwrap_err(), AggregationError::NoUpdates);
    }

    #[test]
    fn weighted_average_matches_plaintext_average() {
        let ctx = EncryptionContext::new(params());
        let models = [
            Model::from_weights(vec![1.0, -2.0]),
            Model::from_weights(vec![3.0, 0.5]),
            Model::from_weights(vec![-1.5, 4.0]),
        ];
        let weights = [100_u64, 50, 200];

        let mut agg = Aggregation::new(params(), 2);
        for (model, &weight) in models.iter().zip(weights.iter()) {
            let ct = ctx.encrypt(model);
            agg.validate_aggregation(&ct, weight).unwrap();
            agg.aggregate(ct, weight);
        }
        let result = agg.finish().unwrap();
        let decrypted = ctx.decrypt_average(&result);

        let total: f64 = weights.iter().map(|&w| w as f64).sum();
        for i in 0..2 {
            let expected: f64 = models
                .iter()
                .zip(weights.iter())
                .map(|(m, &w)| m.weights()[i] as f64 * w as f64)
                .sum::<f64>()
                / total;
            assert!((decrypted.weights()[i] as f64 - expected).abs() < 1e-3);
        }
    }

    #[test]
    fn aggregation_is_order_independent() {
        let ctx = EncryptionContext::new(params());
        let updates: Vec<(Ciphertext, u64)> = vec![
            (ctx.encrypt(&Model::from_weights(vec![0.25, 1.0])), 100),
            (ctx.encrypt(&Model::from_weights(vec![-0.75, 2.0])), 50),
            (ctx.encrypt(&Model::from_weights(vec![1.5, -3.0])), 200),
        ];

        let mut forward = Aggregation::new(params(), 2);
        for (ct, w) in updates.iter() {
            forward.aggregate(ct.clone(), *w);
        }
        let mut backward = Aggregation::new(params(), 2);
        for (ct, w) in updates.iter().rev() {
            backward.aggregate(ct.clone(), *w);
        }

        let a = ctx.decrypt_average(&forward.finish().unwrap());
        let b = ctx.decrypt_average(&backward.finish().unwrap());
        assert_eq!(a, b);
    }
}
