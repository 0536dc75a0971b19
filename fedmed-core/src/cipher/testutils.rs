//! Reference codec for tests and local demos.
//!
//! This is **not** a real homomorphic encryption backend: the "ciphertext"
//! slots are a plain fixed-point encoding with no key material behind them.
//! It exists so the full aggregation pipeline (encode, weighted homomorphic
//! sum, decode) can be exercised end-to-end in tests without a production HE
//! scheme, and so the decryption-authority boundary has something to decode
//! against.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::cipher::{AggregateCiphertext, CipherParams, Ciphertext};
use crate::model::Model;

/// A shared encryption context, standing in for the key set both nodes and
/// the decryption authority would hold in a real deployment.
#[derive(Debug, Clone)]
pub struct EncryptionContext {
    params: CipherParams,
}

impl EncryptionContext {
    /// Creates a context with the given scheme parameters.
    pub fn new(params: CipherParams) -> Self {
        Self { params }
    }

    /// Creates a context with a randomly generated context id, the way a
    /// fresh deployment would provision one.
    pub fn generate(scale_bits: u8, weight_bits: u8) -> Self {
        let mut rng = ChaCha20Rng::from_entropy();
        Self {
            params: CipherParams {
                context_id: rng.gen(),
                scale_bits,
                weight_bits,
            },
        }
    }

    /// The scheme parameters of this context.
    pub fn params(&self) -> CipherParams {
        self.params
    }

    /// Encodes a plaintext model into a ciphertext under this context.
    pub fn encrypt(&self, model: &Model) -> Ciphertext {
        let scale = (1_u64 << self.params.scale_bits) as f64;
        let slots = model
            .weights()
            .iter()
            .map(|&w| ((w as f64 * scale).round() as i64) as u64)
            .collect();
        Ciphertext {
            params: self.params,
            slots,
        }
    }

    /// Decodes an aggregate back into the weighted-average plaintext model.
    ///
    /// In a real deployment this is the decryption authority's operation:
    /// it is only ever applied to aggregates, never to individual updates.
    pub fn decrypt_average(&self, aggregate: &AggregateCiphertext) -> Model {
        let scale = (1_u64 << self.params.scale_bits) as f64;
        let divisor = scale * aggregate.total_weight as f64;
        aggregate
            .ciphertext
            .slots
            .iter()
            .map(|&slot| ((slot as i64) as f64 / divisor) as f32)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::Aggregation;

    #[test]
    fn encode_decode_roundtrip_single_update() {
        let ctx = EncryptionContext::generate(16, 20);
        let model = Model::from_weights(vec![0.5, -1.25, 3.0]);

        let mut agg = Aggregation::new(ctx.params(), 3);
        agg.aggregate(ctx.encrypt(&model), 1);
        let decoded = ctx.decrypt_average(&agg.finish().unwrap());

        for (a, b) in decoded.weights().iter().zip(model.weights()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn generated_contexts_differ() {
        let a = EncryptionContext::generate(16, 20);
        let b = EncryptionContext::generate(16, 20);
        assert_ne!(a.params().context_id, b.params().context_id);
    }
}
