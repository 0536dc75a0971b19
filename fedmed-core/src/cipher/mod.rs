//! Ciphertexts and homomorphic aggregation.
//!
//! A [`Ciphertext`] is an opaque vector of 64-bit slots produced by an
//! additively-homomorphic encryption scheme, tagged with the
//! [`CipherParams`] it was encrypted under. The coordinator relies on two
//! properties only:
//!
//! - slot-wise addition of two ciphertexts encrypts the sum of the two
//!   plaintexts,
//! - scaling a ciphertext by an integer weight encrypts the weighted
//!   plaintext.
//!
//! Both operations are commutative and associative, so the decrypted result
//! of a weighted sum does not depend on the order in which updates were
//! combined. The scheme's own primitives (key generation, encryption,
//! decryption) live outside the coordinator; see [`testutils`] for the
//! insecure reference codec used by tests.

mod aggregation;
#[cfg(any(test, feature = "testutils"))]
pub mod testutils;

pub use self::aggregation::{AggregateCiphertext, Aggregation, AggregationError};

use serde::{Deserialize, Serialize};

/// Parameters of the encryption scheme a ciphertext was produced under.
///
/// Two ciphertexts can only be combined when their parameters coincide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherParams {
    /// Identifies the encryption context (key set) in use. All updates of a
    /// deployment must be encrypted under the same context.
    pub context_id: u64,
    /// Number of fractional bits of the fixed-point plaintext encoding.
    pub scale_bits: u8,
    /// Headroom reserved for aggregation weights: the total weight combined
    /// into one aggregate must stay below `2^weight_bits`.
    pub weight_bits: u8,
}

impl CipherParams {
    /// The maximal total weight an aggregate under these parameters may
    /// carry before the encoding runs out of headroom. Saturates at
    /// [`u64::MAX`] when `weight_bits` exceeds the slot width.
    pub fn max_total_weight(&self) -> u64 {
        1_u64
            .checked_shl(self.weight_bits as u32)
            .unwrap_or(u64::MAX)
    }
}

/// An encrypted model update (or aggregate of updates).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext {
    /// The scheme parameters this ciphertext was produced under.
    pub params: CipherParams,
    /// The opaque encrypted slots, one per model weight.
    pub slots: Vec<u64>,
}

impl Ciphertext {
    /// Returns the number of encrypted slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the ciphertext holds no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Checks structural well-formedness against the deployment's expected
    /// scheme parameters and model length.
    ///
    /// This is the only structural check the coordinator can perform without
    /// the private key: the slots themselves are opaque.
    pub fn is_well_formed(&self, params: &CipherParams, model_len: usize) -> bool {
        self.params == *params && !self.slots.is_empty() && self.slots.len() == model_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> CipherParams {
        CipherParams {
            context_id: 7,
            scale_bits: 16,
            weight_bits: 20,
        }
    }

    #[test]
    fn well_formedness_checks_params_and_length() {
        let ct = Ciphertext {
            params: params(),
            slots: vec![0; 4],
        };
        assert!(ct.is_well_formed(&params(), 4));
        assert!(!ct.is_well_formed(&params(), 5));

        let other = CipherParams {
            context_id: 8,
            ..params()
        };
        assert!(!ct.is_well_formed(&other, 4));
    }

    #[test]
    fn max_total_weight_saturates_for_wide_headroom() {
        assert_eq!(params().max_total_weight(), 1 << 20);

        let wide = CipherParams {
            weight_bits: 64,
            ..params()
        };
        assert_eq!(wide.max_total_weight(), u64::MAX);
        let wider = CipherParams {
            weight_bits: u8::MAX,
            ..params()
        };
        assert_eq!(wider.max_total_weight(), u64::MAX);
    }

    #[test]
    fn empty_ciphertext_is_malformed() {
        let ct = Ciphertext {
            params: params(),
            slots: vec![],
        };
        assert!(!ct.is_well_formed(&params(), 0));
    }
}
