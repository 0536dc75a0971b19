//! The coordinator state shared across phases.

use fedmed_core::CipherParams;

use crate::settings::CipherSettings;

/// The part of the coordinator state that every phase can read.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorState {
    /// The number of the current round, or of the last round if none is
    /// live. `0` before the first round has ever been opened.
    pub round_id: u64,
    /// The encryption scheme parameters of the deployment.
    pub cipher: CipherParams,
    /// The slot count every submitted ciphertext must carry.
    pub model_length: usize,
}

impl CoordinatorState {
    /// Creates the coordinator state from the deployment settings and the
    /// highest round number found in the ledger.
    pub fn new(cipher: CipherSettings, last_round_number: u64) -> Self {
        Self {
            round_id: last_round_number,
            cipher: CipherParams {
                context_id: cipher.context_id,
                scale_bits: cipher.scale_bits,
                weight_bits: cipher.weight_bits,
            },
            model_length: cipher.model_length,
        }
    }
}
