//! The decryption authority boundary.
//!
//! The coordinator never holds the private key of the deployment. Once a
//! round's updates have been summed in the ciphertext domain, the aggregate
//! is handed to an external party that decrypts it, evaluates the resulting
//! model and reports the evaluation back. Only aggregates ever cross this
//! boundary; individual node updates do not.

use async_trait::async_trait;

use fedmed_core::{AggregateCiphertext, Model};

/// The error type for authority calls. Opaque to the coordinator, which
/// treats any failure here as a failure of the round.
pub type AuthorityError = anyhow::Error;

/// A decrypted and evaluated round aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// The plaintext global model, already divided by the total weight.
    pub model: Model,
    /// Average evaluation accuracy of the new model.
    pub avg_accuracy: f32,
    /// Average evaluation loss of the new model.
    pub avg_loss: f32,
}

/// The external holder of the deployment's private key.
#[async_trait]
pub trait DecryptionAuthority: Send + Sync + 'static {
    /// Decrypts a round aggregate into the weighted-average plaintext model
    /// and evaluates it.
    ///
    /// # Behavior
    ///
    /// - Must only ever be called with the aggregate of a full round, never
    ///   with an individual update.
    /// - On success, returns the [`Evaluation`] of the new global model.
    /// - Any error fails the round; the coordinator does not retry.
    async fn decrypt_aggregate(
        &self,
        aggregate: &AggregateCiphertext,
    ) -> Result<Evaluation, AuthorityError>;
}

#[cfg(any(test, feature = "testutils"))]
pub use self::testutils::InsecureAuthority;

#[cfg(any(test, feature = "testutils"))]
mod testutils {
    use super::*;

    use fedmed_core::cipher::testutils::EncryptionContext;

    /// A local stand-in for the external key holder, built on the insecure
    /// reference codec. Evaluation metrics are synthesized from the decoded
    /// model since there is no evaluation set to score against.
    #[derive(Debug, Clone)]
    pub struct InsecureAuthority {
        context: EncryptionContext,
    }

    impl InsecureAuthority {
        pub fn new(context: EncryptionContext) -> Self {
            Self { context }
        }
    }

    #[async_trait]
    impl DecryptionAuthority for InsecureAuthority {
        async fn decrypt_aggregate(
            &self,
            aggregate: &AggregateCiphertext,
        ) -> Result<Evaluation, AuthorityError> {
            let model = self.context.decrypt_average(aggregate);
            let mean = if model.is_empty() {
                0.0
            } else {
                model.weights().iter().sum::<f32>() / model.len() as f32
            };
            Ok(Evaluation {
                model,
                avg_accuracy: 1.0 / (1.0 + mean.abs()),
                avg_loss: mean.abs(),
            })
        }
    }
}
