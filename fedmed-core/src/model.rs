//! Plaintext model artifacts and the published version history.

use std::iter::FromIterator;

use chrono::{DateTime, Utc};
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

/// A plaintext global model, as produced by the decryption authority after a
/// round closes.
///
/// Individual node updates are never represented in plaintext inside the
/// coordinator; this type only ever holds decrypted *aggregates*.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, From, Into)]
pub struct Model(Vec<f32>);

impl Model {
    /// Creates a model from raw weights.
    pub fn from_weights(weights: Vec<f32>) -> Self {
        Self(weights)
    }

    /// Returns the number of weights in the model.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the model holds no weights.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the weights as a slice.
    pub fn weights(&self) -> &[f32] {
        &self.0
    }
}

impl FromIterator<f32> for Model {
    fn from_iter<I: IntoIterator<Item = f32>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A reference to a stored model artifact (e.g. a path or object-store key).
///
/// The coordinator treats the reference as opaque; resolving it is the
/// artifact store's concern.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into,
)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    /// Creates an artifact reference.
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// Returns the reference as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ArtifactRef {
    fn from(reference: &str) -> Self {
        Self(reference.to_string())
    }
}

/// One entry in the append-only global model history.
///
/// Versions are never mutated after creation; corrections are modeled as new
/// versions with a descriptive note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    /// The version number, derived from the round that produced it.
    pub version_number: u64,
    /// Where the model artifact lives.
    pub artifact_ref: ArtifactRef,
    /// Average evaluation accuracy reported for this version.
    pub avg_accuracy: f32,
    /// Average evaluation loss reported for this version.
    pub avg_loss: f32,
    /// How many clients contributed to this version.
    pub num_clients: u32,
    /// When the version was recorded.
    pub created_at: DateTime<Utc>,
    /// A human-readable description.
    pub description: String,
}

/// Per-round training metrics emitted to the reporting store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundMetrics {
    /// The round that produced these metrics.
    pub round_number: u64,
    /// Average evaluation accuracy across contributing clients.
    pub avg_accuracy: f32,
    /// Average evaluation loss across contributing clients.
    pub avg_loss: f32,
    /// How many clients contributed to the aggregate.
    pub num_clients: u32,
    /// When the metrics were produced.
    pub timestamp: DateTime<Utc>,
}
