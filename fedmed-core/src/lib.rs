//! # fedmed-core
//!
//! Shared domain types and ciphertext arithmetic for the fedmed federated
//! learning coordinator.
//!
//! The crate covers three concerns:
//!
//! - participant identity: [`NodeId`], [`NodePublicKey`] and the [`Node`]
//!   registry record,
//! - the published artifacts: the plaintext [`Model`], the append-only
//!   [`ModelVersion`] history and the per-round [`RoundMetrics`],
//! - the [`cipher`] module: the additively-homomorphic [`Ciphertext`]
//!   abstraction and the weighted [`Aggregation`] engine that combines
//!   encrypted updates without ever decrypting an individual contribution.
//!
//! The concrete homomorphic encryption scheme is deliberately out of scope:
//! ciphertexts are opaque slot vectors tagged with scheme parameters, and the
//! only operations the coordinator relies on are commutative slot-wise
//! addition and scalar weighting. The private key never enters this crate;
//! decryption belongs to the external decryption authority.

pub mod cipher;
pub mod model;
pub mod node;

pub use self::{
    cipher::{AggregateCiphertext, Aggregation, AggregationError, CipherParams, Ciphertext},
    model::{ArtifactRef, Model, ModelVersion, RoundMetrics},
    node::{Node, NodeId, NodePublicKey, NodeStatus, PUBLIC_KEY_LENGTH},
};
