//! The fedmed coordinator.
//!
//! This crate runs federated training rounds for a consortium of medical
//! institutions. Nodes register with the [`registry`], the round
//! [`state_machine`] invites the active ones, collects their encrypted model
//! updates, aggregates them homomorphically and hands the aggregate to an
//! external [decryption authority] for decryption and evaluation. Closed
//! rounds are recorded in an append-only ledger and model version history
//! via the [`storage`] traits, and per-round training metrics are shipped
//! through the fire-and-forget [`metrics`] dispatcher.
//!
//! Individual node updates are never decrypted: only the aggregate of a
//! round ever leaves the ciphertext domain, and it does so outside of this
//! crate.
//!
//! [decryption authority]: crate::authority::DecryptionAuthority

pub mod authority;
pub mod metrics;
pub mod registry;
pub mod settings;
pub mod state_machine;
pub mod storage;
pub mod validator;
