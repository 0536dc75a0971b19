//! Persistence for the round ledger and the model version history.
//!
//! The state machine is generic over the [`RoundStorage`] and
//! [`ModelStorage`] traits. [`MemoryRoundStorage`]/[`MemoryModelStorage`]
//! back tests and demos, [`FileRoundStorage`]/[`FileModelStorage`] persist
//! bincode snapshots that survive a restart.

mod file;
mod memory;
mod traits;

pub use self::{
    file::{FileModelStorage, FileRoundStorage},
    memory::{MemoryModelStorage, MemoryRoundStorage},
    traits::{ModelStorage, RoundStorage, StorageError, StorageResult, Store, VersionOrder},
};
