//! End-to-end tests that drive the state machine through whole rounds.

pub(crate) mod utils;
