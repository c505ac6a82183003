//! Error kinds internal operations can raise (§7).
//!
//! Plugin extension points themselves never return `Result` — they return a
//! `Status`/`Code` pair (see `crate::plugin::{Status, Code}`) because "this pod is
//! unschedulable right now" is an expected outcome, not a failure. `ScheduleError`
//! is for the layer underneath: writing a reservation, or an invariant violation
//! that should never happen. Plugins catch these and fold them into `Status::error(..)`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("reservation store write failed for {gang_key}: {source}")]
    ReservationWriteFailed {
        gang_key: String,
        #[source]
        source: anyhow::Error,
    },

    /// A plugin's extension point observed `CycleState` in a state it should be
    /// structurally impossible to be in (e.g. ran before `ProfileClassifier`).
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}
