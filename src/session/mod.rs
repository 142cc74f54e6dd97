//! Call Session Manager - lifecycle of calls and conferences
//!
//! - Session model (state machine, participants, controls, end reasons)
//! - `CallService`: actor that owns the live session and its resources

mod manager;
mod model;

pub use manager::{CallDeps, CallEvent, CallService, Diagnostics};
pub use model::*;
