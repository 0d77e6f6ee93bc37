//! Deterministic order and position management.
//!
//! Runs as the live engine's decision half:
//! - Reconciles tracked positions against the broker's day book
//! - Drives each position through its protective-stop lifecycle
//! - Places entries off fresh signals, one attempt per bucket
//! - Squares everything off ahead of the session close
//!
//! Every rule here is deterministic; quotes and bars are the only inputs.

pub mod coordinator;
pub mod engine;
pub mod entry;
pub mod lifecycle;
pub mod types;

pub use coordinator::{OrderCoordinator, UnderlyingView};
pub use types::{Position, PositionState};
