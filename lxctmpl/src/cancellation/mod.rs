//! Cooperative cancellation for build runs.
//!
//! The host owns the token and may cancel it at any time; the runner checks it
//! only at step boundaries.

mod token;

pub use token::{CancelCallback, CancellationToken};
