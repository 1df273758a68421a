//! Observability utilities.
//!
//! This module provides:
//! - Subscriber installation for plain or JSON logs
//! - Step span attributes and timing
//! - Wide events summarizing steps and whole runs

mod subscriber;
mod spans;
mod wide_events;

pub use subscriber::{init_tracing, try_init_tracing, LogFormat};
pub use spans::{SpanTimer, StepSpanAttributes};
pub use wide_events::WideEventEmitter;
