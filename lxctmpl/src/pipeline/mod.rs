//! Pipeline execution.
//!
//! This module provides:
//! - The sequential runner with reverse cleanup
//! - Bounded retry used by steps that poll the platform

mod retry;
mod runner;

#[cfg(test)]
mod integration_tests;

pub use retry::{with_retry, BackoffStrategy, JitterStrategy, RetryConfig};
pub use runner::{RunReport, Runner, RunnerOptions};
