//! In-memory fakes for exercising steps and whole runs.
//!
//! This module provides:
//! - A fake single-node cluster implementing the platform and transfer ports
//! - Recording fakes for the provisioning hook and remote shell
//! - Scripted steps for runner tests
//! - A harness wiring all of the above around one configuration
//!
//! Compiled for this crate's tests and, for host crates, behind the
//! `testing` feature.

mod cluster;
mod collaborators;
mod fixtures;
mod steps;

pub use crate::host::RecordingUi;
pub use cluster::{FakeCluster, FakeContainer, FakeSession};
pub use collaborators::{FakeCommunicator, FakeHook};
pub use fixtures::Harness;
pub use steps::{RecordingStep, StepLog};
