//! Core domain model types.
//!
//! This module contains the fundamental types shared by the runner and steps:
//! - Step outcomes and run status enums
//! - The build artifact

mod artifact;
mod status;

pub use artifact::{Artifact, BUILDER_ID};
pub use status::{RunStatus, StepAction};
