//! # lxctmpl
//!
//! Builds reusable Proxmox LXC templates from disposable, provisioned
//! containers.
//!
//! A build runs a fixed sequence of steps against a Proxmox node:
//!
//! - **Credentials**: use configured SSH credentials or generate an ephemeral ed25519 key
//! - **Create and start**: allocate an identity and boot the build container
//! - **Provision**: connect and hand the container to the host's provisioners
//! - **Convert**: stop the container and dump it to a backup archive
//! - **Save**: transfer the newest archive and upload it, renamed, as a template
//!
//! Any failure or cancellation unwinds the executed steps in reverse, so a
//! half-built container never outlives its run.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use lxctmpl::prelude::*;
//!
//! let mut builder = Builder::from_json(&raw_config)?;
//! let prepared = builder.prepare()?;
//!
//! let cancel = CancellationToken::new();
//! let artifact = builder.run(&cancel, services).await?;
//! println!("{artifact}");
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod builder;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod credentials;
pub mod errors;
pub mod host;
pub mod observability;
pub mod pipeline;
pub mod platform;
pub mod state;
pub mod steps;
pub mod template;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transfer;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::builder::{Builder, Prepared, GENERATED_DATA_KEYS};
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{CommConfig, Config};
    pub use crate::core::{Artifact, RunStatus, StepAction, BUILDER_ID};
    pub use crate::errors::{
        BuildError, ConfigError, ConversionStage, PlatformError, StateConflictError,
        TransferError,
    };
    pub use crate::host::{Communicator, ConnectTarget, Hook, TracingUi, Ui};
    pub use crate::observability::{init_tracing, try_init_tracing, LogFormat};
    pub use crate::pipeline::{RunReport, Runner, RunnerOptions};
    pub use crate::platform::{InstanceRef, PlatformClient};
    pub use crate::state::{RunServices, RunState};
    pub use crate::steps::{CleanupFailure, Step};
    pub use crate::transfer::{FileTransfer, TransferSession, TransferTarget};
}
