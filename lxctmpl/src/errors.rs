//! Error types for the template builder.
//!
//! `BuildError` is the terminal error surfaced to the host. Collaborator
//! failures (`PlatformError`, `TransferError`) are wrapped by the step that
//! observed them so every fatal error names the stage it came from.

use std::fmt;
use thiserror::Error;

/// The main error type for a build run.
#[derive(Debug, Error)]
pub enum BuildError {
    /// No free instance identity could be obtained.
    #[error("failed to get free VM ID after {attempts} attempts")]
    Allocation {
        /// How many lookups were made.
        attempts: usize,
        /// The last lookup error, if any.
        last_error: Option<String>,
    },

    /// Key material could not be prepared.
    #[error("error preparing credentials: {0}")]
    Credentials(String),

    /// The instance could not be created.
    #[error("error creating LXC container: {0}")]
    Creation(#[source] PlatformError),

    /// The instance was created but could not be started.
    #[error("error starting LXC container: {0}")]
    Start(#[source] PlatformError),

    /// The remote shell could not be reached or used.
    #[error("communicator error: {0}")]
    Connectivity(String),

    /// An external provisioning action failed.
    #[error("error provisioning container: {0}")]
    Provision(String),

    /// A stop/backup/wait stage of the conversion failed.
    #[error("error converting VM to template, {stage}: {message}")]
    Conversion {
        /// The stage that failed.
        stage: ConversionStage,
        /// The underlying failure.
        message: String,
    },

    /// No backup archive matched the instance.
    #[error("error finding latest backup: {0}")]
    BackupNotFound(String),

    /// Moving the archive into the template store failed.
    #[error("error saving template: {0}")]
    Transfer(String),

    /// Configuration rejected by `Config::prepare`.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A write-once run state value was written twice.
    #[error("{0}")]
    StateConflict(#[from] StateConflictError),

    /// The run finished without producing a template.
    #[error("{0}")]
    Incomplete(String),

    /// The run was cancelled by the host.
    #[error("build was cancelled")]
    Cancelled,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BuildError {
    /// Creates a conversion error for the given stage.
    #[must_use]
    pub fn conversion(stage: ConversionStage, message: impl fmt::Display) -> Self {
        Self::Conversion {
            stage,
            message: message.to_string(),
        }
    }

    /// Returns true for the cancellation terminal condition.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Labels for the sub-stages of the stop-and-convert step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionStage {
    /// Graceful shutdown of the instance.
    Stop,
    /// Issuing the backup operation.
    Backup,
    /// Waiting for the backup task.
    Wait,
    /// Listing the backup pool.
    List,
}

impl fmt::Display for ConversionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => write!(f, "could not stop"),
            Self::Backup => write!(f, "failed to create backup"),
            Self::Wait => write!(f, "failed to wait process completion"),
            Self::List => write!(f, "failed to list backups"),
        }
    }
}

/// Errors returned by the virtualization platform client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    /// The addressed resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The API rejected the request.
    #[error("api error: {0}")]
    Api(String),

    /// The request never reached the API.
    #[error("transport error: {0}")]
    Transport(String),

    /// A task did not finish in time.
    #[error("task timed out: {0}")]
    Timeout(String),
}

impl PlatformError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Creates an API error.
    #[must_use]
    pub fn api(message: impl Into<String>) -> Self {
        Self::Api(message.into())
    }

    /// Creates a transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Returns true when the resource is already absent.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Errors returned by the remote file-transfer session.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Authentication against the remote host failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The remote path does not exist.
    #[error("remote file not found: {0}")]
    NotFound(String),

    /// The session broke down.
    #[error("transfer session error: {0}")]
    Session(String),

    /// Local IO failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error raised when a write-once run state value is written twice.
#[derive(Debug, Clone, Error)]
#[error("run state conflict: '{key}' is already set")]
pub struct StateConflictError {
    /// The conflicting key.
    pub key: String,
}

impl StateConflictError {
    /// Creates a new state conflict error.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// Configuration validation failure carrying every violation found.
#[derive(Debug, Clone, Error, Default)]
#[error("invalid configuration: {}", errors.join("; "))]
pub struct ConfigError {
    /// Individual violations.
    pub errors: Vec<String>,
}

impl ConfigError {
    /// Creates an empty error collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one violation.
    pub fn push(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}
