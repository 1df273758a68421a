//! Typed state shared by the steps of one run.
//!
//! Each step reads what earlier steps produced and records what later steps
//! and cleanup need. Identity values are write-once: a second write is a
//! [`StateConflictError`], never a silent overwrite.

use crate::config::{CommConfig, Config};
use crate::core::{RunStatus, StepAction};
use crate::errors::{BuildError, StateConflictError};
use crate::host::{Communicator, Hook, Ui};
use crate::platform::{InstanceRef, PlatformClient};
use crate::transfer::FileTransfer;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Collaborators handed to a run by the host.
#[derive(Clone)]
pub struct RunServices {
    /// Virtualization platform.
    pub platform: Arc<dyn PlatformClient>,
    /// File transfer against the platform node.
    pub transfer: Arc<dyn FileTransfer>,
    /// Provisioning hook.
    pub hook: Arc<dyn Hook>,
    /// Remote shell into the container.
    pub communicator: Arc<dyn Communicator>,
    /// Progress reporting.
    pub ui: Arc<dyn Ui>,
}

impl fmt::Debug for RunServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunServices").finish_non_exhaustive()
    }
}

/// The backup archive located after conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    /// Volume id in the backup pool.
    pub volid: String,
    /// Archive file name.
    pub name: String,
    /// Archive extension, e.g. `tar.gz`.
    pub extension: String,
    /// Creation time reported by the pool.
    pub ctime: DateTime<Utc>,
    /// Absolute path on the node, when the pool reported one.
    pub path: String,
}

/// Mutable state of one pipeline run.
pub struct RunState {
    /// Unique id of this run, used in log spans.
    pub run_id: Uuid,
    /// When the run state was created.
    pub started_at: DateTime<Utc>,
    /// Prepared configuration.
    pub config: Arc<Config>,
    /// Remote-shell settings, completed by the credential step.
    pub comm: CommConfig,
    /// Host to reach the container on, resolved by the connect step.
    pub comm_host: Option<String>,
    /// Collaborators.
    pub services: RunServices,
    /// Lifecycle status, maintained by the runner.
    pub status: RunStatus,
    /// Data exported to the host after creation.
    pub generated_data: serde_json::Map<String, serde_json::Value>,
    /// Set by the final step once the template exists.
    pub succeeded: bool,
    instance: Option<InstanceRef>,
    backup: Option<BackupRecord>,
    template_name: Option<String>,
    error: Option<BuildError>,
}

impl fmt::Debug for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunState")
            .field("run_id", &self.run_id)
            .field("status", &self.status)
            .field("instance", &self.instance)
            .field("backup", &self.backup)
            .field("template_name", &self.template_name)
            .field("succeeded", &self.succeeded)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl RunState {
    /// Creates a fresh state for one run.
    #[must_use]
    pub fn new(config: Arc<Config>, services: RunServices) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            comm: config.comm.clone(),
            config,
            comm_host: None,
            services,
            status: RunStatus::Idle,
            generated_data: serde_json::Map::new(),
            succeeded: false,
            instance: None,
            backup: None,
            template_name: None,
            error: None,
        }
    }

    /// The created container, once known.
    #[must_use]
    pub fn instance(&self) -> Option<&InstanceRef> {
        self.instance.as_ref()
    }

    /// Records the created container.
    ///
    /// # Errors
    ///
    /// Returns `StateConflictError` if a container was already recorded.
    pub fn set_instance(&mut self, instance: InstanceRef) -> Result<(), StateConflictError> {
        set_once(&mut self.instance, instance, "instance")
    }

    /// The located backup archive, once known.
    #[must_use]
    pub fn backup(&self) -> Option<&BackupRecord> {
        self.backup.as_ref()
    }

    /// Records the located backup archive.
    ///
    /// # Errors
    ///
    /// Returns `StateConflictError` if a backup was already recorded.
    pub fn set_backup(&mut self, backup: BackupRecord) -> Result<(), StateConflictError> {
        set_once(&mut self.backup, backup, "backup")
    }

    /// Name of the produced template, once known.
    #[must_use]
    pub fn template_name(&self) -> Option<&str> {
        self.template_name.as_deref()
    }

    /// Records the produced template name.
    ///
    /// # Errors
    ///
    /// Returns `StateConflictError` if a name was already recorded.
    pub fn set_template_name(&mut self, name: impl Into<String>) -> Result<(), StateConflictError> {
        set_once(&mut self.template_name, name.into(), "template_name")
    }

    /// The terminal error, if a step recorded one.
    #[must_use]
    pub fn error(&self) -> Option<&BuildError> {
        self.error.as_ref()
    }

    /// Records the terminal error. The first error recorded wins.
    pub fn record_error(&mut self, err: BuildError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// Removes and returns the terminal error.
    pub fn take_error(&mut self) -> Option<BuildError> {
        self.error.take()
    }

    /// Reports `err` to the UI, records it and returns [`StepAction::Halt`].
    pub fn halt(&mut self, err: BuildError) -> StepAction {
        self.services.ui.error(&err.to_string());
        self.record_error(err);
        StepAction::Halt
    }

    /// Adds one generated-data entry.
    pub fn insert_generated(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.generated_data.insert(key.to_string(), value.into());
    }

    /// Generated data as a JSON object.
    #[must_use]
    pub fn generated_value(&self) -> serde_json::Value {
        serde_json::Value::Object(self.generated_data.clone())
    }

    /// Shorthand for the UI.
    #[must_use]
    pub fn ui(&self) -> &dyn Ui {
        self.services.ui.as_ref()
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T, key: &str) -> Result<(), StateConflictError> {
    if slot.is_some() {
        return Err(StateConflictError::new(key));
    }
    *slot = Some(value);
    Ok(())
}
