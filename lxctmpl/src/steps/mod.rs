//! Step trait and the build steps.
//!
//! Steps are the units the runner executes in order. Each one reads what
//! earlier steps left in the [`RunState`], records its own results, and can
//! undo its side effects in `cleanup`.

mod cleanup_keys;
mod connect;
mod convert;
mod key_pair;
mod provision;
mod save_template;
mod start_container;
mod success;

pub use cleanup_keys::{remove_key_command, StepCleanupTempKeys};
pub use connect::StepConnect;
pub use convert::StepConvertToBackup;
pub use key_pair::StepKeyPair;
pub use provision::StepProvision;
pub use save_template::StepSaveToTemplate;
pub use start_container::StepStartContainer;
pub use success::StepSuccess;

use crate::cancellation::CancellationToken;
use crate::config::Config;
use crate::core::{RunStatus, StepAction};
use crate::errors::BuildError;
use crate::platform::InstanceRef;
use crate::state::RunState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};
use tracing::{debug, warn};

/// A unit of work in the build pipeline.
///
/// `run` either continues, halts with an error recorded in the state, or
/// reports that it observed cancellation. `cleanup` is called in reverse
/// order for every step that ran, whatever the outcome, and must tolerate
/// partially created resources and repeated calls.
#[async_trait]
pub trait Step: Send + Sync + Debug {
    /// Returns the name of the step.
    fn name(&self) -> &str;

    /// Executes the step.
    async fn run(&self, cancel: &CancellationToken, state: &mut RunState) -> StepAction;

    /// Undoes the step's side effects.
    ///
    /// Failures are returned, never raised. `status` is the terminal status
    /// of the run.
    async fn cleanup(&self, _state: &RunState, _status: RunStatus) -> Vec<CleanupFailure> {
        Vec::new()
    }
}

/// A resource a cleanup could not release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupFailure {
    /// Step whose cleanup failed.
    pub step: String,
    /// The resource left behind.
    pub resource: String,
    /// What went wrong.
    pub message: String,
}

impl CleanupFailure {
    /// Creates a cleanup failure record.
    #[must_use]
    pub fn new(
        step: impl Into<String>,
        resource: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            step: step.into(),
            resource: resource.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.step, self.resource, self.message)
    }
}

/// The fixed step sequence of a template build.
#[must_use]
pub fn build_steps(config: &Config) -> Vec<Box<dyn Step>> {
    vec![
        Box::new(StepKeyPair::new(
            config.debug,
            config.debug_key_path.clone(),
        )),
        Box::new(StepStartContainer),
        Box::new(StepConnect),
        Box::new(StepProvision),
        Box::new(StepCleanupTempKeys),
        Box::new(StepConvertToBackup),
        Box::new(StepSaveToTemplate),
        Box::new(StepSuccess),
    ]
}

/// Returns the recorded container or halts the run.
fn require_instance(state: &mut RunState, step: &str) -> Result<InstanceRef, StepAction> {
    match state.instance() {
        Some(instance) => Ok(instance.clone()),
        None => Err(state.halt(BuildError::Internal(format!(
            "step '{step}' needs a container but none was created"
        )))),
    }
}

/// Stops and deletes the build container after a failed or cancelled run.
///
/// Does nothing once the run completed or the success marker is set, or
/// when the container is already gone. Stop and delete are attempted
/// independently and each failure is reported on its own.
pub(crate) async fn teardown_instance(
    state: &RunState,
    status: RunStatus,
    step: &str,
) -> Vec<CleanupFailure> {
    let Some(instance) = state.instance() else {
        return Vec::new();
    };
    if status.is_completed() || state.succeeded {
        debug!(step, %instance, "Run succeeded, keeping container state");
        return Vec::new();
    }

    let platform = &state.services.platform;
    let ui = state.ui();

    match platform.exists(instance).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(step, %instance, "Container already removed");
            return Vec::new();
        }
        Err(e) if e.is_not_found() => return Vec::new(),
        Err(e) => {
            warn!(step, %instance, error = %e, "Could not check container, tearing down anyway");
        }
    }

    let mut failures = Vec::new();

    ui.say(&format!("Stopping LXC container {}", instance.vmid));
    if let Err(e) = platform.stop(instance).await {
        if !e.is_not_found() {
            let msg = format!("Error stopping VM. Please stop and delete it manually: {e}");
            ui.error(&msg);
            failures.push(CleanupFailure::new(step, instance.to_string(), msg));
        }
    }

    ui.say(&format!("Deleting LXC container {}", instance.vmid));
    if let Err(e) = platform.delete(instance).await {
        if !e.is_not_found() {
            let msg = format!("Error deleting VM. Please delete it manually: {e}");
            ui.error(&msg);
            failures.push(CleanupFailure::new(step, instance.to_string(), msg));
        }
    }

    failures
}
