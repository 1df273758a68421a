//! Scripted steps for runner tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::core::{RunStatus, StepAction};
use crate::state::RunState;
use crate::steps::{CleanupFailure, Step};

/// Shared, ordered log of step activity.
///
/// Entries read `run:<step>` and `cleanup:<step>:<status>`.
#[derive(Debug, Clone, Default)]
pub struct StepLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl StepLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries in arrival order.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    fn push(&self, entry: String) {
        self.entries.lock().push(entry);
    }
}

/// A step that returns a fixed action and records what happens to it.
#[derive(Debug)]
pub struct RecordingStep {
    name: String,
    action: StepAction,
    log: StepLog,
    cancel: Option<Arc<CancellationToken>>,
    cleanup_failure: Option<(String, String)>,
    cleanup_delay: Option<Duration>,
}

impl RecordingStep {
    /// Creates a step named `name` that returns `action`.
    #[must_use]
    pub fn new(name: impl Into<String>, action: StepAction, log: StepLog) -> Self {
        Self {
            name: name.into(),
            action,
            log,
            cancel: None,
            cleanup_failure: None,
            cleanup_delay: None,
        }
    }

    /// Cancels `token` during `run`, then returns the configured action.
    #[must_use]
    pub fn cancelling(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Reports a cleanup failure for `resource`.
    #[must_use]
    pub fn with_cleanup_failure(
        mut self,
        resource: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        self.cleanup_failure = Some((resource.into(), message.into()));
        self
    }

    /// Sleeps this long inside cleanup.
    #[must_use]
    pub fn with_cleanup_delay(mut self, delay: Duration) -> Self {
        self.cleanup_delay = Some(delay);
        self
    }
}

#[async_trait]
impl Step for RecordingStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _cancel: &CancellationToken, _state: &mut RunState) -> StepAction {
        self.log.push(format!("run:{}", self.name));
        if let Some(token) = &self.cancel {
            token.cancel(format!("cancelled by {}", self.name));
        }
        self.action
    }

    async fn cleanup(&self, _state: &RunState, status: RunStatus) -> Vec<CleanupFailure> {
        self.log.push(format!("cleanup:{}:{status}", self.name));
        if let Some(delay) = self.cleanup_delay {
            tokio::time::sleep(delay).await;
        }
        self.cleanup_failure
            .iter()
            .map(|(resource, message)| CleanupFailure::new(&self.name, resource, message))
            .collect()
    }
}
