//! Sequential step runner with reverse cleanup.

use crate::cancellation::CancellationToken;
use crate::core::{RunStatus, StepAction};
use crate::errors::BuildError;
use crate::observability::{SpanTimer, StepSpanAttributes, WideEventEmitter};
use crate::state::RunState;
use crate::steps::{CleanupFailure, Step};
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

/// Runner tuning.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Upper bound for a single step's cleanup.
    pub cleanup_timeout: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            cleanup_timeout: Duration::from_secs(300),
        }
    }
}

/// Outcome of a run.
#[derive(Debug)]
pub struct RunReport {
    /// Terminal status.
    pub status: RunStatus,
    /// The error that halted the run, if any.
    pub error: Option<BuildError>,
    /// Steps whose `run` was called, in order.
    pub executed: Vec<String>,
    /// Steps whose `cleanup` was called, in order.
    pub cleaned: Vec<String>,
    /// Resources cleanup could not release.
    pub cleanup_failures: Vec<CleanupFailure>,
    /// Wall time of run plus cleanup in milliseconds.
    pub duration_ms: u64,
}

impl RunReport {
    /// True if every step continued.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status.is_completed()
    }
}

/// Executes steps strictly in order and unwinds them in reverse.
///
/// Cancellation is checked before each step, never during one. Whatever the
/// outcome, `cleanup` runs for every step whose `run` was called, last
/// first, and cleanup failures are collected rather than propagated.
#[derive(Debug)]
pub struct Runner {
    steps: Vec<Box<dyn Step>>,
    options: RunnerOptions,
    events: WideEventEmitter,
}

impl Runner {
    /// Creates a runner over `steps`.
    #[must_use]
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        Self {
            steps,
            options: RunnerOptions::default(),
            events: WideEventEmitter::new(),
        }
    }

    /// Sets runner options.
    #[must_use]
    pub fn with_options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    /// Names of the steps in execution order.
    #[must_use]
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Runs every step, then cleanup for the executed ones.
    pub async fn run(&self, cancel: &CancellationToken, state: &mut RunState) -> RunReport {
        let start = Instant::now();
        let run_span = info_span!("run", run_id = %state.run_id);

        state.status = RunStatus::Running;
        let mut executed = 0;
        let mut status = RunStatus::Completed;

        for (index, step) in self.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(parent: &run_span, step = step.name(), reason = ?cancel.reason(), "Run cancelled before step");
                status = RunStatus::Cancelled;
                break;
            }

            let span = info_span!(parent: &run_span, "step", step = step.name(), index);
            debug!(parent: &span, "step.started");
            let timer = SpanTimer::start(step.name());
            let action = step.run(cancel, state).instrument(span.clone()).await;
            let duration_ms = timer.finish();
            executed = index + 1;

            let mut attrs = StepSpanAttributes::new(step.name(), index)
                .with_outcome(action.to_string())
                .with_duration_ms(duration_ms);

            match action {
                StepAction::Continue => {
                    info!(parent: &span, duration_ms, "step.completed");
                }
                StepAction::Halt => {
                    if state.error().is_none() {
                        state.record_error(BuildError::Internal(format!(
                            "step '{}' halted without an error",
                            step.name()
                        )));
                    }
                    let error = state.error().map(ToString::to_string).unwrap_or_default();
                    warn!(parent: &span, duration_ms, %error, "step.halted");
                    attrs = attrs.with_error(error);
                    status = RunStatus::Halted;
                }
                StepAction::Cancelled => {
                    info!(parent: &span, reason = ?cancel.reason(), "step.cancelled");
                    status = RunStatus::Cancelled;
                }
            }
            self.events.emit_step_event(&state.run_id, &attrs);

            if action != StepAction::Continue {
                break;
            }
        }

        state.status = status;
        let ran = &self.steps[..executed];
        let (cleaned, cleanup_failures) = self
            .cleanup(ran, state, status)
            .instrument(run_span.clone())
            .await;

        let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        let report = RunReport {
            status,
            error: state.take_error(),
            executed: ran.iter().map(|s| s.name().to_string()).collect(),
            cleaned,
            cleanup_failures,
            duration_ms,
        };
        run_span.in_scope(|| self.events.emit_run_event(&state.run_id, &report));
        report
    }

    async fn cleanup(
        &self,
        ran: &[Box<dyn Step>],
        state: &RunState,
        status: RunStatus,
    ) -> (Vec<String>, Vec<CleanupFailure>) {
        let mut cleaned = Vec::with_capacity(ran.len());
        let mut failures = Vec::new();

        for step in ran.iter().rev() {
            let span = info_span!("cleanup", step = step.name());
            let result = tokio::time::timeout(
                self.options.cleanup_timeout,
                step.cleanup(state, status),
            )
            .instrument(span)
            .await;

            match result {
                Ok(step_failures) => {
                    for failure in &step_failures {
                        warn!(step = %failure.step, resource = %failure.resource, message = %failure.message, "cleanup.failed");
                    }
                    failures.extend(step_failures);
                }
                Err(_) => {
                    let msg = format!(
                        "cleanup timed out after {}s",
                        self.options.cleanup_timeout.as_secs_f64()
                    );
                    warn!(step = step.name(), message = %msg, "cleanup.failed");
                    state.ui().error(&format!("Cleanup of {} {msg}", step.name()));
                    failures.push(CleanupFailure::new(step.name(), "cleanup", msg));
                }
            }
            cleaned.push(step.name().to_string());
        }

        (cleaned, failures)
    }
}
