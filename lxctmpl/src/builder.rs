//! Host-facing entry point of a template build.
//!
//! The host prepares a [`Builder`] once, which validates configuration and
//! announces the generated data keys, then calls [`Builder::run`] with its
//! collaborators. A run either yields an [`Artifact`] naming the uploaded
//! template or the error that stopped it.

use crate::cancellation::CancellationToken;
use crate::config::Config;
use crate::core::{Artifact, RunStatus};
use crate::errors::{BuildError, ConfigError};
use crate::pipeline::{RunReport, Runner, RunnerOptions};
use crate::state::{RunServices, RunState};
use crate::steps::build_steps;
use std::sync::Arc;
use tracing::{info, info_span, warn, Instrument};

/// Keys the create step fills in `generated_data`.
pub const GENERATED_DATA_KEYS: [&str; 3] = ["InstanceId", "Node", "ProvisionIP"];

/// Result of [`Builder::prepare`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepared {
    /// Keys the build will publish as generated data.
    pub generated_data_keys: Vec<String>,
    /// Values that were corrected during preparation.
    pub warnings: Vec<String>,
}

/// Builds an LXC template from a disposable container.
#[derive(Debug)]
pub struct Builder {
    config: Config,
    options: RunnerOptions,
    prepared: bool,
}

impl Builder {
    /// Creates a builder over an unprepared configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            options: RunnerOptions::default(),
            prepared: false,
        }
    }

    /// Creates a builder from a JSON configuration document.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Config::from_json(raw).map(Self::new)
    }

    /// Sets runner options.
    #[must_use]
    pub fn with_runner_options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    /// The configuration, prepared once [`Builder::prepare`] succeeded.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Validates configuration using the process environment.
    pub fn prepare(&mut self) -> Result<Prepared, ConfigError> {
        self.prepare_with_env(|key| std::env::var(key).ok())
    }

    /// Like [`Builder::prepare`] with an explicit environment lookup.
    pub fn prepare_with_env<F>(&mut self, env: F) -> Result<Prepared, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let warnings = self.config.prepare_with_env(env)?;
        self.prepared = true;
        Ok(Prepared {
            generated_data_keys: GENERATED_DATA_KEYS.iter().map(|k| (*k).to_string()).collect(),
            warnings,
        })
    }

    /// Runs the build and returns the template artifact.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        services: RunServices,
    ) -> Result<Artifact, BuildError> {
        self.run_with_report(cancel, services).await.0
    }

    /// Runs the build and also returns the runner's report.
    ///
    /// A halting error is moved out of the report into the result.
    pub async fn run_with_report(
        &self,
        cancel: &CancellationToken,
        services: RunServices,
    ) -> (Result<Artifact, BuildError>, RunReport) {
        let mut state = RunState::new(Arc::new(self.config.clone()), services);
        let span = info_span!("build", run_id = %state.run_id, node = %self.config.node);

        if !self.prepared {
            let report = RunReport {
                status: RunStatus::Halted,
                error: None,
                executed: Vec::new(),
                cleaned: Vec::new(),
                cleanup_failures: Vec::new(),
                duration_ms: 0,
            };
            return (
                Err(BuildError::Internal(
                    "configuration must be prepared before running".to_string(),
                )),
                report,
            );
        }

        let ui = Arc::clone(&state.services.ui);
        let run_id = state.run_id;
        cancel.on_cancel(move || {
            info!(%run_id, "Cancellation requested");
            ui.say("Cancellation requested, stopping after the current step...");
        });

        let runner = Runner::new(build_steps(&self.config)).with_options(self.options.clone());
        let mut report = runner.run(cancel, &mut state).instrument(span.clone()).await;

        let result = finalize(&self.config, &mut report, &state);
        match &result {
            Ok(artifact) => {
                info!(parent: &span, template = %artifact.template_path, "Build finished");
                state.ui().say(&artifact.to_string());
            }
            Err(e) => {
                info!(parent: &span, error = %e, status = %report.status, "Build did not finish");
                if let Some(name) = state.template_name() {
                    warn!(parent: &span, template = name, "Template left behind by unfinished build");
                    state.ui().error(&format!(
                        "Template {name} was uploaded to {} but the build did not finish. \
                         Please remove it manually",
                        self.config.template_storage_pool
                    ));
                }
            }
        }
        (result, report)
    }
}

fn finalize(
    config: &Config,
    report: &mut RunReport,
    state: &RunState,
) -> Result<Artifact, BuildError> {
    if let Some(err) = report.error.take() {
        return Err(err);
    }
    if report.status == RunStatus::Cancelled {
        return Err(BuildError::Cancelled);
    }
    let Some(name) = state.template_name() else {
        return Err(BuildError::Incomplete(
            "template ID could not be determined".to_string(),
        ));
    };

    Ok(Artifact::new(name, config.template_storage_pool.clone())
        .with_state("generated_data", state.generated_value()))
}
