//! Step span attributes and timing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

/// Attributes describing one step execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepSpanAttributes {
    /// Step name.
    pub step_name: String,
    /// Position in the step list.
    pub index: usize,
    /// Outcome, e.g. `continue` or `halt`.
    pub outcome: Option<String>,
    /// Duration in milliseconds.
    pub duration_ms: Option<f64>,
    /// Error message if the step halted.
    pub error: Option<String>,
}

impl StepSpanAttributes {
    /// Creates attributes for the step at `index`.
    #[must_use]
    pub fn new(step_name: impl Into<String>, index: usize) -> Self {
        Self {
            step_name: step_name.into(),
            index,
            ..Default::default()
        }
    }

    /// Sets the outcome.
    #[must_use]
    pub fn with_outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }

    /// Sets the duration.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Sets the error.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Flattens to dotted attribute names.
    #[must_use]
    pub fn to_fields(&self) -> HashMap<String, String> {
        let mut attrs = HashMap::new();

        attrs.insert("step.name".to_string(), self.step_name.clone());
        attrs.insert("step.index".to_string(), self.index.to_string());

        if let Some(ref v) = self.outcome {
            attrs.insert("step.outcome".to_string(), v.clone());
        }
        if let Some(v) = self.duration_ms {
            attrs.insert("step.duration_ms".to_string(), v.to_string());
        }
        if let Some(ref v) = self.error {
            attrs.insert("step.error".to_string(), v.clone());
        }

        attrs
    }
}

/// Wall-clock timer for a span.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a new span timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Returns the span name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Finishes the span and returns the duration.
    #[must_use]
    pub fn finish(self) -> f64 {
        self.elapsed_ms()
    }
}
