//! Wide event emitter for comprehensive observability.

use super::StepSpanAttributes;
use crate::pipeline::RunReport;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Emitter for wide events, one structured log line per step or run.
#[derive(Debug, Clone)]
pub struct WideEventEmitter {
    /// Event type for step events.
    pub step_event_type: String,
    /// Event type for run events.
    pub run_event_type: String,
}

impl Default for WideEventEmitter {
    fn default() -> Self {
        Self {
            step_event_type: "step.wide".to_string(),
            run_event_type: "run.wide".to_string(),
        }
    }
}

impl WideEventEmitter {
    /// Creates a new wide event emitter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a step payload.
    #[must_use]
    pub fn build_step_payload(run_id: &Uuid, attrs: &StepSpanAttributes) -> serde_json::Value {
        let mut payload = serde_json::json!({
            "run_id": run_id.to_string(),
            "step": attrs.step_name,
            "index": attrs.index,
            "outcome": attrs.outcome,
            "duration_ms": attrs.duration_ms,
        });

        if let Some(ref err) = attrs.error {
            payload["error"] = serde_json::json!(err);
        }

        payload
    }

    /// Builds a run payload from its report.
    #[must_use]
    pub fn build_run_payload(run_id: &Uuid, report: &RunReport) -> serde_json::Value {
        let mut failures_by_step: BTreeMap<&str, u32> = BTreeMap::new();
        for failure in &report.cleanup_failures {
            *failures_by_step.entry(failure.step.as_str()).or_insert(0) += 1;
        }

        serde_json::json!({
            "run_id": run_id.to_string(),
            "status": report.status.to_string(),
            "error": report.error.as_ref().map(ToString::to_string),
            "executed": report.executed,
            "cleaned": report.cleaned,
            "cleanup_failures": failures_by_step,
            "duration_ms": report.duration_ms,
        })
    }

    /// Emits a step wide event.
    pub fn emit_step_event(&self, run_id: &Uuid, attrs: &StepSpanAttributes) {
        let payload = Self::build_step_payload(run_id, attrs);
        tracing::debug!(event = %self.step_event_type, %payload, "Wide event");
    }

    /// Emits a run wide event.
    pub fn emit_run_event(&self, run_id: &Uuid, report: &RunReport) {
        let payload = Self::build_run_payload(run_id, report);
        tracing::info!(event = %self.run_event_type, %payload, "Wide event");
    }
}
