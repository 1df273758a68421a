use super::{require_instance, Step};
use crate::cancellation::CancellationToken;
use crate::core::StepAction;
use crate::errors::BuildError;
use crate::host::HOOK_PROVISION;
use crate::state::RunState;
use async_trait::async_trait;
use serde_json::json;
use tracing::info;

/// Hands the running container to the host's provisioners.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepProvision;

#[async_trait]
impl Step for StepProvision {
    fn name(&self) -> &str {
        "provision"
    }

    async fn run(&self, cancel: &CancellationToken, state: &mut RunState) -> StepAction {
        let instance = match require_instance(state, self.name()) {
            Ok(instance) => instance,
            Err(action) => return action,
        };

        let host = state
            .comm_host
            .clone()
            .unwrap_or_else(|| state.comm.host.clone());
        let data = json!({
            "host": host,
            "instance_id": instance.vmid,
            "generated_data": state.generated_value(),
        });

        state.ui().say("Running provisioners...");
        let result = state.services.hook.run(HOOK_PROVISION, &data, cancel).await;

        if cancel.is_cancelled() {
            info!(reason = ?cancel.reason(), "Cancelled during provisioning");
            return StepAction::Cancelled;
        }

        match result {
            Ok(()) => StepAction::Continue,
            Err(e) => state.halt(BuildError::Provision(format!("{e:#}"))),
        }
    }
}
