use super::Step;
use crate::cancellation::CancellationToken;
use crate::core::StepAction;
use crate::state::RunState;
use async_trait::async_trait;

/// Sets the success marker. Runs last, so cleanup of earlier steps knows
/// the container has become a template.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepSuccess;

#[async_trait]
impl Step for StepSuccess {
    fn name(&self) -> &str {
        "success"
    }

    async fn run(&self, _cancel: &CancellationToken, state: &mut RunState) -> StepAction {
        state.succeeded = true;
        StepAction::Continue
    }
}
