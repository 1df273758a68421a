use super::Step;
use crate::cancellation::CancellationToken;
use crate::core::StepAction;
use crate::errors::BuildError;
use crate::state::RunState;
use async_trait::async_trait;
use tracing::debug;

/// Removes the ephemeral public key from the container before it is
/// captured, so the template does not trust a throwaway key.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepCleanupTempKeys;

fn sed_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.trim().chars() {
        if matches!(c, '\\' | '/' | '.' | '*' | '[' | ']' | '^' | '$' | '&') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Shell command deleting `public_key` from one `authorized_keys` file.
#[must_use]
pub fn remove_key_command(public_key: &str, authorized_keys: &str) -> String {
    format!(
        "sed -i.bak '/{}/d' {file}; rm -f {file}.bak",
        sed_escape(public_key),
        file = authorized_keys
    )
}

#[async_trait]
impl Step for StepCleanupTempKeys {
    fn name(&self) -> &str {
        "cleanup_temp_keys"
    }

    async fn run(&self, _cancel: &CancellationToken, state: &mut RunState) -> StepAction {
        if !state.comm.clear_authorized_keys || state.comm.public_key.is_empty() {
            debug!("No temporary key to remove");
            return StepAction::Continue;
        }

        state
            .ui()
            .say("Trying to remove ephemeral keys from authorized_keys files");

        let mut commands = vec![remove_key_command(
            &state.comm.public_key,
            "~/.ssh/authorized_keys",
        )];
        let root_cmd = remove_key_command(&state.comm.public_key, "/root/.ssh/authorized_keys");
        if state.comm.username == "root" {
            commands.push(root_cmd);
        } else {
            commands.push(format!("sudo sh -c \"{root_cmd}\""));
        }

        let communicator = state.services.communicator.clone();
        for command in commands {
            match communicator.run_command(&command).await {
                Ok(0) => {}
                Ok(code) => {
                    return state.halt(BuildError::Connectivity(format!(
                        "error removing temporary key from authorized_keys: exit status {code}"
                    )))
                }
                Err(e) => {
                    return state.halt(BuildError::Connectivity(format!(
                        "error executing remove temporary key command: {e:#}"
                    )))
                }
            }
        }

        StepAction::Continue
    }
}
