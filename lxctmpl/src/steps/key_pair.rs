use super::{CleanupFailure, Step};
use crate::cancellation::CancellationToken;
use crate::core::{RunStatus, StepAction};
use crate::credentials::{key_pair_comment, write_private_key, KeyPair};
use crate::errors::BuildError;
use crate::state::RunState;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

/// Prepares the credentials the remote shell logs in with.
///
/// A configured password or agent is used as is. A configured private key
/// file is loaded. Otherwise an ephemeral key pair is generated and marked
/// for removal from the container after provisioning.
#[derive(Debug, Clone, Default)]
pub struct StepKeyPair {
    debug: bool,
    debug_key_path: Option<PathBuf>,
}

impl StepKeyPair {
    /// Creates the step. With `debug` the ephemeral private key is written
    /// to `debug_key_path`.
    #[must_use]
    pub fn new(debug: bool, debug_key_path: Option<PathBuf>) -> Self {
        Self {
            debug,
            debug_key_path,
        }
    }
}

#[async_trait]
impl Step for StepKeyPair {
    fn name(&self) -> &str {
        "key_pair"
    }

    async fn run(&self, _cancel: &CancellationToken, state: &mut RunState) -> StepAction {
        if !state.comm.password.is_empty() {
            state.ui().say("using password for the communicator...");
            return StepAction::Continue;
        }

        if let Some(path) = state.comm.private_key_file.clone() {
            state.ui().say("using existing SSH private key for the communicator...");
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    return state.halt(BuildError::Credentials(format!(
                        "error reading private key file '{}': {e}",
                        path.display()
                    )))
                }
            };
            let pair = match KeyPair::from_private_key(&bytes, key_pair_comment()) {
                Ok(pair) => pair,
                Err(e) => return state.halt(BuildError::Credentials(e.to_string())),
            };

            let public_key = match pair.authorized_key_line() {
                Ok(line) => line,
                Err(e) => return state.halt(BuildError::Credentials(e.to_string())),
            };
            debug!(
                algorithm = %pair.algorithm(),
                fingerprint = %pair.fingerprint(),
                "Loaded private key"
            );

            state.comm.private_key = bytes;
            state.comm.key_pair_name = pair.comment().to_string();
            state.comm.temporary_key_pair_name = pair.comment().to_string();
            state.comm.public_key = public_key;
            return StepAction::Continue;
        }

        if state.comm.agent_auth {
            state
                .ui()
                .say("using local SSH Agent to authenticate connections for the communicator...");
            return StepAction::Continue;
        }

        state.ui().say("creating ephemeral key pair for SSH communicator...");
        let generated = KeyPair::generate(key_pair_comment()).and_then(|pair| {
            let pem = pair.private_key_pem()?;
            let line = pair.authorized_key_line()?;
            Ok((pair, pem, line))
        });
        let (pair, pem, public_key) = match generated {
            Ok(parts) => parts,
            Err(e) => {
                return state.halt(BuildError::Credentials(format!(
                    "error creating temporary SSH key: {e}"
                )))
            }
        };
        debug!(fingerprint = %pair.fingerprint(), "Generated ephemeral key pair");

        state.comm.key_pair_name = pair.comment().to_string();
        state.comm.temporary_key_pair_name = pair.comment().to_string();
        state.comm.public_key = public_key;
        state.comm.clear_authorized_keys = true;
        state.comm.private_key = pem;
        state.ui().say("created ephemeral SSH key pair for communicator");

        if let Some(path) = self.debug_key_path.as_ref().filter(|_| self.debug) {
            state.ui().message(&format!(
                "saving communicator private key for debug purposes: {}",
                path.display()
            ));
            if let Err(e) = write_private_key(path, &state.comm.private_key) {
                return state.halt(BuildError::Credentials(format!(
                    "error saving debug key: {e}"
                )));
            }
            state.comm.debug_key_file = Some(path.clone());
        }

        StepAction::Continue
    }

    async fn cleanup(&self, state: &RunState, _status: RunStatus) -> Vec<CleanupFailure> {
        // Only a key this run wrote is removed.
        let Some(path) = state.comm.debug_key_file.as_ref() else {
            return Vec::new();
        };

        match tokio::fs::remove_file(path).await {
            Ok(()) => Vec::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                let msg = format!("Error removing debug key '{}': {e}", path.display());
                state.ui().error(&msg);
                vec![CleanupFailure::new(
                    self.name(),
                    path.display().to_string(),
                    msg,
                )]
            }
        }
    }
}
