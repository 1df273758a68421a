use super::{require_instance, Step};
use crate::cancellation::CancellationToken;
use crate::core::StepAction;
use crate::errors::BuildError;
use crate::host::ConnectTarget;
use crate::platform::GuestInterface;
use crate::state::RunState;
use async_trait::async_trait;
use std::net::IpAddr;

/// Opens the remote shell into the container.
///
/// Uses the configured host when set, otherwise the first non-loopback
/// address the guest reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepConnect;

fn first_routable_address(interfaces: &[GuestInterface]) -> Option<IpAddr> {
    interfaces
        .iter()
        .filter(|iface| iface.name != "lo")
        .flat_map(|iface| iface.addresses.iter())
        .find(|addr| !addr.is_loopback())
        .copied()
}

#[async_trait]
impl Step for StepConnect {
    fn name(&self) -> &str {
        "connect"
    }

    async fn run(&self, _cancel: &CancellationToken, state: &mut RunState) -> StepAction {
        let instance = match require_instance(state, self.name()) {
            Ok(instance) => instance,
            Err(action) => return action,
        };

        let host = if state.comm.host.is_empty() {
            let interfaces = match state.services.platform.guest_interfaces(&instance).await {
                Ok(interfaces) => interfaces,
                Err(e) => {
                    return state.halt(BuildError::Connectivity(format!(
                        "error getting VM interfaces: {e}"
                    )))
                }
            };
            match first_routable_address(&interfaces) {
                Some(addr) => addr.to_string(),
                None => {
                    return state.halt(BuildError::Connectivity(
                        "found no IP addresses on VM".to_string(),
                    ))
                }
            }
        } else {
            state.comm.host.clone()
        };

        let target = ConnectTarget {
            host: host.clone(),
            port: state.comm.port,
            username: state.comm.username.clone(),
            password: state.comm.password.clone(),
            private_key: state.comm.private_key.clone(),
            agent_auth: state.comm.agent_auth,
        };

        state
            .ui()
            .say(&format!("Connecting to {}@{}:{}...", target.username, host, target.port));
        if let Err(e) = state.services.communicator.connect(&target).await {
            return state.halt(BuildError::Connectivity(format!("{e:#}")));
        }

        state.comm_host = Some(host);
        StepAction::Continue
    }
}
