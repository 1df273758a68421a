use super::{teardown_instance, CleanupFailure, Step};
use crate::cancellation::CancellationToken;
use crate::config::Config;
use crate::core::{RunStatus, StepAction};
use crate::errors::BuildError;
use crate::pipeline::{with_retry, RetryConfig};
use crate::platform::{container_spec, InstanceRef, PlatformClient};
use crate::state::RunState;
use async_trait::async_trait;
use tracing::info;

/// Creates the build container and starts it.
///
/// Without an explicit identity the next free one is allocated from the
/// platform first. The container handle is recorded as soon as creation
/// succeeds, so a failed start still gets torn down.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepStartContainer;

/// Picks the next free identity: highest used plus one.
///
/// Makes exactly `vmid_allocation_attempts` lookups before giving up, fewer
/// if `cancel` fires during a backoff delay.
pub async fn allocate_vmid(
    platform: &dyn PlatformClient,
    config: &Config,
    cancel: &CancellationToken,
) -> Result<u32, BuildError> {
    let attempts = config.vmid_allocation_attempts.max(1);
    let retry = RetryConfig::new()
        .with_max_attempts(attempts)
        .with_base_delay_ms(config.vmid_allocation_delay_ms)
        .with_max_delay_ms(config.vmid_allocation_max_delay_ms)
        .with_backoff(config.vmid_allocation_backoff)
        .with_jitter(config.vmid_allocation_jitter);

    let max = with_retry(&retry, "vmid", cancel, || platform.max_vmid())
        .await
        .map_err(|e| BuildError::Allocation {
            attempts,
            last_error: Some(e.to_string()),
        })?;

    max.checked_add(1).ok_or(BuildError::Allocation {
        attempts,
        last_error: Some(format!("highest identity {max} cannot be incremented")),
    })
}

#[async_trait]
impl Step for StepStartContainer {
    fn name(&self) -> &str {
        "start_container"
    }

    async fn run(&self, cancel: &CancellationToken, state: &mut RunState) -> StepAction {
        let config = state.config.clone();
        let platform = state.services.platform.clone();

        state.ui().say("Creating LXC container...");

        let vmid = match config.vmid {
            Some(vmid) => vmid,
            None => match allocate_vmid(platform.as_ref(), &config, cancel).await {
                Ok(vmid) => vmid,
                Err(_) if cancel.is_cancelled() => {
                    info!(reason = ?cancel.reason(), "Cancelled during identity allocation");
                    return StepAction::Cancelled;
                }
                Err(e) => return state.halt(e),
            },
        };

        let mut instance = InstanceRef::new(&config.node, vmid);
        if let Some(pool) = &config.pool {
            instance = instance.with_pool(pool);
        }

        let spec = container_spec(&config, &state.comm.public_key);
        if let Err(e) = platform.create_container(&instance, &spec).await {
            return state.halt(BuildError::Creation(e));
        }
        info!(%instance, "Container created");

        if let Err(e) = state.set_instance(instance.clone()) {
            return state.halt(e.into());
        }
        state.insert_generated("InstanceId", vmid);
        state.insert_generated("Node", config.node.clone());
        state.insert_generated("ProvisionIP", config.provision_ip.clone());

        state.ui().say(&format!("Starting LXC container {vmid}..."));
        if let Err(e) = platform.start(&instance).await {
            return state.halt(BuildError::Start(e));
        }

        StepAction::Continue
    }

    async fn cleanup(&self, state: &RunState, status: RunStatus) -> Vec<CleanupFailure> {
        teardown_instance(state, status, self.name()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PlatformError;
    use crate::platform::MockPlatformClient;
    use crate::pipeline::BackoffStrategy;
    use crate::testing::Harness;
    use mockall::Sequence;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn allocating_config() -> Config {
        Config {
            node: "pve".to_string(),
            provision_ip: "10.0.0.50".to_string(),
            vmid: None,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_allocation_succeeds_on_last_attempt() {
        let mut platform = MockPlatformClient::new();
        let mut seq = Sequence::new();
        platform
            .expect_max_vmid()
            .times(4)
            .in_sequence(&mut seq)
            .returning(|| Err(PlatformError::transport("busy")));
        platform
            .expect_max_vmid()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(117));
        platform
            .expect_create_container()
            .withf(|instance, _| instance.vmid == 118 && instance.node == "pve")
            .times(1)
            .returning(|_, _| Ok(()));
        platform.expect_start().times(1).returning(|_| Ok(()));

        let harness = Harness::with_config(allocating_config());
        let mut state = harness.state_with_platform(Arc::new(platform));

        let action = StepStartContainer
            .run(&CancellationToken::new(), &mut state)
            .await;

        assert_eq!(action, StepAction::Continue);
        assert_eq!(state.instance().map(|i| i.vmid), Some(118));
    }

    #[tokio::test]
    async fn test_allocation_exhausted_never_creates() {
        let mut platform = MockPlatformClient::new();
        platform
            .expect_max_vmid()
            .times(5)
            .returning(|| Err(PlatformError::transport("busy")));
        platform.expect_create_container().never();

        let harness = Harness::with_config(allocating_config());
        let mut state = harness.state_with_platform(Arc::new(platform));

        let action = StepStartContainer
            .run(&CancellationToken::new(), &mut state)
            .await;

        assert_eq!(action, StepAction::Halt);
        match state.error() {
            Some(BuildError::Allocation {
                attempts,
                last_error,
            }) => {
                assert_eq!(*attempts, 5);
                assert_eq!(last_error.as_deref(), Some("transport error: busy"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(state.instance().is_none());
    }

    #[tokio::test]
    async fn test_cancel_during_allocation_backoff() {
        let cancel = Arc::new(CancellationToken::new());
        let token = Arc::clone(&cancel);
        let mut platform = MockPlatformClient::new();
        platform.expect_max_vmid().times(1).returning(move || {
            token.cancel("operator interrupt");
            Err(PlatformError::transport("busy"))
        });
        platform.expect_create_container().never();

        let harness = Harness::with_config(Config {
            vmid_allocation_delay_ms: 60_000,
            vmid_allocation_backoff: BackoffStrategy::Exponential,
            ..allocating_config()
        });
        let mut state = harness.state_with_platform(Arc::new(platform));

        let action = StepStartContainer.run(&cancel, &mut state).await;

        assert_eq!(action, StepAction::Cancelled);
        assert!(state.error().is_none());
        assert!(state.instance().is_none());
    }

    #[tokio::test]
    async fn test_explicit_vmid_skips_allocation() {
        let harness = Harness::new();
        let mut state = harness.state();

        let action = StepStartContainer
            .run(&CancellationToken::new(), &mut state)
            .await;

        assert_eq!(action, StepAction::Continue);
        assert_eq!(harness.cluster.count("max_vmid"), 0);
        assert_eq!(harness.cluster.calls(), vec!["create:118", "start:118"]);
        assert_eq!(
            state.generated_value(),
            serde_json::json!({"InstanceId": 118, "Node": "pve", "ProvisionIP": "10.0.0.50"})
        );
    }

    #[tokio::test]
    async fn test_creation_failure_records_nothing() {
        let harness = Harness::new();
        harness
            .cluster
            .fail("create", PlatformError::api("storage full"));
        let mut state = harness.state();

        let action = StepStartContainer
            .run(&CancellationToken::new(), &mut state)
            .await;

        assert_eq!(action, StepAction::Halt);
        assert!(matches!(state.error(), Some(BuildError::Creation(_))));
        assert!(state.instance().is_none());
        assert!(state.generated_data.is_empty());

        let failures = StepStartContainer.cleanup(&state, RunStatus::Halted).await;
        assert!(failures.is_empty());
        assert_eq!(harness.cluster.count("delete"), 0);
    }

    #[tokio::test]
    async fn test_start_failure_is_fatal_and_torn_down() {
        let harness = Harness::new();
        harness.cluster.fail("start", PlatformError::api("no memory"));
        let mut state = harness.state();

        let action = StepStartContainer
            .run(&CancellationToken::new(), &mut state)
            .await;

        assert_eq!(action, StepAction::Halt);
        assert!(matches!(state.error(), Some(BuildError::Start(_))));
        assert!(harness.cluster.container_exists(118));

        let failures = StepStartContainer.cleanup(&state, RunStatus::Halted).await;
        assert!(failures.is_empty());
        assert!(!harness.cluster.container_exists(118));
    }

    #[tokio::test]
    async fn test_pool_is_applied() {
        let mut config = Harness::default_config();
        config.pool = Some("builds".to_string());
        let harness = Harness::with_config(config);
        let mut state = harness.state();

        StepStartContainer
            .run(&CancellationToken::new(), &mut state)
            .await;

        assert_eq!(
            state.instance().and_then(|i| i.pool.clone()).as_deref(),
            Some("builds")
        );
    }
}
