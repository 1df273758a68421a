use super::{require_instance, teardown_instance, CleanupFailure, Step};
use crate::cancellation::CancellationToken;
use crate::core::{RunStatus, StepAction};
use crate::errors::{BuildError, ConversionStage};
use crate::platform::{backup_params, ContentType};
use crate::state::{BackupRecord, RunState};
use crate::template::select_latest_backup;
use async_trait::async_trait;
use tracing::{info, warn};

/// Stops the container, dumps it to a backup archive and records the
/// newest archive of the container.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepConvertToBackup;

#[async_trait]
impl Step for StepConvertToBackup {
    fn name(&self) -> &str {
        "convert_to_backup"
    }

    async fn run(&self, _cancel: &CancellationToken, state: &mut RunState) -> StepAction {
        let instance = match require_instance(state, self.name()) {
            Ok(instance) => instance,
            Err(action) => return action,
        };
        let config = state.config.clone();
        let platform = state.services.platform.clone();

        state.ui().say("Stopping LXC container...");
        if let Err(e) = platform.shutdown(&instance).await {
            return state.halt(BuildError::conversion(ConversionStage::Stop, e));
        }

        state.ui().say("Creating backup...");
        let params = backup_params(&config, instance.vmid);
        let task = match platform.create_backup(&instance.node, &params).await {
            Ok(task) => task,
            Err(e) => return state.halt(BuildError::conversion(ConversionStage::Backup, e)),
        };

        if let Err(e) = platform
            .wait_for_task(&instance.node, &task, config.task_timeout())
            .await
        {
            return state.halt(BuildError::conversion(ConversionStage::Wait, e));
        }
        info!(%task, "Backup task finished");

        state.ui().say(&format!(
            "Finding latest backup for VmId {} in storage: {}",
            instance.vmid, config.backup_storage_pool
        ));
        let entries = match platform
            .list_archives(&instance.node, &config.backup_storage_pool, ContentType::Backup)
            .await
        {
            Ok(entries) => entries,
            Err(e) => return state.halt(BuildError::conversion(ConversionStage::List, e)),
        };
        let Some(latest) = select_latest_backup(&entries, instance.vmid).cloned() else {
            return state.halt(BuildError::BackupNotFound(format!(
                "could not find backup file for LXC container {}",
                instance.vmid
            )));
        };

        let path = match platform
            .item_detail(&instance.node, &config.backup_storage_pool, &latest.volid)
            .await
        {
            Ok(detail) => detail.path,
            Err(e) => {
                warn!(volid = %latest.volid, error = %e, "Could not read backup detail");
                String::new()
            }
        };

        state
            .ui()
            .say(&format!("Found backup at {}", if path.is_empty() { &latest.volid } else { &path }));

        let record = BackupRecord {
            extension: latest.extension(),
            volid: latest.volid,
            name: latest.name,
            ctime: latest.ctime,
            path,
        };
        if let Err(e) = state.set_backup(record) {
            return state.halt(e.into());
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
    use crate::platform::{ArchiveEntry, InstanceRef};
    use crate::testing::Harness;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn running(harness: &Harness) -> RunState {
        harness.cluster.insert_container(118);
        let mut state = harness.state();
        state.set_instance(InstanceRef::new("pve", 118)).unwrap();
        state
    }

    #[tokio::test]
    async fn test_converts_and_locates_backup() {
        let harness = Harness::new();
        let mut state = running(&harness);

        let action = StepConvertToBackup
            .run(&CancellationToken::new(), &mut state)
            .await;

        assert_eq!(action, StepAction::Continue);
        let backup = state.backup().unwrap();
        assert!(backup.name.starts_with("vzdump-lxc-118-"));
        assert_eq!(backup.extension, "tar.gz");
        assert_eq!(backup.path, format!("/var/lib/vz/dump/{}", backup.name));
        assert_eq!(
            harness.cluster.calls()[..3].to_vec(),
            vec!["shutdown:118", "backup:118", "wait"]
        );
    }

    #[tokio::test]
    async fn test_picks_newest_archive() {
        let harness = Harness::new();
        let at = |s| Utc.timestamp_opt(s, 0).unwrap();
        harness.cluster.add_archive(
            "backups",
            ArchiveEntry::new("backups", "vzdump-lxc-118-a.tar.gz", at(4_000_000_000)),
            b"old",
        );
        harness.cluster.add_archive(
            "backups",
            ArchiveEntry::new("backups", "vzdump-lxc-118-b.tar.gz", at(4_000_000_300)),
            b"new",
        );
        let mut state = running(&harness);

        StepConvertToBackup
            .run(&CancellationToken::new(), &mut state)
            .await;

        assert_eq!(state.backup().unwrap().name, "vzdump-lxc-118-b.tar.gz");
    }

    #[tokio::test]
    async fn test_stage_errors_are_labeled() {
        for (op, stage) in [
            ("shutdown", ConversionStage::Stop),
            ("backup", ConversionStage::Backup),
            ("wait", ConversionStage::Wait),
            ("list", ConversionStage::List),
        ] {
            let harness = Harness::new();
            harness.cluster.fail(op, PlatformError::api("boom"));
            let mut state = running(&harness);

            let action = StepConvertToBackup
                .run(&CancellationToken::new(), &mut state)
                .await;

            assert_eq!(action, StepAction::Halt);
            match state.error() {
                Some(BuildError::Conversion { stage: s, .. }) => assert_eq!(*s, stage),
                other => panic!("unexpected error for {op}: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_missing_backup_halts() {
        let harness = Harness::new();
        harness.cluster.skip_backup_archive();
        let mut state = running(&harness);

        let action = StepConvertToBackup
            .run(&CancellationToken::new(), &mut state)
            .await;

        assert_eq!(action, StepAction::Halt);
        assert!(matches!(state.error(), Some(BuildError::BackupNotFound(_))));
    }

    #[tokio::test]
    async fn test_cleanup_tears_down_after_failure() {
        let harness = Harness::new();
        harness.cluster.fail("wait", PlatformError::Timeout("backup".to_string()));
        let mut state = running(&harness);

        StepConvertToBackup
            .run(&CancellationToken::new(), &mut state)
            .await;
        let failures = StepConvertToBackup.cleanup(&state, RunStatus::Halted).await;

        assert!(failures.is_empty());
        assert!(!harness.cluster.container_exists(118));
    }
}
