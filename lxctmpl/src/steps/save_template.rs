use super::{require_instance, teardown_instance, CleanupFailure, Step};
use crate::cancellation::CancellationToken;
use crate::core::{RunStatus, StepAction};
use crate::errors::BuildError;
use crate::platform::ContentType;
use crate::state::RunState;
use crate::template::template_file_name;
use crate::transfer::{remote_path, split_remote_path, TransferTarget};
use async_trait::async_trait;
use tracing::info;

/// Pulls the backup archive off the node and uploads it as a template.
///
/// On success the source archive and the build container are removed.
/// Neither removal fails the step.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepSaveToTemplate;

#[async_trait]
impl Step for StepSaveToTemplate {
    fn name(&self) -> &str {
        "save_to_template"
    }

    async fn run(&self, _cancel: &CancellationToken, state: &mut RunState) -> StepAction {
        let instance = match require_instance(state, self.name()) {
            Ok(instance) => instance,
            Err(action) => return action,
        };
        let Some(backup) = state.backup().cloned() else {
            return state.halt(BuildError::BackupNotFound(format!(
                "no backup recorded for LXC container {}",
                instance.vmid
            )));
        };
        let config = state.config.clone();
        let platform = state.services.platform.clone();

        let target = match TransferTarget::from_config(&config) {
            Ok(target) => target,
            Err(e) => return state.halt(BuildError::Transfer(e.to_string())),
        };

        state.ui().say(&format!(
            "Establishing file transfer session with [{}]...",
            target.display_addr()
        ));
        let session = match state.services.transfer.connect(&target).await {
            Ok(session) => session,
            Err(e) => return state.halt(BuildError::Transfer(e.to_string())),
        };

        let remote = if backup.path.is_empty() {
            remote_path(&config.dump_dir, &backup.name)
        } else {
            backup.path.clone()
        };
        let Some((dir, file)) = split_remote_path(&remote) else {
            return state.halt(BuildError::BackupNotFound(format!(
                "invalid backup path '{remote}' for LXC container {}",
                instance.vmid
            )));
        };

        state.ui().say(&format!("Listing backup directory {dir}..."));
        let files = match session.list_dir(dir).await {
            Ok(files) => files,
            Err(e) => return state.halt(BuildError::Transfer(e.to_string())),
        };
        if !files.iter().any(|f| f == file) {
            return state.halt(BuildError::BackupNotFound(format!(
                "could not find backup file for LXC container {}",
                instance.vmid
            )));
        }

        let staging = match tempfile::Builder::new().prefix("vztmpl").tempfile() {
            Ok(staging) => staging,
            Err(e) => return state.halt(e.into()),
        };

        state
            .ui()
            .say(&format!("Transferring backup {remote} to local path..."));
        match session.download(&remote, staging.path()).await {
            Ok(bytes) => info!(%remote, bytes, "Backup downloaded"),
            Err(e) => return state.halt(BuildError::Transfer(e.to_string())),
        }

        let name = template_file_name(&config.template_file, &config.template_suffix, &backup.extension);
        state.ui().say(&format!(
            "Uploading template {name} to {}...",
            config.template_storage_pool
        ));
        if let Err(e) = platform
            .upload(
                &instance.node,
                &config.template_storage_pool,
                ContentType::Vztmpl,
                &name,
                staging.path(),
            )
            .await
        {
            return state.halt(BuildError::Transfer(e.to_string()));
        }
        drop(staging);

        if let Err(e) = session.remove(&remote).await {
            state.ui().error(&format!(
                "Error removing backup file {remote}. Please remove it manually: {e}"
            ));
        }

        state.ui().say("Finished. Deleting LXC Container");
        if let Err(e) = platform.delete(&instance).await {
            if !e.is_not_found() {
                state
                    .ui()
                    .error(&format!("error deleting VM. Please delete it manually: {e}"));
            }
        }

        if let Err(e) = state.set_template_name(name) {
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
    use crate::platform::InstanceRef;
    use crate::state::BackupRecord;
    use crate::testing::Harness;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    const ARCHIVE: &str = "vzdump-lxc-118-2026_10_17-10_00_00.tar.gz";

    fn converted(harness: &Harness) -> RunState {
        let path = format!("/var/lib/vz/dump/{ARCHIVE}");
        converted_at(harness, &path, &path)
    }

    fn converted_at(harness: &Harness, stored_at: &str, reported_path: &str) -> RunState {
        harness.cluster.insert_container(118);
        harness.cluster.put_remote_file(stored_at, b"archive-bytes");
        let mut state = harness.state();
        state.set_instance(InstanceRef::new("pve", 118)).unwrap();
        state
            .set_backup(BackupRecord {
                volid: format!("backups:backup/{ARCHIVE}"),
                name: ARCHIVE.to_string(),
                extension: "tar.gz".to_string(),
                ctime: Utc::now(),
                path: reported_path.to_string(),
            })
            .unwrap();
        state
    }

    #[tokio::test]
    async fn test_uploads_renamed_template() {
        let harness = Harness::new();
        let mut state = converted(&harness);

        let action = StepSaveToTemplate
            .run(&CancellationToken::new(), &mut state)
            .await;

        assert_eq!(action, StepAction::Continue);
        assert_eq!(state.template_name(), Some("ubuntu-base_v2.tar.gz"));
        assert_eq!(
            harness.cluster.uploads(),
            vec![(
                "local".to_string(),
                "ubuntu-base_v2.tar.gz".to_string(),
                b"archive-bytes".to_vec()
            )]
        );
        assert!(!harness
            .cluster
            .remote_file_exists(&format!("/var/lib/vz/dump/{ARCHIVE}")));
        assert!(!harness.cluster.container_exists(118));
        assert_eq!(harness.cluster.transfer_logins(), vec!["root@pve.local:22"]);
    }

    #[tokio::test]
    async fn test_archive_missing_from_dump_dir() {
        let harness = Harness::new();
        let mut state = converted(&harness);
        harness
            .cluster
            .remove_remote_file(&format!("/var/lib/vz/dump/{ARCHIVE}"));

        let action = StepSaveToTemplate
            .run(&CancellationToken::new(), &mut state)
            .await;

        assert_eq!(action, StepAction::Halt);
        assert!(matches!(state.error(), Some(BuildError::BackupNotFound(_))));
        assert!(harness.cluster.uploads().is_empty());
    }

    #[tokio::test]
    async fn test_archive_outside_dump_dir_uses_reported_path() {
        let harness = Harness::new();
        let nfs_path = format!("/mnt/pve/backups/dump/{ARCHIVE}");
        let mut state = converted_at(&harness, &nfs_path, &nfs_path);

        let action = StepSaveToTemplate
            .run(&CancellationToken::new(), &mut state)
            .await;

        assert_eq!(action, StepAction::Continue);
        assert_eq!(harness.cluster.uploads()[0].2, b"archive-bytes".to_vec());
        assert!(!harness.cluster.remote_file_exists(&nfs_path));
        assert!(harness.ui.contains("Listing backup directory /mnt/pve/backups/dump"));
    }

    #[tokio::test]
    async fn test_missing_path_falls_back_to_dump_dir() {
        let harness = Harness::new();
        let mut state = converted_at(&harness, &format!("/var/lib/vz/dump/{ARCHIVE}"), "");

        let action = StepSaveToTemplate
            .run(&CancellationToken::new(), &mut state)
            .await;

        assert_eq!(action, StepAction::Continue);
        assert_eq!(harness.cluster.uploads().len(), 1);
    }

    #[tokio::test]
    async fn test_upload_failure_halts_and_cleanup_deletes() {
        let harness = Harness::new();
        harness.cluster.fail("upload", PlatformError::api("quota"));
        let mut state = converted(&harness);

        let action = StepSaveToTemplate
            .run(&CancellationToken::new(), &mut state)
            .await;

        assert_eq!(action, StepAction::Halt);
        assert!(matches!(state.error(), Some(BuildError::Transfer(_))));
        assert!(state.template_name().is_none());
        assert!(harness.cluster.container_exists(118));

        let failures = StepSaveToTemplate.cleanup(&state, RunStatus::Halted).await;
        assert!(failures.is_empty());
        assert!(!harness.cluster.container_exists(118));
    }

    #[tokio::test]
    async fn test_source_removal_failure_is_not_fatal() {
        let harness = Harness::new();
        harness.cluster.fail_transfer("remove", "permission denied");
        let mut state = converted(&harness);

        let action = StepSaveToTemplate
            .run(&CancellationToken::new(), &mut state)
            .await;

        assert_eq!(action, StepAction::Continue);
        assert!(harness.ui.contains("Please remove it manually"));
    }

    #[tokio::test]
    async fn test_instance_already_gone_is_not_fatal() {
        let harness = Harness::new();
        let mut state = converted(&harness);
        harness.cluster.remove_container(118);

        let action = StepSaveToTemplate
            .run(&CancellationToken::new(), &mut state)
            .await;

        assert_eq!(action, StepAction::Continue);
        assert!(harness.ui.errors().is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure_halts() {
        let harness = Harness::new();
        harness.cluster.fail_transfer("connect", "auth failed");
        let mut state = converted(&harness);

        let action = StepSaveToTemplate
            .run(&CancellationToken::new(), &mut state)
            .await;

        assert_eq!(action, StepAction::Halt);
        assert!(matches!(state.error(), Some(BuildError::Transfer(_))));
    }
}
