//! End-to-end build scenarios against the in-memory cluster.

#[cfg(test)]
mod tests {
    use crate::builder::Builder;
    use crate::cancellation::CancellationToken;
    use crate::config::Config;
    use crate::core::{Artifact, RunStatus, StepAction};
    use crate::errors::{BuildError, ConversionStage, PlatformError};
    use crate::pipeline::{RunReport, Runner};
    use crate::platform::{ArchiveEntry, MockPlatformClient};
    use crate::steps::Step;
    use crate::testing::{Harness, RecordingStep, StepLog};
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const ALL_STEPS: [&str; 8] = [
        "key_pair",
        "start_container",
        "connect",
        "provision",
        "cleanup_temp_keys",
        "convert_to_backup",
        "save_to_template",
        "success",
    ];

    fn prepared(config: Config) -> Builder {
        let mut builder = Builder::new(config);
        builder.prepare_with_env(|_| None).unwrap();
        builder
    }

    async fn build(
        harness: &Harness,
        cancel: &CancellationToken,
    ) -> (Result<Artifact, BuildError>, RunReport) {
        prepared(harness.config.clone())
            .run_with_report(cancel, harness.services())
            .await
    }

    #[tokio::test]
    async fn test_successful_build_produces_template() {
        let harness = Harness::new();

        let (result, report) = build(&harness, &CancellationToken::new()).await;
        let artifact = result.unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.executed, ALL_STEPS.to_vec());
        assert!(report.cleanup_failures.is_empty());
        assert_eq!(artifact.template_path, "ubuntu-base_v2.tar.gz");
        assert_eq!(artifact.storage_pool, "local");
        assert_eq!(
            artifact.state("generated_data"),
            Some(&serde_json::json!({
                "InstanceId": 118,
                "Node": "pve",
                "ProvisionIP": "10.0.0.50",
            }))
        );

        let uploads = harness.cluster.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].1, "ubuntu-base_v2.tar.gz");

        // Completed runs never stop the container during cleanup.
        assert_eq!(harness.cluster.count("stop"), 0);
        assert_eq!(harness.cluster.count("exists"), 0);
        assert_eq!(harness.cluster.count("delete"), 1);
        assert!(!harness.cluster.container_exists(118));
        assert!(harness.ui.contains("A template was created: ubuntu-base_v2.tar.gz"));
    }

    #[tokio::test]
    async fn test_ephemeral_key_is_installed_and_removed() {
        let harness = Harness::new();

        build(&harness, &CancellationToken::new()).await.0.unwrap();

        let commands = harness.communicator.commands();
        assert_eq!(commands.len(), 2);
        assert!(commands[0].contains("ssh-ed25519"));
        assert!(commands[0].contains("~/.ssh/authorized_keys"));
        assert!(commands[1].contains("/root/.ssh/authorized_keys"));
        let targets = harness.communicator.targets();
        assert_eq!(targets.len(), 1);
        assert!(!targets[0].private_key.is_empty());
    }

    #[tokio::test]
    async fn test_newest_archive_becomes_the_template() {
        let harness = Harness::new();
        harness.cluster.skip_backup_archive();
        let at = |s| Utc.timestamp_opt(s, 0).unwrap();
        for (name, ctime, content) in [
            ("vzdump-lxc-118-a.tar.gz", 1_000, b"A".as_slice()),
            ("vzdump-lxc-118-b.tar.gz", 3_000, b"B".as_slice()),
            ("vzdump-lxc-118-c.tar.gz", 2_000, b"C".as_slice()),
            ("vzdump-lxc-119-d.tar.gz", 9_000, b"D".as_slice()),
        ] {
            harness
                .cluster
                .add_archive("backups", ArchiveEntry::new("backups", name, at(ctime)), content);
        }

        let artifact = build(&harness, &CancellationToken::new()).await.0.unwrap();

        assert_eq!(artifact.template_path, "ubuntu-base_v2.tar.gz");
        assert_eq!(harness.cluster.uploads()[0].2, b"B".to_vec());
        assert!(!harness
            .cluster
            .remote_file_exists("/var/lib/vz/dump/vzdump-lxc-118-b.tar.gz"));
        assert!(harness
            .cluster
            .remote_file_exists("/var/lib/vz/dump/vzdump-lxc-118-a.tar.gz"));
    }

    #[tokio::test]
    async fn test_creation_failure_halts_without_teardown() {
        let harness = Harness::new();
        harness
            .cluster
            .fail("create", PlatformError::api("storage 'local-lvm' does not exist"));

        let (result, report) = build(&harness, &CancellationToken::new()).await;

        assert_eq!(report.status, RunStatus::Halted);
        assert_eq!(report.executed, vec!["key_pair", "start_container"]);
        assert_eq!(report.cleaned, vec!["start_container", "key_pair"]);
        assert_eq!(harness.cluster.calls(), vec!["create:118"]);
        match result {
            Err(BuildError::Creation(e)) => {
                assert_eq!(e, PlatformError::api("storage 'local-lvm' does not exist"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_provision_failure_tears_down_container() {
        let harness = Harness::new();
        harness.hook.fail_with("shell provisioner exited 2");

        let (result, report) = build(&harness, &CancellationToken::new()).await;

        assert!(matches!(result, Err(BuildError::Provision(_))));
        assert_eq!(report.status, RunStatus::Halted);
        assert_eq!(report.executed, ALL_STEPS[..4].to_vec());
        assert_eq!(
            report.cleaned,
            vec!["provision", "connect", "start_container", "key_pair"]
        );
        assert!(!harness.cluster.container_exists(118));
        assert_eq!(harness.cluster.count("backup"), 0);
        assert!(harness.ui.errors()[0].contains("shell provisioner exited 2"));
    }

    #[tokio::test]
    async fn test_conversion_failure_is_torn_down_once() {
        let harness = Harness::new();
        harness.cluster.fail("backup", PlatformError::api("no space left"));

        let (result, report) = build(&harness, &CancellationToken::new()).await;

        match result {
            Err(BuildError::Conversion { stage, .. }) => assert_eq!(stage, ConversionStage::Backup),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(report.executed.last().map(String::as_str), Some("convert_to_backup"));
        assert!(report.cleanup_failures.is_empty());
        // Convert and create both tear down; the second finds nothing left.
        assert_eq!(harness.cluster.count("exists"), 2);
        assert_eq!(harness.cluster.count("stop"), 1);
        assert_eq!(harness.cluster.count("delete"), 1);
        assert!(!harness.cluster.container_exists(118));
    }

    #[tokio::test]
    async fn test_cleanup_failures_are_reported_not_raised() {
        let harness = Harness::new();
        harness.hook.fail_with("boom");
        harness.cluster.fail("delete", PlatformError::api("container is locked"));

        let (result, report) = build(&harness, &CancellationToken::new()).await;

        assert!(matches!(result, Err(BuildError::Provision(_))));
        assert_eq!(report.cleanup_failures.len(), 1);
        assert_eq!(report.cleanup_failures[0].step, "start_container");
        assert_eq!(report.cleanup_failures[0].resource, "lxc/118@pve");
        assert!(harness.ui.contains("Please delete it manually"));
        assert!(harness.cluster.container_exists(118));
    }

    #[tokio::test]
    async fn test_cancel_during_provision_skips_conversion() {
        let harness = Harness::new();
        let cancel = Arc::new(CancellationToken::new());
        harness.hook.cancel_on_run(Arc::clone(&cancel));

        let (result, report) = build(&harness, &cancel).await;

        assert!(matches!(result, Err(BuildError::Cancelled)));
        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.executed, ALL_STEPS[..4].to_vec());
        assert_eq!(harness.cluster.count("shutdown"), 0);
        assert_eq!(harness.cluster.count("backup"), 0);
        assert!(harness.cluster.uploads().is_empty());
        assert!(!harness.cluster.container_exists(118));
    }

    #[tokio::test]
    async fn test_cancel_after_upload_reports_uploaded_template() {
        let harness = Harness::new();
        let cancel = Arc::new(CancellationToken::new());
        harness.cluster.cancel_on("upload", Arc::clone(&cancel));

        let (result, report) = build(&harness, &cancel).await;

        assert!(matches!(result, Err(BuildError::Cancelled)));
        assert_eq!(report.executed.last().map(String::as_str), Some("save_to_template"));
        assert_eq!(harness.cluster.uploads().len(), 1);
        assert!(harness.ui.contains("Cancellation requested"));
        assert!(harness
            .ui
            .errors()
            .iter()
            .any(|e| e.contains("ubuntu-base_v2.tar.gz") && e.contains("remove it manually")));
    }

    #[tokio::test]
    async fn test_cancel_before_run_touches_nothing() {
        let harness = Harness::new();
        let cancel = CancellationToken::new();
        cancel.cancel("host shutdown");

        let (result, report) = build(&harness, &cancel).await;

        assert!(matches!(result, Err(BuildError::Cancelled)));
        assert!(report.executed.is_empty());
        assert!(harness.cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn test_allocation_exhausted_never_creates() {
        let harness = Harness::with_config(Config {
            vmid: None,
            ..Harness::default_config()
        });
        let mut platform = MockPlatformClient::new();
        platform
            .expect_max_vmid()
            .times(5)
            .returning(|| Err(PlatformError::transport("cluster busy")));
        platform.expect_create_container().never();
        platform.expect_exists().never();
        let mut services = harness.services();
        services.platform = Arc::new(platform);

        let result = prepared(harness.config.clone())
            .run(&CancellationToken::new(), services)
            .await;

        match result {
            Err(BuildError::Allocation { attempts, .. }) => assert_eq!(attempts, 5),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_allocated_identity_is_highest_plus_one() {
        let harness = Harness::with_config(Config {
            vmid: None,
            ..Harness::default_config()
        });
        harness.cluster.set_max_vmid(240);

        let (result, _) = build(&harness, &CancellationToken::new()).await;

        result.unwrap();
        assert!(harness.cluster.calls().contains(&"create:241".to_string()));
        assert_eq!(harness.cluster.count("max_vmid"), 1);
    }

    #[tokio::test]
    async fn test_halt_at_each_position_cleans_prefix_in_reverse() {
        let names = ["a", "b", "c", "d", "e"];
        for halt_at in 0..names.len() {
            let log = StepLog::new();
            let steps: Vec<Box<dyn Step>> = names
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    let action = if i == halt_at {
                        StepAction::Halt
                    } else {
                        StepAction::Continue
                    };
                    Box::new(RecordingStep::new(*name, action, log.clone())) as Box<dyn Step>
                })
                .collect();
            let harness = Harness::new();
            let mut state = harness.state();

            let report = Runner::new(steps)
                .run(&CancellationToken::new(), &mut state)
                .await;

            let expected: Vec<String> = names[..=halt_at]
                .iter()
                .rev()
                .map(|s| (*s).to_string())
                .collect();
            assert_eq!(report.cleaned, expected, "halt at {halt_at}");
            assert_eq!(report.status, RunStatus::Halted);
        }
    }

    #[tokio::test]
    async fn test_repeated_build_cleanup_is_idempotent() {
        let harness = Harness::new();
        harness.hook.fail_with("boom");
        let builder = prepared(harness.config.clone());

        let (first, _) = builder
            .run_with_report(&CancellationToken::new(), harness.services())
            .await;
        assert!(first.is_err());
        assert!(!harness.cluster.container_exists(118));

        // A second failing build with the same identity recreates and tears down again.
        let (second, report) = builder
            .run_with_report(&CancellationToken::new(), harness.services())
            .await;
        assert!(second.is_err());
        assert!(report.cleanup_failures.is_empty());
        assert_eq!(harness.cluster.count("delete"), 2);
    }
}
