//! A ready-made set of fakes around one configuration.

use std::sync::Arc;

use super::cluster::FakeCluster;
use super::collaborators::{FakeCommunicator, FakeHook};
use crate::config::Config;
use crate::host::RecordingUi;
use crate::platform::PlatformClient;
use crate::state::{RunServices, RunState};

/// Fakes for every collaborator of a run, plus its configuration.
///
/// The fakes are shared with every state the harness hands out, so tests
/// can seed them before a step runs and inspect them afterwards.
#[derive(Debug)]
pub struct Harness {
    /// Configuration for states built by this harness.
    pub config: Config,
    /// Platform and file-transfer fake.
    pub cluster: FakeCluster,
    /// Provisioning hook fake.
    pub hook: Arc<FakeHook>,
    /// Remote shell fake.
    pub communicator: Arc<FakeCommunicator>,
    /// Recorded UI output.
    pub ui: Arc<RecordingUi>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    /// A harness around [`Harness::default_config`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(Self::default_config())
    }

    /// A harness around `config`.
    #[must_use]
    pub fn with_config(config: Config) -> Self {
        let node = if config.node.is_empty() {
            "pve".to_string()
        } else {
            config.node.clone()
        };
        let cluster = FakeCluster::new(node).with_dump_dir(config.dump_dir.clone());
        Self {
            config,
            cluster,
            hook: Arc::new(FakeHook::new()),
            communicator: Arc::new(FakeCommunicator::new()),
            ui: Arc::new(RecordingUi::new()),
        }
    }

    /// A complete configuration building container 118 on node `pve`.
    #[must_use]
    pub fn default_config() -> Config {
        let mut config = Config {
            proxmox_url: "https://pve.local:8006/api2/json".to_string(),
            username: "root@pam".to_string(),
            password: "secret".to_string(),
            node: "pve".to_string(),
            vmid: Some(118),
            template_file: "ubuntu-base.tar.gz".to_string(),
            template_suffix: "v2".to_string(),
            backup_storage_pool: "backups".to_string(),
            fs_storage: "local-lvm".to_string(),
            fs_size: 8,
            provision_ip: "10.0.0.50".to_string(),
            provision_gateway_ip: "10.0.0.1".to_string(),
            ..Config::default()
        };
        config.comm.host = "10.0.0.50".to_string();
        config
    }

    /// Services backed by the harness fakes.
    #[must_use]
    pub fn services(&self) -> RunServices {
        RunServices {
            platform: Arc::new(self.cluster.clone()),
            transfer: Arc::new(self.cluster.clone()),
            hook: self.hook.clone(),
            communicator: self.communicator.clone(),
            ui: self.ui.clone(),
        }
    }

    /// A fresh run state over the harness fakes.
    #[must_use]
    pub fn state(&self) -> RunState {
        RunState::new(Arc::new(self.config.clone()), self.services())
    }

    /// A fresh run state whose platform is `platform` instead of the cluster.
    #[must_use]
    pub fn state_with_platform(&self, platform: Arc<dyn PlatformClient>) -> RunState {
        let mut services = self.services();
        services.platform = platform;
        RunState::new(Arc::new(self.config.clone()), services)
    }
}
