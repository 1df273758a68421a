//! Virtualization platform port.
//!
//! Steps talk to the cluster only through [`PlatformClient`]. The concrete
//! API client lives with the host; tests use the in-memory fake in
//! `crate::testing` or a mockall mock.

mod types;

pub use types::{
    ArchiveEntry, BackupParams, Compression, ContainerSpec, ContentType, Features,
    GuestInterface, InstanceRef, ItemDetail, NetworkDevice, RootFs, TaskId, DEFAULT_BRIDGE,
};

use crate::config::Config;
use crate::errors::PlatformError;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

/// Operations the build needs from the virtualization platform.
///
/// Every call is a blocking round trip from the caller's point of view and
/// may fail with a [`PlatformError`]. `NotFound` must be reported for
/// resources that are already gone so teardown can treat it as success.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Highest identity currently in use across the cluster.
    async fn max_vmid(&self) -> Result<u32, PlatformError>;

    /// Creates the container. Does not start it.
    async fn create_container(
        &self,
        instance: &InstanceRef,
        spec: &ContainerSpec,
    ) -> Result<(), PlatformError>;

    /// Starts the container and waits for the start task.
    async fn start(&self, instance: &InstanceRef) -> Result<(), PlatformError>;

    /// Gracefully shuts the container down.
    async fn shutdown(&self, instance: &InstanceRef) -> Result<(), PlatformError>;

    /// Hard-stops the container.
    async fn stop(&self, instance: &InstanceRef) -> Result<(), PlatformError>;

    /// Deletes the container.
    async fn delete(&self, instance: &InstanceRef) -> Result<(), PlatformError>;

    /// Whether the container still exists.
    async fn exists(&self, instance: &InstanceRef) -> Result<bool, PlatformError>;

    /// Network interfaces as reported by the guest.
    async fn guest_interfaces(
        &self,
        instance: &InstanceRef,
    ) -> Result<Vec<GuestInterface>, PlatformError>;

    /// Issues a backup and returns the task handle.
    async fn create_backup(
        &self,
        node: &str,
        params: &BackupParams,
    ) -> Result<TaskId, PlatformError>;

    /// Waits for a task to finish successfully.
    async fn wait_for_task(
        &self,
        node: &str,
        task: &TaskId,
        timeout: Duration,
    ) -> Result<(), PlatformError>;

    /// Lists content of a storage pool.
    async fn list_archives(
        &self,
        node: &str,
        storage: &str,
        content: ContentType,
    ) -> Result<Vec<ArchiveEntry>, PlatformError>;

    /// Detail record of one storage item.
    async fn item_detail(
        &self,
        node: &str,
        storage: &str,
        volid: &str,
    ) -> Result<ItemDetail, PlatformError>;

    /// Uploads a local file into a storage pool.
    async fn upload(
        &self,
        node: &str,
        storage: &str,
        content: ContentType,
        filename: &str,
        source: &Path,
    ) -> Result<(), PlatformError>;
}

/// Builds the creation request for the build container.
///
/// `public_key` is installed for root unless empty. Unprivileged containers
/// get `keyctl` and `nesting` so common distributions boot.
#[must_use]
pub fn container_spec(config: &Config, public_key: &str) -> ContainerSpec {
    let password = if config.comm.password.is_empty() {
        None
    } else {
        Some(config.comm.password.clone())
    };

    ContainerSpec {
        ostemplate: format!(
            "{}:vztmpl/{}",
            config.template_storage_pool, config.template_file
        ),
        storage: config.fs_storage.clone(),
        rootfs: RootFs {
            storage: config.fs_storage.clone(),
            size_gb: config.fs_size,
        },
        memory: config.memory,
        cores: config.cores,
        unprivileged: config.unprivileged,
        force: true,
        start_on_create: false,
        password,
        ssh_public_keys: (!public_key.is_empty()).then(|| public_key.to_string()),
        networks: vec![NetworkDevice {
            name: "eth0".to_string(),
            bridge: DEFAULT_BRIDGE.to_string(),
            ip: format!("{}/24", config.provision_ip),
            gateway: config.provision_gateway_ip.clone(),
            hwaddr: config.provision_mac.clone(),
            firewall: false,
        }],
        features: config.unprivileged.then_some(Features {
            keyctl: true,
            nesting: true,
        }),
    }
}

/// Backup request for the build container.
#[must_use]
pub fn backup_params(config: &Config, vmid: u32) -> BackupParams {
    BackupParams {
        vmid,
        storage: config.backup_storage_pool.clone(),
        compress: Compression::Gzip,
        remove: config.prune_backups,
    }
}
