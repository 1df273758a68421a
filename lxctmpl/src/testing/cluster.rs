//! In-memory platform and file-transfer fake.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::collaborators::{FakeCommunicator, FakeHook};
use crate::cancellation::CancellationToken;
use crate::errors::{PlatformError, TransferError};
use crate::host::RecordingUi;
use crate::platform::{
    ArchiveEntry, BackupParams, ContainerSpec, ContentType, GuestInterface, InstanceRef,
    ItemDetail, PlatformClient, TaskId,
};
use crate::state::RunServices;
use crate::transfer::{remote_path, FileTransfer, TransferSession, TransferTarget};

const DEFAULT_MAX_VMID: u32 = 117;

/// A container known to the fake cluster.
#[derive(Debug, Clone, Default)]
pub struct FakeContainer {
    /// Creation request, absent for containers seeded by tests.
    pub spec: Option<ContainerSpec>,
    /// Whether the container is running.
    pub running: bool,
}

#[derive(Debug, Default)]
struct ClusterState {
    max_vmid: u32,
    containers: BTreeMap<u32, FakeContainer>,
    guest_addresses: Vec<IpAddr>,
    archives: HashMap<String, Vec<ArchiveEntry>>,
    remote_files: BTreeMap<String, Vec<u8>>,
    uploads: Vec<(String, String, Vec<u8>)>,
    calls: Vec<String>,
    failures: HashMap<String, PlatformError>,
    transfer_failures: HashMap<String, String>,
    transfer_logins: Vec<String>,
    skip_backup_archive: bool,
    backups_taken: i64,
    cancel_on: HashMap<String, Arc<CancellationToken>>,
}

/// A single-node cluster held in memory.
///
/// Implements both [`PlatformClient`] and [`FileTransfer`], so backups the
/// platform writes show up in the node's dump directory. Platform calls are
/// logged as `op:arg`; transfer calls are kept out of that log.
#[derive(Debug, Clone)]
pub struct FakeCluster {
    node: String,
    dump_dir: String,
    inner: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    /// Creates an empty cluster with one node.
    #[must_use]
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            dump_dir: "/var/lib/vz/dump".to_string(),
            inner: Arc::new(Mutex::new(ClusterState {
                max_vmid: DEFAULT_MAX_VMID,
                ..ClusterState::default()
            })),
        }
    }

    /// Sets the directory backups are written to.
    #[must_use]
    pub fn with_dump_dir(mut self, dir: impl Into<String>) -> Self {
        self.dump_dir = dir.into();
        self
    }

    /// Sets the highest identity reported when no container is higher.
    pub fn set_max_vmid(&self, vmid: u32) {
        self.inner.lock().max_vmid = vmid;
    }

    /// The node name.
    #[must_use]
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Services backed by this cluster and fresh host fakes.
    #[must_use]
    pub fn services(&self) -> RunServices {
        RunServices {
            platform: Arc::new(self.clone()),
            transfer: Arc::new(self.clone()),
            hook: Arc::new(FakeHook::new()),
            communicator: Arc::new(FakeCommunicator::new()),
            ui: Arc::new(RecordingUi::new()),
        }
    }

    /// Makes every later call of platform operation `op` fail with `err`.
    pub fn fail(&self, op: &str, err: PlatformError) {
        self.inner.lock().failures.insert(op.to_string(), err);
    }

    /// Cancels `token` when platform operation `op` is called. The call
    /// itself still completes.
    pub fn cancel_on(&self, op: &str, token: Arc<CancellationToken>) {
        self.inner.lock().cancel_on.insert(op.to_string(), token);
    }

    /// Removes a failure set by [`FakeCluster::fail`].
    pub fn clear_failure(&self, op: &str) {
        self.inner.lock().failures.remove(op);
    }

    /// Makes transfer operation `op` fail. `connect` fails authentication,
    /// everything else fails the session.
    pub fn fail_transfer(&self, op: &str, message: impl Into<String>) {
        self.inner
            .lock()
            .transfer_failures
            .insert(op.to_string(), message.into());
    }

    /// Platform calls in arrival order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }

    /// Number of platform calls of `op`.
    #[must_use]
    pub fn count(&self, op: &str) -> usize {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|c| c.split(':').next() == Some(op))
            .count()
    }

    /// Seeds a stopped container.
    pub fn insert_container(&self, vmid: u32) {
        self.inner
            .lock()
            .containers
            .insert(vmid, FakeContainer::default());
    }

    /// Removes a container behind the build's back.
    pub fn remove_container(&self, vmid: u32) {
        self.inner.lock().containers.remove(&vmid);
    }

    /// Whether the container exists.
    #[must_use]
    pub fn container_exists(&self, vmid: u32) -> bool {
        self.inner.lock().containers.contains_key(&vmid)
    }

    /// Whether the container exists and is running.
    #[must_use]
    pub fn container_running(&self, vmid: u32) -> bool {
        self.inner
            .lock()
            .containers
            .get(&vmid)
            .is_some_and(|c| c.running)
    }

    /// The creation request of a container.
    #[must_use]
    pub fn container_spec(&self, vmid: u32) -> Option<ContainerSpec> {
        self.inner
            .lock()
            .containers
            .get(&vmid)
            .and_then(|c| c.spec.clone())
    }

    /// Addresses the guest reports on `eth0`.
    pub fn set_guest_addresses(&self, addresses: Vec<IpAddr>) {
        self.inner.lock().guest_addresses = addresses;
    }

    /// Adds an archive to `pool` and its file to the dump directory.
    pub fn add_archive(&self, pool: &str, entry: ArchiveEntry, content: &[u8]) {
        let path = remote_path(&self.dump_dir, &entry.name);
        let mut inner = self.inner.lock();
        inner.remote_files.insert(path, content.to_vec());
        inner.archives.entry(pool.to_string()).or_default().push(entry);
    }

    /// Archives listed in `pool`.
    #[must_use]
    pub fn archives(&self, pool: &str) -> Vec<ArchiveEntry> {
        self.inner
            .lock()
            .archives
            .get(pool)
            .cloned()
            .unwrap_or_default()
    }

    /// Makes backups succeed without producing an archive.
    pub fn skip_backup_archive(&self) {
        self.inner.lock().skip_backup_archive = true;
    }

    /// Places a file on the node.
    pub fn put_remote_file(&self, path: &str, content: &[u8]) {
        self.inner
            .lock()
            .remote_files
            .insert(path.to_string(), content.to_vec());
    }

    /// Removes a file from the node.
    pub fn remove_remote_file(&self, path: &str) {
        self.inner.lock().remote_files.remove(path);
    }

    /// Whether a file exists on the node.
    #[must_use]
    pub fn remote_file_exists(&self, path: &str) -> bool {
        self.inner.lock().remote_files.contains_key(path)
    }

    /// Uploaded files as `(storage, filename, content)`.
    #[must_use]
    pub fn uploads(&self) -> Vec<(String, String, Vec<u8>)> {
        self.inner.lock().uploads.clone()
    }

    /// Transfer sessions opened, as `user@host:port`.
    #[must_use]
    pub fn transfer_logins(&self) -> Vec<String> {
        self.inner.lock().transfer_logins.clone()
    }

    fn record(&self, op: &str, call: String) -> Result<(), PlatformError> {
        let mut inner = self.inner.lock();
        inner.calls.push(call);
        if let Some(token) = inner.cancel_on.get(op) {
            token.cancel(format!("interrupted during {op}"));
        }
        match inner.failures.get(op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn transfer_check(&self, op: &str) -> Result<(), TransferError> {
        match self.inner.lock().transfer_failures.get(op) {
            Some(message) if op == "connect" => Err(TransferError::Auth(message.clone())),
            Some(message) => Err(TransferError::Session(message.clone())),
            None => Ok(()),
        }
    }

    fn with_container<T>(
        &self,
        instance: &InstanceRef,
        f: impl FnOnce(&mut FakeContainer) -> T,
    ) -> Result<T, PlatformError> {
        let mut inner = self.inner.lock();
        inner
            .containers
            .get_mut(&instance.vmid)
            .map(f)
            .ok_or_else(|| PlatformError::not_found(instance.to_string()))
    }
}

#[async_trait]
impl PlatformClient for FakeCluster {
    async fn max_vmid(&self) -> Result<u32, PlatformError> {
        self.record("max_vmid", "max_vmid".to_string())?;
        let inner = self.inner.lock();
        let highest = inner.containers.keys().next_back().copied().unwrap_or(0);
        Ok(highest.max(inner.max_vmid))
    }

    async fn create_container(
        &self,
        instance: &InstanceRef,
        spec: &ContainerSpec,
    ) -> Result<(), PlatformError> {
        self.record("create", format!("create:{}", instance.vmid))?;
        let mut inner = self.inner.lock();
        if inner.containers.contains_key(&instance.vmid) && !spec.force {
            return Err(PlatformError::api(format!(
                "CT {} already exists on node '{}'",
                instance.vmid, instance.node
            )));
        }
        inner.containers.insert(
            instance.vmid,
            FakeContainer {
                spec: Some(spec.clone()),
                running: spec.start_on_create,
            },
        );
        Ok(())
    }

    async fn start(&self, instance: &InstanceRef) -> Result<(), PlatformError> {
        self.record("start", format!("start:{}", instance.vmid))?;
        self.with_container(instance, |c| c.running = true)
    }

    async fn shutdown(&self, instance: &InstanceRef) -> Result<(), PlatformError> {
        self.record("shutdown", format!("shutdown:{}", instance.vmid))?;
        self.with_container(instance, |c| c.running = false)
    }

    async fn stop(&self, instance: &InstanceRef) -> Result<(), PlatformError> {
        self.record("stop", format!("stop:{}", instance.vmid))?;
        self.with_container(instance, |c| c.running = false)
    }

    async fn delete(&self, instance: &InstanceRef) -> Result<(), PlatformError> {
        self.record("delete", format!("delete:{}", instance.vmid))?;
        self.inner
            .lock()
            .containers
            .remove(&instance.vmid)
            .map(|_| ())
            .ok_or_else(|| PlatformError::not_found(instance.to_string()))
    }

    async fn exists(&self, instance: &InstanceRef) -> Result<bool, PlatformError> {
        self.record("exists", format!("exists:{}", instance.vmid))?;
        Ok(self.container_exists(instance.vmid))
    }

    async fn guest_interfaces(
        &self,
        instance: &InstanceRef,
    ) -> Result<Vec<GuestInterface>, PlatformError> {
        self.record("guest_interfaces", format!("guest_interfaces:{}", instance.vmid))?;
        self.with_container(instance, |_| ())?;
        let addresses = self.inner.lock().guest_addresses.clone();
        Ok(vec![
            GuestInterface {
                name: "lo".to_string(),
                addresses: vec![IpAddr::from([127, 0, 0, 1])],
            },
            GuestInterface {
                name: "eth0".to_string(),
                addresses,
            },
        ])
    }

    async fn create_backup(
        &self,
        node: &str,
        params: &BackupParams,
    ) -> Result<TaskId, PlatformError> {
        self.record("backup", format!("backup:{}", params.vmid))?;
        let mut inner = self.inner.lock();
        if !inner.containers.contains_key(&params.vmid) {
            return Err(PlatformError::not_found(format!("lxc/{}@{node}", params.vmid)));
        }

        if !inner.skip_backup_archive {
            inner.backups_taken += 1;
            let ctime = Utc::now() + ChronoDuration::seconds(inner.backups_taken);
            let name = format!(
                "vzdump-lxc-{}-{}.{}",
                params.vmid,
                ctime.format("%Y_%m_%d-%H_%M_%S"),
                params.compress.extension()
            );
            inner
                .archives
                .entry(params.storage.clone())
                .or_default()
                .push(ArchiveEntry::new(&params.storage, name.clone(), ctime));
            inner.remote_files.insert(
                remote_path(&self.dump_dir, &name),
                format!("archive of {}", params.vmid).into_bytes(),
            );
        }

        Ok(TaskId(format!("UPID:{node}:vzdump:{}", params.vmid)))
    }

    async fn wait_for_task(
        &self,
        _node: &str,
        _task: &TaskId,
        _timeout: Duration,
    ) -> Result<(), PlatformError> {
        self.record("wait", "wait".to_string())
    }

    async fn list_archives(
        &self,
        _node: &str,
        storage: &str,
        _content: ContentType,
    ) -> Result<Vec<ArchiveEntry>, PlatformError> {
        self.record("list", format!("list:{storage}"))?;
        Ok(self.archives(storage))
    }

    async fn item_detail(
        &self,
        _node: &str,
        storage: &str,
        volid: &str,
    ) -> Result<ItemDetail, PlatformError> {
        self.record("item_detail", format!("item_detail:{volid}"))?;
        let inner = self.inner.lock();
        let entry = inner
            .archives
            .get(storage)
            .and_then(|entries| entries.iter().find(|e| e.volid == volid))
            .ok_or_else(|| PlatformError::not_found(volid.to_string()))?;
        Ok(ItemDetail {
            path: remote_path(&self.dump_dir, &entry.name),
            size: entry.size,
            format: entry.format.clone(),
        })
    }

    async fn upload(
        &self,
        _node: &str,
        storage: &str,
        _content: ContentType,
        filename: &str,
        source: &Path,
    ) -> Result<(), PlatformError> {
        self.record("upload", format!("upload:{storage}:{filename}"))?;
        let bytes = tokio::fs::read(source)
            .await
            .map_err(|e| PlatformError::transport(e.to_string()))?;
        self.inner
            .lock()
            .uploads
            .push((storage.to_string(), filename.to_string(), bytes));
        Ok(())
    }
}

#[async_trait]
impl FileTransfer for FakeCluster {
    async fn connect(
        &self,
        target: &TransferTarget,
    ) -> Result<Box<dyn TransferSession>, TransferError> {
        self.transfer_check("connect")?;
        self.inner.lock().transfer_logins.push(target.display_addr());
        Ok(Box::new(FakeSession {
            cluster: self.clone(),
        }))
    }
}

/// A transfer session against a [`FakeCluster`] node.
#[derive(Debug)]
pub struct FakeSession {
    cluster: FakeCluster,
}

#[async_trait]
impl TransferSession for FakeSession {
    async fn list_dir(&self, dir: &str) -> Result<Vec<String>, TransferError> {
        self.cluster.transfer_check("list_dir")?;
        let dir = dir.trim_end_matches('/');
        let inner = self.cluster.inner.lock();
        Ok(inner
            .remote_files
            .keys()
            .filter_map(|path| path.rsplit_once('/'))
            .filter(|(parent, _)| *parent == dir)
            .map(|(_, name)| name.to_string())
            .collect())
    }

    async fn download(&self, remote: &str, dest: &Path) -> Result<u64, TransferError> {
        self.cluster.transfer_check("download")?;
        let bytes = self
            .cluster
            .inner
            .lock()
            .remote_files
            .get(remote)
            .cloned()
            .ok_or_else(|| TransferError::NotFound(remote.to_string()))?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(bytes.len() as u64)
    }

    async fn remove(&self, remote: &str) -> Result<(), TransferError> {
        self.cluster.transfer_check("remove")?;
        self.cluster
            .inner
            .lock()
            .remote_files
            .remove(remote)
            .map(|_| ())
            .ok_or_else(|| TransferError::NotFound(remote.to_string()))
    }
}
