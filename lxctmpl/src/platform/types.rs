//! Value types exchanged with the virtualization platform.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Bridge every build container is attached to.
pub const DEFAULT_BRIDGE: &str = "vmbr0";

/// Identifies a container on the platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceRef {
    /// Node hosting the container.
    pub node: String,
    /// Numeric identity.
    pub vmid: u32,
    /// Resource pool, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
}

impl InstanceRef {
    /// Creates a reference on a node.
    #[must_use]
    pub fn new(node: impl Into<String>, vmid: u32) -> Self {
        Self {
            node: node.into(),
            vmid,
            pool: None,
        }
    }

    /// Sets the resource pool.
    #[must_use]
    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = Some(pool.into());
        self
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lxc/{}@{}", self.vmid, self.node)
    }
}

/// Root filesystem placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    /// Storage backend.
    pub storage: String,
    /// Size in GiB.
    pub size_gb: u32,
}

impl RootFs {
    /// Renders the `rootfs` option value.
    #[must_use]
    pub fn to_option(&self) -> String {
        format!("{}:{}", self.storage, self.size_gb)
    }
}

/// One container network interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDevice {
    /// Interface name inside the container.
    pub name: String,
    /// Host bridge.
    pub bridge: String,
    /// Address in CIDR notation.
    pub ip: String,
    /// Default gateway.
    pub gateway: String,
    /// MAC address.
    pub hwaddr: String,
    /// Whether the platform firewall applies.
    pub firewall: bool,
}

impl NetworkDevice {
    /// Renders the `net0` option value.
    #[must_use]
    pub fn to_option(&self) -> String {
        format!(
            "name={},bridge={},ip={},gw={},hwaddr={},firewall={}",
            self.name,
            self.bridge,
            self.ip,
            self.gateway,
            self.hwaddr,
            u8::from(self.firewall)
        )
    }
}

/// Extra container features needed by unprivileged containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Features {
    /// Allow keyctl syscalls.
    pub keyctl: bool,
    /// Allow nested containers.
    pub nesting: bool,
}

/// Everything needed to create the build container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Template volume, `storage:vztmpl/file`.
    pub ostemplate: String,
    /// Storage for the container.
    pub storage: String,
    /// Root filesystem.
    pub rootfs: RootFs,
    /// Memory in MiB.
    pub memory: u32,
    /// CPU cores.
    pub cores: u32,
    /// Run unprivileged.
    pub unprivileged: bool,
    /// Overwrite an existing container with the same identity.
    pub force: bool,
    /// Start as part of creation.
    pub start_on_create: bool,
    /// Root password, if password login is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// `authorized_keys` content for root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_public_keys: Option<String>,
    /// Network interfaces.
    pub networks: Vec<NetworkDevice>,
    /// Optional features.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<Features>,
}

/// A network interface reported by the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestInterface {
    /// Interface name.
    pub name: String,
    /// Assigned addresses.
    pub addresses: Vec<IpAddr>,
}

/// Backup compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// gzip, producing `.tar.gz`.
    #[default]
    Gzip,
    /// zstd, producing `.tar.zst`.
    Zstd,
}

impl Compression {
    /// The `compress` parameter value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
        }
    }

    /// Archive extension produced by this compression.
    #[must_use]
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Gzip => "tar.gz",
            Self::Zstd => "tar.zst",
        }
    }
}

/// Parameters of a backup (dump) operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupParams {
    /// Container to dump.
    pub vmid: u32,
    /// Destination storage pool.
    pub storage: String,
    /// Compression to apply.
    pub compress: Compression,
    /// Prune older archives of the same container after dumping.
    pub remove: bool,
}

impl BackupParams {
    /// Renders the form body of the dump request. The mode is always `stop`.
    #[must_use]
    pub fn to_form(&self) -> Vec<(&'static str, String)> {
        vec![
            ("mode", "stop".to_string()),
            ("compress", self.compress.as_str().to_string()),
            ("remove", if self.remove { "1" } else { "0" }.to_string()),
            ("storage", self.storage.clone()),
            ("vmid", self.vmid.to_string()),
        ]
    }
}

/// Handle of an asynchronous platform task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of storage content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    /// Backup archives.
    Backup,
    /// Container templates.
    Vztmpl,
}

impl ContentType {
    /// The content type as the API spells it.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Vztmpl => "vztmpl",
        }
    }
}

/// One archive listed in a storage pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    /// Volume id, `storage:backup/name`.
    pub volid: String,
    /// File name.
    pub name: String,
    /// Archive format, e.g. `tar.gz`.
    #[serde(default)]
    pub format: String,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
    /// Creation time.
    pub ctime: DateTime<Utc>,
}

impl ArchiveEntry {
    /// Creates an entry named `name` in `storage`.
    #[must_use]
    pub fn new(storage: &str, name: impl Into<String>, ctime: DateTime<Utc>) -> Self {
        let name = name.into();
        Self {
            volid: format!("{storage}:backup/{name}"),
            format: archive_extension(&name).unwrap_or_default().to_string(),
            name,
            size: 0,
            ctime,
        }
    }

    /// Extension of the archive without the leading dot.
    ///
    /// Uses the reported format and falls back to the file name.
    #[must_use]
    pub fn extension(&self) -> String {
        if self.format.is_empty() {
            archive_extension(&self.name).unwrap_or_default().to_string()
        } else {
            self.format.trim_start_matches('.').to_string()
        }
    }
}

/// Returns the `tar[.*]` suffix of an archive name.
fn archive_extension(name: &str) -> Option<&str> {
    name.rfind(".tar").map(|i| &name[i + 1..])
}

/// Detail record of a storage item.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ItemDetail {
    /// Absolute path on the node.
    #[serde(default)]
    pub path: String,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
    /// Item format.
    #[serde(default)]
    pub format: String,
}
