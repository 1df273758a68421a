//! Builder configuration.
//!
//! The host hands over a decoded document; `Config::prepare` fills
//! environment fallbacks and defaults and rejects incomplete input before a
//! run starts. Steps only ever read the prepared value.

use crate::errors::ConfigError;
use crate::pipeline::{BackoffStrategy, JitterStrategy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;
use url::Url;

/// Configuration for one template build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Proxmox API endpoint, e.g. `https://pve.example:8006/api2/json`.
    #[serde(default)]
    pub proxmox_url: String,
    /// Skip TLS certificate validation against the API.
    #[serde(default, rename = "insecure_skip_tls_verify")]
    pub skip_cert_validation: bool,
    /// API user in `user@realm` form.
    #[serde(default)]
    pub username: String,
    /// API password, also used for the file-transfer session.
    #[serde(default)]
    pub password: String,
    /// API token, alternative to the password for API calls.
    #[serde(default)]
    pub token: String,
    /// Node hosting the build container.
    #[serde(default)]
    pub node: String,
    /// Optional resource pool for the container.
    #[serde(default)]
    pub pool: Option<String>,
    /// Timeout for platform tasks in seconds.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,

    /// Memory in MiB.
    #[serde(default = "default_memory")]
    pub memory: u32,
    /// CPU cores.
    #[serde(default = "default_cores")]
    pub cores: u32,
    /// Run the container unprivileged.
    #[serde(default)]
    pub unprivileged: bool,
    /// Base template file the container is created from.
    #[serde(default)]
    pub template_file: String,
    /// Suffix appended to the produced template name.
    #[serde(default)]
    pub template_suffix: String,

    /// Storage holding `vztmpl` templates.
    #[serde(default = "default_template_storage_pool")]
    pub template_storage_pool: String,
    /// Storage receiving the backup archive.
    #[serde(default)]
    pub backup_storage_pool: String,
    /// Storage for the container root filesystem.
    #[serde(default, rename = "filesystem_storage")]
    pub fs_storage: String,
    /// Root filesystem size in GiB.
    #[serde(default, rename = "filesystem_size")]
    pub fs_size: u32,
    /// Explicit instance identity. Allocated from the platform when absent.
    #[serde(default)]
    pub vmid: Option<u32>,
    /// Identity lookups before giving up.
    #[serde(default = "default_allocation_attempts")]
    pub vmid_allocation_attempts: usize,
    /// Delay between identity lookups in milliseconds.
    #[serde(default)]
    pub vmid_allocation_delay_ms: u64,
    /// How the delay grows between identity lookups.
    #[serde(default)]
    pub vmid_allocation_backoff: BackoffStrategy,
    /// Randomization applied to each lookup delay.
    #[serde(default)]
    pub vmid_allocation_jitter: JitterStrategy,
    /// Upper bound on a single lookup delay in milliseconds.
    #[serde(default = "default_allocation_max_delay_ms")]
    pub vmid_allocation_max_delay_ms: u64,

    /// Address assigned to the build container.
    #[serde(default)]
    pub provision_ip: String,
    /// Gateway for the build container.
    #[serde(default)]
    pub provision_gateway_ip: String,
    /// MAC address of the build container interface.
    #[serde(default = "default_provision_mac")]
    pub provision_mac: String,

    /// Let the backup operation prune older archives of the same instance.
    #[serde(default = "default_true")]
    pub prune_backups: bool,
    /// Remote directory holding backup archives.
    #[serde(default = "default_dump_dir")]
    pub dump_dir: String,
    /// Port of the file-transfer service on the API host.
    #[serde(default = "default_transfer_port")]
    pub transfer_port: u16,

    /// Persist the ephemeral private key for inspection.
    #[serde(default)]
    pub debug: bool,
    /// Where the debug private key is written.
    #[serde(default)]
    pub debug_key_path: Option<PathBuf>,

    /// Remote-shell settings, flattened into the top-level document.
    #[serde(flatten)]
    pub comm: CommConfig,
}

fn default_task_timeout() -> u64 {
    60
}

fn default_memory() -> u32 {
    512
}

fn default_cores() -> u32 {
    1
}

fn default_template_storage_pool() -> String {
    "local".to_string()
}

fn default_allocation_attempts() -> usize {
    5
}

fn default_allocation_max_delay_ms() -> u64 {
    30_000
}

fn default_provision_mac() -> String {
    "1e:eb:08:d1:e7:e2".to_string()
}

fn default_true() -> bool {
    true
}

fn default_dump_dir() -> String {
    "/var/lib/vz/dump".to_string()
}

fn default_transfer_port() -> u16 {
    22
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxmox_url: String::new(),
            skip_cert_validation: false,
            username: String::new(),
            password: String::new(),
            token: String::new(),
            node: String::new(),
            pool: None,
            task_timeout_secs: default_task_timeout(),
            memory: default_memory(),
            cores: default_cores(),
            unprivileged: false,
            template_file: String::new(),
            template_suffix: String::new(),
            template_storage_pool: default_template_storage_pool(),
            backup_storage_pool: String::new(),
            fs_storage: String::new(),
            fs_size: 0,
            vmid: None,
            vmid_allocation_attempts: default_allocation_attempts(),
            vmid_allocation_delay_ms: 0,
            vmid_allocation_backoff: BackoffStrategy::default(),
            vmid_allocation_jitter: JitterStrategy::default(),
            vmid_allocation_max_delay_ms: default_allocation_max_delay_ms(),
            provision_ip: String::new(),
            provision_gateway_ip: String::new(),
            provision_mac: default_provision_mac(),
            prune_backups: true,
            dump_dir: default_dump_dir(),
            transfer_port: default_transfer_port(),
            debug: false,
            debug_key_path: None,
            comm: CommConfig::default(),
        }
    }
}

/// Remote-shell settings, completed at run time by the credential step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommConfig {
    /// Host to connect to. Defaults to `provision_ip`.
    #[serde(default, rename = "ssh_host")]
    pub host: String,
    /// Port to connect to.
    #[serde(default = "default_ssh_port", rename = "ssh_port")]
    pub port: u16,
    /// Login user inside the container.
    #[serde(default = "default_ssh_username", rename = "ssh_username")]
    pub username: String,
    /// Password login.
    #[serde(default, rename = "ssh_password")]
    pub password: String,
    /// Existing private key to use instead of an ephemeral one.
    #[serde(default, rename = "ssh_private_key_file")]
    pub private_key_file: Option<PathBuf>,
    /// Authenticate through the local agent.
    #[serde(default, rename = "ssh_agent_auth")]
    pub agent_auth: bool,

    /// PEM private key in use for this run.
    #[serde(skip)]
    pub private_key: Vec<u8>,
    /// `authorized_keys` line matching `private_key`.
    #[serde(skip)]
    pub public_key: String,
    /// Comment identifying the key pair.
    #[serde(skip)]
    pub key_pair_name: String,
    /// Name of the temporary key pair, when one was created.
    #[serde(skip)]
    pub temporary_key_pair_name: String,
    /// Remove `public_key` from the instance after provisioning.
    #[serde(skip)]
    pub clear_authorized_keys: bool,
    /// Debug copy of the ephemeral private key written by this run.
    #[serde(skip)]
    pub debug_key_file: Option<PathBuf>,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_username() -> String {
    "root".to_string()
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_ssh_port(),
            username: default_ssh_username(),
            password: String::new(),
            private_key_file: None,
            agent_auth: false,
            private_key: Vec::new(),
            public_key: String::new(),
            key_pair_name: String::new(),
            temporary_key_pair_name: String::new(),
            clear_authorized_keys: false,
            debug_key_file: None,
        }
    }
}

impl Config {
    /// Creates a new configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON configuration document.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError {
            errors: vec![format!("could not decode configuration: {e}")],
        })
    }

    /// Applies defaults from the process environment, then validates.
    ///
    /// Returns warnings for values that were silently corrected.
    pub fn prepare(&mut self) -> Result<Vec<String>, ConfigError> {
        self.prepare_with_env(|key| std::env::var(key).ok())
    }

    /// Like [`Config::prepare`] with an explicit environment lookup.
    pub fn prepare_with_env<F>(&mut self, env: F) -> Result<Vec<String>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut warnings = Vec::new();
        let mut errs = ConfigError::new();

        fill_from_env(&mut self.proxmox_url, "PROXMOX_URL", &env);
        fill_from_env(&mut self.username, "PROXMOX_USERNAME", &env);
        fill_from_env(&mut self.password, "PROXMOX_PASSWORD", &env);
        fill_from_env(&mut self.token, "PROXMOX_TOKEN", &env);

        if self.task_timeout_secs == 0 {
            self.task_timeout_secs = default_task_timeout();
        }
        if self.memory < 16 {
            let msg = format!("Memory {} is too small, using default: 512", self.memory);
            warn!("{}", msg);
            warnings.push(msg);
            self.memory = default_memory();
        }
        if self.cores < 1 {
            let msg = format!("Number of cores {} is too small, using default: 1", self.cores);
            warn!("{}", msg);
            warnings.push(msg);
            self.cores = default_cores();
        }
        if self.provision_mac.is_empty() {
            self.provision_mac = default_provision_mac();
        }
        if self.template_storage_pool.is_empty() {
            self.template_storage_pool = default_template_storage_pool();
        }
        if self.vmid == Some(0) {
            self.vmid = None;
        }
        if self.vmid_allocation_attempts == 0 {
            self.vmid_allocation_attempts = default_allocation_attempts();
        }

        if self.username.is_empty() {
            errs.push("username must be specified");
        }
        if self.password.is_empty() {
            errs.push("password must be specified");
        }
        if self.proxmox_url.is_empty() {
            errs.push("proxmox_url must be specified");
        } else if let Err(e) = Url::parse(&self.proxmox_url) {
            errs.push(format!("could not parse proxmox_url: {e}"));
        }
        if self.node.is_empty() {
            errs.push("node must be specified");
        }
        if self.template_file.contains(' ') {
            errs.push("template_file must not contain spaces");
        }
        if self.fs_storage.is_empty() {
            errs.push("filesystem_storage must be specified");
        }
        if self.fs_size == 0 {
            errs.push("filesystem_size must be specified");
        }
        if self.template_suffix.is_empty() {
            errs.push("template_suffix must be specified");
        }
        if self.provision_ip.is_empty() {
            errs.push("provision_ip must be specified");
        }
        if self.provision_gateway_ip.is_empty() {
            errs.push("provision_gateway_ip must be specified");
        }
        if self.debug && self.debug_key_path.is_none() {
            errs.push("debug_key_path must be specified when debug is enabled");
        }

        if self.comm.host.is_empty() {
            self.comm.host = self.provision_ip.clone();
        }

        if errs.is_empty() {
            Ok(warnings)
        } else {
            Err(errs)
        }
    }

    /// Platform task timeout.
    #[must_use]
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    /// Host part of the API URL.
    #[must_use]
    pub fn api_host(&self) -> Option<String> {
        Url::parse(&self.proxmox_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
    }

    /// Sets the explicit instance identity.
    #[must_use]
    pub fn with_vmid(mut self, vmid: u32) -> Self {
        self.vmid = Some(vmid);
        self
    }

    /// Sets the node.
    #[must_use]
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = node.into();
        self
    }
}

fn fill_from_env<F>(field: &mut String, key: &str, env: &F)
where
    F: Fn(&str) -> Option<String>,
{
    if field.is_empty() {
        if let Some(value) = env(key) {
            *field = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn complete() -> Config {
        Config {
            proxmox_url: "https://pve.local:8006/api2/json".to_string(),
            username: "root@pam".to_string(),
            password: "secret".to_string(),
            node: "pve".to_string(),
            template_file: "ubuntu-base.tar.gz".to_string(),
            template_suffix: "v2".to_string(),
            backup_storage_pool: "backups".to_string(),
            fs_storage: "local-lvm".to_string(),
            fs_size: 8,
            provision_ip: "10.0.0.50".to_string(),
            provision_gateway_ip: "10.0.0.1".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn test_defaults_from_json() {
        let config =
            Config::from_json(r#"{"node": "pve", "vmid": 200, "ssh_port": 2222}"#).unwrap();

        assert_eq!(config.node, "pve");
        assert_eq!(config.vmid, Some(200));
        assert_eq!(config.template_storage_pool, "local");
        assert_eq!(config.provision_mac, "1e:eb:08:d1:e7:e2");
        assert_eq!(config.task_timeout_secs, 60);
        assert_eq!(config.dump_dir, "/var/lib/vz/dump");
        assert_eq!(config.vmid_allocation_attempts, 5);
        assert_eq!(config.comm.username, "root");
        assert_eq!(config.comm.port, 2222);
        assert!(config.prune_backups);
    }

    #[test]
    fn test_allocation_backoff_from_json() {
        let config = Config::from_json(
            r#"{"vmid_allocation_backoff": "exponential", "vmid_allocation_jitter": "equal"}"#,
        )
        .unwrap();

        assert_eq!(config.vmid_allocation_backoff, BackoffStrategy::Exponential);
        assert_eq!(config.vmid_allocation_jitter, JitterStrategy::Equal);
        assert_eq!(config.vmid_allocation_max_delay_ms, 30_000);
        assert_eq!(
            Config::default().vmid_allocation_backoff,
            BackoffStrategy::Constant
        );
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        let err = Config::from_json("{not json").unwrap_err();
        assert_eq!(err.errors.len(), 1);
    }

    #[test]
    fn test_prepare_complete_config() {
        let mut config = complete();
        let warnings = config.prepare_with_env(|_| None).unwrap();

        assert!(warnings.is_empty());
        assert_eq!(config.comm.host, "10.0.0.50");
        assert_eq!(config.api_host().as_deref(), Some("pve.local"));
    }

    #[test]
    fn test_prepare_reads_environment() {
        let mut config = complete();
        config.proxmox_url.clear();
        config.password.clear();

        config
            .prepare_with_env(|key| match key {
                "PROXMOX_URL" => Some("https://from-env:8006/api2/json".to_string()),
                "PROXMOX_PASSWORD" => Some("env-secret".to_string()),
                _ => None,
            })
            .unwrap();

        assert_eq!(config.proxmox_url, "https://from-env:8006/api2/json");
        assert_eq!(config.password, "env-secret");
    }

    #[test]
    fn test_prepare_collects_all_errors() {
        let mut config = Config::default();
        let err = config.prepare_with_env(|_| None).unwrap_err();

        assert!(err.errors.contains(&"username must be specified".to_string()));
        assert!(err.errors.contains(&"node must be specified".to_string()));
        assert!(err.errors.contains(&"template_suffix must be specified".to_string()));
        assert!(err.errors.contains(&"provision_ip must be specified".to_string()));
        assert!(err.errors.len() >= 9);
    }

    #[test]
    fn test_prepare_clamps_resources() {
        let mut config = complete();
        config.memory = 8;
        config.cores = 0;

        let warnings = config.prepare_with_env(|_| None).unwrap();

        assert_eq!(warnings.len(), 2);
        assert_eq!(config.memory, 512);
        assert_eq!(config.cores, 1);
    }

    #[test]
    fn test_prepare_rejects_spaces_in_template_file() {
        let mut config = complete();
        config.template_file = "ubuntu base.tar.gz".to_string();

        let err = config.prepare_with_env(|_| None).unwrap_err();
        assert_eq!(err.errors, vec!["template_file must not contain spaces".to_string()]);
    }

    #[test]
    fn test_prepare_zero_vmid_means_allocate() {
        let mut config = complete().with_vmid(0);
        config.prepare_with_env(|_| None).unwrap();
        assert_eq!(config.vmid, None);
    }
}
