//! Remote file-transfer port.
//!
//! Backup archives are pulled off the node over a file-transfer session that
//! authenticates with the API credentials.

use crate::config::Config;
use crate::errors::TransferError;
use async_trait::async_trait;
use std::fmt;
use std::path::Path;

/// Where and as whom to open a transfer session.
#[derive(Clone, PartialEq, Eq)]
pub struct TransferTarget {
    /// Remote host.
    pub host: String,
    /// Remote port.
    pub port: u16,
    /// Login user.
    pub username: String,
    /// Login password.
    pub password: String,
}

impl fmt::Debug for TransferTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl TransferTarget {
    /// Derives the session target from the API settings.
    ///
    /// The realm suffix of the API user is dropped, so `root@pam` logs in as
    /// `root`.
    ///
    /// # Errors
    ///
    /// Fails when the API URL has no host or the user has no realm.
    pub fn from_config(config: &Config) -> Result<Self, TransferError> {
        let host = config.api_host().ok_or_else(|| {
            TransferError::Session(format!("no host in API URL '{}'", config.proxmox_url))
        })?;
        let username = crate::template::transfer_username(&config.username).ok_or_else(|| {
            TransferError::Auth(format!(
                "username '{}' is not in user@realm form",
                config.username
            ))
        })?;

        Ok(Self {
            host,
            port: config.transfer_port,
            username: username.to_string(),
            password: config.password.clone(),
        })
    }

    /// `user@host:port` for logs.
    #[must_use]
    pub fn display_addr(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Opens transfer sessions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FileTransfer: Send + Sync {
    /// Connects and authenticates.
    async fn connect(
        &self,
        target: &TransferTarget,
    ) -> Result<Box<dyn TransferSession>, TransferError>;
}

/// An authenticated session against one host.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransferSession: Send + Sync {
    /// File names in a remote directory.
    async fn list_dir(&self, dir: &str) -> Result<Vec<String>, TransferError>;

    /// Copies a remote file into `dest`, returning the byte count.
    async fn download(&self, remote: &str, dest: &Path) -> Result<u64, TransferError>;

    /// Removes a remote file.
    async fn remove(&self, remote: &str) -> Result<(), TransferError>;
}

/// Joins a remote directory and file name with a single separator.
#[must_use]
pub fn remote_path(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

/// Splits an absolute remote path into its directory and file name.
#[must_use]
pub fn split_remote_path(path: &str) -> Option<(&str, &str)> {
    let (dir, name) = path.rsplit_once('/')?;
    if name.is_empty() {
        return None;
    }
    Some((if dir.is_empty() { "/" } else { dir }, name))
}
