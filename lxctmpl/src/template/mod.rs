//! Backup selection and template naming.
//!
//! Pure functions used by the conversion and transfer steps.

use crate::platform::ArchiveEntry;
use regex::Regex;
use std::path::Path;

/// Matches backup archive names produced for one container.
#[derive(Debug, Clone)]
pub struct BackupMatcher {
    vmid: u32,
    pattern: Regex,
}

impl BackupMatcher {
    /// Builds the matcher for `vmid`.
    ///
    /// # Errors
    ///
    /// Returns the regex compilation error.
    pub fn new(vmid: u32) -> Result<Self, regex::Error> {
        let pattern = Regex::new(&format!(r"^vzdump-lxc-{vmid}-.*\.tar\.gz$"))?;
        Ok(Self { vmid, pattern })
    }

    /// The container this matcher is for.
    #[must_use]
    pub fn vmid(&self) -> u32 {
        self.vmid
    }

    /// Whether `name` is a backup of this container.
    #[must_use]
    pub fn is_match(&self, name: &str) -> bool {
        self.pattern.is_match(name)
    }

    /// The most recent matching entry.
    ///
    /// Among entries with the same creation time the first listed wins.
    #[must_use]
    pub fn latest<'a>(&self, entries: &'a [ArchiveEntry]) -> Option<&'a ArchiveEntry> {
        let mut best: Option<&ArchiveEntry> = None;
        for entry in entries.iter().filter(|e| self.is_match(&e.name)) {
            match best {
                Some(current) if entry.ctime <= current.ctime => {}
                _ => best = Some(entry),
            }
        }
        best
    }
}

/// Whether `name` is a backup archive of container `vmid`.
#[must_use]
pub fn matches_instance(name: &str, vmid: u32) -> bool {
    BackupMatcher::new(vmid).is_ok_and(|m| m.is_match(name))
}

/// Picks the most recent backup of `vmid` from a pool listing.
#[must_use]
pub fn select_latest_backup(entries: &[ArchiveEntry], vmid: u32) -> Option<&ArchiveEntry> {
    BackupMatcher::new(vmid).ok()?.latest(entries)
}

/// Name of the produced template.
///
/// Takes the file name of `base`, strips up to two extensions and appends
/// `_<suffix>.<extension>`. `ubuntu-base.tar.gz` with suffix `v2` and
/// extension `tar.gz` gives `ubuntu-base_v2.tar.gz`.
#[must_use]
pub fn template_file_name(base: &str, suffix: &str, extension: &str) -> String {
    let stem = strip_extensions(base, 2);
    let extension = extension.trim_start_matches('.');
    if extension.is_empty() {
        format!("{stem}_{suffix}")
    } else {
        format!("{stem}_{suffix}.{extension}")
    }
}

fn strip_extensions(name: &str, max: usize) -> String {
    let mut current = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    for _ in 0..max {
        match Path::new(&current).file_stem() {
            Some(stem) if stem.len() < current.len() => {
                current = stem.to_string_lossy().into_owned();
            }
            _ => break,
        }
    }
    current
}

/// User part of a `user@realm` API login.
///
/// Returns `None` when either part is missing.
#[must_use]
pub fn transfer_username(api_user: &str) -> Option<&str> {
    match api_user.split_once('@') {
        Some((user, realm)) if !user.is_empty() && !realm.is_empty() => Some(user),
        _ => None,
    }
}
