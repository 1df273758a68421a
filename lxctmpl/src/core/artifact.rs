//! The terminal output of a successful build.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Identifier the host uses to attribute artifacts to this builder.
pub const BUILDER_ID: &str = "proxmox-lxc.builder";

/// A template produced by a completed run.
///
/// Only ever constructed once every step has continued, so it is never
/// partially populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Name of the template in the template storage pool.
    pub template_path: String,

    /// Storage pool holding the template.
    pub storage_pool: String,

    /// Data forwarded to post-processors (e.g. `generated_data`).
    #[serde(default)]
    pub state_data: HashMap<String, serde_json::Value>,

    /// When the artifact was assembled.
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Artifact {
    /// Creates a new artifact.
    #[must_use]
    pub fn new(template_path: impl Into<String>, storage_pool: impl Into<String>) -> Self {
        Self {
            template_path: template_path.into(),
            storage_pool: storage_pool.into(),
            state_data: HashMap::new(),
            created_at: chrono::Utc::now(),
        }
    }

    /// Adds forwarded state data.
    #[must_use]
    pub fn with_state(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.state_data.insert(key.into(), value);
        self
    }

    /// Returns the builder identifier.
    #[must_use]
    pub fn builder_id(&self) -> &'static str {
        BUILDER_ID
    }

    /// Returns the artifact identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.template_path
    }

    /// Returns the files making up the artifact.
    #[must_use]
    pub fn files(&self) -> Vec<String> {
        vec![self.template_path.clone()]
    }

    /// Returns a forwarded state value.
    #[must_use]
    pub fn state(&self, name: &str) -> Option<&serde_json::Value> {
        self.state_data.get(name)
    }

    /// Storage volume id of the template, e.g. `local:vztmpl/name.tar.gz`.
    #[must_use]
    pub fn volume_id(&self) -> String {
        format!("{}:vztmpl/{}", self.storage_pool, self.template_path)
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "A template was created: {}", self.template_path)
    }
}
