use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::fingerprint::FingerprintSet;

/// What is known about one module
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRecord {
    /// Where the module was last deployed from
    pub source: Option<PathBuf>,
    /// Fingerprints of the last successful deployment
    pub deployed: Option<FingerprintSet>,
    /// Set by a deployment, cleared when read through
    /// [`ModuleRegistry::consume_changed_flag`]
    pub changed: bool,
    /// When the last successful deployment was recorded
    pub deployed_at: Option<DateTime<Utc>>,
}

/// Deployment state of every known module.
///
/// Owned by the deployment consumer and shared by reference. Records for a
/// module are only mutated while that module's scheduler signature is held.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: DashMap<String, ModuleRecord>,
}

impl ModuleRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember where `name` is deployed from
    pub fn register_source(&self, name: &str, source: &Path) {
        self.modules.entry(name.to_string()).or_default().source = Some(source.to_path_buf());
    }

    /// Source directory of `name`, if it was ever deployed or checked
    pub fn source(&self, name: &str) -> Option<PathBuf> {
        self.modules.get(name).and_then(|record| record.source.clone())
    }

    /// Fingerprints recorded by the last deployment of `name`
    pub fn recorded(&self, name: &str) -> Option<FingerprintSet> {
        self.modules.get(name).and_then(|record| record.deployed.clone())
    }

    /// Record a successful deployment and raise the changed flag
    pub fn record_deployed(&self, name: &str, fingerprints: FingerprintSet) {
        let mut record = self.modules.entry(name.to_string()).or_default();
        debug!(module = %name, files = fingerprints.len(), "Recording module deployment");
        record.deployed = Some(fingerprints);
        record.changed = true;
        record.deployed_at = Some(Utc::now());
    }

    /// Read and clear the changed flag; false for unknown modules
    pub fn consume_changed_flag(&self, name: &str) -> bool {
        match self.modules.get_mut(name) {
            Some(mut record) => std::mem::take(&mut record.changed),
            None => false,
        }
    }

    /// Read the changed flag without clearing it
    pub fn is_changed(&self, name: &str) -> bool {
        self.modules.get(name).map(|record| record.changed).unwrap_or(false)
    }

    /// Whether anything is known about `name`
    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Snapshot of the record for `name`
    pub fn record(&self, name: &str) -> Option<ModuleRecord> {
        self.modules.get(name).map(|record| record.clone())
    }

    /// Names of all known modules, sorted
    pub fn modules(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
