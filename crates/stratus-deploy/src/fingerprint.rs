//! Content fingerprints of module directories.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::{DeployError, DeployResult};

/// Calculate the SHA-256 fingerprint of file content
pub fn fingerprint(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Fingerprints of every file under a directory, keyed by relative path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintSet {
    files: BTreeMap<String, String>,
}

impl FingerprintSet {
    /// Build a set from (relative path, fingerprint) pairs
    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            files: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Fingerprint every regular file below `dir`.
    ///
    /// Relative paths always use `/` separators. Symlinks are followed.
    pub fn scan(dir: &Path) -> DeployResult<Self> {
        if !dir.is_dir() {
            return Err(DeployError::ModuleNotFound(dir.to_path_buf()));
        }
        let mut files = BTreeMap::new();
        scan_into(dir, "", &mut files)?;
        Ok(Self { files })
    }

    /// Fingerprint of one file
    pub fn get(&self, relative: &str) -> Option<&str> {
        self.files.get(relative).map(String::as_str)
    }

    /// Number of files
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the set has no files
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Iterate (relative path, fingerprint) in path order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Decide whether a destination holding `deployed` needs this content.
    ///
    /// `None` means nothing is deployed. Checks run in order: file count,
    /// missing files, changed fingerprints.
    pub fn diff(&self, deployed: Option<&FingerprintSet>) -> DeployDecision {
        let deployed = match deployed {
            Some(deployed) => deployed,
            None => return DeployDecision::DestinationAbsent,
        };

        if self.len() != deployed.len() {
            return DeployDecision::FileCountMismatch {
                source: self.len(),
                destination: deployed.len(),
            };
        }

        for (path, hash) in &self.files {
            match deployed.files.get(path) {
                None => return DeployDecision::FileMissing { file: path.clone() },
                Some(other) if other != hash => {
                    return DeployDecision::FingerprintChanged { file: path.clone() }
                }
                Some(_) => {}
            }
        }

        DeployDecision::UpToDate
    }
}

fn scan_into(dir: &Path, prefix: &str, files: &mut BTreeMap<String, String>) -> DeployResult<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let relative = if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        };

        if path.is_dir() {
            scan_into(&path, &relative, files)?;
        } else if path.is_file() {
            let content = fs::read(&path)?;
            files.insert(relative, fingerprint(&content));
        }
    }
    Ok(())
}

/// Outcome of comparing a module with what is deployed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DeployDecision {
    /// Nothing is deployed yet
    DestinationAbsent,
    /// Source and destination hold different numbers of files
    FileCountMismatch {
        /// Files in the source module
        source: usize,
        /// Files at the destination
        destination: usize,
    },
    /// A source file is absent at the destination
    FileMissing {
        /// Relative path of the missing file
        file: String,
    },
    /// A file's content differs
    FingerprintChanged {
        /// Relative path of the changed file
        file: String,
    },
    /// Every fingerprint matches
    UpToDate,
}

impl DeployDecision {
    /// Whether a deployment is required
    pub fn is_needed(&self) -> bool {
        !matches!(self, DeployDecision::UpToDate)
    }
}

impl fmt::Display for DeployDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeployDecision::DestinationAbsent => write!(f, "destination does not exist"),
            DeployDecision::FileCountMismatch {
                source,
                destination,
            } => write!(
                f,
                "source has {} files, destination has {}",
                source, destination
            ),
            DeployDecision::FileMissing { file } => write!(f, "{} is missing at destination", file),
            DeployDecision::FingerprintChanged { file } => write!(f, "{} changed", file),
            DeployDecision::UpToDate => write!(f, "no file changed"),
        }
    }
}
