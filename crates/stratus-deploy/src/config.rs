//! Configuration for module deployment and playbook runs
//!
//! Defaults are overridden from `STRATUS_DEPLOY_*` environment variables
//! and, optionally, from a configuration file.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{DeployError, DeployResult};

/// Property prefix for extra playbook variables
pub const VARIABLE_PREFIX: &str = "deploy.var.";

/// Property prefix for runner configuration settings
pub const RUNNER_SETTING_PREFIX: &str = "deploy.cfg.";

/// Runner verbosity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugMode {
    /// Normal output
    #[default]
    Off,
    /// Pass `-vvvv` to the runner
    Verbose,
    /// Pass `-vvvv` and append runner output to the log file
    VerboseLog,
}

impl std::str::FromStr for DebugMode {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "false" | "0" => Ok(DebugMode::Off),
            "verbose" | "true" | "1" => Ok(DebugMode::Verbose),
            "verbose_log" | "log" => Ok(DebugMode::VerboseLog),
            other => Err(DeployError::Config(format!("unknown debug mode '{}'", other))),
        }
    }
}

/// A module deployed by [`PlaybookFacade::init`](crate::PlaybookFacade::init)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibModule {
    /// Module directory
    pub path: PathBuf,
    /// Playbook file inside the module
    pub playbook: String,
}

/// Deployment configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Directory playbooks are linked into and run from
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Directory deployed module copies live in
    #[serde(default = "default_files_dir")]
    pub files_dir: PathBuf,

    /// Runner inventory file
    #[serde(default = "default_inventory_file")]
    pub inventory_file: PathBuf,

    /// Runner configuration file written by `init`
    #[serde(default = "default_config_file")]
    pub config_file: PathBuf,

    /// Playbook runner executable
    #[serde(default = "default_executable")]
    pub executable: String,

    /// Parallel hosts per runner invocation
    #[serde(default = "default_max_forks")]
    pub max_forks: u32,

    /// Runner verbosity
    #[serde(default)]
    pub debug_mode: DebugMode,

    /// Runner output log used by [`DebugMode::VerboseLog`]
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,

    /// Library package name passed to every playbook
    #[serde(default = "default_lib_package")]
    pub lib_package: String,

    /// Library module deployed on `init`
    #[serde(default)]
    pub lib_module: Option<LibModule>,

    /// Private key restricted to the owner on `init`
    #[serde(default)]
    pub private_key: Option<PathBuf>,

    /// Extra playbook variables; these override request arguments
    #[serde(default)]
    pub variables: BTreeMap<String, String>,

    /// Extra `[defaults]` settings for the runner configuration file
    #[serde(default)]
    pub runner_settings: BTreeMap<String, String>,
}

const DEFAULT_ROOT: &str = "/var/lib/stratus/playbooks";

fn default_root_dir() -> PathBuf {
    PathBuf::from(DEFAULT_ROOT)
}

fn default_files_dir() -> PathBuf {
    default_root_dir().join("files")
}

fn default_inventory_file() -> PathBuf {
    default_root_dir().join("hosts")
}

fn default_config_file() -> PathBuf {
    default_root_dir().join("runner.cfg")
}

fn default_executable() -> String {
    "ansible-playbook".to_string()
}

fn default_max_forks() -> u32 {
    100
}

fn default_log_path() -> PathBuf {
    default_root_dir().join("logs").join("playbook.log")
}

fn default_lib_package() -> String {
    "stratuslib.tar.gz".to_string()
}

fn path_value(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self::under_root(default_root_dir())
    }
}

impl DeployConfig {
    /// Defaults with every path placed under `root`
    pub fn under_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            files_dir: root.join("files"),
            inventory_file: root.join("hosts"),
            config_file: root.join("runner.cfg"),
            log_path: root.join("logs").join("playbook.log"),
            root_dir: root,
            executable: default_executable(),
            max_forks: default_max_forks(),
            debug_mode: DebugMode::default(),
            lib_package: default_lib_package(),
            lib_module: None,
            private_key: None,
            variables: BTreeMap::new(),
            runner_settings: BTreeMap::new(),
        }
    }

    /// Move every root-relative path under `root`, keeping other settings
    pub fn rebased(self, root: impl Into<PathBuf>) -> Self {
        let rooted = Self::under_root(root);
        Self {
            root_dir: rooted.root_dir,
            files_dir: rooted.files_dir,
            inventory_file: rooted.inventory_file,
            config_file: rooted.config_file,
            log_path: rooted.log_path,
            ..self
        }
    }

    /// Load configuration from environment variables
    pub fn load() -> DeployResult<Self> {
        let mut config = match env::var("STRATUS_DEPLOY_ROOT_DIR") {
            Ok(root) => Self::under_root(root),
            Err(_) => Self::default(),
        };

        if let Ok(dir) = env::var("STRATUS_DEPLOY_FILES_DIR") {
            config.files_dir = PathBuf::from(dir);
        }

        if let Ok(executable) = env::var("STRATUS_DEPLOY_EXECUTABLE") {
            config.executable = executable;
        }

        if let Ok(forks) = env::var("STRATUS_DEPLOY_MAX_FORKS") {
            match forks.parse::<u32>() {
                Ok(forks) => config.max_forks = forks,
                Err(_) => warn!("Invalid STRATUS_DEPLOY_MAX_FORKS value: {}", forks),
            }
        }

        if let Ok(mode) = env::var("STRATUS_DEPLOY_DEBUG_MODE") {
            match mode.parse::<DebugMode>() {
                Ok(mode) => config.debug_mode = mode,
                Err(e) => warn!("Invalid STRATUS_DEPLOY_DEBUG_MODE value: {}", e),
            }
        }

        if let Ok(path) = env::var("STRATUS_DEPLOY_LOG_PATH") {
            config.log_path = PathBuf::from(path);
        }

        if let Ok(package) = env::var("STRATUS_DEPLOY_LIB_PACKAGE") {
            config.lib_package = package;
        }

        if let Ok(key) = env::var("STRATUS_DEPLOY_PRIVATE_KEY") {
            config.private_key = Some(PathBuf::from(key));
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file (format chosen by extension), with
    /// `STRATUS_DEPLOY__*` environment variables taking precedence.
    ///
    /// Paths that are not set explicitly are placed under `root_dir`.
    pub fn from_file(path: &Path) -> DeployResult<Self> {
        let sources = || {
            config::Config::builder()
                .add_source(config::File::from(path))
                .add_source(config::Environment::with_prefix("STRATUS_DEPLOY").separator("__"))
        };

        let root = sources()
            .build()?
            .get::<PathBuf>("root_dir")
            .unwrap_or_else(|_| default_root_dir());
        let rooted = Self::under_root(&root);

        let config: DeployConfig = sources()
            .set_default("files_dir", path_value(&rooted.files_dir))?
            .set_default("inventory_file", path_value(&rooted.inventory_file))?
            .set_default("config_file", path_value(&rooted.config_file))?
            .set_default("log_path", path_value(&rooted.log_path))?
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Pick up `deploy.var.*` variables and `deploy.cfg.*` runner settings
    /// from a flat property map
    pub fn apply_properties(&mut self, properties: &HashMap<String, String>) {
        for (key, value) in properties {
            if let Some(name) = key.strip_prefix(VARIABLE_PREFIX) {
                debug!("Discovered playbook variable [{}={}]", name, value);
                self.variables.insert(name.to_string(), value.clone());
            } else if let Some(name) = key.strip_prefix(RUNNER_SETTING_PREFIX) {
                debug!("Discovered runner setting [{}={}]", name, value);
                self.runner_settings.insert(name.to_string(), value.clone());
            }
        }
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> DeployResult<()> {
        if self.executable.trim().is_empty() {
            return Err(DeployError::Config("executable must not be empty".to_string()));
        }
        if self.max_forks == 0 {
            return Err(DeployError::Config("max_forks must be greater than zero".to_string()));
        }
        Ok(())
    }

    /// Where module `name` is deployed
    pub fn module_dest(&self, name: &str) -> PathBuf {
        self.files_dir.join(name)
    }

    /// Where playbook `playbook` is linked
    pub fn playbook_path(&self, playbook: &str) -> PathBuf {
        self.root_dir.join(playbook)
    }

    /// Contents of the runner configuration file
    pub fn render_runner_config(&self) -> String {
        let mut out = String::from("[defaults]\n");
        out.push_str(&format!("forks = {}\n", self.max_forks));
        out.push_str(&format!("inventory = {}\n", self.inventory_file.display()));
        for (key, value) in &self.runner_settings {
            out.push_str(&format!("{} = {}\n", key, value));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_under_root_places_paths() {
        let config = DeployConfig::under_root("/tmp/stratus");
        assert_eq!(config.files_dir, PathBuf::from("/tmp/stratus/files"));
        assert_eq!(config.module_dest("kvm"), PathBuf::from("/tmp/stratus/files/kvm"));
        assert_eq!(config.playbook_path("kvm.yaml"), PathBuf::from("/tmp/stratus/kvm.yaml"));
        assert_eq!(config.max_forks, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_apply_properties_strips_prefixes() {
        let mut config = DeployConfig::default();
        let properties = HashMap::from([
            ("deploy.var.yum_repo".to_string(), "local".to_string()),
            ("deploy.cfg.host_key_checking".to_string(), "False".to_string()),
            ("unrelated.key".to_string(), "x".to_string()),
        ]);
        config.apply_properties(&properties);

        assert_eq!(config.variables.get("yum_repo"), Some(&"local".to_string()));
        assert_eq!(config.runner_settings.get("host_key_checking"), Some(&"False".to_string()));
        assert_eq!(config.variables.len(), 1);
        assert_eq!(config.runner_settings.len(), 1);
    }

    #[test]
    fn test_render_runner_config() {
        let mut config = DeployConfig::under_root("/srv/pb");
        config.max_forks = 25;
        config
            .runner_settings
            .insert("host_key_checking".to_string(), "False".to_string());

        assert_eq!(
            config.render_runner_config(),
            "[defaults]\nforks = 25\ninventory = /srv/pb/hosts\nhost_key_checking = False\n"
        );
    }

    #[test]
    fn test_rebased_keeps_settings() {
        let mut config = DeployConfig::default();
        config.max_forks = 7;
        config.variables.insert("repo".to_string(), "local".to_string());

        let config = config.rebased("/srv/pb");
        assert_eq!(config.inventory_file, PathBuf::from("/srv/pb/hosts"));
        assert_eq!(config.files_dir, PathBuf::from("/srv/pb/files"));
        assert_eq!(config.max_forks, 7);
        assert_eq!(config.variables.len(), 1);
    }

    #[test]
    fn test_debug_mode_parse() {
        assert_eq!("verbose".parse::<DebugMode>().unwrap(), DebugMode::Verbose);
        assert_eq!("LOG".parse::<DebugMode>().unwrap(), DebugMode::VerboseLog);
        assert!("loud".parse::<DebugMode>().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deploy.json");
        std::fs::write(
            &path,
            r#"{ "root_dir": "/srv/pb", "max_forks": 10, "debug_mode": "verbose", "variables": { "repo": "local" } }"#,
        )
        .unwrap();

        let config = DeployConfig::from_file(&path).unwrap();
        assert_eq!(config.root_dir, PathBuf::from("/srv/pb"));
        assert_eq!(config.max_forks, 10);
        assert_eq!(config.debug_mode, DebugMode::Verbose);
        assert_eq!(config.variables.get("repo"), Some(&"local".to_string()));
        assert_eq!(config.executable, "ansible-playbook");
    }

    #[test]
    fn test_from_file_places_paths_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deploy.json");
        std::fs::write(
            &path,
            r#"{ "root_dir": "/srv/pb", "log_path": "/var/log/stratus/runner.log" }"#,
        )
        .unwrap();

        let config = DeployConfig::from_file(&path).unwrap();
        assert_eq!(config.files_dir, PathBuf::from("/srv/pb/files"));
        assert_eq!(config.inventory_file, PathBuf::from("/srv/pb/hosts"));
        assert_eq!(config.config_file, PathBuf::from("/srv/pb/runner.cfg"));
        assert_eq!(config.module_dest("kvm"), PathBuf::from("/srv/pb/files/kvm"));
        assert_eq!(config.log_path, PathBuf::from("/var/log/stratus/runner.log"));
    }

    #[test]
    fn test_validate_rejects_zero_forks() {
        let mut config = DeployConfig::default();
        config.max_forks = 0;
        assert!(matches!(config.validate(), Err(DeployError::Config(_))));
    }
}
