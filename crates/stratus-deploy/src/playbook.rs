//! Playbook execution against remote hosts.
//!
//! Runs for one host are serialized through the scheduler under
//! `run-playbook-for-host-<ip>`; runs for different hosts proceed in
//! parallel.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stratus_core::{Completion, CoreError};
use stratus_scheduler::{SyncTaskScheduler, TaskSpec};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{DebugMode, DeployConfig};
use crate::deployer::{DeployOutcome, ModuleDeployer};
use crate::error::{DeployError, DeployResult};
use crate::registry::ModuleRegistry;

/// Level of playbook runs among waiters for the same host
pub const PLAYBOOK_LEVEL: i32 = 1;

/// Scheduler signature owning host `ip`
pub fn host_signature(ip: &str) -> String {
    format!("run-playbook-for-host-{}", ip)
}

/// A request to run a playbook against one host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookRequest {
    /// Target host address
    pub host: String,
    /// Playbook file name, relative to the root directory
    pub playbook: String,
    /// Private key used to reach the host
    pub private_key: PathBuf,
    /// Caller supplied playbook arguments
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl PlaybookRequest {
    /// Create a request without arguments
    pub fn new(
        host: impl Into<String>,
        playbook: impl Into<String>,
        private_key: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host: host.into(),
            playbook: playbook.into(),
            private_key: private_key.into(),
            arguments: Map::new(),
        }
    }

    /// Add one argument
    pub fn argument(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }
}

/// A fully resolved runner invocation
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybookInvocation {
    /// Runner executable
    pub executable: String,
    /// Absolute playbook path
    pub playbook_path: PathBuf,
    /// Inventory file
    pub inventory: PathBuf,
    /// Private key file
    pub private_key: PathBuf,
    /// Extra variables, passed as one JSON document
    pub extra_vars: Map<String, Value>,
    /// Verbosity
    pub debug_mode: DebugMode,
    /// Output log for [`DebugMode::VerboseLog`]
    pub log_path: PathBuf,
    /// Working directory
    pub working_dir: PathBuf,
}

impl PlaybookInvocation {
    /// Runner arguments: `<playbook> -i <inventory> [-vvvv] --private-key <key> -e <json>`
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            self.playbook_path.display().to_string(),
            "-i".to_string(),
            self.inventory.display().to_string(),
        ];
        if self.debug_mode != DebugMode::Off {
            args.push("-vvvv".to_string());
        }
        args.push("--private-key".to_string());
        args.push(self.private_key.display().to_string());
        args.push("-e".to_string());
        args.push(Value::Object(self.extra_vars.clone()).to_string());
        args
    }
}

/// Executes playbook invocations
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlaybookRunner: Send + Sync {
    /// Run the playbook, failing if it does not succeed
    async fn run(&self, invocation: &PlaybookInvocation) -> DeployResult<()>;
}

/// Runs playbooks as child processes
#[derive(Debug, Default, Clone)]
pub struct CommandPlaybookRunner;

#[async_trait]
impl PlaybookRunner for CommandPlaybookRunner {
    async fn run(&self, invocation: &PlaybookInvocation) -> DeployResult<()> {
        let args = invocation.args();
        debug!(executable = %invocation.executable, args = ?args, "Starting playbook runner");

        let output = Command::new(&invocation.executable)
            .args(&args)
            .current_dir(&invocation.working_dir)
            .output()
            .await
            .map_err(|e| {
                DeployError::Command(format!("failed to start {}: {}", invocation.executable, e))
            })?;

        if invocation.debug_mode == DebugMode::VerboseLog {
            if let Err(e) = append_log(&invocation.log_path, &output.stdout, &output.stderr).await {
                warn!(log = %invocation.log_path.display(), error = %e, "Failed to write runner log");
            }
        }

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() { stdout } else { stderr };
            Err(DeployError::Command(format!(
                "{} {} exited with {}: {}",
                invocation.executable,
                invocation.playbook_path.display(),
                output.status,
                detail.trim()
            )))
        }
    }
}

async fn append_log(path: &Path, stdout: &[u8], stderr: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(stdout).await?;
    file.write_all(stderr).await?;
    file.flush().await
}

/// Entry point for deploying modules and running playbooks on hosts
#[derive(Clone)]
pub struct PlaybookFacade {
    config: Arc<DeployConfig>,
    scheduler: SyncTaskScheduler,
    runner: Arc<dyn PlaybookRunner>,
    deployer: ModuleDeployer,
}

impl PlaybookFacade {
    /// Create a facade with its own module registry
    pub fn new(
        config: DeployConfig,
        scheduler: SyncTaskScheduler,
        runner: Arc<dyn PlaybookRunner>,
    ) -> Self {
        Self::with_registry(config, scheduler, runner, Arc::new(ModuleRegistry::new()))
    }

    /// Create a facade sharing `registry`
    pub fn with_registry(
        config: DeployConfig,
        scheduler: SyncTaskScheduler,
        runner: Arc<dyn PlaybookRunner>,
        registry: Arc<ModuleRegistry>,
    ) -> Self {
        let config = Arc::new(config);
        let deployer = ModuleDeployer::new(config.clone(), registry, scheduler.clone());
        Self {
            config,
            scheduler,
            runner,
            deployer,
        }
    }

    /// Active configuration
    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    /// Module deployer sharing this facade's scheduler
    pub fn deployer(&self) -> &ModuleDeployer {
        &self.deployer
    }

    /// Prepare the root directory, runner configuration, private key, and
    /// library module
    pub async fn init(&self) -> DeployResult<Option<DeployOutcome>> {
        let config = &self.config;
        fs::create_dir_all(&config.root_dir)?;
        fs::create_dir_all(&config.files_dir)?;

        if let Some(key) = &config.private_key {
            restrict_key(key)?;
        }

        if let Some(parent) = config.config_file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&config.config_file, config.render_runner_config())?;
        debug!(path = %config.config_file.display(), "Wrote runner configuration");

        if !config.inventory_file.exists() {
            fs::write(&config.inventory_file, "")?;
        }

        let outcome = match &config.lib_module {
            Some(lib) => Some(self.deployer.deploy_module(&lib.path, &lib.playbook).await?),
            None => None,
        };
        info!(root = %config.root_dir.display(), "Playbook facade initialized");
        Ok(outcome)
    }

    /// Arguments passed to the playbook for `request`.
    ///
    /// Request arguments come first, then `host`, `root_dir` and
    /// `lib_package`, then configured variables, each overriding the last.
    pub fn merged_arguments(&self, request: &PlaybookRequest) -> Map<String, Value> {
        let mut arguments = request.arguments.clone();
        arguments.insert("host".to_string(), Value::from(request.host.clone()));
        arguments.insert(
            "root_dir".to_string(),
            Value::from(self.config.root_dir.display().to_string()),
        );
        arguments.insert(
            "lib_package".to_string(),
            Value::from(self.config.lib_package.clone()),
        );
        for (key, value) in &self.config.variables {
            arguments.insert(key.clone(), Value::from(value.clone()));
        }
        arguments
    }

    /// Resolve `request` into a runner invocation
    pub fn invocation(&self, request: &PlaybookRequest) -> PlaybookInvocation {
        PlaybookInvocation {
            executable: self.config.executable.clone(),
            playbook_path: self.config.playbook_path(&request.playbook),
            inventory: self.config.inventory_file.clone(),
            private_key: request.private_key.clone(),
            extra_vars: self.merged_arguments(request),
            debug_mode: self.config.debug_mode,
            log_path: self.config.log_path.clone(),
            working_dir: self.config.root_dir.clone(),
        }
    }

    /// Run a playbook, serialized with other runs against the same host
    pub async fn run_playbook(&self, request: PlaybookRequest) -> Result<(), CoreError> {
        let task = self.playbook_task(request);
        self.scheduler.submit(task).await
    }

    /// Like [`run_playbook`](Self::run_playbook), resolving `completion`
    /// instead of returning the outcome
    pub fn run_playbook_async(
        &self,
        request: PlaybookRequest,
        completion: Completion,
    ) -> Result<(), CoreError> {
        let task = self.playbook_task(request);
        self.scheduler.submit_async(task, completion)
    }

    fn playbook_task(
        &self,
        request: PlaybookRequest,
    ) -> stratus_scheduler::BodyTask<()> {
        let invocation = self.invocation(&request);
        let runner = self.runner.clone();
        let signature = host_signature(&request.host);
        let playbook = request.playbook;

        TaskSpec::new(signature.clone())
            .level(PLAYBOOK_LEVEL)
            .name(signature)
            .body(async move {
                debug!(playbook = %playbook, "Start running playbook");
                runner.run(&invocation).await.map_err(|e| {
                    warn!(playbook = %playbook, error = %e, "Playbook run failed");
                    CoreError::from(e)
                })
            })
    }
}

#[cfg(unix)]
fn restrict_key(key: &Path) -> DeployResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(key, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_key(key: &Path) -> DeployResult<()> {
    if !key.exists() {
        return Err(DeployError::Config(format!("private key {} not found", key.display())));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate;
    use serde_json::json;
    use stratus_scheduler::SchedulerConfig;

    fn facade(root: &Path, runner: MockPlaybookRunner) -> PlaybookFacade {
        let mut config = DeployConfig::under_root(root);
        config.variables.insert("yum_repo".to_string(), "mirror".to_string());
        config.variables.insert("host".to_string(), "overridden".to_string());
        PlaybookFacade::new(
            config,
            SyncTaskScheduler::new(SchedulerConfig::default()).unwrap(),
            Arc::new(runner),
        )
    }

    #[tokio::test]
    async fn test_variables_override_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let facade = facade(dir.path(), MockPlaybookRunner::new());
        let request = PlaybookRequest::new("10.0.0.5", "kvm.yaml", "/keys/id_rsa")
            .argument("yum_repo", "internet")
            .argument("pkg", "agent.tar.gz");

        let args = facade.merged_arguments(&request);
        assert_eq!(args["yum_repo"], json!("mirror"));
        assert_eq!(args["host"], json!("overridden"));
        assert_eq!(args["pkg"], json!("agent.tar.gz"));
        assert_eq!(args["lib_package"], json!("stratuslib.tar.gz"));
        assert_eq!(args["root_dir"], json!(dir.path().display().to_string()));
    }

    #[test]
    fn test_invocation_args() {
        let mut invocation = PlaybookInvocation {
            executable: "ansible-playbook".to_string(),
            playbook_path: PathBuf::from("/pb/kvm.yaml"),
            inventory: PathBuf::from("/pb/hosts"),
            private_key: PathBuf::from("/keys/id_rsa"),
            extra_vars: Map::from_iter([("host".to_string(), json!("10.0.0.5"))]),
            debug_mode: DebugMode::Off,
            log_path: PathBuf::from("/pb/logs/playbook.log"),
            working_dir: PathBuf::from("/pb"),
        };
        assert_eq!(
            invocation.args(),
            vec![
                "/pb/kvm.yaml",
                "-i",
                "/pb/hosts",
                "--private-key",
                "/keys/id_rsa",
                "-e",
                r#"{"host":"10.0.0.5"}"#
            ]
        );

        invocation.debug_mode = DebugMode::Verbose;
        assert_eq!(invocation.args()[3], "-vvvv");
    }

    #[tokio::test]
    async fn test_run_playbook_invokes_runner() {
        let dir = tempfile::tempdir().unwrap();
        let expected_path = dir.path().join("kvm.yaml");
        let mut runner = MockPlaybookRunner::new();
        runner
            .expect_run()
            .with(predicate::function(move |inv: &PlaybookInvocation| {
                inv.playbook_path == expected_path && inv.extra_vars["host"] == json!("overridden")
            }))
            .times(1)
            .returning(|_| Ok(()));

        let facade = facade(dir.path(), runner);
        let result = facade
            .run_playbook(PlaybookRequest::new("10.0.0.5", "kvm.yaml", "/keys/id_rsa"))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_runner_failure_is_external_operation_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = MockPlaybookRunner::new();
        runner
            .expect_run()
            .returning(|_| Err(DeployError::Command("unreachable".to_string())));

        let facade = facade(dir.path(), runner);
        let (completion, receiver) = Completion::channel("run-kvm");
        facade
            .run_playbook_async(
                PlaybookRequest::new("10.0.0.5", "kvm.yaml", "/keys/id_rsa"),
                completion,
            )
            .unwrap();

        assert_eq!(
            receiver.wait().await,
            Err(CoreError::ExternalOperationFailure(
                "Command failed: unreachable".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn test_init_writes_runner_config() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let facade = facade(&root, MockPlaybookRunner::new());

        let outcome = facade.init().await.unwrap();
        assert!(outcome.is_none());

        let rendered = fs::read_to_string(root.join("runner.cfg")).unwrap();
        assert!(rendered.starts_with("[defaults]\nforks = 100\n"));
        assert!(root.join("hosts").exists());
        assert!(root.join("files").is_dir());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_init_restricts_private_key() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_rsa");
        fs::write(&key, "KEY").unwrap();
        fs::set_permissions(&key, fs::Permissions::from_mode(0o644)).unwrap();

        let mut config = DeployConfig::under_root(dir.path().join("root"));
        config.private_key = Some(key.clone());
        let facade = PlaybookFacade::new(
            config,
            SyncTaskScheduler::new(SchedulerConfig::default()).unwrap(),
            Arc::new(MockPlaybookRunner::new()),
        );
        facade.init().await.unwrap();

        let mode = fs::metadata(&key).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
