use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use stratus_core::{CoreError, FlowChain};
use stratus_scheduler::{SyncTask, SyncTaskScheduler, TaskSpec};
use tracing::info;

use crate::config::DeployConfig;
use crate::error::{DeployError, DeployResult};
use crate::fingerprint::DeployDecision;
use crate::registry::ModuleRegistry;
use crate::steps::{
    evaluate, CheckFingerprint, DeployPlan, LinkPlaybook, PrepareDirs, RecordFingerprint,
    StageModule, DECISION_KEY,
};

/// Scheduler signature owning module `name`
pub fn module_signature(name: &str) -> String {
    format!("deploy-module-{}", name)
}

/// Result of a [`ModuleDeployer::deploy_module`] call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployOutcome {
    /// Module name
    pub module: String,
    /// Why the module was or was not deployed
    pub decision: DeployDecision,
}

impl DeployOutcome {
    /// Whether files were copied
    pub fn deployed(&self) -> bool {
        self.decision.is_needed()
    }
}

/// Deploys module directories, skipping modules whose content is unchanged.
///
/// Every operation on a module runs under the scheduler signature
/// `deploy-module-<name>`, so concurrent requests for one module serialize
/// while different modules deploy in parallel.
#[derive(Clone)]
pub struct ModuleDeployer {
    config: Arc<DeployConfig>,
    registry: Arc<ModuleRegistry>,
    scheduler: SyncTaskScheduler,
}

impl ModuleDeployer {
    /// Create a deployer
    pub fn new(
        config: Arc<DeployConfig>,
        registry: Arc<ModuleRegistry>,
        scheduler: SyncTaskScheduler,
    ) -> Self {
        Self {
            config,
            registry,
            scheduler,
        }
    }

    /// Registry holding per-module deployment state
    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    /// Deploy the module at `module_path` and link `playbook` into the root
    /// directory. Does nothing if the deployed copy is up to date.
    pub async fn deploy_module(
        &self,
        module_path: &Path,
        playbook: &str,
    ) -> DeployResult<DeployOutcome> {
        let (module, source) = resolve_module(module_path)?;
        info!(module = %module, source = %source.display(), playbook = %playbook, "Deploying module");

        let task = DeployModuleTask {
            signature: module_signature(&module),
            plan: Arc::new(DeployPlan {
                module,
                source,
                playbook: playbook.to_string(),
                config: self.config.clone(),
                registry: self.registry.clone(),
            }),
        };
        Ok(self.scheduler.submit(task).await?)
    }

    /// Compare a previously deployed module with its source
    pub async fn check_module(&self, name: &str) -> DeployResult<DeployDecision> {
        let source = self
            .registry
            .source(name)
            .ok_or_else(|| DeployError::UnknownModule(name.to_string()))?;
        self.check_source(name.to_string(), source).await
    }

    /// Compare the module at `module_path` with its deployed copy
    pub async fn check_path(&self, module_path: &Path) -> DeployResult<DeployDecision> {
        let (module, source) = resolve_module(module_path)?;
        self.check_source(module, source).await
    }

    /// Whether a previously deployed module's source changed since
    pub async fn is_deploy_needed(&self, name: &str) -> DeployResult<bool> {
        Ok(self.check_module(name).await?.is_needed())
    }

    /// Whether the module behind `playbook` was deployed since the last
    /// call. Reading clears the flag, so it waits for any deployment of the
    /// module in progress.
    pub async fn is_module_changed(&self, playbook: &str) -> DeployResult<bool> {
        let module = playbook.strip_suffix(".yaml").unwrap_or(playbook).to_string();
        if !self.registry.contains(&module) {
            return Err(DeployError::UnknownModule(module));
        }
        let registry = self.registry.clone();
        let task = TaskSpec::new(module_signature(&module))
            .name(format!("consume-changed-{}", module))
            .body(async move { Ok(registry.consume_changed_flag(&module)) });
        Ok(self.scheduler.submit(task).await?)
    }

    async fn check_source(
        &self,
        module: String,
        source: std::path::PathBuf,
    ) -> DeployResult<DeployDecision> {
        let registry = self.registry.clone();
        let config = self.config.clone();
        let task = TaskSpec::new(module_signature(&module))
            .name(format!("check-module-{}", module))
            .body(async move {
                evaluate(&registry, &config, &module, &source)
                    .map(|(decision, _)| decision)
                    .map_err(CoreError::from)
            });
        Ok(self.scheduler.submit(task).await?)
    }
}

fn resolve_module(module_path: &Path) -> DeployResult<(String, std::path::PathBuf)> {
    if !module_path.is_dir() {
        return Err(DeployError::ModuleNotFound(module_path.to_path_buf()));
    }
    let source = fs::canonicalize(module_path)?;
    let module = source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| DeployError::ModuleNotFound(module_path.to_path_buf()))?;
    Ok((module, source))
}

struct DeployModuleTask {
    signature: String,
    plan: Arc<DeployPlan>,
}

#[async_trait]
impl SyncTask for DeployModuleTask {
    type Output = DeployOutcome;

    fn sync_signature(&self) -> &str {
        &self.signature
    }

    async fn call(self) -> Result<DeployOutcome, CoreError> {
        let plan = self.plan;
        plan.registry.register_source(&plan.module, &plan.source);
        let data = FlowChain::new(self.signature)
            .then(PrepareDirs(plan.clone()))
            .then(CheckFingerprint(plan.clone()))
            .then(StageModule(plan.clone()))
            .then(LinkPlaybook(plan.clone()))
            .then(RecordFingerprint(plan.clone()))
            .start()
            .await?;

        let decision: DeployDecision = data
            .get(DECISION_KEY)?
            .ok_or_else(|| CoreError::Other("deploy decision missing from context".to_string()))?;
        Ok(DeployOutcome {
            module: plan.module.clone(),
            decision,
        })
    }
}
