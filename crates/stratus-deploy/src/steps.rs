//! Flow steps of a module deployment.
//!
//! The chain is `prepare-dirs -> check-fingerprint -> stage-module ->
//! link-playbook -> record-fingerprint`. Steps after the check do nothing
//! when the module is up to date.

use async_trait::async_trait;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stratus_core::{CoreError, Flow, FlowContext, FlowTrigger};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DeployConfig;
use crate::error::{DeployError, DeployResult};
use crate::fingerprint::{DeployDecision, FingerprintSet};
use crate::registry::ModuleRegistry;

pub(crate) const DECISION_KEY: &str = "decision";
const FINGERPRINTS_KEY: &str = "fingerprints";
const BACKUP_KEY: &str = "backup";
const LINK_REPLACED_KEY: &str = "link_replaced";

/// Everything one deployment needs, shared by its steps
#[derive(Debug)]
pub(crate) struct DeployPlan {
    pub module: String,
    pub source: PathBuf,
    pub playbook: String,
    pub config: Arc<DeployConfig>,
    pub registry: Arc<ModuleRegistry>,
}

impl DeployPlan {
    fn dest(&self) -> PathBuf {
        self.config.module_dest(&self.module)
    }

    fn link(&self) -> PathBuf {
        self.config.playbook_path(&self.playbook)
    }
}

/// Compare `source` with what is deployed for `module`.
///
/// The registry's record of the last deployment is authoritative; without
/// one, the destination directory is scanned.
pub(crate) fn evaluate(
    registry: &ModuleRegistry,
    config: &DeployConfig,
    module: &str,
    source: &Path,
) -> DeployResult<(DeployDecision, FingerprintSet)> {
    let current = FingerprintSet::scan(source)?;
    let dest = config.module_dest(module);
    let deployed = if dest.is_dir() {
        match registry.recorded(module) {
            Some(recorded) => Some(recorded),
            None => Some(FingerprintSet::scan(&dest)?),
        }
    } else {
        None
    };
    Ok((current.diff(deployed.as_ref()), current))
}

fn deployment_needed(data: &FlowContext) -> DeployResult<bool> {
    let decision: DeployDecision = data.get(DECISION_KEY)?.ok_or_else(|| {
        DeployError::Core(CoreError::Other("deploy decision missing from context".to_string()))
    })?;
    Ok(decision.is_needed())
}

fn advance(trigger: FlowTrigger, result: DeployResult<()>) {
    let _ = match result {
        Ok(()) => trigger.next(),
        Err(e) => trigger.fail(e.into()),
    };
}

fn compensate(trigger: FlowTrigger, result: DeployResult<()>) {
    let _ = match result {
        Ok(()) => trigger.rollback(),
        Err(e) => trigger.rollback_with_error(e.into()),
    };
}

pub(crate) struct PrepareDirs(pub Arc<DeployPlan>);

#[async_trait]
impl Flow for PrepareDirs {
    fn name(&self) -> &str {
        "prepare-dirs"
    }

    async fn run(&self, trigger: FlowTrigger, _data: &mut FlowContext) {
        let config = &self.0.config;
        let result = fs::create_dir_all(&config.root_dir)
            .and_then(|_| fs::create_dir_all(&config.files_dir))
            .map_err(DeployError::from);
        advance(trigger, result);
    }
}

pub(crate) struct CheckFingerprint(pub Arc<DeployPlan>);

impl CheckFingerprint {
    fn check(&self, data: &mut FlowContext) -> DeployResult<()> {
        let plan = &self.0;
        let (decision, current) = evaluate(&plan.registry, &plan.config, &plan.module, &plan.source)?;
        if decision.is_needed() {
            debug!(module = %plan.module, reason = %decision, "Module needs deployment");
        } else {
            debug!(module = %plan.module, "No file changed in module, no need to deploy");
        }
        data.put(DECISION_KEY, &decision)?;
        data.put(FINGERPRINTS_KEY, &current)?;
        Ok(())
    }
}

#[async_trait]
impl Flow for CheckFingerprint {
    fn name(&self) -> &str {
        "check-fingerprint"
    }

    async fn run(&self, trigger: FlowTrigger, data: &mut FlowContext) {
        advance(trigger, self.check(data));
    }
}

/// Copies the module into place, keeping the previous copy aside until the
/// deployment is recorded
pub(crate) struct StageModule(pub Arc<DeployPlan>);

impl StageModule {
    fn stage(&self, data: &mut FlowContext) -> DeployResult<()> {
        if !deployment_needed(data)? {
            return Ok(());
        }
        let plan = &self.0;
        let dest = plan.dest();

        let backup = if dest.exists() {
            let backup = plan
                .config
                .files_dir
                .join(format!(".{}.backup-{}", plan.module, Uuid::new_v4()));
            fs::rename(&dest, &backup)?;
            data.put(BACKUP_KEY, &backup)?;
            Some(backup)
        } else {
            None
        };

        if let Err(e) = copy_dir(&plan.source, &dest) {
            // This step never advanced, so it will not be rolled back
            restore(&dest, backup.as_deref())?;
            return Err(e.into());
        }
        debug!(module = %plan.module, dest = %dest.display(), "Staged module");
        Ok(())
    }

    fn unstage(&self, data: &mut FlowContext) -> DeployResult<()> {
        if !deployment_needed(data)? {
            return Ok(());
        }
        let backup: Option<PathBuf> = data.get(BACKUP_KEY)?;
        restore(&self.0.dest(), backup.as_deref())?;
        info!(module = %self.0.module, "Restored previous module copy");
        Ok(())
    }
}

#[async_trait]
impl Flow for StageModule {
    fn name(&self) -> &str {
        "stage-module"
    }

    async fn run(&self, trigger: FlowTrigger, data: &mut FlowContext) {
        advance(trigger, self.stage(data));
    }

    async fn rollback(&self, trigger: FlowTrigger, data: &mut FlowContext) {
        compensate(trigger, self.unstage(data));
    }
}

/// Links the module's playbook into the root directory
pub(crate) struct LinkPlaybook(pub Arc<DeployPlan>);

impl LinkPlaybook {
    fn link(&self, data: &mut FlowContext) -> DeployResult<()> {
        if !deployment_needed(data)? {
            return Ok(());
        }
        let plan = &self.0;
        let dest = plan.dest();
        let target = dest.join(&plan.playbook);
        if !target.is_file() {
            return Err(DeployError::PlaybookNotFound {
                playbook: plan.playbook.clone(),
                module: plan.module.clone(),
                files: top_level_files(&dest)?,
            });
        }

        let link = plan.link();
        let replaced = link.symlink_metadata().is_ok();
        if replaced {
            fs::remove_file(&link)?;
        }
        link_file(&target, &link)?;
        data.put(LINK_REPLACED_KEY, replaced)?;
        debug!(playbook = %plan.playbook, link = %link.display(), "Linked playbook");
        Ok(())
    }

    fn unlink(&self, data: &mut FlowContext) -> DeployResult<()> {
        if !deployment_needed(data)? {
            return Ok(());
        }
        // A replaced link pointed at the same path, which staging rollback restores
        if data.get::<bool>(LINK_REPLACED_KEY)?.unwrap_or(false) {
            return Ok(());
        }
        match fs::remove_file(self.0.link()) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Flow for LinkPlaybook {
    fn name(&self) -> &str {
        "link-playbook"
    }

    async fn run(&self, trigger: FlowTrigger, data: &mut FlowContext) {
        advance(trigger, self.link(data));
    }

    async fn rollback(&self, trigger: FlowTrigger, data: &mut FlowContext) {
        compensate(trigger, self.unlink(data));
    }
}

pub(crate) struct RecordFingerprint(pub Arc<DeployPlan>);

impl RecordFingerprint {
    fn record(&self, data: &mut FlowContext) -> DeployResult<()> {
        if !deployment_needed(data)? {
            return Ok(());
        }
        let plan = &self.0;
        let fingerprints: FingerprintSet = data.get(FINGERPRINTS_KEY)?.unwrap_or_default();
        plan.registry.record_deployed(&plan.module, fingerprints);

        if let Some(backup) = data.get::<PathBuf>(BACKUP_KEY)? {
            if let Err(e) = fs::remove_dir_all(&backup) {
                warn!(backup = %backup.display(), error = %e, "Failed to remove module backup");
            }
        }
        info!(module = %plan.module, source = %plan.source.display(), "Successfully deployed module");
        Ok(())
    }
}

#[async_trait]
impl Flow for RecordFingerprint {
    fn name(&self) -> &str {
        "record-fingerprint"
    }

    async fn run(&self, trigger: FlowTrigger, data: &mut FlowContext) {
        advance(trigger, self.record(data));
    }
}

/// Put `backup` back at `dest`, discarding whatever is there now
fn restore(dest: &Path, backup: Option<&Path>) -> io::Result<()> {
    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    if let Some(backup) = backup {
        fs::rename(backup, dest)?;
    }
    Ok(())
}

fn copy_dir(source: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if from.is_dir() {
            copy_dir(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

fn top_level_files(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

#[cfg(unix)]
fn link_file(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn link_file(target: &Path, link: &Path) -> io::Result<()> {
    fs::copy(target, link).map(|_| ())
}
