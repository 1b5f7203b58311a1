//! Arguments and command dispatch for the `stratus` binary.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use stratus_monitoring::{init_logging, LogExt, MonitoringConfig};
use stratus_scheduler::{SchedulerConfig, SyncTaskScheduler};
use tracing::info;

use crate::{CommandPlaybookRunner, DeployConfig, PlaybookFacade, PlaybookRequest};

/// Stratus - module deployment and playbook runs
#[derive(Debug, Parser)]
#[command(name = "stratus")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Deployment configuration file; environment variables are used if absent
    #[arg(long, short = 'c', env = "STRATUS_DEPLOY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the playbook root directory
    #[arg(long)]
    pub root_dir: Option<PathBuf>,

    /// Emit JSON logs
    #[arg(long)]
    pub json_logs: bool,

    /// Deployment property as key=value; `deploy.var.<name>` adds a playbook
    /// variable and `deploy.cfg.<name>` a runner setting. May be repeated
    #[arg(short = 'p', long = "property", value_parser = parse_key_val)]
    pub properties: Vec<(String, String)>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Deploy a module directory and link one of its playbooks
    Deploy {
        /// Module directory
        module_dir: PathBuf,
        /// Playbook file inside the module
        playbook: String,
    },
    /// Report whether a module directory differs from its deployed copy
    Check {
        /// Module directory
        module_dir: PathBuf,
    },
    /// Run a deployed playbook against a host
    Run {
        /// Target host address
        host: String,
        /// Playbook file name
        playbook: String,
        /// Private key used to reach the host
        #[arg(long)]
        key: PathBuf,
        /// Extra argument as key=value; may be repeated
        #[arg(short = 'e', long = "extra", value_parser = parse_key_val)]
        extra: Vec<(String, String)>,
    },
    /// Write runner configuration and deploy the library module
    Init,
}

/// Parse a `key=value` pair
pub fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("invalid key=value pair: '{}'", s)),
    }
}

impl Cli {
    /// Effective deployment configuration
    pub fn deploy_config(&self) -> Result<DeployConfig> {
        let mut config = match &self.config {
            Some(path) => DeployConfig::from_file(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
            None => DeployConfig::load().context("Failed to load configuration from environment")?,
        };
        if let Some(root) = &self.root_dir {
            config = config.rebased(root);
        }
        config.apply_properties(&self.properties.iter().cloned().collect::<HashMap<_, _>>());
        Ok(config)
    }
}

/// Run the parsed command
pub async fn execute(cli: Cli) -> Result<()> {
    let mut monitoring = MonitoringConfig::for_service("stratus").with_env_overrides();
    monitoring.enable_json_logging |= cli.json_logs;
    init_logging(&monitoring)?;

    let config = cli.deploy_config()?;
    let scheduler = SyncTaskScheduler::new(SchedulerConfig::from_env())
        .context("Failed to create scheduler")?;
    let facade = PlaybookFacade::new(config, scheduler.clone(), Arc::new(CommandPlaybookRunner));

    let result = dispatch(&facade, cli.command).await;
    scheduler.shutdown().await;
    result
}

async fn dispatch(facade: &PlaybookFacade, command: Commands) -> Result<()> {
    match command {
        Commands::Deploy {
            module_dir,
            playbook,
        } => {
            let outcome = facade
                .deployer()
                .deploy_module(&module_dir, &playbook)
                .await
                .log_err("Module deployment failed")
                .with_context(|| format!("Unable to deploy module from {}", module_dir.display()))?;
            if outcome.deployed() {
                println!("deployed {}: {}", outcome.module, outcome.decision);
            } else {
                println!("{} is up to date", outcome.module);
            }
        }
        Commands::Check { module_dir } => {
            let decision = facade
                .deployer()
                .check_path(&module_dir)
                .await
                .with_context(|| format!("Unable to check module {}", module_dir.display()))?;
            println!(
                "{}: {}",
                if decision.is_needed() { "deploy needed" } else { "up to date" },
                decision
            );
        }
        Commands::Run {
            host,
            playbook,
            key,
            extra,
        } => {
            if !key.is_file() {
                bail!("Private key {} does not exist", key.display());
            }
            let mut request = PlaybookRequest::new(host, playbook, key);
            for (name, value) in extra {
                request = request.argument(name, value);
            }
            info!(host = %request.host, playbook = %request.playbook, "Running playbook");
            facade
                .run_playbook(request)
                .await
                .log_err("Playbook run failed")
                .log_ok("Playbook run finished")
                .context("Playbook run failed")?;
        }
        Commands::Init => {
            match facade.init().await.context("Initialization failed")? {
                Some(outcome) => println!("initialized; library module: {}", outcome.decision),
                None => println!("initialized"),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("repo=local=1"),
            Ok(("repo".to_string(), "local=1".to_string()))
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from([
            "stratus", "run", "10.0.0.5", "kvm.yaml", "--key", "/keys/id_rsa", "-e", "a=1", "-e",
            "b=2",
        ])
        .unwrap();

        match cli.command {
            Commands::Run { host, extra, key, .. } => {
                assert_eq!(host, "10.0.0.5");
                assert_eq!(key, PathBuf::from("/keys/id_rsa"));
                assert_eq!(
                    extra,
                    vec![
                        ("a".to_string(), "1".to_string()),
                        ("b".to_string(), "2".to_string())
                    ]
                );
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_root_dir_override() {
        let cli = Cli::try_parse_from(["stratus", "--root-dir", "/srv/pb", "check", "/tmp/kvm"])
            .unwrap();
        let config = cli.deploy_config().unwrap();
        assert_eq!(config.files_dir, PathBuf::from("/srv/pb/files"));
    }

    #[test]
    fn test_properties_reach_config() {
        let cli = Cli::try_parse_from([
            "stratus",
            "--root-dir",
            "/srv/pb",
            "-p",
            "deploy.var.yum_repo=local",
            "--property",
            "deploy.cfg.host_key_checking=False",
            "-p",
            "unrelated=1",
            "init",
        ])
        .unwrap();

        let config = cli.deploy_config().unwrap();
        assert_eq!(config.variables.get("yum_repo"), Some(&"local".to_string()));
        assert_eq!(
            config.runner_settings.get("host_key_checking"),
            Some(&"False".to_string())
        );
        assert!(config
            .render_runner_config()
            .ends_with("host_key_checking = False\n"));
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
