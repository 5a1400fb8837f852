//! homelab-dr - Main entry point
//!
//! Backup and restore of a k3s homelab's control-plane state, CNPG databases
//! and PVC data.

use anyhow::{Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};
use homelab_dr::cluster::Kubectl;
use homelab_dr::collector::{runs, BackupCollector};
use homelab_dr::manifest::read_manifest;
use homelab_dr::restore::{Prompter, RestoreExecutor, RestorePlan, Scope, TerminalPrompter};
use homelab_dr::transfer::ClusterTransport;
use homelab_dr::{utils, Config, DrError};
use std::path::PathBuf;
use std::process::ExitCode;

/// Exit status after SIGINT, SIGTERM or Ctrl+C at a prompt.
const INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up every declared resource into a new run directory
    Backup,

    /// Restore from a run directory
    Restore(RestoreArgs),

    /// List run directories under the storage base directory
    List,
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("scope").args(["k3s", "databases", "pvcs", "all"])))]
struct RestoreArgs {
    /// Run directory holding manifest.json and its archives
    backup_dir: PathBuf,

    /// Restore the k3s control-plane state
    #[arg(long)]
    k3s: bool,

    /// Restore every CNPG database
    #[arg(long)]
    databases: bool,

    /// Restore every PVC volume
    #[arg(long)]
    pvcs: bool,

    /// Restore everything, cluster state first
    #[arg(long)]
    all: bool,

    /// Print the plan and exit without prompting or touching anything
    #[arg(long)]
    dry_run: bool,
}

impl RestoreArgs {
    fn scope(&self) -> Option<Scope> {
        if self.k3s {
            Some(Scope::ClusterState)
        } else if self.databases {
            Some(Scope::Databases)
        } else if self.pvcs {
            Some(Scope::Volumes)
        } else if self.all {
            Some(Scope::All)
        } else {
            None
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: failed to load configuration: {e:#}");
            return ExitCode::from(1);
        }
    };

    let log_level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    if let Err(e) = utils::logger::init(log_level) {
        eprintln!("Error: failed to initialize logging: {e:#}");
        return ExitCode::from(1);
    }

    tracing::info!("Starting homelab-dr v{}", env!("CARGO_PKG_VERSION"));

    // Prompts block their thread, so the pipeline runs as its own task and a
    // signal can still end the process mid-prompt.
    let mut pipeline = tokio::spawn(run(cli.command, config));

    tokio::select! {
        joined = &mut pipeline => finish(joined),
        signal = utils::shutdown::wait_for_signal() => match signal {
            Ok(name) => {
                tracing::warn!(
                    "Received {}, stopping; the current action is not rolled back",
                    name
                );
                std::process::exit(INTERRUPTED.into());
            }
            Err(e) => {
                tracing::warn!("Failed to install signal handlers: {}", e);
                finish(pipeline.await)
            }
        },
    }
}

fn finish(joined: std::result::Result<Result<u8>, tokio::task::JoinError>) -> ExitCode {
    match joined {
        Ok(Ok(code)) => ExitCode::from(code),
        Ok(Err(e)) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {e:#}");
            ExitCode::from(1)
        }
        Err(e) => {
            tracing::error!("Run task failed: {}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(command: Command, config: Config) -> Result<u8> {
    let cluster = Kubectl::new(config.kubectl.clone());
    let transport = ClusterTransport::new(config.kubectl.clone(), config.ssh.clone());

    match command {
        Command::Backup => backup(&config, &transport, &cluster).await,
        Command::Restore(args) => restore(&config, &transport, &cluster, &args).await,
        Command::List => list(&config),
    }
}

async fn backup(config: &Config, transport: &ClusterTransport, cluster: &Kubectl) -> Result<u8> {
    let report = BackupCollector::new(config, transport, cluster)
        .run()
        .await
        .context("backup run failed")?;

    println!("Backup written to {}", report.run_dir.display());
    if let Some(pruned) = &report.pruned {
        if !pruned.removed.is_empty() {
            println!("Removed {} expired backup(s)", pruned.removed.len());
        }
        for (path, error) in &pruned.failures {
            println!("Warning: could not remove {}: {error}", path.display());
        }
    }
    println!("{}", report.result);
    Ok(report.result.exit_code())
}

async fn restore(
    config: &Config,
    transport: &ClusterTransport,
    cluster: &Kubectl,
    args: &RestoreArgs,
) -> Result<u8> {
    let manifest = read_manifest(&args.backup_dir)
        .with_context(|| format!("cannot restore from {}", args.backup_dir.display()))?;

    let prompter = TerminalPrompter;
    let scope = match (args.scope(), args.dry_run) {
        (Some(scope), _) => scope,
        (None, true) => Scope::All,
        (None, false) => match prompter.choose_scope() {
            Ok(Some(scope)) => scope,
            Ok(None) => {
                println!("Restore cancelled");
                return Ok(0);
            }
            Err(DrError::Interrupted) => {
                println!("Restore interrupted");
                return Ok(INTERRUPTED);
            }
            Err(e) => return Err(e.into()),
        },
    };

    let plan = RestorePlan::build(
        &manifest,
        &args.backup_dir,
        scope,
        config.control_plane.host.as_deref(),
    );
    if plan.is_empty() {
        println!("Nothing to restore for {scope}");
        return Ok(0);
    }

    if args.dry_run {
        println!("Restore plan for {} ({scope}):", args.backup_dir.display());
        for (i, action) in plan.actions.iter().enumerate() {
            println!("  {}. {action}", i + 1);
            println!("     {}", action.describe());
        }
        return Ok(0);
    }

    if plan.needs_kubectl() {
        config.kubectl.ensure_available()?;
    }

    let outcome = RestoreExecutor::new(config, transport, cluster, &prompter)
        .execute(&plan)
        .await;

    for record in &outcome.records {
        println!(
            "{:<10} {:<40} {}",
            record.kind.to_string(),
            record.id,
            record.state()
        );
    }
    println!("{}", outcome.result);
    if outcome.interrupted {
        println!("Restore interrupted; remaining actions were not attempted");
        return Ok(INTERRUPTED);
    }
    Ok(outcome.result.exit_code())
}

fn list(config: &Config) -> Result<u8> {
    let base = &config.storage.base_dir;
    let runs = runs::list_runs(base).with_context(|| format!("cannot list {}", base.display()))?;

    if runs.is_empty() {
        println!("No backups under {}", base.display());
        return Ok(0);
    }

    for run in &runs {
        match &run.manifest {
            Ok(m) => println!(
                "{}  k3s-state: {:<3}  databases: {:<3}  volumes: {}",
                run.name,
                if m.k3s_state.is_some() { "yes" } else { "no" },
                m.cnpg_databases.len(),
                m.pvc_volumes.len()
            ),
            Err(e) => println!("{}  unreadable manifest: {e}", run.name),
        }
    }
    Ok(0)
}
