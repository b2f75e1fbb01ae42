use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use stratus_core::{
    config::StratusConfig,
    error::{StratusError, StratusResult},
    storage::{open_existing_database, VmRecordStore},
    types::NodeId,
    work_ledger::{Step, WorkLedger},
};

#[derive(Parser)]
#[command(name = "stratus")]
#[command(about = "Inspect the Stratus VM orchestration database", long_about = None)]
struct Cli {
    /// Configuration file (TOML); STRATUS_* variables apply when absent
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database file, overriding the configured path
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Print JSON instead of a table
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List VM records
    Vms,
    /// List work items
    Work {
        /// Only items owned by this management node
        #[arg(long)]
        owner: Option<u64>,

        /// Only items in this step
        #[arg(long, value_enum)]
        step: Option<StepFilter>,
    },
    /// Load and validate a configuration file
    CheckConfig {
        path: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StepFilter {
    Started,
    Done,
    Cancelled,
    Error,
}

impl From<StepFilter> for Step {
    fn from(filter: StepFilter) -> Self {
        match filter {
            StepFilter::Started => Step::Started,
            StepFilter::Done => Step::Done,
            StepFilter::Cancelled => Step::Cancelled,
            StepFilter::Error => Step::Error,
        }
    }
}

fn main() {
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(
        "stratus=info"
            .parse()
            .unwrap_or_else(|_| tracing_subscriber::filter::LevelFilter::INFO.into()),
    );
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> StratusResult<()> {
    match &cli.command {
        Commands::CheckConfig { path } => {
            let config = StratusConfig::from_file(path)?;
            println!("{} is valid (node {})", path.display(), config.node_id);
            if cli.json {
                println!("{}", to_json(&config)?);
            }
            Ok(())
        }
        Commands::Vms => {
            let config = load_config(&cli)?;
            let database = open_existing_database(&config.storage.database_path)?;
            let vms = VmRecordStore::new(database).list()?;

            if cli.json {
                println!("{}", to_json(&vms)?);
                return Ok(());
            }
            println!(
                "{:<8} {:<24} {:<10} {:<6} {:<6} {:>8}",
                "ID", "NAME", "STATE", "HOST", "LAST", "VERSION"
            );
            for vm in vms {
                println!(
                    "{:<8} {:<24} {:<10} {:<6} {:<6} {:>8}",
                    vm.id,
                    vm.name,
                    format!("{:?}", vm.state),
                    optional(vm.host_id),
                    optional(vm.last_host_id),
                    vm.update_count
                );
            }
            Ok(())
        }
        Commands::Work { owner, step } => {
            let config = load_config(&cli)?;
            let database = open_existing_database(&config.storage.database_path)?;
            let ledger = WorkLedger::new(database, NodeId(config.node_id), config.work.lock_wait);

            let step = step.map(Step::from);
            let items: Vec<_> = ledger
                .list()?
                .into_iter()
                .filter(|item| owner.map_or(true, |node| item.owner_node_id == NodeId(node)))
                .filter(|item| step.map_or(true, |step| item.step == step))
                .collect();

            if cli.json {
                println!("{}", to_json(&items)?);
                return Ok(());
            }
            println!(
                "{:<36} {:<8} {:<6} {:<20} {:<10} CREATED",
                "ID", "VM", "OWNER", "OPERATION", "STEP"
            );
            for item in items {
                println!(
                    "{:<36} {:<8} {:<6} {:<20} {:<10} {}",
                    item.id,
                    item.vm_id,
                    item.owner_node_id,
                    format!("{:?}", item.operation),
                    format!("{:?}", item.step),
                    item.created_at.to_rfc3339()
                );
            }
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> StratusResult<StratusConfig> {
    let mut config = match &cli.config {
        Some(path) => StratusConfig::from_file(path)?,
        None => {
            let mut config = StratusConfig::default();
            config.apply_env()?;
            config
        }
    };
    if let Some(database) = &cli.database {
        config.storage.database_path = database.clone();
    }
    tracing::debug!("Reading {}", config.storage.database_path.display());
    Ok(config)
}

fn optional<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> StratusResult<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| StratusError::runtime_fault(format!("Failed to encode JSON: {}", e)))
}
