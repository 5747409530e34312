//! `procflow` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`: check a process definition and print its execution order.
//! - `run`:      execute a process and print per-node results.
//! - `history`:  list recorded runs.
//! - `export`:   print a recorded run as JSON.
//! - `migrate`:  run pending database migrations.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use db::pool::{create_pool, run_migrations};
use db::repository::bindings::BindingConfigStore;
use db::{KeyValueStore, MemoryStore, SqliteStore};
use engine::binding::BindingStore;
use engine::export::{export_run, import_context, parse_input_pairs};
use engine::{
    validate_dag, EngineConfig, ExecutionRun, HistoryBackend, OutputBindingResolver, Process,
    ProcessExecutor, RunHistory, RunOutcome, RunStatus,
};
use nodes::domain::{DomainFixture, InMemoryDomain};
use nodes::{ExecutionContext, NodeRegistry, Services, WriteMode};

#[derive(Parser)]
#[command(name = "procflow", about = "Process flow execution engine", version)]
struct Cli {
    /// Engine configuration file (TOML).
    #[arg(long, global = true, env = "PROCFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite URL for run history; overrides the configured backend.
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a process definition JSON file.
    Validate {
        path: PathBuf,
    },
    /// Execute a process definition.
    Run {
        path: PathBuf,
        /// Initial variable, repeatable. Values parse as JSON, else string.
        #[arg(long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
        /// JSON object of initial variables (e.g. a previous export).
        #[arg(long)]
        input_file: Option<PathBuf>,
        /// Domain fixture (assets and records) to run against.
        #[arg(long)]
        domain: Option<PathBuf>,
        /// Write the sealed run as JSON.
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// List recorded runs, newest first.
    History {
        #[arg(long)]
        process: Option<String>,
    },
    /// Print a recorded run as JSON.
    Export {
        run_id: Uuid,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Run pending database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = load_config(cli.config.as_deref(), cli.database_url.clone())?;

    match cli.command {
        Command::Validate { path } => {
            let process = read_process(&path)?;
            match validate_dag(&process) {
                Ok(plan) => {
                    println!("Process '{}' is valid. Execution order: {:?}", process.id, plan.order());
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    eprintln!("Validation failed: {e}");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Command::Run {
            path,
            inputs,
            input_file,
            domain,
            export,
        } => {
            let process = read_process(&path)?;
            let context = build_inputs(input_file.as_deref(), &inputs)?;
            let domain = Arc::new(match domain {
                Some(path) => InMemoryDomain::from_fixture(read_json::<DomainFixture>(&path)?),
                None => InMemoryDomain::new(),
            });
            let store = open_store(&config).await?;

            let services = Services::new(domain.clone(), config.http_timeout());
            let executor = Arc::new(
                ProcessExecutor::new(NodeRegistry::builtin(&services), config)
                    .with_history(RunHistory::new(store.clone()))
                    .with_bindings(OutputBindingResolver::new(domain.clone(), domain))
                    .with_binding_store(BindingStore::new(BindingConfigStore::new(store))),
            );

            let handle = executor.start(Arc::new(process), context)?;
            let cancel = handle.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, cancelling run");
                    cancel.cancel();
                }
            });
            let outcome = handle.wait().await?;

            print_outcome(&outcome);
            if let Some(path) = export {
                std::fs::write(&path, export_run(&outcome.run)?)
                    .with_context(|| format!("cannot write {}", path.display()))?;
                info!(path = %path.display(), "run exported");
            }
            Ok(if outcome.run.status == RunStatus::Completed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::History { process } => {
            let history = RunHistory::new(open_persistent_store(&config).await?);
            let runs = history.list(process.as_deref()).await?;
            if runs.is_empty() {
                println!("No runs recorded.");
            }
            for run in &runs {
                println!(
                    "{}  {:<24} {:<10} {}  {} ms",
                    run.run_id,
                    run.process_id,
                    run.status,
                    run.started_at.to_rfc3339(),
                    run.duration_ms()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Export { run_id, output } => {
            let history = RunHistory::new(open_persistent_store(&config).await?);
            let run = history
                .get(run_id)
                .await
                .with_context(|| format!("run {run_id} not found"))?;
            let document = export_run(&run)?;
            match output {
                Some(path) => std::fs::write(&path, document)
                    .with_context(|| format!("cannot write {}", path.display()))?,
                None => println!("{document}"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Migrate => {
            let HistoryBackend::Sqlite { url } = &config.history else {
                bail!("migrate needs a SQLite history backend (--database-url or DATABASE_URL)");
            };
            info!("Running migrations against {url}");
            let pool = create_pool(url, 2).await.context("failed to connect to database")?;
            run_migrations(&pool).await.context("migration failed")?;
            info!("Migrations applied successfully");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>, database_url: Option<String>) -> anyhow::Result<EngineConfig> {
    let mut config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read config {}", path.display()))?;
            EngineConfig::from_toml_str(&text)
                .with_context(|| format!("invalid config {}", path.display()))?
        }
        None => EngineConfig::default(),
    };
    if let Some(url) = database_url {
        config.history = HistoryBackend::Sqlite { url };
    }
    Ok(config)
}

async fn open_store(config: &EngineConfig) -> anyhow::Result<Arc<dyn KeyValueStore>> {
    match &config.history {
        HistoryBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        HistoryBackend::Sqlite { url } => {
            let pool = create_pool(url, 5)
                .await
                .with_context(|| format!("failed to open history database {url}"))?;
            run_migrations(&pool).await.context("migration failed")?;
            Ok(Arc::new(SqliteStore::new(pool)))
        }
    }
}

/// History commands read what earlier invocations wrote, so memory won't do.
async fn open_persistent_store(config: &EngineConfig) -> anyhow::Result<Arc<dyn KeyValueStore>> {
    if config.history == HistoryBackend::Memory {
        bail!("run history is in memory only; pass --database-url or set DATABASE_URL");
    }
    open_store(config).await
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn read_process(path: &Path) -> anyhow::Result<Process> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    Process::from_json(&text).with_context(|| format!("invalid process definition {}", path.display()))
}

fn build_inputs(file: Option<&Path>, pairs: &[String]) -> anyhow::Result<ExecutionContext> {
    let mut context = match file {
        Some(path) => import_context(&read_json::<Value>(path)?)?,
        None => ExecutionContext::new(),
    };
    for (key, value) in parse_input_pairs(pairs.iter().map(String::as_str))? {
        context
            .set(&key, value, WriteMode::Replace)
            .with_context(|| format!("cannot set input '{key}'"))?;
    }
    Ok(context)
}

fn print_outcome(outcome: &RunOutcome) {
    let run: &ExecutionRun = &outcome.run;
    println!("Run {} of '{}': {}", run.run_id, run.process_id, run.status);
    for node in &run.nodes {
        match &node.error {
            Some(error) => println!("  {:<10} {} ({} ms): {error}", node.status, node.node_id, node.duration_ms),
            None => println!("  {:<10} {} ({} ms)", node.status, node.node_id, node.duration_ms),
        }
    }
    let report = &outcome.bindings;
    for applied in &report.applied {
        println!("  bound      {applied}");
    }
    for created in &report.created {
        println!("  created    {} {} \"{}\"", created.kind.as_str(), created.id, created.title);
    }
    for failure in &report.failures {
        println!("  unbound    {}: {}", failure.binding, failure.error);
    }
}
