//! # ComplyFlow — scheduled compliance workflows
//!
//! Usage:
//!   complyflow run                       # Start the scheduler (Ctrl-C stops)
//!   complyflow health                    # One-shot health report as JSON
//!   complyflow tasks                     # List persisted tasks
//!   complyflow check-config              # Validate the config file
//!   complyflow --config ./cf.toml run    # Custom config

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use complyflow_core::config::{ComplyConfig, expand_path};
use complyflow_graph::catalog::{default_registry, notifiers_from_config};
use complyflow_scheduler::lanes::Lanes;
use complyflow_scheduler::{HealthReport, ScheduledTask, TaskDb, TaskScheduler};
use complyflow_store::create_state_store;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "complyflow",
    version,
    about = "🛡️ ComplyFlow — persistent compliance-workflow orchestrator"
)]
struct Cli {
    /// Config file (default: ~/.complyflow/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the scheduler and run until Ctrl-C
    Run,
    /// Print a health report as JSON
    Health,
    /// List persisted tasks
    Tasks,
    /// Validate the configuration and the built-in graphs
    CheckConfig,
}

fn load_config(path: Option<&PathBuf>) -> Result<ComplyConfig> {
    let config = match path {
        Some(path) => ComplyConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ComplyConfig::load()?,
    };
    Ok(config)
}

fn init_logging(config: &ComplyConfig, verbose: bool) {
    let level = if verbose { "debug" } else { config.logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if config.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    }
}

fn open_task_db(config: &ComplyConfig) -> Result<Arc<TaskDb>> {
    let path = expand_path(&config.scheduler.tasks_db);
    let db = TaskDb::open(&path).with_context(|| format!("opening task database {}", path.display()))?;
    Ok(Arc::new(db))
}

async fn run(config: ComplyConfig) -> Result<()> {
    let store = create_state_store(&config.store)?;
    let graphs = default_registry(&config)?;
    tracing::info!("🧩 Graphs: {}", graphs.names().join(", "));

    let scheduler = TaskScheduler::builder(&config, store, graphs)
        .task_db(open_task_db(&config)?)
        .notifiers(notifiers_from_config(&config))
        .build()?;

    for task_config in &config.tasks {
        if scheduler.contains(&task_config.id) {
            tracing::debug!(task_id = %task_config.id, "Task already registered, keeping persisted state");
            continue;
        }
        let task = ScheduledTask::from_config(task_config)
            .with_context(|| format!("invalid task '{}'", task_config.id))?;
        scheduler
            .register_task(task)
            .with_context(|| format!("registering task '{}'", task_config.id))?;
    }

    scheduler.start();
    tokio::signal::ctrl_c().await?;
    tracing::info!("👋 Shutting down...");
    scheduler.stop().await;
    Ok(())
}

async fn health(config: &ComplyConfig) -> Result<()> {
    let store = create_state_store(&config.store)?;
    let tasks = open_task_db(config)?.load_tasks()?;
    let lanes = Lanes::new().stats(tasks.iter());
    let report = HealthReport::collect(&tasks, store.as_ref(), lanes, 0, chrono::Utc::now()).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn list_tasks(config: &ComplyConfig) -> Result<()> {
    let tasks = open_task_db(config)?.load_tasks()?;
    if tasks.is_empty() {
        println!("No tasks registered.");
        return Ok(());
    }
    println!(
        "{:<24} {:<10} {:<10} {:<18} {:<26} {:>5} {:>5}",
        "TASK", "PRIORITY", "STATUS", "SCHEDULE", "NEXT RUN", "RUNS", "FAILS"
    );
    for t in tasks {
        let next = t
            .next_run
            .map(|n| n.to_rfc3339())
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<24} {:<10} {:<10} {:<18} {:<26} {:>5} {:>5}",
            t.task_id,
            t.priority.as_str(),
            t.status.as_str(),
            t.schedule.to_string(),
            next,
            t.run_count,
            t.failure_count
        );
        if let Some(err) = &t.last_error {
            println!("    last error ({}): {}", err.class, err.message);
        }
    }
    Ok(())
}

fn check_config(config: &ComplyConfig) -> Result<()> {
    let graphs = default_registry(config)?;
    for task_config in &config.tasks {
        let task = ScheduledTask::from_config(task_config)
            .with_context(|| format!("invalid task '{}'", task_config.id))?;
        anyhow::ensure!(
            graphs.contains(&task.graph),
            "task '{}' targets unknown graph '{}'",
            task.task_id,
            task.graph
        );
    }
    println!(
        "✅ Config OK: {} task(s), {} integration(s), graphs: {}",
        config.tasks.len(),
        config.integrations.len(),
        graphs.names().join(", ")
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_logging(&config, cli.verbose);

    match cli.command {
        Command::Run => run(config).await,
        Command::Health => health(&config).await,
        Command::Tasks => list_tasks(&config),
        Command::CheckConfig => check_config(&config),
    }
}
