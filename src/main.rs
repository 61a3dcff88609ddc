use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pezzottify_job_engine::config::{AppConfig, CliConfig, FileConfig};
use pezzottify_job_engine::legacy::LegacyJobImporter;
use pezzottify_job_engine::store::{JobStore, SqliteJobStore};
use pezzottify_job_engine::JobEngine;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod demo_jobs;

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    if path_buf.is_absolute() {
        return Ok(path_buf);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(path_buf))
}

#[derive(Parser, Debug)]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ")"))]
struct CliArgs {
    /// Path to the SQLite job database file.
    #[clap(long, value_parser = parse_path)]
    pub db_path: Option<PathBuf>,

    /// Path to a TOML config file. Its values override command line flags.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Number of general worker threads.
    #[clap(long)]
    pub worker_threads: Option<usize>,

    /// Path to a legacy job database to import on startup.
    #[clap(long, value_parser = parse_path)]
    pub legacy_db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Shows what is stored in the job database.
    Status,

    /// Brings stored job data up to the current version.
    Migrate,

    /// Imports jobs from the legacy database, then deletes it.
    ImportLegacy,

    /// Runs the engine until interrupted.
    Run {
        /// Number of echo jobs to submit on startup.
        #[clap(long, default_value_t = 0)]
        enqueue: usize,

        /// How many times each submitted echo job retries before succeeding.
        #[clap(long, default_value_t = 0)]
        fail_times: i32,

        /// Exit once no job is left instead of waiting for Ctrl-C.
        #[clap(long)]
        until_idle: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to install the tracing subscriber")?;

    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let cli_config = CliConfig {
        db_path: cli_args.db_path.clone(),
        worker_threads: cli_args.worker_threads,
        legacy_db_path: cli_args.legacy_db_path.clone(),
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    info!("Opening SQLite job database at {:?}...", config.db_path);
    let store = Arc::new(SqliteJobStore::new(&config.db_path)?);

    match cli_args.command {
        Command::Status => print_status(store.as_ref()),
        Command::Migrate => {
            let version = demo_jobs::job_migrator()?.migrate(store.as_ref())?;
            println!("Job data is at version {}", version);
            Ok(())
        }
        Command::ImportLegacy => {
            let Some(legacy) = &config.legacy_import else {
                anyhow::bail!("No legacy database configured, use --legacy-db-path");
            };
            let importer =
                LegacyJobImporter::new(&legacy.legacy_db_path, legacy.type_map.clone());
            let report = importer.import_into(store.as_ref())?;
            println!("{:#?}", report);
            Ok(())
        }
        Command::Run {
            enqueue,
            fail_times,
            until_idle,
        } => run(config, store, enqueue, fail_times, until_idle).await,
    }
}

fn print_status(store: &dyn JobStore) -> Result<()> {
    let specs = store.get_all_job_specs()?;
    let dependencies = store.get_all_dependency_specs()?;

    println!("Job data version: {:?}", store.schema_version()?);
    println!("Jobs: {}", specs.len());
    println!("Dependencies: {}", dependencies.len());

    let mut per_queue: BTreeMap<&str, usize> = BTreeMap::new();
    for spec in &specs {
        *per_queue
            .entry(spec.queue_key.as_deref().unwrap_or("<none>"))
            .or_default() += 1;
    }
    for (queue, count) in per_queue {
        println!("  queue {}: {}", queue, count);
    }
    for spec in specs.iter().filter(|s| s.is_running) {
        warn!("Job {} is still flagged as running", spec.id);
    }
    Ok(())
}

async fn run(
    config: AppConfig,
    store: Arc<SqliteJobStore>,
    enqueue: usize,
    fail_times: i32,
    until_idle: bool,
) -> Result<()> {
    let mut builder = JobEngine::builder(store)
        .job_registry(demo_jobs::job_registry())
        .migrator(demo_jobs::job_migrator()?)
        .worker_threads(config.worker_threads)
        .backoff(config.retry.backoff_policy())
        .tracker_retention(config.tracker_retention);
    if let Some(legacy) = &config.legacy_import {
        builder = builder.legacy_importer(LegacyJobImporter::new(
            &legacy.legacy_db_path,
            legacy.type_map.clone(),
        ));
    }
    let engine = Arc::new(builder.start()?);

    let mut changes = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(change) = changes.recv().await {
            info!("Job {} ({}) -> {}", change.job_id, change.factory_key, change.state);
        }
    });

    for i in 0..enqueue {
        let job = demo_jobs::EchoJob::new(format!("echo #{}", i + 1), fail_times);
        engine.add(Box::new(job))?;
    }
    info!("{}", engine.debug_info());

    if until_idle {
        while !engine.find(|_| true).is_empty() {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    } else {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
    }

    info!("Shutting down job engine...");
    let shutdown_engine = engine.clone();
    tokio::task::spawn_blocking(move || shutdown_engine.shutdown()).await?;
    Ok(())
}
