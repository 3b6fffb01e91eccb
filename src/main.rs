//! # Course Harness CLI (`coursectl`)
//!
//! The `coursectl` binary drives the bulk enrichment and migration
//! pipeline: importing course data, enriching questions, running
//! migration plans, managing backups, and checking health.
//!
//! ## Usage
//!
//! ```bash
//! coursectl --config ./config/courses.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `coursectl init` | Create the SQLite database and schema |
//! | `coursectl import <file>` | Import courses and questions from JSON |
//! | `coursectl enhance` | Enrich questions through the enrichment service |
//! | `coursectl migrate list\|scope\|run` | Inspect and run migration plans |
//! | `coursectl backup create\|list\|export\|restore` | Manage backups |
//! | `coursectl health` | Run health probes |
//! | `coursectl integrity` | Full data-integrity report |
//! | `coursectl serve` | Start the HTTP trigger server |
//!
//! ## Examples
//!
//! ```bash
//! coursectl init
//! coursectl import ./data/courses.json
//! coursectl migrate run course-category
//! coursectl enhance --collection rust-101 --progress json
//! coursectl backup restore 5f0c...
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use course_harness::commands;
use course_harness::config::{self, Config};
use course_harness::db;
use course_harness::engine::MigrationResult;
use course_harness::import;
use course_harness::migrate;
use course_harness::pipeline::Pipeline;
use course_harness::progress::ProgressMode;
use course_harness::server;
use course_harness::sqlite_store::SqliteStore;
use course_harness_core::store::Store;

/// Course Harness CLI: bulk enrichment and migration for course data.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/courses.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "coursectl",
    about = "Course Harness: bulk enrichment and migration for course data",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/courses.toml")]
    config: PathBuf,

    /// Progress output on stderr. Defaults to `human` on a TTY, `off` otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    /// Print reports as JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Import collections and records from a JSON file.
    ///
    /// Existing records with the same ids are replaced.
    Import {
        /// Path to the JSON file.
        file: PathBuf,
    },

    /// Enrich questions through the configured enrichment service.
    ///
    /// Already-enriched questions (same operation, same or newer version)
    /// are skipped, so re-running is safe.
    Enhance {
        /// Only enrich the questions of this collection.
        #[arg(long)]
        collection: Option<String>,
    },

    /// Inspect and run migration plans.
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },

    /// Create, list, export and restore backups.
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },

    /// Run the health probes and print the verdict.
    Health,

    /// Walk every record and report field coverage and shape issues.
    Integrity,

    /// Start the HTTP trigger server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum MigrateAction {
    /// List built-in plans with pending item counts.
    List,
    /// Estimate the size of the data set.
    Scope,
    /// Run a plan.
    Run {
        /// Plan name (see `migrate list`).
        plan: String,
        /// Skip the pre-migration backup.
        #[arg(long)]
        no_backup: bool,
    },
}

#[derive(Subcommand)]
enum BackupAction {
    /// Snapshot all collections, or one.
    Create {
        /// Human-readable label.
        label: String,
        /// Limit the backup to one collection.
        #[arg(long)]
        collection: Option<String>,
    },
    /// List backups, newest first.
    List,
    /// Write a backup as JSON to a file (or stdout).
    Export {
        id: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Write every record of a backup back to the store.
    Restore { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);
    let json = cli.json;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Import { file } => {
            let store = open_store(&cfg).await?;
            import::run_import(&cfg, store, &file).await?;
        }
        Commands::Enhance { collection } => {
            let pipeline = open_pipeline(cfg).await?;
            let reporter = progress.reporter();
            let result = pipeline
                .run_enhancement(collection.as_deref(), reporter.as_ref())
                .await?;
            finish_run(&result, json)?;
        }
        Commands::Migrate { action } => {
            let pipeline = open_pipeline(cfg).await?;
            match action {
                MigrateAction::List => {
                    let plans = pipeline.list_plans().await?;
                    if json {
                        commands::print_json(&plans)?;
                    } else {
                        commands::print_plans(&plans);
                    }
                }
                MigrateAction::Scope => {
                    let scope = pipeline.estimate_scope().await?;
                    if json {
                        commands::print_json(&scope)?;
                    } else {
                        commands::print_scope(&scope);
                    }
                }
                MigrateAction::Run { plan, no_backup } => {
                    let reporter = progress.reporter();
                    let result = pipeline
                        .run_migration(&plan, !no_backup, reporter.as_ref())
                        .await?;
                    finish_run(&result, json)?;
                }
            }
        }
        Commands::Backup { action } => {
            let pipeline = open_pipeline(cfg).await?;
            match action {
                BackupAction::Create { label, collection } => {
                    let snapshot = pipeline.create_backup(&label, collection.as_deref()).await?;
                    if json {
                        commands::print_json(&snapshot.summary())?;
                    } else {
                        commands::print_backup(&snapshot);
                    }
                }
                BackupAction::List => {
                    let backups = pipeline.list_backups().await?;
                    if json {
                        commands::print_json(&backups)?;
                    } else {
                        commands::print_backups(&backups);
                    }
                }
                BackupAction::Export { id, out } => {
                    pipeline.export_backup(&id, out.as_deref()).await?;
                }
                BackupAction::Restore { id } => {
                    let reporter = progress.reporter();
                    let summary = pipeline.restore_backup(&id, reporter.as_ref()).await?;
                    if json {
                        commands::print_json(&summary)?;
                    } else {
                        commands::print_restore(&summary);
                    }
                    if !summary.is_complete() {
                        bail!("restore incomplete: {} records lost", summary.lost.len());
                    }
                }
            }
        }
        Commands::Health => {
            let pipeline = open_pipeline(cfg).await?;
            let verdict = pipeline.run_health_check().await;
            if json {
                commands::print_json(&verdict)?;
            } else {
                commands::print_verdict(&verdict);
            }
        }
        Commands::Integrity => {
            let pipeline = open_pipeline(cfg).await?;
            let report = pipeline.data_integrity_check().await?;
            if json {
                commands::print_json(&report)?;
            } else {
                commands::print_integrity(&report);
            }
        }
        Commands::Serve => {
            let pipeline = Arc::new(Pipeline::open(cfg).await?);
            server::run_server(pipeline).await?;
        }
    }

    Ok(())
}

async fn open_store(cfg: &Config) -> anyhow::Result<Arc<dyn Store>> {
    let pool = db::connect(cfg).await?;
    migrate::run_migrations(&pool).await?;
    Ok(Arc::new(SqliteStore::new(pool)))
}

/// Open the pipeline. The first Ctrl-C cancels its runs, the second exits.
async fn open_pipeline(cfg: Config) -> anyhow::Result<Arc<Pipeline>> {
    let pipeline = Arc::new(Pipeline::open(cfg).await?);
    let handle = pipeline.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, finishing the current record...");
            handle.cancel();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
    Ok(pipeline)
}

fn finish_run(result: &MigrationResult, json: bool) -> anyhow::Result<()> {
    if json {
        commands::print_json(result)?;
    } else {
        commands::print_result(result);
    }
    if !result.is_success() {
        bail!("{} finished with status {:?}", result.operation, result.status);
    }
    Ok(())
}
