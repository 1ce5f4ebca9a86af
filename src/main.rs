//! # kb-sync CLI (`kbsync`)
//!
//! The `kbsync` binary hosts the sync engine: it loads the TOML config,
//! opens the SQLite state database, builds the sink and sources of a
//! knowledge base, and runs the orchestrator.
//!
//! ## Usage
//!
//! ```bash
//! kbsync --config ./config/kbsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kbsync init` | Create the SQLite database and run schema migrations |
//! | `kbsync sources <kb>` | List the sink and sources of a knowledge base |
//! | `kbsync sync <kb>` | Sync a knowledge base |
//! | `kbsync runs <kb>` | Show recent sync runs |
//! | `kbsync errors <kb>` | Show files whose last sync failed |
//!
//! Logs go to stderr and are filtered with `RUST_LOG` (default `warn`).
//! `kbsync sync` exits with status 1 when the run ends `failed`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use kb_sync::config::{self, Config};
use kb_sync::detect::ChangeDetector;
use kb_sync::models::{RunStatus, SyncMode, SyncRun};
use kb_sync::orchestrator::SyncOrchestrator;
use kb_sync::progress::ProgressMode;
use kb_sync::repository::Repository;
use kb_sync::sqlite_repo::SqliteRepository;
use kb_sync::traits::{SinkFactory, SourceFactory};
use kb_sync::{db, migrate, report};

/// kb-sync CLI: incremental sync of document sources into knowledge-base sinks.
#[derive(Parser)]
#[command(
    name = "kbsync",
    about = "Incremental sync of document sources into knowledge-base sinks",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kbsync.toml")]
    config: PathBuf,

    /// Log output format: `text` or `json`.
    #[arg(long, global = true, default_value = "text")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the file-record and sync-run
    /// tables. Safe to run repeatedly.
    Init,

    /// List the sink and sources configured for a knowledge base.
    Sources {
        /// Knowledge base name (a key under `[knowledge_bases]`).
        knowledge_base: String,
    },

    /// Sync every enabled source of a knowledge base into its sink.
    Sync {
        /// Knowledge base name.
        knowledge_base: String,

        /// Override the configured mode: `parallel` or `sequential`.
        #[arg(long)]
        mode: Option<String>,

        /// Only sync these source ids. Repeatable.
        #[arg(long = "source")]
        sources: Vec<String>,

        /// Cap concurrently running sources in parallel mode.
        #[arg(long)]
        max_concurrency: Option<usize>,

        /// Cancel sources still running after this many seconds.
        #[arg(long)]
        deadline_secs: Option<u64>,

        /// Progress on stderr: `off`, `human`, or `json`.
        /// Defaults to `human` when stderr is a terminal.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Show recent sync runs, newest first.
    Runs {
        /// Knowledge base name.
        knowledge_base: String,

        /// Maximum number of runs to show.
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Show files whose last sync attempt failed.
    Errors {
        /// Knowledge base name.
        knowledge_base: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_format)?;

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Sources { knowledge_base } => {
            let kb = cfg.knowledge_base(&knowledge_base)?;
            report::print_sources(
                &knowledge_base,
                kb,
                &SourceFactory::with_builtins(),
                &SinkFactory::with_builtins(),
            );
        }
        Commands::Sync {
            knowledge_base,
            mode,
            sources,
            max_concurrency,
            deadline_secs,
            progress,
        } => {
            let args = SyncArgs {
                mode,
                sources,
                max_concurrency,
                deadline_secs,
                progress,
            };
            let run = run_sync(&cfg, &knowledge_base, args).await?;
            report::print_run_summary(&run);
            if run.status == RunStatus::Failed {
                std::process::exit(1);
            }
        }
        Commands::Runs {
            knowledge_base,
            limit,
        } => {
            cfg.knowledge_base(&knowledge_base)?;
            let repo = open_repository(&cfg).await?;
            let runs = repo.list_sync_runs(&knowledge_base, limit).await?;
            report::print_runs(&runs);
        }
        Commands::Errors { knowledge_base } => {
            cfg.knowledge_base(&knowledge_base)?;
            let repo = open_repository(&cfg).await?;
            let records = repo.list_error_records(&knowledge_base).await?;
            report::print_errors(&records);
        }
    }

    Ok(())
}

/// CLI overrides for `kbsync sync`.
struct SyncArgs {
    mode: Option<String>,
    sources: Vec<String>,
    max_concurrency: Option<usize>,
    deadline_secs: Option<u64>,
    progress: Option<String>,
}

async fn run_sync(cfg: &Config, knowledge_base: &str, args: SyncArgs) -> Result<SyncRun> {
    let kb = cfg.knowledge_base(knowledge_base)?;

    let mut options = cfg.sync.options();
    if let Some(mode) = args.mode {
        options.mode = mode.parse::<SyncMode>()?;
    }
    if let Some(n) = args.max_concurrency {
        if n == 0 {
            bail!("--max-concurrency must be > 0");
        }
        options.max_concurrency = Some(n);
    }
    if let Some(secs) = args.deadline_secs {
        options.deadline = Some(Duration::from_secs(secs));
    }
    if !args.sources.is_empty() {
        for id in &args.sources {
            if !kb.sources.iter().any(|s| &s.source_id == id) {
                bail!(
                    "Unknown source '{}' in knowledge base '{}'",
                    id,
                    knowledge_base
                );
            }
        }
        options.source_filter = Some(args.sources);
    }

    let progress = match args.progress.as_deref() {
        None => ProgressMode::default_for_tty(),
        Some("off") => ProgressMode::Off,
        Some("human") => ProgressMode::Human,
        Some("json") => ProgressMode::Json,
        Some(other) => bail!(
            "Unknown progress mode: '{}'. Must be off, human, or json.",
            other
        ),
    };

    let sink = SinkFactory::with_builtins().create(&kb.sink)?;
    let repo = open_repository(cfg).await?;

    let orchestrator = SyncOrchestrator::new(Arc::new(repo), SourceFactory::with_builtins())
        .with_detector(ChangeDetector::new(cfg.sync.mtime_tolerance()))
        .with_progress(progress.reporter());

    orchestrator
        .run(knowledge_base, &kb.sources, sink, &options)
        .await
}

async fn open_repository(cfg: &Config) -> Result<SqliteRepository> {
    let pool = db::connect(cfg).await?;
    migrate::run_migrations(&pool).await?;
    Ok(SqliteRepository::new(pool))
}

fn init_logging(format: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    let installed = match format {
        "text" => builder.try_init(),
        "json" => builder.json().try_init(),
        other => bail!("Unknown log format: '{}'. Must be text or json.", other),
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install logger: {}", e))
}
