//! # Level 0 pipeline CLI (`level0`)
//!
//! The `level0` binary initialises the database, feeds the arrival buffer,
//! runs the worker and gives operators a view of execution records.
//!
//! ## Usage
//!
//! ```bash
//! level0 --config ./config/level0.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `level0 init` | Create the SQLite database and run schema migrations |
//! | `level0 enqueue <event.json>...` | Push raw arrival notifications into the buffer |
//! | `level0 resend <stw_prefix>` | Re-announce stored files under a satellite-time prefix |
//! | `level0 run [--once]` | Poll the buffer and drive executions |
//! | `level0 import <key>` | Drive one stored file synchronously |
//! | `level0 status [<id>]` | Pipeline overview, or one execution record |
//! | `level0 executions` | List executions |
//! | `level0 cancel <id>` | Cancel a non-terminal execution |
//! | `level0 serve` | Start the operator HTTP API |

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use level0_core::event::{decode_notification, UNVERSIONED};
use level0_core::machine::ExecutionState;
use odin_level0::orchestrator::DriveOutcome;
use odin_level0::pipeline::Pipeline;
use odin_level0::{config, migrate, resend, server, status};

/// Odin Level 0 pipeline: activation, orchestration, import and
/// notification of raw telemetry files.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/level0.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "level0",
    about = "Odin Level 0 ingestion pipeline",
    version,
    long_about = "Turns every Level 0 file that lands in raw storage into exactly one durable \
    execution that routes, imports and announces it, with bounded retries and an operator-visible \
    record of the outcome."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/level0.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Push arrival notifications into the buffer.
    ///
    /// Each file holds one S3 event notification (or a plain
    /// `{"object_key", "object_version"}` document).
    Enqueue {
        /// JSON files to enqueue.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Re-announce stored files whose satellite time starts with a prefix.
    ///
    /// Lists `<type>/<prefix>` for every file type and enqueues one
    /// synthetic arrival event per object.
    Resend {
        /// Three hex digits, e.g. `0ce`.
        prefix: String,
    },

    /// Run the pipeline worker.
    ///
    /// Polls the arrival buffer, activates executions and drives them,
    /// resuming executions left behind by earlier runs.
    Run {
        /// Drain the buffer, drive what was found, then exit.
        #[arg(long)]
        once: bool,
    },

    /// Import one stored file synchronously.
    Import {
        /// Object key, e.g. `ac1/0ce/0ce86a42.ac1`.
        key: String,

        /// Object version.
        #[arg(long, default_value = UNVERSIONED)]
        version: String,
    },

    /// Show the pipeline overview, or one execution record.
    Status {
        /// Execution id (`l0-...`).
        id: Option<String>,
    },

    /// List executions, most recently updated first.
    Executions {
        /// Only executions in this state (pending, routing, importing,
        /// notifying, succeeded, failed).
        #[arg(long)]
        state: Option<String>,

        /// Maximum number of executions to list.
        #[arg(long, default_value_t = status::DEFAULT_LIST_LIMIT)]
        limit: usize,
    },

    /// Cancel a non-terminal execution.
    Cancel {
        /// Execution id (`l0-...`).
        id: String,

        /// Reason recorded on the execution.
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },

    /// Start the operator HTTP API on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Enqueue { files } => {
            let pipeline = Pipeline::open(&cfg).await?;
            let mut records = 0;
            for path in &files {
                let body = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read event file: {}", path.display()))?;
                let decoded = decode_notification(&body)
                    .map_err(anyhow::Error::msg)
                    .with_context(|| format!("Not an arrival event: {}", path.display()))?;
                records += decoded.len();
                pipeline.buffer.enqueue(&body).await?;
            }
            println!(
                "Enqueued {} message(s) announcing {} file(s).",
                files.len(),
                records
            );
        }
        Commands::Resend { prefix } => {
            let pipeline = Pipeline::open(&cfg).await?;
            let bucket = cfg.storage.bucket.clone().unwrap_or_else(|| "local".to_string());
            let sent =
                resend::resend_prefix(&*pipeline.objects, &pipeline.buffer, &bucket, &prefix).await?;
            println!("Enqueued {} arrival event(s) for prefix {}.", sent, prefix);
        }
        Commands::Run { once } => {
            let pipeline = Pipeline::open(&cfg).await?;
            let report = pipeline.worker().run(once).await?;
            println!(
                "Processed {} message(s): {} started, {} driven ({} succeeded, {} failed, {} parked, {} errors).",
                report.messages,
                report.started,
                report.driven,
                report.succeeded,
                report.failed,
                report.parked,
                report.errors
            );
        }
        Commands::Import { key, version } => {
            let pipeline = Pipeline::open(&cfg).await?;
            match pipeline.import_one(&key, &version).await? {
                DriveOutcome::Finished(execution) | DriveOutcome::Parked(execution) => {
                    print!("{}", status::describe(&execution));
                    if execution.state == ExecutionState::Failed && !execution.is_partial_success() {
                        bail!("import of {} failed", key);
                    }
                }
                DriveOutcome::Busy => {
                    println!("Execution for {} is being driven by another worker.", key)
                }
                DriveOutcome::NotFound => bail!("execution for {} disappeared", key),
            }
        }
        Commands::Status { id } => {
            let pipeline = Pipeline::open(&cfg).await?;
            status::run_status(&pipeline, id.as_deref()).await?;
        }
        Commands::Executions { state, limit } => {
            let pipeline = Pipeline::open(&cfg).await?;
            status::run_executions(&pipeline, state.as_deref(), limit).await?;
        }
        Commands::Cancel { id, reason } => {
            let pipeline = Pipeline::open(&cfg).await?;
            status::run_cancel(&pipeline, &id, &reason).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
