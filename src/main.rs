//! # docflow CLI
//!
//! The `docflow` binary enqueues documents, runs workers, and inspects or
//! restarts jobs. `docflow serve` exposes the same operations over HTTP and
//! receives provider callbacks.
//!
//! ## Usage
//!
//! ```bash
//! docflow --config ./config/docflow.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docflow init` | Create the SQLite database and run schema migrations |
//! | `docflow enqueue <item>` | Enqueue one source document |
//! | `docflow enqueue-dir <folder>` | Enqueue every matching document under a folder |
//! | `docflow work` | Run a worker until interrupted (`--once` for a single job) |
//! | `docflow status <id>` | Show a job with its steps |
//! | `docflow counters` | Job counts per status |
//! | `docflow restart --confirm` | Restart jobs by batch or status |
//! | `docflow adopt <item>` | Adopt a legacy transcript as a transformation |
//! | `docflow serve` | Start the HTTP API |
//! | `docflow stats` | Store and index overview |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use docflow::job_cmd::{self, EnqueueArgs};
use docflow::{config, logging, migrate, server, stats};

/// docflow: a lease-based document pipeline.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docflow.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docflow",
    about = "docflow: extract, transform, and ingest documents through a lease-based job queue",
    version,
    long_about = "docflow runs source documents through extract, transform, and ingest phases. \
    Each phase is gated on the artifacts already in the library, so restarted jobs skip work \
    that is already done and repair inconsistent state instead of redoing it."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Phase settings shared by `enqueue` and `enqueue-dir`.
#[derive(clap::Args)]
struct JobArgs {
    /// Batch id to group jobs under.
    #[arg(long)]
    batch: Option<String>,

    /// Target language of the transformation (defaults to `[pipeline].target_language`).
    #[arg(long)]
    lang: Option<String>,

    /// Transformation template name.
    #[arg(long)]
    template: Option<String>,

    /// Phase policy as `phase=policy`, e.g. `extract=skip` or `ingest=force`.
    #[arg(long = "policy", value_parser = parse_key_val)]
    policies: Vec<(String, String)>,

    /// Requesting user, used for library facet lookups.
    #[arg(long)]
    user: Option<String>,

    /// Target library id.
    #[arg(long)]
    library: Option<String>,

    /// Ignore existing artifacts and rerun every enabled phase.
    #[arg(long)]
    no_cache: bool,
}

impl From<JobArgs> for EnqueueArgs {
    fn from(a: JobArgs) -> Self {
        EnqueueArgs {
            batch: a.batch,
            lang: a.lang,
            template: a.template,
            policies: a.policies,
            user: a.user,
            library: a.library,
            no_cache: a.no_cache,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it again is safe.
    Init,

    /// Enqueue a single source document.
    ///
    /// `item` is a path relative to `[storage].root`. Prints the new job id.
    Enqueue {
        item: String,
        #[command(flatten)]
        job: JobArgs,
    },

    /// Enqueue every matching document under a folder as one batch.
    EnqueueDir {
        /// Folder relative to `[storage].root`.
        folder: String,

        /// Include glob (repeatable). Defaults to common document types.
        #[arg(long)]
        include: Vec<String>,

        #[command(flatten)]
        job: JobArgs,
    },

    /// Claim and run jobs.
    Work {
        /// Run at most one job, then exit.
        #[arg(long)]
        once: bool,
    },

    /// Show a job with its steps and errors.
    Status {
        id: String,
        /// Print the full job record as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print job counts per status as JSON.
    Counters,

    /// Restart jobs matching a filter.
    ///
    /// Without `--confirm` nothing is restarted.
    Restart {
        #[arg(long)]
        batch: Option<String>,
        /// Only restart jobs in this status (`queued`, `running`, `completed`, `failed`).
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        confirm: bool,
    },

    /// Adopt a legacy transcript with frontmatter as the transformation.
    Adopt {
        item: String,
        #[arg(long)]
        lang: Option<String>,
        #[arg(long)]
        template: Option<String>,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Show job, document, and chunk counts.
    Stats,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.log);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Enqueue { item, job } => {
            job_cmd::run_enqueue(&cfg, &item, &job.into()).await?;
        }
        Commands::EnqueueDir {
            folder,
            include,
            job,
        } => {
            job_cmd::run_enqueue_dir(&cfg, &folder, &include, &job.into()).await?;
        }
        Commands::Work { once } => {
            job_cmd::run_work(&cfg, once).await?;
        }
        Commands::Status { id, json } => {
            job_cmd::run_status(&cfg, &id, json).await?;
        }
        Commands::Counters => {
            job_cmd::run_counters(&cfg).await?;
        }
        Commands::Restart {
            batch,
            status,
            confirm,
        } => {
            job_cmd::run_restart(&cfg, batch, status, confirm).await?;
        }
        Commands::Adopt {
            item,
            lang,
            template,
        } => {
            job_cmd::run_adopt(&cfg, &item, lang.as_deref(), template.as_deref()).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
