//! # m365-rag CLI (`mrag`)
//!
//! ## Usage
//!
//! ```bash
//! mrag --config ./config/mrag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mrag init` | Create the SQLite database and run schema migrations |
//! | `mrag sources` | List connectors and their health |
//! | `mrag sync <connector>` | Delta-sync `all`, `mail`, `onedrive`, or `filesystem` |
//! | `mrag upload pending` | Upload records that are not in the vector store yet |
//! | `mrag upload rebuild` | Replace every uploaded file |
//! | `mrag upload batch <file>` | Upload the records of a batch file |
//! | `mrag archive clear` | Delete the archived JSON files in OneDrive |
//! | `mrag ask "<question>"` | Answer a question with citations |
//! | `mrag search "<query>"` | Raw vector store search |
//! | `mrag get <id>` | Show a stored record |
//! | `mrag export` | Dump records as batch JSONL |
//! | `mrag stats` | Record counts and checkpoints |
//! | `mrag serve` | Start the `/ask` + `/rag` HTTP relay |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use m365_rag::logging::{init_tracing, LogFormat};
use m365_rag::progress::ProgressMode;
use m365_rag::{
    answer, archive, config, export, get, ingest, migrate, search, server, sources, stats,
    upload_cmd,
};

/// Sync Microsoft 365 mail and OneDrive documents into an OpenAI vector store
/// and ask questions over them.
#[derive(Parser)]
#[command(name = "mrag", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/mrag.toml")]
    config: PathBuf,

    /// More log output (-v debug, -vv trace). `RUST_LOG` wins when set.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log line format on stderr.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and output directory.
    ///
    /// Idempotent; running it again is safe.
    Init,

    /// List connectors and whether their credentials and folders work.
    Sources,

    /// Delta-sync a connector into batch files, SQLite, and the vector store.
    ///
    /// Connector: `all`, `mail`, `onedrive`, or `filesystem`.
    Sync {
        connector: String,

        /// Ignore the checkpoint and rescan everything.
        #[arg(long)]
        full: bool,

        /// Show new/modified/unchanged counts without writing anything.
        #[arg(long)]
        dry_run: bool,

        /// Only process items modified on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        /// Only process items modified on or before this date (YYYY-MM-DD).
        #[arg(long)]
        until: Option<String>,

        /// Maximum number of items to process.
        #[arg(long)]
        limit: Option<usize>,

        /// Write batch files and records but do not upload.
        #[arg(long)]
        skip_upload: bool,

        /// Progress on stderr: off, human, or json. Defaults to human on a TTY.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Manage vector store uploads.
    Upload {
        #[command(subcommand)]
        action: UploadAction,
    },

    /// Maintain the OneDrive archive of normalized records.
    Archive {
        #[command(subcommand)]
        action: ArchiveAction,
    },

    /// Ask a question; prints the answer, citations, and confidence.
    Ask {
        query: String,

        /// Continue an earlier conversation.
        #[arg(long)]
        conversation: Option<String>,

        /// Print the JSON envelope.
        #[arg(long)]
        json: bool,
    },

    /// Search the vector store directly.
    Search {
        query: String,

        /// Maximum number of results (1-50).
        #[arg(long)]
        limit: Option<u32>,

        /// Attribute filter as `key=value`; repeatable, all must match.
        #[arg(long = "filter")]
        filters: Vec<String>,

        #[arg(long)]
        json: bool,
    },

    /// Show a stored record by document id.
    Get {
        id: String,

        #[arg(long)]
        json: bool,
    },

    /// Export stored records as batch JSONL (stdout by default).
    Export {
        #[arg(long)]
        output: Option<PathBuf>,

        /// Only records from this source label.
        #[arg(long)]
        source: Option<String>,
    },

    /// Record counts by kind and status, uploads, and checkpoints.
    Stats,

    /// Start the `/ask` and `/rag` HTTP relay on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum UploadAction {
    /// Upload records that are processed or failed.
    Pending {
        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        dry_run: bool,
    },

    /// Remove every uploaded file and upload all records again.
    Rebuild,

    /// Upload the records of a batch JSONL file written by `sync` or `export`.
    Batch {
        file: PathBuf,

        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum ArchiveAction {
    /// Delete every file in `[onedrive].processed_folder`.
    Clear {
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            std::fs::create_dir_all(&cfg.output.dir)?;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            sources::list_sources(&cfg).await?;
        }
        Commands::Sync {
            connector,
            full,
            dry_run,
            since,
            until,
            limit,
            skip_upload,
            progress,
        } => {
            let options = ingest::SyncOptions {
                full,
                dry_run,
                since,
                until,
                limit,
                skip_upload,
            };
            let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();
            let reports = ingest::run_sync(&cfg, &connector, &options, reporter.as_ref()).await?;
            for report in &reports {
                report.print();
            }
            if reports.iter().any(|r| !r.errors.is_empty()) {
                std::process::exit(1);
            }
        }
        Commands::Upload { action } => {
            let summary = match action {
                UploadAction::Pending { limit, dry_run } => {
                    upload_cmd::run_upload_pending(&cfg, limit, dry_run).await?
                }
                UploadAction::Rebuild => upload_cmd::run_upload_rebuild(&cfg).await?,
                UploadAction::Batch { file, dry_run } => {
                    upload_cmd::run_upload_batch(&cfg, &file, dry_run).await?
                }
            };
            if !summary.errors.is_empty() {
                std::process::exit(1);
            }
        }
        Commands::Archive { action } => {
            let ArchiveAction::Clear { dry_run } = action;
            let summary = archive::run_archive_clear(&cfg, dry_run).await?;
            if !summary.errors.is_empty() {
                std::process::exit(1);
            }
        }
        Commands::Ask {
            query,
            conversation,
            json,
        } => {
            answer::run_ask(&cfg, &query, conversation, json).await?;
        }
        Commands::Search {
            query,
            limit,
            filters,
            json,
        } => {
            search::run_search(&cfg, &query, &filters, limit, json).await?;
        }
        Commands::Get { id, json } => {
            get::run_get(&cfg, &id, json).await?;
        }
        Commands::Export { output, source } => {
            export::run_export(&cfg, output.as_deref(), source.as_deref()).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
