//! # OAI Harvest CLI (`hvst`)
//!
//! The `hvst` binary drives the harvest ingestion pipeline against a local
//! SQLite repository.
//!
//! ## Usage
//!
//! ```bash
//! hvst --config ./config/hvst.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `hvst init` | Create the SQLite database and run schema migrations |
//! | `hvst collection create <name>` | Create a target collection |
//! | `hvst collection list` | List target collections |
//! | `hvst harvest <collection> <dir>` | Ingest every record file under a directory |
//! | `hvst resolve <collection> <remote-id>` | Show which local item a remote record is bound to |
//! | `hvst item <id>` | Dump an item's metadata, bitstreams, stage and harvest binding |
//! | `hvst record forget <item-id>` | Delete a harvest binding |
//! | `hvst withdraw <item-id>` | Withdraw an archived item |
//! | `hvst delete <item-id>` | Permanently delete an item and its harvest binding |
//! | `hvst stats` | Item counts per lifecycle stage |
//!
//! ## Examples
//!
//! ```bash
//! hvst init --config ./config/hvst.toml
//! hvst collection create theses
//! hvst harvest theses ./harvested --dry-run
//! hvst harvest theses ./harvested
//! hvst resolve theses oai:example.org:42
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use oai_harvest::{collections, config, get, ingest, migrate, stats};

/// OAI Harvest CLI: synchronize harvested OAI-PMH records into a local
/// repository of versioned items.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/hvst.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "hvst",
    about = "OAI Harvest: synchronize harvested records into a local item repository",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/hvst.toml`.
    #[arg(long, global = true, default_value = "./config/hvst.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Manage target collections.
    Collection {
        #[command(subcommand)]
        action: CollectionAction,
    },

    /// Ingest every record file found under a directory.
    ///
    /// Each record is resolved against the collection, then created or
    /// updated in its own transaction. Failures are counted and the batch
    /// continues.
    Harvest {
        /// Collection id or name.
        collection: String,

        /// Directory holding record files.
        dir: PathBuf,

        /// Scan and parse only; show counts without writing to the database.
        #[arg(long)]
        dry_run: bool,

        /// Process at most this many record files.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show which local item a remote record identifier resolves to.
    Resolve {
        /// Collection id or name.
        collection: String,

        /// Remote record identifier, e.g. `oai:example.org:42`.
        remote_id: String,
    },

    /// Dump an item with its metadata, bitstreams and harvest binding.
    Item {
        /// Item UUID.
        id: String,

        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Administer harvest bindings.
    Record {
        #[command(subcommand)]
        action: RecordAction,
    },

    /// Withdraw an archived item. It keeps its harvest binding.
    Withdraw {
        /// Item UUID.
        item_id: String,
    },

    /// Permanently delete an item together with its harvest binding.
    Delete {
        /// Item UUID.
        item_id: String,
    },

    /// Show item counts per lifecycle stage and per collection.
    Stats,
}

#[derive(Subcommand)]
enum CollectionAction {
    /// Create a collection with a unique name.
    Create { name: String },
    /// List collections.
    List,
}

#[derive(Subcommand)]
enum RecordAction {
    /// Delete the harvest binding of an item. The item is kept; the next
    /// harvest of the same remote record creates a new item.
    Forget { item_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("initialized {}", cfg.db.path.display());
        }
        Commands::Collection { action } => match action {
            CollectionAction::Create { name } => collections::run_create(&cfg, &name).await?,
            CollectionAction::List => collections::run_list(&cfg).await?,
        },
        Commands::Harvest {
            collection,
            dir,
            dry_run,
            limit,
        } => ingest::run_harvest(&cfg, &collection, &dir, dry_run, limit).await?,
        Commands::Resolve {
            collection,
            remote_id,
        } => get::run_resolve(&cfg, &collection, &remote_id).await?,
        Commands::Item { id, json } => get::run_item(&cfg, &id, json).await?,
        Commands::Record { action } => match action {
            RecordAction::Forget { item_id } => get::run_forget(&cfg, &item_id).await?,
        },
        Commands::Withdraw { item_id } => get::run_withdraw(&cfg, &item_id).await?,
        Commands::Delete { item_id } => get::run_delete(&cfg, &item_id).await?,
        Commands::Stats => stats::run_stats(&cfg).await?,
    }

    Ok(())
}
