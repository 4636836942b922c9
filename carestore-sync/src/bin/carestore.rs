//! Care store operator tool
//!
//! Usage:
//!   carestore --db care.db inspect
//!   carestore --db care.db export --since 12 --output delta.json
//!   carestore --db care.db import delta.json --policy keep-latest
//!   carestore --db care.db history --kind task walk

use anyhow::Context;
use carestore_sync::{telemetry, CareStore, ConflictPolicy, EntityKind, RevisionRecord, StoreConfig};
use clap::{Parser, Subcommand};
use itertools::Itertools;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "carestore")]
#[command(about = "Inspect, export and import a local care record store")]
struct Args {
    /// Path to the SQLite database file
    #[arg(long, env = "CARESTORE_DB_PATH", default_value = "carestore.db")]
    db: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show record counts, open conflicts and clocks
    Inspect,

    /// Write a revision record as JSON
    Export {
        /// Skip what this replica's first N changes already covered (0 exports everything)
        #[arg(long, default_value = "0")]
        since: i64,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Merge a revision record file into the store
    Import {
        file: PathBuf,

        /// How to resolve conflicting heads
        #[arg(long, default_value = "keep-remote")]
        policy: ConflictPolicy,
    },

    /// Print every version of one logical id
    History {
        #[arg(long)]
        kind: EntityKind,

        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    telemetry::init_tracing(args.verbose, args.json_logs)?;

    let config = StoreConfig {
        db_path: args.db.clone(),
        auto_sync: false,
        ..StoreConfig::from_env()
    };
    let store = CareStore::open(config)
        .await
        .with_context(|| format!("failed to open store at {}", args.db))?;

    match args.command {
        Command::Inspect => inspect(&store).await,
        Command::Export { since, output } => export(&store, since, output).await,
        Command::Import { file, policy } => import(&store, &file, policy).await,
        Command::History { kind, id } => history(&store, kind, &id).await,
    }
}

async fn inspect(store: &CareStore) -> anyhow::Result<()> {
    let summary = store.summary().await;
    println!("replica      {}", summary.replica_id);
    println!("knowledge    {}", summary.knowledge);
    println!("last synced  {}", summary.last_synced);
    println!();
    println!("{:<10} {:>6} {:>8}", "kind", "live", "stored");
    for kind in EntityKind::ALL {
        let live = summary.live.get(&kind).copied().unwrap_or_default();
        let stored = summary.stored.get(&kind).copied().unwrap_or_default();
        println!("{:<10} {:>6} {:>8}", kind, live, stored);
    }
    if !summary.conflicts.is_empty() {
        println!();
        println!("unresolved conflicts:");
        for (kind, id) in &summary.conflicts {
            println!("  {} '{}'", kind, id);
        }
    }
    Ok(())
}

async fn export(store: &CareStore, since: i64, output: Option<PathBuf>) -> anyhow::Result<()> {
    let record = store.compute_revision_since(since).await;
    let json = serde_json::to_string_pretty(&record)?;
    match output {
        Some(path) => {
            std::fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
            info!(entities = record.len(), path = %path.display(), "Exported revision");
        }
        None => println!("{}", json),
    }
    Ok(())
}

async fn import(store: &CareStore, file: &PathBuf, policy: ConflictPolicy) -> anyhow::Result<()> {
    let json = std::fs::read_to_string(file).with_context(|| format!("failed to read {}", file.display()))?;
    let record: RevisionRecord = serde_json::from_str(&json).context("not a revision record")?;

    let report = store.merge_revision(record, &policy).await?;
    info!(%policy, "Imported revision");
    println!(
        "inserted {}, joined {}, skipped {}, conflicts resolved {}, outcomes re-homed {}",
        report.inserted, report.joined, report.skipped, report.conflicts_resolved, report.rehomed
    );
    Ok(())
}

async fn history(store: &CareStore, kind: EntityKind, id: &str) -> anyhow::Result<()> {
    let versions = store.history(kind, id).await;
    if versions.is_empty() {
        anyhow::bail!("no {} '{}' in this store", kind, id);
    }
    for version in versions {
        let header = version.header();
        let state = if header.is_tombstoned() {
            "deleted"
        } else if header.is_head() {
            "head"
        } else {
            "superseded"
        };
        println!(
            "{}  effective {}  created {}  {:<10}  previous [{}]",
            header.uuid,
            header.effective_date.to_rfc3339(),
            header.created_date.to_rfc3339(),
            state,
            header.previous_version_uuids.iter().join(", ")
        );
    }
    Ok(())
}
