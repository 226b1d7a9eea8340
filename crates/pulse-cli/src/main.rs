use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pulse_extract::ExtractConfig;
use pulse_store::{DeltaEngine, SnapshotStore};

#[derive(Debug, Parser)]
#[command(name = "pulse-cli")]
#[command(about = "Tracker Pulse command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Runs one extraction and writes a snapshot.
    Extract,
    /// Diffs the two most recent snapshots.
    Delta {
        /// Days ahead that count as an approaching deadline.
        #[arg(long, default_value_t = 3)]
        due_window_days: i64,
    },
    /// Shows the most recent snapshot on disk.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Extract) {
        Commands::Extract => {
            let summary = pulse_extract::pipeline::run_extract_from_env().await?;
            println!(
                "extract complete: run_id={} listed={} active={} closed={} omitted={} bytes={} snapshot={}",
                summary.run_id,
                summary.listed_entities,
                summary.active_entities,
                summary.closed_entities,
                summary.omitted_entities,
                summary.payload_bytes,
                summary.snapshot_path
            );
        }
        Commands::Delta { due_window_days } => {
            let config = ExtractConfig::from_env();
            let store = SnapshotStore::new(config.snapshots_dir);
            let Some((older, newer)) = store.latest_pair().await? else {
                eprintln!("need at least two snapshots to compute a delta");
                return Ok(());
            };
            let changes = DeltaEngine::new(due_window_days).diff(&older, &newer);
            println!(
                "delta {} -> {}: {} change(s)",
                older.extracted_at, newer.extracted_at, changes.len()
            );
            for change in changes {
                println!("  {} {} {:?}", change.at, change.entity_id, change.kind);
            }
        }
        Commands::Status => {
            let config = ExtractConfig::from_env();
            let store = SnapshotStore::new(config.snapshots_dir);
            match store.load_latest().await? {
                Some(snapshot) => {
                    println!(
                        "latest snapshot: {} project={} active={} closed={} warnings={}",
                        snapshot.extracted_at,
                        snapshot.payload.project.name,
                        snapshot.payload.active.len(),
                        snapshot.payload.closed.len(),
                        snapshot.manifest.warnings.len()
                    );
                }
                None => eprintln!("no snapshots found"),
            }
        }
    }

    Ok(())
}
