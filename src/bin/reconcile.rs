//! Reports (and optionally removes) blobs no video record references.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use newtube_hosting::{
    config::{DEFAULT_CONFIG_PATH, load_settings_from},
    reconcile::{cutoff_before, find_orphans, load_records},
    storage::{bounded, create_blob_store},
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Find blobs that no video record points at.")]
struct Cli {
    #[arg(long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, help = "Path to the config file")]
    config: String,
    #[arg(long = "delete", help = "Delete the orphaned blobs instead of only listing them")]
    delete: bool,
    #[arg(
        long = "min-age-mins",
        value_name = "MINUTES",
        default_value_t = 60,
        help = "Ignore blobs modified more recently than this"
    )]
    min_age_mins: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("newtube_hosting=info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = load_settings_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config))?;

    let records = load_records(&settings.db_path)?;
    let cutoff = cutoff_before(Utc::now(), cli.min_age_mins)?;
    let selected = create_blob_store(&settings).await?;
    let orphans = find_orphans(selected.store.as_ref(), &records, cutoff)
        .await
        .context("listing stored blobs")?;

    if orphans.is_empty() {
        println!("No orphaned blobs ({} videos checked).", records.len());
        return Ok(());
    }

    let total: u64 = orphans.iter().map(|blob| blob.size).sum();
    for blob in &orphans {
        println!("{}\t{} bytes", blob.key, blob.size);
    }
    println!("{} orphaned blobs, {} bytes", orphans.len(), total);

    if !cli.delete {
        println!("Re-run with --delete to remove them.");
        return Ok(());
    }

    let mut failed = 0usize;
    for blob in &orphans {
        let outcome = bounded(
            "orphan delete",
            settings.blob_timeout,
            selected.store.delete(&blob.key),
        )
        .await;
        if let Err(err) = outcome {
            failed += 1;
            tracing::warn!(key = %blob.key, error = %err, "failed to delete orphan");
        }
    }
    println!("Deleted {} of {} orphaned blobs.", orphans.len() - failed, orphans.len());
    if failed > 0 {
        anyhow::bail!("{failed} orphaned blobs could not be deleted");
    }
    Ok(())
}
