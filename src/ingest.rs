//! Batch harvest driver.
//!
//! Scans a record directory, runs every record through the ingestion
//! pipeline against the SQLite backend, and prints a summary. A record that
//! fails to parse or ingest is counted and the batch carries on.

use anyhow::Result;
use std::path::Path;
use tracing::{info, warn};

use oai_harvest_core::models::CollectionId;
use oai_harvest_core::{Backend, Harvester, IngestOutcome};

use crate::collections;
use crate::config::Config;
use crate::db;
use crate::extensions;
use crate::source_fs::{self, ScanEntry, ScannedFile};
use crate::sqlite_store::SqliteBackend;

/// Counts from one batch run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HarvestSummary {
    pub records: u64,
    pub created: u64,
    pub updated: u64,
    pub rejected: u64,
    pub deleted: u64,
    pub failed: u64,
}

impl HarvestSummary {
    fn count(&mut self, outcome: &IngestOutcome) {
        match outcome {
            IngestOutcome::Created(_) => self.created += 1,
            IngestOutcome::Updated(_) => self.updated += 1,
            IngestOutcome::Rejected => self.rejected += 1,
            IngestOutcome::Failed(_) => self.failed += 1,
        }
    }
}

pub async fn run_harvest(
    config: &Config,
    collection: &str,
    dir: &Path,
    dry_run: bool,
    limit: Option<usize>,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let target = collections::resolve_collection(&pool, collection).await?;

    let mut files = source_fs::scan_records(config, dir)?;
    if let Some(lim) = limit {
        files.truncate(lim);
    }

    if dry_run {
        let records = files
            .iter()
            .filter(|f| matches!(f.entry, ScanEntry::Record(_)))
            .count();
        let deleted = files
            .iter()
            .filter(|f| matches!(f.entry, ScanEntry::Deleted(_)))
            .count();
        println!("harvest {} (dry-run)", target.name);
        println!("  files found: {}", files.len());
        println!("  records: {}", records);
        println!("  deleted: {}", deleted);
        println!("  unreadable: {}", files.len() - records - deleted);
        pool.close().await;
        return Ok(());
    }

    let backend = SqliteBackend::new(
        pool.clone(),
        config.repository.engine()?,
        config.repository.handle_prefix.clone(),
    );
    let harvester = extensions::build_harvester(config)?;
    info!(collection = %target.id, extensions = %harvester.describe(), "starting harvest");

    let summary = harvest_files(&backend, &harvester, &target.id, &files).await;

    println!("harvest {}", target.name);
    println!("  records: {}", summary.records);
    println!("  created: {}", summary.created);
    println!("  updated: {}", summary.updated);
    println!("  rejected: {}", summary.rejected);
    println!("  deleted (skipped): {}", summary.deleted);
    println!("  failed: {}", summary.failed);
    println!("ok");

    pool.close().await;
    Ok(())
}

/// Ingest every scanned record in order.
pub async fn harvest_files(
    backend: &dyn Backend,
    harvester: &Harvester,
    collection: &CollectionId,
    files: &[ScannedFile],
) -> HarvestSummary {
    let mut summary = HarvestSummary::default();
    for file in files {
        summary.records += 1;
        match &file.entry {
            ScanEntry::Record(record) => {
                let outcome = harvester.ingest(backend, collection, record).await;
                summary.count(&outcome);
            }
            ScanEntry::Deleted(remote_id) => {
                info!(remote_id = %remote_id, file = %file.relative, "record deleted at source; skipping");
                summary.deleted += 1;
            }
            ScanEntry::Invalid(error) => {
                warn!(file = %file.relative, error = %error, "could not read record");
                summary.failed += 1;
            }
        }
    }
    summary
}
