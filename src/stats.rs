//! Repository statistics.
//!
//! Used by `hvst stats` to show how many items sit in each lifecycle stage,
//! how many are bound to a remote record, and when each collection was last
//! harvested.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::sqlite_store::from_millis;

/// Item counts per lifecycle stage.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StageCounts {
    pub workspace: i64,
    pub legacy_workflow: i64,
    pub configurable_workflow: i64,
    pub archived: i64,
    pub withdrawn: i64,
    pub harvest_records: i64,
}

struct CollectionStats {
    name: String,
    items: i64,
    harvested: i64,
    last_harvest_ms: Option<i64>,
}

pub async fn stage_counts(pool: &SqlitePool) -> Result<StageCounts> {
    let count = |sql: &'static str| async move {
        sqlx::query_scalar::<_, i64>(sql).fetch_one(pool).await
    };

    Ok(StageCounts {
        workspace: count("SELECT COUNT(*) FROM workspace_items").await?,
        legacy_workflow: count("SELECT COUNT(*) FROM workflow_items").await?,
        configurable_workflow: count("SELECT COUNT(*) FROM xml_workflow_items").await?,
        archived: count(
            "SELECT COUNT(*) FROM items WHERE owning_collection IS NOT NULL AND withdrawn = 0",
        )
        .await?,
        withdrawn: count(
            "SELECT COUNT(*) FROM items WHERE owning_collection IS NOT NULL AND withdrawn = 1",
        )
        .await?,
        harvest_records: count("SELECT COUNT(*) FROM harvested_items").await?,
    })
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let counts = stage_counts(&pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("OAI Harvest: Repository Stats");
    println!("==============================");
    println!();
    println!("  Database:      {}", config.db.path.display());
    println!("  Size:          {}", format_bytes(db_size));
    println!();
    println!("  Workspace:     {}", counts.workspace);
    println!("  In review:     {} (legacy) / {} (configurable)", counts.legacy_workflow, counts.configurable_workflow);
    println!("  Archived:      {}", counts.archived);
    println!("  Withdrawn:     {}", counts.withdrawn);
    println!("  Harvested:     {}", counts.harvest_records);

    let rows = sqlx::query(
        r#"
        SELECT c.name,
               COUNT(i.id) AS items,
               COUNT(h.item_id) AS harvested,
               MAX(h.last_harvested) AS last_harvested
        FROM collections c
        LEFT JOIN items i ON i.owning_collection = c.id
        LEFT JOIN harvested_items h ON h.item_id = i.id
        GROUP BY c.id
        ORDER BY items DESC, c.name ASC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let stats: Vec<CollectionStats> = rows
        .iter()
        .map(|row| CollectionStats {
            name: row.get("name"),
            items: row.get("items"),
            harvested: row.get("harvested"),
            last_harvest_ms: row.get("last_harvested"),
        })
        .collect();

    if !stats.is_empty() {
        println!();
        println!("  By collection:");
        println!(
            "  {:<24} {:>6} {:>10}   {}",
            "COLLECTION", "ITEMS", "HARVESTED", "LAST HARVEST"
        );
        println!("  {}", "-".repeat(64));
        for s in &stats {
            let last = match s.last_harvest_ms {
                Some(ms) => format_ts_relative(ms / 1000),
                None => "never".to_string(),
            };
            println!(
                "  {:<24} {:>6} {:>10}   {}",
                s.name, s.items, s.harvested, last
            );
        }
    }

    println!();
    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    from_millis(ts * 1000).format("%Y-%m-%d %H:%M").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn test_format_ts_relative() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
        assert_eq!(format_ts_relative(0), "1970-01-01 00:00");
    }
}
