//! Idempotent schema migrations.
//!
//! Each lifecycle stage has its own table, mirroring the separate stores the
//! identity resolver has to search: `items` (archived and withdrawn items carry
//! `owning_collection`), `workspace_items`, `workflow_items` (legacy review
//! engine) and `xml_workflow_items` (configurable review engine).

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS collections (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS items (
        id TEXT PRIMARY KEY,
        handle TEXT UNIQUE,
        owning_collection TEXT REFERENCES collections(id),
        in_archive INTEGER NOT NULL DEFAULT 0,
        withdrawn INTEGER NOT NULL DEFAULT 0,
        last_modified INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workspace_items (
        id TEXT PRIMARY KEY,
        item_id TEXT NOT NULL UNIQUE REFERENCES items(id) ON DELETE CASCADE,
        collection_id TEXT NOT NULL REFERENCES collections(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workflow_items (
        id TEXT PRIMARY KEY,
        item_id TEXT NOT NULL UNIQUE REFERENCES items(id) ON DELETE CASCADE,
        collection_id TEXT NOT NULL REFERENCES collections(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS xml_workflow_items (
        id TEXT PRIMARY KEY,
        item_id TEXT NOT NULL UNIQUE REFERENCES items(id) ON DELETE CASCADE,
        collection_id TEXT NOT NULL REFERENCES collections(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS metadata_values (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        item_id TEXT NOT NULL REFERENCES items(id) ON DELETE CASCADE,
        schema_name TEXT NOT NULL,
        element TEXT NOT NULL,
        qualifier TEXT,
        language TEXT,
        value TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS bundles (
        id TEXT PRIMARY KEY,
        item_id TEXT NOT NULL REFERENCES items(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        UNIQUE(item_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS bitstreams (
        id TEXT PRIMARY KEY,
        bundle_id TEXT NOT NULL REFERENCES bundles(id) ON DELETE CASCADE,
        sequence INTEGER NOT NULL,
        name TEXT NOT NULL,
        mime_type TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        checksum TEXT NOT NULL,
        content BLOB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS harvested_items (
        item_id TEXT PRIMARY KEY REFERENCES items(id) ON DELETE CASCADE,
        remote_id TEXT NOT NULL,
        last_harvested INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS handle_sequence (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        next_value INTEGER NOT NULL
    )
    "#,
    "INSERT OR IGNORE INTO handle_sequence (id, next_value) VALUES (1, 1)",
    "CREATE INDEX IF NOT EXISTS idx_harvested_remote_id ON harvested_items(remote_id)",
    "CREATE INDEX IF NOT EXISTS idx_items_owning_collection ON items(owning_collection)",
    "CREATE INDEX IF NOT EXISTS idx_metadata_item ON metadata_values(item_id)",
    "CREATE INDEX IF NOT EXISTS idx_bitstreams_bundle ON bitstreams(bundle_id, sequence)",
];

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index that does not exist yet.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
