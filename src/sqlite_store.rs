//! SQLite-backed [`Backend`] implementation.
//!
//! Every session owns one SQLite transaction. The session and its stage
//! indexes share that transaction, so reads inside an ingest see the
//! ingest's own uncommitted writes and a rollback discards all of them.
//!
//! Timestamps are stored as INTEGER milliseconds since the Unix epoch.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use oai_harvest_core::models::{
    Bitstream, Bundle, CollectionId, FieldSelector, HarvestRecord, Item, ItemId, LifecycleStage,
    MetadataValue, NewBitstream, ReviewEngine, WorkspaceItem, RESOLUTION_ORDER,
};
use oai_harvest_core::store::{
    Backend, ContentStore, HarvestRecordRepository, ReviewWorkflow, Session, StageIndex,
};
use oai_harvest_core::{HarvestError, Result};

type SharedTx = Arc<Mutex<Option<Transaction<'static, Sqlite>>>>;

/// SQLite implementation of [`Backend`].
pub struct SqliteBackend {
    pool: SqlitePool,
    engine: ReviewEngine,
    handle_prefix: String,
}

impl SqliteBackend {
    pub fn new(pool: SqlitePool, engine: ReviewEngine, handle_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            engine,
            handle_prefix: handle_prefix.into(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn begin(&self) -> Result<Box<dyn Session>> {
        let tx = self.pool.begin().await.map_err(db_err)?;
        let tx: SharedTx = Arc::new(Mutex::new(Some(tx)));
        let indexes = RESOLUTION_ORDER
            .iter()
            .map(|stage| SqliteStageIndex {
                stage: *stage,
                tx: Arc::clone(&tx),
            })
            .collect();
        Ok(Box::new(SqliteSession {
            tx,
            engine: self.engine,
            handle_prefix: self.handle_prefix.clone(),
            indexes,
        }))
    }
}

pub(crate) fn db_err(err: sqlx::Error) -> HarvestError {
    HarvestError::Persistence(err.to_string())
}

fn closed() -> HarvestError {
    HarvestError::Persistence("session already finished".to_string())
}

fn open<'a>(
    slot: &'a mut Option<Transaction<'static, Sqlite>>,
) -> Result<&'a mut SqliteConnection> {
    slot.as_mut().map(|tx| &mut **tx).ok_or_else(closed)
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Table backing a non-archive stage.
fn stage_table(stage: LifecycleStage) -> Option<&'static str> {
    match stage {
        LifecycleStage::Workspace => Some("workspace_items"),
        LifecycleStage::LegacyWorkflow => Some("workflow_items"),
        LifecycleStage::ConfigurableWorkflow => Some("xml_workflow_items"),
        LifecycleStage::Archived | LifecycleStage::Withdrawn => None,
    }
}

fn review_table(engine: ReviewEngine) -> &'static str {
    match engine {
        ReviewEngine::Legacy => "workflow_items",
        ReviewEngine::Configurable => "xml_workflow_items",
    }
}

// ── shared row helpers ──────────────────────────────────────────────────

async fn fetch_item(conn: &mut SqliteConnection, id: &ItemId) -> Result<Option<Item>> {
    let row = sqlx::query(
        "SELECT id, handle, owning_collection, in_archive, withdrawn, last_modified FROM items WHERE id = ?",
    )
    .bind(id.as_str())
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?;

    Ok(row.map(|row| Item {
        id: ItemId::from(row.get::<String, _>("id")),
        handle: row.get("handle"),
        owning_collection: row
            .get::<Option<String>, _>("owning_collection")
            .map(CollectionId::from),
        in_archive: row.get::<i64, _>("in_archive") != 0,
        withdrawn: row.get::<i64, _>("withdrawn") != 0,
        last_modified: from_millis(row.get("last_modified")),
    }))
}

async fn require_item(conn: &mut SqliteConnection, id: &ItemId) -> Result<()> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items WHERE id = ?")
        .bind(id.as_str())
        .fetch_one(&mut *conn)
        .await
        .map_err(db_err)?;
    if count > 0 {
        Ok(())
    } else {
        Err(HarvestError::NotFound(format!("item {}", id)))
    }
}

/// Delete an item and everything hanging off it, children first.
async fn purge_item(conn: &mut SqliteConnection, id: &ItemId) -> Result<()> {
    const STATEMENTS: &[&str] = &[
        "DELETE FROM bitstreams WHERE bundle_id IN (SELECT id FROM bundles WHERE item_id = ?)",
        "DELETE FROM bundles WHERE item_id = ?",
        "DELETE FROM metadata_values WHERE item_id = ?",
        "DELETE FROM harvested_items WHERE item_id = ?",
        "DELETE FROM workspace_items WHERE item_id = ?",
        "DELETE FROM workflow_items WHERE item_id = ?",
        "DELETE FROM xml_workflow_items WHERE item_id = ?",
        "DELETE FROM items WHERE id = ?",
    ];
    for statement in STATEMENTS {
        sqlx::query(statement)
            .bind(id.as_str())
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
    }
    Ok(())
}

async fn bundle_id(conn: &mut SqliteConnection, item: &ItemId, name: &str) -> Result<Option<String>> {
    sqlx::query_scalar("SELECT id FROM bundles WHERE item_id = ? AND name = ?")
        .bind(item.as_str())
        .bind(name)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)
}

async fn next_sequence(conn: &mut SqliteConnection, bundle_id: &str) -> Result<i64> {
    sqlx::query_scalar("SELECT COALESCE(MAX(sequence), 0) + 1 FROM bitstreams WHERE bundle_id = ?")
        .bind(bundle_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_err)
}

async fn mint_handle(conn: &mut SqliteConnection, prefix: &str) -> Result<String> {
    let next: i64 = sqlx::query_scalar("SELECT next_value FROM handle_sequence WHERE id = 1")
        .fetch_one(&mut *conn)
        .await
        .map_err(db_err)?;
    sqlx::query("UPDATE handle_sequence SET next_value = next_value + 1 WHERE id = 1")
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    Ok(format!("{}/{}", prefix, next))
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> HarvestRecord {
    HarvestRecord {
        item_id: ItemId::from(row.get::<String, _>("item_id")),
        remote_id: row.get("remote_id"),
        last_harvested: from_millis(row.get("last_harvested")),
    }
}

// ── session ─────────────────────────────────────────────────────────────

struct SqliteSession {
    tx: SharedTx,
    engine: ReviewEngine,
    handle_prefix: String,
    indexes: Vec<SqliteStageIndex>,
}

#[async_trait]
impl ContentStore for SqliteSession {
    async fn find_item(&self, id: &ItemId) -> Result<Option<Item>> {
        let mut guard = self.tx.lock().await;
        fetch_item(open(&mut guard)?, id).await
    }

    async fn create_workspace_item(&self, collection: &CollectionId) -> Result<WorkspaceItem> {
        let mut guard = self.tx.lock().await;
        let conn = open(&mut guard)?;

        let known: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM collections WHERE id = ?")
            .bind(collection.as_str())
            .fetch_one(&mut *conn)
            .await
            .map_err(db_err)?;
        if known == 0 {
            return Err(HarvestError::NotFound(format!("collection {}", collection)));
        }

        let item_id = ItemId::new();
        sqlx::query(
            "INSERT INTO items (id, handle, owning_collection, in_archive, withdrawn, last_modified) VALUES (?, NULL, NULL, 0, 0, ?)",
        )
        .bind(item_id.as_str())
        .bind(to_millis(Utc::now()))
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;

        let wsi = WorkspaceItem {
            id: Uuid::new_v4().to_string(),
            item_id,
            collection: collection.clone(),
        };
        sqlx::query("INSERT INTO workspace_items (id, item_id, collection_id) VALUES (?, ?, ?)")
            .bind(&wsi.id)
            .bind(wsi.item_id.as_str())
            .bind(wsi.collection.as_str())
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
        Ok(wsi)
    }

    async fn find_workspace_item(&self, item: &ItemId) -> Result<Option<WorkspaceItem>> {
        let mut guard = self.tx.lock().await;
        let row = sqlx::query("SELECT id, collection_id FROM workspace_items WHERE item_id = ?")
            .bind(item.as_str())
            .fetch_optional(open(&mut guard)?)
            .await
            .map_err(db_err)?;
        Ok(row.map(|row| WorkspaceItem {
            id: row.get("id"),
            item_id: item.clone(),
            collection: CollectionId::from(row.get::<String, _>("collection_id")),
        }))
    }

    async fn install_item(&self, wsi: &WorkspaceItem, handle: Option<&str>) -> Result<Item> {
        let mut guard = self.tx.lock().await;
        let conn = open(&mut guard)?;
        let install_err = |e: HarvestError| HarvestError::Install(e.to_string());

        let present: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM workspace_items WHERE item_id = ?")
                .bind(wsi.item_id.as_str())
                .fetch_one(&mut *conn)
                .await
                .map_err(|e| install_err(db_err(e)))?;
        if present == 0 {
            return Err(HarvestError::Install(format!(
                "item {} is not in the workspace",
                wsi.item_id
            )));
        }

        let handle = match handle {
            Some(h) => h.to_string(),
            None => mint_handle(conn, &self.handle_prefix)
                .await
                .map_err(install_err)?,
        };
        sqlx::query(
            "UPDATE items SET handle = ?, owning_collection = ?, in_archive = 1, last_modified = ? WHERE id = ?",
        )
        .bind(&handle)
        .bind(wsi.collection.as_str())
        .bind(to_millis(Utc::now()))
        .bind(wsi.item_id.as_str())
        .execute(&mut *conn)
        .await
        .map_err(|e| install_err(db_err(e)))?;

        sqlx::query("DELETE FROM workspace_items WHERE item_id = ?")
            .bind(wsi.item_id.as_str())
            .execute(&mut *conn)
            .await
            .map_err(|e| install_err(db_err(e)))?;

        debug!(item_id = %wsi.item_id, %handle, "item installed");
        fetch_item(conn, &wsi.item_id)
            .await?
            .ok_or_else(|| HarvestError::Install(format!("item {} vanished", wsi.item_id)))
    }

    async fn delete_workspace_item(&self, wsi: &WorkspaceItem) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let conn = open(&mut guard)?;
        let present: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM workspace_items WHERE item_id = ?")
                .bind(wsi.item_id.as_str())
                .fetch_one(&mut *conn)
                .await
                .map_err(db_err)?;
        if present > 0 {
            purge_item(conn, &wsi.item_id).await?;
        }
        Ok(())
    }

    async fn delete_item(&self, id: &ItemId) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let conn = open(&mut guard)?;
        require_item(conn, id).await?;
        purge_item(conn, id).await
    }

    async fn withdraw_item(&self, id: &ItemId) -> Result<Item> {
        let mut guard = self.tx.lock().await;
        let conn = open(&mut guard)?;
        require_item(conn, id).await?;
        let withdrawn = sqlx::query(
            "UPDATE items SET in_archive = 0, withdrawn = 1, last_modified = ? WHERE id = ? AND in_archive = 1",
        )
        .bind(to_millis(Utc::now()))
        .bind(id.as_str())
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
        if withdrawn.rows_affected() == 0 {
            return Err(HarvestError::Workflow(format!("item {} is not archived", id)));
        }
        info!(item_id = %id, "item withdrawn");
        fetch_item(conn, id)
            .await?
            .ok_or_else(|| HarvestError::NotFound(format!("item {}", id)))
    }

    async fn get_metadata(
        &self,
        item: &ItemId,
        selector: &FieldSelector,
    ) -> Result<Vec<MetadataValue>> {
        let mut guard = self.tx.lock().await;
        let conn = open(&mut guard)?;
        require_item(conn, item).await?;
        let rows = sqlx::query(
            "SELECT schema_name, element, qualifier, language, value FROM metadata_values WHERE item_id = ? ORDER BY id ASC",
        )
        .bind(item.as_str())
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|row| MetadataValue {
                schema: row.get("schema_name"),
                element: row.get("element"),
                qualifier: row.get("qualifier"),
                language: row.get("language"),
                value: row.get("value"),
            })
            .filter(|v| selector.matches(v))
            .collect())
    }

    async fn clear_metadata(&self, item: &ItemId, selector: &FieldSelector) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let conn = open(&mut guard)?;
        require_item(conn, item).await?;

        if selector.is_any() {
            sqlx::query("DELETE FROM metadata_values WHERE item_id = ?")
                .bind(item.as_str())
                .execute(&mut *conn)
                .await
                .map_err(db_err)?;
            return Ok(());
        }

        let rows = sqlx::query(
            "SELECT id, schema_name, element, qualifier FROM metadata_values WHERE item_id = ?",
        )
        .bind(item.as_str())
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;
        let doomed: Vec<i64> = rows
            .iter()
            .filter(|row| {
                selector.matches(&MetadataValue {
                    schema: row.get("schema_name"),
                    element: row.get("element"),
                    qualifier: row.get("qualifier"),
                    language: None,
                    value: String::new(),
                })
            })
            .map(|row| row.get("id"))
            .collect();
        for id in doomed {
            sqlx::query("DELETE FROM metadata_values WHERE id = ?")
                .bind(id)
                .execute(&mut *conn)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    async fn add_metadata(&self, item: &ItemId, value: &MetadataValue) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let conn = open(&mut guard)?;
        require_item(conn, item).await?;
        sqlx::query(
            "INSERT INTO metadata_values (item_id, schema_name, element, qualifier, language, value) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(item.as_str())
        .bind(&value.schema)
        .bind(&value.element)
        .bind(&value.qualifier)
        .bind(&value.language)
        .bind(&value.value)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn bundle_names(&self, item: &ItemId) -> Result<Vec<String>> {
        let mut guard = self.tx.lock().await;
        let conn = open(&mut guard)?;
        require_item(conn, item).await?;
        sqlx::query_scalar("SELECT name FROM bundles WHERE item_id = ? ORDER BY name ASC")
            .bind(item.as_str())
            .fetch_all(&mut *conn)
            .await
            .map_err(db_err)
    }

    async fn get_bundles(
        &self,
        item: &ItemId,
        bundle_name: Option<&str>,
    ) -> Result<Vec<(Bitstream, Bundle)>> {
        let mut guard = self.tx.lock().await;
        let conn = open(&mut guard)?;
        require_item(conn, item).await?;

        let mut sql = String::from(
            r#"
            SELECT b.id AS bundle_id, b.name AS bundle_name,
                   s.id, s.sequence, s.name, s.mime_type, s.size_bytes, s.checksum
            FROM bundles b
            JOIN bitstreams s ON s.bundle_id = b.id
            WHERE b.item_id = ?
            "#,
        );
        if bundle_name.is_some() {
            sql.push_str(" AND b.name = ?");
        }
        sql.push_str(" ORDER BY b.name ASC, s.sequence ASC");

        let mut query = sqlx::query(&sql).bind(item.as_str());
        if let Some(name) = bundle_name {
            query = query.bind(name);
        }
        let rows = query.fetch_all(&mut *conn).await.map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|row| {
                let bundle = Bundle {
                    id: row.get("bundle_id"),
                    item_id: item.clone(),
                    name: row.get("bundle_name"),
                };
                let bitstream = Bitstream {
                    id: row.get("id"),
                    bundle_id: bundle.id.clone(),
                    sequence: row.get("sequence"),
                    name: row.get("name"),
                    mime_type: row.get("mime_type"),
                    size_bytes: row.get("size_bytes"),
                    checksum: row.get("checksum"),
                };
                (bitstream, bundle)
            })
            .collect())
    }

    async fn add_bitstream(
        &self,
        item: &ItemId,
        bundle_name: &str,
        bitstream: &NewBitstream,
    ) -> Result<Bitstream> {
        let mut guard = self.tx.lock().await;
        let conn = open(&mut guard)?;
        require_item(conn, item).await?;

        let bundle = match bundle_id(conn, item, bundle_name).await? {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                sqlx::query("INSERT INTO bundles (id, item_id, name) VALUES (?, ?, ?)")
                    .bind(&id)
                    .bind(item.as_str())
                    .bind(bundle_name)
                    .execute(&mut *conn)
                    .await
                    .map_err(db_err)?;
                id
            }
        };

        let stored = Bitstream {
            id: Uuid::new_v4().to_string(),
            sequence: next_sequence(conn, &bundle).await?,
            bundle_id: bundle,
            name: bitstream.name.clone(),
            mime_type: bitstream.mime_type.clone(),
            size_bytes: bitstream.content.len() as i64,
            checksum: bitstream.checksum(),
        };
        sqlx::query(
            "INSERT INTO bitstreams (id, bundle_id, sequence, name, mime_type, size_bytes, checksum, content) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&stored.id)
        .bind(&stored.bundle_id)
        .bind(stored.sequence)
        .bind(&stored.name)
        .bind(&stored.mime_type)
        .bind(stored.size_bytes)
        .bind(&stored.checksum)
        .bind(&bitstream.content)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
        Ok(stored)
    }

    async fn remove_bundle(&self, item: &ItemId, bundle_name: &str) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let conn = open(&mut guard)?;
        require_item(conn, item).await?;
        if let Some(id) = bundle_id(conn, item, bundle_name).await? {
            sqlx::query("DELETE FROM bitstreams WHERE bundle_id = ?")
                .bind(&id)
                .execute(&mut *conn)
                .await
                .map_err(db_err)?;
            sqlx::query("DELETE FROM bundles WHERE id = ?")
                .bind(&id)
                .execute(&mut *conn)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    async fn rename_bundle(&self, item: &ItemId, from: &str, to: &str) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let conn = open(&mut guard)?;
        require_item(conn, item).await?;
        let Some(from_id) = bundle_id(conn, item, from).await? else {
            return Ok(());
        };

        match bundle_id(conn, item, to).await? {
            None => {
                sqlx::query("UPDATE bundles SET name = ? WHERE id = ?")
                    .bind(to)
                    .bind(&from_id)
                    .execute(&mut *conn)
                    .await
                    .map_err(db_err)?;
            }
            Some(to_id) => {
                let mut next = next_sequence(conn, &to_id).await?;
                let moving: Vec<String> = sqlx::query_scalar(
                    "SELECT id FROM bitstreams WHERE bundle_id = ? ORDER BY sequence ASC",
                )
                .bind(&from_id)
                .fetch_all(&mut *conn)
                .await
                .map_err(db_err)?;
                for bitstream in moving {
                    sqlx::query("UPDATE bitstreams SET bundle_id = ?, sequence = ? WHERE id = ?")
                        .bind(&to_id)
                        .bind(next)
                        .bind(&bitstream)
                        .execute(&mut *conn)
                        .await
                        .map_err(db_err)?;
                    next += 1;
                }
                sqlx::query("DELETE FROM bundles WHERE id = ?")
                    .bind(&from_id)
                    .execute(&mut *conn)
                    .await
                    .map_err(db_err)?;
            }
        }
        Ok(())
    }

    async fn touch_item(&self, item: &ItemId) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let touched = sqlx::query("UPDATE items SET last_modified = ? WHERE id = ?")
            .bind(to_millis(Utc::now()))
            .bind(item.as_str())
            .execute(open(&mut guard)?)
            .await
            .map_err(db_err)?;
        if touched.rows_affected() == 0 {
            return Err(HarvestError::NotFound(format!("item {}", item)));
        }
        Ok(())
    }
}

#[async_trait]
impl ReviewWorkflow for SqliteSession {
    async fn is_item_in_review(&self, item: &ItemId) -> Result<bool> {
        let mut guard = self.tx.lock().await;
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT (SELECT COUNT(*) FROM workflow_items WHERE item_id = ?)
                 + (SELECT COUNT(*) FROM xml_workflow_items WHERE item_id = ?)
            "#,
        )
        .bind(item.as_str())
        .bind(item.as_str())
        .fetch_one(open(&mut guard)?)
        .await
        .map_err(db_err)?;
        Ok(count > 0)
    }

    async fn start_review(&self, wsi: &WorkspaceItem) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let conn = open(&mut guard)?;
        let removed = sqlx::query("DELETE FROM workspace_items WHERE item_id = ?")
            .bind(wsi.item_id.as_str())
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
        if removed.rows_affected() == 0 {
            return Err(HarvestError::Workflow(format!(
                "item {} is not in the workspace",
                wsi.item_id
            )));
        }
        let sql = format!(
            "INSERT INTO {} (id, item_id, collection_id) VALUES (?, ?, ?)",
            review_table(self.engine)
        );
        sqlx::query(&sql)
            .bind(Uuid::new_v4().to_string())
            .bind(wsi.item_id.as_str())
            .bind(wsi.collection.as_str())
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn abort_review(&self, item: &ItemId, actor: &str) -> Result<WorkspaceItem> {
        if actor.trim().is_empty() {
            return Err(HarvestError::Workflow(
                "no actor given for review abort".to_string(),
            ));
        }
        let mut guard = self.tx.lock().await;
        let conn = open(&mut guard)?;

        let mut collection: Option<String> = None;
        for table in ["workflow_items", "xml_workflow_items"] {
            let sql = format!("SELECT collection_id FROM {} WHERE item_id = ?", table);
            let found: Option<String> = sqlx::query_scalar(&sql)
                .bind(item.as_str())
                .fetch_optional(&mut *conn)
                .await
                .map_err(db_err)?;
            if let Some(c) = found {
                let sql = format!("DELETE FROM {} WHERE item_id = ?", table);
                sqlx::query(&sql)
                    .bind(item.as_str())
                    .execute(&mut *conn)
                    .await
                    .map_err(db_err)?;
                collection = Some(c);
                break;
            }
        }
        let collection = collection
            .ok_or_else(|| HarvestError::Workflow(format!("item {} is not in review", item)))?;

        let wsi = WorkspaceItem {
            id: Uuid::new_v4().to_string(),
            item_id: item.clone(),
            collection: CollectionId::from(collection),
        };
        sqlx::query("INSERT INTO workspace_items (id, item_id, collection_id) VALUES (?, ?, ?)")
            .bind(&wsi.id)
            .bind(wsi.item_id.as_str())
            .bind(wsi.collection.as_str())
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
        info!(item_id = %item, actor, "review aborted");
        Ok(wsi)
    }
}

#[async_trait]
impl HarvestRecordRepository for SqliteSession {
    async fn record_for_item(&self, item: &ItemId) -> Result<Option<HarvestRecord>> {
        let mut guard = self.tx.lock().await;
        let row = sqlx::query(
            "SELECT item_id, remote_id, last_harvested FROM harvested_items WHERE item_id = ?",
        )
        .bind(item.as_str())
        .fetch_optional(open(&mut guard)?)
        .await
        .map_err(db_err)?;
        Ok(row.as_ref().map(record_from_row))
    }

    async fn insert_record(&self, record: &HarvestRecord) -> Result<()> {
        let mut guard = self.tx.lock().await;
        sqlx::query(
            "INSERT INTO harvested_items (item_id, remote_id, last_harvested) VALUES (?, ?, ?)",
        )
        .bind(record.item_id.as_str())
        .bind(&record.remote_id)
        .bind(to_millis(record.last_harvested))
        .execute(open(&mut guard)?)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_record(&self, record: &HarvestRecord) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let updated = sqlx::query(
            "UPDATE harvested_items SET remote_id = ?, last_harvested = ? WHERE item_id = ?",
        )
        .bind(&record.remote_id)
        .bind(to_millis(record.last_harvested))
        .bind(record.item_id.as_str())
        .execute(open(&mut guard)?)
        .await
        .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            return Err(HarvestError::Persistence(format!(
                "no harvest record for item {}",
                record.item_id
            )));
        }
        Ok(())
    }

    async fn delete_record(&self, item: &ItemId) -> Result<()> {
        let mut guard = self.tx.lock().await;
        sqlx::query("DELETE FROM harvested_items WHERE item_id = ?")
            .bind(item.as_str())
            .execute(open(&mut guard)?)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl Session for SqliteSession {
    fn stage_index(&self, stage: LifecycleStage) -> Option<&dyn StageIndex> {
        self.indexes
            .iter()
            .find(|idx| idx.stage == stage)
            .map(|idx| idx as &dyn StageIndex)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let tx = self.tx.lock().await.take().ok_or_else(closed)?;
        tx.commit().await.map_err(db_err)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let tx = self.tx.lock().await.take().ok_or_else(closed)?;
        tx.rollback().await.map_err(db_err)
    }
}

// ── stage indexes ───────────────────────────────────────────────────────

struct SqliteStageIndex {
    stage: LifecycleStage,
    tx: SharedTx,
}

#[async_trait]
impl StageIndex for SqliteStageIndex {
    fn stage(&self) -> LifecycleStage {
        self.stage
    }

    async fn find_by_item(&self, item: &ItemId) -> Result<Option<CollectionId>> {
        let sql = match stage_table(self.stage) {
            Some(table) => format!("SELECT collection_id FROM {} WHERE item_id = ?", table),
            None => {
                "SELECT owning_collection FROM items WHERE id = ? AND owning_collection IS NOT NULL"
                    .to_string()
            }
        };
        let mut guard = self.tx.lock().await;
        let found: Option<String> = sqlx::query_scalar(&sql)
            .bind(item.as_str())
            .fetch_optional(open(&mut guard)?)
            .await
            .map_err(db_err)?;
        Ok(found.map(CollectionId::from))
    }

    async fn find_by_remote_id(
        &self,
        remote_id: &str,
        collection: &CollectionId,
    ) -> Result<Option<HarvestRecord>> {
        let sql = match stage_table(self.stage) {
            Some(table) => format!(
                r#"
                SELECT h.item_id, h.remote_id, h.last_harvested
                FROM harvested_items h
                JOIN {} w ON w.item_id = h.item_id
                WHERE h.remote_id = ? AND w.collection_id = ?
                ORDER BY h.item_id ASC
                LIMIT 1
                "#,
                table
            ),
            None => r#"
                SELECT h.item_id, h.remote_id, h.last_harvested
                FROM harvested_items h
                JOIN items i ON i.id = h.item_id
                WHERE h.remote_id = ? AND i.owning_collection = ?
                ORDER BY h.item_id ASC
                LIMIT 1
                "#
            .to_string(),
        };
        let mut guard = self.tx.lock().await;
        let row = sqlx::query(&sql)
            .bind(remote_id)
            .bind(collection.as_str())
            .fetch_optional(open(&mut guard)?)
            .await
            .map_err(db_err)?;
        Ok(row.as_ref().map(record_from_row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::create_collection;
    use crate::db::connect_path;
    use crate::migrate::apply_schema;
    use tempfile::TempDir;

    async fn backend(engine: ReviewEngine) -> (TempDir, SqliteBackend, CollectionId) {
        let tmp = TempDir::new().unwrap();
        let pool = connect_path(&tmp.path().join("t.sqlite")).await.unwrap();
        apply_schema(&pool).await.unwrap();
        let collection = create_collection(&pool, "C").await.unwrap().id;
        (tmp, SqliteBackend::new(pool, engine, "1721"), collection)
    }

    #[tokio::test]
    async fn test_clear_metadata_by_selector() {
        let (_tmp, backend, collection) = backend(ReviewEngine::Legacy).await;
        let session = backend.begin().await.unwrap();
        let wsi = session.create_workspace_item(&collection).await.unwrap();
        for (field, value) in [
            ("dc.title", "T"),
            ("dc.contributor.author", "A"),
            ("dc.contributor.advisor", "B"),
            ("dc.contributor", "C"),
        ] {
            session
                .add_metadata(&wsi.item_id, &MetadataValue::new(field, value).unwrap())
                .await
                .unwrap();
        }

        session
            .clear_metadata(&wsi.item_id, &FieldSelector::parse("dc.contributor.*").unwrap())
            .await
            .unwrap();
        let left: Vec<String> = session
            .get_metadata(&wsi.item_id, &FieldSelector::any())
            .await
            .unwrap()
            .iter()
            .map(|v| v.field())
            .collect();
        assert_eq!(left, vec!["dc.title"]);
        session.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_review_round_trip_and_rollback() {
        let (_tmp, backend, collection) = backend(ReviewEngine::Legacy).await;
        let session = backend.begin().await.unwrap();
        let wsi = session.create_workspace_item(&collection).await.unwrap();
        session.start_review(&wsi).await.unwrap();
        assert!(session.is_item_in_review(&wsi.item_id).await.unwrap());
        assert!(session.find_workspace_item(&wsi.item_id).await.unwrap().is_none());

        let index = session.stage_index(LifecycleStage::LegacyWorkflow).unwrap();
        assert_eq!(
            index.find_by_item(&wsi.item_id).await.unwrap(),
            Some(collection.clone())
        );
        assert!(session.stage_index(LifecycleStage::Withdrawn).is_none());

        assert!(session.abort_review(&wsi.item_id, " ").await.is_err());
        let back = session.abort_review(&wsi.item_id, "admin").await.unwrap();
        assert_eq!(back.collection, collection);
        assert!(!session.is_item_in_review(&wsi.item_id).await.unwrap());
        session.rollback().await.unwrap();

        let session = backend.begin().await.unwrap();
        assert!(session.find_item(&wsi.item_id).await.unwrap().is_none());
        session.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_install_mints_sequential_handles() {
        let (_tmp, backend, collection) = backend(ReviewEngine::Legacy).await;
        let session = backend.begin().await.unwrap();
        let first = session.create_workspace_item(&collection).await.unwrap();
        let second = session.create_workspace_item(&collection).await.unwrap();
        let a = session.install_item(&first, None).await.unwrap();
        let b = session.install_item(&second, None).await.unwrap();
        assert_eq!(a.handle.as_deref(), Some("1721/1"));
        assert_eq!(b.handle.as_deref(), Some("1721/2"));
        assert_eq!(b.owning_collection, Some(collection));
        assert!(b.in_archive);
        assert!(session.install_item(&first, None).await.is_err());
        session.commit().await.unwrap();
    }
}
