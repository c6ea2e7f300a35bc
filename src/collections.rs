//! Target collection management.

use anyhow::{bail, Result};
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use oai_harvest_core::models::{Collection, CollectionId};

use crate::config::Config;
use crate::db;
use crate::sqlite_store::{from_millis, to_millis};

pub async fn create_collection(pool: &SqlitePool, name: &str) -> Result<Collection> {
    let name = name.trim();
    if name.is_empty() {
        bail!("Collection name must not be empty");
    }

    let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM collections WHERE name = ?")
        .bind(name)
        .fetch_one(pool)
        .await?;
    if existing > 0 {
        bail!("Collection already exists: {}", name);
    }

    let collection = Collection {
        id: CollectionId::new(),
        name: name.to_string(),
    };
    sqlx::query("INSERT INTO collections (id, name, created_at) VALUES (?, ?, ?)")
        .bind(collection.id.as_str())
        .bind(&collection.name)
        .bind(to_millis(Utc::now()))
        .execute(pool)
        .await?;
    Ok(collection)
}

/// Look up a collection by id, falling back to its unique name.
pub async fn resolve_collection(pool: &SqlitePool, key: &str) -> Result<Collection> {
    let row = sqlx::query("SELECT id, name FROM collections WHERE id = ? OR name = ? ORDER BY id = ? DESC LIMIT 1")
        .bind(key)
        .bind(key)
        .bind(key)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => Ok(Collection {
            id: CollectionId::from(row.get::<String, _>("id")),
            name: row.get("name"),
        }),
        None => bail!("Collection not found: {}", key),
    }
}

pub async fn run_create(config: &Config, name: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let collection = create_collection(&pool, name).await?;
    println!("created collection {} ({})", collection.name, collection.id);
    pool.close().await;
    Ok(())
}

pub async fn run_list(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let rows = sqlx::query(
        r#"
        SELECT c.id, c.name, c.created_at,
               (SELECT COUNT(*) FROM items i WHERE i.owning_collection = c.id) AS archived
        FROM collections c
        ORDER BY c.name ASC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    if rows.is_empty() {
        println!("No collections. Create one with: hvst collection create <name>");
    } else {
        println!("{:<38} {:<24} {:>9}  CREATED", "ID", "NAME", "ARCHIVED");
        for row in &rows {
            let id: String = row.get("id");
            let name: String = row.get("name");
            let archived: i64 = row.get("archived");
            let created = from_millis(row.get("created_at"));
            println!(
                "{:<38} {:<24} {:>9}  {}",
                id,
                name,
                archived,
                created.format("%Y-%m-%d")
            );
        }
    }

    pool.close().await;
    Ok(())
}
