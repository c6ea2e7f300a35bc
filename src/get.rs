//! Item inspection and harvest-binding administration.
//!
//! Backs `hvst item`, `hvst resolve`, `hvst record forget`, `hvst withdraw`
//! and `hvst delete`. Reads go through a backend session that is rolled back
//! afterwards, so inspection never writes.

use anyhow::{bail, Result};
use serde::Serialize;

use oai_harvest_core::models::{FieldSelector, HarvestRecord, Item, ItemId, MetadataValue};
use oai_harvest_core::records::HarvestRecordStore;
use oai_harvest_core::{Backend, HarvestContext, IdentityResolver};

use crate::collections;
use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteBackend;

#[derive(Debug, Clone, Serialize)]
pub struct ItemResponse {
    pub id: String,
    pub handle: Option<String>,
    pub stage: Option<String>,
    pub owning_collection: Option<String>,
    pub last_modified: String,
    pub metadata: Vec<MetadataValue>,
    pub bitstreams: Vec<BitstreamResponse>,
    pub harvest: Option<HarvestRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BitstreamResponse {
    pub bundle: String,
    pub sequence: i64,
    pub name: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub checksum: String,
}

async fn open_backend(config: &Config) -> Result<SqliteBackend> {
    let pool = db::connect(config).await?;
    Ok(SqliteBackend::new(
        pool,
        config.repository.engine()?,
        config.repository.handle_prefix.clone(),
    ))
}

/// Load an item with its metadata, bitstreams, lifecycle stage and harvest binding.
pub async fn get_item(backend: &dyn Backend, id: &str) -> Result<ItemResponse> {
    let session = backend.begin().await?;
    let item_id = ItemId::from(id);

    let Some(item) = session.find_item(&item_id).await? else {
        session.rollback().await?;
        bail!("item not found: {}", id);
    };

    let metadata = session.get_metadata(&item_id, &FieldSelector::any()).await?;
    let bitstreams = session
        .get_bundles(&item_id, None)
        .await?
        .into_iter()
        .map(|(bitstream, bundle)| BitstreamResponse {
            bundle: bundle.name,
            sequence: bitstream.sequence,
            name: bitstream.name,
            mime_type: bitstream.mime_type,
            size_bytes: bitstream.size_bytes,
            checksum: bitstream.checksum,
        })
        .collect();

    let records = HarvestRecordStore::new(session.as_ref());
    let harvest = records.find(&item_id).await?;
    let stage = records.stage_of(&item_id).await?;
    session.rollback().await?;

    Ok(ItemResponse {
        id: item.id.to_string(),
        handle: item.handle,
        stage: stage.map(|s| s.to_string()),
        owning_collection: item.owning_collection.map(|c| c.to_string()),
        last_modified: item.last_modified.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        metadata,
        bitstreams,
        harvest,
    })
}

pub async fn run_item(config: &Config, id: &str, json: bool) -> Result<()> {
    let backend = open_backend(config).await?;
    let item = get_item(&backend, id).await;
    backend.pool().close().await;
    let item = item?;

    if json {
        println!("{}", serde_json::to_string_pretty(&item)?);
        return Ok(());
    }

    println!("--- Item ---");
    println!("id:            {}", item.id);
    println!("handle:        {}", item.handle.as_deref().unwrap_or("(none)"));
    println!("stage:         {}", item.stage.as_deref().unwrap_or("(unknown)"));
    if let Some(ref c) = item.owning_collection {
        println!("collection:    {}", c);
    }
    println!("last_modified: {}", item.last_modified);
    match &item.harvest {
        Some(record) => {
            println!("remote_id:     {}", record.remote_id);
            println!(
                "harvested_at:  {}",
                record.last_harvested.format("%Y-%m-%dT%H:%M:%SZ")
            );
        }
        None => println!("remote_id:     (not harvested)"),
    }
    println!();

    println!("--- Metadata ({}) ---", item.metadata.len());
    for value in &item.metadata {
        match &value.language {
            Some(lang) => println!("{} [{}]: {}", value.field(), lang, value.value),
            None => println!("{}: {}", value.field(), value.value),
        }
    }
    println!();

    println!("--- Bitstreams ({}) ---", item.bitstreams.len());
    for b in &item.bitstreams {
        println!(
            "{}/{} {} ({}, {} bytes) sha256:{}",
            b.bundle, b.sequence, b.name, b.mime_type, b.size_bytes, b.checksum
        );
    }

    Ok(())
}

pub async fn run_resolve(config: &Config, collection: &str, remote_id: &str) -> Result<()> {
    let backend = open_backend(config).await?;
    let target = collections::resolve_collection(backend.pool(), collection).await?;

    let session = backend.begin().await?;
    let ctx = HarvestContext::new(session.as_ref(), &config.repository.admin_actor);
    let resolved = IdentityResolver::new()
        .resolve(&ctx, remote_id, &target.id)
        .await?;
    session.rollback().await?;
    backend.pool().close().await;

    match resolved {
        Some(r) => {
            println!("{} -> {} ({})", remote_id, r.item.id, r.stage);
            if let Some(handle) = r.item.handle {
                println!("  handle: {}", handle);
            }
            println!(
                "  last harvested: {}",
                r.record.last_harvested.format("%Y-%m-%dT%H:%M:%SZ")
            );
        }
        None => println!("{} is not bound to any item in {}", remote_id, target.name),
    }
    Ok(())
}

/// Delete the harvest binding for `item_id`; the item itself is kept.
pub async fn forget_record(backend: &dyn Backend, item_id: &str) -> Result<HarvestRecord> {
    let session = backend.begin().await?;
    let records = HarvestRecordStore::new(session.as_ref());
    let Some(record) = records.find(&ItemId::from(item_id)).await? else {
        session.rollback().await?;
        bail!("no harvest record for item {}", item_id);
    };
    records.delete(&record).await?;
    session.commit().await?;
    Ok(record)
}

pub async fn run_forget(config: &Config, item_id: &str) -> Result<()> {
    let backend = open_backend(config).await?;
    let result = forget_record(&backend, item_id).await;
    backend.pool().close().await;
    let record = result?;
    println!("forgot {} for item {}", record.remote_id, record.item_id);
    Ok(())
}

/// Take an archived item out of circulation. Its harvest binding stays, so
/// the next harvest of the same remote record updates it in place.
pub async fn withdraw_item(backend: &dyn Backend, item_id: &str) -> Result<Item> {
    let session = backend.begin().await?;
    let item = session.withdraw_item(&ItemId::from(item_id)).await?;
    session.commit().await?;
    Ok(item)
}

pub async fn run_withdraw(config: &Config, item_id: &str) -> Result<()> {
    let backend = open_backend(config).await?;
    let result = withdraw_item(&backend, item_id).await;
    backend.pool().close().await;
    let item = result?;
    println!(
        "withdrew {} ({})",
        item.id,
        item.handle.as_deref().unwrap_or("no handle")
    );
    Ok(())
}

/// Permanently delete an item in any stage. Its harvest binding goes with it,
/// so the next harvest of the same remote record creates a new item.
pub async fn delete_item(backend: &dyn Backend, item_id: &str) -> Result<()> {
    let session = backend.begin().await?;
    session.delete_item(&ItemId::from(item_id)).await?;
    session.commit().await?;
    Ok(())
}

pub async fn run_delete(config: &Config, item_id: &str) -> Result<()> {
    let backend = open_backend(config).await?;
    let result = delete_item(&backend, item_id).await;
    backend.pool().close().await;
    result?;
    println!("deleted {}", item_id);
    Ok(())
}
