//! Ingestion workflows: where new items land and how updates are finalized.
//!
//! The pipeline calls these hooks at fixed points:
//!
//! - `pre_create` before the workspace item is built (may redirect the target collection),
//! - `post_create` once metadata and content are in place (installs the item),
//! - `pre_update` before the remover runs (may hand back a different item),
//! - `update_bitstreams` to decide whether incoming files replace current ones,
//! - `post_update` after bitstreams are settled.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{HarvestError, Result};
use crate::models::{
    CollectionId, HarvestRecord, IncomingRecord, Item, ResourceMap, WorkspaceItem,
};
use crate::store::HarvestContext;

#[async_trait]
pub trait IngestionWorkflow: Send + Sync {
    fn name(&self) -> &str;

    /// Collection the new item should actually be created in.
    async fn pre_create(
        &self,
        _ctx: &HarvestContext<'_>,
        collection: &CollectionId,
        _record: &IncomingRecord,
    ) -> Result<CollectionId> {
        Ok(collection.clone())
    }

    /// Item the update should mutate. Need not be `item`.
    async fn pre_update(
        &self,
        _ctx: &HarvestContext<'_>,
        item: Item,
        _collection: &CollectionId,
        _record: &HarvestRecord,
        _incoming: &IncomingRecord,
    ) -> Result<Item> {
        Ok(item)
    }

    async fn post_update(&self, _ctx: &HarvestContext<'_>, _item: &Item) -> Result<()> {
        Ok(())
    }

    /// Move the populated workspace item to its destination stage.
    async fn post_create(
        &self,
        ctx: &HarvestContext<'_>,
        wsi: &WorkspaceItem,
        handle: Option<&str>,
    ) -> Result<Item>;

    async fn update_bitstreams(
        &self,
        ctx: &HarvestContext<'_>,
        item: &Item,
        record: &HarvestRecord,
        map: &ResourceMap,
    ) -> Result<bool>;
}

/// Installs new items straight into the archive.
#[derive(Debug, Clone, Default)]
pub struct ArchiveIngestionWorkflow {
    compare_checksums: bool,
}

impl ArchiveIngestionWorkflow {
    pub fn new(compare_checksums: bool) -> Self {
        Self { compare_checksums }
    }
}

#[async_trait]
impl IngestionWorkflow for ArchiveIngestionWorkflow {
    fn name(&self) -> &str {
        "archive"
    }

    async fn post_create(
        &self,
        ctx: &HarvestContext<'_>,
        wsi: &WorkspaceItem,
        handle: Option<&str>,
    ) -> Result<Item> {
        let session = ctx.session();
        match session.install_item(wsi, handle).await {
            Ok(item) => {
                info!(item = %item.id, handle = item.handle.as_deref().unwrap_or(""), "installed item");
                Ok(item)
            }
            Err(err) => {
                warn!(item = %wsi.item_id, error = %err, "install failed, deleting workspace item");
                session.delete_workspace_item(wsi).await?;
                Err(match err {
                    HarvestError::Install(_) => err,
                    other => HarvestError::Install(other.to_string()),
                })
            }
        }
    }

    async fn update_bitstreams(
        &self,
        ctx: &HarvestContext<'_>,
        item: &Item,
        _record: &HarvestRecord,
        map: &ResourceMap,
    ) -> Result<bool> {
        content_changed(ctx, item, map, self.compare_checksums).await
    }
}

/// Sends new items into review; restarts review when a reviewed item is updated.
#[derive(Debug, Clone, Default)]
pub struct ReviewIngestionWorkflow {
    compare_checksums: bool,
}

impl ReviewIngestionWorkflow {
    pub fn new(compare_checksums: bool) -> Self {
        Self { compare_checksums }
    }
}

#[async_trait]
impl IngestionWorkflow for ReviewIngestionWorkflow {
    fn name(&self) -> &str {
        "review"
    }

    async fn post_create(
        &self,
        ctx: &HarvestContext<'_>,
        wsi: &WorkspaceItem,
        _handle: Option<&str>,
    ) -> Result<Item> {
        let session = ctx.session();
        session.start_review(wsi).await?;
        info!(item = %wsi.item_id, "submitted item to review");
        session
            .find_item(&wsi.item_id)
            .await?
            .ok_or_else(|| HarvestError::NotFound(format!("item {}", wsi.item_id)))
    }

    async fn post_update(&self, ctx: &HarvestContext<'_>, item: &Item) -> Result<()> {
        let session = ctx.session();
        if session.is_item_in_review(&item.id).await? {
            let wsi = session.abort_review(&item.id, ctx.actor()).await?;
            session.start_review(&wsi).await?;
            info!(item = %item.id, "restarted review after update");
        } else if let Some(wsi) = session.find_workspace_item(&item.id).await? {
            session.start_review(&wsi).await?;
            info!(item = %item.id, "submitted updated workspace item to review");
        }
        Ok(())
    }

    async fn update_bitstreams(
        &self,
        ctx: &HarvestContext<'_>,
        item: &Item,
        _record: &HarvestRecord,
        map: &ResourceMap,
    ) -> Result<bool> {
        content_changed(ctx, item, map, self.compare_checksums).await
    }
}

/// Whether the incoming files differ from what the item holds in the targeted bundles.
async fn content_changed(
    ctx: &HarvestContext<'_>,
    item: &Item,
    map: &ResourceMap,
    compare_checksums: bool,
) -> Result<bool> {
    if !compare_checksums {
        return Ok(true);
    }
    let targeted = map.bundle_names();
    let current: BTreeSet<(String, String, String)> = ctx
        .session()
        .get_bundles(&item.id, None)
        .await?
        .into_iter()
        .filter(|(_, bundle)| targeted.contains(bundle.name.as_str()))
        .map(|(bs, bundle)| (bundle.name, bs.name, bs.checksum))
        .collect();
    let incoming: BTreeSet<(String, String, String)> = map
        .resources
        .iter()
        .map(|r| (r.bundle.clone(), r.name.clone(), r.checksum()))
        .collect();
    let changed = current != incoming;
    debug!(item = %item.id, changed, "compared bitstream checksums");
    Ok(changed)
}
