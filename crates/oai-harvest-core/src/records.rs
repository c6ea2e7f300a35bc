//! Harvest record store: remote-to-local identity bindings.
//!
//! A [`HarvestRecord`] is keyed by local item id. The remote id is only
//! unique within a target collection, so lookups by remote id go through
//! the per-stage indexes of the session, in [`RESOLUTION_ORDER`].

use tracing::trace;

use crate::error::{HarvestError, Result};
use crate::models::{CollectionId, HarvestRecord, ItemId, LifecycleStage, RESOLUTION_ORDER};
use crate::store::Session;

/// Session-scoped view over harvest records.
#[derive(Clone, Copy)]
pub struct HarvestRecordStore<'a> {
    session: &'a dyn Session,
}

impl<'a> HarvestRecordStore<'a> {
    pub fn new(session: &'a dyn Session) -> Self {
        Self { session }
    }

    pub async fn find(&self, item: &ItemId) -> Result<Option<HarvestRecord>> {
        self.session.record_for_item(item).await
    }

    /// First record bound to `remote_id` for an item held in `collection`.
    ///
    /// Stages are tried archived, legacy workflow, workspace, configurable
    /// workflow; the first hit wins.
    pub async fn find_by_remote_id(
        &self,
        remote_id: &str,
        collection: &CollectionId,
    ) -> Result<Option<HarvestRecord>> {
        Ok(self
            .find_with_stage(remote_id, collection)
            .await?
            .map(|(record, _)| record))
    }

    /// Like [`find_by_remote_id`](Self::find_by_remote_id), also reporting
    /// which stage index produced the match.
    pub async fn find_with_stage(
        &self,
        remote_id: &str,
        collection: &CollectionId,
    ) -> Result<Option<(HarvestRecord, LifecycleStage)>> {
        for stage in RESOLUTION_ORDER {
            let Some(index) = self.session.stage_index(stage) else {
                continue;
            };
            if let Some(record) = index.find_by_remote_id(remote_id, collection).await? {
                trace!(remote_id, %collection, %stage, item = %record.item_id, "harvest record hit");
                return Ok(Some((record, stage)));
            }
        }
        Ok(None)
    }

    pub async fn create(&self, item: &ItemId, remote_id: &str) -> Result<HarvestRecord> {
        let record = HarvestRecord::new(item.clone(), remote_id);
        self.session.insert_record(&record).await?;
        Ok(record)
    }

    pub async fn update(&self, record: &HarvestRecord) -> Result<()> {
        self.session
            .update_record(record)
            .await
            .map_err(as_persistence)
    }

    pub async fn delete(&self, record: &HarvestRecord) -> Result<()> {
        self.session
            .delete_record(&record.item_id)
            .await
            .map_err(as_persistence)
    }

    /// Lifecycle stage the item currently occupies, if it still exists.
    pub async fn stage_of(&self, item: &ItemId) -> Result<Option<LifecycleStage>> {
        for stage in RESOLUTION_ORDER {
            let Some(index) = self.session.stage_index(stage) else {
                continue;
            };
            if index.find_by_item(item).await?.is_some() {
                if stage == LifecycleStage::Archived {
                    let withdrawn = self
                        .session
                        .find_item(item)
                        .await?
                        .map(|i| i.withdrawn)
                        .unwrap_or(false);
                    if withdrawn {
                        return Ok(Some(LifecycleStage::Withdrawn));
                    }
                }
                return Ok(Some(stage));
            }
        }
        Ok(None)
    }
}

fn as_persistence(err: HarvestError) -> HarvestError {
    match err {
        HarvestError::Persistence(_) => err,
        other => HarvestError::Persistence(other.to_string()),
    }
}
