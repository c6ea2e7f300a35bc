//! Identity resolution: `(remote id, collection)` to a local item.
//!
//! The resolver never returns an item held by a collection other than the
//! one asked for. The stage index already scopes the lookup; the resolver
//! re-checks the hit against the same index before trusting it.

use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{CollectionId, HarvestRecord, Item, LifecycleStage};
use crate::store::HarvestContext;

/// A local item bound to an incoming remote record.
#[derive(Debug, Clone)]
pub struct ResolvedItem {
    pub item: Item,
    pub record: HarvestRecord,
    /// Stage index that produced the match.
    pub stage: LifecycleStage,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityResolver;

impl IdentityResolver {
    pub fn new() -> Self {
        Self
    }

    pub async fn resolve(
        &self,
        ctx: &HarvestContext<'_>,
        remote_id: &str,
        collection: &CollectionId,
    ) -> Result<Option<ResolvedItem>> {
        let records = ctx.records();
        let Some((record, stage)) = records.find_with_stage(remote_id, collection).await? else {
            debug!(remote_id, %collection, "no local item bound");
            return Ok(None);
        };

        let session = ctx.session();
        let holder = match session.stage_index(stage) {
            Some(index) => index.find_by_item(&record.item_id).await?,
            None => None,
        };
        if holder.as_ref() != Some(collection) {
            warn!(
                remote_id,
                %collection,
                item = %record.item_id,
                "stage index returned an item outside the requested collection; ignoring"
            );
            return Ok(None);
        }

        match session.find_item(&record.item_id).await? {
            Some(item) => {
                debug!(remote_id, %collection, %stage, item = %item.id, "resolved local item");
                Ok(Some(ResolvedItem {
                    item,
                    record,
                    stage,
                }))
            }
            None => {
                warn!(
                    remote_id,
                    item = %record.item_id,
                    "harvest record points at a missing item"
                );
                Ok(None)
            }
        }
    }
}
