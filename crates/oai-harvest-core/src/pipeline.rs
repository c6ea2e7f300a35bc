//! The ingestion state machine.
//!
//! ```text
//! START ─▶ FILTERING ─┬─▶ REJECTED
//!   │                 └─▶ UPDATING ─▶ UPDATED
//!   └────▶ CREATING ─▶ CREATED
//!               any step ─▶ FAILED
//! ```
//!
//! One [`Harvester::ingest`] call is one unit of work: it opens a session,
//! commits it on `Created`/`Updated` and rolls it back on `Failed`, so a
//! failed record leaves the store exactly as it was.

use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;

use tracing::{debug, error, info, warn};

use crate::error::{HarvestError, Result};
use crate::models::{
    Bitstream, CollectionId, FieldSelector, IncomingRecord, Item, ItemId, MetadataValue,
    ResourceMap, WorkspaceItem,
};
use crate::resolver::{IdentityResolver, ResolvedItem};
use crate::store::{Backend, HarvestContext, Session};
use crate::traits::{
    AcceptAllFilter, AccessPolicyHook, BundleVersioningStrategy, IngestFilter, MetadataRemover,
};
use crate::workflow::IngestionWorkflow;

/// States a single ingest passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IngestState {
    Start,
    Filtering,
    Rejected,
    Creating,
    Updating,
    Created,
    Updated,
    Failed,
}

impl IngestState {
    pub fn as_str(self) -> &'static str {
        match self {
            IngestState::Start => "start",
            IngestState::Filtering => "filtering",
            IngestState::Rejected => "rejected",
            IngestState::Creating => "creating",
            IngestState::Updating => "updating",
            IngestState::Created => "created",
            IngestState::Updated => "updated",
            IngestState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            IngestState::Rejected | IngestState::Created | IngestState::Updated | IngestState::Failed
        )
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: IngestState) -> bool {
        use IngestState::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Start, Filtering)
                | (Start, Creating)
                | (Filtering, Rejected)
                | (Filtering, Updating)
                | (Filtering, Creating)
                | (Creating, Created)
                | (Updating, Updated)
                | (_, Failed)
        )
    }
}

impl fmt::Display for IngestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to one incoming record.
#[derive(Debug)]
pub enum IngestOutcome {
    Created(ItemId),
    Updated(ItemId),
    /// The ingest filter declined the record; nothing was mutated.
    Rejected,
    Failed(HarvestError),
}

impl IngestOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            IngestOutcome::Created(_) => "created",
            IngestOutcome::Updated(_) => "updated",
            IngestOutcome::Rejected => "rejected",
            IngestOutcome::Failed(_) => "failed",
        }
    }

    pub fn item_id(&self) -> Option<&ItemId> {
        match self {
            IngestOutcome::Created(id) | IngestOutcome::Updated(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, IngestOutcome::Failed(_))
    }

    fn terminal_state(&self) -> IngestState {
        match self {
            IngestOutcome::Created(_) => IngestState::Created,
            IngestOutcome::Updated(_) => IngestState::Updated,
            IngestOutcome::Rejected => IngestState::Rejected,
            IngestOutcome::Failed(_) => IngestState::Failed,
        }
    }
}

/// Outcome plus the states visited on the way there.
#[derive(Debug)]
pub struct IngestReport {
    pub outcome: IngestOutcome,
    pub states: Vec<IngestState>,
}

/// Pipeline policy switches.
#[derive(Debug, Clone)]
pub struct HarvestOptions {
    /// Run the ingest filter for records that resolve to no local item.
    pub filter_on_create: bool,
    /// Advance the harvest timestamp of records the filter rejects.
    pub record_rejected: bool,
    /// Identity used for review aborts.
    pub actor: String,
    /// Fields carried over from the existing item when the incoming record lacks them.
    pub preserve_fields: Vec<FieldSelector>,
}

impl Default for HarvestOptions {
    fn default() -> Self {
        Self {
            filter_on_create: false,
            record_rejected: false,
            actor: "harvester".to_string(),
            preserve_fields: Vec::new(),
        }
    }
}

struct StateTrace<'r> {
    remote_id: &'r str,
    state: IngestState,
    visited: Vec<IngestState>,
}

impl<'r> StateTrace<'r> {
    fn new(remote_id: &'r str) -> Self {
        Self {
            remote_id,
            state: IngestState::Start,
            visited: vec![IngestState::Start],
        }
    }

    fn advance(&mut self, next: IngestState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal ingest transition {} -> {}",
            self.state,
            next
        );
        debug!(remote_id = self.remote_id, from = %self.state, to = %next, "ingest transition");
        self.state = next;
        self.visited.push(next);
    }
}

enum Settle {
    Commit(IngestOutcome),
    Discard(IngestOutcome),
}

/// Releases an in-flight claim when dropped.
struct InFlight<'h> {
    registry: &'h Mutex<HashSet<(String, CollectionId)>>,
    key: (String, CollectionId),
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.registry.lock() {
            set.remove(&self.key);
        }
    }
}

/// Applies incoming records to a backend through the configured extension points.
pub struct Harvester {
    resolver: IdentityResolver,
    filter: Box<dyn IngestFilter>,
    metadata_remover: Option<Box<dyn MetadataRemover>>,
    bundle_versioning: Option<Box<dyn BundleVersioningStrategy>>,
    workflow: Box<dyn IngestionWorkflow>,
    policy_hook: Option<Box<dyn AccessPolicyHook>>,
    options: HarvestOptions,
    in_flight: Mutex<HashSet<(String, CollectionId)>>,
}

impl Harvester {
    /// A harvester with the accept-all filter and pipeline-default remover and versioning.
    pub fn new(workflow: Box<dyn IngestionWorkflow>) -> Self {
        Self {
            resolver: IdentityResolver::new(),
            filter: Box::new(AcceptAllFilter),
            metadata_remover: None,
            bundle_versioning: None,
            workflow,
            policy_hook: None,
            options: HarvestOptions::default(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_filter(mut self, filter: Box<dyn IngestFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_metadata_remover(mut self, remover: Box<dyn MetadataRemover>) -> Self {
        self.metadata_remover = Some(remover);
        self
    }

    pub fn with_bundle_versioning(mut self, strategy: Box<dyn BundleVersioningStrategy>) -> Self {
        self.bundle_versioning = Some(strategy);
        self
    }

    pub fn with_policy_hook(mut self, hook: Box<dyn AccessPolicyHook>) -> Self {
        self.policy_hook = Some(hook);
        self
    }

    pub fn with_options(mut self, options: HarvestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &HarvestOptions {
        &self.options
    }

    /// Names of the active filter, remover, versioning strategy and workflow.
    pub fn describe(&self) -> String {
        format!(
            "filter={} remover={} versioning={} workflow={}",
            self.filter.name(),
            self.metadata_remover
                .as_ref()
                .map_or("default", |r| r.name()),
            self.bundle_versioning
                .as_ref()
                .map_or("default", |v| v.name()),
            self.workflow.name()
        )
    }

    /// Resolve, then create or update the local item for `record` in `collection`.
    pub async fn ingest(
        &self,
        backend: &dyn Backend,
        collection: &CollectionId,
        record: &IncomingRecord,
    ) -> IngestOutcome {
        self.ingest_with_report(backend, collection, record)
            .await
            .outcome
    }

    pub async fn ingest_with_report(
        &self,
        backend: &dyn Backend,
        collection: &CollectionId,
        record: &IncomingRecord,
    ) -> IngestReport {
        let mut trace = StateTrace::new(&record.remote_id);
        let outcome = match self.run(backend, collection, record, &mut trace).await {
            Ok(outcome) => {
                if let Some(id) = outcome.item_id() {
                    info!(
                        remote_id = %record.remote_id,
                        %collection,
                        item_id = %id,
                        outcome = outcome.label(),
                        "ingested record"
                    );
                } else {
                    info!(remote_id = %record.remote_id, %collection, outcome = outcome.label(), "ingest filter rejected record");
                }
                outcome
            }
            Err(err) => {
                trace.advance(IngestState::Failed);
                warn!(
                    remote_id = %record.remote_id,
                    %collection,
                    kind = %err.kind(),
                    error = %err,
                    "ingest failed"
                );
                IngestOutcome::Failed(err)
            }
        };
        IngestReport {
            outcome,
            states: trace.visited,
        }
    }

    fn claim(&self, remote_id: &str, collection: &CollectionId) -> Result<InFlight<'_>> {
        let key = (remote_id.to_string(), collection.clone());
        let mut set = self
            .in_flight
            .lock()
            .map_err(|_| HarvestError::Persistence("in-flight registry poisoned".to_string()))?;
        if !set.insert(key.clone()) {
            return Err(HarvestError::Busy {
                remote_id: remote_id.to_string(),
                collection: collection.to_string(),
            });
        }
        Ok(InFlight {
            registry: &self.in_flight,
            key,
        })
    }

    async fn run(
        &self,
        backend: &dyn Backend,
        collection: &CollectionId,
        record: &IncomingRecord,
        trace: &mut StateTrace<'_>,
    ) -> Result<IngestOutcome> {
        let _claim = self.claim(&record.remote_id, collection)?;
        let session = backend.begin().await?;
        let settled = self
            .apply(session.as_ref(), collection, record, trace)
            .await;
        match settled {
            Ok(Settle::Commit(outcome)) => {
                session.commit().await?;
                trace.advance(outcome.terminal_state());
                Ok(outcome)
            }
            Ok(Settle::Discard(outcome)) => {
                session.rollback().await?;
                trace.advance(outcome.terminal_state());
                Ok(outcome)
            }
            Err(err) => {
                if let Err(rollback) = session.rollback().await {
                    error!(remote_id = %record.remote_id, error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn apply(
        &self,
        session: &dyn Session,
        collection: &CollectionId,
        record: &IncomingRecord,
        trace: &mut StateTrace<'_>,
    ) -> Result<Settle> {
        let ctx = HarvestContext::new(session, &self.options.actor);
        let resolved = self
            .resolver
            .resolve(&ctx, &record.remote_id, collection)
            .await?;

        match resolved {
            None => {
                if self.options.filter_on_create {
                    trace.advance(IngestState::Filtering);
                    if !self.accept(record).await? {
                        return Ok(Settle::Discard(IngestOutcome::Rejected));
                    }
                }
                trace.advance(IngestState::Creating);
                let id = self.create(&ctx, collection, record).await?;
                Ok(Settle::Commit(IngestOutcome::Created(id)))
            }
            Some(found) => {
                trace.advance(IngestState::Filtering);
                if !self.accept(record).await? {
                    if self.options.record_rejected {
                        let mut seen = found.record;
                        seen.set_harvest_date(None);
                        ctx.records().update(&seen).await?;
                        return Ok(Settle::Commit(IngestOutcome::Rejected));
                    }
                    return Ok(Settle::Discard(IngestOutcome::Rejected));
                }
                trace.advance(IngestState::Updating);
                let id = self.update(&ctx, collection, found, record).await?;
                Ok(Settle::Commit(IngestOutcome::Updated(id)))
            }
        }
    }

    async fn accept(&self, record: &IncomingRecord) -> Result<bool> {
        self.filter
            .accept_ingest(&record.metadata, record.resource_map.as_ref())
            .await
            .map_err(|err| match err {
                HarvestError::FilterEvaluation(_) => err,
                other => HarvestError::FilterEvaluation(other.to_string()),
            })
    }

    // ── create path ────────────────────────────────────────────────────

    async fn create(
        &self,
        ctx: &HarvestContext<'_>,
        collection: &CollectionId,
        record: &IncomingRecord,
    ) -> Result<ItemId> {
        let target = self.workflow.pre_create(ctx, collection, record).await?;
        let wsi = ctx.session().create_workspace_item(&target).await?;
        debug!(remote_id = %record.remote_id, item_id = %wsi.item_id, "created workspace item");

        let populated = self.populate_and_install(ctx, &wsi, record).await;
        let item = match populated {
            Ok(item) => item,
            Err(err) => {
                discard_workspace_item(ctx, &wsi).await;
                return Err(err);
            }
        };
        ctx.records().create(&item.id, &record.remote_id).await?;
        Ok(item.id)
    }

    async fn populate_and_install(
        &self,
        ctx: &HarvestContext<'_>,
        wsi: &WorkspaceItem,
        record: &IncomingRecord,
    ) -> Result<Item> {
        let session = ctx.session();
        write_metadata(session, &wsi.item_id, &record.metadata).await?;
        let attached = match &record.resource_map {
            Some(map) => attach_resources(session, &wsi.item_id, map).await?,
            None => Vec::new(),
        };
        let item = self
            .workflow
            .post_create(ctx, wsi, record.handle.as_deref())
            .await?;
        self.notify_policy(ctx, &item, &attached).await?;
        Ok(item)
    }

    // ── update path ────────────────────────────────────────────────────

    async fn update(
        &self,
        ctx: &HarvestContext<'_>,
        collection: &CollectionId,
        found: ResolvedItem,
        incoming: &IncomingRecord,
    ) -> Result<ItemId> {
        let session = ctx.session();
        let ResolvedItem {
            item,
            mut record,
            stage,
        } = found;
        debug!(item_id = %item.id, %stage, "updating resolved item");

        let item = self
            .workflow
            .pre_update(ctx, item, collection, &record, incoming)
            .await?;

        let preserved = self.snapshot_preserved(session, &item.id).await?;
        match &self.metadata_remover {
            Some(remover) => remover.clear_metadata(ctx, &item).await?,
            None => session
                .clear_metadata(&item.id, &FieldSelector::any())
                .await
                .map_err(|e| e.into_harvesting("clearing metadata"))?,
        }
        write_metadata(session, &item.id, &incoming.metadata).await?;
        self.restore_preserved(session, &item.id, preserved).await?;

        if let Some(map) = &incoming.resource_map {
            if self
                .workflow
                .update_bitstreams(ctx, &item, &record, map)
                .await?
            {
                match &self.bundle_versioning {
                    Some(strategy) => strategy.version_bundles(ctx, &item).await?,
                    None => {
                        for name in map.bundle_names() {
                            session
                                .remove_bundle(&item.id, name)
                                .await
                                .map_err(|e| e.into_harvesting("replacing bundle"))?;
                        }
                    }
                }
                let attached = attach_resources(session, &item.id, map).await?;
                self.notify_policy(ctx, &item, &attached).await?;
            } else {
                debug!(item_id = %item.id, "bitstreams unchanged, keeping current content");
            }
        }

        self.workflow.post_update(ctx, &item).await?;
        session.touch_item(&item.id).await?;

        let records = ctx.records();
        if item.id != record.item_id {
            info!(from = %record.item_id, to = %item.id, "rebinding harvest record");
            records.delete(&record).await?;
            record = records.create(&item.id, &record.remote_id).await?;
        }
        record.set_harvest_date(None);
        records.update(&record).await?;
        Ok(item.id)
    }

    async fn snapshot_preserved(
        &self,
        session: &dyn Session,
        item: &ItemId,
    ) -> Result<Vec<(FieldSelector, Vec<MetadataValue>)>> {
        let mut kept = Vec::with_capacity(self.options.preserve_fields.len());
        for selector in &self.options.preserve_fields {
            let values = session.get_metadata(item, selector).await?;
            if !values.is_empty() {
                kept.push((selector.clone(), values));
            }
        }
        Ok(kept)
    }

    async fn restore_preserved(
        &self,
        session: &dyn Session,
        item: &ItemId,
        preserved: Vec<(FieldSelector, Vec<MetadataValue>)>,
    ) -> Result<()> {
        for (selector, values) in preserved {
            if session.get_metadata(item, &selector).await?.is_empty() {
                debug!(item_id = %item, field = %selector, "restoring preserved field");
                write_metadata(session, item, &values).await?;
            }
        }
        Ok(())
    }

    async fn notify_policy(
        &self,
        ctx: &HarvestContext<'_>,
        item: &Item,
        attached: &[Bitstream],
    ) -> Result<()> {
        match &self.policy_hook {
            Some(hook) if !attached.is_empty() => hook
                .bitstreams_updated(ctx, item, attached)
                .await
                .map_err(|e| e.into_harvesting("applying access policy")),
            _ => Ok(()),
        }
    }
}

async fn write_metadata(
    session: &dyn Session,
    item: &ItemId,
    values: &[MetadataValue],
) -> Result<()> {
    for value in values {
        session.add_metadata(item, value).await?;
    }
    Ok(())
}

async fn attach_resources(
    session: &dyn Session,
    item: &ItemId,
    map: &ResourceMap,
) -> Result<Vec<Bitstream>> {
    let mut attached = Vec::with_capacity(map.resources.len());
    for resource in &map.resources {
        let bitstream = session
            .add_bitstream(item, &resource.bundle, &resource.to_new_bitstream())
            .await?;
        attached.push(bitstream);
    }
    Ok(attached)
}

/// Remove a partially built workspace item. Runs before the create error propagates.
///
/// Cleanup failures are only logged: the caller rolls the session back on
/// that error, which discards the workspace item anyway.
async fn discard_workspace_item(ctx: &HarvestContext<'_>, wsi: &WorkspaceItem) {
    let session = ctx.session();
    match session.find_workspace_item(&wsi.item_id).await {
        Ok(Some(current)) => {
            if let Err(err) = session.delete_workspace_item(&current).await {
                error!(item_id = %wsi.item_id, error = %err, "failed to delete orphaned workspace item");
            } else {
                debug!(item_id = %wsi.item_id, "deleted orphaned workspace item");
            }
        }
        Ok(None) => {}
        Err(err) => {
            error!(item_id = %wsi.item_id, error = %err, "could not look up workspace item for cleanup");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use IngestState::*;
        assert!(Start.can_transition_to(Filtering));
        assert!(Start.can_transition_to(Creating));
        assert!(Filtering.can_transition_to(Rejected));
        assert!(Updating.can_transition_to(Failed));
        assert!(!Start.can_transition_to(Updating));
        assert!(!Creating.can_transition_to(Updated));
        assert!(!Created.can_transition_to(Failed));
        assert!(!Rejected.can_transition_to(Updating));
    }

    #[test]
    fn test_outcome_labels() {
        let id = ItemId::from("i1");
        assert_eq!(IngestOutcome::Created(id.clone()).label(), "created");
        assert_eq!(IngestOutcome::Updated(id.clone()).item_id(), Some(&id));
        assert!(IngestOutcome::Rejected.item_id().is_none());
        assert!(IngestOutcome::Failed(HarvestError::Install("x".into())).is_failed());
    }
}
