//! Storage abstraction for OAI Harvest.
//!
//! The pipeline never touches a database directly. A [`Backend`] opens a
//! [`Session`], one unit of work that bundles every narrow operation the
//! pipeline consumes:
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`ContentStore`] | Items, workspace items, metadata fields, bundles, bitstreams |
//! | [`ReviewWorkflow`] | Review state queries and start/abort |
//! | [`StageIndex`] | Per-lifecycle-stage lookups used for identity resolution |
//! | [`HarvestRecordRepository`] | Raw harvest record rows |
//!
//! Everything written through a session becomes visible to other sessions
//! only after [`Session::commit`]; [`Session::rollback`] (or dropping the
//! session) discards it.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    Bitstream, Bundle, CollectionId, FieldSelector, HarvestRecord, Item, ItemId, LifecycleStage,
    MetadataValue, NewBitstream, WorkspaceItem,
};
use crate::records::HarvestRecordStore;

/// Item-level reads and writes against the content store.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn find_item(&self, id: &ItemId) -> Result<Option<Item>>;

    /// Create an empty item wrapped in a workspace item for `collection`.
    async fn create_workspace_item(&self, collection: &CollectionId) -> Result<WorkspaceItem>;

    async fn find_workspace_item(&self, item: &ItemId) -> Result<Option<WorkspaceItem>>;

    /// Move a workspace item into the archive.
    ///
    /// Fails with [`HarvestError::Install`](crate::HarvestError::Install).
    /// A handle is minted when `handle` is `None`.
    async fn install_item(&self, wsi: &WorkspaceItem, handle: Option<&str>) -> Result<Item>;

    /// Delete a workspace item together with the item it wraps.
    async fn delete_workspace_item(&self, wsi: &WorkspaceItem) -> Result<()>;

    /// Permanently delete an item in any stage, including its harvest record.
    async fn delete_item(&self, id: &ItemId) -> Result<()>;

    /// Take an archived item out of circulation. It keeps its owning
    /// collection, so the archived index still finds it.
    async fn withdraw_item(&self, id: &ItemId) -> Result<Item>;

    /// Metadata values matching `selector`, in insertion order.
    async fn get_metadata(
        &self,
        item: &ItemId,
        selector: &FieldSelector,
    ) -> Result<Vec<MetadataValue>>;

    async fn clear_metadata(&self, item: &ItemId, selector: &FieldSelector) -> Result<()>;

    async fn add_metadata(&self, item: &ItemId, value: &MetadataValue) -> Result<()>;

    /// Names of every bundle on the item, empty ones included, sorted.
    async fn bundle_names(&self, item: &ItemId) -> Result<Vec<String>>;

    /// `(bitstream, bundle)` pairs for the item, optionally restricted to one bundle name.
    ///
    /// Ordered by bundle name, then bitstream sequence.
    async fn get_bundles(
        &self,
        item: &ItemId,
        bundle_name: Option<&str>,
    ) -> Result<Vec<(Bitstream, Bundle)>>;

    /// Append a bitstream to the named bundle, creating the bundle if needed.
    async fn add_bitstream(
        &self,
        item: &ItemId,
        bundle_name: &str,
        bitstream: &NewBitstream,
    ) -> Result<Bitstream>;

    /// Remove a bundle and all its bitstreams. Missing bundles are ignored.
    async fn remove_bundle(&self, item: &ItemId, bundle_name: &str) -> Result<()>;

    /// Rename a bundle; when `to` already exists the bitstreams are appended to it.
    async fn rename_bundle(&self, item: &ItemId, from: &str, to: &str) -> Result<()>;

    /// Persist pending changes to the item and bump its last-modified time.
    async fn touch_item(&self, item: &ItemId) -> Result<()>;
}

/// The review/approval workflow collaborator.
///
/// Both engines are queried; [`start_review`](ReviewWorkflow::start_review)
/// uses whichever engine the backend was configured with.
#[async_trait]
pub trait ReviewWorkflow: Send + Sync {
    async fn is_item_in_review(&self, item: &ItemId) -> Result<bool>;

    /// Submit a workspace item to review.
    async fn start_review(&self, wsi: &WorkspaceItem) -> Result<()>;

    /// Pull an item out of review and back into the workspace.
    async fn abort_review(&self, item: &ItemId, actor: &str) -> Result<WorkspaceItem>;
}

/// Lookups against the store backing one lifecycle stage.
#[async_trait]
pub trait StageIndex: Send + Sync {
    fn stage(&self) -> LifecycleStage;

    /// Collection that holds `item` in this stage, if the item lives here.
    async fn find_by_item(&self, item: &ItemId) -> Result<Option<CollectionId>>;

    /// Harvest record bound to `remote_id` for an item held here in `collection`.
    async fn find_by_remote_id(
        &self,
        remote_id: &str,
        collection: &CollectionId,
    ) -> Result<Option<HarvestRecord>>;
}

/// Raw access to harvest record rows, keyed by local item id.
#[async_trait]
pub trait HarvestRecordRepository: Send + Sync {
    async fn record_for_item(&self, item: &ItemId) -> Result<Option<HarvestRecord>>;

    async fn insert_record(&self, record: &HarvestRecord) -> Result<()>;

    async fn update_record(&self, record: &HarvestRecord) -> Result<()>;

    async fn delete_record(&self, item: &ItemId) -> Result<()>;
}

/// One unit of work against a backend.
#[async_trait]
pub trait Session: ContentStore + ReviewWorkflow + HarvestRecordRepository {
    /// Index for `stage`. Withdrawn items are covered by the archived index,
    /// so `Withdrawn` yields `None`.
    fn stage_index(&self, stage: LifecycleStage) -> Option<&dyn StageIndex>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Factory for sessions.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Session>>;
}

/// Execution context threaded through one `ingest` call.
///
/// Borrows the session for its lifetime; every extension point receives it
/// by reference instead of reaching for shared state.
pub struct HarvestContext<'a> {
    session: &'a dyn Session,
    actor: &'a str,
}

impl<'a> HarvestContext<'a> {
    pub fn new(session: &'a dyn Session, actor: &'a str) -> Self {
        Self { session, actor }
    }

    pub fn session(&self) -> &'a dyn Session {
        self.session
    }

    /// Identity recorded against review aborts and other audited actions.
    pub fn actor(&self) -> &'a str {
        self.actor
    }

    pub fn records(&self) -> HarvestRecordStore<'a> {
        HarvestRecordStore::new(self.session)
    }
}
