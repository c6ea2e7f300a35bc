//! In-memory [`Backend`] implementation for tests and embedding.
//!
//! Each session works on a private copy of the repository state taken at
//! [`Backend::begin`]; commit publishes that copy and rollback drops it.
//! Sessions are serialized: `begin` waits until the previous session has
//! committed, rolled back or been dropped, so no committed work is lost.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex as Gate, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::{HarvestError, Result};
use crate::models::{
    Bitstream, Bundle, Collection, CollectionId, FieldSelector, HarvestRecord, Item, ItemId,
    LifecycleStage, MetadataValue, NewBitstream, ReviewEngine, WorkspaceItem, RESOLUTION_ORDER,
};

use super::{
    Backend, ContentStore, HarvestRecordRepository, ReviewWorkflow, Session, StageIndex,
};

#[derive(Debug, Clone, Default)]
struct State {
    collections: BTreeMap<CollectionId, Collection>,
    items: HashMap<ItemId, Item>,
    workspace: HashMap<ItemId, WorkspaceItem>,
    legacy_workflow: HashMap<ItemId, CollectionId>,
    configurable_workflow: HashMap<ItemId, CollectionId>,
    metadata: HashMap<ItemId, Vec<MetadataValue>>,
    bundles: Vec<Bundle>,
    bitstreams: Vec<Bitstream>,
    records: HashMap<ItemId, HarvestRecord>,
    next_handle: u64,
}

impl State {
    fn require_item(&self, id: &ItemId) -> Result<()> {
        if self.items.contains_key(id) {
            Ok(())
        } else {
            Err(HarvestError::NotFound(format!("item {}", id)))
        }
    }

    fn purge_item(&mut self, id: &ItemId) {
        self.items.remove(id);
        self.workspace.remove(id);
        self.legacy_workflow.remove(id);
        self.configurable_workflow.remove(id);
        self.metadata.remove(id);
        self.records.remove(id);
        let bundle_ids: Vec<String> = self
            .bundles
            .iter()
            .filter(|b| &b.item_id == id)
            .map(|b| b.id.clone())
            .collect();
        self.bitstreams.retain(|bs| !bundle_ids.contains(&bs.bundle_id));
        self.bundles.retain(|b| &b.item_id != id);
    }

    fn bundle_id(&self, item: &ItemId, name: &str) -> Option<String> {
        self.bundles
            .iter()
            .find(|b| &b.item_id == item && b.name == name)
            .map(|b| b.id.clone())
    }

    fn next_sequence(&self, bundle_id: &str) -> i64 {
        self.bitstreams
            .iter()
            .filter(|bs| bs.bundle_id == bundle_id)
            .map(|bs| bs.sequence)
            .max()
            .map(|s| s + 1)
            .unwrap_or(1)
    }

    fn review_map(&self, stage: LifecycleStage) -> Option<&HashMap<ItemId, CollectionId>> {
        match stage {
            LifecycleStage::LegacyWorkflow => Some(&self.legacy_workflow),
            LifecycleStage::ConfigurableWorkflow => Some(&self.configurable_workflow),
            _ => None,
        }
    }

    fn collection_in_stage(&self, stage: LifecycleStage, item: &ItemId) -> Option<CollectionId> {
        match stage {
            LifecycleStage::Archived | LifecycleStage::Withdrawn => self
                .items
                .get(item)
                .and_then(|i| i.owning_collection.clone()),
            LifecycleStage::Workspace => self.workspace.get(item).map(|w| w.collection.clone()),
            review => self.review_map(review).and_then(|m| m.get(item).cloned()),
        }
    }
}

/// In-memory backend for tests and embedding.
pub struct InMemoryBackend {
    state: Arc<RwLock<State>>,
    gate: Arc<Gate<()>>,
    engine: ReviewEngine,
    handle_prefix: String,
    fail_installs: Arc<AtomicBool>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            gate: Arc::new(Gate::new(())),
            engine: ReviewEngine::default(),
            handle_prefix: "123456789".to_string(),
            fail_installs: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_review_engine(mut self, engine: ReviewEngine) -> Self {
        self.engine = engine;
        self
    }

    /// Register a target collection and return its id.
    pub fn add_collection(&self, name: &str) -> CollectionId {
        let id = CollectionId::new();
        if let Ok(mut state) = self.state.write() {
            state.collections.insert(
                id.clone(),
                Collection {
                    id: id.clone(),
                    name: name.to_string(),
                },
            );
        }
        id
    }

    /// Make every subsequent `install_item` fail with an install error.
    pub fn fail_installs(&self, fail: bool) {
        self.fail_installs.store(fail, Ordering::SeqCst);
    }

    /// Ids of all committed items, sorted.
    pub fn item_ids(&self) -> Vec<ItemId> {
        let mut ids: Vec<ItemId> = self
            .state
            .read()
            .map(|s| s.items.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Number of committed workspace items.
    pub fn workspace_item_count(&self) -> usize {
        self.state.read().map(|s| s.workspace.len()).unwrap_or(0)
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn begin(&self) -> Result<Box<dyn Session>> {
        let permit = Arc::clone(&self.gate).lock_owned().await;
        let snapshot = self
            .state
            .read()
            .map_err(|_| poisoned())?
            .clone();
        let working = Arc::new(Mutex::new(snapshot));
        let indexes = RESOLUTION_ORDER
            .iter()
            .map(|stage| MemoryStageIndex {
                stage: *stage,
                working: Arc::clone(&working),
            })
            .collect();
        Ok(Box::new(MemorySession {
            _permit: permit,
            shared: Arc::clone(&self.state),
            working,
            engine: self.engine,
            handle_prefix: self.handle_prefix.clone(),
            fail_installs: Arc::clone(&self.fail_installs),
            indexes,
        }))
    }
}

fn poisoned() -> HarvestError {
    HarvestError::Persistence("in-memory state lock poisoned".to_string())
}

fn lock(working: &Mutex<State>) -> Result<MutexGuard<'_, State>> {
    working.lock().map_err(|_| poisoned())
}

struct MemorySession {
    /// Held until the session is committed, rolled back or dropped.
    _permit: OwnedMutexGuard<()>,
    shared: Arc<RwLock<State>>,
    working: Arc<Mutex<State>>,
    engine: ReviewEngine,
    handle_prefix: String,
    fail_installs: Arc<AtomicBool>,
    indexes: Vec<MemoryStageIndex>,
}

impl MemorySession {
    fn state(&self) -> Result<MutexGuard<'_, State>> {
        lock(&self.working)
    }
}

struct MemoryStageIndex {
    stage: LifecycleStage,
    working: Arc<Mutex<State>>,
}

#[async_trait]
impl StageIndex for MemoryStageIndex {
    fn stage(&self) -> LifecycleStage {
        self.stage
    }

    async fn find_by_item(&self, item: &ItemId) -> Result<Option<CollectionId>> {
        Ok(lock(&self.working)?.collection_in_stage(self.stage, item))
    }

    async fn find_by_remote_id(
        &self,
        remote_id: &str,
        collection: &CollectionId,
    ) -> Result<Option<HarvestRecord>> {
        let guard = lock(&self.working)?;
        let state: &State = &guard;
        Ok(state
            .records
            .values()
            .filter(|r| r.remote_id == remote_id)
            .filter(|r| state.collection_in_stage(self.stage, &r.item_id).as_ref() == Some(collection))
            .min_by(|a, b| a.item_id.cmp(&b.item_id))
            .cloned())
    }
}

#[async_trait]
impl ContentStore for MemorySession {
    async fn find_item(&self, id: &ItemId) -> Result<Option<Item>> {
        Ok(self.state()?.items.get(id).cloned())
    }

    async fn create_workspace_item(&self, collection: &CollectionId) -> Result<WorkspaceItem> {
        let mut state = self.state()?;
        if !state.collections.contains_key(collection) {
            return Err(HarvestError::NotFound(format!("collection {}", collection)));
        }
        let item = Item {
            id: ItemId::new(),
            handle: None,
            owning_collection: None,
            in_archive: false,
            withdrawn: false,
            last_modified: Utc::now(),
        };
        let wsi = WorkspaceItem {
            id: Uuid::new_v4().to_string(),
            item_id: item.id.clone(),
            collection: collection.clone(),
        };
        state.workspace.insert(item.id.clone(), wsi.clone());
        state.items.insert(item.id.clone(), item);
        Ok(wsi)
    }

    async fn find_workspace_item(&self, item: &ItemId) -> Result<Option<WorkspaceItem>> {
        Ok(self.state()?.workspace.get(item).cloned())
    }

    async fn install_item(&self, wsi: &WorkspaceItem, handle: Option<&str>) -> Result<Item> {
        if self.fail_installs.load(Ordering::SeqCst) {
            return Err(HarvestError::Install(format!(
                "store refused to install item {}",
                wsi.item_id
            )));
        }
        let mut state = self.state()?;
        if state.workspace.remove(&wsi.item_id).is_none() {
            return Err(HarvestError::Install(format!(
                "item {} is not in the workspace",
                wsi.item_id
            )));
        }
        let handle = match handle {
            Some(h) => h.to_string(),
            None => {
                state.next_handle += 1;
                format!("{}/{}", self.handle_prefix, state.next_handle)
            }
        };
        let item = state
            .items
            .get_mut(&wsi.item_id)
            .ok_or_else(|| HarvestError::Install(format!("item {} vanished", wsi.item_id)))?;
        item.handle = Some(handle);
        item.owning_collection = Some(wsi.collection.clone());
        item.in_archive = true;
        item.last_modified = Utc::now();
        Ok(item.clone())
    }

    async fn delete_workspace_item(&self, wsi: &WorkspaceItem) -> Result<()> {
        let mut state = self.state()?;
        if state.workspace.contains_key(&wsi.item_id) {
            state.purge_item(&wsi.item_id);
        }
        Ok(())
    }

    async fn delete_item(&self, id: &ItemId) -> Result<()> {
        let mut state = self.state()?;
        state.require_item(id)?;
        state.purge_item(id);
        Ok(())
    }

    async fn withdraw_item(&self, id: &ItemId) -> Result<Item> {
        let mut state = self.state()?;
        let item = state
            .items
            .get_mut(id)
            .ok_or_else(|| HarvestError::NotFound(format!("item {}", id)))?;
        if !item.in_archive {
            return Err(HarvestError::Workflow(format!("item {} is not archived", id)));
        }
        item.in_archive = false;
        item.withdrawn = true;
        item.last_modified = Utc::now();
        Ok(item.clone())
    }

    async fn get_metadata(
        &self,
        item: &ItemId,
        selector: &FieldSelector,
    ) -> Result<Vec<MetadataValue>> {
        let state = self.state()?;
        state.require_item(item)?;
        Ok(state
            .metadata
            .get(item)
            .map(|values| {
                values
                    .iter()
                    .filter(|v| selector.matches(v))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn clear_metadata(&self, item: &ItemId, selector: &FieldSelector) -> Result<()> {
        let mut state = self.state()?;
        state.require_item(item)?;
        if let Some(values) = state.metadata.get_mut(item) {
            values.retain(|v| !selector.matches(v));
        }
        Ok(())
    }

    async fn add_metadata(&self, item: &ItemId, value: &MetadataValue) -> Result<()> {
        let mut state = self.state()?;
        state.require_item(item)?;
        state
            .metadata
            .entry(item.clone())
            .or_default()
            .push(value.clone());
        Ok(())
    }

    async fn bundle_names(&self, item: &ItemId) -> Result<Vec<String>> {
        let state = self.state()?;
        state.require_item(item)?;
        let mut names: Vec<String> = state
            .bundles
            .iter()
            .filter(|b| &b.item_id == item)
            .map(|b| b.name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn get_bundles(
        &self,
        item: &ItemId,
        bundle_name: Option<&str>,
    ) -> Result<Vec<(Bitstream, Bundle)>> {
        let guard = self.state()?;
        let state: &State = &guard;
        state.require_item(item)?;
        let mut pairs: Vec<(Bitstream, Bundle)> = state
            .bundles
            .iter()
            .filter(|b| &b.item_id == item)
            .filter(|b| bundle_name.map_or(true, |n| b.name == n))
            .flat_map(|b| {
                state
                    .bitstreams
                    .iter()
                    .filter(move |bs| bs.bundle_id == b.id)
                    .map(move |bs| (bs.clone(), b.clone()))
            })
            .collect();
        pairs.sort_by(|a, b| {
            a.1.name
                .cmp(&b.1.name)
                .then(a.0.sequence.cmp(&b.0.sequence))
        });
        Ok(pairs)
    }

    async fn add_bitstream(
        &self,
        item: &ItemId,
        bundle_name: &str,
        bitstream: &NewBitstream,
    ) -> Result<Bitstream> {
        let mut state = self.state()?;
        state.require_item(item)?;
        let bundle_id = match state.bundle_id(item, bundle_name) {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                state.bundles.push(Bundle {
                    id: id.clone(),
                    item_id: item.clone(),
                    name: bundle_name.to_string(),
                });
                id
            }
        };
        let stored = Bitstream {
            id: Uuid::new_v4().to_string(),
            sequence: state.next_sequence(&bundle_id),
            bundle_id,
            name: bitstream.name.clone(),
            mime_type: bitstream.mime_type.clone(),
            size_bytes: bitstream.content.len() as i64,
            checksum: bitstream.checksum(),
        };
        state.bitstreams.push(stored.clone());
        Ok(stored)
    }

    async fn remove_bundle(&self, item: &ItemId, bundle_name: &str) -> Result<()> {
        let mut state = self.state()?;
        state.require_item(item)?;
        if let Some(id) = state.bundle_id(item, bundle_name) {
            state.bitstreams.retain(|bs| bs.bundle_id != id);
            state.bundles.retain(|b| b.id != id);
        }
        Ok(())
    }

    async fn rename_bundle(&self, item: &ItemId, from: &str, to: &str) -> Result<()> {
        let mut state = self.state()?;
        state.require_item(item)?;
        let Some(from_id) = state.bundle_id(item, from) else {
            return Ok(());
        };
        match state.bundle_id(item, to) {
            Some(to_id) => {
                let mut next = state.next_sequence(&to_id);
                let mut moving: Vec<usize> = state
                    .bitstreams
                    .iter()
                    .enumerate()
                    .filter(|(_, bs)| bs.bundle_id == from_id)
                    .map(|(i, _)| i)
                    .collect();
                moving.sort_by_key(|i| state.bitstreams[*i].sequence);
                for i in moving {
                    let bs = &mut state.bitstreams[i];
                    bs.bundle_id = to_id.clone();
                    bs.sequence = next;
                    next += 1;
                }
                state.bundles.retain(|b| b.id != from_id);
            }
            None => {
                if let Some(bundle) = state.bundles.iter_mut().find(|b| b.id == from_id) {
                    bundle.name = to.to_string();
                }
            }
        }
        Ok(())
    }

    async fn touch_item(&self, item: &ItemId) -> Result<()> {
        let mut state = self.state()?;
        let entry = state
            .items
            .get_mut(item)
            .ok_or_else(|| HarvestError::NotFound(format!("item {}", item)))?;
        entry.last_modified = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl ReviewWorkflow for MemorySession {
    async fn is_item_in_review(&self, item: &ItemId) -> Result<bool> {
        let state = self.state()?;
        Ok(state.legacy_workflow.contains_key(item) || state.configurable_workflow.contains_key(item))
    }

    async fn start_review(&self, wsi: &WorkspaceItem) -> Result<()> {
        let mut state = self.state()?;
        if state.workspace.remove(&wsi.item_id).is_none() {
            return Err(HarvestError::Workflow(format!(
                "item {} is not in the workspace",
                wsi.item_id
            )));
        }
        let queue = match self.engine {
            ReviewEngine::Legacy => &mut state.legacy_workflow,
            ReviewEngine::Configurable => &mut state.configurable_workflow,
        };
        queue.insert(wsi.item_id.clone(), wsi.collection.clone());
        Ok(())
    }

    async fn abort_review(&self, item: &ItemId, actor: &str) -> Result<WorkspaceItem> {
        if actor.trim().is_empty() {
            return Err(HarvestError::Workflow(
                "no actor given for review abort".to_string(),
            ));
        }
        let mut state = self.state()?;
        let collection = state
            .legacy_workflow
            .remove(item)
            .or_else(|| state.configurable_workflow.remove(item))
            .ok_or_else(|| HarvestError::Workflow(format!("item {} is not in review", item)))?;
        let wsi = WorkspaceItem {
            id: Uuid::new_v4().to_string(),
            item_id: item.clone(),
            collection,
        };
        state.workspace.insert(item.clone(), wsi.clone());
        Ok(wsi)
    }
}

#[async_trait]
impl HarvestRecordRepository for MemorySession {
    async fn record_for_item(&self, item: &ItemId) -> Result<Option<HarvestRecord>> {
        Ok(self.state()?.records.get(item).cloned())
    }

    async fn insert_record(&self, record: &HarvestRecord) -> Result<()> {
        let mut state = self.state()?;
        if state.records.contains_key(&record.item_id) {
            return Err(HarvestError::Persistence(format!(
                "item {} already has a harvest record",
                record.item_id
            )));
        }
        state.records.insert(record.item_id.clone(), record.clone());
        Ok(())
    }

    async fn update_record(&self, record: &HarvestRecord) -> Result<()> {
        let mut state = self.state()?;
        match state.records.get_mut(&record.item_id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(HarvestError::Persistence(format!(
                "no harvest record for item {}",
                record.item_id
            ))),
        }
    }

    async fn delete_record(&self, item: &ItemId) -> Result<()> {
        self.state()?.records.remove(item);
        Ok(())
    }
}

#[async_trait]
impl Session for MemorySession {
    fn stage_index(&self, stage: LifecycleStage) -> Option<&dyn StageIndex> {
        self.indexes
            .iter()
            .find(|idx| idx.stage == stage)
            .map(|idx| idx as &dyn StageIndex)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut working = lock(&self.working)?.clone();
        let mut shared = self.shared.write().map_err(|_| poisoned())?;
        // Collections are registered outside sessions.
        working.collections = std::mem::take(&mut shared.collections);
        *shared = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
