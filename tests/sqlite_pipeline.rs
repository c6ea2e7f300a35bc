//! Pipeline behaviour against the SQLite backend.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tempfile::TempDir;

use oai_harvest::collections::create_collection;
use oai_harvest::config::Config;
use oai_harvest::db::connect_path;
use oai_harvest::get::{delete_item, forget_record, get_item, withdraw_item};
use oai_harvest::ingest::harvest_files;
use oai_harvest::migrate::apply_schema;
use oai_harvest::source_fs::scan_records;
use oai_harvest::sqlite_store::SqliteBackend;
use oai_harvest::stats::stage_counts;
use oai_harvest_core::models::{
    checksum, CollectionId, FieldSelector, HarvestRecord, IncomingRecord, Item, ItemId,
    LifecycleStage, MetadataValue, RemoteResource, ResourceMap, ReviewEngine, WorkspaceItem,
    BACKUP_BUNDLE, ORIGINAL_BUNDLE,
};
use oai_harvest_core::records::HarvestRecordStore;
use oai_harvest_core::store::Backend;
use oai_harvest_core::traits::{AllMetadataRemover, BackupBundleVersioning, ReplaceAllBundles};
use oai_harvest_core::workflow::{
    ArchiveIngestionWorkflow, IngestionWorkflow, ReviewIngestionWorkflow,
};
use oai_harvest_core::{
    ErrorKind, HarvestContext, HarvestError, Harvester, IdentityResolver, IngestOutcome,
};

struct Fixture {
    _tmp: TempDir,
    pool: SqlitePool,
    backend: SqliteBackend,
}

async fn fixture(engine: ReviewEngine) -> Fixture {
    let tmp = TempDir::new().unwrap();
    let pool = connect_path(&tmp.path().join("hvst.sqlite")).await.unwrap();
    apply_schema(&pool).await.unwrap();
    let backend = SqliteBackend::new(pool.clone(), engine, "123456789");
    Fixture {
        _tmp: tmp,
        pool,
        backend,
    }
}

async fn collection(f: &Fixture, name: &str) -> CollectionId {
    create_collection(&f.pool, name).await.unwrap().id
}

fn record(remote_id: &str, title: &str) -> IncomingRecord {
    IncomingRecord::new(
        remote_id,
        vec![MetadataValue::new("dc.title", title).unwrap()],
    )
}

fn pdf(content: &[u8]) -> ResourceMap {
    ResourceMap::new(vec![RemoteResource {
        name: "thesis.pdf".to_string(),
        bundle: ORIGINAL_BUNDLE.to_string(),
        mime_type: "application/pdf".to_string(),
        content: content.to_vec(),
    }])
}

fn created(outcome: IngestOutcome) -> ItemId {
    match outcome {
        IngestOutcome::Created(id) => id,
        other => panic!("expected Created, got {:?}", other),
    }
}

fn updated(outcome: IngestOutcome) -> ItemId {
    match outcome {
        IngestOutcome::Updated(id) => id,
        other => panic!("expected Updated, got {:?}", other),
    }
}

async fn titles(backend: &SqliteBackend, item: &ItemId) -> Vec<String> {
    let session = backend.begin().await.unwrap();
    let found = session
        .get_metadata(item, &FieldSelector::parse("dc.title").unwrap())
        .await
        .unwrap()
        .into_iter()
        .map(|v| v.value)
        .collect();
    session.rollback().await.unwrap();
    found
}

async fn bundle_names(backend: &SqliteBackend, item: &ItemId, bundle: &str) -> Vec<String> {
    let session = backend.begin().await.unwrap();
    let found = session
        .get_bundles(item, Some(bundle))
        .await
        .unwrap()
        .into_iter()
        .map(|(bs, _)| format!("{}#{}", bs.name, bs.sequence))
        .collect();
    session.rollback().await.unwrap();
    found
}

async fn checksums(backend: &SqliteBackend, item: &ItemId, bundle: &str) -> Vec<String> {
    let session = backend.begin().await.unwrap();
    let found = session
        .get_bundles(item, Some(bundle))
        .await
        .unwrap()
        .into_iter()
        .map(|(bs, _)| bs.checksum)
        .collect();
    session.rollback().await.unwrap();
    found
}

async fn harvest_record(backend: &SqliteBackend, item: &ItemId) -> Option<HarvestRecord> {
    let session = backend.begin().await.unwrap();
    let found = session.record_for_item(item).await.unwrap();
    session.rollback().await.unwrap();
    found
}

async fn bound(
    backend: &SqliteBackend,
    remote_id: &str,
    collection: &CollectionId,
) -> Option<HarvestRecord> {
    let session = backend.begin().await.unwrap();
    let found = HarvestRecordStore::new(session.as_ref())
        .find_by_remote_id(remote_id, collection)
        .await
        .unwrap();
    session.rollback().await.unwrap();
    found
}

/// Archive workflow whose update hook always fails, after all content was written.
struct FailingPostUpdate {
    inner: ArchiveIngestionWorkflow,
}

#[async_trait]
impl IngestionWorkflow for FailingPostUpdate {
    fn name(&self) -> &str {
        "failing-post-update"
    }

    async fn post_update(
        &self,
        _ctx: &HarvestContext<'_>,
        item: &Item,
    ) -> oai_harvest_core::Result<()> {
        Err(HarvestError::Harvesting(format!(
            "downstream index refused item {}",
            item.id
        )))
    }

    async fn post_create(
        &self,
        ctx: &HarvestContext<'_>,
        wsi: &WorkspaceItem,
        handle: Option<&str>,
    ) -> oai_harvest_core::Result<Item> {
        self.inner.post_create(ctx, wsi, handle).await
    }

    async fn update_bitstreams(
        &self,
        ctx: &HarvestContext<'_>,
        item: &Item,
        record: &HarvestRecord,
        map: &ResourceMap,
    ) -> oai_harvest_core::Result<bool> {
        self.inner.update_bitstreams(ctx, item, record, map).await
    }
}

async fn resolve(
    backend: &SqliteBackend,
    remote_id: &str,
    collection: &CollectionId,
) -> Option<(ItemId, LifecycleStage)> {
    let session = backend.begin().await.unwrap();
    let ctx = HarvestContext::new(session.as_ref(), "test");
    let found = IdentityResolver::new()
        .resolve(&ctx, remote_id, collection)
        .await
        .unwrap()
        .map(|r| (r.item.id, r.stage));
    drop(ctx);
    session.rollback().await.unwrap();
    found
}

#[tokio::test]
async fn test_create_then_update_same_item() {
    let f = fixture(ReviewEngine::Legacy).await;
    let c1 = collection(&f, "C1").await;
    let harvester = Harvester::new(Box::new(ArchiveIngestionWorkflow::new(true)));

    let id = created(harvester.ingest(&f.backend, &c1, &record("oai:42", "A")).await);
    let first = {
        let session = f.backend.begin().await.unwrap();
        let r = session.record_for_item(&id).await.unwrap().unwrap();
        session.rollback().await.unwrap();
        r
    };
    assert_eq!(first.remote_id, "oai:42");
    assert_eq!(
        resolve(&f.backend, "oai:42", &c1).await,
        Some((id.clone(), LifecycleStage::Archived))
    );

    tokio::time::sleep(Duration::from_millis(10)).await;
    let again = updated(harvester.ingest(&f.backend, &c1, &record("oai:42", "B")).await);
    assert_eq!(again, id);
    assert_eq!(titles(&f.backend, &id).await, vec!["B"]);

    let session = f.backend.begin().await.unwrap();
    let second = session.record_for_item(&id).await.unwrap().unwrap();
    session.rollback().await.unwrap();
    assert!(second.last_harvested > first.last_harvested);

    let counts = stage_counts(&f.pool).await.unwrap();
    assert_eq!(counts.archived, 1);
    assert_eq!(counts.harvest_records, 1);
    assert_eq!(counts.workspace, 0);
}

#[tokio::test]
async fn test_same_remote_id_scoped_per_collection() {
    let f = fixture(ReviewEngine::Legacy).await;
    let c1 = collection(&f, "C1").await;
    let c2 = collection(&f, "C2").await;
    let harvester = Harvester::new(Box::new(ArchiveIngestionWorkflow::new(true)));

    let a = created(harvester.ingest(&f.backend, &c1, &record("oai:7", "A")).await);
    let b = created(harvester.ingest(&f.backend, &c2, &record("oai:7", "B")).await);
    assert_ne!(a, b);
    assert_eq!(resolve(&f.backend, "oai:7", &c1).await.map(|r| r.0), Some(a));
    assert_eq!(resolve(&f.backend, "oai:7", &c2).await.map(|r| r.0), Some(b));
}

#[tokio::test]
async fn test_install_failure_leaves_no_orphan() {
    let f = fixture(ReviewEngine::Legacy).await;
    let c1 = collection(&f, "C1").await;
    let harvester = Harvester::new(Box::new(ArchiveIngestionWorkflow::new(true)));

    let mut first = record("oai:1", "A");
    first.handle = Some("123456789/fixed".to_string());
    created(harvester.ingest(&f.backend, &c1, &first).await);

    let mut clash = record("oai:2", "B");
    clash.handle = Some("123456789/fixed".to_string());
    match harvester.ingest(&f.backend, &c1, &clash).await {
        IngestOutcome::Failed(err) => assert_eq!(err.kind(), ErrorKind::Install),
        other => panic!("expected install failure, got {:?}", other),
    }

    assert_eq!(resolve(&f.backend, "oai:2", &c1).await, None);
    let counts = stage_counts(&f.pool).await.unwrap();
    assert_eq!(counts.workspace, 0);
    assert_eq!(counts.archived, 1);
    assert_eq!(counts.harvest_records, 1);
    let items: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items")
        .fetch_one(&f.pool)
        .await
        .unwrap();
    assert_eq!(items, 1);
}

#[tokio::test]
async fn test_review_workflow_restarts_review_on_update() {
    let f = fixture(ReviewEngine::Configurable).await;
    let c1 = collection(&f, "C1").await;
    let harvester = Harvester::new(Box::new(ReviewIngestionWorkflow::new(true)))
        .with_metadata_remover(Box::new(AllMetadataRemover));

    let id = created(harvester.ingest(&f.backend, &c1, &record("oai:9", "A")).await);
    assert_eq!(
        resolve(&f.backend, "oai:9", &c1).await,
        Some((id.clone(), LifecycleStage::ConfigurableWorkflow))
    );

    let again = updated(harvester.ingest(&f.backend, &c1, &record("oai:9", "B")).await);
    assert_eq!(again, id);
    assert_eq!(titles(&f.backend, &id).await, vec!["B"]);
    assert_eq!(
        resolve(&f.backend, "oai:9", &c1).await,
        Some((id, LifecycleStage::ConfigurableWorkflow))
    );

    let counts = stage_counts(&f.pool).await.unwrap();
    assert_eq!(counts.configurable_workflow, 1);
    assert_eq!(counts.workspace, 0);
    assert_eq!(counts.archived, 0);
}

#[tokio::test]
async fn test_backup_versioning_keeps_superseded_files() {
    let f = fixture(ReviewEngine::Legacy).await;
    let c1 = collection(&f, "C1").await;
    let harvester = Harvester::new(Box::new(ArchiveIngestionWorkflow::new(true)))
        .with_bundle_versioning(Box::new(BackupBundleVersioning));

    let id = created(
        harvester
            .ingest(&f.backend, &c1, &record("oai:5", "A").with_resource_map(pdf(b"v1")))
            .await,
    );
    updated(
        harvester
            .ingest(&f.backend, &c1, &record("oai:5", "A").with_resource_map(pdf(b"v1")))
            .await,
    );
    assert!(bundle_names(&f.backend, &id, BACKUP_BUNDLE).await.is_empty());

    updated(
        harvester
            .ingest(&f.backend, &c1, &record("oai:5", "A").with_resource_map(pdf(b"v2")))
            .await,
    );
    assert_eq!(
        bundle_names(&f.backend, &id, ORIGINAL_BUNDLE).await,
        vec!["thesis.pdf#1"]
    );
    assert_eq!(
        bundle_names(&f.backend, &id, BACKUP_BUNDLE).await,
        vec!["thesis.pdf#1"]
    );

    updated(
        harvester
            .ingest(&f.backend, &c1, &record("oai:5", "A").with_resource_map(pdf(b"v3")))
            .await,
    );
    assert_eq!(
        bundle_names(&f.backend, &id, BACKUP_BUNDLE).await,
        vec!["thesis.pdf#1", "thesis.pdf#2"]
    );
}

#[tokio::test]
async fn test_item_dump_and_forget_binding() {
    let f = fixture(ReviewEngine::Legacy).await;
    let c1 = collection(&f, "C1").await;
    let harvester = Harvester::new(Box::new(ArchiveIngestionWorkflow::new(true)));

    let id = created(
        harvester
            .ingest(&f.backend, &c1, &record("oai:3", "A").with_resource_map(pdf(b"x")))
            .await,
    );

    let dump = get_item(&f.backend, id.as_str()).await.unwrap();
    assert_eq!(dump.stage.as_deref(), Some("archived"));
    assert_eq!(dump.handle.as_deref(), Some("123456789/1"));
    assert_eq!(dump.metadata.len(), 1);
    assert_eq!(dump.bitstreams.len(), 1);
    assert_eq!(dump.harvest.as_ref().map(|h| h.remote_id.as_str()), Some("oai:3"));

    forget_record(&f.backend, id.as_str()).await.unwrap();
    assert!(forget_record(&f.backend, id.as_str()).await.is_err());
    assert_eq!(resolve(&f.backend, "oai:3", &c1).await, None);

    let fresh = created(harvester.ingest(&f.backend, &c1, &record("oai:3", "A")).await);
    assert_ne!(fresh, id);
    assert!(get_item(&f.backend, "missing").await.is_err());
}

#[tokio::test]
async fn test_harvest_directory_summary() {
    let f = fixture(ReviewEngine::Legacy).await;
    let c1 = collection(&f, "C1").await;
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("a.xml"),
        r#"<record><header><identifier>oai:a</identifier></header>
           <metadata><oai_dc:dc><dc:title>A</dc:title></oai_dc:dc></metadata></record>"#,
    )
    .unwrap();
    std::fs::write(
        dir.path().join("b.xml"),
        r#"<record><header status="deleted"><identifier>oai:b</identifier></header></record>"#,
    )
    .unwrap();
    std::fs::write(
        dir.path().join("c.xml"),
        r#"<record><header><identifier>oai:c</identifier><datestamp>yesterday</datestamp></header>
           <metadata><oai_dc:dc><dc:title>C</dc:title></oai_dc:dc></metadata></record>"#,
    )
    .unwrap();

    let config: Config = toml::from_str("[db]\npath = \"unused\"\n").unwrap();
    let files = scan_records(&config, dir.path()).unwrap();
    let harvester = Harvester::new(Box::new(ArchiveIngestionWorkflow::new(true)));

    let summary = harvest_files(&f.backend, &harvester, &c1, &files).await;
    assert_eq!(summary.records, 3);
    assert_eq!(summary.created, 1);
    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.failed, 1);

    let summary = harvest_files(&f.backend, &harvester, &c1, &files).await;
    assert_eq!(summary.created, 0);
    assert_eq!(summary.updated, 1);
}

#[tokio::test]
async fn test_failed_update_rolls_back_every_write() {
    let f = fixture(ReviewEngine::Legacy).await;
    let c1 = collection(&f, "C1").await;
    let archive = Harvester::new(Box::new(ArchiveIngestionWorkflow::new(true)));
    let id = created(
        archive
            .ingest(&f.backend, &c1, &record("oai:rb", "A").with_resource_map(pdf(b"v1")))
            .await,
    );
    let before = harvest_record(&f.backend, &id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    let failing = Harvester::new(Box::new(FailingPostUpdate {
        inner: ArchiveIngestionWorkflow::new(true),
    }));
    match failing
        .ingest(&f.backend, &c1, &record("oai:rb", "B").with_resource_map(pdf(b"v2")))
        .await
    {
        IngestOutcome::Failed(err) => assert_eq!(err.kind(), ErrorKind::Harvesting),
        other => panic!("expected Failed, got {:?}", other),
    }

    assert_eq!(titles(&f.backend, &id).await, vec!["A"]);
    assert_eq!(
        checksums(&f.backend, &id, ORIGINAL_BUNDLE).await,
        vec![checksum(b"v1")]
    );
    assert_eq!(harvest_record(&f.backend, &id).await.unwrap(), before);
}

#[tokio::test]
async fn test_deleted_item_is_recreated_on_next_harvest() {
    let f = fixture(ReviewEngine::Legacy).await;
    let c1 = collection(&f, "C1").await;
    let harvester = Harvester::new(Box::new(ArchiveIngestionWorkflow::new(true)));
    let id = created(
        harvester
            .ingest(&f.backend, &c1, &record("oai:del", "A").with_resource_map(pdf(b"x")))
            .await,
    );

    delete_item(&f.backend, id.as_str()).await.unwrap();
    assert!(bound(&f.backend, "oai:del", &c1).await.is_none());
    assert!(harvest_record(&f.backend, &id).await.is_none());
    let counts = stage_counts(&f.pool).await.unwrap();
    assert_eq!(counts.archived, 0);
    assert_eq!(counts.harvest_records, 0);
    assert!(delete_item(&f.backend, id.as_str()).await.is_err());

    let fresh = created(harvester.ingest(&f.backend, &c1, &record("oai:del", "A")).await);
    assert_ne!(fresh, id);
}

#[tokio::test]
async fn test_withdrawn_item_resolves_and_updates_in_place() {
    let f = fixture(ReviewEngine::Legacy).await;
    let c1 = collection(&f, "C1").await;
    let harvester = Harvester::new(Box::new(ArchiveIngestionWorkflow::new(true)));
    let id = created(harvester.ingest(&f.backend, &c1, &record("oai:w", "A")).await);

    let item = withdraw_item(&f.backend, id.as_str()).await.unwrap();
    assert!(item.withdrawn);
    assert!(withdraw_item(&f.backend, id.as_str()).await.is_err());

    assert_eq!(
        resolve(&f.backend, "oai:w", &c1).await,
        Some((id.clone(), LifecycleStage::Archived))
    );
    let dump = get_item(&f.backend, id.as_str()).await.unwrap();
    assert_eq!(dump.stage.as_deref(), Some("withdrawn"));

    let again = updated(harvester.ingest(&f.backend, &c1, &record("oai:w", "B")).await);
    assert_eq!(again, id);
    assert_eq!(titles(&f.backend, &id).await, vec!["B"]);
    let counts = stage_counts(&f.pool).await.unwrap();
    assert_eq!(counts.withdrawn, 1);
    assert_eq!(counts.archived, 0);
}

#[tokio::test]
async fn test_replace_all_bundles_drops_empty_bundles() {
    let f = fixture(ReviewEngine::Legacy).await;
    let c1 = collection(&f, "C1").await;
    let id = created(
        Harvester::new(Box::new(ArchiveIngestionWorkflow::new(true)))
            .ingest(&f.backend, &c1, &record("oai:e", "A").with_resource_map(pdf(b"v1")))
            .await,
    );
    sqlx::query("INSERT INTO bundles (id, item_id, name) VALUES ('empty-thumb', ?, 'THUMBNAIL')")
        .bind(id.as_str())
        .execute(&f.pool)
        .await
        .unwrap();

    let harvester = Harvester::new(Box::new(ArchiveIngestionWorkflow::new(true)))
        .with_bundle_versioning(Box::new(ReplaceAllBundles));
    updated(
        harvester
            .ingest(&f.backend, &c1, &record("oai:e", "A").with_resource_map(pdf(b"v2")))
            .await,
    );

    let session = f.backend.begin().await.unwrap();
    let names = session.bundle_names(&id).await.unwrap();
    session.rollback().await.unwrap();
    assert_eq!(names, vec![ORIGINAL_BUNDLE.to_string()]);
    assert_eq!(
        checksums(&f.backend, &id, ORIGINAL_BUNDLE).await,
        vec![checksum(b"v2")]
    );
}
