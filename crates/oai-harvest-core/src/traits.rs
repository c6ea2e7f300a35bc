//! Extension points invoked by the ingestion pipeline.
//!
//! Each role has exactly one active implementation, chosen once when the
//! [`Harvester`](crate::Harvester) is built. Unconfigured roles fall back to
//! the permissive default described on each trait.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Harvester                         │
//! │  ┌──────────────┐ ┌────────────────┐ ┌────────────────┐  │
//! │  │ IngestFilter │ │MetadataRemover │ │BundleVersioning│  │
//! │  │ none / field │ │none/all/author.│ │none/all/backup │  │
//! │  │  / format    │ │                │ │                │  │
//! │  └──────────────┘ └────────────────┘ └────────────────┘  │
//! │                 ┌────────────────┐                       │
//! │                 │AccessPolicyHook│ (notification only)   │
//! │                 └────────────────┘                       │
//! └──────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use tracing::debug;

use crate::error::{HarvestError, Result};
use crate::models::{
    Bitstream, FieldSelector, Item, MetadataValue, ResourceMap, BACKUP_BUNDLE, ORIGINAL_BUNDLE,
};
use crate::store::HarvestContext;

// ═══════════════════════════════════════════════════════════════════════
// Ingest Filter
// ═══════════════════════════════════════════════════════════════════════

/// Decides whether an incoming record may be applied.
///
/// Runs before any local mutation. An `Err` is reported as a per-record
/// failure of kind [`FilterEvaluation`](HarvestError::FilterEvaluation);
/// it never aborts a batch.
#[async_trait]
pub trait IngestFilter: Send + Sync {
    fn name(&self) -> &str;

    async fn accept_ingest(
        &self,
        metadata: &[MetadataValue],
        resource_map: Option<&ResourceMap>,
    ) -> Result<bool>;
}

/// Default filter: accepts everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllFilter;

#[async_trait]
impl IngestFilter for AcceptAllFilter {
    fn name(&self) -> &str {
        "none"
    }

    async fn accept_ingest(&self, _: &[MetadataValue], _: Option<&ResourceMap>) -> Result<bool> {
        Ok(true)
    }
}

/// Accepts a record when any value of the selected field is in an allow-list.
///
/// Comparison is case-insensitive and ignores surrounding whitespace.
#[derive(Debug, Clone)]
pub struct FieldValueFilter {
    selector: FieldSelector,
    allowed: Vec<String>,
}

impl FieldValueFilter {
    pub fn new(selector: FieldSelector, allowed: Vec<String>) -> Self {
        let allowed = allowed
            .into_iter()
            .map(|v| v.trim().to_lowercase())
            .collect();
        Self { selector, allowed }
    }
}

#[async_trait]
impl IngestFilter for FieldValueFilter {
    fn name(&self) -> &str {
        "field"
    }

    async fn accept_ingest(
        &self,
        metadata: &[MetadataValue],
        _: Option<&ResourceMap>,
    ) -> Result<bool> {
        Ok(metadata
            .iter()
            .filter(|v| self.selector.matches(v))
            .any(|v| self.allowed.contains(&v.value.trim().to_lowercase())))
    }
}

/// Accepts a record when its resource map carries at least one resource of an
/// allowed MIME type.
///
/// A record without a resource map cannot be judged and fails evaluation.
#[derive(Debug, Clone)]
pub struct ResourceFormatFilter {
    mime_types: Vec<String>,
}

impl ResourceFormatFilter {
    pub fn new(mime_types: Vec<String>) -> Self {
        Self {
            mime_types: mime_types.into_iter().map(|m| m.to_lowercase()).collect(),
        }
    }
}

#[async_trait]
impl IngestFilter for ResourceFormatFilter {
    fn name(&self) -> &str {
        "format"
    }

    async fn accept_ingest(
        &self,
        _: &[MetadataValue],
        resource_map: Option<&ResourceMap>,
    ) -> Result<bool> {
        let map = resource_map.ok_or_else(|| {
            HarvestError::FilterEvaluation("record carries no resource map".to_string())
        })?;
        Ok(map
            .resources
            .iter()
            .any(|r| self.mime_types.contains(&r.mime_type.to_lowercase())))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Metadata Remover
// ═══════════════════════════════════════════════════════════════════════

/// Clears existing metadata before an update writes the incoming values.
///
/// When no remover is configured the pipeline clears every field.
#[async_trait]
pub trait MetadataRemover: Send + Sync {
    fn name(&self) -> &str;

    async fn clear_metadata(&self, ctx: &HarvestContext<'_>, item: &Item) -> Result<()>;
}

/// Leaves every field alone; incoming values are appended.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetadataRemover;

#[async_trait]
impl MetadataRemover for NoopMetadataRemover {
    fn name(&self) -> &str {
        "none"
    }

    async fn clear_metadata(&self, _: &HarvestContext<'_>, _: &Item) -> Result<()> {
        Ok(())
    }
}

/// Clears every field on the item.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllMetadataRemover;

#[async_trait]
impl MetadataRemover for AllMetadataRemover {
    fn name(&self) -> &str {
        "all"
    }

    async fn clear_metadata(&self, ctx: &HarvestContext<'_>, item: &Item) -> Result<()> {
        ctx.session()
            .clear_metadata(&item.id, &FieldSelector::any())
            .await
            .map_err(|e| e.into_harvesting("clearing metadata"))
    }
}

/// Clears only the fields the remote source is authoritative for.
#[derive(Debug, Clone)]
pub struct AuthorityMetadataRemover {
    fields: Vec<FieldSelector>,
}

impl AuthorityMetadataRemover {
    pub fn new(fields: Vec<FieldSelector>) -> Self {
        Self { fields }
    }
}

#[async_trait]
impl MetadataRemover for AuthorityMetadataRemover {
    fn name(&self) -> &str {
        "authority"
    }

    async fn clear_metadata(&self, ctx: &HarvestContext<'_>, item: &Item) -> Result<()> {
        for selector in &self.fields {
            debug!(item = %item.id, field = %selector, "clearing authoritative field");
            ctx.session()
                .clear_metadata(&item.id, selector)
                .await
                .map_err(|e| e.into_harvesting("clearing metadata"))?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Bundle Versioning
// ═══════════════════════════════════════════════════════════════════════

/// Prepares existing bundles before new content is attached on update.
///
/// When no strategy is configured the pipeline removes the bundles the
/// incoming resource map targets, so new content replaces old content.
#[async_trait]
pub trait BundleVersioningStrategy: Send + Sync {
    fn name(&self) -> &str;

    async fn version_bundles(&self, ctx: &HarvestContext<'_>, item: &Item) -> Result<()>;
}

/// Keeps existing bundles; new bitstreams are appended next to them.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBundleVersioning;

#[async_trait]
impl BundleVersioningStrategy for NoopBundleVersioning {
    fn name(&self) -> &str {
        "none"
    }

    async fn version_bundles(&self, _: &HarvestContext<'_>, _: &Item) -> Result<()> {
        Ok(())
    }
}

/// Removes every bundle on the item.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplaceAllBundles;

#[async_trait]
impl BundleVersioningStrategy for ReplaceAllBundles {
    fn name(&self) -> &str {
        "all"
    }

    async fn version_bundles(&self, ctx: &HarvestContext<'_>, item: &Item) -> Result<()> {
        let session = ctx.session();
        let names = session
            .bundle_names(&item.id)
            .await
            .map_err(|e| e.into_harvesting("listing bundles"))?;
        for name in names {
            session
                .remove_bundle(&item.id, &name)
                .await
                .map_err(|e| e.into_harvesting("removing bundle"))?;
        }
        Ok(())
    }
}

/// Moves the current primary content into the backup bundle.
///
/// Earlier backups are kept; the superseded bitstreams are appended.
#[derive(Debug, Default, Clone, Copy)]
pub struct BackupBundleVersioning;

#[async_trait]
impl BundleVersioningStrategy for BackupBundleVersioning {
    fn name(&self) -> &str {
        "backup"
    }

    async fn version_bundles(&self, ctx: &HarvestContext<'_>, item: &Item) -> Result<()> {
        debug!(item = %item.id, "moving {} to {}", ORIGINAL_BUNDLE, BACKUP_BUNDLE);
        ctx.session()
            .rename_bundle(&item.id, ORIGINAL_BUNDLE, BACKUP_BUNDLE)
            .await
            .map_err(|e| e.into_harvesting("versioning bundles"))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Access Policy Hook
// ═══════════════════════════════════════════════════════════════════════

/// Notified after bitstreams are attached to an item.
///
/// The access-policy engine lives elsewhere; this is its only entry point
/// into the pipeline. A failing hook fails the record.
#[async_trait]
pub trait AccessPolicyHook: Send + Sync {
    async fn bitstreams_updated(
        &self,
        ctx: &HarvestContext<'_>,
        item: &Item,
        bitstreams: &[Bitstream],
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RemoteResource;

    fn resource(mime: &str) -> RemoteResource {
        RemoteResource {
            name: "f".to_string(),
            bundle: ORIGINAL_BUNDLE.to_string(),
            mime_type: mime.to_string(),
            content: vec![1, 2, 3],
        }
    }

    #[tokio::test]
    async fn test_field_filter_case_insensitive() {
        let filter = FieldValueFilter::new(
            FieldSelector::parse("dc.type").unwrap(),
            vec!["Thesis".to_string()],
        );
        let thesis = vec![MetadataValue::new("dc.type", " thesis ").unwrap()];
        let article = vec![MetadataValue::new("dc.type", "article").unwrap()];
        assert!(filter.accept_ingest(&thesis, None).await.unwrap());
        assert!(!filter.accept_ingest(&article, None).await.unwrap());
        assert!(!filter.accept_ingest(&[], None).await.unwrap());
    }

    #[tokio::test]
    async fn test_format_filter_requires_map() {
        let filter = ResourceFormatFilter::new(vec!["application/PDF".to_string()]);
        let pdf = ResourceMap::new(vec![resource("application/pdf")]);
        let mixed = ResourceMap::new(vec![resource("image/png"), resource("application/pdf")]);
        let images = ResourceMap::new(vec![resource("image/png")]);

        assert!(filter.accept_ingest(&[], Some(&pdf)).await.unwrap());
        assert!(filter.accept_ingest(&[], Some(&mixed)).await.unwrap());
        assert!(!filter.accept_ingest(&[], Some(&images)).await.unwrap());
        let err = filter.accept_ingest(&[], None).await.unwrap_err();
        assert!(matches!(err, HarvestError::FilterEvaluation(_)));
    }

    #[tokio::test]
    async fn test_default_filter_accepts() {
        assert!(AcceptAllFilter.accept_ingest(&[], None).await.unwrap());
    }
}
