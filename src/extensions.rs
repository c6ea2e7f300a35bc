//! Extension selection.
//!
//! Maps the `[harvest]` config table onto the core's built-in filters,
//! metadata removers, bundle versioning strategies and ingestion workflows.

use anyhow::{bail, Context, Result};

use oai_harvest_core::models::FieldSelector;
use oai_harvest_core::traits::{
    AcceptAllFilter, AllMetadataRemover, AuthorityMetadataRemover, BackupBundleVersioning,
    BundleVersioningStrategy, FieldValueFilter, IngestFilter, MetadataRemover,
    NoopBundleVersioning, NoopMetadataRemover, ReplaceAllBundles, ResourceFormatFilter,
};
use oai_harvest_core::workflow::{
    ArchiveIngestionWorkflow, IngestionWorkflow, ReviewIngestionWorkflow,
};
use oai_harvest_core::{HarvestOptions, Harvester};

use crate::config::{parse_selectors, Config, HarvestConfig};

/// Build a [`Harvester`] wired with the extensions named in `config`.
pub fn build_harvester(config: &Config) -> Result<Harvester> {
    let harvest = &config.harvest;

    let mut harvester = Harvester::new(build_workflow(harvest)?)
        .with_filter(build_filter(harvest)?)
        .with_options(HarvestOptions {
            filter_on_create: harvest.filter_on_create,
            record_rejected: harvest.record_rejected,
            actor: config.repository.admin_actor.clone(),
            preserve_fields: parse_selectors("harvest.preserve_fields", &harvest.preserve_fields)?,
        });

    if let Some(remover) = build_remover(harvest)? {
        harvester = harvester.with_metadata_remover(remover);
    }
    if let Some(versioning) = build_versioning(harvest)? {
        harvester = harvester.with_bundle_versioning(versioning);
    }
    Ok(harvester)
}

fn build_workflow(harvest: &HarvestConfig) -> Result<Box<dyn IngestionWorkflow>> {
    Ok(match harvest.ingest_workflow.as_str() {
        "archive" => Box::new(ArchiveIngestionWorkflow::new(harvest.compare_checksums)),
        "review" => Box::new(ReviewIngestionWorkflow::new(harvest.compare_checksums)),
        other => bail!("Unknown ingest workflow: '{}'", other),
    })
}

fn build_filter(harvest: &HarvestConfig) -> Result<Box<dyn IngestFilter>> {
    Ok(match harvest.ingest_filter.as_str() {
        "none" => Box::new(AcceptAllFilter),
        "field" => {
            let Some(f) = &harvest.field_filter else {
                bail!("ingest_filter = \"field\" requires a [harvest.field_filter] table");
            };
            let selector = FieldSelector::parse(&f.field)
                .with_context(|| format!("invalid harvest.field_filter.field: '{}'", f.field))?;
            Box::new(FieldValueFilter::new(selector, f.allowed.clone()))
        }
        "format" => {
            let Some(f) = &harvest.format_filter else {
                bail!("ingest_filter = \"format\" requires a [harvest.format_filter] table");
            };
            Box::new(ResourceFormatFilter::new(f.mime_types.clone()))
        }
        other => bail!("Unknown ingest filter: '{}'", other),
    })
}

fn build_remover(harvest: &HarvestConfig) -> Result<Option<Box<dyn MetadataRemover>>> {
    Ok(match harvest.metadata_remover.as_deref() {
        None => None,
        Some("none") => Some(Box::new(NoopMetadataRemover)),
        Some("all") => Some(Box::new(AllMetadataRemover)),
        Some("authority") => {
            let fields = parse_selectors("harvest.authority_fields", &harvest.authority_fields)?;
            Some(Box::new(AuthorityMetadataRemover::new(fields)))
        }
        Some(other) => bail!("Unknown metadata remover: '{}'", other),
    })
}

fn build_versioning(harvest: &HarvestConfig) -> Result<Option<Box<dyn BundleVersioningStrategy>>> {
    Ok(match harvest.bundle_versioning.as_deref() {
        None => None,
        Some("none") => Some(Box::new(NoopBundleVersioning)),
        Some("all") => Some(Box::new(ReplaceAllBundles)),
        Some("backup") => Some(Box::new(BackupBundleVersioning)),
        Some(other) => bail!("Unknown bundle versioning: '{}'", other),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(extra: &str) -> Config {
        toml::from_str(&format!("[db]\npath = \"x\"\n{}", extra)).unwrap()
    }

    #[test]
    fn test_defaults_leave_pipeline_defaults() {
        let harvester = build_harvester(&config("")).unwrap();
        assert_eq!(
            harvester.describe(),
            "filter=none remover=default versioning=default workflow=archive"
        );
        assert_eq!(harvester.options().actor, "harvester");
    }

    #[test]
    fn test_named_extensions() {
        let harvester = build_harvester(&config(
            r#"
[repository]
admin_actor = "batch"

[harvest]
ingest_workflow = "review"
ingest_filter = "format"
metadata_remover = "authority"
authority_fields = ["dc.title"]
bundle_versioning = "backup"
preserve_fields = ["dc.date.embargoenddate"]
record_rejected = true

[harvest.format_filter]
mime_types = ["application/pdf"]
"#,
        ))
        .unwrap();
        assert_eq!(
            harvester.describe(),
            "filter=format remover=authority versioning=backup workflow=review"
        );
        let options = harvester.options();
        assert_eq!(options.actor, "batch");
        assert!(options.record_rejected);
        assert_eq!(options.preserve_fields.len(), 1);
    }

    #[test]
    fn test_field_filter_without_table_fails() {
        let err = build_harvester(&config("[harvest]\ningest_filter = \"field\"\n"));
        assert!(err.is_err());
    }
}
