//! TOML configuration for the `hvst` binary.
//!
//! See `config/hvst.example.toml` for every key with its default.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use oai_harvest_core::models::{FieldSelector, ReviewEngine};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub harvest: HarvestConfig,
    #[serde(default)]
    pub source: SourceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RepositoryConfig {
    #[serde(default = "default_handle_prefix")]
    pub handle_prefix: String,
    #[serde(default = "default_review_engine")]
    pub review_engine: String,
    #[serde(default = "default_actor")]
    pub admin_actor: String,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            handle_prefix: default_handle_prefix(),
            review_engine: default_review_engine(),
            admin_actor: default_actor(),
        }
    }
}

impl RepositoryConfig {
    pub fn engine(&self) -> Result<ReviewEngine> {
        self.review_engine
            .parse::<ReviewEngine>()
            .map_err(anyhow::Error::msg)
    }
}

fn default_handle_prefix() -> String {
    "123456789".to_string()
}
fn default_review_engine() -> String {
    "legacy".to_string()
}
fn default_actor() -> String {
    "harvester".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct HarvestConfig {
    #[serde(default = "default_workflow")]
    pub ingest_workflow: String,
    #[serde(default = "default_filter")]
    pub ingest_filter: String,
    /// Unset means the pipeline clears every field.
    #[serde(default)]
    pub metadata_remover: Option<String>,
    /// Unset means the pipeline replaces the bundles the resource map targets.
    #[serde(default)]
    pub bundle_versioning: Option<String>,
    #[serde(default)]
    pub filter_on_create: bool,
    #[serde(default)]
    pub record_rejected: bool,
    #[serde(default = "default_true")]
    pub compare_checksums: bool,
    #[serde(default)]
    pub preserve_fields: Vec<String>,
    #[serde(default)]
    pub authority_fields: Vec<String>,
    #[serde(default)]
    pub field_filter: Option<FieldFilterConfig>,
    #[serde(default)]
    pub format_filter: Option<FormatFilterConfig>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            ingest_workflow: default_workflow(),
            ingest_filter: default_filter(),
            metadata_remover: None,
            bundle_versioning: None,
            filter_on_create: false,
            record_rejected: false,
            compare_checksums: true,
            preserve_fields: Vec::new(),
            authority_fields: Vec::new(),
            field_filter: None,
            format_filter: None,
        }
    }
}

fn default_workflow() -> String {
    "archive".to_string()
}
fn default_filter() -> String {
    "none".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct FieldFilterConfig {
    pub field: String,
    pub allowed: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FormatFilterConfig {
    pub mime_types: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.xml".to_string()]
}

/// Parse a list of field selectors, naming the config key on failure.
pub fn parse_selectors(key: &str, fields: &[String]) -> Result<Vec<FieldSelector>> {
    fields
        .iter()
        .map(|f| {
            FieldSelector::parse(f).with_context(|| format!("invalid field in {}: '{}'", key, f))
        })
        .collect()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    config.repository.engine()?;

    if config.repository.handle_prefix.trim().is_empty() {
        bail!("repository.handle_prefix must not be empty");
    }
    if config.repository.admin_actor.trim().is_empty() {
        bail!("repository.admin_actor must not be empty");
    }

    let harvest = &config.harvest;
    match harvest.ingest_workflow.as_str() {
        "archive" | "review" => {}
        other => bail!(
            "Unknown ingest workflow: '{}'. Must be archive or review.",
            other
        ),
    }

    match harvest.ingest_filter.as_str() {
        "none" => {}
        "field" => match &harvest.field_filter {
            Some(f) => {
                FieldSelector::parse(&f.field)
                    .with_context(|| format!("invalid harvest.field_filter.field: '{}'", f.field))?;
                if f.allowed.is_empty() {
                    bail!("harvest.field_filter.allowed must not be empty");
                }
            }
            None => bail!("ingest_filter = \"field\" requires a [harvest.field_filter] table"),
        },
        "format" => match &harvest.format_filter {
            Some(f) if !f.mime_types.is_empty() => {}
            _ => bail!("ingest_filter = \"format\" requires harvest.format_filter.mime_types"),
        },
        other => bail!(
            "Unknown ingest filter: '{}'. Must be none, field, or format.",
            other
        ),
    }

    match harvest.metadata_remover.as_deref() {
        None | Some("none") | Some("all") => {}
        Some("authority") => {
            if harvest.authority_fields.is_empty() {
                bail!("metadata_remover = \"authority\" requires harvest.authority_fields");
            }
        }
        Some(other) => bail!(
            "Unknown metadata remover: '{}'. Must be none, all, or authority.",
            other
        ),
    }

    match harvest.bundle_versioning.as_deref() {
        None | Some("none") | Some("all") | Some("backup") => {}
        Some(other) => bail!(
            "Unknown bundle versioning: '{}'. Must be none, all, or backup.",
            other
        ),
    }

    parse_selectors("harvest.preserve_fields", &harvest.preserve_fields)?;
    parse_selectors("harvest.authority_fields", &harvest.authority_fields)?;

    if config.source.include_globs.is_empty() {
        bail!("source.include_globs must not be empty");
    }

    Ok(())
}
