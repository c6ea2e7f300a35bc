//! Core data models used throughout OAI Harvest.
//!
//! These types describe the local repository as the pipeline sees it
//! (items, workspace items, bundles, bitstreams, metadata values), the
//! incoming harvested record, and the harvest binding between the two.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{HarvestError, Result};

/// Bundle holding the primary content of an item.
pub const ORIGINAL_BUNDLE: &str = "ORIGINAL";
/// Bundle that receives superseded primary content under the backup versioning strategy.
pub const BACKUP_BUNDLE: &str = "BACKUP";

/// Identifier of a local item. Stable across lifecycle-stage transitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a target collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionId(String);

impl CollectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CollectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for CollectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CollectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a local item currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStage {
    Workspace,
    LegacyWorkflow,
    ConfigurableWorkflow,
    Archived,
    Withdrawn,
}

/// Order in which identity resolution consults the stage indexes.
///
/// Archived items are the common case and short-circuit the rest.
pub const RESOLUTION_ORDER: [LifecycleStage; 4] = [
    LifecycleStage::Archived,
    LifecycleStage::LegacyWorkflow,
    LifecycleStage::Workspace,
    LifecycleStage::ConfigurableWorkflow,
];

impl LifecycleStage {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleStage::Workspace => "workspace",
            LifecycleStage::LegacyWorkflow => "legacy_workflow",
            LifecycleStage::ConfigurableWorkflow => "configurable_workflow",
            LifecycleStage::Archived => "archived",
            LifecycleStage::Withdrawn => "withdrawn",
        }
    }

    pub fn is_in_review(self) -> bool {
        matches!(
            self,
            LifecycleStage::LegacyWorkflow | LifecycleStage::ConfigurableWorkflow
        )
    }
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two structurally distinct review workflow engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewEngine {
    #[default]
    Legacy,
    Configurable,
}

impl ReviewEngine {
    /// Lifecycle stage an item occupies while under review by this engine.
    pub fn stage(self) -> LifecycleStage {
        match self {
            ReviewEngine::Legacy => LifecycleStage::LegacyWorkflow,
            ReviewEngine::Configurable => LifecycleStage::ConfigurableWorkflow,
        }
    }
}

impl FromStr for ReviewEngine {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "legacy" => Ok(ReviewEngine::Legacy),
            "configurable" | "xmlworkflow" => Ok(ReviewEngine::Configurable),
            other => Err(format!(
                "unknown review engine '{}'. Must be legacy or configurable.",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Collection {
    pub id: CollectionId,
    pub name: String,
}

/// A local item as exposed by the content store.
///
/// Workspace and in-review items have no owning collection; archived and
/// withdrawn items do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Item {
    pub id: ItemId,
    pub handle: Option<String>,
    pub owning_collection: Option<CollectionId>,
    pub in_archive: bool,
    pub withdrawn: bool,
    pub last_modified: DateTime<Utc>,
}

/// Pre-submission wrapper around an item that is not yet installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceItem {
    pub id: String,
    pub item_id: ItemId,
    pub collection: CollectionId,
}

/// One metadata field value on an item (`schema.element.qualifier`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataValue {
    pub schema: String,
    pub element: String,
    pub qualifier: Option<String>,
    pub language: Option<String>,
    pub value: String,
}

impl MetadataValue {
    /// Build a value from a dotted field name such as `dc.title.alternative`.
    pub fn new(field: &str, value: impl Into<String>) -> Result<Self> {
        let (schema, element, qualifier) = split_field(field)?;
        Ok(Self {
            schema: schema.to_string(),
            element: element.to_string(),
            qualifier: qualifier.map(str::to_string),
            language: None,
            value: value.into(),
        })
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Dotted field name, e.g. `dc.contributor.author`.
    pub fn field(&self) -> String {
        match &self.qualifier {
            Some(q) => format!("{}.{}.{}", self.schema, self.element, q),
            None => format!("{}.{}", self.schema, self.element),
        }
    }
}

fn split_field(field: &str) -> Result<(&str, &str, Option<&str>)> {
    let parts: Vec<&str> = field.split('.').collect();
    if parts.len() < 2 || parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(HarvestError::Harvesting(format!(
            "invalid metadata field: {}",
            field
        )));
    }
    Ok((parts[0], parts[1], parts.get(2).copied()))
}

/// How one component of a [`FieldSelector`] matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Match {
    Any,
    /// Only meaningful for qualifiers: the value must be unqualified.
    Absent,
    Exact(String),
}

impl Match {
    fn matches(&self, value: Option<&str>) -> bool {
        match self {
            Match::Any => true,
            Match::Absent => value.is_none(),
            Match::Exact(expected) => value == Some(expected.as_str()),
        }
    }

    fn parse(part: &str) -> Self {
        if part == "*" {
            Match::Any
        } else {
            Match::Exact(part.to_string())
        }
    }
}

/// Selects metadata values by schema, element and qualifier.
///
/// Parsed from `schema.element[.qualifier]` with `*` as a per-component
/// wildcard. A missing qualifier selects unqualified values only; the
/// language is never constrained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSelector {
    pub schema: Match,
    pub element: Match,
    pub qualifier: Match,
}

impl FieldSelector {
    /// Selects every value on the item.
    pub fn any() -> Self {
        Self {
            schema: Match::Any,
            element: Match::Any,
            qualifier: Match::Any,
        }
    }

    pub fn parse(field: &str) -> Result<Self> {
        let field = field.trim();
        if field == "*" {
            return Ok(Self::any());
        }
        let (schema, element, qualifier) = split_field(field)?;
        Ok(Self {
            schema: Match::parse(schema),
            element: Match::parse(element),
            qualifier: qualifier.map(Match::parse).unwrap_or(Match::Absent),
        })
    }

    pub fn matches(&self, value: &MetadataValue) -> bool {
        self.schema.matches(Some(&value.schema))
            && self.element.matches(Some(&value.element))
            && self.qualifier.matches(value.qualifier.as_deref())
    }

    pub fn is_any(&self) -> bool {
        self.schema == Match::Any && self.element == Match::Any && self.qualifier == Match::Any
    }
}

impl fmt::Display for FieldSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn part(m: &Match) -> &str {
            match m {
                Match::Any => "*",
                Match::Absent => "",
                Match::Exact(s) => s,
            }
        }
        if self.is_any() {
            return f.write_str("*");
        }
        write!(f, "{}.{}", part(&self.schema), part(&self.element))?;
        if self.qualifier != Match::Absent {
            write!(f, ".{}", part(&self.qualifier))?;
        }
        Ok(())
    }
}

/// A named grouping of bitstreams on an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bundle {
    pub id: String,
    pub item_id: ItemId,
    pub name: String,
}

/// A stored file within a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bitstream {
    pub id: String,
    pub bundle_id: String,
    pub sequence: i64,
    pub name: String,
    pub mime_type: String,
    pub size_bytes: i64,
    /// Hex SHA-256 of the content.
    pub checksum: String,
}

/// Content to be written as a new bitstream.
#[derive(Debug, Clone)]
pub struct NewBitstream {
    pub name: String,
    pub mime_type: String,
    pub content: Vec<u8>,
}

impl NewBitstream {
    pub fn checksum(&self) -> String {
        checksum(&self.content)
    }
}

/// Hex-encoded SHA-256 of `bytes`.
pub fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// One file aggregated by a remote resource map, already fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteResource {
    pub name: String,
    pub bundle: String,
    pub mime_type: String,
    pub content: Vec<u8>,
}

impl RemoteResource {
    pub fn checksum(&self) -> String {
        checksum(&self.content)
    }

    pub fn to_new_bitstream(&self) -> NewBitstream {
        NewBitstream {
            name: self.name.clone(),
            mime_type: self.mime_type.clone(),
            content: self.content.clone(),
        }
    }
}

/// Files that accompany a harvested record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceMap {
    pub resources: Vec<RemoteResource>,
}

impl ResourceMap {
    pub fn new(resources: Vec<RemoteResource>) -> Self {
        Self { resources }
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Distinct bundle names targeted by this map.
    pub fn bundle_names(&self) -> BTreeSet<&str> {
        self.resources.iter().map(|r| r.bundle.as_str()).collect()
    }
}

/// A record delivered by the harvesting driver.
#[derive(Debug, Clone)]
pub struct IncomingRecord {
    pub remote_id: String,
    pub datestamp: Option<DateTime<Utc>>,
    /// Persistent identifier to install new items under, if the source supplies one.
    pub handle: Option<String>,
    pub metadata: Vec<MetadataValue>,
    pub resource_map: Option<ResourceMap>,
}

impl IncomingRecord {
    pub fn new(remote_id: impl Into<String>, metadata: Vec<MetadataValue>) -> Self {
        Self {
            remote_id: remote_id.into(),
            datestamp: None,
            handle: None,
            metadata,
            resource_map: None,
        }
    }

    pub fn with_resource_map(mut self, map: ResourceMap) -> Self {
        self.resource_map = Some(map);
        self
    }
}

/// Binding between a remote record identifier and a local item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HarvestRecord {
    pub item_id: ItemId,
    pub remote_id: String,
    pub last_harvested: DateTime<Utc>,
}

impl HarvestRecord {
    pub fn new(item_id: ItemId, remote_id: impl Into<String>) -> Self {
        Self {
            item_id,
            remote_id: remote_id.into(),
            last_harvested: Utc::now(),
        }
    }

    /// Set the synchronization timestamp, defaulting to now.
    pub fn set_harvest_date(&mut self, date: Option<DateTime<Utc>>) {
        self.last_harvested = date.unwrap_or_else(Utc::now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(field: &str) -> MetadataValue {
        MetadataValue::new(field, "v").unwrap()
    }

    #[test]
    fn test_metadata_value_from_field() {
        let v = MetadataValue::new("dc.title.alternative", "Alt").unwrap();
        assert_eq!(v.schema, "dc");
        assert_eq!(v.element, "title");
        assert_eq!(v.qualifier.as_deref(), Some("alternative"));
        assert_eq!(v.field(), "dc.title.alternative");
        assert_eq!(value("dc.title").field(), "dc.title");
    }

    #[test]
    fn test_invalid_fields_rejected() {
        assert!(MetadataValue::new("dc", "x").is_err());
        assert!(MetadataValue::new("dc.a.b.c", "x").is_err());
        assert!(FieldSelector::parse("dc..x").is_err());
    }

    #[test]
    fn test_selector_unqualified_only() {
        let sel = FieldSelector::parse("dc.title").unwrap();
        assert!(sel.matches(&value("dc.title")));
        assert!(!sel.matches(&value("dc.title.alternative")));
        assert!(!sel.matches(&value("dc.date")));
    }

    #[test]
    fn test_selector_wildcards() {
        let sel = FieldSelector::parse("dc.contributor.*").unwrap();
        assert!(sel.matches(&value("dc.contributor")));
        assert!(sel.matches(&value("dc.contributor.author")));
        assert!(!sel.matches(&value("local.contributor.author")));

        let all = FieldSelector::parse("*").unwrap();
        assert!(all.is_any());
        assert!(all.matches(&value("x.y.z")));
        assert_eq!(all.to_string(), "*");
        assert_eq!(sel.to_string(), "dc.contributor.*");
    }

    #[test]
    fn test_resolution_order_is_archived_first() {
        assert_eq!(RESOLUTION_ORDER[0], LifecycleStage::Archived);
        assert_eq!(RESOLUTION_ORDER[1], LifecycleStage::LegacyWorkflow);
        assert_eq!(RESOLUTION_ORDER[2], LifecycleStage::Workspace);
        assert_eq!(RESOLUTION_ORDER[3], LifecycleStage::ConfigurableWorkflow);
    }

    #[test]
    fn test_review_engine_parse() {
        assert_eq!("legacy".parse::<ReviewEngine>(), Ok(ReviewEngine::Legacy));
        assert_eq!(
            "configurable".parse::<ReviewEngine>(),
            Ok(ReviewEngine::Configurable)
        );
        assert!("other".parse::<ReviewEngine>().is_err());
        assert_eq!(
            ReviewEngine::Configurable.stage(),
            LifecycleStage::ConfigurableWorkflow
        );
    }

    #[test]
    fn test_harvest_date_defaults_to_now() {
        let mut record = HarvestRecord::new(ItemId::new(), "oai:1");
        let fixed = DateTime::from_timestamp(1_000, 0).unwrap();
        record.set_harvest_date(Some(fixed));
        assert_eq!(record.last_harvested, fixed);
        record.set_harvest_date(None);
        assert!(record.last_harvested > fixed);
    }

    #[test]
    fn test_checksum_is_sha256_hex() {
        assert_eq!(
            checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
