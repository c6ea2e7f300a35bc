//! Filesystem record source.
//!
//! Walks a directory of harvested record files and crosswalks each one into
//! an [`IncomingRecord`]. A record file looks like:
//!
//! ```xml
//! <record>
//!   <header>
//!     <identifier>oai:example.org:42</identifier>
//!     <datestamp>2024-01-01T00:00:00Z</datestamp>
//!   </header>
//!   <metadata>
//!     <oai_dc:dc>
//!       <dc:title xml:lang="en">A</dc:title>
//!       <dc:date.issued>2020</dc:date.issued>
//!     </oai_dc:dc>
//!   </metadata>
//!   <resourceMap>
//!     <resource href="files/a.pdf" bundle="ORIGINAL" mimetype="application/pdf"/>
//!   </resourceMap>
//! </record>
//! ```
//!
//! Field elements are the children of the element inside `<metadata>`;
//! `dc:date.issued` becomes the field `dc.date.issued`; elements that do not
//! name a field are skipped. Resource `href`s are resolved against the
//! directory holding the record file and must stay inside it.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

use oai_harvest_core::models::{
    IncomingRecord, MetadataValue, RemoteResource, ResourceMap, ORIGINAL_BUNDLE,
};

use crate::config::Config;

/// One record file found by [`scan_records`].
#[derive(Debug)]
pub struct ScannedFile {
    pub path: PathBuf,
    /// Path relative to the scanned directory.
    pub relative: String,
    pub entry: ScanEntry,
}

#[derive(Debug)]
pub enum ScanEntry {
    Record(IncomingRecord),
    /// The source marked the record deleted; carries its identifier.
    Deleted(String),
    /// The file could not be read or crosswalked.
    Invalid(String),
}

/// Parsed content of a single record file.
#[derive(Debug)]
pub enum ParsedRecord {
    Record(IncomingRecord),
    Deleted(String),
}

pub fn scan_records(config: &Config, dir: &Path) -> Result<Vec<ScannedFile>> {
    if !dir.is_dir() {
        bail!("Record directory does not exist: {}", dir.display());
    }

    let source = &config.source;
    let include_set = build_globset(&source.include_globs)?;

    let mut excludes = vec!["**/.git/**".to_string()];
    excludes.extend(source.exclude_globs.clone());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(source.follow_symlinks) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path
            .strip_prefix(dir)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string();
        if exclude_set.is_match(&relative) || !include_set.is_match(&relative) {
            continue;
        }

        let entry = match read_record_file(path) {
            Ok(ParsedRecord::Record(record)) => ScanEntry::Record(record),
            Ok(ParsedRecord::Deleted(id)) => ScanEntry::Deleted(id),
            Err(err) => ScanEntry::Invalid(format!("{:#}", err)),
        };
        files.push(ScannedFile {
            path: path.to_path_buf(),
            relative,
            entry,
        });
    }

    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(files)
}

fn read_record_file(path: &Path) -> Result<ParsedRecord> {
    let xml = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    parse_record(&xml, base_dir)
}

/// Crosswalk one record document. Resource files are read from `base_dir`.
pub fn parse_record(xml: &str, base_dir: &Path) -> Result<ParsedRecord> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<String> = Vec::new();
    let mut text = String::new();
    let mut field_lang: Option<String> = None;

    let mut remote_id: Option<String> = None;
    let mut datestamp: Option<DateTime<Utc>> = None;
    let mut deleted = false;
    let mut metadata: Vec<MetadataValue> = Vec::new();
    let mut resources: Option<Vec<RemoteResource>> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = qualified_name(&e);
                match local(&name) {
                    "header" => deleted |= is_deleted(&e)?,
                    "resourceMap" => {
                        resources.get_or_insert_with(Vec::new);
                    }
                    "resource" if parent_is(&stack, "resourceMap") => {
                        resources
                            .get_or_insert_with(Vec::new)
                            .push(read_resource(&e, base_dir)?);
                    }
                    _ => {}
                }
                if is_field_position(&stack, stack.len()) {
                    field_lang = attribute(&e, b"xml:lang")?;
                }
                stack.push(name);
                text.clear();
            }
            Event::Empty(e) => {
                let name = qualified_name(&e);
                match local(&name) {
                    "header" => deleted |= is_deleted(&e)?,
                    "resourceMap" => {
                        resources.get_or_insert_with(Vec::new);
                    }
                    "resource" if parent_is(&stack, "resourceMap") => {
                        resources
                            .get_or_insert_with(Vec::new)
                            .push(read_resource(&e, base_dir)?);
                    }
                    _ => {}
                }
            }
            Event::Text(t) => text.push_str(&t.unescape()?),
            Event::CData(c) => text.push_str(&String::from_utf8_lossy(&c.into_inner())),
            Event::End(_) => {
                let depth = stack.len().saturating_sub(1);
                let Some(name) = stack.pop() else {
                    bail!("unbalanced closing tag");
                };
                let value = text.trim().to_string();
                text.clear();

                if is_field_position(&stack, depth) {
                    let lang = field_lang.take();
                    if value.is_empty() {
                        continue;
                    }
                    match MetadataValue::new(&field_name(&name), value) {
                        Ok(mv) => metadata.push(match lang {
                            Some(lang) => mv.with_language(lang),
                            None => mv,
                        }),
                        Err(err) => warn!(element = %name, error = %err, "skipping metadata element"),
                    }
                    continue;
                }

                if parent_is_header(&stack) {
                    match local(&name) {
                        "identifier" => remote_id = Some(value),
                        "datestamp" if !value.is_empty() => {
                            datestamp = Some(parse_datestamp(&value)?)
                        }
                        _ => {}
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let remote_id = remote_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| anyhow!("record has no header identifier"))?;

    if deleted {
        return Ok(ParsedRecord::Deleted(remote_id));
    }

    let mut record = IncomingRecord::new(remote_id, metadata);
    record.datestamp = datestamp;
    if let Some(resources) = resources {
        record = record.with_resource_map(ResourceMap::new(resources));
    }
    Ok(ParsedRecord::Record(record))
}

fn qualified_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn local(name: &str) -> &str {
    name.split_once(':').map_or(name, |(_, l)| l)
}

/// `dc:date.issued` -> `dc.date.issued`
fn field_name(qualified: &str) -> String {
    match qualified.split_once(':') {
        Some((prefix, rest)) => format!("{}.{}", prefix, rest),
        None => qualified.to_string(),
    }
}

fn parent_is(stack: &[String], parent: &str) -> bool {
    stack.last().is_some_and(|p| local(p) == parent)
}

fn parent_is_header(stack: &[String]) -> bool {
    parent_is(stack, "header")
}

/// Whether an element at `depth` sits directly inside the container under `<metadata>`.
fn is_field_position(stack: &[String], depth: usize) -> bool {
    stack
        .iter()
        .position(|s| local(s) == "metadata")
        .is_some_and(|m| depth == m + 2)
}

fn attribute(e: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == key {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

fn is_deleted(e: &BytesStart<'_>) -> Result<bool> {
    Ok(attribute(e, b"status")?.as_deref() == Some("deleted"))
}

fn read_resource(e: &BytesStart<'_>, base_dir: &Path) -> Result<RemoteResource> {
    let href = attribute(e, b"href")?.ok_or_else(|| anyhow!("resource without href"))?;
    let path = base_dir.join(&href);
    let resolved = path
        .canonicalize()
        .with_context(|| format!("Failed to read resource {}", path.display()))?;
    let root = base_dir
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", base_dir.display()))?;
    if !resolved.starts_with(&root) {
        bail!("resource {} points outside {}", href, base_dir.display());
    }
    let content = std::fs::read(&resolved)
        .with_context(|| format!("Failed to read resource {}", path.display()))?;

    let name = match attribute(e, b"name")? {
        Some(name) => name,
        None => Path::new(&href)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or(href),
    };

    Ok(RemoteResource {
        name,
        bundle: attribute(e, b"bundle")?.unwrap_or_else(|| ORIGINAL_BUNDLE.to_string()),
        mime_type: attribute(e, b"mimetype")?
            .unwrap_or_else(|| "application/octet-stream".to_string()),
        content,
    })
}

fn parse_datestamp(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
        .ok_or_else(|| anyhow!("invalid datestamp: '{}'", value))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
