use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::domain::{ImportMode, LinkType};
use crate::error::MyrigetError;
use crate::events::{self, ProgressSink};
use crate::sanitize::sanitize;
use crate::transfer::HttpSource;

/// One tracked library item. Field names are the on-disk format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub url: String,
    #[serde(default)]
    pub link_type: LinkType,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_size")]
    pub size_bytes: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub downloaded: bool,
    #[serde(default)]
    pub extracted: bool,
    #[serde(default)]
    pub copied: bool,
    #[serde(default)]
    pub processed: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub imported: bool,
    #[serde(default)]
    pub output_path: Option<String>,
    #[serde(default)]
    pub god_converted: bool,
    #[serde(default)]
    pub god_conversion_started: bool,
    #[serde(default)]
    pub god_conversion_completed: bool,
    #[serde(default)]
    pub god_conversion_date: Option<String>,
    #[serde(default)]
    pub god_output_path: Option<String>,
    #[serde(default)]
    pub god_conversion_error: Option<String>,
    #[serde(default)]
    pub god_conversion_progress: u8,
    /// Keys this version does not know about survive a load/save cycle.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_enabled() -> bool {
    true
}

fn lenient_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(number)) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|v| *v > 0.0).map(|v| v as u64))
            .unwrap_or(0),
        Some(Value::String(text)) => text.trim().parse().unwrap_or(0),
        _ => 0,
    })
}

impl ManifestEntry {
    pub fn new(url: impl Into<String>, link_type: LinkType) -> Self {
        let url = url.into();
        Self {
            name: sanitize(&url),
            url,
            link_type,
            size_bytes: 0,
            enabled: true,
            downloaded: false,
            extracted: false,
            copied: false,
            processed: false,
            deleted: false,
            imported: false,
            output_path: None,
            god_converted: false,
            god_conversion_started: false,
            god_conversion_completed: false,
            god_conversion_date: None,
            god_output_path: None,
            god_conversion_error: None,
            god_conversion_progress: 0,
            extra: Map::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded && self.extracted && self.copied
    }

    pub fn is_iso(&self) -> bool {
        self.link_type == LinkType::Iso
    }

    pub fn size_mb(&self) -> u64 {
        self.size_bytes / (1024 * 1024)
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.url
        } else {
            &self.name
        }
    }
}

pub fn load(path: &Path) -> Result<Vec<ManifestEntry>, MyrigetError> {
    if !path.exists() {
        return Err(MyrigetError::ManifestMissing(path.to_path_buf()));
    }
    let content = fs::read_to_string(path).map_err(MyrigetError::fs)?;
    let value: Value =
        serde_json::from_str(&content).map_err(|err| MyrigetError::ManifestParse(err.to_string()))?;
    entries_from_value(value)
}

/// Validates the shape of a parsed manifest and converts it into entries.
pub fn entries_from_value(value: Value) -> Result<Vec<ManifestEntry>, MyrigetError> {
    let Value::Array(items) = value else {
        return Err(MyrigetError::ManifestParse(
            "expected a JSON array of entries".to_string(),
        ));
    };
    items
        .into_iter()
        .enumerate()
        .map(|(idx, item)| {
            let Value::Object(object) = &item else {
                return Err(MyrigetError::ManifestSchema(format!(
                    "entry {idx} is not an object"
                )));
            };
            match object.get("url") {
                Some(Value::String(url)) if !url.trim().is_empty() => {}
                _ => {
                    return Err(MyrigetError::ManifestSchema(format!(
                        "entry {idx} is missing 'url'"
                    )));
                }
            }
            let mut entry: ManifestEntry = serde_json::from_value(item)
                .map_err(|err| MyrigetError::ManifestSchema(format!("entry {idx}: {err}")))?;
            if entry.name.trim().is_empty() {
                entry.name = sanitize(&entry.url);
            }
            Ok(entry)
        })
        .collect()
}

pub fn save(path: &Path, entries: &[ManifestEntry]) -> Result<(), MyrigetError> {
    let content = serde_json::to_vec_pretty(entries).map_err(MyrigetError::fs)?;
    write_atomic(path, &content)
}

fn save_values(path: &Path, entries: &[Value]) -> Result<(), MyrigetError> {
    let content = serde_json::to_vec_pretty(entries).map_err(MyrigetError::fs)?;
    write_atomic(path, &content)
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<(), MyrigetError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(MyrigetError::fs)?;
    let mut temp = tempfile::Builder::new()
        .prefix(".myriget-manifest")
        .tempfile_in(&parent)
        .map_err(MyrigetError::fs)?;
    std::io::Write::write_all(&mut temp, content).map_err(MyrigetError::fs)?;
    temp.persist(path).map_err(MyrigetError::fs)?;
    Ok(())
}

pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".bak");
    path.with_file_name(name)
}

/// Copies the current manifest next to itself with a `.bak` suffix.
pub fn backup(path: &Path) -> Result<PathBuf, MyrigetError> {
    let target = backup_path(path);
    fs::copy(path, &target).map_err(MyrigetError::fs)?;
    tracing::debug!("backed up {} to {}", path.display(), target.display());
    Ok(target)
}

/// Default values every entry is expected to carry.
#[derive(Debug, Clone)]
pub struct CanonicalSchema {
    pub common: Vec<(&'static str, Value)>,
    pub iso_only: Vec<(&'static str, Value)>,
}

impl Default for CanonicalSchema {
    fn default() -> Self {
        Self {
            common: vec![
                ("link_type", Value::from(LinkType::Unknown.as_str())),
                ("size_bytes", Value::from(0u64)),
                ("enabled", Value::Bool(true)),
                ("downloaded", Value::Bool(false)),
                ("extracted", Value::Bool(false)),
                ("copied", Value::Bool(false)),
                ("processed", Value::Bool(false)),
                ("deleted", Value::Bool(false)),
                ("imported", Value::Bool(false)),
                ("output_path", Value::Null),
            ],
            iso_only: vec![
                ("god_converted", Value::Bool(false)),
                ("god_conversion_started", Value::Bool(false)),
                ("god_conversion_completed", Value::Bool(false)),
                ("god_conversion_date", Value::Null),
                ("god_output_path", Value::Null),
                ("god_conversion_error", Value::Null),
                ("god_conversion_progress", Value::from(0u8)),
            ],
        }
    }
}

/// Fills absent fields from `schema`; `name` is derived from the URL.
/// Returns whether anything changed.
pub fn fix_missing_fields(entries: &mut [Value], schema: &CanonicalSchema) -> bool {
    let mut changed = false;
    for entry in entries.iter_mut() {
        let Value::Object(object) = entry else {
            continue;
        };
        for (key, default) in &schema.common {
            if !object.contains_key(*key) {
                object.insert((*key).to_string(), default.clone());
                changed = true;
            }
        }
        if !object.contains_key("name") {
            if let Some(url) = object.get("url").and_then(Value::as_str) {
                let name = sanitize(url);
                object.insert("name".to_string(), Value::String(name));
                changed = true;
            }
        }
        let is_iso = object.get("link_type").and_then(Value::as_str) == Some(LinkType::Iso.as_str());
        if is_iso {
            for (key, default) in &schema.iso_only {
                if !object.contains_key(*key) {
                    object.insert((*key).to_string(), default.clone());
                    changed = true;
                }
            }
        }
    }
    changed
}

/// Runs [`fix_missing_fields`] against a manifest file, backing it up before
/// rewriting.
pub fn fix_missing_fields_file(path: &Path, schema: &CanonicalSchema) -> Result<bool, MyrigetError> {
    if !path.exists() {
        return Err(MyrigetError::ManifestMissing(path.to_path_buf()));
    }
    let content = fs::read_to_string(path).map_err(MyrigetError::fs)?;
    let value: Value =
        serde_json::from_str(&content).map_err(|err| MyrigetError::ManifestParse(err.to_string()))?;
    let Value::Array(mut entries) = value else {
        return Err(MyrigetError::ManifestParse(
            "expected a JSON array of entries".to_string(),
        ));
    };
    if !fix_missing_fields(&mut entries, schema) {
        return Ok(false);
    }
    backup(path)?;
    save_values(path, &entries)?;
    Ok(true)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub added: usize,
    pub duplicates: usize,
    pub size_updates: usize,
    pub total: usize,
}

/// Unions `secondary` into `primary` by URL and persists the result.
pub fn merge(primary_path: &Path, secondary_path: &Path) -> Result<MergeReport, MyrigetError> {
    if !primary_path.exists() {
        return Err(MyrigetError::MergeInputMissing(primary_path.to_path_buf()));
    }
    if !secondary_path.exists() {
        return Err(MyrigetError::MergeInputMissing(secondary_path.to_path_buf()));
    }
    let mut primary = load(primary_path)?;
    let secondary = load(secondary_path)?;
    backup(primary_path)?;

    let report = merge_entries(&mut primary, secondary);
    save(primary_path, &primary)?;
    tracing::info!(
        added = report.added,
        duplicates = report.duplicates,
        size_updates = report.size_updates,
        "merged manifests"
    );
    Ok(report)
}

pub fn merge_entries(primary: &mut Vec<ManifestEntry>, secondary: Vec<ManifestEntry>) -> MergeReport {
    let mut report = MergeReport::default();
    for incoming in secondary {
        match primary.iter_mut().find(|entry| entry.url == incoming.url) {
            Some(existing) => {
                report.duplicates += 1;
                if existing.size_bytes == 0 && incoming.size_bytes > 0 {
                    existing.size_bytes = incoming.size_bytes;
                    report.size_updates += 1;
                }
            }
            None => {
                primary.push(incoming);
                report.added += 1;
            }
        }
    }
    report.total = primary.len();
    report
}

/// Keeps the first entry for each URL. Returns how many were dropped.
pub fn dedupe(entries: &mut Vec<ManifestEntry>) -> usize {
    let before = entries.len();
    let mut seen = HashSet::new();
    entries.retain(|entry| seen.insert(entry.url.clone()));
    before - entries.len()
}

/// Fetches a remote manifest and replaces or extends the local one.
/// Returns the resulting entry count.
pub fn import_from_url(
    source: &dyn HttpSource,
    url: &str,
    manifest_path: &Path,
    mode: ImportMode,
    sink: &dyn ProgressSink,
) -> Result<usize, MyrigetError> {
    let result = import_inner(source, url, manifest_path, mode);
    match &result {
        Ok(count) => events::status(sink, format!("Successfully imported {count} links")),
        Err(err) => events::warn(sink, format!("Error importing links: {err}")),
    }
    result
}

fn import_inner(
    source: &dyn HttpSource,
    url: &str,
    manifest_path: &Path,
    mode: ImportMode,
) -> Result<usize, MyrigetError> {
    let value = source.get_json(url)?;
    let mut incoming = entries_from_value(value)?;
    dedupe(&mut incoming);

    let final_entries = match mode {
        ImportMode::Replace => incoming,
        ImportMode::Append => {
            let mut existing = if manifest_path.exists() {
                load(manifest_path)?
            } else {
                Vec::new()
            };
            let seen: HashSet<String> = existing.iter().map(|entry| entry.url.clone()).collect();
            existing.extend(incoming.into_iter().filter(|entry| !seen.contains(&entry.url)));
            existing
        }
    };
    save(manifest_path, &final_entries)?;
    Ok(final_entries.len())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UrlListReport {
    pub added: usize,
    pub skipped: usize,
    pub total: usize,
}

/// Builds entries from a plain URL list and writes them into the manifest.
pub fn process_urls(
    manifest_path: &Path,
    urls: &[String],
    mode: ImportMode,
    link_type: LinkType,
    sink: &dyn ProgressSink,
) -> Result<UrlListReport, MyrigetError> {
    let cleaned: Vec<&str> = urls
        .iter()
        .map(|url| url.trim())
        .filter(|url| !url.is_empty())
        .collect();

    let mut fresh = Vec::with_capacity(cleaned.len());
    for (idx, url) in cleaned.iter().enumerate() {
        events::progress(sink, (idx + 1) as f32 / cleaned.len() as f32 * 100.0);
        fresh.push(ManifestEntry::new(*url, link_type));
    }

    let mut existing = Vec::new();
    if mode == ImportMode::Append && manifest_path.exists() {
        match load(manifest_path) {
            Ok(entries) => existing = entries,
            Err(err) => events::warn(
                sink,
                format!("Warning: existing manifest is invalid ({err}), creating new file"),
            ),
        }
    }

    let mut seen: HashSet<String> = existing.iter().map(|entry| entry.url.clone()).collect();
    let before = fresh.len();
    fresh.retain(|entry| seen.insert(entry.url.clone()));
    let report = UrlListReport {
        added: fresh.len(),
        skipped: before - fresh.len(),
        total: existing.len() + fresh.len(),
    };

    match mode {
        ImportMode::Append => events::status(
            sink,
            format!(
                "Added {} new {link_type} links to existing {} links",
                report.added,
                existing.len()
            ),
        ),
        ImportMode::Replace => events::status(
            sink,
            format!("Replaced manifest with {} new {link_type} links", report.added),
        ),
    }

    existing.extend(fresh);
    save(manifest_path, &existing)?;
    events::status(sink, "Manifest has been saved successfully");
    events::progress(sink, 100.0);
    Ok(report)
}

/// Clears pipeline flags so entries are picked up again. `only_url` limits the
/// reset to a single entry.
pub fn reset_pipeline_flags(entries: &mut [ManifestEntry], only_url: Option<&str>) -> usize {
    let mut changed = 0;
    for entry in entries
        .iter_mut()
        .filter(|entry| only_url.is_none_or(|url| entry.url == url))
    {
        let dirty = entry.downloaded
            || entry.extracted
            || entry.copied
            || entry.processed
            || entry.deleted
            || entry.output_path.is_some();
        entry.downloaded = false;
        entry.extracted = false;
        entry.copied = false;
        entry.processed = false;
        entry.deleted = false;
        entry.output_path = None;
        if dirty {
            changed += 1;
        }
    }
    changed
}

pub fn reset_god_status(entries: &mut [ManifestEntry]) -> usize {
    let mut changed = 0;
    for entry in entries.iter_mut() {
        let dirty = entry.god_converted
            || entry.god_conversion_started
            || entry.god_conversion_completed
            || entry.god_conversion_date.is_some()
            || entry.god_output_path.is_some()
            || entry.god_conversion_error.is_some()
            || entry.god_conversion_progress != 0;
        entry.god_converted = false;
        entry.god_conversion_started = false;
        entry.god_conversion_completed = false;
        entry.god_conversion_date = None;
        entry.god_output_path = None;
        entry.god_conversion_error = None;
        entry.god_conversion_progress = 0;
        if dirty {
            changed += 1;
        }
    }
    changed
}
