use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::batch::{self, Candidate};
use crate::converter::{ConvertOptions, Converter};
use crate::domain::{BatchPolicy, EntryFilter};
use crate::error::MyrigetError;
use crate::events::{self, CancelToken, ProgressSink};
use crate::fs_util::{ArchiveKind, remove_best_effort};
use crate::manifest::{self, ManifestEntry};
use crate::publish::publish;
use crate::sanitize::url_basename;
use crate::transfer::{HttpSource, Transfer};
use crate::unpack::{archive_dir_name, extract};

#[derive(Debug, Clone)]
pub struct ConvertRequest {
    pub enabled: bool,
    /// Each game is written to `<god_output_dir>/<iso stem>`.
    pub god_output_dir: PathBuf,
    /// `game_title` is filled per entry from its name.
    pub options: ConvertOptions,
}

impl ConvertRequest {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            god_output_dir: PathBuf::new(),
            options: ConvertOptions::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub manifest_path: PathBuf,
    pub temp_dir: PathBuf,
    pub extract_dir: PathBuf,
    pub output_dir: PathBuf,
    pub policy: BatchPolicy,
    pub filter: EntryFilter,
    pub convert: ConvertRequest,
    /// Leave downloaded archives in `temp_dir` after a successful copy.
    pub keep_downloads: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Download,
    Extract,
    Copy,
    Convert,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Extract => "extract",
            Stage::Copy => "copy",
            Stage::Convert => "convert",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error that interrupted an entry, with the stage it happened in.
#[derive(Debug)]
struct EntryError {
    stage: Stage,
    error: MyrigetError,
}

/// Where an entry ended up after one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "stage")]
pub enum EntryOutcome {
    Complete,
    GodConverted,
    GodFailed,
    Failed(Stage),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    pub disabled: usize,
    pub invalid_urls: usize,
    pub converted: usize,
    pub conversion_failures: usize,
    pub batches: usize,
    pub cancelled: bool,
}

impl RunSummary {
    fn record(&mut self, outcome: EntryOutcome) {
        self.processed += 1;
        match outcome {
            EntryOutcome::Complete => self.completed += 1,
            EntryOutcome::GodConverted => {
                self.completed += 1;
                self.converted += 1;
            }
            EntryOutcome::GodFailed => {
                self.completed += 1;
                self.conversion_failures += 1;
            }
            EntryOutcome::Failed(_) => self.failed += 1,
        }
    }
}

fn url_shape() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?i)https?://\S+$").expect("static regex"))
}

/// An http(s) URL whose last segment names a supported archive that can be
/// extracted without leaving the extraction root.
pub fn is_processable_url(url: &str) -> bool {
    let url = url.trim();
    let basename = url_basename(url);
    url_shape().is_match(url)
        && ArchiveKind::from_name(basename).is_some()
        && archive_dir_name(basename).is_some()
}

pub fn matches_filter(entry: &ManifestEntry, filter: EntryFilter) -> bool {
    match filter {
        EntryFilter::All => true,
        EntryFilter::Incomplete => !entry.is_complete(),
        EntryFilter::Enabled => entry.enabled,
    }
}

/// Walks manifest entries through download, extract, copy and optional GOD
/// conversion. Runs are sequential; callers must not start two runs against
/// the same manifest at once.
pub struct Scheduler<S> {
    transfer: Transfer<S>,
    converter: Option<Converter>,
}

impl<S: HttpSource> Scheduler<S> {
    pub fn new(transfer: Transfer<S>) -> Self {
        Self {
            transfer,
            converter: None,
        }
    }

    pub fn with_converter(mut self, converter: Converter) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn transfer(&self) -> &Transfer<S> {
        &self.transfer
    }

    pub fn converter(&self) -> Option<&Converter> {
        self.converter.as_ref()
    }

    pub fn run(
        &self,
        request: &RunRequest,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<RunSummary, MyrigetError> {
        let result = self.run_inner(request, sink, cancel);
        if let Err(err) = &result {
            events::warn(sink, format!("Error processing links: {err}"));
        }
        result
    }

    fn run_inner(
        &self,
        request: &RunRequest,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<RunSummary, MyrigetError> {
        for dir in [&request.temp_dir, &request.extract_dir, &request.output_dir] {
            std::fs::create_dir_all(dir)
                .map_err(|err| MyrigetError::Filesystem(format!("{}: {err}", dir.display())))?;
        }
        if request.convert.enabled && self.converter.is_none() {
            return Err(MyrigetError::ConverterUnavailable(
                "conversion requested but no converter was configured".to_string(),
            ));
        }

        let mut entries = manifest::load(&request.manifest_path)?;
        let mut summary = RunSummary::default();

        let mut selected = Vec::new();
        for (idx, entry) in entries.iter().enumerate() {
            if !is_processable_url(&entry.url) {
                summary.invalid_urls += 1;
                events::warn(sink, format!("Skipping entry with invalid URL: {}", entry.url));
                continue;
            }
            if !matches_filter(entry, request.filter) {
                continue;
            }
            if !entry.enabled {
                summary.disabled += 1;
                events::status(sink, format!("Skipping disabled entry {}", entry.display_name()));
                continue;
            }
            selected.push(idx);
        }

        let swept = if request.convert.enabled {
            self.convert_existing(&mut entries, request, sink, cancel, &mut summary)
        } else {
            0
        };

        if selected.is_empty() {
            if swept > 0 {
                events::status(sink, "Processing complete: nothing left to download");
                return Ok(summary);
            }
            return Err(MyrigetError::NothingToProcess);
        }

        let candidates: Vec<Candidate> = selected
            .iter()
            .map(|idx| Candidate {
                index: *idx,
                size_bytes: entries[*idx].size_bytes,
            })
            .collect();
        let batches = batch::plan(&candidates, &request.policy);
        summary.total = batches.iter().map(Vec::len).sum();
        summary.batches = batches.len();
        events::status(
            sink,
            format!(
                "Planned {} entries in {} batches ({} filter)",
                summary.total,
                batches.len(),
                request.filter
            ),
        );

        'batches: for (batch_idx, batch) in batches.iter().enumerate() {
            events::status(
                sink,
                format!(
                    "Processing batch {} of {} ({} entries)",
                    batch_idx + 1,
                    batches.len(),
                    batch.len()
                ),
            );
            let before = summary.clone();
            for idx in batch {
                if cancel.is_cancelled() {
                    summary.cancelled = true;
                    events::warn(sink, "Processing cancelled");
                    break 'batches;
                }
                let outcome = match self.process_entry(&mut entries, *idx, request, sink) {
                    Ok(outcome) => outcome,
                    Err(EntryError { stage, error }) => {
                        events::warn(
                            sink,
                            format!(
                                "Error processing {} during {stage}: {error}",
                                entries[*idx].display_name()
                            ),
                        );
                        EntryOutcome::Failed(stage)
                    }
                };
                summary.record(outcome);
                events::progress(sink, summary.processed as f32 / summary.total as f32 * 100.0);
            }
            events::status(
                sink,
                format!(
                    "Completed batch {} of {}: {} complete, {} failed",
                    batch_idx + 1,
                    batches.len(),
                    summary.completed - before.completed,
                    summary.failed - before.failed
                ),
            );
        }

        events::status(
            sink,
            format!(
                "Processing complete: {} of {} entries complete, {} failed, {} disabled",
                summary.completed, summary.total, summary.failed, summary.disabled
            ),
        );
        Ok(summary)
    }

    /// Converts ISO entries that are already in the library but not yet
    /// converted, so they are not downloaded again. Returns how many were
    /// attempted.
    fn convert_existing(
        &self,
        entries: &mut [ManifestEntry],
        request: &RunRequest,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
        summary: &mut RunSummary,
    ) -> usize {
        let pending: Vec<(usize, PathBuf)> = entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| {
                entry.is_iso()
                    && entry.enabled
                    && !entry.god_converted
                    && entry.god_conversion_error.is_none()
            })
            .filter_map(|(idx, entry)| {
                let path = PathBuf::from(entry.output_path.as_deref()?);
                let is_iso_file = path.is_file()
                    && path
                        .extension()
                        .map(|ext| ext.eq_ignore_ascii_case("iso"))
                        .unwrap_or(false);
                is_iso_file.then_some((idx, path))
            })
            .collect();

        if pending.is_empty() {
            return 0;
        }
        events::status(
            sink,
            format!("Converting {} ISO files already in the library", pending.len()),
        );
        let mut attempted = 0;
        for (idx, iso) in pending {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            attempted += 1;
            match self.convert_entry(entries, idx, &iso, request, sink) {
                Ok(true) => summary.converted += 1,
                Ok(false) => summary.conversion_failures += 1,
                Err(err) => {
                    summary.conversion_failures += 1;
                    events::warn(
                        sink,
                        format!("Error converting {}: {err}", entries[idx].display_name()),
                    );
                }
            }
        }
        attempted
    }

    fn process_entry(
        &self,
        entries: &mut [ManifestEntry],
        idx: usize,
        request: &RunRequest,
        sink: &dyn ProgressSink,
    ) -> Result<EntryOutcome, EntryError> {
        let (url, name, size_mb) = {
            let entry = &entries[idx];
            (entry.url.clone(), entry.display_name().to_string(), entry.size_mb())
        };
        if size_mb > 0 {
            events::status(sink, format!("Processing {name} ({size_mb} MB)"));
        } else {
            events::status(sink, format!("Processing {name}"));
        }

        let mut scratch = Scratch::new(
            request.temp_dir.join(url_basename(&url)),
            request.keep_downloads,
        );

        let Some(archive) = self.transfer.download(&url, &request.temp_dir, sink) else {
            return Ok(EntryOutcome::Failed(Stage::Download));
        };
        {
            let entry = &mut entries[idx];
            entry.downloaded = true;
            if entry.size_bytes == 0 {
                entry.size_bytes = std::fs::metadata(&archive).map(|m| m.len()).unwrap_or(0);
            }
        }
        save_at(request, entries, Stage::Download)?;

        scratch.extract_dir =
            archive_dir_name(url_basename(&url)).map(|dir| request.extract_dir.join(dir));
        let Some(extracted) = extract(&archive, &request.extract_dir, sink) else {
            revert(&mut entries[idx]);
            save_at(request, entries, Stage::Extract)?;
            return Ok(EntryOutcome::Failed(Stage::Extract));
        };
        scratch.extract_dir = Some(extracted.clone());
        entries[idx].extracted = true;
        save_at(request, entries, Stage::Extract)?;

        let Some(published) = publish(&extracted, &request.output_dir, sink) else {
            revert(&mut entries[idx]);
            save_at(request, entries, Stage::Copy)?;
            return Ok(EntryOutcome::Failed(Stage::Copy));
        };

        let removed_archive = scratch.finish();
        let iso = published.iso_files.first().cloned();
        {
            let entry = &mut entries[idx];
            entry.copied = true;
            entry.processed = true;
            entry.deleted = removed_archive;
            entry.output_path = Some(
                iso.as_deref()
                    .unwrap_or(request.output_dir.as_path())
                    .display()
                    .to_string(),
            );
        }
        save_at(request, entries, Stage::Copy)?;
        events::status(sink, format!("Completed {name}"));

        match iso {
            Some(iso) if request.convert.enabled && entries[idx].is_iso() => {
                let converted = self
                    .convert_entry(entries, idx, &iso, request, sink)
                    .map_err(|error| EntryError {
                        stage: Stage::Convert,
                        error,
                    })?;
                if converted {
                    Ok(EntryOutcome::GodConverted)
                } else {
                    Ok(EntryOutcome::GodFailed)
                }
            }
            _ => Ok(EntryOutcome::Complete),
        }
    }

    /// Runs the converter for one entry and records the result. `Ok(false)`
    /// means the conversion failed and the failure is stored on the entry.
    fn convert_entry(
        &self,
        entries: &mut [ManifestEntry],
        idx: usize,
        iso: &Path,
        request: &RunRequest,
        sink: &dyn ProgressSink,
    ) -> Result<bool, MyrigetError> {
        let Some(converter) = self.converter.as_ref() else {
            return Err(MyrigetError::ConverterUnavailable(
                "no converter configured".to_string(),
            ));
        };
        {
            let entry = &mut entries[idx];
            entry.god_conversion_started = true;
            entry.god_conversion_completed = false;
            entry.god_conversion_progress = 0;
            entry.god_conversion_error = None;
        }
        manifest::save(&request.manifest_path, entries)?;

        let stem = iso
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| entries[idx].name.clone());
        let target = request.convert.god_output_dir.join(&stem);
        let options = ConvertOptions {
            game_title: Some(entries[idx].name.clone()),
            ..request.convert.options.clone()
        };

        let result = converter.run(iso, &target, &options, sink);
        let converted = result.is_ok();
        {
            let entry = &mut entries[idx];
            match result {
                Ok(path) => {
                    entry.god_converted = true;
                    entry.god_conversion_completed = true;
                    entry.god_conversion_progress = 100;
                    entry.god_conversion_date = Some(chrono::Utc::now().to_rfc3339());
                    entry.god_output_path = Some(path.display().to_string());
                }
                Err(failure) => {
                    entry.god_converted = false;
                    entry.god_conversion_completed = false;
                    entry.god_conversion_error = Some(failure.to_string());
                }
            }
        }
        manifest::save(&request.manifest_path, entries)?;
        Ok(converted)
    }
}

fn save_at(request: &RunRequest, entries: &[ManifestEntry], stage: Stage) -> Result<(), EntryError> {
    manifest::save(&request.manifest_path, entries).map_err(|error| EntryError { stage, error })
}

/// A failed later stage means the scratch files are gone again, so the entry
/// goes back to pending.
fn revert(entry: &mut ManifestEntry) {
    entry.downloaded = false;
    entry.extracted = false;
}

/// Temporary files for one entry. Removed on drop, whatever happened.
struct Scratch {
    archive: Option<PathBuf>,
    extract_dir: Option<PathBuf>,
    keep_archive: bool,
}

impl Scratch {
    fn new(archive: PathBuf, keep_archive: bool) -> Self {
        Self {
            archive: Some(archive),
            extract_dir: None,
            keep_archive,
        }
    }

    /// Cleans up now and reports whether the downloaded archive was removed.
    fn finish(&mut self) -> bool {
        if let Some(dir) = self.extract_dir.take() {
            remove_best_effort(&dir);
        }
        match self.archive.take() {
            Some(archive) if !self.keep_archive => remove_best_effort(&archive),
            _ => false,
        }
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        self.keep_archive = false;
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::LinkType;

    #[test]
    fn url_shape_check() {
        assert!(is_processable_url("https://host/games/Halo%203.zip"));
        assert!(is_processable_url("http://host/pack.tar.gz"));
        assert!(!is_processable_url("ftp://host/pack.zip"));
        assert!(!is_processable_url("https://host/game.iso"));
        assert!(!is_processable_url("not a url.zip"));
        assert!(!is_processable_url("http://host/%2E%2E.zip"));
        assert!(!is_processable_url("http://host/a%2F..%2F..%2Fx.zip"));
    }

    #[test]
    fn filters() {
        let mut done = ManifestEntry::new("http://x/a.zip", LinkType::Iso);
        done.downloaded = true;
        done.extracted = true;
        done.copied = true;
        let mut off = ManifestEntry::new("http://x/b.zip", LinkType::Iso);
        off.enabled = false;

        assert!(matches_filter(&done, EntryFilter::All));
        assert!(!matches_filter(&done, EntryFilter::Incomplete));
        assert!(matches_filter(&off, EntryFilter::Incomplete));
        assert!(!matches_filter(&off, EntryFilter::Enabled));
    }

    #[test]
    fn summary_counts_outcomes() {
        let mut summary = RunSummary::default();
        summary.record(EntryOutcome::GodConverted);
        summary.record(EntryOutcome::Failed(Stage::Extract));
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.converted, 1);
        assert_eq!(summary.failed, 1);
    }
}
