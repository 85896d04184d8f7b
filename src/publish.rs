use std::fs;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use walkdir::WalkDir;

use crate::error::MyrigetError;
use crate::events::{self, ProgressSink, Throttle};

/// Result of a successful publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Published {
    pub files_copied: usize,
    pub bytes_copied: u64,
    /// ISO images, placed directly under the output directory.
    pub iso_files: Vec<PathBuf>,
}

/// Copies an extracted tree into the library. `.iso` files land flat in
/// `output_dir`, everything else keeps its relative layout. On error the
/// partial copy is left in place and `None` is returned.
pub fn publish(source_dir: &Path, output_dir: &Path, sink: &dyn ProgressSink) -> Option<Published> {
    match copy_tree(source_dir, output_dir, sink) {
        Ok(published) => {
            events::status(
                sink,
                format!("Copy complete: {} files", published.files_copied),
            );
            Some(published)
        }
        Err(err) => {
            events::warn(sink, format!("Error copying files: {err}"));
            None
        }
    }
}

fn copy_tree(source_dir: &Path, output_dir: &Path, sink: &dyn ProgressSink) -> Result<Published, MyrigetError> {
    fs::create_dir_all(output_dir).map_err(MyrigetError::fs)?;

    let files: Vec<walkdir::DirEntry> = WalkDir::new(source_dir)
        .sort_by_file_name()
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .map_err(MyrigetError::fs)?
        .into_iter()
        .filter(|entry| entry.file_type().is_file())
        .collect();
    let total: u64 = files
        .iter()
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum();

    let mut published = Published::default();
    let mut throttle = Throttle::default();
    for entry in files {
        let src = entry.path();
        let dest = destination_for(source_dir, src, output_dir)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(MyrigetError::fs)?;
        }
        let bytes = copy_preserving(src, &dest)?;
        published.files_copied += 1;
        published.bytes_copied += bytes;
        if is_iso(src) {
            published.iso_files.push(dest.clone());
        }
        tracing::debug!(from = %src.display(), to = %dest.display(), "copied");
        if total > 0 && throttle.ready() {
            events::progress(sink, published.bytes_copied as f32 / total as f32 * 100.0);
        }
    }
    Ok(published)
}

fn destination_for(source_dir: &Path, src: &Path, output_dir: &Path) -> Result<PathBuf, MyrigetError> {
    if is_iso(src) {
        let name = src
            .file_name()
            .ok_or_else(|| MyrigetError::Filesystem(format!("no file name: {}", src.display())))?;
        return Ok(output_dir.join(name));
    }
    let relative = src
        .strip_prefix(source_dir)
        .map_err(|err| MyrigetError::Filesystem(err.to_string()))?;
    Ok(output_dir.join(relative))
}

fn is_iso(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.to_ascii_lowercase().ends_with(".iso"))
        .unwrap_or(false)
}

/// Copies contents and permissions, then carries over access and
/// modification times.
fn copy_preserving(src: &Path, dest: &Path) -> Result<u64, MyrigetError> {
    let bytes = fs::copy(src, dest)
        .map_err(|err| MyrigetError::Filesystem(format!("copy {}: {err}", src.display())))?;
    let meta = fs::metadata(src).map_err(MyrigetError::fs)?;
    let atime = FileTime::from_last_access_time(&meta);
    let mtime = FileTime::from_last_modification_time(&meta);
    filetime::set_file_times(dest, atime, mtime).map_err(MyrigetError::fs)?;
    Ok(bytes)
}
