use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use zip::ZipArchive;

use crate::error::MyrigetError;
use crate::events::{self, ProgressSink, Throttle};
use crate::fs_util::{ArchiveKind, percent_decode};
use crate::sanitize::strip_extension;

/// Extracts `archive_path` into `dest_root/<decoded archive stem>`.
/// Unsupported formats and extraction failures yield `None` plus a status
/// event.
pub fn extract(archive_path: &Path, dest_root: &Path, sink: &dyn ProgressSink) -> Option<PathBuf> {
    let file_name = archive_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let Some(kind) = ArchiveKind::from_name(&file_name) else {
        events::warn(sink, format!("Unsupported archive format: {file_name}"));
        return None;
    };

    let decoded = percent_decode(&file_name);
    let Some(dir_name) = archive_dir_name(&file_name) else {
        events::warn(sink, format!("Refusing to extract {decoded}: unsafe archive name"));
        return None;
    };
    let target = dest_root.join(dir_name);
    match extract_into(archive_path, kind, &target, sink) {
        Ok(count) => {
            tracing::debug!(members = count, target = %target.display(), "extracted archive");
            events::status(sink, format!("Extracted {decoded}"));
            Some(target)
        }
        Err(err) => {
            events::warn(sink, format!("Error extracting {decoded}: {err}"));
            None
        }
    }
}

fn extract_into(
    archive_path: &Path,
    kind: ArchiveKind,
    target: &Path,
    sink: &dyn ProgressSink,
) -> Result<usize, MyrigetError> {
    fs::create_dir_all(target).map_err(MyrigetError::fs)?;
    let file = File::open(archive_path).map_err(MyrigetError::fs)?;
    match kind {
        ArchiveKind::Zip => extract_zip(file, target, sink),
        ArchiveKind::Tar => extract_tar(tar::Archive::new(file), target),
        ArchiveKind::TarGz => extract_tar(tar::Archive::new(GzDecoder::new(file)), target),
    }
}

fn extract_zip(file: File, target: &Path, sink: &dyn ProgressSink) -> Result<usize, MyrigetError> {
    let mut archive = ZipArchive::new(file).map_err(|err| MyrigetError::Archive(err.to_string()))?;
    let mut total = 0u64;
    for i in 0..archive.len() {
        if let Ok(entry) = archive.by_index(i) {
            total += entry.size();
        }
    }

    let mut throttle = Throttle::default();
    let mut written = 0u64;
    let mut count = 0usize;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| MyrigetError::Archive(err.to_string()))?;
        let raw_name = entry.name().to_string();
        let Some(relative) = member_path(&raw_name) else {
            tracing::debug!("skipping zip member {raw_name}");
            continue;
        };
        let out_path = target.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(MyrigetError::fs)?;
            continue;
        }
        write_member(&mut entry, &out_path)?;
        written += entry.size();
        count += 1;
        if total > 0 && throttle.ready() {
            events::progress(sink, written as f32 / total as f32 * 100.0);
        }
    }
    Ok(count)
}

fn extract_tar<R: Read>(mut archive: tar::Archive<R>, target: &Path) -> Result<usize, MyrigetError> {
    let mut count = 0usize;
    let entries = archive
        .entries()
        .map_err(|err| MyrigetError::Archive(err.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|err| MyrigetError::Archive(err.to_string()))?;
        let raw_name = entry
            .path()
            .map_err(|err| MyrigetError::Archive(err.to_string()))?
            .to_string_lossy()
            .into_owned();
        let Some(relative) = member_path(&raw_name) else {
            tracing::debug!("skipping tar member {raw_name}");
            continue;
        };
        let out_path = target.join(&relative);
        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            fs::create_dir_all(&out_path).map_err(MyrigetError::fs)?;
        } else if entry_type.is_file() {
            write_member(&mut entry, &out_path)?;
            count += 1;
        } else {
            tracing::debug!("skipping non-regular tar member {raw_name}");
        }
    }
    Ok(count)
}

fn write_member<R: Read>(reader: &mut R, out_path: &Path) -> Result<(), MyrigetError> {
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent).map_err(MyrigetError::fs)?;
    }
    let mut outfile = File::create(out_path).map_err(MyrigetError::fs)?;
    io::copy(reader, &mut outfile).map_err(MyrigetError::fs)?;
    Ok(())
}

/// Directory an archive extracts into: its decoded stem, as long as that is a
/// single plain path component.
pub fn archive_dir_name(file_name: &str) -> Option<String> {
    let decoded = percent_decode(file_name);
    let stem = strip_extension(&decoded);
    if stem.contains(['/', '\\']) {
        return None;
    }
    let mut components = Path::new(stem).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Some(stem.to_string()),
        _ => None,
    }
}

/// Percent-decodes a member name and turns it into a relative path that stays
/// inside the extraction root. Traversal attempts and empty names yield `None`.
pub fn member_path(raw: &str) -> Option<PathBuf> {
    let decoded = percent_decode(raw);
    let mut out = PathBuf::new();
    for part in decoded.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => return None,
            part => {
                let component = Path::new(part);
                if !matches!(component.components().next(), Some(Component::Normal(_))) {
                    return None;
                }
                out.push(part);
            }
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}
