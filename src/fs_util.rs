use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use zip::ZipArchive;

use crate::error::MyrigetError;

/// Decodes `%XX` escapes. Malformed escapes are kept literally and invalid
/// UTF-8 is replaced rather than rejected.
pub fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'%' && idx + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (from_hex(bytes[idx + 1]), from_hex(bytes[idx + 2])) {
                out.push(hi << 4 | lo);
                idx += 3;
                continue;
            }
        }
        out.push(bytes[idx]);
        idx += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn from_hex(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
}

impl ArchiveKind {
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else if lower.ends_with(".tar") {
            Some(ArchiveKind::Tar)
        } else {
            None
        }
    }
}

/// Reads every member to the end so CRC and framing errors surface.
pub fn validate_archive(path: &Path, kind: ArchiveKind) -> Result<(), MyrigetError> {
    match kind {
        ArchiveKind::Zip => validate_zip(path),
        ArchiveKind::Tar => {
            let file = open(path)?;
            validate_tar(tar::Archive::new(file))
        }
        ArchiveKind::TarGz => {
            let file = open(path)?;
            validate_tar(tar::Archive::new(GzDecoder::new(file)))
        }
    }
}

pub fn validate_zip(zip_path: &Path) -> Result<(), MyrigetError> {
    let file = open(zip_path)?;
    let mut archive = ZipArchive::new(file).map_err(|err| MyrigetError::Archive(err.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| MyrigetError::Archive(err.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        io::copy(&mut entry, &mut io::sink()).map_err(|err| MyrigetError::Archive(err.to_string()))?;
    }
    Ok(())
}

fn validate_tar<R: io::Read>(mut archive: tar::Archive<R>) -> Result<(), MyrigetError> {
    let entries = archive
        .entries()
        .map_err(|err| MyrigetError::Archive(err.to_string()))?;
    let mut count = 0usize;
    for entry in entries {
        let mut entry = entry.map_err(|err| MyrigetError::Archive(err.to_string()))?;
        io::copy(&mut entry, &mut io::sink()).map_err(|err| MyrigetError::Archive(err.to_string()))?;
        count += 1;
    }
    if count == 0 {
        return Err(MyrigetError::Archive("tar archive has no entries".to_string()));
    }
    Ok(())
}

fn open(path: &Path) -> Result<fs::File, MyrigetError> {
    fs::File::open(path)
        .map_err(|err| MyrigetError::Filesystem(format!("open {}: {err}", path.display())))
}

/// Removes a file or directory tree, logging instead of failing.
pub fn remove_best_effort(path: &Path) -> bool {
    if !path.exists() {
        return true;
    }
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!("cleanup of {} failed: {err}", path.display());
            false
        }
    }
}

/// Files directly inside `dir` whose name ends with `suffix` (case-insensitive).
pub fn files_with_suffix(dir: &Path, suffix: &str) -> Vec<PathBuf> {
    let suffix = suffix.to_ascii_lowercase();
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut out: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.to_ascii_lowercase().ends_with(&suffix))
                .unwrap_or(false)
        })
        .collect();
    out.sort();
    out
}

/// Whether any file below `dir` (recursively) ends with `suffix`.
pub fn contains_suffix_recursive(dir: &Path, suffix: &str) -> bool {
    let suffix = suffix.to_ascii_lowercase();
    walkdir::WalkDir::new(dir)
        .into_iter()
        .flatten()
        .filter(|entry| entry.file_type().is_file())
        .any(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| name.to_ascii_lowercase().ends_with(&suffix))
                .unwrap_or(false)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_decode_valid_and_malformed() {
        assert_eq!(percent_decode("Halo%203%20%28USA%29"), "Halo 3 (USA)");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zzabc"), "%zzabc");
        assert_eq!(percent_decode("caf%C3%A9"), "café");
    }

    #[test]
    fn archive_kind_from_name() {
        assert_eq!(ArchiveKind::from_name("a.ZIP"), Some(ArchiveKind::Zip));
        assert_eq!(ArchiveKind::from_name("a.tar.gz"), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::from_name("a.tgz"), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::from_name("a.tar"), Some(ArchiveKind::Tar));
        assert_eq!(ArchiveKind::from_name("a.7z"), None);
    }

    #[test]
    fn corrupt_zip_fails_validation() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("broken.zip");
        fs::write(&path, b"PK\x03\x04 definitely not a zip").unwrap();
        assert!(validate_archive(&path, ArchiveKind::Zip).is_err());
    }
}
