use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum MyrigetError {
    #[error("manifest not found: {0}")]
    ManifestMissing(PathBuf),

    #[error("failed to parse manifest: {0}")]
    ManifestParse(String),

    #[error("invalid manifest entry: {0}")]
    ManifestSchema(String),

    #[error("no entries to process")]
    NothingToProcess,

    #[error("merge input not found: {0}")]
    MergeInputMissing(PathBuf),

    #[error("GOD converter unavailable: {0}")]
    #[diagnostic(help("place iso2god in a tools/ directory next to myriget or on PATH"))]
    ConverterUnavailable(String),

    #[error("ISO file not found: {0}")]
    IsoNotFound(PathBuf),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("server returned status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("download validation failed: {0}")]
    Validation(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),
}

impl MyrigetError {
    pub(crate) fn fs(err: impl std::fmt::Display) -> Self {
        MyrigetError::Filesystem(err.to_string())
    }
}
