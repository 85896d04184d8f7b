use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::converter::{ConvertOptions, DEFAULT_IDLE_TIMEOUT, default_thread_count};
use crate::domain::{BatchMode, BatchPolicy, EntryFilter, LinkType};
use crate::error::MyrigetError;
use crate::transfer::DEFAULT_REQUEST_TIMEOUT;

pub const DEFAULT_CONFIG_FILE: &str = "myriget.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub temp_dir: Utf8PathBuf,
    pub temp_extract_dir: Utf8PathBuf,
    pub output_dir: Utf8PathBuf,
    pub god_output_dir: Utf8PathBuf,
    pub links_file: Utf8PathBuf,
    pub batch_mode: BatchMode,
    pub batch_size: usize,
    pub batch_size_mb: u64,
    pub bin_capacity_mb: u64,
    pub filter_type: EntryFilter,
    pub link_type: LinkType,
    pub request_timeout_secs: u64,
    pub converter_idle_timeout_secs: u64,
    pub converter_path: Option<Utf8PathBuf>,
    pub convert_to_god: bool,
    pub god_threads: Option<usize>,
    pub god_trim: bool,
    pub delete_after_copy: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            temp_dir: Utf8PathBuf::from("tempDownload"),
            temp_extract_dir: Utf8PathBuf::from("tempExtract"),
            output_dir: Utf8PathBuf::from("output"),
            god_output_dir: Utf8PathBuf::from("output").join("god_converted"),
            links_file: Utf8PathBuf::from("links.json"),
            batch_mode: BatchMode::Size,
            batch_size: 500,
            batch_size_mb: 10240,
            bin_capacity_mb: 10240,
            filter_type: EntryFilter::All,
            link_type: LinkType::Iso,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
            converter_idle_timeout_secs: DEFAULT_IDLE_TIMEOUT.as_secs(),
            converter_path: None,
            convert_to_god: false,
            god_threads: None,
            god_trim: true,
            delete_after_copy: true,
        }
    }
}

impl Settings {
    /// `max_items` only applies to count mode.
    pub fn batch_policy(&self, max_items: Option<usize>) -> BatchPolicy {
        match self.batch_mode {
            BatchMode::Count => BatchPolicy::ByCount {
                batch_size: self.batch_size,
                max_items,
            },
            BatchMode::Size => BatchPolicy::BySize {
                bin_capacity_mb: self.bin_capacity_mb,
                total_cap_mb: self.batch_size_mb,
            },
        }
    }

    pub fn convert_options(&self) -> ConvertOptions {
        ConvertOptions {
            game_title: None,
            num_threads: self.god_threads.unwrap_or_else(default_thread_count),
            trim: self.god_trim,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn converter_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.converter_idle_timeout_secs.max(1))
    }

    /// Extra places to look for the converter besides `tools/` and `PATH`.
    pub fn tool_dirs(&self) -> Vec<PathBuf> {
        BaseDirs::new()
            .map(|dirs| dirs.data_local_dir().join("myriget").join("tools"))
            .into_iter()
            .collect()
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// An explicit path must be readable. Without one, `myriget.json` in the
    /// working directory is used if present, otherwise the defaults.
    pub fn resolve(path: Option<&str>) -> Result<Settings, MyrigetError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            tracing::debug!("no {DEFAULT_CONFIG_FILE}, using defaults");
            return Ok(Settings::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| MyrigetError::ConfigRead(config_path.clone()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Settings, MyrigetError> {
        let settings: Settings =
            serde_json::from_str(content).map_err(|err| MyrigetError::ConfigParse(err.to_string()))?;
        if settings.batch_size == 0 {
            return Err(MyrigetError::InvalidValue("batch_size must be at least 1".to_string()));
        }
        if settings.bin_capacity_mb == 0 {
            return Err(MyrigetError::InvalidValue(
                "bin_capacity_mb must be at least 1".to_string(),
            ));
        }
        Ok(settings)
    }

    pub fn save(settings: &Settings, path: &std::path::Path) -> Result<(), MyrigetError> {
        let json = serde_json::to_string_pretty(settings)
            .map_err(|err| MyrigetError::ConfigParse(err.to_string()))?;
        fs::write(path, format!("{json}\n")).map_err(MyrigetError::fs)
    }
}
