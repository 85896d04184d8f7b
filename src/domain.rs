use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::MyrigetError;

/// Kind of library item an entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LinkType {
    #[serde(rename = "ISO")]
    Iso,
    #[serde(rename = "XBLA")]
    Xbla,
    #[serde(rename = "XBLA Addons")]
    XblaAddons,
    #[default]
    #[serde(rename = "Unknown", other)]
    Unknown,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Iso => "ISO",
            LinkType::Xbla => "XBLA",
            LinkType::XblaAddons => "XBLA Addons",
            LinkType::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkType {
    type Err = MyrigetError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "iso" => Ok(LinkType::Iso),
            "xbla" => Ok(LinkType::Xbla),
            "xbla addons" | "xbla-addons" | "xbla_addons" | "addons" => Ok(LinkType::XblaAddons),
            "unknown" => Ok(LinkType::Unknown),
            _ => Err(MyrigetError::InvalidValue(format!("link type {value}"))),
        }
    }
}

/// Which manifest entries a run considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EntryFilter {
    #[default]
    All,
    Incomplete,
    Enabled,
}

impl fmt::Display for EntryFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryFilter::All => write!(f, "all"),
            EntryFilter::Incomplete => write!(f, "incomplete"),
            EntryFilter::Enabled => write!(f, "enabled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BatchMode {
    Count,
    #[default]
    Size,
}

/// How the filtered entries are cut into batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPolicy {
    /// Fixed-size slices in manifest order, at most `max_items` entries overall.
    ByCount {
        batch_size: usize,
        max_items: Option<usize>,
    },
    /// Largest-first packing into bins of `bin_capacity_mb`, stopping once
    /// `total_cap_mb` of work has been scheduled.
    BySize {
        bin_capacity_mb: u64,
        total_cap_mb: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ImportMode {
    #[default]
    Append,
    Replace,
}
