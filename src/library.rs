//! Size accounting over the manifest.

use serde::Serialize;

use crate::batch::MIB;
use crate::domain::LinkType;
use crate::events::{self, ProgressSink};
use crate::manifest::ManifestEntry;
use crate::transfer::{HttpSource, Transfer};

/// Free space to keep on top of the library itself.
pub const HEADROOM: f64 = 1.2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeTotals {
    pub link_type: LinkType,
    pub total_bytes: u64,
    pub count: usize,
    pub missing_size: usize,
}

impl TypeTotals {
    fn new(link_type: LinkType) -> Self {
        Self {
            link_type,
            total_bytes: 0,
            count: 0,
            missing_size: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LibrarySizes {
    pub by_type: Vec<TypeTotals>,
    pub total_bytes: u64,
    pub recommended_free_bytes: u64,
}

impl LibrarySizes {
    pub fn get(&self, link_type: LinkType) -> Option<&TypeTotals> {
        self.by_type.iter().find(|totals| totals.link_type == link_type)
    }

    pub fn total_gb(&self) -> f64 {
        self.total_bytes as f64 / (MIB * 1024) as f64
    }
}

const TRACKED: [LinkType; 3] = [LinkType::Iso, LinkType::Xbla, LinkType::XblaAddons];

/// Totals per tracked link type. Entries of other types only count toward
/// the grand total.
pub fn library_sizes(entries: &[ManifestEntry]) -> LibrarySizes {
    let mut by_type: Vec<TypeTotals> = TRACKED.iter().copied().map(TypeTotals::new).collect();
    let mut total_bytes = 0u64;
    for entry in entries {
        total_bytes += entry.size_bytes;
        let Some(totals) = by_type.iter_mut().find(|t| t.link_type == entry.link_type) else {
            continue;
        };
        totals.count += 1;
        totals.total_bytes += entry.size_bytes;
        if entry.size_bytes == 0 {
            totals.missing_size += 1;
        }
    }
    LibrarySizes {
        by_type,
        total_bytes,
        recommended_free_bytes: (total_bytes as f64 * HEADROOM) as u64,
    }
}

/// Fills unknown sizes from the server's `Content-Length`. Returns how many
/// entries were updated; the caller persists.
pub fn probe_missing_sizes<S: HttpSource>(
    entries: &mut [ManifestEntry],
    transfer: &Transfer<S>,
    sink: &dyn ProgressSink,
) -> usize {
    let missing: Vec<usize> = entries
        .iter()
        .enumerate()
        .filter(|(_, entry)| entry.size_bytes == 0)
        .map(|(idx, _)| idx)
        .collect();
    if missing.is_empty() {
        return 0;
    }
    events::status(sink, format!("Probing sizes for {} entries", missing.len()));

    let mut updated = 0;
    for (done, idx) in missing.iter().enumerate() {
        let entry = &mut entries[*idx];
        match transfer.probe_size(&entry.url) {
            Some(size) if size > 0 => {
                entry.size_bytes = size;
                updated += 1;
            }
            _ => tracing::debug!(url = %entry.url, "no size reported"),
        }
        events::progress(sink, (done + 1) as f32 / missing.len() as f32 * 100.0);
    }
    events::status(
        sink,
        format!("Size probe finished: {updated} of {} updated", missing.len()),
    );
    updated
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(url: &str, link_type: LinkType, size: u64) -> ManifestEntry {
        let mut entry = ManifestEntry::new(url, link_type);
        entry.size_bytes = size;
        entry
    }

    #[test]
    fn totals_per_type() {
        let entries = vec![
            entry("http://x/a.zip", LinkType::Iso, 100),
            entry("http://x/b.zip", LinkType::Iso, 0),
            entry("http://x/c.zip", LinkType::Xbla, 50),
            entry("http://x/d.zip", LinkType::Unknown, 10),
        ];
        let sizes = library_sizes(&entries);
        let iso = sizes.get(LinkType::Iso).unwrap();
        assert_eq!((iso.total_bytes, iso.count, iso.missing_size), (100, 2, 1));
        assert_eq!(sizes.get(LinkType::XblaAddons).unwrap().count, 0);
        assert_eq!(sizes.total_bytes, 160);
        assert_eq!(sizes.recommended_free_bytes, 192);
    }
}
