//! Cutting the filtered work list into batches.

use crate::domain::BatchPolicy;

pub const MIB: u64 = 1024 * 1024;

/// A bin is closed once it is this full.
pub const FILL_TARGET: f64 = 0.9;

/// Work item handed to the planner: manifest position and size in bytes
/// (0 when unknown).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub index: usize,
    pub size_bytes: u64,
}

/// Groups candidates into batches of manifest indices.
pub fn plan(candidates: &[Candidate], policy: &BatchPolicy) -> Vec<Vec<usize>> {
    match *policy {
        BatchPolicy::ByCount {
            batch_size,
            max_items,
        } => plan_by_count(candidates, batch_size, max_items),
        BatchPolicy::BySize {
            bin_capacity_mb,
            total_cap_mb,
        } => plan_by_size(candidates, bin_capacity_mb * MIB, total_cap_mb * MIB),
    }
}

fn plan_by_count(candidates: &[Candidate], batch_size: usize, max_items: Option<usize>) -> Vec<Vec<usize>> {
    let limit = max_items.unwrap_or(candidates.len()).min(candidates.len());
    candidates[..limit]
        .chunks(batch_size.max(1))
        .map(|chunk| chunk.iter().map(|candidate| candidate.index).collect())
        .collect()
}

/// Largest-first packing. Each bin takes the biggest remaining item that still
/// fits both the bin and the overall cap; a bin closes at [`FILL_TARGET`] or
/// when nothing else fits, and planning stops once the cap is reached.
///
/// An item larger than a whole bin gets a bin of its own when it still fits
/// under the cap, so it is not starved forever.
fn plan_by_size(candidates: &[Candidate], bin_capacity: u64, total_cap: u64) -> Vec<Vec<usize>> {
    let mut remaining: Vec<Candidate> = candidates.to_vec();
    let mut bins = Vec::new();
    let mut cumulative = 0u64;
    let close_at = (bin_capacity as f64 * FILL_TARGET) as u64;

    while !remaining.is_empty() && cumulative < total_cap {
        let mut bin = Vec::new();
        let mut bin_size = 0u64;

        loop {
            let room = bin_capacity.saturating_sub(bin_size);
            let pick = remaining
                .iter()
                .enumerate()
                .filter(|(_, c)| c.size_bytes <= room && cumulative + c.size_bytes <= total_cap)
                .max_by(|(ia, a), (ib, b)| a.size_bytes.cmp(&b.size_bytes).then(ib.cmp(ia)))
                .map(|(pos, _)| pos);
            let pos = match pick {
                Some(pos) => pos,
                None if bin.is_empty() => match oversized(&remaining, bin_capacity, cumulative, total_cap) {
                    Some(pos) => pos,
                    None => break,
                },
                None => break,
            };
            let chosen = remaining.remove(pos);
            bin_size += chosen.size_bytes;
            cumulative += chosen.size_bytes;
            bin.push(chosen.index);
            if bin_size >= close_at || cumulative >= total_cap {
                break;
            }
        }

        if bin.is_empty() {
            break;
        }
        bins.push(bin);
    }
    bins
}

fn oversized(remaining: &[Candidate], bin_capacity: u64, cumulative: u64, total_cap: u64) -> Option<usize> {
    remaining
        .iter()
        .position(|c| c.size_bytes > bin_capacity && cumulative + c.size_bytes <= total_cap)
}
