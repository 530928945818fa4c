//! Pairwise Hamming comparison, exhaustive or band-bucketed.
//!
//! The bucketed strategy splits every hash into `max_distance + 1` disjoint
//! bands (band 0 is the prefix). Two hashes within `max_distance` differ in
//! at most `max_distance` bits, so at least one band is identical: probing
//! each band's bucket finds every pair the full comparison finds.

use crate::hash::HashBits;
use std::collections::{HashMap, HashSet};

/// Narrowest band worth bucketing on
const MIN_BAND_BITS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Full,
    Bucketed { prefix_bits: u32 },
}

/// `(reference index, work index, distance)`, sorted by reference index then
/// work index. `None` entries never match.
pub fn match_hashes(
    reference: &[Option<&HashBits>],
    work: &[Option<&HashBits>],
    max_distance: u32,
    strategy: Strategy,
) -> Vec<(usize, usize, u32)> {
    let bits = reference
        .iter()
        .chain(work)
        .flatten()
        .map(|h| h.len())
        .max()
        .unwrap_or(0);

    match strategy {
        Strategy::Bucketed { prefix_bits } => match band_plan(bits, max_distance, prefix_bits) {
            Some(bands) => bucketed(reference, work, max_distance, &bands),
            None => full(reference, work, max_distance),
        },
        Strategy::Full => full(reference, work, max_distance),
    }
}

/// `(start, width)` of each band, or None when bucketing cannot be exact
/// or would be too coarse to help.
pub(crate) fn band_plan(bits: u32, max_distance: u32, prefix_bits: u32) -> Option<Vec<(u32, u32)>> {
    let bands = max_distance.checked_add(1)?;
    if bands > bits {
        return None;
    }
    let width = prefix_bits.min(bits / bands).min(64);
    if width < MIN_BAND_BITS {
        return None;
    }
    Some((0..bands).map(|b| (b * width, width)).collect())
}

fn full(
    reference: &[Option<&HashBits>],
    work: &[Option<&HashBits>],
    max_distance: u32,
) -> Vec<(usize, usize, u32)> {
    let mut out = Vec::new();
    for (ri, r) in reference.iter().enumerate() {
        let Some(r) = r else { continue };
        for (wi, w) in work.iter().enumerate() {
            let Some(w) = w else { continue };
            let d = r.hamming_distance(w);
            if d <= max_distance {
                out.push((ri, wi, d));
            }
        }
    }
    out
}

fn bucketed(
    reference: &[Option<&HashBits>],
    work: &[Option<&HashBits>],
    max_distance: u32,
    bands: &[(u32, u32)],
) -> Vec<(usize, usize, u32)> {
    let mut tables: Vec<HashMap<u64, Vec<usize>>> = vec![HashMap::new(); bands.len()];
    for (ri, r) in reference.iter().enumerate() {
        let Some(r) = r else { continue };
        for (table, &(start, width)) in tables.iter_mut().zip(bands) {
            table.entry(r.band(start, width)).or_default().push(ri);
        }
    }

    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for (wi, w) in work.iter().enumerate() {
        let Some(w) = w else { continue };
        seen.clear();
        for (table, &(start, width)) in tables.iter().zip(bands) {
            let Some(candidates) = table.get(&w.band(start, width)) else {
                continue;
            };
            for &ri in candidates {
                if !seen.insert(ri) {
                    continue;
                }
                if let Some(r) = reference[ri] {
                    let d = r.hamming_distance(w);
                    if d <= max_distance {
                        out.push((ri, wi, d));
                    }
                }
            }
        }
    }
    out.sort_unstable();
    out
}
