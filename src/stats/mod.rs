//! Byte-level statistics over arbitrary payloads.
//!
//! Every function here is pure: same input, same output, no allocation shared
//! between calls.  Ordering of every "top N" table is fully determined
//! (count descending, then key ascending) so batch reports are reproducible
//! across runs and across worker counts.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ── Entropy / histogram ──────────────────────────────────────────────────────

/// Shannon entropy in bits per byte, in `[0, 8]`.  Empty input yields `0.0`.
pub fn entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let total = data.len() as f64;
    let h: f64 = histogram(data)
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / total;
            -p * p.log2()
        })
        .sum();
    h.clamp(0.0, 8.0)
}

/// Count of every byte value.
pub fn histogram(data: &[u8]) -> [u64; 256] {
    let mut counts = [0u64; 256];
    for &b in data {
        counts[b as usize] += 1;
    }
    counts
}

/// The `n` most frequent byte values as `(value, count)`.
pub fn top_bytes(data: &[u8], n: usize) -> Vec<(u8, u64)> {
    top_from_histogram(&histogram(data), n)
}

pub fn top_from_histogram(hist: &[u64; 256], n: usize) -> Vec<(u8, u64)> {
    let mut entries: Vec<(u8, u64)> = hist
        .iter()
        .enumerate()
        .filter(|(_, &c)| c > 0)
        .map(|(b, &c)| (b as u8, c))
        .collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    entries.truncate(n);
    entries
}

/// Number of distinct byte values present.
pub fn unique_bytes(data: &[u8]) -> usize {
    histogram(data).iter().filter(|&&c| c > 0).count()
}

/// Share of bytes with a value below 10.
pub fn low_value_ratio(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().filter(|&&b| b < 10).count() as f64 / data.len() as f64
}

/// Distribution of 4-bit nibbles (high and low halves counted alike).
pub fn nibble_distribution(data: &[u8]) -> [u64; 16] {
    let mut counts = [0u64; 16];
    for &b in data {
        counts[(b >> 4) as usize] += 1;
        counts[(b & 0x0F) as usize] += 1;
    }
    counts
}

// ── Runs ─────────────────────────────────────────────────────────────────────

/// A maximal run of one repeated byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub offset: usize,
    pub value:  u8,
    pub length: usize,
}

/// All maximal runs, in payload order.
pub fn runs(data: &[u8]) -> Vec<Run> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let value = data[i];
        let start = i;
        while i < data.len() && data[i] == value {
            i += 1;
        }
        out.push(Run { offset: start, value, length: i - start });
    }
    out
}

/// The `n` longest runs whose length is at least `min_len`, longest first
/// (ties broken by earlier offset).
pub fn longest_runs(data: &[u8], min_len: usize, n: usize) -> Vec<Run> {
    let mut all: Vec<Run> = runs(data).into_iter().filter(|r| r.length >= min_len).collect();
    all.sort_by(|a, b| b.length.cmp(&a.length).then(a.offset.cmp(&b.offset)));
    all.truncate(n);
    all
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_count:   usize,
    pub mean_length: f64,
    pub max_length:  usize,
    pub longest:     Vec<Run>,
}

pub fn run_summary(data: &[u8], n: usize) -> RunSummary {
    let all = runs(data);
    let max_length = all.iter().map(|r| r.length).max().unwrap_or(0);
    let mean_length = if all.is_empty() {
        0.0
    } else {
        data.len() as f64 / all.len() as f64
    };
    RunSummary {
        run_count: all.len(),
        mean_length,
        max_length,
        longest: longest_runs(data, 1, n),
    }
}

// ── N-grams ──────────────────────────────────────────────────────────────────

/// Frequency table of every overlapping `N`-byte window.
pub fn ngram_counts<const N: usize>(data: &[u8]) -> HashMap<[u8; N], u64> {
    let mut counts = HashMap::new();
    if N == 0 {
        return counts;
    }
    for w in data.windows(N) {
        let mut key = [0u8; N];
        key.copy_from_slice(w);
        *counts.entry(key).or_insert(0) += 1;
    }
    counts
}

/// The `n` most frequent `N`-grams, count descending then lexicographic.
pub fn top_ngrams<const N: usize>(data: &[u8], n: usize) -> Vec<(Vec<u8>, u64)> {
    rank_counts(ngram_counts::<N>(data), n)
}

pub fn digrams(data: &[u8], n: usize) -> Vec<(Vec<u8>, u64)> {
    top_ngrams::<2>(data, n)
}

pub fn trigrams(data: &[u8], n: usize) -> Vec<(Vec<u8>, u64)> {
    top_ngrams::<3>(data, n)
}

/// Sort a count table into a deterministic top-`n` list.
pub fn rank_counts<K: AsRef<[u8]>>(counts: HashMap<K, u64>, n: usize) -> Vec<(Vec<u8>, u64)> {
    let mut entries: Vec<(Vec<u8>, u64)> = counts
        .into_iter()
        .map(|(k, c)| (k.as_ref().to_vec(), c))
        .collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(n);
    entries
}

// ── Segmentation ─────────────────────────────────────────────────────────────

/// Split on every occurrence of `marker`, dropping the marker itself.
///
/// Empty segments are kept, so `segments.join(&[marker])` reproduces `data`
/// exactly.  An empty input yields one empty segment.
pub fn segment(data: &[u8], marker: u8) -> Vec<&[u8]> {
    data.split(|&b| b == marker).collect()
}

/// Inverse of [`segment`].
pub fn join_segments(segments: &[&[u8]], marker: u8) -> Vec<u8> {
    segments.join(&[marker][..])
}

/// Positions of every `marker` byte.
pub fn marker_positions(data: &[u8], marker: u8) -> Vec<usize> {
    data.iter()
        .enumerate()
        .filter(|(_, &b)| b == marker)
        .map(|(i, _)| i)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapStats {
    pub count: usize,
    pub min:   usize,
    pub max:   usize,
    pub mean:  f64,
}

/// Distances between consecutive markers; `None` with fewer than two markers.
pub fn marker_gaps(data: &[u8], marker: u8) -> Option<GapStats> {
    let pos = marker_positions(data, marker);
    if pos.len() < 2 {
        return None;
    }
    let gaps: Vec<usize> = pos.windows(2).map(|w| w[1] - w[0]).collect();
    Some(GapStats {
        count: gaps.len(),
        min:   *gaps.iter().min()?,
        max:   *gaps.iter().max()?,
        mean:  gaps.iter().sum::<usize>() as f64 / gaps.len() as f64,
    })
}

// ── Profile bundle ───────────────────────────────────────────────────────────

/// Summary of a payload used in persisted records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ByteProfile {
    pub length:          usize,
    pub entropy:         f64,
    pub unique_bytes:    usize,
    pub min_byte:        Option<u8>,
    pub max_byte:        Option<u8>,
    pub low_value_ratio: f64,
    pub top_bytes:       Vec<(u8, u64)>,
    pub nibbles:         [u64; 16],
    pub runs:            RunSummary,
    pub first_64_hex:    String,
}

impl ByteProfile {
    pub fn of(data: &[u8], top_n: usize) -> Self {
        let hist = histogram(data);
        Self {
            length:          data.len(),
            entropy:         entropy(data),
            unique_bytes:    hist.iter().filter(|&&c| c > 0).count(),
            min_byte:        data.iter().copied().min(),
            max_byte:        data.iter().copied().max(),
            low_value_ratio: low_value_ratio(data),
            top_bytes:       top_from_histogram(&hist, top_n),
            nibbles:         nibble_distribution(data),
            runs:            run_summary(data, top_n),
            first_64_hex:    hex::encode(&data[..data.len().min(64)]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entropy_bounds() {
        assert_eq!(entropy(&[]), 0.0);
        assert_eq!(entropy(&[7u8; 100]), 0.0);
        let all: Vec<u8> = (0..=255).collect();
        assert!((entropy(&all) - 8.0).abs() < 1e-12);
        assert!((entropy(&[0, 1, 0, 1]) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn top_bytes_is_deterministic() {
        let data = [3u8, 1, 1, 3, 2];
        assert_eq!(top_bytes(&data, 3), vec![(1, 2), (3, 2), (2, 1)]);
        assert_eq!(top_bytes(&data, 1), vec![(1, 2)]);
    }

    #[test]
    fn runs_and_longest() {
        let data = [5u8, 5, 5, 1, 2, 2, 5, 5, 5, 5];
        let r = runs(&data);
        assert_eq!(r.len(), 4);
        assert_eq!(r[3], Run { offset: 6, value: 5, length: 4 });
        let top = longest_runs(&data, 3, 10);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].offset, 6);
        assert_eq!(top[1].offset, 0);
        let s = run_summary(&data, 2);
        assert_eq!(s.run_count, 4);
        assert_eq!(s.max_length, 4);
        assert!((s.mean_length - 2.5).abs() < 1e-12);
    }

    #[test]
    fn ngrams_count_overlapping_windows() {
        let data = [1u8, 2, 1, 2, 1];
        let d = digrams(&data, 10);
        assert_eq!(d, vec![(vec![1, 2], 2), (vec![2, 1], 2)]);
        let t = trigrams(&data, 10);
        assert_eq!(t, vec![(vec![1, 2, 1], 2), (vec![2, 1, 2], 1)]);
        assert!(digrams(&[1], 10).is_empty());
    }

    #[test]
    fn segmentation_keeps_empty_segments() {
        let data = [9u8, 1, 2, 9, 9, 3, 9];
        let segs = segment(&data, 9);
        let expected: Vec<&[u8]> = vec![&[], &[1, 2], &[], &[3], &[]];
        assert_eq!(segs, expected);
        assert_eq!(join_segments(&segs, 9), data.to_vec());
        assert_eq!(segment(&[], 9).len(), 1);
    }

    #[test]
    fn gaps_between_markers() {
        let data = [9u8, 0, 9, 0, 0, 0, 9];
        let g = marker_gaps(&data, 9).unwrap();
        assert_eq!((g.count, g.min, g.max), (2, 2, 4));
        assert!((g.mean - 3.0).abs() < 1e-12);
        assert!(marker_gaps(&[9u8, 1], 9).is_none());
    }

    #[test]
    fn nibbles_and_low_values() {
        let n = nibble_distribution(&[0x12, 0x21]);
        assert_eq!(n[1], 2);
        assert_eq!(n[2], 2);
        assert!((low_value_ratio(&[0, 5, 10, 200]) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn profile_of_empty_payload() {
        let p = ByteProfile::of(&[], 5);
        assert_eq!(p.length, 0);
        assert_eq!(p.min_byte, None);
        assert!(p.top_bytes.is_empty());
        assert_eq!(p.first_64_hex, "");
        assert_eq!(p.nibbles, [0; 16]);
        assert_eq!(p.runs.run_count, 0);
    }

    #[test]
    fn profile_carries_nibbles_and_runs() {
        let p = ByteProfile::of(&[0x12, 0x12, 0x12, 0xF1, 0x00], 2);
        assert_eq!(p.nibbles[1], 4);
        assert_eq!(p.nibbles[2], 3);
        assert_eq!(p.nibbles[0], 2);
        assert_eq!(p.nibbles[0xF], 1);
        assert_eq!(p.runs.run_count, 3);
        assert_eq!(p.runs.max_length, 3);
        assert_eq!(p.runs.longest[0], Run { offset: 0, value: 0x12, length: 3 });
        assert_eq!(p.runs.longest.len(), 2);
    }
}
