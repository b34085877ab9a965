//! Facet connectivity analysis.
//!
//! The facet payload is treated as a stream over a small byte alphabet with
//! one marker value splitting it into segments.  Evidence is gathered per
//! payload (segments, symbol profile, header scan) and, when the alphabet
//! looks like a five-symbol corner-table code, candidate byte → symbol
//! mappings are replayed through [`clers::decode`].  A decode is reported
//! only when the replayed faces equal the reference faces after
//! [`FaceNormalization`].

pub mod clers;

pub use clers::{ClersError, Symbol};

use std::collections::HashMap;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::mesh::MeshSample;
use crate::stats::{self, ByteProfile, GapStats};

/// Expected symbol frequencies of a CLERS stream on typical scan meshes.
pub const SYMBOL_PROFILE: [(Symbol, f64); 5] = [
    (Symbol::C, 0.50),
    (Symbol::R, 0.36),
    (Symbol::L, 0.06),
    (Symbol::S, 0.04),
    (Symbol::E, 0.04),
];

/// Share of the payload the five most frequent values must cover before a
/// mapping is proposed.
pub const ALPHABET_COVERAGE: f64 = 0.95;

const HEADER_SCAN_LEN: usize = 16;

// ── Options ──────────────────────────────────────────────────────────────────

/// How decoded and reference faces are made comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaceNormalization {
    /// Order and winding as emitted.
    Exact,
    /// Each face rotated so its smallest index leads (winding kept), list sorted.
    #[default]
    Rotation,
    /// Indices of each face sorted, list sorted.
    Unoriented,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FacetOptions {
    /// Fixed marker byte; derived per batch when unset.
    pub marker:                 Option<u8>,
    pub marker_max_value:       u8,
    pub marker_candidates:      usize,
    pub max_mapping_candidates: usize,
    pub normalization:          FaceNormalization,
    pub top_n:                  usize,
}

impl Default for FacetOptions {
    fn default() -> Self {
        Self {
            marker:                 None,
            marker_max_value:       15,
            marker_candidates:      4,
            max_mapping_candidates: 120,
            normalization:          FaceNormalization::default(),
            top_n:                  20,
        }
    }
}

pub fn normalize_faces(faces: &[[u32; 3]], mode: FaceNormalization) -> Vec<[u32; 3]> {
    let mut out: Vec<[u32; 3]> = match mode {
        FaceNormalization::Exact => return faces.to_vec(),
        FaceNormalization::Rotation => faces
            .iter()
            .map(|f| {
                let lead = (0..3).min_by_key(|&k| f[k]).unwrap_or(0);
                [f[lead], f[(lead + 1) % 3], f[(lead + 2) % 3]]
            })
            .collect(),
        FaceNormalization::Unoriented => faces
            .iter()
            .map(|f| {
                let mut s = *f;
                s.sort_unstable();
                s
            })
            .collect(),
    };
    out.sort_unstable();
    out
}

// ── Marker discovery ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerCandidate {
    pub value:      u8,
    pub frequency:  u64,
    /// Mean distance of faces/segments from the nearest integer.
    pub score:      f64,
    pub mean_ratio: f64,
    pub samples:    usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerDiscovery {
    pub marker:     u8,
    pub candidates: Vec<MarkerCandidate>,
}

/// Pick the marker byte over a batch of `(facet payload, reference face
/// count)` samples.
///
/// Candidates are the most frequent values `<= marker_max_value`; the winner
/// is the candidate whose faces-per-segment ratios sit closest to whole
/// numbers, ties going to the more frequent value.
pub fn discover_marker<'a, I>(samples: I, opts: &FacetOptions) -> Option<MarkerDiscovery>
where
    I: IntoIterator<Item = (&'a [u8], usize)>,
{
    let samples: Vec<(&[u8], usize)> = samples.into_iter().collect();
    let mut hist = [0u64; 256];
    for (payload, _) in &samples {
        for &b in *payload {
            hist[b as usize] += 1;
        }
    }
    let mut low = [0u64; 256];
    low[..=opts.marker_max_value as usize].copy_from_slice(&hist[..=opts.marker_max_value as usize]);

    let mut candidates: Vec<MarkerCandidate> = stats::top_from_histogram(&low, opts.marker_candidates)
        .into_iter()
        .filter(|&(_, count)| count > 0)
        .map(|(value, frequency)| {
            let ratios: Vec<f64> = samples
                .iter()
                .filter_map(|(payload, faces)| {
                    let segs = non_empty_segments(payload, value);
                    (segs > 0).then(|| *faces as f64 / segs as f64)
                })
                .collect();
            let (score, mean_ratio) = if ratios.is_empty() {
                (f64::INFINITY, 0.0)
            } else {
                let n = ratios.len() as f64;
                (
                    ratios.iter().map(|r| (r - r.round()).abs()).sum::<f64>() / n,
                    ratios.iter().sum::<f64>() / n,
                )
            };
            MarkerCandidate { value, frequency, score, mean_ratio, samples: ratios.len() }
        })
        .collect();

    // Stable sort keeps the frequency order among equal scores.
    candidates.sort_by(|a, b| a.score.total_cmp(&b.score));
    let marker = candidates.first()?.value;
    debug!(marker, candidates = candidates.len(), "marker discovered");
    Some(MarkerDiscovery { marker, candidates })
}

fn non_empty_segments(payload: &[u8], marker: u8) -> usize {
    payload.split(|&b| b == marker).filter(|s| !s.is_empty()).count()
}

// ── Segment evidence ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentEvidence {
    pub marker:            u8,
    pub segments:          usize,
    pub non_empty:         usize,
    pub min_len:           usize,
    pub max_len:           usize,
    pub mean_len:          f64,
    pub faces_per_segment: Option<f64>,
    /// First byte of each non-empty segment, ranked.
    pub first_symbols:     Vec<(u8, u64)>,
    pub top_segments:      Vec<(String, u64)>,
    pub digrams:           Vec<(String, u64)>,
    pub trigrams:          Vec<(String, u64)>,
    pub gaps:              Option<GapStats>,
}

/// Segment the payload on `marker` and summarise the pieces.  Digram and
/// trigram contexts are counted within segments, never across a marker.
pub fn segment_evidence(
    payload:    &[u8],
    marker:     u8,
    face_count: Option<usize>,
    top_n:      usize,
) -> SegmentEvidence {
    let segments = stats::segment(payload, marker);
    let non_empty: Vec<&[u8]> = segments.iter().copied().filter(|s| !s.is_empty()).collect();

    let lengths: Vec<usize> = non_empty.iter().map(|s| s.len()).collect();
    let mut first = [0u64; 256];
    let mut whole: HashMap<&[u8], u64> = HashMap::new();
    let mut di: HashMap<[u8; 2], u64> = HashMap::new();
    let mut tri: HashMap<[u8; 3], u64> = HashMap::new();
    for &s in &non_empty {
        first[s[0] as usize] += 1;
        *whole.entry(s).or_insert(0) += 1;
        for (k, v) in stats::ngram_counts::<2>(s) {
            *di.entry(k).or_insert(0) += v;
        }
        for (k, v) in stats::ngram_counts::<3>(s) {
            *tri.entry(k).or_insert(0) += v;
        }
    }

    let hexed = |ranked: Vec<(Vec<u8>, u64)>| -> Vec<(String, u64)> {
        ranked.into_iter().map(|(k, v)| (hex::encode(k), v)).collect()
    };

    SegmentEvidence {
        marker,
        segments: segments.len(),
        non_empty: non_empty.len(),
        min_len: lengths.iter().copied().min().unwrap_or(0),
        max_len: lengths.iter().copied().max().unwrap_or(0),
        mean_len: if lengths.is_empty() {
            0.0
        } else {
            lengths.iter().sum::<usize>() as f64 / lengths.len() as f64
        },
        faces_per_segment: face_count
            .filter(|_| !non_empty.is_empty())
            .map(|f| f as f64 / non_empty.len() as f64),
        first_symbols: stats::top_from_histogram(&first, top_n)
            .into_iter()
            .filter(|&(_, c)| c > 0)
            .collect(),
        top_segments: hexed(stats::rank_counts(whole, top_n)),
        digrams: hexed(stats::rank_counts(di, top_n)),
        trigrams: hexed(stats::rank_counts(tri, top_n)),
        gaps: stats::marker_gaps(payload, marker),
    }
}

// ── Symbol profile ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolProfile {
    /// The five most frequent values and their relative frequencies.
    pub alphabet:        Vec<(u8, f64)>,
    pub coverage:        f64,
    pub includes_marker: bool,
    /// L1 distance between sorted observed frequencies and [`SYMBOL_PROFILE`].
    pub distance:        f64,
}

impl SymbolProfile {
    pub fn of(payload: &[u8], marker: u8) -> Self {
        let total = payload.len().max(1) as f64;
        let alphabet: Vec<(u8, f64)> = stats::top_bytes(payload, SYMBOL_PROFILE.len())
            .into_iter()
            .filter(|&(_, c)| c > 0)
            .map(|(v, c)| (v, c as f64 / total))
            .collect();
        let coverage = alphabet.iter().map(|(_, f)| f).sum();
        let distance = SYMBOL_PROFILE
            .iter()
            .enumerate()
            .map(|(i, (_, expected))| {
                let observed = alphabet.get(i).map_or(0.0, |&(_, f)| f);
                (observed - expected).abs()
            })
            .sum();
        Self {
            includes_marker: alphabet.iter().any(|&(v, _)| v == marker),
            alphabet,
            coverage,
            distance,
        }
    }

    /// Whether a byte → symbol mapping may be proposed at all.
    pub fn admits_mapping(&self) -> bool {
        self.alphabet.len() == SYMBOL_PROFILE.len()
            && self.coverage >= ALPHABET_COVERAGE
            && self.includes_marker
    }
}

// ── Header scan ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderScan {
    pub first_16_hex:         String,
    pub first_u32_le:         Option<u32>,
    pub first_u32_be:         Option<u32>,
    pub first_i32_le:         Option<i32>,
    pub second_u32_le:        Option<u32>,
    /// Offsets where a little-endian u32 equals the declared facet count.
    pub facet_count_offsets:  Vec<usize>,
    pub vertex_count_offsets: Vec<usize>,
}

pub fn scan_header(payload: &[u8], facet_count: u32, vertex_count: usize) -> HeaderScan {
    let head = &payload[..payload.len().min(HEADER_SCAN_LEN)];
    let word = |at: usize| payload.get(at..at + 4);

    let mut facet_count_offsets = Vec::new();
    let mut vertex_count_offsets = Vec::new();
    for i in 0..HEADER_SCAN_LEN.min(payload.len().saturating_sub(3)) {
        let v = LittleEndian::read_u32(&payload[i..i + 4]);
        if v == facet_count {
            facet_count_offsets.push(i);
        }
        if v as usize == vertex_count {
            vertex_count_offsets.push(i);
        }
    }

    HeaderScan {
        first_16_hex: hex::encode(head),
        first_u32_le: word(0).map(LittleEndian::read_u32),
        first_u32_be: word(0).map(BigEndian::read_u32),
        first_i32_le: word(0).map(LittleEndian::read_i32),
        second_u32_le: word(4).map(LittleEndian::read_u32),
        facet_count_offsets,
        vertex_count_offsets,
    }
}

/// Header positions holding the same byte in every payload of a batch.
pub fn constant_header_positions(payloads: &[&[u8]]) -> Vec<(usize, u8)> {
    if payloads.is_empty() {
        return Vec::new();
    }
    (0..HEADER_SCAN_LEN)
        .filter_map(|pos| {
            let mut values = payloads.iter().filter_map(|p| p.get(pos).copied());
            let first = values.next()?;
            values.all(|v| v == first).then_some((pos, first))
        })
        .collect()
}

// ── Mappings ─────────────────────────────────────────────────────────────────

/// Byte value → CLERS symbol for the five alphabet values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolMapping {
    pub pairs: [(u8, Symbol); 5],
}

impl SymbolMapping {
    pub fn symbol(&self, b: u8) -> Option<Symbol> {
        self.pairs.iter().find(|(v, _)| *v == b).map(|(_, s)| *s)
    }

    /// `Err(offset)` at the first byte outside the alphabet.
    pub fn translate(&self, payload: &[u8]) -> Result<Vec<Symbol>, usize> {
        payload
            .iter()
            .enumerate()
            .map(|(i, &b)| self.symbol(b).ok_or(i))
            .collect()
    }
}

impl std::fmt::Display for SymbolMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (v, s)) in self.pairs.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{v}={s}")?;
        }
        Ok(())
    }
}

/// Candidate mappings, frequency-rank mapping first, then the remaining
/// permutations in lexicographic order, at most `max` in total.  Empty when
/// the profile does not admit a mapping.
pub fn propose_mappings(profile: &SymbolProfile, max: usize) -> Vec<SymbolMapping> {
    if !profile.admits_mapping() {
        return Vec::new();
    }
    let values: Vec<u8> = profile.alphabet.iter().map(|&(v, _)| v).collect();
    let mut perm = [0usize, 1, 2, 3, 4];
    let mut out = Vec::new();
    while out.len() < max {
        out.push(SymbolMapping { pairs: with_symbols(&values, &perm) });
        if !next_permutation(&mut perm) {
            break;
        }
    }
    out
}

/// `values[perm[i]]` gets the i-th profile symbol.
fn with_symbols(values: &[u8], perm: &[usize; 5]) -> [(u8, Symbol); 5] {
    let mut pairs = [(0u8, Symbol::C); 5];
    for (i, slot) in pairs.iter_mut().enumerate() {
        *slot = (values[perm[i]], SYMBOL_PROFILE[i].0);
    }
    pairs
}

fn next_permutation(p: &mut [usize]) -> bool {
    let Some(i) = (1..p.len()).rev().find(|&i| p[i - 1] < p[i]) else {
        return false;
    };
    let j = (i..p.len()).rev().find(|&j| p[j] > p[i - 1]).unwrap_or(i);
    p.swap(i - 1, j);
    p[i..].reverse();
    true
}

// ── Decode attempts ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosestAttempt {
    pub offset:         usize,
    pub mapping:        String,
    pub matching_faces: usize,
    pub decoded_faces:  usize,
    pub expected_faces: usize,
}

/// Everything gathered about a facet payload that could not be decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodeEvidence {
    pub segments:         SegmentEvidence,
    pub profile:          SymbolProfile,
    pub header:           HeaderScan,
    pub offsets_tried:    Vec<usize>,
    pub mappings_tried:   usize,
    /// Streams that were not a valid traversal or hit a byte outside the
    /// alphabet.
    pub rejected_streams: usize,
    pub closest:          Option<ClosestAttempt>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FacetDecodeResult {
    Decoded {
        faces:         Vec<[u32; 3]>,
        mapping:       String,
        offset:        usize,
        normalization: FaceNormalization,
    },
    Unconfirmed(Box<DecodeEvidence>),
}

impl FacetDecodeResult {
    pub fn is_decoded(&self) -> bool {
        matches!(self, FacetDecodeResult::Decoded { .. })
    }

    pub fn faces(&self) -> Option<&[[u32; 3]]> {
        match self {
            FacetDecodeResult::Decoded { faces, .. } => Some(faces),
            FacetDecodeResult::Unconfirmed(_) => None,
        }
    }
}

/// Faces present in both lists, counted as multisets.
fn shared_faces(a: &[[u32; 3]], b: &[[u32; 3]]) -> usize {
    let mut counts: HashMap<[u32; 3], usize> = HashMap::new();
    for f in a {
        *counts.entry(*f).or_insert(0) += 1;
    }
    b.iter()
        .filter(|f| match counts.get_mut(*f) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        })
        .count()
}

/// Gather evidence and try every proposed mapping at every plausible start
/// offset.  Success requires the replayed faces to equal `reference.faces`
/// under `opts.normalization`.
pub fn decode_facets(
    payload:     &[u8],
    facet_count: u32,
    marker:      u8,
    reference:   &MeshSample,
    opts:        &FacetOptions,
) -> FacetDecodeResult {
    let segments = segment_evidence(payload, marker, Some(reference.faces.len()), opts.top_n);
    let profile = SymbolProfile::of(payload, marker);
    let header = scan_header(payload, facet_count, reference.vertices.len());

    let mut offsets_tried = vec![0usize];
    for &o in &header.facet_count_offsets {
        if !offsets_tried.contains(&(o + 4)) {
            offsets_tried.push(o + 4);
        }
    }

    let mappings = propose_mappings(&profile, opts.max_mapping_candidates);
    let expected = normalize_faces(&reference.faces, opts.normalization);
    let mut rejected_streams = 0usize;
    let mut closest: Option<ClosestAttempt> = None;

    for &offset in &offsets_tried {
        let Some(stream) = payload.get(offset..) else { continue };
        for mapping in &mappings {
            let faces = match mapping.translate(stream).ok().map(|s| clers::decode(&s)) {
                Some(Ok(faces)) => faces,
                _ => {
                    rejected_streams += 1;
                    continue;
                }
            };
            let decoded = normalize_faces(&faces, opts.normalization);
            if decoded == expected {
                info!(offset, mapping = %mapping, faces = faces.len(), "facet connectivity decoded");
                return FacetDecodeResult::Decoded {
                    faces,
                    mapping: mapping.to_string(),
                    offset,
                    normalization: opts.normalization,
                };
            }
            let matching_faces = shared_faces(&decoded, &expected);
            if closest.as_ref().map_or(true, |c| matching_faces > c.matching_faces) {
                closest = Some(ClosestAttempt {
                    offset,
                    mapping: mapping.to_string(),
                    matching_faces,
                    decoded_faces: faces.len(),
                    expected_faces: expected.len(),
                });
            }
        }
    }

    debug!(
        mappings = mappings.len(),
        offsets = offsets_tried.len(),
        rejected_streams,
        "facet decode unconfirmed"
    );
    FacetDecodeResult::Unconfirmed(Box::new(DecodeEvidence {
        segments,
        profile,
        header,
        offsets_tried,
        mappings_tried: mappings.len(),
        rejected_streams,
        closest,
    }))
}

/// Facet-side part of an analysis record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacetReport {
    pub marker:  u8,
    pub profile: ByteProfile,
    pub result:  FacetDecodeResult,
}

pub fn analyze_facets(
    payload:     &[u8],
    facet_count: u32,
    marker:      u8,
    reference:   &MeshSample,
    opts:        &FacetOptions,
) -> FacetReport {
    FacetReport {
        marker,
        profile: ByteProfile::of(payload, opts.top_n),
        result: decode_facets(payload, facet_count, marker, reference, opts),
    }
}
