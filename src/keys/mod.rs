//! Known-plaintext key recovery.
//!
//! Given the container's vertex payload `P` and the reference vertex payload
//! `R` (canonicalized reference mesh), derive `X = P ⊕ R` and run a battery of
//! hypotheses from most to least specific:
//!
//! | # | Hypothesis | Accepted when |
//! |---|------------|---------------|
//! | 0 | no transform | `X` is all zero |
//! | 1 | repeating XOR | `X[i] == X[i mod k]` for every `i`, shortest `k` wins |
//! | 2 | global XOR | always replays; provisional until reused across files |
//! | 3 | record XOR | every 12-byte record has the same key |
//! | 4 | substitution | `P[i] → R[i]` is a function |
//! | 5 | block consistency | identical `P` blocks ↔ identical `R` blocks (evidence only) |
//!
//! Every replayable candidate goes through [`KeyHypothesis::validate`] over
//! the whole payload.  The first one that reproduces `R` exactly is the only
//! `Confirmed` hypothesis of the pair.

mod hypothesis;

pub use hypothesis::{
    apply_xor, compare, xor_bytes, HypothesisKind, KeyHypothesis, Validation, Verdict,
};

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::stats::{self, ByteProfile, Run};

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyOptions {
    /// Upper bound on the repeating-XOR period search.
    pub max_period:  usize,
    /// Record size for the per-record key test (one f32 vertex = 12).
    pub record_size: usize,
    /// Block sizes for the consistency check.
    pub block_sizes: Vec<usize>,
    pub top_n:       usize,
}

impl Default for KeyOptions {
    fn default() -> Self {
        Self {
            max_period:  256,
            record_size: crate::mesh::VERTEX_SIZE,
            block_sizes: vec![8, 16, 32, 64],
            top_n:       20,
        }
    }
}

// ── Report ───────────────────────────────────────────────────────────────────

/// Recorded when `P` and `R` differ in length and were cut to the shorter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Truncation {
    pub container_len: usize,
    pub reference_len: usize,
    pub compared_len:  usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub kind:    HypothesisKind,
    pub verdict: Verdict,
}

/// Statistics of the XOR difference `X`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyStats {
    pub profile:         ByteProfile,
    /// Runs longer than three bytes.
    pub long_runs:       Vec<Run>,
    /// BLAKE3 of the full key; the cross-file identity of a key.
    pub key_hash:        String,
    /// `X` ⊕ fingerprint bytes over the fingerprint's length (hex).
    pub xor_fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEvidence {
    pub record_size:         usize,
    pub records:             usize,
    pub unique_record_keys:  usize,
    /// Distinct XOR differences between consecutive record keys.
    pub unique_key_deltas:   usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCheck {
    pub block_size:    usize,
    pub consistent:    bool,
    pub unique_blocks: usize,
}

/// Float-level view: is `R` a scaled copy of `P`?
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloatEvidence {
    pub samples:   usize,
    pub ratio_min: f64,
    pub ratio_max: f64,
}

impl FloatEvidence {
    pub fn spread(&self) -> f64 {
        self.ratio_max - self.ratio_min
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyReport {
    pub compared_len: usize,
    pub truncation:   Option<Truncation>,
    /// The confirmed hypothesis, or `Unconfirmed`.
    pub hypothesis:   KeyHypothesis,
    /// Block-consistency evidence backing the verdicts, if any size passed.
    pub supporting:   Option<KeyHypothesis>,
    pub attempts:     Vec<Attempt>,
    pub stats:        KeyStats,
    pub records:      Option<RecordEvidence>,
    pub blocks:       Vec<BlockCheck>,
    pub floats:       Option<FloatEvidence>,
    /// Full XOR difference.  Not persisted; write a key sidecar instead.
    #[serde(skip)]
    pub xor_key:      Vec<u8>,
}

impl KeyReport {
    pub fn is_confirmed(&self) -> bool {
        !matches!(self.hypothesis, KeyHypothesis::Unconfirmed)
    }

    pub fn verdict_of(&self, kind: HypothesisKind) -> Option<Verdict> {
        self.attempts.iter().find(|a| a.kind == kind).map(|a| a.verdict)
    }

    /// The full-length XOR key as a (provisional) hypothesis.
    pub fn global_key(&self) -> KeyHypothesis {
        KeyHypothesis::GlobalXor { key: self.xor_key.clone() }
    }

    /// Cross-file identity of the key: the confirmed transform when there is
    /// one, otherwise the hash of the full XOR difference.
    pub fn key_id(&self) -> String {
        let mut h = blake3::Hasher::new();
        match &self.hypothesis {
            KeyHypothesis::NoTransform => {
                h.update(b"none");
            }
            KeyHypothesis::RepeatingXor { key, .. } | KeyHypothesis::RecordXor { key, .. } => {
                h.update(b"xor:");
                h.update(key);
            }
            KeyHypothesis::SubstitutionTable { table } => {
                h.update(b"sub:");
                for entry in table {
                    h.update(&entry.map_or([0, 0], |b| [1, b]));
                }
            }
            _ => return self.stats.key_hash.clone(),
        }
        h.finalize().to_hex().to_string()
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// Shortest `k` in `1..=min(max_period, len/2)` with `x[i] == x[i % k]` for
/// all `i`.
pub fn shortest_period(x: &[u8], max_period: usize) -> Option<usize> {
    let limit = max_period.min(x.len() / 2);
    (1..=limit).find(|&k| x.iter().skip(k).enumerate().all(|(i, &b)| b == x[i % k]))
}

/// Run the hypothesis battery over a container/reference payload pair.
pub fn recover_key(
    payload:     &[u8],
    reference:   &[u8],
    fingerprint: Option<&[u8]>,
    opts:        &KeyOptions,
) -> KeyReport {
    let n = payload.len().min(reference.len());
    let truncation = (payload.len() != reference.len()).then(|| {
        warn!(
            container_len = payload.len(),
            reference_len = reference.len(),
            compared_len = n,
            "payload length mismatch; truncating to shared length"
        );
        Truncation {
            container_len: payload.len(),
            reference_len: reference.len(),
            compared_len:  n,
        }
    });
    let p = &payload[..n];
    let r = &reference[..n];
    let x = xor_bytes(p, r);

    let mut battery = Battery::default();

    if n == 0 {
        for kind in [
            HypothesisKind::NoTransform,
            HypothesisKind::RepeatingXor,
            HypothesisKind::GlobalXor,
            HypothesisKind::RecordXor,
            HypothesisKind::SubstitutionTable,
            HypothesisKind::BlockConsistent,
        ] {
            battery.record(kind, Verdict::InsufficientEvidence);
        }
    } else {
        // 0. identical payloads
        if x.iter().all(|&b| b == 0) {
            battery.replay(KeyHypothesis::NoTransform, p, r);
        } else {
            let offset = x.iter().position(|&b| b != 0).unwrap_or(0);
            battery.record(HypothesisKind::NoTransform, Verdict::Contradicted { offset });
        }

        // 1. repeating XOR
        match shortest_period(&x, opts.max_period) {
            Some(period) => {
                debug!(period, "repeating XOR period found");
                battery.replay(KeyHypothesis::RepeatingXor { period, key: x[..period].to_vec() }, p, r);
            }
            None => battery.record(HypothesisKind::RepeatingXor, Verdict::InsufficientEvidence),
        }

        // 2. global XOR: replays by construction, never confirmed on its own.
        let global = KeyHypothesis::GlobalXor { key: x.clone() };
        let verdict = match global.validate(p, r) {
            Validation::ExactMatch => Verdict::Provisional,
            Validation::Mismatch { matching, total, .. } => Verdict::ValidationMismatch { matching, total },
            Validation::NotReplayable => Verdict::InsufficientEvidence,
        };
        battery.record(HypothesisKind::GlobalXor, verdict);

        // 3. one key per record
        match record_key(&x, opts.record_size) {
            RecordOutcome::Uniform(key) => battery.replay(
                KeyHypothesis::RecordXor { record_size: opts.record_size, key },
                p,
                r,
            ),
            RecordOutcome::Differs { offset } => {
                battery.record(HypothesisKind::RecordXor, Verdict::Contradicted { offset })
            }
            RecordOutcome::NotApplicable => {
                battery.record(HypothesisKind::RecordXor, Verdict::InsufficientEvidence)
            }
        }

        // 4. substitution
        match substitution_table(p, r) {
            Ok(table) => battery.replay(KeyHypothesis::SubstitutionTable { table }, p, r),
            Err(offset) => battery.record(HypothesisKind::SubstitutionTable, Verdict::Contradicted { offset }),
        }
    }

    // 5. block consistency (evidence only)
    let blocks = block_checks(p, r, &opts.block_sizes);
    let mut supporting = None;
    if n > 0 {
        match blocks.iter().find(|b| b.consistent) {
            Some(b) => {
                supporting = Some(KeyHypothesis::BlockConsistent {
                    block_size:         b.block_size,
                    unique_block_count: b.unique_blocks,
                });
                debug!(block_size = b.block_size, unique = b.unique_blocks, "block-consistent mapping");
                battery.record(HypothesisKind::BlockConsistent, Verdict::Supporting);
            }
            None => battery.record(HypothesisKind::BlockConsistent, Verdict::InsufficientEvidence),
        }
    }

    let stats = key_stats(&x, fingerprint, opts.top_n);
    let records = record_evidence(&x, opts.record_size);
    let floats = float_evidence(p, r);

    KeyReport {
        compared_len: n,
        truncation,
        hypothesis: battery.confirmed.unwrap_or(KeyHypothesis::Unconfirmed),
        supporting,
        attempts: battery.attempts,
        stats,
        records,
        blocks,
        floats,
        xor_key: x,
    }
}

#[derive(Default)]
struct Battery {
    attempts:  Vec<Attempt>,
    confirmed: Option<KeyHypothesis>,
}

impl Battery {
    fn record(&mut self, kind: HypothesisKind, verdict: Verdict) {
        self.attempts.push(Attempt { kind, verdict });
    }

    /// Validate a replayable candidate over the full payload.
    fn replay(&mut self, h: KeyHypothesis, p: &[u8], r: &[u8]) {
        let Some(kind) = h.kind() else { return };
        let verdict = match h.validate(p, r) {
            Validation::ExactMatch if self.confirmed.is_none() => {
                debug!(hypothesis = kind.name(), "hypothesis confirmed");
                self.confirmed = Some(h);
                Verdict::Confirmed
            }
            Validation::ExactMatch => Verdict::Superseded,
            Validation::Mismatch { matching, total, .. } => {
                debug!(hypothesis = kind.name(), matching, total, "replay mismatch");
                Verdict::ValidationMismatch { matching, total }
            }
            Validation::NotReplayable => Verdict::InsufficientEvidence,
        };
        self.record(kind, verdict);
    }
}

enum RecordOutcome {
    Uniform(Vec<u8>),
    Differs { offset: usize },
    NotApplicable,
}

fn record_key(x: &[u8], record_size: usize) -> RecordOutcome {
    if record_size == 0 || x.len() % record_size != 0 || x.len() < 2 * record_size {
        return RecordOutcome::NotApplicable;
    }
    let first = &x[..record_size];
    match x.chunks_exact(record_size).position(|c| c != first) {
        Some(i) => RecordOutcome::Differs { offset: i * record_size },
        None => RecordOutcome::Uniform(first.to_vec()),
    }
}

fn record_evidence(x: &[u8], record_size: usize) -> Option<RecordEvidence> {
    if record_size == 0 || x.len() < record_size {
        return None;
    }
    let keys: Vec<&[u8]> = x.chunks_exact(record_size).collect();
    let unique_record_keys = keys.iter().collect::<HashSet<_>>().len();
    let deltas: HashSet<Vec<u8>> = keys.windows(2).map(|w| xor_bytes(w[0], w[1])).collect();
    Some(RecordEvidence {
        record_size,
        records: keys.len(),
        unique_record_keys,
        unique_key_deltas: deltas.len(),
    })
}

/// Build `P[i] → R[i]`; `Err(offset)` at the first byte that would need a
/// second image for the same source value.
fn substitution_table(p: &[u8], r: &[u8]) -> Result<Vec<Option<u8>>, usize> {
    let mut table: Vec<Option<u8>> = vec![None; 256];
    for (i, (&src, &dst)) in p.iter().zip(r).enumerate() {
        match table[src as usize] {
            Some(existing) if existing != dst => return Err(i),
            Some(_) => {}
            None => table[src as usize] = Some(dst),
        }
    }
    Ok(table)
}

fn block_checks(p: &[u8], r: &[u8], sizes: &[usize]) -> Vec<BlockCheck> {
    let mut out = Vec::new();
    for &size in sizes {
        if size == 0 || p.is_empty() || p.len() % size != 0 {
            continue;
        }
        let mut seen: HashMap<&[u8], &[u8]> = HashMap::new();
        let mut consistent = true;
        for (pb, rb) in p.chunks_exact(size).zip(r.chunks_exact(size)) {
            match seen.get(pb) {
                Some(&prev) if prev != rb => {
                    consistent = false;
                    break;
                }
                Some(_) => {}
                None => {
                    seen.insert(pb, rb);
                }
            }
        }
        out.push(BlockCheck { block_size: size, consistent, unique_blocks: seen.len() });
    }
    out
}

fn key_stats(x: &[u8], fingerprint: Option<&[u8]>, top_n: usize) -> KeyStats {
    let xor_fingerprint = match fingerprint {
        Some(fp) if !fp.is_empty() && x.len() >= fp.len() => hex::encode(xor_bytes(&x[..fp.len()], fp)),
        _ => String::new(),
    };
    KeyStats {
        profile: ByteProfile::of(x, top_n),
        long_runs: stats::longest_runs(x, 4, top_n),
        key_hash: blake3::hash(x).to_hex().to_string(),
        xor_fingerprint,
    }
}

const FLOAT_SAMPLES: usize = 100;

fn float_evidence(p: &[u8], r: &[u8]) -> Option<FloatEvidence> {
    let ratios: Vec<f64> = p
        .chunks_exact(4)
        .zip(r.chunks_exact(4))
        .map(|(a, b)| {
            (
                f32::from_le_bytes([a[0], a[1], a[2], a[3]]) as f64,
                f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            )
        })
        .filter(|(d, s)| d.is_finite() && s.is_finite() && d.abs() > 1e-6)
        .take(FLOAT_SAMPLES)
        .map(|(d, s)| s / d)
        .collect();
    if ratios.is_empty() {
        return None;
    }
    Some(FloatEvidence {
        samples:   ratios.len(),
        ratio_min: ratios.iter().copied().fold(f64::INFINITY, f64::min),
        ratio_max: ratios.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 37 % 251) as u8).collect()
    }

    #[test]
    fn period_eight_is_not_reported_as_sixteen() {
        let key = [3u8, 141, 59, 26, 200, 11, 97, 164];
        let p = payload(512);
        let r = apply_xor(&p, &key);
        let report = recover_key(&p, &r, None, &KeyOptions::default());
        assert_eq!(
            report.hypothesis,
            KeyHypothesis::RepeatingXor { period: 8, key: key.to_vec() }
        );
        assert_eq!(report.verdict_of(HypothesisKind::RepeatingXor), Some(Verdict::Confirmed));
        assert_eq!(report.verdict_of(HypothesisKind::GlobalXor), Some(Verdict::Provisional));
        assert!(report.truncation.is_none());
    }

    #[test]
    fn identical_payloads_are_no_transform() {
        let p = payload(48);
        let report = recover_key(&p, &p, None, &KeyOptions::default());
        assert_eq!(report.hypothesis, KeyHypothesis::NoTransform);
        // Period 1 with a zero key also replays, but only one may confirm.
        assert_eq!(report.verdict_of(HypothesisKind::RepeatingXor), Some(Verdict::Superseded));
    }

    #[test]
    fn position_dependent_key_stays_unconfirmed() {
        let p: Vec<u8> = (0..240).map(|i| (i % 7) as u8).collect();
        let key: Vec<u8> = (0..240).map(|i| (i * i % 253) as u8 ^ 0x5A).collect();
        let r = xor_bytes(&p, &key);
        let report = recover_key(&p, &r, None, &KeyOptions::default());
        assert_eq!(report.hypothesis, KeyHypothesis::Unconfirmed);
        assert_eq!(report.verdict_of(HypothesisKind::GlobalXor), Some(Verdict::Provisional));
        assert!(matches!(
            report.verdict_of(HypothesisKind::RecordXor),
            Some(Verdict::Contradicted { .. })
        ));
        assert_eq!(
            report.verdict_of(HypothesisKind::SubstitutionTable),
            Some(Verdict::Contradicted { offset: 7 })
        );
        assert_eq!(report.global_key().validate(&p, &r), Validation::ExactMatch);
    }

    #[test]
    fn length_mismatch_is_truncated_and_recorded() {
        let key = [9u8, 8, 7, 6];
        let p = payload(100);
        let mut r = apply_xor(&p, &key);
        r.truncate(96);
        let report = recover_key(&p, &r, None, &KeyOptions::default());
        assert_eq!(
            report.truncation,
            Some(Truncation { container_len: 100, reference_len: 96, compared_len: 96 })
        );
        assert_eq!(report.compared_len, 96);
        assert!(report.is_confirmed());
    }

    #[test]
    fn substitution_conflict_offset_is_reported() {
        let p = [1u8, 2, 1, 3];
        let r = [5u8, 6, 7, 8];
        let report = recover_key(&p, &r, None, &KeyOptions::default());
        assert_eq!(
            report.verdict_of(HypothesisKind::SubstitutionTable),
            Some(Verdict::Contradicted { offset: 2 })
        );
    }

    #[test]
    fn non_invertible_substitution_confirms() {
        // 1→9 and 2→9: a function, not a bijection.
        let p = [1u8, 2, 1, 2, 3, 1, 2, 3, 3, 1, 7];
        let r = [9u8, 9, 9, 9, 4, 9, 9, 4, 4, 9, 0];
        let report = recover_key(&p, &r, None, &KeyOptions::default());
        assert_eq!(report.hypothesis.kind(), Some(HypothesisKind::SubstitutionTable));
        assert_eq!(report.hypothesis.validate(&p, &r), Validation::ExactMatch);
    }

    #[test]
    fn record_key_and_evidence() {
        let key: Vec<u8> = (1..=12).collect();
        let p = payload(12 * 20);
        let r = apply_xor(&p, &key);
        let report = recover_key(&p, &r, None, &KeyOptions { max_period: 8, ..KeyOptions::default() });
        assert_eq!(
            report.hypothesis,
            KeyHypothesis::RecordXor { record_size: 12, key: key.clone() }
        );
        let ev = report.records.unwrap();
        assert_eq!((ev.records, ev.unique_record_keys, ev.unique_key_deltas), (20, 1, 1));
    }

    #[test]
    fn block_checks_detect_inconsistency() {
        let p = [0u8; 16];
        let mut r = [0u8; 16];
        r[9] = 1;
        let checks = block_checks(&p, &r, &[8, 16, 3]);
        assert_eq!(checks.len(), 2);
        assert!(!checks[0].consistent);
        assert!(checks[1].consistent);
        assert_eq!(checks[1].unique_blocks, 1);
    }

    #[test]
    fn fingerprint_correlation_and_key_hash() {
        let p = [0u8; 8];
        let r = [0xFFu8; 8];
        let report = recover_key(&p, &r, Some(&[0x0F, 0xF0]), &KeyOptions::default());
        assert_eq!(report.stats.xor_fingerprint, "f00f");
        assert_eq!(report.stats.key_hash, blake3::hash(&[0xFF; 8]).to_hex().to_string());
    }

    #[test]
    fn key_id_ignores_payload_length_for_repeating_keys() {
        let key = [0x10u8, 0x20, 0x30];
        let short = payload(30);
        let long = payload(90);
        let a = recover_key(&short, &apply_xor(&short, &key), None, &KeyOptions::default());
        let b = recover_key(&long, &apply_xor(&long, &key), None, &KeyOptions::default());
        assert_ne!(a.stats.key_hash, b.stats.key_hash);
        assert_eq!(a.key_id(), b.key_id());
    }

    #[test]
    fn empty_payload_is_insufficient_evidence() {
        let report = recover_key(&[], &[], None, &KeyOptions::default());
        assert_eq!(report.hypothesis, KeyHypothesis::Unconfirmed);
        assert!(report.attempts.iter().all(|a| a.verdict == Verdict::InsufficientEvidence));
    }
}
