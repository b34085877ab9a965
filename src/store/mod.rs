//! Batch database and cross-pair correlation.
//!
//! ```text
//! BatchDatabase (JSON)
//! ┌──────────────────────────────────────────────────────────┐
//! │ version · batch_id · created_at · precision · marker     │
//! │ records: [ AnalysisRecord, … ]   (work-list order)       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Records are immutable once produced.  [`BatchDatabase::correlate`] runs over
//! a live batch or a reloaded one alike, so reports never need the source
//! files again.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::container::{ContainerError, ContainerSummary};
use crate::facets::FacetReport;
use crate::keys::{HypothesisKind, KeyReport, Verdict};
use crate::stats::ByteProfile;
use crate::stl::StlError;

pub const DATABASE_VERSION: u32 = 1;
pub const KEY_SIDECAR_EXT: &str = "key";

const PATTERN_HEX_LEN: usize = 32;
const PATTERN_LIMIT: usize = 10;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Corrupt batch database {path}: {reason}")]
    CorruptDatabase { path: PathBuf, reason: String },
    #[error("No valid pairs in batch ({total} records)")]
    NoValidPairs { total: usize },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ── Records ──────────────────────────────────────────────────────────────────

/// Why a pair was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedContainer,
    PayloadLengthMismatch,
    UnsupportedStl,
    Io,
}

impl From<&ContainerError> for ErrorKind {
    fn from(e: &ContainerError) -> Self {
        match e {
            ContainerError::PayloadLengthMismatch { .. } => ErrorKind::PayloadLengthMismatch,
            ContainerError::Io(_) => ErrorKind::Io,
            ContainerError::MalformedContainer(_)
            | ContainerError::Base64 { .. }
            | ContainerError::Xml(_) => ErrorKind::MalformedContainer,
        }
    }
}

impl From<&StlError> for ErrorKind {
    fn from(e: &StlError) -> Self {
        match e {
            StlError::UnsupportedVariant(_) => ErrorKind::UnsupportedStl,
            StlError::Io(_) => ErrorKind::Io,
        }
    }
}

/// Everything derived from one successfully loaded pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairAnalysis {
    pub container:           ContainerSummary,
    pub precision:           u32,
    pub reference_triangles: usize,
    pub reference_vertices:  usize,
    pub vertex_profile:      ByteProfile,
    pub key:                 KeyReport,
    pub facets:              FacetReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PairOutcome {
    Analyzed(Box<PairAnalysis>),
    Errored { kind: ErrorKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub container_path: PathBuf,
    pub reference_path: PathBuf,
    pub processed_at:   DateTime<Utc>,
    pub elapsed_ms:     u64,
    /// Recoverable conditions met while analysing (truncation, ...).
    pub warnings:       Vec<String>,
    pub outcome:        PairOutcome,
}

impl AnalysisRecord {
    pub fn analysis(&self) -> Option<&PairAnalysis> {
        match &self.outcome {
            PairOutcome::Analyzed(a) => Some(a),
            PairOutcome::Errored { .. } => None,
        }
    }

    pub fn is_errored(&self) -> bool {
        self.analysis().is_none()
    }

    pub fn fingerprint(&self) -> &str {
        self.analysis().map_or("", |a| a.container.signature_hash.as_str())
    }
}

// ── Database ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchDatabase {
    pub version:    u32,
    pub batch_id:   Uuid,
    pub created_at: DateTime<Utc>,
    /// Vertex precision the batch ran with.
    pub precision:  u32,
    /// Facet marker the batch ran with; `None` when no payload offered one.
    pub marker:     Option<u8>,
    pub records:    Vec<AnalysisRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total:            usize,
    pub analyzed:         usize,
    pub errored:          usize,
    pub keys_confirmed:   usize,
    pub keys_unconfirmed: usize,
    pub facets_decoded:   usize,
    pub truncated:        usize,
}

impl BatchDatabase {
    pub fn new(records: Vec<AnalysisRecord>, precision: u32, marker: Option<u8>) -> Self {
        Self {
            version: DATABASE_VERSION,
            batch_id: Uuid::new_v4(),
            created_at: Utc::now(),
            precision,
            marker,
            records,
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let mut w = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut w, self)?;
        w.write_all(b"\n")?;
        w.flush()?;
        info!(path = %path.display(), records = self.records.len(), "batch database saved");
        Ok(())
    }

    /// Reload a persisted batch.  Any parse failure or unknown version is
    /// reported as corruption.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let reader = BufReader::new(File::open(path)?);
        let db: BatchDatabase = serde_json::from_reader(reader).map_err(|e| StoreError::CorruptDatabase {
            path:   path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if db.version > DATABASE_VERSION {
            return Err(StoreError::CorruptDatabase {
                path:   path.to_path_buf(),
                reason: format!("unsupported version {}", db.version),
            });
        }
        Ok(db)
    }

    pub fn summary(&self) -> BatchSummary {
        let mut s = BatchSummary { total: self.records.len(), ..BatchSummary::default() };
        for r in &self.records {
            match r.analysis() {
                None => s.errored += 1,
                Some(a) => {
                    s.analyzed += 1;
                    if a.key.is_confirmed() {
                        s.keys_confirmed += 1;
                    } else {
                        s.keys_unconfirmed += 1;
                    }
                    if a.facets.result.is_decoded() {
                        s.facets_decoded += 1;
                    }
                    if a.key.truncation.is_some() {
                        s.truncated += 1;
                    }
                }
            }
        }
        s
    }

    /// Cross-pair invariants over every analysed record.
    pub fn correlate(&self) -> Result<CorrelationReport, StoreError> {
        let summary = self.summary();
        let analyzed: Vec<(&AnalysisRecord, &PairAnalysis)> =
            self.records.iter().filter_map(|r| r.analysis().map(|a| (r, a))).collect();
        if analyzed.is_empty() {
            return Err(StoreError::NoValidPairs { total: self.records.len() });
        }

        // key id → records
        let mut by_key: BTreeMap<String, Vec<&(&AnalysisRecord, &PairAnalysis)>> = BTreeMap::new();
        // fingerprint → key ids
        let mut by_fingerprint: BTreeMap<&str, Vec<(&AnalysisRecord, String)>> = BTreeMap::new();
        for entry in &analyzed {
            let (rec, a) = *entry;
            let id = a.key.key_id();
            by_key.entry(id.clone()).or_default().push(entry);
            if !a.container.signature_hash.is_empty() {
                by_fingerprint
                    .entry(a.container.signature_hash.as_str())
                    .or_default()
                    .push((rec, id));
            }
        }

        let mut fingerprint_anomalies = Vec::new();
        let mut consistent_fingerprints = 0;
        for (fp, members) in &by_fingerprint {
            let keys: BTreeSet<&str> = members.iter().map(|(_, k)| k.as_str()).collect();
            if keys.len() > 1 {
                warn!(fingerprint = %fp, distinct_keys = keys.len(), "same fingerprint, different keys");
                fingerprint_anomalies.push(FingerprintAnomaly {
                    fingerprint:   fp.to_string(),
                    distinct_keys: keys.len(),
                    containers:    members.iter().map(|(r, _)| r.container_path.clone()).collect(),
                });
            } else if members.len() > 1 {
                consistent_fingerprints += 1;
            }
        }

        let mut duplicate_keys = Vec::new();
        let mut shared_keys = Vec::new();
        let mut reused_keys = Vec::new();
        for (id, members) in &by_key {
            if members.len() < 2 {
                continue;
            }
            let fingerprints: BTreeSet<String> = members
                .iter()
                .map(|(_, a)| a.container.signature_hash.clone())
                .filter(|f| !f.is_empty())
                .collect();
            let group = KeyGroup {
                key_id:       id.clone(),
                count:        members.len(),
                fingerprints: fingerprints.iter().cloned().collect(),
                containers:   members.iter().map(|(r, _)| r.container_path.clone()).collect(),
            };
            let provisional_only = members.iter().all(|(_, a)| {
                !a.key.is_confirmed()
                    && a.key.verdict_of(HypothesisKind::GlobalXor) == Some(Verdict::Provisional)
            });
            if provisional_only {
                reused_keys.push(id.clone());
            }
            if fingerprints.len() > 1 {
                shared_keys.push(group.clone());
            }
            duplicate_keys.push(group);
        }

        let key_fingerprint_patterns = rank_patterns(
            analyzed.iter().map(|(_, a)| a.key.stats.xor_fingerprint.as_str()).filter(|s| !s.is_empty()),
        );
        let key_prefix_patterns =
            rank_patterns(analyzed.iter().map(|(_, a)| a.key.stats.profile.first_64_hex.as_str()));
        let facet_prefix_patterns =
            rank_patterns(analyzed.iter().map(|(_, a)| a.facets.profile.first_64_hex.as_str()));

        let facet_entropy = EntropyRange::of(analyzed.iter().map(|(_, a)| a.facets.profile.entropy));

        let mut facet_bytes = [0u64; 256];
        for (_, a) in &analyzed {
            for &(b, c) in &a.facets.profile.top_bytes {
                facet_bytes[b as usize] += c;
            }
        }

        let mut by_source: BTreeMap<&str, Vec<&PairAnalysis>> = BTreeMap::new();
        for (_, a) in &analyzed {
            by_source.entry(a.container.scan_source()).or_default().push(a);
        }
        let mut by_scan_source: Vec<SourceStats> = by_source
            .into_iter()
            .map(|(source, items)| {
                let n = items.len() as f64;
                SourceStats {
                    scan_source:         source.to_string(),
                    files:               items.len(),
                    mean_key_entropy:    items.iter().map(|a| a.key.stats.profile.entropy).sum::<f64>() / n,
                    mean_facet_entropy:  items.iter().map(|a| a.facets.profile.entropy).sum::<f64>() / n,
                    mean_vertex_entropy: items.iter().map(|a| a.vertex_profile.entropy).sum::<f64>() / n,
                }
            })
            .collect();
        by_scan_source.sort_by(|a, b| b.files.cmp(&a.files).then_with(|| a.scan_source.cmp(&b.scan_source)));

        Ok(CorrelationReport {
            summary,
            unique_keys: by_key.len(),
            duplicate_keys,
            shared_keys,
            reused_keys,
            fingerprint_anomalies,
            consistent_fingerprints,
            key_fingerprint_patterns,
            key_prefix_patterns,
            facet_prefix_patterns,
            facet_entropy,
            facet_byte_distribution: crate::stats::top_from_histogram(&facet_bytes, 15)
                .into_iter()
                .filter(|&(_, c)| c > 0)
                .collect(),
            by_scan_source,
        })
    }
}

fn rank_patterns<'a, I: Iterator<Item = &'a str>>(hexes: I) -> Vec<(String, usize)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for h in hexes {
        let cut = h.get(..PATTERN_HEX_LEN).unwrap_or(h);
        *counts.entry(cut).or_insert(0) += 1;
    }
    let mut out: Vec<(String, usize)> = counts.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
    out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    out.truncate(PATTERN_LIMIT);
    out
}

// ── Correlation report ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyGroup {
    pub key_id:       String,
    pub count:        usize,
    pub fingerprints: Vec<String>,
    pub containers:   Vec<PathBuf>,
}

/// A fingerprint whose records disagree on the key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintAnomaly {
    pub fingerprint:   String,
    pub distinct_keys: usize,
    pub containers:    Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntropyRange {
    pub min:  f64,
    pub max:  f64,
    pub mean: f64,
}

impl EntropyRange {
    fn of<I: Iterator<Item = f64>>(values: I) -> Option<Self> {
        let v: Vec<f64> = values.collect();
        if v.is_empty() {
            return None;
        }
        Some(Self {
            min:  v.iter().copied().fold(f64::INFINITY, f64::min),
            max:  v.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            mean: v.iter().sum::<f64>() / v.len() as f64,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStats {
    pub scan_source:         String,
    pub files:               usize,
    pub mean_key_entropy:    f64,
    pub mean_facet_entropy:  f64,
    pub mean_vertex_entropy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationReport {
    pub summary:                 BatchSummary,
    pub unique_keys:             usize,
    /// Keys seen in more than one record.
    pub duplicate_keys:          Vec<KeyGroup>,
    /// Duplicate keys spanning different fingerprints.
    pub shared_keys:             Vec<KeyGroup>,
    /// Provisional full-length keys that another record reproduced.
    pub reused_keys:             Vec<String>,
    pub fingerprint_anomalies:   Vec<FingerprintAnomaly>,
    /// Fingerprints seen at least twice that always gave the same key.
    pub consistent_fingerprints: usize,
    pub key_fingerprint_patterns: Vec<(String, usize)>,
    pub key_prefix_patterns:     Vec<(String, usize)>,
    pub facet_prefix_patterns:   Vec<(String, usize)>,
    pub facet_entropy:           Option<EntropyRange>,
    pub facet_byte_distribution: Vec<(u8, u64)>,
    pub by_scan_source:          Vec<SourceStats>,
}

impl CorrelationReport {
    /// "Same fingerprint ⇒ same key" held for every fingerprint in the batch.
    pub fn fingerprints_consistent(&self) -> bool {
        self.fingerprint_anomalies.is_empty()
    }
}

// ── Key sidecars ─────────────────────────────────────────────────────────────

/// `<dir>/<container file name>.key`
pub fn key_sidecar_path(dir: &Path, container: &Path) -> PathBuf {
    let name = container
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "container".into());
    dir.join(format!("{name}.{KEY_SIDECAR_EXT}"))
}

/// Sidecar path for every container of a work list, in order.
///
/// Containers whose file name is unique keep `<name>.key`.  A file name
/// shared by several containers gets a short BLAKE3 of the full container
/// path, `<name>.<hash>.key`, and the work-list index on top when the same
/// path is listed twice.  No two returned paths are equal.
pub fn plan_key_sidecars(dir: &Path, containers: &[&Path]) -> Vec<PathBuf> {
    let plain: Vec<PathBuf> = containers.iter().map(|c| key_sidecar_path(dir, c)).collect();
    let mut uses: HashMap<&Path, usize> = HashMap::new();
    for p in &plain {
        *uses.entry(p.as_path()).or_insert(0) += 1;
    }
    let mut hashed: Vec<PathBuf> = containers
        .iter()
        .zip(&plain)
        .map(|(c, p)| {
            if uses[p.as_path()] > 1 {
                hashed_sidecar_path(dir, c, None)
            } else {
                p.clone()
            }
        })
        .collect();
    let mut repeats: HashMap<PathBuf, usize> = HashMap::new();
    for p in &hashed {
        *repeats.entry(p.clone()).or_insert(0) += 1;
    }
    for (i, (p, c)) in hashed.iter_mut().zip(containers).enumerate() {
        if repeats[p.as_path()] > 1 {
            *p = hashed_sidecar_path(dir, c, Some(i));
        }
    }
    hashed
}

fn hashed_sidecar_path(dir: &Path, container: &Path, index: Option<usize>) -> PathBuf {
    let name = container
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "container".into());
    let hash = blake3::hash(container.to_string_lossy().as_bytes()).to_hex();
    let tag = &hash.as_str()[..8];
    match index {
        Some(i) => dir.join(format!("{name}.{tag}-{i}.{KEY_SIDECAR_EXT}")),
        None => dir.join(format!("{name}.{tag}.{KEY_SIDECAR_EXT}")),
    }
}

pub fn write_key_sidecar(path: &Path, key: &[u8]) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, key)
}

pub fn read_key_sidecar(path: &Path) -> io::Result<Vec<u8>> {
    std::fs::read(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facets::{self, FacetOptions};
    use crate::keys::{self, apply_xor, KeyOptions};
    use crate::mesh::MeshSample;
    use std::collections::BTreeMap;

    fn record(name: &str, fingerprint: &str, source: &str, key: &[u8]) -> AnalysisRecord {
        let p: Vec<u8> = (0..96u32).map(|i| (i % 5) as u8).collect();
        let r = apply_xor(&p, key);
        let key_report = keys::recover_key(&p, &r, None, &KeyOptions::default());
        let facet_payload = [0u8, 1, 9, 0, 2];
        let facets = facets::analyze_facets(&facet_payload, 1, 9, &MeshSample::default(), &FacetOptions::default());
        let mut properties = BTreeMap::new();
        properties.insert("ScanSource".to_string(), source.to_string());
        AnalysisRecord {
            container_path: PathBuf::from(format!("{name}.dcm")),
            reference_path: PathBuf::from(format!("{name}.stl")),
            processed_at:   Utc::now(),
            elapsed_ms:     1,
            warnings:       Vec::new(),
            outcome:        PairOutcome::Analyzed(Box::new(PairAnalysis {
                container: ContainerSummary {
                    format_version: "1.0".into(),
                    ce_version:     "2.0".into(),
                    schema:         None,
                    signature_hash: fingerprint.into(),
                    properties,
                    facet_count:    1,
                    facet_color:    None,
                    facet_bytes:    facet_payload.len(),
                    vertex_bytes:   p.len(),
                },
                precision:           6,
                reference_triangles: 1,
                reference_vertices:  8,
                vertex_profile:      ByteProfile::of(&p, 5),
                key:                 key_report,
                facets,
            })),
        }
    }

    fn errored(name: &str) -> AnalysisRecord {
        AnalysisRecord {
            container_path: PathBuf::from(format!("{name}.dcm")),
            reference_path: PathBuf::from(format!("{name}.stl")),
            processed_at:   Utc::now(),
            elapsed_ms:     0,
            warnings:       Vec::new(),
            outcome:        PairOutcome::Errored {
                kind:    ErrorKind::MalformedContainer,
                message: "missing CE".into(),
            },
        }
    }

    #[test]
    fn same_fingerprint_different_key_is_an_anomaly() {
        let db = BatchDatabase::new(
            vec![
                record("a", "AA11", "TRIOS", &[1, 2, 3, 4]),
                record("b", "AA11", "TRIOS", &[9, 9, 9, 8]),
                record("c", "BB22", "iTero", &[5, 6]),
                record("d", "BB22", "iTero", &[5, 6]),
            ],
            6,
            Some(9),
        );
        let report = db.correlate().unwrap();
        assert!(!report.fingerprints_consistent());
        assert_eq!(report.fingerprint_anomalies.len(), 1);
        assert_eq!(report.fingerprint_anomalies[0].fingerprint, "AA11");
        assert_eq!(report.fingerprint_anomalies[0].distinct_keys, 2);
        assert_eq!(report.consistent_fingerprints, 1);
        assert_eq!(report.unique_keys, 3);
        assert!(report.shared_keys.is_empty());
        assert_eq!(report.by_scan_source.len(), 2);
    }

    #[test]
    fn key_shared_across_fingerprints_is_reported() {
        let db = BatchDatabase::new(
            vec![
                record("a", "AA11", "TRIOS", &[7, 7, 1]),
                record("b", "CC33", "TRIOS", &[7, 7, 1]),
                errored("x"),
            ],
            6,
            None,
        );
        let report = db.correlate().unwrap();
        assert_eq!(report.shared_keys.len(), 1);
        assert_eq!(report.shared_keys[0].fingerprints, vec!["AA11", "CC33"]);
        assert!(report.reused_keys.is_empty());
        assert_eq!(report.summary.errored, 1);
        assert_eq!(report.summary.analyzed, 2);
        assert_eq!(report.summary.keys_confirmed, 2);
        assert_eq!(report.key_prefix_patterns[0].1, 2);
    }

    #[test]
    fn provisional_key_seen_twice_is_reused() {
        let key: Vec<u8> = (0..96u32).map(|i| (i * i % 251) as u8).collect();
        let db = BatchDatabase::new(
            vec![record("a", "AA11", "TRIOS", &key), record("b", "", "TRIOS", &key)],
            6,
            None,
        );
        let report = db.correlate().unwrap();
        assert_eq!(report.summary.keys_unconfirmed, 2);
        assert_eq!(report.reused_keys.len(), 1);
        assert_eq!(report.duplicate_keys[0].count, 2);
        assert_eq!(report.duplicate_keys[0].fingerprints, vec!["AA11"]);
    }

    #[test]
    fn all_errored_batch_is_fatal() {
        let db = BatchDatabase::new(vec![errored("x"), errored("y")], 6, None);
        assert!(matches!(db.correlate(), Err(StoreError::NoValidPairs { total: 2 })));
    }

    #[test]
    fn save_and_reload_without_sources() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.json");
        let db = BatchDatabase::new(vec![record("a", "AA11", "TRIOS", &[1, 2]), errored("x")], 5, Some(9));
        db.save(&path).unwrap();
        let back = BatchDatabase::load(&path).unwrap();
        assert_eq!(back.batch_id, db.batch_id);
        assert_eq!(back.records.len(), 2);
        assert_eq!(back.summary(), db.summary());
        assert_eq!(back.correlate().unwrap().unique_keys, 1);
    }

    #[test]
    fn corrupt_database_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.json");
        std::fs::write(&path, b"{\"version\": 1, \"records\": [").unwrap();
        assert!(matches!(BatchDatabase::load(&path), Err(StoreError::CorruptDatabase { .. })));

        let mut db = BatchDatabase::new(Vec::new(), 6, None);
        db.version = DATABASE_VERSION + 1;
        db.save(&path).unwrap();
        assert!(matches!(BatchDatabase::load(&path), Err(StoreError::CorruptDatabase { .. })));
    }

    #[test]
    fn key_sidecar_naming() {
        let dir = tempfile::tempdir().unwrap();
        let path = key_sidecar_path(dir.path(), Path::new("/scans/upper.dcm"));
        assert_eq!(path.file_name().unwrap(), "upper.dcm.key");
        write_key_sidecar(&path, &[1, 2, 3]).unwrap();
        assert_eq!(read_key_sidecar(&path).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn shared_file_names_get_distinct_sidecars() {
        let dir = Path::new("/keys");
        let plan = plan_key_sidecars(
            dir,
            &[
                Path::new("/a/scan.dcm"),
                Path::new("/b/scan.dcm"),
                Path::new("/a/other.dcm"),
                Path::new("/b/scan.dcm"),
            ],
        );
        assert_eq!(plan[2], dir.join("other.dcm.key"));
        let names: BTreeSet<&PathBuf> = plan.iter().collect();
        assert_eq!(names.len(), 4);
        for p in [&plan[0], &plan[1], &plan[3]] {
            let name = p.file_name().unwrap().to_string_lossy();
            assert!(name.starts_with("scan.dcm.") && name.ends_with(".key"), "{name}");
            assert_ne!(name, "scan.dcm.key");
        }
        assert!(plan[3].to_string_lossy().ends_with("-3.key"));
    }
}
