//! Batch pipeline over container/reference pairs.
//!
//! ```text
//! pairs ─► [limit] ─► load (parallel) ─► barrier: precision, marker ─► analyze (parallel) ─► BatchDatabase
//! ```
//!
//! Each pair is one task in both phases and shares no mutable state with any
//! other.  A pair that fails to load becomes an errored record; it never stops
//! the batch.  Results keep work-list order whichever way the tasks ran.

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::container::{read_container, ContainerRecord};
use crate::facets::{self, FacetReport, MarkerDiscovery};
use crate::keys::recover_key;
use crate::mesh::{derive_precision, MeshSample, VERTEX_SIZE};
use crate::options::AnalysisOptions;
use crate::stats::{self, ByteProfile};
use crate::stl::{read_stl, TriangleSoup};
use crate::store::{
    key_sidecar_path, plan_key_sidecars, write_key_sidecar, AnalysisRecord, BatchDatabase, ErrorKind,
    PairAnalysis, PairOutcome, StoreError,
};

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("No valid pairs in batch ({total} pairs scheduled)")]
    NoValidPairs { total: usize },
    #[error("Mapping file line {line}: {reason}")]
    Mapping { line: usize, reason: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ── Work list ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairPaths {
    pub container: PathBuf,
    pub reference: PathBuf,
}

impl PairPaths {
    pub fn new(container: impl Into<PathBuf>, reference: impl Into<PathBuf>) -> Self {
        Self { container: container.into(), reference: reference.into() }
    }
}

/// Parse a mapping file: one `container,reference` pair per line, blank lines
/// and `#` comments ignored.  Relative paths resolve against `base`.
pub fn parse_mapping(text: &str, base: &Path) -> Result<Vec<PairPaths>, BatchError> {
    let mut pairs = Vec::new();
    for (i, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split(',').map(str::trim);
        let (Some(c), Some(r), None) = (fields.next(), fields.next(), fields.next()) else {
            return Err(BatchError::Mapping { line: i + 1, reason: "expected two comma-separated paths".into() });
        };
        if c.is_empty() || r.is_empty() {
            return Err(BatchError::Mapping { line: i + 1, reason: "empty path".into() });
        }
        pairs.push(PairPaths::new(base.join(c), base.join(r)));
    }
    Ok(pairs)
}

pub fn read_mapping(path: &Path) -> Result<Vec<PairPaths>, BatchError> {
    let text = std::fs::read_to_string(path)?;
    parse_mapping(&text, path.parent().unwrap_or_else(|| Path::new("")))
}

// ── Worker pool ──────────────────────────────────────────────────────────────

/// Run `f` over every item, in parallel when the `parallel` feature is on.
/// Output order always matches input order.
fn map_tasks<T, R, F>(items: &[T], f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync + Send,
{
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        items.par_iter().map(f).collect()
    }

    #[cfg(not(feature = "parallel"))]
    {
        items.iter().map(f).collect()
    }
}

// ── Phase 1: load ────────────────────────────────────────────────────────────

/// A pair whose inputs both parsed.
#[derive(Debug, Clone)]
pub struct LoadedPair {
    pub paths:     PairPaths,
    pub container: ContainerRecord,
    pub soup:      TriangleSoup,
    /// Key sidecar target assigned by the batch; `None` means the plain
    /// `<key_dir>/<name>.key`.
    pub sidecar:   Option<PathBuf>,
    load_ms:       u64,
}

impl LoadedPair {
    pub fn expected_vertices(&self) -> usize {
        self.container.vertex_payload.len() / VERTEX_SIZE
    }
}

pub enum Loaded {
    Ready(Box<LoadedPair>),
    Failed(AnalysisRecord),
}

pub fn load_pair(paths: &PairPaths) -> Loaded {
    let started = Instant::now();
    let fail = |kind: ErrorKind, message: String| {
        warn!(container = %paths.container.display(), ?kind, message = message.as_str(), "pair skipped");
        Loaded::Failed(AnalysisRecord {
            container_path: paths.container.clone(),
            reference_path: paths.reference.clone(),
            processed_at:   Utc::now(),
            elapsed_ms:     elapsed_ms(started),
            warnings:       Vec::new(),
            outcome:        PairOutcome::Errored { kind, message },
        })
    };
    let container = match read_container(&paths.container) {
        Ok(c) => c,
        Err(e) => return fail(ErrorKind::from(&e), e.to_string()),
    };
    let soup = match read_stl(&paths.reference) {
        Ok(s) => s,
        Err(e) => return fail(ErrorKind::from(&e), e.to_string()),
    };
    debug!(
        container = %paths.container.display(),
        vertex_bytes = container.vertex_payload.len(),
        facet_bytes = container.facet_payload.len(),
        triangles = soup.len(),
        "pair loaded"
    );
    Loaded::Ready(Box::new(LoadedPair {
        paths: paths.clone(),
        container,
        soup,
        sidecar: None,
        load_ms: elapsed_ms(started),
    }))
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

// ── Barrier: batch-wide parameters ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchParameters {
    pub precision:        u32,
    /// Pairs whose reference reduced to exactly the declared vertex count.
    pub precision_hits:   Option<usize>,
    pub marker:           Option<u8>,
    pub marker_discovery: Option<MarkerDiscovery>,
}

/// Derive precision and marker over every loaded pair, unless fixed.
pub fn derive_parameters(loaded: &[&LoadedPair], opts: &AnalysisOptions) -> BatchParameters {
    let (precision, precision_hits) = match opts.precision {
        Some(p) => (p, None),
        None => {
            let derived = derive_precision(
                loaded.iter().map(|p| (&p.soup.triangles[..], p.expected_vertices())),
                &opts.precision_candidates,
            );
            match derived {
                Some((p, hits)) => (p, Some(hits)),
                None => {
                    let p = opts.fallback_precision();
                    warn!(precision = p, "no precision reproduces declared vertex counts; using fallback");
                    (p, Some(0))
                }
            }
        }
    };

    let (marker, marker_discovery) = match opts.facets.marker {
        Some(m) => (Some(m), None),
        None => {
            let d = facets::discover_marker(
                loaded.iter().map(|p| (&p.container.facet_payload[..], p.soup.len())),
                &opts.facets,
            );
            (d.as_ref().map(|d| d.marker), d)
        }
    };
    info!(precision, ?precision_hits, ?marker, pairs = loaded.len(), "batch parameters");
    BatchParameters { precision, precision_hits, marker, marker_discovery }
}

// ── Phase 2: analyze ─────────────────────────────────────────────────────────

/// Marker for one payload: the batch marker, or this payload's most
/// frequent byte when the batch has none.
pub(crate) fn marker_for(payload: &[u8], batch_marker: Option<u8>) -> u8 {
    batch_marker.unwrap_or_else(|| stats::top_bytes(payload, 1).first().map_or(0, |&(b, _)| b))
}

pub fn analyze_pair(pair: &LoadedPair, params: &BatchParameters, opts: &AnalysisOptions) -> AnalysisRecord {
    let started = Instant::now();
    let c = &pair.container;
    let mut warnings = Vec::new();

    let mesh = MeshSample::canonicalize(pair.soup.triangles.iter().copied(), params.precision);
    if c.vertex_payload.len() % VERTEX_SIZE != 0 {
        let msg = format!("vertex payload of {} bytes is not a whole number of vertices", c.vertex_payload.len());
        warn!(container = %pair.paths.container.display(), "{msg}");
        warnings.push(msg);
    }
    if mesh.vertices.len() != pair.expected_vertices() {
        let msg = format!(
            "reference has {} unique vertices at precision {}, container declares {}",
            mesh.vertices.len(),
            params.precision,
            pair.expected_vertices()
        );
        warn!(container = %pair.paths.container.display(), "{msg}");
        warnings.push(msg);
    }
    if mesh.faces.len() != c.facet_count as usize {
        let msg = format!("reference has {} faces, container declares {}", mesh.faces.len(), c.facet_count);
        warn!(container = %pair.paths.container.display(), "{msg}");
        warnings.push(msg);
    }

    let reference_payload = mesh.vertex_payload();
    let fingerprint = c.fingerprint_bytes();
    let key = recover_key(&c.vertex_payload, &reference_payload, fingerprint.as_deref(), &opts.keys);
    if let Some(t) = key.truncation {
        warnings.push(format!(
            "payload length mismatch: container {} bytes, reference {} bytes, compared {}",
            t.container_len, t.reference_len, t.compared_len
        ));
    }

    if let Some(dir) = &opts.key_dir {
        let plain = key_sidecar_path(dir, &pair.paths.container);
        let path = pair.sidecar.clone().unwrap_or_else(|| plain.clone());
        if path != plain {
            let msg = format!(
                "container file name is shared within the batch; key sidecar written as {}",
                path.display()
            );
            warn!(container = %pair.paths.container.display(), "{msg}");
            warnings.push(msg);
        }
        match write_key_sidecar(&path, &key.xor_key) {
            Ok(()) => debug!(path = %path.display(), "key sidecar written"),
            Err(e) => {
                warn!(error = %e, "key sidecar not written");
                warnings.push(format!("key sidecar not written: {e}"));
            }
        }
    }

    let marker = marker_for(&c.facet_payload, params.marker);
    let facets: FacetReport = facets::analyze_facets(&c.facet_payload, c.facet_count, marker, &mesh, &opts.facets);

    info!(
        container = %pair.paths.container.display(),
        key = key.hypothesis.kind().map_or("unconfirmed", |k| k.name()),
        facets_decoded = facets.result.is_decoded(),
        "pair analyzed"
    );

    AnalysisRecord {
        container_path: pair.paths.container.clone(),
        reference_path: pair.paths.reference.clone(),
        processed_at:   Utc::now(),
        elapsed_ms:     pair.load_ms.saturating_add(elapsed_ms(started)),
        warnings,
        outcome:        PairOutcome::Analyzed(Box::new(PairAnalysis {
            container:           c.summary(),
            precision:           params.precision,
            reference_triangles: pair.soup.len(),
            reference_vertices:  mesh.vertices.len(),
            vertex_profile:      ByteProfile::of(&c.vertex_payload, opts.keys.top_n),
            key,
            facets,
        })),
    }
}

// ── Driver ───────────────────────────────────────────────────────────────────

pub struct BatchRun {
    pub database:   BatchDatabase,
    pub parameters: BatchParameters,
}

fn limited<'a>(pairs: &'a [PairPaths], opts: &AnalysisOptions) -> &'a [PairPaths] {
    match opts.pair_limit {
        Some(n) if n < pairs.len() => &pairs[..n],
        _ => pairs,
    }
}

/// Load every pair, split into ready pairs and errored records (in order).
fn load_all(pairs: &[PairPaths]) -> Vec<Loaded> {
    map_tasks(pairs, load_pair)
}

/// Fix every ready pair's sidecar path before the analyze phase so no two
/// tasks write the same file.
fn assign_sidecars(loaded: &mut [Loaded], dir: &Path) {
    let containers: Vec<PathBuf> = loaded
        .iter()
        .filter_map(|l| match l {
            Loaded::Ready(p) => Some(p.paths.container.clone()),
            Loaded::Failed(_) => None,
        })
        .collect();
    let refs: Vec<&Path> = containers.iter().map(PathBuf::as_path).collect();
    let mut plan = plan_key_sidecars(dir, &refs).into_iter();
    for l in loaded.iter_mut() {
        if let Loaded::Ready(p) = l {
            p.sidecar = plan.next();
        }
    }
}

pub fn run_batch(pairs: &[PairPaths], opts: &AnalysisOptions) -> Result<BatchRun, BatchError> {
    let pairs = limited(pairs, opts);
    info!(pairs = pairs.len(), "batch started");
    let mut loaded = load_all(pairs);
    if let Some(dir) = &opts.key_dir {
        assign_sidecars(&mut loaded, dir);
    }
    let ready: Vec<&LoadedPair> = loaded
        .iter()
        .filter_map(|l| match l {
            Loaded::Ready(p) => Some(&**p),
            Loaded::Failed(_) => None,
        })
        .collect();
    if ready.is_empty() {
        return Err(BatchError::NoValidPairs { total: pairs.len() });
    }

    let parameters = derive_parameters(&ready, opts);

    let records = map_tasks(&loaded, |l| match l {
        Loaded::Ready(p) => analyze_pair(p, &parameters, opts),
        Loaded::Failed(r) => r.clone(),
    });

    let database = BatchDatabase::new(records, parameters.precision, parameters.marker);
    let s = database.summary();
    info!(
        total = s.total,
        analyzed = s.analyzed,
        errored = s.errored,
        confirmed = s.keys_confirmed,
        unconfirmed = s.keys_unconfirmed,
        "batch finished"
    );
    Ok(BatchRun { database, parameters })
}

// ── Facet survey ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacetSurveyEntry {
    pub container: PathBuf,
    pub report:    FacetReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacetSurvey {
    pub parameters:      BatchParameters,
    /// Header bytes identical across every loaded facet payload.
    pub constant_header: Vec<(usize, u8)>,
    pub entries:         Vec<FacetSurveyEntry>,
    pub skipped:         usize,
}

/// Facet evidence and decode attempts only; no key recovery.
pub fn survey_facets(pairs: &[PairPaths], opts: &AnalysisOptions) -> Result<FacetSurvey, BatchError> {
    let pairs = limited(pairs, opts);
    let loaded = load_all(pairs);
    let ready: Vec<&LoadedPair> = loaded
        .iter()
        .filter_map(|l| match l {
            Loaded::Ready(p) => Some(&**p),
            Loaded::Failed(_) => None,
        })
        .collect();
    if ready.is_empty() {
        return Err(BatchError::NoValidPairs { total: pairs.len() });
    }
    let parameters = derive_parameters(&ready, opts);
    let payloads: Vec<&[u8]> = ready.iter().map(|p| &p.container.facet_payload[..]).collect();

    let entries = map_tasks(&ready, |p| {
        let mesh = MeshSample::canonicalize(p.soup.triangles.iter().copied(), parameters.precision);
        let payload = &p.container.facet_payload;
        FacetSurveyEntry {
            container: p.paths.container.clone(),
            report:    facets::analyze_facets(
                payload,
                p.container.facet_count,
                marker_for(payload, parameters.marker),
                &mesh,
                &opts.facets,
            ),
        }
    });

    Ok(FacetSurvey {
        constant_header: facets::constant_header_positions(&payloads),
        skipped: pairs.len() - ready.len(),
        parameters,
        entries,
    })
}
