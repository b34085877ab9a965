//! [`AnalysisOptions`]: every tunable of a batch run.
//!
//! Options load from a JSON document (missing fields take their defaults) and
//! the CLI overrides individual fields afterwards.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::facets::FacetOptions;
use crate::keys::KeyOptions;
use crate::mesh::DEFAULT_PRECISION;

#[derive(Error, Debug)]
pub enum OptionsError {
    #[error("cannot read options file {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },

    #[error("invalid options file {path}: {source}")]
    Json { path: PathBuf, source: serde_json::Error },
}

// ── AnalysisOptions ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisOptions {
    /// Fixed vertex rounding precision; derived per batch when unset.
    pub precision:            Option<u32>,
    /// Tried in order when deriving; earlier entries win ties.
    pub precision_candidates: Vec<u32>,
    pub keys:                 KeyOptions,
    pub facets:               FacetOptions,
    /// Process only the first N pairs of the work list.
    pub pair_limit:           Option<usize>,
    /// Write each pair's full XOR key as `<container>.key` here.
    pub key_dir:              Option<PathBuf>,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            precision:            None,
            precision_candidates: vec![DEFAULT_PRECISION, 5, 4, 7, 3],
            keys:                 KeyOptions::default(),
            facets:               FacetOptions::default(),
            pair_limit:           None,
            key_dir:              None,
        }
    }
}

impl AnalysisOptions {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn load(path: &Path) -> Result<Self, OptionsError> {
        let text = std::fs::read_to_string(path).map_err(|source| OptionsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text).map_err(|source| OptionsError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Precision used when neither a fixed value nor a derivation is available.
    pub fn fallback_precision(&self) -> u32 {
        self.precision
            .or_else(|| self.precision_candidates.first().copied())
            .unwrap_or(DEFAULT_PRECISION)
    }
}
