//! Cipher hypotheses, their replay, and the validation gate.
//!
//! A hypothesis is only worth anything once it has been replayed over the
//! *whole* container payload and reproduced the reference byte-for-byte.
//! [`KeyHypothesis::validate`] is that gate; nothing else in the crate may
//! mark a hypothesis confirmed.

use serde::{Deserialize, Serialize};

/// XOR `data` with `key`, cycling the key.  An empty key leaves data as is.
pub fn apply_xor(data: &[u8], key: &[u8]) -> Vec<u8> {
    if key.is_empty() {
        return data.to_vec();
    }
    data.iter()
        .zip(key.iter().cycle())
        .map(|(d, k)| d ^ k)
        .collect()
}

/// Byte-wise XOR over the shared prefix of `a` and `b`.
pub fn xor_bytes(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HypothesisKind {
    NoTransform,
    RepeatingXor,
    GlobalXor,
    RecordXor,
    SubstitutionTable,
    BlockConsistent,
}

impl HypothesisKind {
    pub fn name(self) -> &'static str {
        match self {
            HypothesisKind::NoTransform       => "no-transform",
            HypothesisKind::RepeatingXor      => "repeating-xor",
            HypothesisKind::GlobalXor         => "global-xor",
            HypothesisKind::RecordXor         => "record-xor",
            HypothesisKind::SubstitutionTable => "substitution",
            HypothesisKind::BlockConsistent   => "block-consistent",
        }
    }
}

/// One candidate explanation of container payload → reference payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeyHypothesis {
    /// Payloads are already identical.
    NoTransform,
    /// The full XOR difference is the key (one key byte per payload byte).
    GlobalXor {
        #[serde(with = "hex_bytes")]
        key: Vec<u8>,
    },
    /// The XOR difference repeats with this period.
    RepeatingXor {
        period: usize,
        #[serde(with = "hex_bytes")]
        key:    Vec<u8>,
    },
    /// Every fixed-size record (one vertex = 12 bytes) uses the same key.
    RecordXor {
        record_size: usize,
        #[serde(with = "hex_bytes")]
        key:         Vec<u8>,
    },
    /// Byte → byte map; entries never observed stay `None`.
    SubstitutionTable { table: Vec<Option<u8>> },
    /// Identical plaintext blocks always map to identical ciphertext blocks.
    /// Evidence only; there is nothing to replay.
    BlockConsistent {
        block_size:         usize,
        unique_block_count: usize,
    },
    Unconfirmed,
}

/// Outcome of replaying a hypothesis over the full payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Validation {
    ExactMatch,
    Mismatch {
        matching:       usize,
        total:          usize,
        first_mismatch: usize,
    },
    /// The hypothesis has no transform to replay.
    NotReplayable,
}

impl Validation {
    pub fn is_exact(&self) -> bool {
        matches!(self, Validation::ExactMatch)
    }
}

impl KeyHypothesis {
    pub fn kind(&self) -> Option<HypothesisKind> {
        Some(match self {
            KeyHypothesis::NoTransform              => HypothesisKind::NoTransform,
            KeyHypothesis::GlobalXor { .. }         => HypothesisKind::GlobalXor,
            KeyHypothesis::RepeatingXor { .. }      => HypothesisKind::RepeatingXor,
            KeyHypothesis::RecordXor { .. }         => HypothesisKind::RecordXor,
            KeyHypothesis::SubstitutionTable { .. } => HypothesisKind::SubstitutionTable,
            KeyHypothesis::BlockConsistent { .. }   => HypothesisKind::BlockConsistent,
            KeyHypothesis::Unconfirmed              => return None,
        })
    }

    /// Transform a container payload into the reference domain.
    ///
    /// `None` when the hypothesis carries no transform, or when a
    /// substitution table has no entry for some payload byte.
    pub fn decode(&self, payload: &[u8]) -> Option<Vec<u8>> {
        match self {
            KeyHypothesis::NoTransform => Some(payload.to_vec()),
            KeyHypothesis::GlobalXor { key } => {
                if key.len() < payload.len() {
                    return None;
                }
                Some(xor_bytes(payload, key))
            }
            KeyHypothesis::RepeatingXor { key, .. } | KeyHypothesis::RecordXor { key, .. } => {
                if key.is_empty() {
                    return None;
                }
                Some(apply_xor(payload, key))
            }
            KeyHypothesis::SubstitutionTable { table } => payload
                .iter()
                .map(|&b| table.get(b as usize).copied().flatten())
                .collect(),
            KeyHypothesis::BlockConsistent { .. } | KeyHypothesis::Unconfirmed => None,
        }
    }

    /// Replay over the full `payload` and compare against `reference`.
    /// Length differences count as mismatching bytes.
    pub fn validate(&self, payload: &[u8], reference: &[u8]) -> Validation {
        let decoded = match self.decode(payload) {
            Some(d) => d,
            None => return Validation::NotReplayable,
        };
        compare(&decoded, reference)
    }
}

/// Byte-exact comparison with match statistics.
pub fn compare(decoded: &[u8], reference: &[u8]) -> Validation {
    let total = decoded.len().max(reference.len());
    let matching = decoded.iter().zip(reference).filter(|(a, b)| a == b).count();
    if matching == total {
        return Validation::ExactMatch;
    }
    let first_mismatch = decoded
        .iter()
        .zip(reference)
        .position(|(a, b)| a != b)
        .unwrap_or_else(|| decoded.len().min(reference.len()));
    Validation::Mismatch { matching, total, first_mismatch }
}

/// Verdict attached to each hypothesis the engine tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// Full replay matched and no more specific hypothesis was confirmed.
    Confirmed,
    /// Replays exactly but says nothing about reuse until another file
    /// yields the same key.
    Provisional,
    /// Replays exactly, but a more specific hypothesis was confirmed first.
    Superseded,
    /// Consistency evidence without a replayable transform.
    Supporting,
    /// The candidate was derived but its replay did not reproduce the
    /// reference.
    ValidationMismatch { matching: usize, total: usize },
    /// The data contradicts the hypothesis at this byte offset.
    Contradicted { offset: usize },
    /// Not applicable to this payload (length, period range, ...).
    InsufficientEvidence,
}

impl Verdict {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Verdict::Confirmed)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
