//! Container decoding: apply a recovered key, try the facet replay, write the
//! result.
//!
//! A full STL is only written when the facet connectivity decoded and was
//! verified against a reference.  Otherwise the decrypted vertex payload is
//! written raw to `<output stem>_vertices.bin`.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::batch::marker_for;
use crate::container::ContainerRecord;
use crate::facets::{self, FacetDecodeResult};
use crate::keys::{apply_xor, recover_key, xor_bytes, KeyReport};
use crate::mesh::{derive_precision, MeshSample, Vertex, VERTEX_SIZE};
use crate::options::AnalysisOptions;
use crate::stl::{self, TriangleSoup};

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("key is empty")]
    EmptyKey,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct DecodedContainer {
    pub name:     String,
    pub vertices: Vec<Vertex>,
    /// Present only when the facet replay reproduced the reference.
    pub faces:    Option<Vec<[u32; 3]>>,
    /// Set when the key was derived from a reference mesh.
    pub key:      Option<KeyReport>,
}

impl DecodedContainer {
    pub fn vertex_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.vertices.len() * VERTEX_SIZE);
        for v in &self.vertices {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }
}

fn container_name(record: &ContainerRecord) -> String {
    record
        .source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Decrypt with a key read from a sidecar; the key cycles when shorter than
/// the payload.
pub fn decode_with_key(record: &ContainerRecord, key: &[u8]) -> Result<DecodedContainer, DecodeError> {
    if key.is_empty() {
        return Err(DecodeError::EmptyKey);
    }
    if key.len() < record.vertex_payload.len() && record.vertex_payload.len() % key.len() != 0 {
        warn!(key_len = key.len(), payload_len = record.vertex_payload.len(), "key does not tile the payload");
    }
    let plain = apply_xor(&record.vertex_payload, key);
    Ok(DecodedContainer {
        name:     container_name(record),
        vertices: MeshSample::vertices_from_payload(&plain),
        faces:    None,
        key:      None,
    })
}

/// Derive the key from a reference mesh of the same scan, then decrypt and
/// attempt the facet replay against that reference.
pub fn decode_with_reference(
    record:    &ContainerRecord,
    reference: &TriangleSoup,
    opts:      &AnalysisOptions,
) -> DecodedContainer {
    let expected = record.vertex_payload.len() / VERTEX_SIZE;
    let precision = opts.precision.unwrap_or_else(|| {
        derive_precision([(&reference.triangles[..], expected)], &opts.precision_candidates)
            .map_or_else(|| opts.fallback_precision(), |(p, _)| p)
    });
    let mesh = MeshSample::canonicalize(reference.triangles.iter().copied(), precision);
    let key = recover_key(
        &record.vertex_payload,
        &mesh.vertex_payload(),
        record.fingerprint_bytes().as_deref(),
        &opts.keys,
    );

    let transform = if key.is_confirmed() {
        key.hypothesis.clone()
    } else {
        warn!("no hypothesis confirmed; decrypting with the provisional full-length key");
        key.global_key()
    };
    let plain = match transform.decode(&record.vertex_payload) {
        Some(plain) => plain,
        None => {
            let covered = &record.vertex_payload[..key.compared_len.min(record.vertex_payload.len())];
            warn!(
                payload_len = record.vertex_payload.len(),
                compared_len = covered.len(),
                "key does not cover the vertex payload; decoding the compared prefix only"
            );
            xor_bytes(covered, &key.xor_key)
        }
    };

    let marker = opts.facets.marker.unwrap_or_else(|| {
        facets::discover_marker([(&record.facet_payload[..], reference.len())], &opts.facets)
            .map_or_else(|| marker_for(&record.facet_payload, None), |d| d.marker)
    });
    let faces = match facets::decode_facets(&record.facet_payload, record.facet_count, marker, &mesh, &opts.facets) {
        FacetDecodeResult::Decoded { faces, .. } => Some(faces),
        FacetDecodeResult::Unconfirmed(_) => None,
    };

    DecodedContainer {
        name: container_name(record),
        vertices: MeshSample::vertices_from_payload(&plain),
        faces,
        key: Some(key),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Written {
    Stl(PathBuf),
    RawVertices(PathBuf),
}

/// `<dir>/<stem>_vertices.bin` next to `output`.
pub fn raw_vertices_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".into());
    output.with_file_name(format!("{stem}_vertices.bin"))
}

pub fn write_decoded(decoded: &DecodedContainer, output: &Path, ascii: bool) -> io::Result<Written> {
    match &decoded.faces {
        Some(faces) => {
            let mesh = MeshSample { vertices: decoded.vertices.clone(), faces: faces.clone() };
            let mut w = BufWriter::new(File::create(output)?);
            if ascii {
                stl::write_ascii(&mesh, &decoded.name, &mut w)?;
            } else {
                stl::write_binary(&mesh, &decoded.name, &mut w)?;
            }
            w.flush()?;
            info!(path = %output.display(), faces = faces.len(), "STL written");
            Ok(Written::Stl(output.to_path_buf()))
        }
        None => {
            let path = raw_vertices_path(output);
            std::fs::write(&path, decoded.vertex_payload())?;
            info!(path = %path.display(), vertices = decoded.vertices.len(), "facets not decoded; raw vertices written");
            Ok(Written::RawVertices(path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record(vertex_payload: Vec<u8>) -> ContainerRecord {
        ContainerRecord {
            source:         PathBuf::from("/scans/jaw.dcm"),
            format_version: "1.0".into(),
            signature_hash: String::new(),
            properties:     BTreeMap::new(),
            schema:         None,
            ce_version:     "2.0".into(),
            facet_count:    0,
            facet_color:    None,
            facet_payload:  Vec::new(),
            vertex_payload,
        }
    }

    #[test]
    fn sidecar_key_cycles() {
        let v = [Vertex::new(1.0, 2.0, 3.0), Vertex::new(-4.5, 0.25, 8.0)];
        let plain: Vec<u8> = v.iter().flat_map(|v| v.to_le_bytes()).collect();
        let key = [0x5Au8, 0xA5, 0x0F, 0xF0];
        let decoded = decode_with_key(&record(apply_xor(&plain, &key)), &key).unwrap();
        assert_eq!(decoded.vertices, v.to_vec());
        assert_eq!(decoded.name, "jaw");
        assert!(matches!(decode_with_key(&record(plain), &[]), Err(DecodeError::EmptyKey)));
    }

    #[test]
    fn payload_longer_than_reference_decodes_compared_prefix() {
        let p = |i: usize| Vertex::new(i as f32, (i % 3) as f32 * 0.5, (i % 5) as f32);
        let triangles: Vec<stl::Triangle> = (0..20).map(|j| [p(j), p(j + 1), p(j + 2)]).collect();
        let mesh = MeshSample::canonicalize(triangles.iter().copied(), 6);
        let mut plain = mesh.vertex_payload();
        plain.extend_from_slice(&[0x7F; 2 * VERTEX_SIZE]);
        // Non-repeating key, so only the global XOR replays.
        let key: Vec<u8> = (0..plain.len() as u32).map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8).collect();

        let soup = TriangleSoup { variant: stl::StlVariant::Binary, name: String::new(), triangles };
        let opts = AnalysisOptions { precision: Some(6), ..AnalysisOptions::default() };
        let decoded = decode_with_reference(&record(xor_bytes(&plain, &key)), &soup, &opts);

        let report = decoded.key.as_ref().unwrap();
        assert_eq!(report.truncation.unwrap().compared_len, mesh.vertices.len() * VERTEX_SIZE);
        assert_eq!(decoded.vertices, mesh.vertices);
    }

    #[test]
    fn undecoded_facets_write_raw_vertices() {
        let dir = tempfile::tempdir().unwrap();
        let decoded = DecodedContainer {
            name:     "jaw".into(),
            vertices: vec![Vertex::new(1.0, 2.0, 3.0)],
            faces:    None,
            key:      None,
        };
        let out = dir.path().join("jaw.stl");
        let written = write_decoded(&decoded, &out, false).unwrap();
        let raw = dir.path().join("jaw_vertices.bin");
        assert_eq!(written, Written::RawVertices(raw.clone()));
        assert_eq!(std::fs::read(raw).unwrap().len(), 12);
        assert!(!out.exists());
    }

    #[test]
    fn decoded_faces_write_binary_stl() {
        let dir = tempfile::tempdir().unwrap();
        let decoded = DecodedContainer {
            name:     "jaw".into(),
            vertices: vec![Vertex::new(0.0, 0.0, 0.0), Vertex::new(1.0, 0.0, 0.0), Vertex::new(0.0, 1.0, 0.0)],
            faces:    Some(vec![[0, 1, 2]]),
            key:      None,
        };
        let out = dir.path().join("jaw.stl");
        assert_eq!(write_decoded(&decoded, &out, false).unwrap(), Written::Stl(out.clone()));
        let soup = stl::read_stl(&out).unwrap();
        assert_eq!(soup.len(), 1);
        assert_eq!(soup.triangles[0][1], Vertex::new(1.0, 0.0, 0.0));
    }
}
