#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use dcmprobe::batch::PairPaths;
use dcmprobe::container::{write_container, ContainerRecord};
use dcmprobe::keys::apply_xor;
use dcmprobe::mesh::{MeshSample, Vertex};
use dcmprobe::stl::{encode_binary, Triangle};

pub const KEY_A: [u8; 8] = [0x3C, 0xA7, 0x19, 0x5E, 0xD2, 0x81, 0x6B, 0xF4];
pub const KEY_B: [u8; 8] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];

fn position(i: usize) -> Vertex {
    Vertex::new(i as f32 * 0.5, (i % 7) as f32 * 0.25, (i % 13) as f32)
}

/// A strip of `faces` triangles over `vertices` distinct positions; vertex
/// `i` first appears in face `i - 2`, so canonical order is `0..vertices`.
pub fn strip(vertices: usize, faces: usize) -> Vec<Triangle> {
    (0..faces)
        .map(|j| {
            [
                position(j % vertices),
                position((j + 1) % vertices),
                position((j + 2) % vertices),
            ]
        })
        .collect()
}

/// Facet bytes over an eleven-value alphabet: never a five-symbol stream.
pub fn noise_facets(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 11) as u8).collect()
}

pub fn container(mesh: &MeshSample, key: &[u8], fingerprint: &str, scan_source: &str) -> ContainerRecord {
    let mut properties = BTreeMap::new();
    properties.insert("ScanSource".to_string(), scan_source.to_string());
    ContainerRecord {
        source:         PathBuf::new(),
        format_version: "1.0".into(),
        signature_hash: fingerprint.into(),
        properties,
        schema:         Some("CE".into()),
        ce_version:     "1.0".into(),
        facet_count:    mesh.faces.len() as u32,
        facet_color:    Some(8_421_504),
        facet_payload:  noise_facets(3000),
        vertex_payload: apply_xor(&mesh.vertex_payload(), key),
    }
}

/// Write `<name>.dcm` and `<name>.stl` into `dir`.
pub fn write_pair(dir: &Path, name: &str, record: &ContainerRecord, triangles: &[Triangle]) -> PairPaths {
    let container = dir.join(format!("{name}.dcm"));
    let reference = dir.join(format!("{name}.stl"));
    std::fs::write(&container, write_container(record)).unwrap();
    std::fs::write(&reference, encode_binary(triangles, b"fixture")).unwrap();
    PairPaths::new(container, reference)
}
