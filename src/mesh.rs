//! Vertex canonicalization: triangle soup → unique vertices + index faces.
//!
//! Vertex identity is the coordinate triple rounded to a fixed number of
//! decimal digits.  The first occurrence of each identity fixes both its index
//! and the stored (unrounded) coordinates, and indices follow first-occurrence
//! order.  That order is what makes the reference vertex payload line up
//! byte-for-byte with the container's vertex payload.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::stl::Triangle;

/// Rounding precision observed on real scans.  Batches may derive another.
pub const DEFAULT_PRECISION: u32 = 6;
pub const VERTEX_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vertex {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vertex {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn to_le_bytes(self) -> [u8; VERTEX_SIZE] {
        let mut out = [0u8; VERTEX_SIZE];
        out[0..4].copy_from_slice(&self.x.to_le_bytes());
        out[4..8].copy_from_slice(&self.y.to_le_bytes());
        out[8..12].copy_from_slice(&self.z.to_le_bytes());
        out
    }

    pub fn from_le_bytes(b: &[u8; VERTEX_SIZE]) -> Self {
        Self::new(
            f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            f32::from_le_bytes([b[4], b[5], b[6], b[7]]),
            f32::from_le_bytes([b[8], b[9], b[10], b[11]]),
        )
    }
}

/// Equality key for a vertex at a given decimal precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexKey([i64; 3]);

impl VertexKey {
    pub fn new(v: Vertex, precision: u32) -> Self {
        let scale = 10f64.powi(precision as i32);
        Self([quantize(v.x, scale), quantize(v.y, scale), quantize(v.z, scale)])
    }
}

fn quantize(c: f32, scale: f64) -> i64 {
    let scaled = (c as f64 * scale).round();
    if scaled.is_finite() && scaled.abs() < i64::MAX as f64 {
        scaled as i64
    } else {
        // Non-finite or out-of-range coordinates only match bit-identical ones;
        // tag them into a range finite values cannot reach at sane precisions.
        i64::MIN + c.to_bits() as i64
    }
}

/// Unique vertices plus faces indexing into them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshSample {
    pub vertices: Vec<Vertex>,
    pub faces:    Vec<[u32; 3]>,
}

impl MeshSample {
    /// Deduplicate a triangle stream at `precision` decimal digits.
    pub fn canonicalize<I>(triangles: I, precision: u32) -> Self
    where
        I: IntoIterator<Item = Triangle>,
    {
        let mut index: HashMap<VertexKey, u32> = HashMap::new();
        let mut mesh = MeshSample::default();
        for tri in triangles {
            let mut face = [0u32; 3];
            for (slot, v) in face.iter_mut().zip(tri) {
                *slot = *index.entry(VertexKey::new(v, precision)).or_insert_with(|| {
                    mesh.vertices.push(v);
                    (mesh.vertices.len() - 1) as u32
                });
            }
            mesh.faces.push(face);
        }
        mesh
    }

    /// Expand faces back into a triangle stream.
    pub fn triangles(&self) -> impl Iterator<Item = Triangle> + '_ {
        self.faces.iter().map(move |f| {
            [
                self.vertex(f[0]),
                self.vertex(f[1]),
                self.vertex(f[2]),
            ]
        })
    }

    fn vertex(&self, i: u32) -> Vertex {
        self.vertices.get(i as usize).copied().unwrap_or_default()
    }

    /// Re-run canonicalization over this mesh's own triangle stream.
    pub fn recanonicalize(&self, precision: u32) -> Self {
        Self::canonicalize(self.triangles(), precision)
    }

    /// Vertices as packed little-endian `f32` triples, in index order.
    pub fn vertex_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.vertices.len() * VERTEX_SIZE);
        for v in &self.vertices {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Inverse of [`vertex_payload`](Self::vertex_payload); trailing bytes
    /// that do not fill a whole vertex are ignored.
    pub fn vertices_from_payload(payload: &[u8]) -> Vec<Vertex> {
        payload
            .chunks_exact(VERTEX_SIZE)
            .map(|c| {
                let mut b = [0u8; VERTEX_SIZE];
                b.copy_from_slice(c);
                Vertex::from_le_bytes(&b)
            })
            .collect()
    }

    /// Whether every face index refers to an existing vertex.
    pub fn is_consistent(&self) -> bool {
        let n = self.vertices.len() as u32;
        self.faces.iter().all(|f| f.iter().all(|&i| i < n))
    }
}

/// Pick the precision under which the most reference meshes reduce to
/// exactly the vertex count their container declares.
///
/// `pairs` yields `(triangles, expected_vertex_count)`.  Candidates are tried
/// in order; on a tie the earlier candidate wins, so list the preferred
/// precision first.  Returns `None` when no candidate matches any pair.
pub fn derive_precision<'a, I>(pairs: I, candidates: &[u32]) -> Option<(u32, usize)>
where
    I: IntoIterator<Item = (&'a [Triangle], usize)>,
{
    let pairs: Vec<(&[Triangle], usize)> = pairs.into_iter().collect();
    let mut best: Option<(u32, usize)> = None;
    for &p in candidates {
        let hits = pairs
            .iter()
            .filter(|(tris, expected)| unique_count(tris, p) == *expected)
            .count();
        if hits > 0 && best.map_or(true, |(_, h)| hits > h) {
            best = Some((p, hits));
        }
    }
    best
}

fn unique_count(triangles: &[Triangle], precision: u32) -> usize {
    let mut seen = std::collections::HashSet::new();
    for tri in triangles {
        for v in tri {
            seen.insert(VertexKey::new(*v, precision));
        }
    }
    seen.len()
}
