//! STL reader and writer (binary and ASCII).
//!
//! # Binary layout (little-endian)
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0      | 80   | header (arbitrary) |
//! | 80     | 4    | triangle count (u32) |
//! | 84     | 50×n | per triangle: normal 3×f32 (ignored), vertices 3×3×f32, attribute u16 (ignored) |
//!
//! # Variant detection
//! A file is ASCII when its first five bytes read `solid` (any case) *and*
//! the token `facet` occurs within the first kilobyte.  Binary files are free
//! to start their header with `solid`, so the prefix alone is not enough.

use std::io::{self, Cursor, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::mesh::{MeshSample, Vertex};

pub const HEADER_SIZE:   usize = 80;
pub const TRIANGLE_SIZE: usize = 50;
/// Window searched for the `facet` token during detection.
pub const DETECT_WINDOW: usize = 1024;

#[derive(Error, Debug)]
pub enum StlError {
    #[error("Unsupported STL variant: {0}")]
    UnsupportedVariant(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StlVariant {
    Ascii,
    Binary,
}

/// One triangle as stored in the file.
pub type Triangle = [Vertex; 3];

/// Raw, non-deduplicated triangle stream.
#[derive(Debug, Clone, PartialEq)]
pub struct TriangleSoup {
    pub variant:   StlVariant,
    pub name:      String,
    pub triangles: Vec<Triangle>,
}

impl TriangleSoup {
    pub fn len(&self) -> usize {
        self.triangles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }
}

// ── Reading ──────────────────────────────────────────────────────────────────

pub fn detect_variant(data: &[u8]) -> StlVariant {
    let starts_solid = data.len() >= 5 && data[..5].eq_ignore_ascii_case(b"solid");
    let window = &data[..data.len().min(DETECT_WINDOW)];
    if starts_solid && window.windows(5).any(|w| w == b"facet") {
        StlVariant::Ascii
    } else {
        StlVariant::Binary
    }
}

pub fn read_stl(path: &Path) -> Result<TriangleSoup, StlError> {
    let data = std::fs::read(path)?;
    parse_stl(&data)
}

pub fn parse_stl(data: &[u8]) -> Result<TriangleSoup, StlError> {
    match detect_variant(data) {
        StlVariant::Ascii => parse_ascii(data),
        StlVariant::Binary => parse_binary(data),
    }
}

pub fn parse_binary(data: &[u8]) -> Result<TriangleSoup, StlError> {
    if data.len() < HEADER_SIZE + 4 {
        return Err(StlError::UnsupportedVariant(format!(
            "{} bytes is shorter than a binary STL header",
            data.len()
        )));
    }
    let mut cur = Cursor::new(data);
    cur.set_position(HEADER_SIZE as u64);
    let count = cur.read_u32::<LittleEndian>()? as usize;
    let needed = count
        .checked_mul(TRIANGLE_SIZE)
        .and_then(|n| n.checked_add(HEADER_SIZE + 4))
        .ok_or_else(|| StlError::UnsupportedVariant(format!("triangle count {count} overflows")))?;
    if data.len() < needed {
        return Err(StlError::UnsupportedVariant(format!(
            "declares {count} triangles ({needed} bytes) but file has {} bytes",
            data.len()
        )));
    }

    let mut triangles = Vec::with_capacity(count);
    for _ in 0..count {
        for _ in 0..3 {
            cur.read_f32::<LittleEndian>()?;
        }
        let mut tri = [Vertex::default(); 3];
        for v in tri.iter_mut() {
            *v = Vertex::new(
                cur.read_f32::<LittleEndian>()?,
                cur.read_f32::<LittleEndian>()?,
                cur.read_f32::<LittleEndian>()?,
            );
        }
        cur.read_u16::<LittleEndian>()?;
        triangles.push(tri);
    }

    let name = String::from_utf8_lossy(&data[..HEADER_SIZE])
        .trim_end_matches('\0')
        .trim()
        .to_string();
    Ok(TriangleSoup { variant: StlVariant::Binary, name, triangles })
}

/// Whitespace-token parser for `facet normal … outer loop vertex ×3 endloop
/// endfacet` blocks.  Keywords match case-insensitively, numbers may use
/// exponent notation, and anything between facets is skipped.
pub fn parse_ascii(data: &[u8]) -> Result<TriangleSoup, StlError> {
    let text = String::from_utf8_lossy(data);
    let mut tokens = text.split_ascii_whitespace().peekable();

    let mut name = String::new();
    if let Some(first) = tokens.peek() {
        if first.eq_ignore_ascii_case("solid") {
            tokens.next();
            if let Some(n) = tokens.peek() {
                if !n.eq_ignore_ascii_case("facet") {
                    name = n.to_string();
                }
            }
        }
    }

    let mut triangles = Vec::new();
    let mut current: Option<Vec<Vertex>> = None;
    while let Some(tok) = tokens.next() {
        if tok.eq_ignore_ascii_case("facet") {
            if current.is_some() {
                return Err(ascii_error(triangles.len(), "facet opened before endfacet"));
            }
            current = Some(Vec::with_capacity(3));
        } else if tok.eq_ignore_ascii_case("vertex") {
            let facet = current
                .as_mut()
                .ok_or_else(|| ascii_error(triangles.len(), "vertex outside facet"))?;
            let mut xyz = [0f32; 3];
            for c in xyz.iter_mut() {
                let raw = tokens
                    .next()
                    .ok_or_else(|| ascii_error(triangles.len(), "truncated vertex"))?;
                *c = raw
                    .parse::<f32>()
                    .map_err(|_| ascii_error(triangles.len(), &format!("bad coordinate {raw:?}")))?;
            }
            facet.push(Vertex::new(xyz[0], xyz[1], xyz[2]));
        } else if tok.eq_ignore_ascii_case("endfacet") {
            let facet = current
                .take()
                .ok_or_else(|| ascii_error(triangles.len(), "endfacet without facet"))?;
            if facet.len() != 3 {
                return Err(ascii_error(
                    triangles.len(),
                    &format!("facet has {} vertices", facet.len()),
                ));
            }
            triangles.push([facet[0], facet[1], facet[2]]);
        }
    }
    if current.is_some() {
        return Err(ascii_error(triangles.len(), "unterminated facet"));
    }
    if triangles.is_empty() {
        return Err(StlError::UnsupportedVariant("ASCII STL without facets".into()));
    }
    Ok(TriangleSoup { variant: StlVariant::Ascii, name, triangles })
}

fn ascii_error(facet: usize, what: &str) -> StlError {
    StlError::UnsupportedVariant(format!("ASCII facet {facet}: {what}"))
}

// ── Writing ──────────────────────────────────────────────────────────────────

/// Unit normal of a triangle by the right-hand rule; zero for degenerate ones.
pub fn face_normal(tri: &Triangle) -> Vertex {
    let u = [tri[1].x - tri[0].x, tri[1].y - tri[0].y, tri[1].z - tri[0].z];
    let v = [tri[2].x - tri[0].x, tri[2].y - tri[0].y, tri[2].z - tri[0].z];
    let n = [
        u[1] * v[2] - u[2] * v[1],
        u[2] * v[0] - u[0] * v[2],
        u[0] * v[1] - u[1] * v[0],
    ];
    let len = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
    if len > 0.0 && len.is_finite() {
        Vertex::new(n[0] / len, n[1] / len, n[2] / len)
    } else {
        Vertex::default()
    }
}

pub fn write_binary<W: Write>(mesh: &MeshSample, name: &str, mut w: W) -> io::Result<()> {
    let mut header = [0u8; HEADER_SIZE];
    let label = format!("dcmprobe {name}");
    let n = label.len().min(HEADER_SIZE);
    header[..n].copy_from_slice(&label.as_bytes()[..n]);
    w.write_all(&header)?;
    w.write_u32::<LittleEndian>(mesh.faces.len() as u32)?;
    for tri in mesh.triangles() {
        let normal = face_normal(&tri);
        for v in std::iter::once(normal).chain(tri) {
            w.write_f32::<LittleEndian>(v.x)?;
            w.write_f32::<LittleEndian>(v.y)?;
            w.write_f32::<LittleEndian>(v.z)?;
        }
        w.write_u16::<LittleEndian>(0)?;
    }
    Ok(())
}

pub fn write_ascii<W: Write>(mesh: &MeshSample, name: &str, mut w: W) -> io::Result<()> {
    writeln!(w, "solid {name}")?;
    for tri in mesh.triangles() {
        let n = face_normal(&tri);
        writeln!(w, "  facet normal {:e} {:e} {:e}", n.x, n.y, n.z)?;
        writeln!(w, "    outer loop")?;
        for v in tri {
            writeln!(w, "      vertex {:e} {:e} {:e}", v.x, v.y, v.z)?;
        }
        writeln!(w, "    endloop")?;
        writeln!(w, "  endfacet")?;
    }
    writeln!(w, "endsolid {name}")?;
    Ok(())
}

/// Encode raw triangles as a binary STL (zero normals).  Mostly for fixtures.
pub fn encode_binary(triangles: &[Triangle], header: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; HEADER_SIZE];
    let n = header.len().min(HEADER_SIZE);
    out[..n].copy_from_slice(&header[..n]);
    out.extend_from_slice(&(triangles.len() as u32).to_le_bytes());
    for tri in triangles {
        out.extend_from_slice(&[0u8; 12]);
        for v in tri {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&[0u8; 2]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(x: f32, y: f32, z: f32) -> Vertex {
        Vertex::new(x, y, z)
    }

    #[test]
    fn binary_header_starting_with_solid_stays_binary() {
        let tri = [v(0.0, 0.0, 0.0), v(1.0, 0.0, 0.0), v(0.0, 1.0, 0.0)];
        let data = encode_binary(&[tri], b"solid but binary");
        assert_eq!(detect_variant(&data), StlVariant::Binary);
        let soup = parse_stl(&data).unwrap();
        assert_eq!(soup.variant, StlVariant::Binary);
        assert_eq!(soup.triangles, vec![tri]);
        assert_eq!(soup.name, "solid but binary");
    }

    #[test]
    fn truncated_binary_is_unsupported() {
        let tri = [v(0.0, 0.0, 0.0), v(1.0, 0.0, 0.0), v(0.0, 1.0, 0.0)];
        let mut data = encode_binary(&[tri, tri], b"x");
        data.truncate(data.len() - 10);
        assert!(matches!(parse_stl(&data), Err(StlError::UnsupportedVariant(_))));
        assert!(matches!(parse_stl(b"tiny"), Err(StlError::UnsupportedVariant(_))));
    }

    #[test]
    fn ascii_with_exponents_and_mixed_case() {
        let text = "SOLID part\n facet NORMAL 0 0 1\n OUTER LOOP\n \
                    VERTEX 1.5e0 -2E-1 +3\n vertex 0 0 0\n vertex 1e3 2.5 -0.0\n \
                    ENDLOOP\n ENDFACET\nendsolid part\n";
        let soup = parse_stl(text.as_bytes()).unwrap();
        assert_eq!(soup.variant, StlVariant::Ascii);
        assert_eq!(soup.name, "part");
        assert_eq!(soup.triangles.len(), 1);
        assert_eq!(soup.triangles[0][0], v(1.5, -0.2, 3.0));
        assert_eq!(soup.triangles[0][2], v(1000.0, 2.5, -0.0));
    }

    #[test]
    fn ascii_facet_with_two_vertices_is_rejected() {
        let text = "solid s\nfacet normal 0 0 1\nouter loop\nvertex 0 0 0\nvertex 1 0 0\nendloop\nendfacet\nendsolid s\n";
        assert!(matches!(parse_stl(text.as_bytes()), Err(StlError::UnsupportedVariant(_))));
    }

    #[test]
    fn normal_is_unit_length() {
        let n = face_normal(&[v(0.0, 0.0, 0.0), v(2.0, 0.0, 0.0), v(0.0, 2.0, 0.0)]);
        assert_eq!(n, v(0.0, 0.0, 1.0));
        let d = face_normal(&[v(1.0, 1.0, 1.0); 3]);
        assert_eq!(d, Vertex::default());
    }
}
