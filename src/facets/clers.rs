//! CLERS connectivity replay.
//!
//! Conventions (all decode attempts use the same ones):
//!
//! * the mesh starts with triangle `(0, 1, 2)`; its boundary loop is
//!   `[0, 1, 2]` and the gate is the edge `0 → 1`;
//! * for a gate `a → b`, every symbol emits the triangle `(b, a, v)`:
//!
//! | Symbol | `v` | Loop after | Next gate |
//! |--------|-----|------------|-----------|
//! | C | next unused vertex index, inserted between `a` and `b` | +1 | `v → b` |
//! | L | `prev(a)`, `a` is removed | −1 | `v → b` |
//! | R | `next(b)`, `b` is removed | −1 | `a → v` |
//! | E | the third loop vertex; the loop must hold exactly 3 | closed | next pending loop |
//! | S | loop vertex at distance `need(right branch)` from `a` | split | `v → b`, then `a → v` |
//!
//! A symbol stream follows `Branch := (C|L|R)* (E | S Branch Branch)`.  The
//! loop length a branch needs on entry is `need(E) = 3`,
//! `need(C·β) = need(β) − 1`, `need(L·β) = need(R·β) = need(β) + 1` and
//! `need(S·ρ·λ) = need(ρ) + need(λ) − 1`; a whole stream must need 3.
//! `L` directly after `C` would emit the `C` triangle again with flipped
//! winding, so the replay rejects it as a degenerate loop.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Symbol {
    C,
    L,
    R,
    S,
    E,
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = match self {
            Symbol::C => 'C',
            Symbol::L => 'L',
            Symbol::R => 'R',
            Symbol::S => 'S',
            Symbol::E => 'E',
        };
        write!(f, "{c}")
    }
}

/// Parse a string of `CLRSE` letters; anything else yields `None`.
pub fn parse_symbols(s: &str) -> Option<Vec<Symbol>> {
    s.chars()
        .map(|c| match c {
            'C' => Some(Symbol::C),
            'L' => Some(Symbol::L),
            'R' => Some(Symbol::R),
            'S' => Some(Symbol::S),
            'E' => Some(Symbol::E),
            _ => None,
        })
        .collect()
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClersError {
    #[error("empty symbol stream")]
    Empty,

    #[error("symbol {position} has no branch to continue")]
    UnexpectedEnd { position: usize },

    #[error("{count} branches left over after parsing the stream")]
    TrailingBranches { count: usize },

    #[error("stream needs an initial loop of {required} vertices, start triangle provides 3")]
    LoopMismatch { required: i64 },

    #[error("symbol {position} ({symbol}) applied to a loop of {len} vertices")]
    DegenerateLoop { position: usize, symbol: Symbol, len: usize },
}

/// Loop length each branch needs; `right_need[i]` is set for every `S` at `i`.
fn parse(symbols: &[Symbol]) -> Result<Vec<i64>, ClersError> {
    if symbols.is_empty() {
        return Err(ClersError::Empty);
    }
    let mut right_need = vec![0i64; symbols.len()];
    let mut stack: Vec<i64> = Vec::new();
    for (i, &sym) in symbols.iter().enumerate().rev() {
        let need = match sym {
            Symbol::E => 3,
            Symbol::C => stack.pop().ok_or(ClersError::UnexpectedEnd { position: i })? - 1,
            Symbol::L | Symbol::R => stack.pop().ok_or(ClersError::UnexpectedEnd { position: i })? + 1,
            Symbol::S => {
                let right = stack.pop().ok_or(ClersError::UnexpectedEnd { position: i })?;
                let left = stack.pop().ok_or(ClersError::UnexpectedEnd { position: i })?;
                right_need[i] = right;
                right + left - 1
            }
        };
        stack.push(need);
    }
    match stack.as_slice() {
        [3] => Ok(right_need),
        [required] => Err(ClersError::LoopMismatch { required: *required }),
        _ => Err(ClersError::TrailingBranches { count: stack.len() }),
    }
}

#[derive(Clone, Copy)]
struct Node {
    vertex: u32,
    prev:   usize,
    next:   usize,
}

/// Boundary loops as a node arena; a vertex may sit on several loops after a
/// split, so nodes, not vertices, carry the links.
struct Loops {
    nodes: Vec<Node>,
}

impl Loops {
    fn push(&mut self, vertex: u32, prev: usize, next: usize) -> usize {
        self.nodes.push(Node { vertex, prev, next });
        self.nodes.len() - 1
    }

    fn v(&self, n: usize) -> u32 {
        self.nodes[n].vertex
    }

    fn next(&self, n: usize) -> usize {
        self.nodes[n].next
    }

    fn prev(&self, n: usize) -> usize {
        self.nodes[n].prev
    }

    fn link(&mut self, a: usize, b: usize) {
        self.nodes[a].next = b;
        self.nodes[b].prev = a;
    }
}

/// Replay a symbol stream into faces.  Yields `1 + symbols.len()` faces over
/// `3 + #C` vertices.
pub fn decode(symbols: &[Symbol]) -> Result<Vec<[u32; 3]>, ClersError> {
    let right_need = parse(symbols)?;

    let mut loops = Loops { nodes: Vec::with_capacity(symbols.len() + 3) };
    for v in 0..3u32 {
        let n = v as usize;
        loops.push(v, (n + 2) % 3, (n + 1) % 3);
    }
    let mut faces = Vec::with_capacity(symbols.len() + 1);
    faces.push([0, 1, 2]);

    let mut next_vertex = 3u32;
    let mut gate = 0usize;
    let mut len = 3usize;
    let mut pending: Vec<(usize, usize)> = Vec::new();

    for (i, &sym) in symbols.iter().enumerate() {
        if len < 3 {
            return Err(ClersError::DegenerateLoop { position: i, symbol: sym, len });
        }
        let a = gate;
        let b = loops.next(a);
        match sym {
            Symbol::C => {
                let v = next_vertex;
                next_vertex += 1;
                faces.push([loops.v(b), loops.v(a), v]);
                let n = loops.push(v, a, b);
                loops.link(a, n);
                loops.link(n, b);
                gate = n;
                len += 1;
            }
            Symbol::L => {
                if i > 0 && symbols[i - 1] == Symbol::C {
                    return Err(ClersError::DegenerateLoop { position: i, symbol: sym, len });
                }
                let p = loops.prev(a);
                faces.push([loops.v(b), loops.v(a), loops.v(p)]);
                loops.link(p, b);
                gate = p;
                len -= 1;
            }
            Symbol::R => {
                let nb = loops.next(b);
                faces.push([loops.v(b), loops.v(a), loops.v(nb)]);
                loops.link(a, nb);
                len -= 1;
            }
            Symbol::E => {
                if len != 3 {
                    return Err(ClersError::DegenerateLoop { position: i, symbol: sym, len });
                }
                let c = loops.next(b);
                faces.push([loops.v(b), loops.v(a), loops.v(c)]);
                match pending.pop() {
                    Some((g, l)) => {
                        gate = g;
                        len = l;
                    }
                    None => len = 0,
                }
            }
            Symbol::S => {
                let k = usize::try_from(right_need[i]).unwrap_or(0);
                if k < 3 || k + 2 > len {
                    return Err(ClersError::DegenerateLoop { position: i, symbol: sym, len });
                }
                let mut w = a;
                for _ in 0..k {
                    w = loops.next(w);
                }
                faces.push([loops.v(b), loops.v(a), loops.v(w)]);
                // Right loop [w', b, .., prev(w)], left loop [a, w, .., prev(a)].
                let before_w = loops.prev(w);
                let w2 = loops.push(loops.v(w), before_w, b);
                loops.link(before_w, w2);
                loops.link(w2, b);
                loops.link(a, w);
                pending.push((a, len - k + 1));
                gate = w2;
                len = k;
            }
        }
    }
    Ok(faces)
}

/// Number of vertices a valid stream references.
pub fn vertex_count(symbols: &[Symbol]) -> usize {
    3 + symbols.iter().filter(|&&s| s == Symbol::C).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(s: &str) -> Result<Vec<[u32; 3]>, ClersError> {
        decode(&parse_symbols(s).unwrap())
    }

    #[test]
    fn tetrahedron() {
        let faces = run("CRE").unwrap();
        assert_eq!(faces, vec![[0, 1, 2], [1, 0, 3], [1, 3, 2], [2, 3, 0]]);
        assert_eq!(vertex_count(&parse_symbols("CRE").unwrap()), 4);
    }

    #[test]
    fn tetrahedron_is_closed_and_oriented() {
        let faces = run("CRE").unwrap();
        let mut edges = std::collections::HashMap::new();
        for f in &faces {
            for k in 0..3 {
                *edges.entry((f[k], f[(k + 1) % 3])).or_insert(0) += 1;
            }
        }
        for (&(a, b), &n) in &edges {
            assert_eq!(n, 1);
            assert_eq!(edges.get(&(b, a)), Some(&1));
        }
    }

    #[test]
    fn single_end_closes_start_triangle() {
        assert_eq!(run("E").unwrap(), vec![[0, 1, 2], [1, 0, 2]]);
    }

    #[test]
    fn split_processes_right_loop_first() {
        let faces = run("CCSEE").unwrap();
        assert_eq!(
            faces,
            vec![[0, 1, 2], [1, 0, 3], [1, 3, 4], [1, 4, 0], [1, 0, 2], [0, 4, 3]]
        );
    }

    #[test]
    fn left_turn_walks_back_along_loop() {
        let faces = run("CCRLE").unwrap();
        assert_eq!(
            faces,
            vec![[0, 1, 2], [1, 0, 3], [1, 3, 4], [1, 4, 2], [2, 4, 3], [2, 3, 0]]
        );
    }

    #[test]
    fn left_turn_after_new_vertex_is_degenerate() {
        // need(LE) = 4 and C grows the start loop to 4, yet L re-emits (1, 0, 3) reversed.
        assert_eq!(
            run("CLE"),
            Err(ClersError::DegenerateLoop { position: 1, symbol: Symbol::L, len: 4 })
        );
        assert!(matches!(run("CRCLE"), Err(ClersError::DegenerateLoop { position: 3, len: 4, .. })));
    }

    #[test]
    fn malformed_streams_are_rejected() {
        assert_eq!(run(""), Err(ClersError::Empty));
        assert_eq!(run("C"), Err(ClersError::UnexpectedEnd { position: 0 }));
        assert_eq!(run("EE"), Err(ClersError::TrailingBranches { count: 2 }));
        assert_eq!(run("CE"), Err(ClersError::LoopMismatch { required: 2 }));
        assert_eq!(run("RE"), Err(ClersError::LoopMismatch { required: 4 }));
        assert!(matches!(run("SEE"), Err(ClersError::LoopMismatch { required: 5 })));
    }

    #[test]
    fn symbol_letters() {
        assert_eq!(parse_symbols("CLRSE").unwrap().len(), 5);
        assert!(parse_symbols("CX").is_none());
        assert_eq!(Symbol::S.to_string(), "S");
    }
}
