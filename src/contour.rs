//! Closed planar contours of 2D boolean masks.
//!
//! Contours run along pixel edges: pixel (row, column) covers the square
//! between corners (column, row) and (column + 1, row + 1). Each boundary
//! edge is directed so the inside lies on its right in image coordinates
//! (row axis pointing down), which makes outer boundaries clockwise on screen
//! and hole boundaries counter-clockwise. Where two regions only touch at a
//! corner the trace turns right, keeping them separate (4-connectivity).

use ndarray::ArrayView2;
use std::collections::HashMap;

/// Pixel corner as (column, row).
pub type Corner = (usize, usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contour {
    /// Corner vertices without repeating the first one. Collinear vertices
    /// are removed.
    pub points: Vec<Corner>,
}

impl Contour {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Shoelace area in pixels, positive for outer boundaries and negative
    /// for holes.
    pub fn signed_area(&self) -> f64 {
        let n = self.points.len();
        let twice: i64 = (0..n)
            .map(|i| {
                let (x0, y0) = self.points[i];
                let (x1, y1) = self.points[(i + 1) % n];
                x0 as i64 * y1 as i64 - x1 as i64 * y0 as i64
            })
            .sum();
        twice as f64 / 2.0
    }

    /// Vertices as fractional (column, row) pixel-centre coordinates.
    pub fn centred_points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.points
            .iter()
            .map(|&(x, y)| (x as f64 - 0.5, y as f64 - 0.5))
    }
}

type Step = (isize, isize);

fn step(from: Corner, to: Corner) -> Step {
    (
        to.0 as isize - from.0 as isize,
        to.1 as isize - from.1 as isize,
    )
}

fn right_of((dx, dy): Step) -> Step {
    (-dy, dx)
}

/// Trace every boundary of `mask` (indexed row, column).
///
/// Contours are returned in the row-major order of their first boundary edge.
pub fn trace_contours(mask: ArrayView2<'_, bool>) -> Vec<Contour> {
    let (rows, columns) = mask.dim();
    let inside = |row: isize, column: isize| {
        row >= 0
            && column >= 0
            && (row as usize) < rows
            && (column as usize) < columns
            && mask[[row as usize, column as usize]]
    };

    let mut edges: Vec<(Corner, Corner)> = Vec::new();
    for ((row, column), &value) in mask.indexed_iter() {
        if !value {
            continue;
        }
        let (r, c) = (row as isize, column as isize);
        if !inside(r - 1, c) {
            edges.push(((column, row), (column + 1, row)));
        }
        if !inside(r, c + 1) {
            edges.push(((column + 1, row), (column + 1, row + 1)));
        }
        if !inside(r + 1, c) {
            edges.push(((column + 1, row + 1), (column, row + 1)));
        }
        if !inside(r, c - 1) {
            edges.push(((column, row + 1), (column, row)));
        }
    }

    let mut outgoing: HashMap<Corner, Vec<usize>> = HashMap::new();
    for (id, (from, _)) in edges.iter().enumerate() {
        outgoing.entry(*from).or_default().push(id);
    }

    let mut used = vec![false; edges.len()];
    let mut contours = Vec::new();
    for start in 0..edges.len() {
        if used[start] {
            continue;
        }
        used[start] = true;
        let mut vertices = vec![edges[start].0];
        let mut current = start;

        loop {
            let (from, to) = edges[current];
            let heading = step(from, to);
            let candidates = outgoing.get(&to).map(Vec::as_slice).unwrap_or_default();
            let next = match candidates {
                [only] => *only,
                _ => candidates
                    .iter()
                    .copied()
                    .find(|&id| step(edges[id].0, edges[id].1) == right_of(heading))
                    .or_else(|| candidates.first().copied())
                    .unwrap_or(start),
            };
            if next == start || used[next] {
                break;
            }
            used[next] = true;
            vertices.push(edges[next].0);
            current = next;
        }

        contours.push(Contour {
            points: drop_collinear(&vertices),
        });
    }

    contours
}

fn drop_collinear(vertices: &[Corner]) -> Vec<Corner> {
    let n = vertices.len();
    (0..n)
        .filter(|&i| {
            let previous = vertices[(i + n - 1) % n];
            let next = vertices[(i + 1) % n];
            step(previous, vertices[i]) != step(vertices[i], next)
        })
        .map(|i| vertices[i])
        .collect()
}
