// 2D Delaunay triangulation (Bowyer-Watson)
//
// Triangulates the loose intersection curve of a vessel wall with a bounded
// patch, in patch coordinates, to close the branch end.

use std::collections::HashMap;

/// Triangle as indices into the input point list, counter-clockwise
pub type TriangleIndices = [usize; 3];

#[derive(Debug, Clone, Copy)]
struct Circumcircle {
    cx: f64,
    cy: f64,
    radius_sq: f64,
}

fn circumcircle(a: (f64, f64), b: (f64, f64), c: (f64, f64)) -> Option<Circumcircle> {
    let d = 2.0 * (a.0 * (b.1 - c.1) + b.0 * (c.1 - a.1) + c.0 * (a.1 - b.1));
    if d.abs() < 1e-300 {
        return None;
    }
    let a2 = a.0 * a.0 + a.1 * a.1;
    let b2 = b.0 * b.0 + b.1 * b.1;
    let c2 = c.0 * c.0 + c.1 * c.1;
    let cx = (a2 * (b.1 - c.1) + b2 * (c.1 - a.1) + c2 * (a.1 - b.1)) / d;
    let cy = (a2 * (c.0 - b.0) + b2 * (a.0 - c.0) + c2 * (b.0 - a.0)) / d;
    let radius_sq = (a.0 - cx).powi(2) + (a.1 - cy).powi(2);
    Some(Circumcircle { cx, cy, radius_sq })
}

fn orientation(a: (f64, f64), b: (f64, f64), c: (f64, f64)) -> f64 {
    (b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0)
}

/// Delaunay triangulation of the convex hull of `points`.
///
/// Points are expected to be deduplicated. Fewer than three points, or all
/// points colinear, yield an empty triangulation.
pub fn triangulate(points: &[(f64, f64)]) -> Vec<TriangleIndices> {
    let n = points.len();
    if n < 3 {
        return Vec::new();
    }

    // Super triangle enclosing every point
    let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
    let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
    for &(x, y) in points {
        min_x = min_x.min(x);
        min_y = min_y.min(y);
        max_x = max_x.max(x);
        max_y = max_y.max(y);
    }
    let span = (max_x - min_x).max(max_y - min_y).max(1e-12);
    let mid_x = (min_x + max_x) / 2.0;
    let mid_y = (min_y + max_y) / 2.0;

    let mut all: Vec<(f64, f64)> = points.to_vec();
    all.push((mid_x - 1000.0 * span, mid_y - span));
    all.push((mid_x, mid_y + 1000.0 * span));
    all.push((mid_x + 1000.0 * span, mid_y - span));

    let mut triangles: Vec<(TriangleIndices, Circumcircle)> = Vec::new();
    let super_tri = [n, n + 1, n + 2];
    if let Some(circle) = circumcircle(all[n], all[n + 1], all[n + 2]) {
        triangles.push((super_tri, circle));
    }

    for (pi, &p) in points.iter().enumerate() {
        // Triangles whose circumcircle contains the new point
        let mut bad = Vec::new();
        for (ti, (_, circle)) in triangles.iter().enumerate() {
            let d2 = (p.0 - circle.cx).powi(2) + (p.1 - circle.cy).powi(2);
            if d2 < circle.radius_sq * (1.0 + 1e-12) {
                bad.push(ti);
            }
        }

        // Cavity boundary: edges owned by exactly one bad triangle
        let mut edge_count: HashMap<(usize, usize), (usize, usize, usize)> = HashMap::new();
        for &ti in &bad {
            let [a, b, c] = triangles[ti].0;
            for (u, v) in [(a, b), (b, c), (c, a)] {
                let key = (u.min(v), u.max(v));
                edge_count
                    .entry(key)
                    .and_modify(|e| e.2 += 1)
                    .or_insert((u, v, 1));
            }
        }
        let mut boundary: Vec<(usize, usize)> = edge_count
            .values()
            .filter(|(_, _, count)| *count == 1)
            .map(|&(u, v, _)| (u, v))
            .collect();
        boundary.sort_unstable();

        // Remove bad triangles, highest index first
        for &ti in bad.iter().rev() {
            triangles.swap_remove(ti);
        }

        for (u, v) in boundary {
            let mut tri = [u, v, pi];
            if orientation(all[tri[0]], all[tri[1]], all[tri[2]]) < 0.0 {
                tri.swap(0, 1);
            }
            if let Some(circle) = circumcircle(all[tri[0]], all[tri[1]], all[tri[2]]) {
                triangles.push((tri, circle));
            }
        }
    }

    let mut result: Vec<TriangleIndices> = triangles
        .into_iter()
        .map(|(tri, _)| tri)
        .filter(|tri| tri.iter().all(|&v| v < n))
        .filter(|tri| orientation(points[tri[0]], points[tri[1]], points[tri[2]]).abs() > 1e-18)
        .collect();
    result.sort_unstable();
    result
}
