// Uniform bin grid for nearest-point and radius queries over point clouds
//
// Used for ICP correspondences, for mapping skeleton coordinates back to
// point ids and for the kernel resampling between cross-sections.

use crate::geometry::{self, Point3D};

/// Coordinate → point id lookup
pub trait NearestPointQuery {
    /// Id of the closest point, or None for an empty set
    fn nearest(&self, point: &Point3D) -> Option<usize>;

    /// Ids of every point within `radius` of `point`
    fn within_radius(&self, point: &Point3D, radius: f64) -> Vec<usize>;
}

/// Spatial acceleration grid over a point set.
///
/// Divides the bounding box into a uniform 3D grid of cells; each cell stores
/// the indices of the points that fall into it.
#[derive(Debug, Clone)]
pub struct SpatialGrid {
    bounds_min: Point3D,
    dims: (usize, usize, usize),
    cell_size: (f64, f64, f64),
    /// cells[iz * (nx*ny) + iy * nx + ix] = list of point indices
    cells: Vec<Vec<usize>>,
}

impl SpatialGrid {
    /// Build a grid with roughly `target_cells` cells along the longest axis
    pub fn build(points: &[Point3D], target_cells: f64) -> Self {
        let (min, max) = geometry::bounds(points)
            .unwrap_or((Point3D::origin(), Point3D::origin()));
        let extent = max - min;
        let max_extent = extent.x.max(extent.y).max(extent.z).max(1e-10);
        let base_cell_size = max_extent / target_cells.max(1.0);

        // Per-axis dims (at least 1 cell)
        let nx = ((extent.x / base_cell_size).ceil() as usize).max(1);
        let ny = ((extent.y / base_cell_size).ceil() as usize).max(1);
        let nz = ((extent.z / base_cell_size).ceil() as usize).max(1);

        // Small padding keeps boundary points off the last cell edge
        let pad = max_extent * 0.001;
        let bounds_min = Point3D::new(min.x - pad, min.y - pad, min.z - pad);
        let cell_size = (
            (extent.x + 2.0 * pad) / nx as f64,
            (extent.y + 2.0 * pad) / ny as f64,
            (extent.z + 2.0 * pad) / nz as f64,
        );

        let mut grid = SpatialGrid {
            bounds_min,
            dims: (nx, ny, nz),
            cell_size,
            cells: vec![Vec::new(); nx * ny * nz],
        };

        for (pi, p) in points.iter().enumerate() {
            let (ix, iy, iz) = grid.cell_of(p);
            let idx = grid.flat_index(ix, iy, iz);
            grid.cells[idx].push(pi);
        }

        log::debug!(
            "SpatialGrid: {}x{}x{} = {} cells for {} points",
            nx,
            ny,
            nz,
            nx * ny * nz,
            points.len()
        );

        grid
    }

    fn cell_of(&self, p: &Point3D) -> (usize, usize, usize) {
        (
            cell_index_1d(p.x, self.bounds_min.x, self.cell_size.0, self.dims.0),
            cell_index_1d(p.y, self.bounds_min.y, self.cell_size.1, self.dims.1),
            cell_index_1d(p.z, self.bounds_min.z, self.cell_size.2, self.dims.2),
        )
    }

    fn flat_index(&self, ix: usize, iy: usize, iz: usize) -> usize {
        iz * (self.dims.0 * self.dims.1) + iy * self.dims.0 + ix
    }

    fn min_cell_size(&self) -> f64 {
        self.cell_size.0.min(self.cell_size.1).min(self.cell_size.2)
    }

    /// Visit every cell on the Chebyshev shell `ring` around a center cell
    fn for_each_in_ring<F: FnMut(&[usize])>(&self, center: (usize, usize, usize), ring: i64, mut f: F) {
        let (cx, cy, cz) = (center.0 as i64, center.1 as i64, center.2 as i64);
        for dz in -ring..=ring {
            for dy in -ring..=ring {
                for dx in -ring..=ring {
                    if dx.abs().max(dy.abs()).max(dz.abs()) != ring {
                        continue;
                    }
                    let (nix, niy, niz) = (cx + dx, cy + dy, cz + dz);
                    if nix < 0 || niy < 0 || niz < 0 {
                        continue;
                    }
                    let (nix, niy, niz) = (nix as usize, niy as usize, niz as usize);
                    if nix >= self.dims.0 || niy >= self.dims.1 || niz >= self.dims.2 {
                        continue;
                    }
                    f(&self.cells[self.flat_index(nix, niy, niz)]);
                }
            }
        }
    }

    /// Closest point id, searching shells outward until no closer point can exist
    pub fn nearest(&self, points: &[Point3D], query: &Point3D) -> Option<usize> {
        if points.is_empty() {
            return None;
        }
        let center = self.cell_of(query);
        let max_ring = self.dims.0.max(self.dims.1).max(self.dims.2) as i64;
        let mut best: Option<(usize, f64)> = None;

        for ring in 0..=max_ring {
            self.for_each_in_ring(center, ring, |cell| {
                for &pi in cell {
                    let d = (points[pi] - query).norm_squared();
                    // Ties go to the lowest id
                    let better = match best {
                        None => true,
                        Some((bi, bd)) => d < bd || (d == bd && pi < bi),
                    };
                    if better {
                        best = Some((pi, d));
                    }
                }
            });
            if let Some((_, d)) = best {
                let reach = ring as f64 * self.min_cell_size();
                if d.sqrt() <= reach {
                    break;
                }
            }
        }

        best.map(|(i, _)| i)
    }

    /// All point ids within `radius`, in ascending id order
    pub fn within_radius(&self, points: &[Point3D], query: &Point3D, radius: f64) -> Vec<usize> {
        let r = radius.max(0.0);
        let lo = self.cell_of(&Point3D::new(query.x - r, query.y - r, query.z - r));
        let hi = self.cell_of(&Point3D::new(query.x + r, query.y + r, query.z + r));
        let r2 = r * r;

        let mut found = Vec::new();
        for iz in lo.2..=hi.2 {
            for iy in lo.1..=hi.1 {
                for ix in lo.0..=hi.0 {
                    for &pi in &self.cells[self.flat_index(ix, iy, iz)] {
                        if (points[pi] - query).norm_squared() <= r2 {
                            found.push(pi);
                        }
                    }
                }
            }
        }
        found.sort_unstable();
        found
    }
}

/// Point set paired with its grid
#[derive(Debug, Clone)]
pub struct PointLocator {
    points: Vec<Point3D>,
    grid: SpatialGrid,
}

impl PointLocator {
    /// Uses ~15 cells along the longest axis
    pub fn new(points: Vec<Point3D>) -> Self {
        let grid = SpatialGrid::build(&points, 15.0);
        Self { points, grid }
    }

    pub fn points(&self) -> &[Point3D] {
        &self.points
    }
}

impl NearestPointQuery for PointLocator {
    fn nearest(&self, point: &Point3D) -> Option<usize> {
        self.grid.nearest(&self.points, point)
    }

    fn within_radius(&self, point: &Point3D, radius: f64) -> Vec<usize> {
        self.grid.within_radius(&self.points, point, radius)
    }
}

/// Compute 1D cell index for a coordinate value.
fn cell_index_1d(value: f64, min: f64, cell_size: f64, num_cells: usize) -> usize {
    if cell_size <= 0.0 || num_cells == 0 {
        return 0;
    }
    let idx = ((value - min) / cell_size).floor() as i64;
    idx.clamp(0, (num_cells - 1) as i64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lattice() -> Vec<Point3D> {
        let mut points = Vec::new();
        for i in 0..10 {
            for j in 0..10 {
                for k in 0..4 {
                    points.push(Point3D::new(i as f64, j as f64 * 0.5, k as f64 * 2.0));
                }
            }
        }
        points
    }

    fn brute_nearest(points: &[Point3D], q: &Point3D) -> usize {
        let mut best = 0;
        for (i, p) in points.iter().enumerate() {
            if (p - q).norm_squared() < (points[best] - q).norm_squared() {
                best = i;
            }
        }
        best
    }

    #[test]
    fn test_nearest_matches_brute_force() {
        let points = lattice();
        let locator = PointLocator::new(points.clone());

        for q in [
            Point3D::new(3.2, 1.1, 2.9),
            Point3D::new(-5.0, 20.0, 0.0),
            Point3D::new(9.4, 4.6, 7.1),
            Point3D::new(4.5, 2.3, -3.0),
        ] {
            let found = locator.nearest(&q).unwrap();
            let expected = brute_nearest(&points, &q);
            assert!(((points[found] - q).norm() - (points[expected] - q).norm()).abs() < 1e-12);
        }
    }

    #[test]
    fn test_within_radius() {
        let points = lattice();
        let locator = PointLocator::new(points.clone());
        let q = Point3D::new(5.0, 2.5, 2.0);

        let found = locator.within_radius(&q, 1.01);
        let expected: Vec<usize> = (0..points.len())
            .filter(|&i| (points[i] - q).norm() <= 1.01)
            .collect();
        assert_eq!(found, expected);
    }

    #[test]
    fn test_empty_locator() {
        let locator = PointLocator::new(Vec::new());
        assert!(locator.nearest(&Point3D::origin()).is_none());
        assert!(locator.within_radius(&Point3D::origin(), 1.0).is_empty());
    }
}
