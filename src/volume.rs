// Tetrahedral flow volume
// Carries the per-vertex `flow` velocity field exported by the 4D flow scan.

use crate::geometry::{self, Plane, Point3D, Vector3D};
use crate::mesh::{MeshError, SurfaceMesh};
use nalgebra::Matrix4;
use std::collections::HashMap;

/// A single tetrahedron element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tetrahedron {
    /// Four vertex indices
    pub vertices: [usize; 4],
}

impl Tetrahedron {
    pub fn new(v0: usize, v1: usize, v2: usize, v3: usize) -> Self {
        Self {
            vertices: [v0, v1, v2, v3],
        }
    }

    /// Compute volume of tetrahedron
    pub fn volume(&self, positions: &[Point3D]) -> f64 {
        let [v0, v1, v2, v3] = self.vertices.map(|i| positions[i]);

        // Volume = |det([v1-v0, v2-v0, v3-v0])| / 6
        let det = (v1 - v0).dot(&(v2 - v0).cross(&(v3 - v0)));
        det.abs() / 6.0
    }

    pub fn centroid(&self, positions: &[Point3D]) -> Point3D {
        let sum: Vector3D = self.vertices.iter().map(|&i| positions[i].coords).sum();
        Point3D::from(sum / 4.0)
    }

    /// Faces paired with the vertex opposite to each
    pub fn faces_with_opposite(&self) -> [([usize; 3], usize); 4] {
        let v = self.vertices;
        [
            ([v[0], v[1], v[2]], v[3]),
            ([v[0], v[1], v[3]], v[2]),
            ([v[0], v[2], v[3]], v[1]),
            ([v[1], v[2], v[3]], v[0]),
        ]
    }
}

/// Tetrahedral volume with a per-vertex flow vector field
#[derive(Debug, Clone, Default)]
pub struct VolumeMesh {
    pub vertices: Vec<Point3D>,
    pub tets: Vec<Tetrahedron>,
    /// Velocity per vertex
    pub flow: Vec<Vector3D>,
}

impl VolumeMesh {
    pub fn new(
        vertices: Vec<Point3D>,
        tets: Vec<Tetrahedron>,
        flow: Vec<Vector3D>,
    ) -> Result<Self, MeshError> {
        if flow.len() != vertices.len() {
            return Err(MeshError::LoadError(format!(
                "flow field has {} vectors for {} vertices",
                flow.len(),
                vertices.len()
            )));
        }
        for (tet_idx, tet) in tets.iter().enumerate() {
            for &index in &tet.vertices {
                if index >= vertices.len() {
                    return Err(MeshError::IndexOutOfRange {
                        face: tet_idx,
                        index,
                        count: vertices.len(),
                    });
                }
            }
        }
        Ok(Self {
            vertices,
            tets,
            flow,
        })
    }

    /// Tetrahedralize a set of grid cells, six tets per cube along the
    /// main diagonal so neighbouring cubes share faces. Flow starts at zero.
    pub fn from_voxels(cells: &[[i64; 3]], cell_size: f64) -> Self {
        // Corner offsets in the order 0..8 of a unit cube
        const CORNERS: [[i64; 3]; 8] = [
            [0, 0, 0],
            [1, 0, 0],
            [1, 1, 0],
            [0, 1, 0],
            [0, 0, 1],
            [1, 0, 1],
            [1, 1, 1],
            [0, 1, 1],
        ];
        // Monotone paths from corner 0 to corner 6
        const PATHS: [[usize; 2]; 6] = [[1, 2], [1, 5], [4, 5], [4, 7], [3, 7], [3, 2]];

        let mut lookup: HashMap<[i64; 3], usize> = HashMap::new();
        let mut vertices = Vec::new();
        let mut tets = Vec::with_capacity(cells.len() * 6);

        for cell in cells {
            let ids = CORNERS.map(|offset| {
                let grid = [cell[0] + offset[0], cell[1] + offset[1], cell[2] + offset[2]];
                *lookup.entry(grid).or_insert_with(|| {
                    vertices.push(Point3D::new(
                        grid[0] as f64 * cell_size,
                        grid[1] as f64 * cell_size,
                        grid[2] as f64 * cell_size,
                    ));
                    vertices.len() - 1
                })
            });
            for [a, b] in PATHS {
                tets.push(Tetrahedron::new(ids[0], ids[a], ids[b], ids[6]));
            }
        }

        let flow = vec![Vector3D::zeros(); vertices.len()];
        Self {
            vertices,
            tets,
            flow,
        }
    }

    /// Replace the flow field by sampling `field` at every vertex
    pub fn with_flow_field<F>(mut self, field: F) -> Self
    where
        F: Fn(&Point3D) -> Vector3D,
    {
        self.flow = self.vertices.iter().map(field).collect();
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tets.is_empty()
    }

    pub fn num_tets(&self) -> usize {
        self.tets.len()
    }

    pub fn bounds(&self) -> Option<(Point3D, Point3D)> {
        geometry::bounds(&self.vertices)
    }

    pub fn center(&self) -> Option<Point3D> {
        geometry::bounds_center(&self.vertices)
    }

    pub fn total_volume(&self) -> f64 {
        self.tets.iter().map(|tet| tet.volume(&self.vertices)).sum()
    }

    /// Outer surface: faces owned by exactly one tetrahedron, wound outward
    pub fn boundary_surface(&self) -> SurfaceMesh {
        let mut face_owner: HashMap<[usize; 3], ([usize; 3], usize, usize)> = HashMap::new();

        for tet in &self.tets {
            for (face, opposite) in tet.faces_with_opposite() {
                let mut sorted_face = face;
                sorted_face.sort();
                face_owner
                    .entry(sorted_face)
                    .and_modify(|entry| entry.2 += 1)
                    .or_insert((face, opposite, 1));
            }
        }

        let mut boundary: Vec<([usize; 3], [usize; 3], usize)> = face_owner
            .into_iter()
            .filter(|(_, (_, _, count))| *count == 1)
            .map(|(key, (face, opposite, _))| (key, face, opposite))
            .collect();
        // HashMap order is not stable
        boundary.sort_by(|a, b| a.0.cmp(&b.0));

        let faces: Vec<[usize; 3]> = boundary
            .into_iter()
            .map(|(_, face, opposite)| {
                let [a, b, c] = face;
                let normal = (self.vertices[b] - self.vertices[a])
                    .cross(&(self.vertices[c] - self.vertices[a]));
                if normal.dot(&(self.vertices[opposite] - self.vertices[a])) > 0.0 {
                    [a, c, b]
                } else {
                    face
                }
            })
            .collect();

        SurfaceMesh {
            vertices: self.vertices.clone(),
            faces,
        }
        .compacted()
    }

    /// Move points by the full matrix, rotate flow by its rotation block only
    pub fn transformed(&self, matrix: &Matrix4<f64>) -> Self {
        let rotation = geometry::rotation_block(matrix);
        Self {
            vertices: self.vertices.iter().map(|p| matrix.transform_point(p)).collect(),
            tets: self.tets.clone(),
            flow: self.flow.iter().map(|f| rotation * f).collect(),
        }
    }

    /// Uniform scale of positions about the origin; flow is left untouched
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            vertices: self.vertices.iter().map(|p| Point3D::from(p.coords * factor)).collect(),
            tets: self.tets.clone(),
            flow: self.flow.clone(),
        }
    }

    /// Sub-volume made of the given tetrahedra, with compacted vertices
    pub fn extract_tets(&self, tet_ids: &[usize]) -> Self {
        let mut remap: HashMap<usize, usize> = HashMap::new();
        let mut vertices = Vec::new();
        let mut flow = Vec::new();
        let mut tets = Vec::with_capacity(tet_ids.len());

        for &tet_id in tet_ids {
            let mapped = self.tets[tet_id].vertices.map(|old| {
                *remap.entry(old).or_insert_with(|| {
                    vertices.push(self.vertices[old]);
                    flow.push(self.flow[old]);
                    vertices.len() - 1
                })
            });
            tets.push(Tetrahedron { vertices: mapped });
        }

        Self {
            vertices,
            tets,
            flow,
        }
    }

    /// Tetrahedra with all four vertices inside the sphere
    pub fn extract_in_sphere(&self, center: &Point3D, radius: f64) -> Self {
        let inside: Vec<bool> = self
            .vertices
            .iter()
            .map(|p| (p - center).norm() <= radius)
            .collect();
        let ids: Vec<usize> = self
            .tets
            .iter()
            .enumerate()
            .filter(|(_, tet)| tet.vertices.iter().all(|&v| inside[v]))
            .map(|(i, _)| i)
            .collect();
        self.extract_tets(&ids)
    }

    /// Split by centroid side: (positive side of the plane, negative side)
    pub fn split_by_plane(&self, plane: &Plane) -> (Self, Self) {
        let (positive, negative): (Vec<usize>, Vec<usize>) = (0..self.tets.len())
            .partition(|&i| plane.signed_distance(&self.tets[i].centroid(&self.vertices)) >= 0.0);
        (self.extract_tets(&positive), self.extract_tets(&negative))
    }

    /// Append another volume, offsetting its indices
    pub fn append(&mut self, other: &VolumeMesh) {
        let offset = self.vertices.len();
        self.vertices.extend_from_slice(&other.vertices);
        self.flow.extend_from_slice(&other.flow);
        self.tets.extend(other.tets.iter().map(|t| Tetrahedron {
            vertices: t.vertices.map(|v| v + offset),
        }));
    }
}
