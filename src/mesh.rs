use crate::geometry::{self, Point3D, Triangle, Vector3D};
use nalgebra::Matrix4;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("Failed to load mesh: {0}")]
    LoadError(String),

    #[error("Failed to write mesh: {0}")]
    WriteError(String),

    #[error("Face {face} references vertex {index} but the mesh has {count} vertices")]
    IndexOutOfRange { face: usize, index: usize, count: usize },

    #[error("Empty mesh")]
    EmptyMesh,
}

/// Indexed triangle surface (vessel wall, end caps, cross-sections)
#[derive(Debug, Clone, Default)]
pub struct SurfaceMesh {
    pub vertices: Vec<Point3D>,
    pub faces: Vec<[usize; 3]>,
}

impl SurfaceMesh {
    /// Create a mesh, checking that every face index is in range
    pub fn new(vertices: Vec<Point3D>, faces: Vec<[usize; 3]>) -> Result<Self, MeshError> {
        for (face_idx, face) in faces.iter().enumerate() {
            for &index in face {
                if index >= vertices.len() {
                    return Err(MeshError::IndexOutOfRange {
                        face: face_idx,
                        index,
                        count: vertices.len(),
                    });
                }
            }
        }
        Ok(Self { vertices, faces })
    }

    /// Build an indexed mesh from loose triangles, welding shared corners
    pub fn from_triangles(triangles: &[Triangle], tolerance: f64) -> Self {
        let mut vertices = Vec::new();
        let mut lookup: HashMap<PointKey, usize> = HashMap::new();
        let mut faces = Vec::with_capacity(triangles.len());

        for tri in triangles {
            let mut face = [0usize; 3];
            for (slot, vertex) in face.iter_mut().zip([tri.v0, tri.v1, tri.v2]) {
                *slot = *lookup
                    .entry(PointKey::from_point(&vertex, tolerance))
                    .or_insert_with(|| {
                        vertices.push(vertex);
                        vertices.len() - 1
                    });
            }
            if face[0] != face[1] && face[1] != face[2] && face[0] != face[2] {
                faces.push(face);
            }
        }

        Self { vertices, faces }
    }

    /// Load mesh from STL file
    pub fn from_stl<P: AsRef<Path>>(path: P) -> Result<Self, MeshError> {
        let mut file = std::fs::File::open(path)
            .map_err(|e| MeshError::LoadError(e.to_string()))?;

        let stl = stl_io::read_stl(&mut file)
            .map_err(|e| MeshError::LoadError(e.to_string()))?;

        // IndexedMesh already deduplicates vertices
        let vertices: Vec<Point3D> = stl
            .vertices
            .iter()
            .map(|v| Point3D::new(v[0] as f64, v[1] as f64, v[2] as f64))
            .collect();
        let faces: Vec<[usize; 3]> = stl.faces.iter().map(|f| f.vertices).collect();

        if faces.is_empty() {
            return Err(MeshError::EmptyMesh);
        }

        Self::new(vertices, faces)
    }

    /// Write mesh as binary STL
    pub fn write_stl<P: AsRef<Path>>(&self, path: P) -> Result<(), MeshError> {
        let mut file = std::fs::File::create(path)
            .map_err(|e| MeshError::WriteError(e.to_string()))?;
        let triangles: Vec<stl_io::Triangle> = self
            .triangles()
            .map(|tri| geometry::to_stl_triangle(&tri))
            .collect();
        stl_io::write_stl(&mut file, triangles.iter())
            .map_err(|e| MeshError::WriteError(e.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    pub fn num_faces(&self) -> usize {
        self.faces.len()
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn triangle(&self, face: usize) -> Triangle {
        let [a, b, c] = self.faces[face];
        Triangle::new(self.vertices[a], self.vertices[b], self.vertices[c])
    }

    pub fn triangles(&self) -> impl Iterator<Item = Triangle> + '_ {
        (0..self.faces.len()).map(move |f| self.triangle(f))
    }

    /// Axis-aligned bounds of the referenced vertices
    pub fn bounds(&self) -> Option<(Point3D, Point3D)> {
        geometry::bounds(&self.vertices)
    }

    /// Center of the bounding box
    pub fn center(&self) -> Option<Point3D> {
        geometry::bounds_center(&self.vertices)
    }

    /// Mean vertex position
    pub fn centroid(&self) -> Option<Point3D> {
        geometry::centroid(&self.vertices)
    }

    pub fn area(&self) -> f64 {
        self.triangles().map(|t| t.area()).sum()
    }

    /// Apply a homogeneous transform to every vertex
    pub fn transformed(&self, matrix: &Matrix4<f64>) -> Self {
        Self {
            vertices: self.vertices.iter().map(|p| matrix.transform_point(p)).collect(),
            faces: self.faces.clone(),
        }
    }

    /// Translate mesh by vector
    pub fn translate(&mut self, offset: Vector3D) {
        for v in &mut self.vertices {
            *v += offset;
        }
    }

    /// Scale uniformly about the origin
    pub fn scale(&mut self, factor: f64) {
        for v in &mut self.vertices {
            *v = Point3D::from(v.coords * factor);
        }
    }

    /// Append another mesh, offsetting its indices
    pub fn append(&mut self, other: &SurfaceMesh) {
        let offset = self.vertices.len();
        self.vertices.extend_from_slice(&other.vertices);
        self.faces.extend(
            other
                .faces
                .iter()
                .map(|f| [f[0] + offset, f[1] + offset, f[2] + offset]),
        );
    }

    /// Weld coincident vertices, drop degenerate faces and unused vertices
    pub fn clean(&self, tolerance: f64) -> Self {
        let mut vertices = Vec::new();
        let mut lookup: HashMap<PointKey, usize> = HashMap::new();
        let remap: Vec<usize> = self
            .vertices
            .iter()
            .map(|p| {
                *lookup
                    .entry(PointKey::from_point(p, tolerance))
                    .or_insert_with(|| {
                        vertices.push(*p);
                        vertices.len() - 1
                    })
            })
            .collect();

        let faces: Vec<[usize; 3]> = self
            .faces
            .iter()
            .map(|f| [remap[f[0]], remap[f[1]], remap[f[2]]])
            .filter(|f| f[0] != f[1] && f[1] != f[2] && f[0] != f[2])
            .filter(|f| {
                let tri = Triangle::new(vertices[f[0]], vertices[f[1]], vertices[f[2]]);
                tri.area() > tolerance * tolerance * 1e-3
            })
            .collect();

        Self { vertices, faces }.compacted()
    }

    /// Drop vertices that no face references
    pub fn compacted(&self) -> Self {
        let all: Vec<usize> = (0..self.faces.len()).collect();
        self.extract_faces(&all)
    }

    /// Sub-mesh made of the given faces, with compacted vertices
    pub fn extract_faces(&self, face_ids: &[usize]) -> Self {
        let mut remap: HashMap<usize, usize> = HashMap::new();
        let mut vertices = Vec::new();
        let mut faces = Vec::with_capacity(face_ids.len());

        for &face_id in face_ids {
            let mut face = [0usize; 3];
            for (slot, &old) in face.iter_mut().zip(self.faces[face_id].iter()) {
                *slot = *remap.entry(old).or_insert_with(|| {
                    vertices.push(self.vertices[old]);
                    vertices.len() - 1
                });
            }
            faces.push(face);
        }

        Self { vertices, faces }
    }

    /// Face-connected components (faces sharing a vertex), largest first
    pub fn connected_components(&self) -> Vec<Vec<usize>> {
        let mut sets = DisjointSet::new(self.vertices.len());
        for f in &self.faces {
            sets.union(f[0], f[1]);
            sets.union(f[1], f[2]);
        }

        let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
        for (face_id, f) in self.faces.iter().enumerate() {
            groups.entry(sets.find(f[0])).or_default().push(face_id);
        }

        let mut components: Vec<Vec<usize>> = groups.into_values().collect();
        // Stable ordering: size descending, then first face id
        components.sort_by(|a, b| b.len().cmp(&a.len()).then(a[0].cmp(&b[0])));
        components
    }

    /// Keep only the largest connected component
    pub fn largest_component(&self) -> Self {
        match self.connected_components().first() {
            Some(component) => self.extract_faces(component),
            None => Self::default(),
        }
    }

    /// Area-weighted vertex normals
    pub fn vertex_normals(&self) -> Vec<Vector3D> {
        let mut normals = vec![Vector3D::zeros(); self.vertices.len()];
        for (face_id, f) in self.faces.iter().enumerate() {
            let tri = self.triangle(face_id);
            let weighted = tri.normal() * tri.area();
            for &v in f {
                normals[v] += weighted;
            }
        }
        normals
            .into_iter()
            .map(|n| if n.norm() > 1e-14 { n.normalize() } else { Vector3D::z() })
            .collect()
    }
}

/// Discretized point key for hash map (handles floating point comparison)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PointKey {
    x: i64,
    y: i64,
    z: i64,
}

impl PointKey {
    pub(crate) fn from_point(point: &Point3D, tolerance: f64) -> Self {
        let scale = 1.0 / tolerance;
        Self {
            x: (point.x * scale).round() as i64,
            y: (point.y * scale).round() as i64,
            z: (point.z * scale).round() as i64,
        }
    }
}

/// Union-find over vertex ids
pub(crate) struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
        }
    }

    pub(crate) fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    pub(crate) fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[ra.max(rb)] = ra.min(rb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_square(offset: f64) -> Vec<Triangle> {
        let p = |x: f64, y: f64| Point3D::new(x + offset, y, 0.0);
        vec![
            Triangle::new(p(0.0, 0.0), p(1.0, 0.0), p(1.0, 1.0)),
            Triangle::new(p(0.0, 0.0), p(1.0, 1.0), p(0.0, 1.0)),
        ]
    }

    #[test]
    fn test_mesh_rejects_bad_index() {
        let result = SurfaceMesh::new(vec![Point3D::origin()], vec![[0, 1, 2]]);
        assert!(matches!(result, Err(MeshError::IndexOutOfRange { .. })));
    }

    #[test]
    fn test_from_triangles_welds_corners() {
        let mesh = SurfaceMesh::from_triangles(&unit_square(0.0), 1e-6);
        assert_eq!(mesh.num_vertices(), 4);
        assert_eq!(mesh.num_faces(), 2);
        assert!((mesh.area() - 1.0).abs() < 1e-10);
    }

    #[test]
    fn test_clean_drops_duplicates_and_degenerates() {
        let mut triangles = unit_square(0.0);
        triangles.push(Triangle::new(
            Point3D::new(0.0, 0.0, 0.0),
            Point3D::new(0.0, 0.0, 0.0),
            Point3D::new(1.0, 0.0, 0.0),
        ));
        // Unwelded input: every triangle carries its own vertices
        let mut mesh = SurfaceMesh::default();
        for tri in &triangles {
            let base = mesh.vertices.len();
            mesh.vertices.extend([tri.v0, tri.v1, tri.v2]);
            mesh.faces.push([base, base + 1, base + 2]);
        }

        let cleaned = mesh.clean(1e-6);
        assert_eq!(cleaned.num_faces(), 2);
        assert_eq!(cleaned.num_vertices(), 4);
    }

    #[test]
    fn test_largest_component() {
        let mut triangles = unit_square(0.0);
        triangles.extend(unit_square(5.0));
        triangles.push(Triangle::new(
            Point3D::new(5.0, 1.0, 0.0),
            Point3D::new(6.0, 1.0, 0.0),
            Point3D::new(5.5, 2.0, 0.0),
        ));
        let mesh = SurfaceMesh::from_triangles(&triangles, 1e-6);

        let components = mesh.connected_components();
        assert_eq!(components.len(), 2);
        assert_eq!(components[0].len(), 3);

        let largest = mesh.largest_component();
        assert_eq!(largest.num_faces(), 3);
        let (min, _) = largest.bounds().unwrap();
        assert!((min.x - 5.0).abs() < 1e-10);
    }

    #[test]
    fn test_append_and_transform() {
        let mut mesh = SurfaceMesh::from_triangles(&unit_square(0.0), 1e-6);
        let other = mesh.clone();
        mesh.append(&other);
        assert_eq!(mesh.num_faces(), 4);
        assert_eq!(mesh.faces[2][0], 4);

        let moved = mesh.transformed(&Matrix4::new_translation(&Vector3D::new(0.0, 0.0, 2.0)));
        let center = moved.center().unwrap();
        assert!((center.z - 2.0).abs() < 1e-10);
    }

    #[test]
    fn test_stl_round_trip() {
        let mesh = SurfaceMesh::from_triangles(&unit_square(0.0), 1e-6);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("square.stl");
        mesh.write_stl(&path).unwrap();

        let loaded = SurfaceMesh::from_stl(&path).unwrap();
        assert_eq!(loaded.num_faces(), 2);
        assert!((loaded.area() - 1.0).abs() < 1e-6);
    }
}
