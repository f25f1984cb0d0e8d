// Bounded-patch intersection: end caps on surfaces, flow sections in volumes
//
// Both cuts only look at cells fully inside a sphere around the landmark and
// reject crossings whose projection falls outside the patch rectangle, so a
// neighbouring branch crossing the infinite plane never leaks into the result.

use super::delaunay;
use crate::flux::CrossSection;
use crate::geometry::{BoundedPatch, Point3D, Triangle, Vector3D};
use crate::landmarks::LandmarkKey;
use crate::mesh::{PointKey, SurfaceMesh};
use crate::volume::VolumeMesh;
use crate::{Error, Result};
use std::collections::HashMap;

/// Triangulated end cap where the patch slices the vessel wall
pub fn surface_cap(
    surface: &SurfaceMesh,
    patch: &BoundedPatch,
    sphere_radius: f64,
    tolerance: f64,
) -> Result<SurfaceMesh> {
    let plane = patch.plane();
    let inside: Vec<bool> = surface
        .vertices
        .iter()
        .map(|v| (v - patch.center).norm() <= sphere_radius)
        .collect();

    // Loose crossing points, welded
    let mut points: Vec<Point3D> = Vec::new();
    let mut seen: HashMap<PointKey, usize> = HashMap::new();
    for (face_id, face) in surface.faces.iter().enumerate() {
        if !face.iter().all(|&v| inside[v]) {
            continue;
        }
        if let Some(segment) = surface.triangle(face_id).intersect_plane(&plane) {
            for p in [segment.start, segment.end] {
                if patch.contains_projection(&p, tolerance) {
                    seen.entry(PointKey::from_point(&p, tolerance)).or_insert_with(|| {
                        points.push(p);
                        points.len() - 1
                    });
                }
            }
        }
    }

    if points.len() < 3 {
        return Err(Error::geometry(
            "surface cap",
            format!("only {} crossing points inside the patch", points.len()),
        ));
    }

    let projected: Vec<(f64, f64)> = points.iter().map(|p| patch.project_2d(p)).collect();
    let triangles: Vec<Triangle> = delaunay::triangulate(&projected)
        .into_iter()
        .map(|[a, b, c]| oriented(Triangle::new(points[a], points[b], points[c]), &patch.normal))
        .collect();

    let cap = SurfaceMesh::from_triangles(&triangles, tolerance)
        .clean(tolerance)
        .largest_component();
    if cap.is_empty() {
        return Err(Error::geometry("surface cap", "triangulation produced no faces"));
    }

    log::debug!("  Cap: {} points, {} triangles", points.len(), cap.num_faces());
    Ok(cap)
}

/// Marching-tetrahedra section of a flow volume through a patch.
///
/// The flow field is interpolated linearly along every cut edge. `orientation`
/// is stored on the section for flux integration; faces are wound along the
/// patch normal.
pub fn volume_section(
    volume: &VolumeMesh,
    patch: &BoundedPatch,
    sphere_radius: f64,
    key: LandmarkKey,
    orientation: Vector3D,
    tolerance: f64,
) -> Result<CrossSection> {
    let mut builder = SectionBuilder::new(tolerance);

    for tet in &volume.tets {
        let v = &tet.vertices;
        if !v
            .iter()
            .all(|&i| (volume.vertices[i] - patch.center).norm() <= sphere_radius)
        {
            continue;
        }

        // Height above the patch plane at each vertex
        let s = v.map(|i| patch.local_coords(&volume.vertices[i]).2);

        // Classify vertices: above (true) or below (false) the patch
        let above = s.map(|x| x >= 0.0);
        let count_above = above.iter().filter(|&&a| a).count();

        let crossing = |a: usize, b: usize| {
            let t = if (s[b] - s[a]).abs() < 1e-300 {
                0.0
            } else {
                (s[a] / (s[a] - s[b])).clamp(0.0, 1.0)
            };
            let p = volume.vertices[v[a]] + t * (volume.vertices[v[b]] - volume.vertices[v[a]]);
            let f = volume.flow[v[a]] + t * (volume.flow[v[b]] - volume.flow[v[a]]);
            (p, f)
        };

        let polygon: Vec<(Point3D, Vector3D)> = match count_above {
            0 | 4 => continue,
            1 | 3 => {
                // Lone vertex on one side: triangle from its 3 edges
                let lone = above.iter().position(|&a| a == (count_above == 1)).unwrap_or(0);
                (0..4).filter(|&i| i != lone).map(|i| crossing(lone, i)).collect()
            }
            _ => {
                // Quad from the 4 above-to-below edges: [a0b0, a0b1, a1b0, a1b1]
                let ups: Vec<usize> = (0..4).filter(|&i| above[i]).collect();
                let downs: Vec<usize> = (0..4).filter(|&i| !above[i]).collect();
                let q: Vec<(Point3D, Vector3D)> = ups
                    .iter()
                    .flat_map(|&a| downs.iter().map(move |&b| (a, b)))
                    .map(|(a, b)| crossing(a, b))
                    .collect();
                // Connected as 0-1-3-2
                vec![q[0], q[1], q[3], q[2]]
            }
        };

        if polygon
            .iter()
            .any(|(p, _)| !patch.contains_projection(p, tolerance))
        {
            continue;
        }
        builder.add_polygon(&polygon, &patch.normal);
    }

    let (mesh, flow) = builder.largest_piece();
    if mesh.is_empty() {
        return Err(Error::geometry(
            format!("volume section {}", key),
            "patch does not intersect the volume inside the sphere",
        ));
    }

    log::debug!(
        "  Section {}: {} triangles, area {:.6}",
        key,
        mesh.num_faces(),
        mesh.area()
    );
    CrossSection::new(key, mesh, flow, orientation)
}

fn oriented(tri: Triangle, normal: &Vector3D) -> Triangle {
    let n = (tri.v1 - tri.v0).cross(&(tri.v2 - tri.v0));
    if n.dot(normal) < 0.0 {
        Triangle::new(tri.v0, tri.v2, tri.v1)
    } else {
        tri
    }
}

/// Welded section vertices carrying interpolated flow
struct SectionBuilder {
    tolerance: f64,
    lookup: HashMap<PointKey, usize>,
    vertices: Vec<Point3D>,
    flow: Vec<Vector3D>,
    faces: Vec<[usize; 3]>,
}

impl SectionBuilder {
    fn new(tolerance: f64) -> Self {
        Self {
            tolerance,
            lookup: HashMap::new(),
            vertices: Vec::new(),
            flow: Vec::new(),
            faces: Vec::new(),
        }
    }

    fn vertex(&mut self, point: Point3D, flow: Vector3D) -> usize {
        let vertices = &mut self.vertices;
        let flows = &mut self.flow;
        *self
            .lookup
            .entry(PointKey::from_point(&point, self.tolerance))
            .or_insert_with(|| {
                vertices.push(point);
                flows.push(flow);
                vertices.len() - 1
            })
    }

    /// Fan-triangulate a convex polygon, winding along `normal`
    fn add_polygon(&mut self, polygon: &[(Point3D, Vector3D)], normal: &Vector3D) {
        let ids: Vec<usize> = polygon.iter().map(|&(p, f)| self.vertex(p, f)).collect();
        for k in 1..ids.len().saturating_sub(1) {
            let mut face = [ids[0], ids[k], ids[k + 1]];
            if face[0] == face[1] || face[1] == face[2] || face[0] == face[2] {
                continue;
            }
            let tri = Triangle::new(self.vertices[face[0]], self.vertices[face[1]], self.vertices[face[2]]);
            if tri.area() <= self.tolerance * self.tolerance * 1e-3 {
                continue;
            }
            if (tri.v1 - tri.v0).cross(&(tri.v2 - tri.v0)).dot(normal) < 0.0 {
                face.swap(1, 2);
            }
            self.faces.push(face);
        }
    }

    /// Largest connected piece with its flow vectors carried along
    fn largest_piece(self) -> (SurfaceMesh, Vec<Vector3D>) {
        let mesh = SurfaceMesh {
            vertices: self.vertices,
            faces: self.faces,
        };
        let components = mesh.connected_components();
        let Some(component) = components.first() else {
            return (SurfaceMesh::default(), Vec::new());
        };

        // Same first-appearance order as SurfaceMesh::extract_faces
        let mut remap: HashMap<usize, usize> = HashMap::new();
        let mut flow = Vec::new();
        for &face_id in component {
            for &old in &mesh.faces[face_id] {
                remap.entry(old).or_insert_with(|| {
                    flow.push(self.flow[old]);
                    flow.len() - 1
                });
            }
        }
        (mesh.extract_faces(component), flow)
    }
}
