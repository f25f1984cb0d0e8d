// Plane clipping of triangle surfaces

use crate::geometry::{Plane, Point3D, Triangle};
use crate::mesh::SurfaceMesh;

/// Part of a triangle on the non-negative side of the plane, fan-triangulated
pub fn clip_triangle(tri: &Triangle, plane: &Plane) -> Vec<Triangle> {
    let verts = [tri.v0, tri.v1, tri.v2];
    let d = verts.map(|v| plane.signed_distance(&v));

    if d.iter().all(|&x| x >= 0.0) {
        return vec![*tri];
    }
    if d.iter().all(|&x| x < 0.0) {
        return Vec::new();
    }

    // Sutherland-Hodgman against a single plane
    let mut polygon: Vec<Point3D> = Vec::with_capacity(4);
    for i in 0..3 {
        let j = (i + 1) % 3;
        if d[i] >= 0.0 {
            polygon.push(verts[i]);
        }
        if (d[i] >= 0.0) != (d[j] >= 0.0) {
            let t = d[i] / (d[i] - d[j]);
            polygon.push(verts[i] + t * (verts[j] - verts[i]));
        }
    }

    (1..polygon.len().saturating_sub(1))
        .map(|k| Triangle::new(polygon[0], polygon[k], polygon[k + 1]))
        .collect()
}

/// Clip a set of faces, keeping the side the plane normal points to
pub fn clip_faces(mesh: &SurfaceMesh, face_ids: &[usize], plane: &Plane) -> Vec<Triangle> {
    face_ids
        .iter()
        .flat_map(|&f| clip_triangle(&mesh.triangle(f), plane))
        .collect()
}

/// Exact split of a surface by an unbounded plane: (normal side, opposite side)
pub fn split_surface(mesh: &SurfaceMesh, plane: &Plane, tolerance: f64) -> (SurfaceMesh, SurfaceMesh) {
    let all: Vec<usize> = (0..mesh.num_faces()).collect();
    let flipped = Plane::new(plane.point, -plane.normal);

    let positive = clip_faces(mesh, &all, plane);
    let negative = clip_faces(mesh, &all, &flipped);

    (
        SurfaceMesh::from_triangles(&positive, tolerance).clean(tolerance),
        SurfaceMesh::from_triangles(&negative, tolerance).clean(tolerance),
    )
}

/// Clip only the faces touching a sphere, then repair connectivity.
///
/// Faces with any vertex inside the sphere are clipped against `plane`;
/// the rest are kept untouched. After welding, only the largest connected
/// component survives, which drops the severed vessel stub.
pub fn sphere_masked_clip(
    mesh: &SurfaceMesh,
    center: &Point3D,
    radius: f64,
    plane: &Plane,
    tolerance: f64,
) -> SurfaceMesh {
    let masked: Vec<bool> = mesh
        .vertices
        .iter()
        .map(|v| (v - center).norm() <= radius)
        .collect();

    let (touched, untouched): (Vec<usize>, Vec<usize>) =
        (0..mesh.num_faces()).partition(|&f| mesh.faces[f].iter().any(|&v| masked[v]));

    let mut triangles: Vec<Triangle> = untouched.iter().map(|&f| mesh.triangle(f)).collect();
    let clipped = clip_faces(mesh, &touched, plane);
    log::debug!(
        "  Sphere mask: {} faces touched, {} triangles after clip",
        touched.len(),
        clipped.len()
    );
    triangles.extend(clipped);

    SurfaceMesh::from_triangles(&triangles, tolerance)
        .clean(tolerance)
        .largest_component()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Vector3D;

    #[test]
    fn test_clip_triangle_cases() {
        let tri = Triangle::new(
            Point3D::new(0.0, 0.0, 0.0),
            Point3D::new(2.0, 0.0, 0.0),
            Point3D::new(0.0, 2.0, 0.0),
        );

        // Keep x >= 1: one vertex kept, small triangle of area 0.5
        let plane = Plane::new(Point3D::new(1.0, 0.0, 0.0), Vector3D::x());
        let kept = clip_triangle(&tri, &plane);
        assert_eq!(kept.len(), 1);
        assert!((kept[0].area() - 0.5).abs() < 1e-12);

        // Keep x <= 1: quad split into two triangles, area 1.5
        let flipped = Plane::new(Point3D::new(1.0, 0.0, 0.0), -Vector3D::x());
        let kept: f64 = clip_triangle(&tri, &flipped).iter().map(|t| t.area()).sum();
        assert!((kept - 1.5).abs() < 1e-12);

        // Entirely on the negative side
        let far = Plane::new(Point3D::new(5.0, 0.0, 0.0), Vector3D::x());
        assert!(clip_triangle(&tri, &far).is_empty());
    }

    #[test]
    fn test_split_preserves_area() {
        let triangles = vec![
            Triangle::new(Point3D::new(-1.0, 0.0, 0.0), Point3D::new(1.0, 0.0, 0.0), Point3D::new(1.0, 1.0, 0.0)),
            Triangle::new(Point3D::new(-1.0, 0.0, 0.0), Point3D::new(1.0, 1.0, 0.0), Point3D::new(-1.0, 1.0, 0.0)),
        ];
        let mesh = SurfaceMesh::from_triangles(&triangles, 1e-9);
        let plane = Plane::new(Point3D::new(0.3, 0.0, 0.0), Vector3D::x());

        let (right, left) = split_surface(&mesh, &plane, 1e-9);
        assert!((right.area() - 0.7).abs() < 1e-9);
        assert!((left.area() - 1.3).abs() < 1e-9);
        assert!(right.vertices.iter().all(|v| v.x >= 0.3 - 1e-9));
    }

    /// Octagonal tube along z from 0 to `length`, closed at both ends
    fn closed_tube(length: usize) -> SurfaceMesh {
        let ring = |z: f64| -> Vec<Point3D> {
            (0..8)
                .map(|k| {
                    let a = k as f64 * std::f64::consts::FRAC_PI_4;
                    Point3D::new(a.cos(), a.sin(), z)
                })
                .collect()
        };

        let mut triangles = Vec::new();
        for i in 0..length {
            let (lower, upper) = (ring(i as f64), ring(i as f64 + 1.0));
            for k in 0..8 {
                let n = (k + 1) % 8;
                triangles.push(Triangle::new(lower[k], lower[n], upper[n]));
                triangles.push(Triangle::new(lower[k], upper[n], upper[k]));
            }
        }
        for (z, center) in [(0.0, Point3D::origin()), (length as f64, Point3D::new(0.0, 0.0, length as f64))] {
            let rim = ring(z);
            for k in 0..8 {
                triangles.push(Triangle::new(center, rim[(k + 1) % 8], rim[k]));
            }
        }
        SurfaceMesh::from_triangles(&triangles, 1e-9)
    }

    #[test]
    fn test_sphere_masked_clip_drops_stub() {
        let tube = closed_tube(10);
        assert_eq!(tube.connected_components().len(), 1);

        // The sphere reaches rings 6 and 7 only, so rings 8 to 10 are left as a stub
        let center = Point3D::new(0.0, 0.0, 6.5);
        let plane = Plane::new(center, -Vector3D::z());
        let clipped = sphere_masked_clip(&tube, &center, 1.2, &plane, 1e-9);

        assert_eq!(clipped.connected_components().len(), 1);
        let (min, max) = clipped.bounds().unwrap();
        assert!(min.z.abs() < 1e-12);
        assert!((max.z - 6.5).abs() < 1e-9);
        assert!(clipped.vertices.iter().all(|v| v.z < 7.0));

        // Open at the cut: lateral wall up to 6.5 plus the bottom lid
        let side = 2.0 * (std::f64::consts::PI / 8.0).sin();
        let expected = 6.5 * 8.0 * side + 2.0 * std::f64::consts::SQRT_2;
        assert!((clipped.area() - expected).abs() < 1e-9, "area {}", clipped.area());
    }
}
