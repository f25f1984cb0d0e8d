use nalgebra::{Matrix3, Matrix4, Point3, Vector3};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 3D point type
pub type Point3D = Point3<f64>;

/// 3D vector type
pub type Vector3D = Vector3<f64>;

/// Coordinate axis, used wherever a policy picks "the elevation axis" or
/// "the lateral axis" instead of a hardcoded component index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    /// Component of a point along this axis
    pub fn component(&self, point: &Point3D) -> f64 {
        match self {
            Axis::X => point.x,
            Axis::Y => point.y,
            Axis::Z => point.z,
        }
    }

    /// Unit vector along this axis
    pub fn unit(&self) -> Vector3D {
        match self {
            Axis::X => Vector3D::x(),
            Axis::Y => Vector3D::y(),
            Axis::Z => Vector3D::z(),
        }
    }
}

/// Triangle defined by three vertices
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Triangle {
    pub v0: Point3D,
    pub v1: Point3D,
    pub v2: Point3D,
}

impl Triangle {
    pub fn new(v0: Point3D, v1: Point3D, v2: Point3D) -> Self {
        Self { v0, v1, v2 }
    }

    /// Calculate the normal vector of the triangle
    /// Returns a unit normal, or (0, 0, 1) for degenerate triangles
    pub fn normal(&self) -> Vector3D {
        let edge1 = self.v1 - self.v0;
        let edge2 = self.v2 - self.v0;
        let cross = edge1.cross(&edge2);
        let norm = cross.norm();

        // Handle degenerate triangles (zero area or nearly colinear)
        if norm < 1e-14 || !norm.is_finite() {
            return Vector3D::new(0.0, 0.0, 1.0);
        }

        cross / norm
    }

    /// Calculate the area of the triangle
    pub fn area(&self) -> f64 {
        let edge1 = self.v1 - self.v0;
        let edge2 = self.v2 - self.v0;
        edge1.cross(&edge2).norm() / 2.0
    }

    pub fn centroid(&self) -> Point3D {
        Point3D::from((self.v0.coords + self.v1.coords + self.v2.coords) / 3.0)
    }

    /// Intersect triangle with an arbitrary plane
    /// Returns None if no intersection, or Some(line segment)
    pub fn intersect_plane(&self, plane: &Plane) -> Option<LineSegment> {
        let d = [
            plane.signed_distance(&self.v0),
            plane.signed_distance(&self.v1),
            plane.signed_distance(&self.v2),
        ];

        // Early exit if all vertices lie strictly on one side
        if d.iter().all(|&x| x > 1e-12) || d.iter().all(|&x| x < -1e-12) {
            return None;
        }

        let verts = [self.v0, self.v1, self.v2];
        let mut intersections = Vec::with_capacity(3);
        for (a, b) in [(0, 1), (1, 2), (2, 0)] {
            if let Some(point) = intersect_edge(&verts[a], &verts[b], d[a], d[b], 0.0) {
                intersections.push(point);
            }
        }

        // Remove duplicate points
        intersections.dedup_by(|a, b| (a.coords - b.coords).norm() < 1e-10);
        if intersections.len() > 2
            && (intersections[0] - intersections[intersections.len() - 1]).norm() < 1e-10
        {
            intersections.pop();
        }

        if intersections.len() == 2 {
            Some(LineSegment::new(intersections[0], intersections[1]))
        } else {
            None
        }
    }
}

/// Line segment in 3D space
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LineSegment {
    pub start: Point3D,
    pub end: Point3D,
}

impl LineSegment {
    pub fn new(start: Point3D, end: Point3D) -> Self {
        Self { start, end }
    }

    pub fn length(&self) -> f64 {
        (self.end - self.start).norm()
    }
}

/// Unbounded plane defined by a point and normal vector
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Plane {
    pub point: Point3D,
    pub normal: Vector3D,
}

impl Plane {
    pub fn new(point: Point3D, normal: Vector3D) -> Self {
        Self {
            point,
            normal: normal.normalize(),
        }
    }

    /// Distance from point to plane (signed)
    pub fn signed_distance(&self, point: &Point3D) -> f64 {
        self.normal.dot(&(point - self.point))
    }
}

/// Finite rectangular patch used as a cutting tool.
///
/// The patch is centered at `center`, faces `normal`, and spans `i_size`
/// along `u_axis` and `j_size` along `v_axis`. Its implicit distance field is
/// zero only on the rectangle itself, which keeps a cut local to the vessel
/// even when another branch crosses the infinite plane nearby.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoundedPatch {
    pub center: Point3D,
    pub normal: Vector3D,
    pub u_axis: Vector3D,
    pub v_axis: Vector3D,
    pub i_size: f64,
    pub j_size: f64,
}

impl BoundedPatch {
    pub fn new(center: Point3D, direction: Vector3D, i_size: f64, j_size: f64) -> Self {
        let normal = if direction.norm() < 1e-12 {
            Vector3D::z()
        } else {
            direction.normalize()
        };
        let (u_axis, v_axis) = orthonormal_basis(&normal);
        Self {
            center,
            normal,
            u_axis,
            v_axis,
            i_size,
            j_size,
        }
    }

    /// Infinite plane supporting the patch
    pub fn plane(&self) -> Plane {
        Plane::new(self.center, self.normal)
    }

    /// Coordinates of a point in the patch frame: (u, v, height above patch)
    pub fn local_coords(&self, point: &Point3D) -> (f64, f64, f64) {
        let d = point - self.center;
        (d.dot(&self.u_axis), d.dot(&self.v_axis), d.dot(&self.normal))
    }

    /// Whether the orthogonal projection of `point` falls on the rectangle
    pub fn contains_projection(&self, point: &Point3D, tolerance: f64) -> bool {
        let (u, v, _) = self.local_coords(point);
        u.abs() <= self.i_size / 2.0 + tolerance && v.abs() <= self.j_size / 2.0 + tolerance
    }

    /// Signed distance to the rectangle; the sign follows the normal side
    pub fn signed_distance(&self, point: &Point3D) -> f64 {
        let (u, v, w) = self.local_coords(point);
        let du = (u.abs() - self.i_size / 2.0).max(0.0);
        let dv = (v.abs() - self.j_size / 2.0).max(0.0);
        let distance = (w * w + du * du + dv * dv).sqrt();
        if w >= 0.0 {
            distance
        } else {
            -distance
        }
    }

    /// Project a point into the 2D patch frame
    pub fn project_2d(&self, point: &Point3D) -> (f64, f64) {
        let (u, v, _) = self.local_coords(point);
        (u, v)
    }

    /// Uniformly scale about the origin (unit conversion between datasets)
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            center: Point3D::from(self.center.coords * factor),
            i_size: self.i_size * factor,
            j_size: self.j_size * factor,
            ..*self
        }
    }

    pub fn corners(&self) -> [Point3D; 4] {
        let hu = self.u_axis * (self.i_size / 2.0);
        let hv = self.v_axis * (self.j_size / 2.0);
        [
            self.center - hu - hv,
            self.center + hu - hv,
            self.center + hu + hv,
            self.center - hu + hv,
        ]
    }

    /// The patch as two triangles wound along the normal
    pub fn triangles(&self) -> [Triangle; 2] {
        let [a, b, c, d] = self.corners();
        [Triangle::new(a, b, c), Triangle::new(a, c, d)]
    }

    /// Persist the patch as an STL surface for downstream meshing tools
    pub fn write_stl<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let mut file = std::fs::File::create(path)?;
        let triangles: Vec<stl_io::Triangle> = self.triangles().iter().map(to_stl_triangle).collect();
        stl_io::write_stl(&mut file, triangles.iter())
    }
}

pub(crate) fn to_stl_triangle(tri: &Triangle) -> stl_io::Triangle {
    let n = tri.normal();
    let vertex = |p: &Point3D| stl_io::Vertex::new([p.x as f32, p.y as f32, p.z as f32]);
    stl_io::Triangle {
        normal: stl_io::Normal::new([n.x as f32, n.y as f32, n.z as f32]),
        vertices: [vertex(&tri.v0), vertex(&tri.v1), vertex(&tri.v2)],
    }
}

/// Two unit vectors completing `normal` to a right-handed orthonormal frame
pub fn orthonormal_basis(normal: &Vector3D) -> (Vector3D, Vector3D) {
    // Choose axis with smallest absolute component to avoid degeneracy
    let abs = normal.abs();
    let helper = if abs.x <= abs.y && abs.x <= abs.z {
        Vector3D::x()
    } else if abs.y <= abs.z {
        Vector3D::y()
    } else {
        Vector3D::z()
    };
    let u = helper.cross(normal).normalize();
    let v = normal.cross(&u);
    (u, v)
}

/// Interpolate the point where a scalar field crosses `iso` along an edge
pub fn intersect_edge(p0: &Point3D, p1: &Point3D, s0: f64, s1: f64, iso: f64) -> Option<Point3D> {
    if (s0 - iso).abs() < 1e-12 {
        return Some(*p0);
    }
    if (s1 - iso).abs() < 1e-12 {
        return Some(*p1);
    }
    if (s0 < iso && s1 < iso) || (s0 > iso && s1 > iso) {
        return None;
    }

    let t = ((iso - s0) / (s1 - s0)).clamp(0.0, 1.0);
    Some(p0 + t * (p1 - p0))
}

/// Arithmetic mean of a point set
pub fn centroid(points: &[Point3D]) -> Option<Point3D> {
    if points.is_empty() {
        return None;
    }
    let sum: Vector3D = points.iter().map(|p| p.coords).sum();
    Some(Point3D::from(sum / points.len() as f64))
}

/// Axis-aligned bounds of a point set as (min, max)
pub fn bounds(points: &[Point3D]) -> Option<(Point3D, Point3D)> {
    if points.is_empty() {
        return None;
    }
    let mut min = Point3D::new(f64::INFINITY, f64::INFINITY, f64::INFINITY);
    let mut max = Point3D::new(f64::NEG_INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
    for p in points {
        min.x = min.x.min(p.x);
        min.y = min.y.min(p.y);
        min.z = min.z.min(p.z);
        max.x = max.x.max(p.x);
        max.y = max.y.max(p.y);
        max.z = max.z.max(p.z);
    }
    Some((min, max))
}

/// Center of the axis-aligned bounding box
pub fn bounds_center(points: &[Point3D]) -> Option<Point3D> {
    bounds(points).map(|(min, max)| Point3D::from((min.coords + max.coords) / 2.0))
}

/// Rotation block of a homogeneous matrix
pub fn rotation_block(matrix: &Matrix4<f64>) -> Matrix3<f64> {
    matrix.fixed_view::<3, 3>(0, 0).into_owned()
}

/// Translation column of a homogeneous matrix
pub fn translation_part(matrix: &Matrix4<f64>) -> Vector3D {
    matrix.fixed_view::<3, 1>(0, 3).into_owned()
}
