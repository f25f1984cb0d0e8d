// Flux through planar cross-sections and flow transfer between sections

use crate::config::KernelConfig;
use crate::geometry::{Point3D, Vector3D};
use crate::landmarks::LandmarkKey;
use crate::mesh::{MeshError, SurfaceMesh};
use crate::spatial_grid::{NearestPointQuery, PointLocator};
use crate::Result;
use rayon::prelude::*;

/// Planar piece of a flow volume cut at a landmark
#[derive(Debug, Clone)]
pub struct CrossSection {
    pub key: LandmarkKey,
    pub mesh: SurfaceMesh,
    /// Velocity per mesh vertex
    pub flow: Vec<Vector3D>,
    /// Direction of physiological flow through the section
    pub orientation: Vector3D,
}

impl CrossSection {
    pub fn new(
        key: LandmarkKey,
        mesh: SurfaceMesh,
        flow: Vec<Vector3D>,
        orientation: Vector3D,
    ) -> Result<Self> {
        if flow.len() != mesh.num_vertices() {
            return Err(MeshError::LoadError(format!(
                "section {} has {} flow vectors for {} vertices",
                key,
                flow.len(),
                mesh.num_vertices()
            ))
            .into());
        }
        Ok(Self {
            key,
            mesh,
            flow,
            orientation,
        })
    }

    pub fn area(&self) -> f64 {
        self.mesh.area()
    }

    /// Sum over triangles of area * (mean vertex flow . oriented normal)
    pub fn flux(&self) -> f64 {
        self.mesh
            .faces
            .iter()
            .enumerate()
            .map(|(face_id, f)| {
                let tri = self.mesh.triangle(face_id);
                let mut normal = tri.normal();
                if normal.dot(&self.orientation) < 0.0 {
                    normal = -normal;
                }
                let mean = (self.flow[f[0]] + self.flow[f[1]] + self.flow[f[2]]) / 3.0;
                tri.area() * mean.dot(&normal)
            })
            .sum()
    }

    /// Area-weighted mean of the flow component along the orientation
    pub fn mean_normal_velocity(&self) -> Option<f64> {
        let area = self.area();
        if area > 0.0 {
            Some(self.flux() / area)
        } else {
            None
        }
    }

    /// Positions scaled about the origin; flow unchanged
    pub fn scaled(&self, factor: f64) -> Self {
        let mut mesh = self.mesh.clone();
        mesh.scale(factor);
        Self {
            mesh,
            ..self.clone()
        }
    }

    /// Same geometry carrying flow resampled from `source`
    pub fn resampled_from(&self, source: &CrossSection, kernel: &KernelConfig) -> Self {
        Self {
            flow: resample_flow(source, &self.mesh.vertices, kernel),
            ..self.clone()
        }
    }
}

/// Ellipsoidal Gaussian interpolation of `source` flow at `targets`.
///
/// Each source point contributes exp(-(s/R)^2 (e^2 z^2 + r_xy^2)) where z is
/// the offset along the source vertex normal. Targets with no source inside
/// the kernel radius take the value of the closest source point.
pub fn resample_flow(source: &CrossSection, targets: &[Point3D], kernel: &KernelConfig) -> Vec<Vector3D> {
    if source.flow.is_empty() {
        return vec![Vector3D::zeros(); targets.len()];
    }

    let normals = source.mesh.vertex_normals();
    let locator = PointLocator::new(source.mesh.vertices.clone());
    let factor = (kernel.sharpness / kernel.radius).powi(2);
    let e2 = kernel.eccentricity * kernel.eccentricity;

    targets
        .par_iter()
        .map(|target| {
            let closest = || {
                locator
                    .nearest(target)
                    .map(|id| source.flow[id])
                    .unwrap_or_else(Vector3D::zeros)
            };

            let neighbours = locator.within_radius(target, kernel.radius);
            if neighbours.is_empty() {
                return closest();
            }

            let mut sum = Vector3D::zeros();
            let mut total = 0.0;
            for id in neighbours {
                let offset = target - source.mesh.vertices[id];
                let z = offset.dot(&normals[id]);
                let r_xy2 = (offset.norm_squared() - z * z).max(0.0);
                let weight = (-factor * (e2 * z * z + r_xy2)).exp();
                sum += source.flow[id] * weight;
                total += weight;
            }

            if total > f64::MIN_POSITIVE {
                sum / total
            } else {
                closest()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::centerline::BranchTag;
    use crate::geometry::Triangle;

    /// Unit square in the z = 0 plane split into a grid of n x n cells
    fn square_section(n: usize, side: f64, flow: impl Fn(&Point3D) -> Vector3D) -> CrossSection {
        let h = side / n as f64;
        let mut triangles = Vec::new();
        for i in 0..n {
            for j in 0..n {
                let p = |a: usize, b: usize| Point3D::new(a as f64 * h, b as f64 * h, 0.0);
                triangles.push(Triangle::new(p(i, j), p(i + 1, j), p(i + 1, j + 1)));
                triangles.push(Triangle::new(p(i, j), p(i + 1, j + 1), p(i, j + 1)));
            }
        }
        let mesh = SurfaceMesh::from_triangles(&triangles, 1e-9);
        let values = mesh.vertices.iter().map(&flow).collect();
        CrossSection::new(LandmarkKey::cut(BranchTag::Cca, 0), mesh, values, Vector3D::z()).unwrap()
    }

    #[test]
    fn test_uniform_flux() {
        let section = square_section(4, 2.0, |_| Vector3D::new(0.3, -0.2, 1.5));
        // Only the normal component counts: 1.5 * area 4
        assert!((section.flux() - 6.0).abs() < 1e-9);
        assert!((section.mean_normal_velocity().unwrap() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_flux_follows_orientation() {
        let mut section = square_section(2, 1.0, |_| Vector3D::z());
        assert!(section.flux() > 0.0);

        section.orientation = -Vector3D::z();
        assert!((section.flux() + 1.0).abs() < 1e-9);

        // Flipping face winding must not change the result
        for f in section.mesh.faces.iter_mut() {
            f.swap(1, 2);
        }
        assert!((section.flux() + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_linear_profile_flux() {
        // v_z = x on [0, 1]^2 integrates to 1/2
        let section = square_section(8, 1.0, |p| Vector3D::new(0.0, 0.0, p.x));
        assert!((section.flux() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_flow_length_checked() {
        let section = square_section(1, 1.0, |_| Vector3D::z());
        let result = CrossSection::new(section.key, section.mesh.clone(), vec![], Vector3D::z());
        assert!(result.is_err());
    }

    #[test]
    fn test_resample_recovers_smooth_field() {
        let kernel = KernelConfig {
            radius: 0.3,
            ..KernelConfig::default()
        };
        let source = square_section(10, 1.0, |p| Vector3D::new(0.0, 0.0, 1.0 + p.x));
        let target = square_section(7, 1.0, |_| Vector3D::zeros());

        let resampled = target.resampled_from(&source, &kernel);
        for (p, v) in resampled.mesh.vertices.iter().zip(&resampled.flow) {
            assert!((v.z - (1.0 + p.x)).abs() < 0.05, "at {:?}: {}", p, v.z);
        }
        assert!((resampled.flux() - source.flux()).abs() < 0.02);
    }

    #[test]
    fn test_resample_falls_back_to_closest() {
        let kernel = KernelConfig::default();
        let source = square_section(1, 1.0, |p| Vector3D::new(0.0, 0.0, p.x + 2.0 * p.y));

        let far = [Point3D::new(5.0, 5.0, 0.0), Point3D::new(-3.0, 0.0, 0.0)];
        let values = resample_flow(&source, &far, &kernel);
        assert!((values[0].z - 3.0).abs() < 1e-12);
        assert!(values[1].z.abs() < 1e-12);
    }

    #[test]
    fn test_scaled_keeps_flow() {
        let section = square_section(2, 1000.0, |_| Vector3D::z());
        let scaled = section.scaled(0.001);
        assert!((scaled.area() - 1.0).abs() < 1e-9);
        assert_eq!(scaled.flow, section.flow);
    }
}
