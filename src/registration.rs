// Rigid registration of flow volumes onto the reference vessel surface
//
// One solver per side per session. The composed transform is computed from
// the reference time step and frozen; later steps only apply it.

use crate::config::RegistrationConfig;
use crate::geometry::{self, Point3D, Vector3D};
use crate::mesh::SurfaceMesh;
use crate::spatial_grid::{NearestPointQuery, PointLocator};
use crate::volume::VolumeMesh;
use crate::{Error, Result};
use nalgebra::{Matrix3, Matrix4};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Progress of a single registration run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationStage {
    ExtractSurface,
    Precondition,
    Icp1,
    Recenter,
    Icp2,
    Compose,
    Done,
    Failed,
}

impl RegistrationStage {
    pub fn name(&self) -> &'static str {
        match self {
            RegistrationStage::ExtractSurface => "surface extraction",
            RegistrationStage::Precondition => "preconditioning",
            RegistrationStage::Icp1 => "ICP pass 1",
            RegistrationStage::Recenter => "recentering",
            RegistrationStage::Icp2 => "ICP pass 2",
            RegistrationStage::Compose => "composition",
            RegistrationStage::Done => "done",
            RegistrationStage::Failed => "failed",
        }
    }
}

/// Frozen 4x4 homogeneous rigid transform
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegistrationTransform {
    matrix: Matrix4<f64>,
}

impl RegistrationTransform {
    pub fn new(matrix: Matrix4<f64>) -> Self {
        Self { matrix }
    }

    pub fn identity() -> Self {
        Self::new(Matrix4::identity())
    }

    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.matrix
    }

    /// Row-major numeric rows
    pub fn rows(&self) -> [[f64; 4]; 4] {
        let mut rows = [[0.0; 4]; 4];
        for (r, row) in rows.iter_mut().enumerate() {
            for (c, value) in row.iter_mut().enumerate() {
                *value = self.matrix[(r, c)];
            }
        }
        rows
    }

    pub fn from_rows(rows: [[f64; 4]; 4]) -> Self {
        Self::new(Matrix4::from_fn(|r, c| rows[r][c]))
    }

    /// Four whitespace-separated rows with six decimals
    pub fn to_text(&self) -> String {
        self.rows()
            .iter()
            .map(|row| {
                row.iter()
                    .map(|v| format!("{:.6}", v))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect::<Vec<_>>()
            .join("\n")
            + "\n"
    }

    pub fn write_text<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_text())?;
        Ok(())
    }

    pub fn read_text<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let values: Vec<f64> = text
            .split_whitespace()
            .map(|token| {
                token
                    .parse::<f64>()
                    .map_err(|e| Error::Configuration(format!("transform entry '{}': {}", token, e)))
            })
            .collect::<Result<_>>()?;
        if values.len() != 16 {
            return Err(Error::Configuration(format!(
                "transform needs 16 entries, found {}",
                values.len()
            )));
        }
        let mut rows = [[0.0; 4]; 4];
        for (i, value) in values.into_iter().enumerate() {
            rows[i / 4][i % 4] = value;
        }
        Ok(Self::from_rows(rows))
    }

    /// Positions by the full matrix, flow by the rotation block
    pub fn apply_to_volume(&self, volume: &VolumeMesh) -> VolumeMesh {
        volume.transformed(&self.matrix)
    }
}

/// Outcome of one ICP pass
#[derive(Debug, Clone)]
pub struct IcpResult {
    pub matrix: Matrix4<f64>,
    pub rms_error: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Least-squares rigid motion mapping `source` onto `target` (Kabsch)
pub fn rigid_fit(source: &[Point3D], target: &[Point3D]) -> Matrix4<f64> {
    let n = source.len().min(target.len());
    if n == 0 {
        return Matrix4::identity();
    }

    let source_centroid: Vector3D = source[..n].iter().map(|p| p.coords).sum::<Vector3D>() / n as f64;
    let target_centroid: Vector3D = target[..n].iter().map(|p| p.coords).sum::<Vector3D>() / n as f64;

    // Cross-covariance
    let mut h = Matrix3::zeros();
    for (s, t) in source[..n].iter().zip(&target[..n]) {
        h += (s.coords - source_centroid) * (t.coords - target_centroid).transpose();
    }

    let svd = h.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Matrix4::new_translation(&(target_centroid - source_centroid));
    };

    let mut rotation = v_t.transpose() * u.transpose();
    // Reflection case
    if rotation.determinant() < 0.0 {
        let mut v_t_fixed = v_t;
        v_t_fixed.set_row(2, &(-v_t.row(2)));
        rotation = v_t_fixed.transpose() * u.transpose();
    }

    let translation = target_centroid - rotation * source_centroid;
    let mut matrix = rotation.to_homogeneous();
    matrix.fixed_view_mut::<3, 1>(0, 3).copy_from(&translation);
    matrix
}

/// Point-to-point rigid ICP, seeded by matching centroids
pub fn icp(
    source: &[Point3D],
    target: &PointLocator,
    max_iterations: usize,
    tolerance: f64,
) -> Result<IcpResult> {
    let (Some(source_centroid), Some(target_centroid)) =
        (geometry::centroid(source), geometry::centroid(target.points()))
    else {
        return Err(Error::geometry("ICP", "empty point set"));
    };

    let mut current = Matrix4::new_translation(&(target_centroid - source_centroid));
    let mut moved: Vec<Point3D> = source.iter().map(|p| current.transform_point(p)).collect();
    let mut previous_rms = f64::INFINITY;
    let mut rms_error = f64::INFINITY;
    let mut iterations = 0;
    let mut converged = false;

    for iter in 0..max_iterations {
        iterations = iter + 1;

        // Nearest neighbours (parallel)
        let matches: Vec<Point3D> = moved
            .par_iter()
            .map(|p| target.nearest(p).map(|id| target.points()[id]).unwrap_or(*p))
            .collect();

        let total_error_sq: f64 = moved
            .iter()
            .zip(&matches)
            .map(|(p, q)| (p - q).norm_squared())
            .sum();
        rms_error = (total_error_sq / moved.len() as f64).sqrt();
        if !rms_error.is_finite() {
            return Err(Error::geometry("ICP", "non-finite alignment error"));
        }

        if (previous_rms - rms_error).abs() < tolerance {
            converged = true;
            break;
        }
        previous_rms = rms_error;

        let step = rigid_fit(&moved, &matches);
        current = step * current;
        for p in &mut moved {
            *p = step.transform_point(p);
        }
    }

    log::debug!(
        "  ICP: {} iterations, RMS {:.6}, converged: {}",
        iterations,
        rms_error,
        converged
    );
    if !converged {
        log::warn!("  ICP hit the iteration cap ({}) at RMS {:.6}", max_iterations, rms_error);
    }
    Ok(IcpResult {
        matrix: current,
        rms_error,
        iterations,
        converged,
    })
}

/// Single-shot composed registration
#[derive(Debug, Clone)]
pub struct RigidRegistrationSolver {
    config: RegistrationConfig,
    stage: RegistrationStage,
}

impl RigidRegistrationSolver {
    pub fn new(config: &RegistrationConfig) -> Self {
        Self {
            config: config.clone(),
            stage: RegistrationStage::ExtractSurface,
        }
    }

    pub fn stage(&self) -> RegistrationStage {
        self.stage
    }

    /// Align the boundary of `volume` onto `target`.
    ///
    /// Final = ICP2 * Recenter * ICP1 * Precondition. A failed stage leaves the
    /// solver in `Failed`; a finished solver refuses to run again.
    pub fn register(&mut self, volume: &VolumeMesh, target: &SurfaceMesh) -> Result<RegistrationTransform> {
        if self.stage != RegistrationStage::ExtractSurface {
            return Err(Error::geometry(
                "registration",
                format!("solver already ran (stage: {})", self.stage.name()),
            ));
        }

        log::info!("=== Rigid Registration ===");
        match self.run(volume, target) {
            Ok(transform) => {
                self.stage = RegistrationStage::Done;
                Ok(transform)
            }
            Err(e) => {
                log::error!("Registration failed during {}", self.stage.name());
                self.stage = RegistrationStage::Failed;
                Err(e)
            }
        }
    }

    fn fail(&self, details: impl Into<String>) -> Error {
        Error::geometry(format!("registration ({})", self.stage.name()), details)
    }

    fn run(&mut self, volume: &VolumeMesh, target: &SurfaceMesh) -> Result<RegistrationTransform> {
        self.stage = RegistrationStage::ExtractSurface;
        let source = volume.boundary_surface();
        if source.is_empty() || target.vertices.is_empty() {
            return Err(self.fail("empty source or target surface"));
        }
        log::info!(
            "  Source surface: {} vertices, target: {} vertices",
            source.num_vertices(),
            target.num_vertices()
        );

        self.stage = RegistrationStage::Precondition;
        let rotation = self.config.rotation_matrix();
        let rotated: Vec<Point3D> = source.vertices.iter().map(|p| Point3D::from(rotation * p.coords)).collect();
        let (Some(rotated_centroid), Some(target_centroid)) =
            (geometry::centroid(&rotated), geometry::centroid(&target.vertices))
        else {
            return Err(self.fail("cannot compute centroids"));
        };
        let precondition =
            Matrix4::new_translation(&(target_centroid - rotated_centroid)) * rotation.to_homogeneous();

        let locator = PointLocator::new(target.vertices.clone());
        let points: Vec<Point3D> = source.vertices.iter().map(|p| precondition.transform_point(p)).collect();

        self.stage = RegistrationStage::Icp1;
        let first = icp(&points, &locator, self.config.max_iterations, self.config.convergence_tolerance)
            .map_err(|e| self.fail(e.to_string()))?;
        log::info!("  ICP pass 1: RMS {:.6} after {} iterations", first.rms_error, first.iterations);

        self.stage = RegistrationStage::Recenter;
        let points: Vec<Point3D> = points.iter().map(|p| first.matrix.transform_point(p)).collect();
        let (Some(moved_center), Some(target_center)) =
            (geometry::bounds_center(&points), geometry::bounds_center(&target.vertices))
        else {
            return Err(self.fail("cannot compute bounding-box centers"));
        };
        let recenter = Matrix4::new_translation(&(target_center - moved_center));
        let points: Vec<Point3D> = points.iter().map(|p| recenter.transform_point(p)).collect();

        self.stage = RegistrationStage::Icp2;
        let second = icp(&points, &locator, self.config.max_iterations, self.config.convergence_tolerance)
            .map_err(|e| self.fail(e.to_string()))?;
        log::info!("  ICP pass 2: RMS {:.6} after {} iterations", second.rms_error, second.iterations);

        self.stage = RegistrationStage::Compose;
        let combined = second.matrix * recenter * first.matrix * precondition;
        if combined.iter().any(|v| !v.is_finite()) {
            return Err(self.fail("non-finite transform"));
        }

        Ok(RegistrationTransform::new(combined))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Rotation3, Unit};

    /// Asymmetric tripod of unit cubes: arms of length 4, 3 and 2
    fn tripod() -> VolumeMesh {
        let mut cells = vec![[0, 0, 0]];
        cells.extend((1..4).map(|i| [i, 0, 0]));
        cells.extend((1..3).map(|j| [0, j, 0]));
        cells.push([0, 0, 1]);
        VolumeMesh::from_voxels(&cells, 1.0).with_flow_field(|p| Vector3D::new(0.0, 0.0, 1.0 + p.x))
    }

    fn small_rotation() -> Matrix4<f64> {
        let axis = Unit::new_normalize(Vector3D::new(0.3, -0.5, 1.0));
        Rotation3::from_axis_angle(&axis, 4f64.to_radians()).to_homogeneous()
    }

    #[test]
    fn test_rigid_fit_recovers_motion() {
        let source: Vec<Point3D> = tripod().vertices;
        let motion = Matrix4::new_translation(&Vector3D::new(1.0, -2.0, 0.5)) * small_rotation();
        let target: Vec<Point3D> = source.iter().map(|p| motion.transform_point(p)).collect();

        let fitted = rigid_fit(&source, &target);
        assert!((fitted - motion).norm() < 1e-9);
    }

    #[test]
    fn test_registration_recovers_known_transform() {
        let anatomy = tripod();
        let target = anatomy.boundary_surface();

        // Scanner frame: undo the default precondition rotation, tilt and shift
        let config = RegistrationConfig::default();
        let to_scanner = Matrix4::new_translation(&Vector3D::new(40.0, -15.0, 7.0))
            * config.rotation_matrix().transpose().to_homogeneous()
            * small_rotation();
        let scanner = anatomy.transformed(&to_scanner);

        let mut solver = RigidRegistrationSolver::new(&config);
        let transform = solver.register(&scanner, &target).unwrap();
        assert_eq!(solver.stage(), RegistrationStage::Done);

        let registered = transform.apply_to_volume(&scanner);
        for (p, q) in registered.vertices.iter().zip(&anatomy.vertices) {
            assert!((p - q).norm() < 1e-6, "{:?} vs {:?}", p, q);
        }
        for (f, g) in registered.flow.iter().zip(&anatomy.flow) {
            assert!((f - g).norm() < 1e-6);
        }

        // Single shot
        assert!(solver.register(&scanner, &target).is_err());
    }

    #[test]
    fn test_failed_stage_is_recorded() {
        let mut solver = RigidRegistrationSolver::new(&RegistrationConfig::default());
        let result = solver.register(&VolumeMesh::default(), &tripod().boundary_surface());
        assert!(matches!(result, Err(Error::Geometry { .. })));
        assert_eq!(solver.stage(), RegistrationStage::Failed);
    }

    #[test]
    fn test_transform_text_round_trip() {
        let transform = RegistrationTransform::new(
            Matrix4::new_translation(&Vector3D::new(1.5, -2.25, 3.0)) * small_rotation(),
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transform.txt");
        transform.write_text(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 4);
        assert!(text.lines().last().unwrap().starts_with("0.000000 0.000000 0.000000 1.000000"));

        let loaded = RegistrationTransform::read_text(&path).unwrap();
        assert!((loaded.matrix() - transform.matrix()).norm() < 1e-5);
        assert_eq!(loaded.rows()[0][3], 1.5);
        assert_eq!(loaded.matrix()[(1, 3)], -2.25);

        std::fs::write(&path, "1 0 0 0\n0 1 0 0\n0 0 1\n").unwrap();
        assert!(matches!(RegistrationTransform::read_text(&path), Err(Error::Configuration(_))));
    }
}
