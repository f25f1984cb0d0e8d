use crate::centerline::AxisPolicy;
use crate::geometry::Axis;
use crate::landmarks::SearchMode;
use crate::{Error, Result};
use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Which coordinate axes mean "elevation" and "lateral" in the scan frame
    pub axis_policy: AxisPolicy,

    pub landmarks: LandmarkConfig,

    pub patches: PatchSizing,

    pub spheres: SphereSizing,

    pub registration: RegistrationConfig,

    pub kernel: KernelConfig,

    pub session: SessionConfig,
}

/// Radius-convergence search settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LandmarkConfig {
    /// Relative radius tolerance v; a radius converges inside ((1-v)r, (1+v)r)
    pub variation_rate: f64,

    /// Search mode for the inflow branch
    pub inflow_search: SearchMode,

    /// Search mode for both outflow branches
    pub outflow_search: SearchMode,

    /// Samples skipped at the endpoint before a forward walk
    pub forward_start_offset: usize,

    /// Samples skipped at the endpoint before a backward walk
    pub backward_start_offset: usize,

    /// Upper bound on walk length
    pub max_search_steps: usize,
}

impl Default for LandmarkConfig {
    fn default() -> Self {
        Self {
            variation_rate: 0.1,
            inflow_search: SearchMode::Forward,
            outflow_search: SearchMode::Backward,
            forward_start_offset: 1,
            backward_start_offset: 5,
            max_search_steps: 10_000,
        }
    }
}

/// Side length rules for clip and cut patches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchSizing {
    /// Below this radius the fixed patch size is used
    pub small_radius_threshold: f64,

    pub fixed_patch_size: f64,

    /// Clip patch on the inflow branch: radius multiplier
    pub inflow_multiplier: f64,

    /// Clip patch on an outflow branch: radius multiplier
    pub outflow_multiplier: f64,

    /// Cut patch: radius multiplier
    pub cut_plane_multiplier: f64,
}

impl Default for PatchSizing {
    fn default() -> Self {
        Self {
            small_radius_threshold: 1.1,
            fixed_patch_size: 6.0,
            inflow_multiplier: 4.0,
            outflow_multiplier: 3.5,
            cut_plane_multiplier: 3.0,
        }
    }
}

/// Mask sphere sizing around a landmark
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SphereSizing {
    /// Inflow clip landmarks thinner than this get the fixed sphere radius
    pub small_inflow_radius_threshold: f64,

    pub small_inflow_sphere_radius: f64,

    /// Sphere radius = landmark radius * coefficient
    pub sphere_radius_coef: f64,
}

impl Default for SphereSizing {
    fn default() -> Self {
        Self {
            small_inflow_radius_threshold: 1.4,
            small_inflow_sphere_radius: 7.5,
            sphere_radius_coef: 3.0,
        }
    }
}

/// Rigid registration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Scanner-to-anatomy rotation, row major
    pub precondition_rotation: [[f64; 3]; 3],

    /// Iteration cap for each ICP pass
    pub max_iterations: usize,

    /// Stop when the RMS error changes less than this between iterations
    pub convergence_tolerance: f64,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            // Rz(90) * Ry(90)
            precondition_rotation: [[0.0, -1.0, 0.0], [0.0, 0.0, 1.0], [-1.0, 0.0, 0.0]],
            max_iterations: 500,
            convergence_tolerance: 1e-10,
        }
    }
}

impl RegistrationConfig {
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        let r = &self.precondition_rotation;
        Matrix3::new(
            r[0][0], r[0][1], r[0][2],
            r[1][0], r[1][1], r[1][2],
            r[2][0], r[2][1], r[2][2],
        )
    }
}

/// Ellipsoidal Gaussian kernel for resampling flow between sections
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub radius: f64,
    pub sharpness: f64,
    pub eccentricity: f64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            radius: 0.001,
            sharpness: 6.0,
            eccentricity: 2.0,
        }
    }
}

/// Per-session processing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Axis whose normal splits the combined surface into sides
    pub surface_split_axis: Axis,

    /// Axis whose normal splits the combined flow volume into sides
    pub volume_split_axis: Axis,

    /// Length unit of the resampled volume relative to the surface (mm → m)
    pub volume_unit_scale: f64,

    /// Relative band around the maximum kept by the trimmed average
    pub trim_fraction: f64,

    /// Physical duration of one time step
    pub time_step_duration: f64,

    /// Distance under which vertices are welded
    pub weld_tolerance: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            surface_split_axis: Axis::X,
            volume_split_axis: Axis::Y,
            volume_unit_scale: 0.001,
            trim_fraction: 0.10,
            time_step_duration: 1.0,
            weld_tolerance: 1e-6,
        }
    }
}

impl PipelineConfig {
    /// Load from JSON and validate
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Reject missing or out-of-range coefficients
    pub fn validate(&self) -> Result<()> {
        fn positive(name: &str, value: f64) -> Result<()> {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(Error::Configuration(format!("{} must be positive, got {}", name, value)))
            }
        }

        if self.axis_policy.elevation == self.axis_policy.lateral {
            return Err(Error::Configuration(
                "elevation and lateral axes must differ".to_string(),
            ));
        }

        let v = self.landmarks.variation_rate;
        if !(v > 0.0 && v < 1.0) {
            return Err(Error::Configuration(format!(
                "variation_rate must lie in (0, 1), got {}",
                v
            )));
        }
        if self.landmarks.max_search_steps == 0 {
            return Err(Error::Configuration("max_search_steps must be at least 1".to_string()));
        }

        positive("small_radius_threshold", self.patches.small_radius_threshold)?;
        positive("fixed_patch_size", self.patches.fixed_patch_size)?;
        positive("inflow_multiplier", self.patches.inflow_multiplier)?;
        positive("outflow_multiplier", self.patches.outflow_multiplier)?;
        positive("cut_plane_multiplier", self.patches.cut_plane_multiplier)?;

        positive("small_inflow_sphere_radius", self.spheres.small_inflow_sphere_radius)?;
        positive("small_inflow_radius_threshold", self.spheres.small_inflow_radius_threshold)?;
        positive("sphere_radius_coef", self.spheres.sphere_radius_coef)?;

        if self.registration.max_iterations == 0 {
            return Err(Error::Configuration("max_iterations must be at least 1".to_string()));
        }
        positive("convergence_tolerance", self.registration.convergence_tolerance)?;
        let r = self.registration.rotation_matrix();
        let orthogonality = (r.transpose() * r - Matrix3::identity()).norm();
        if orthogonality > 1e-6 || (r.determinant() - 1.0).abs() > 1e-6 {
            return Err(Error::Configuration(
                "precondition_rotation must be a proper rotation".to_string(),
            ));
        }

        positive("kernel radius", self.kernel.radius)?;
        positive("kernel sharpness", self.kernel.sharpness)?;
        positive("kernel eccentricity", self.kernel.eccentricity)?;

        positive("volume_unit_scale", self.session.volume_unit_scale)?;
        positive("time_step_duration", self.session.time_step_duration)?;
        positive("weld_tolerance", self.session.weld_tolerance)?;
        let t = self.session.trim_fraction;
        if !(0.0..1.0).contains(&t) {
            return Err(Error::Configuration(format!(
                "trim_fraction must lie in [0, 1), got {}",
                t
            )));
        }

        Ok(())
    }
}
