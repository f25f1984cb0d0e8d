// Geometric clipping of vessel surfaces and flow volumes at landmarks

pub mod delaunay;
pub mod intersection;
pub mod patches;
pub mod surface_clip;

pub use patches::{patch_side, sphere_radius, PlaneSet};

use crate::centerline::BranchTag;
use crate::config::{PatchSizing, PipelineConfig, SphereSizing};
use crate::flux::CrossSection;
use crate::geometry::{Axis, Plane, Vector3D};
use crate::landmarks::{Landmark, LandmarkKey, LandmarkSet};
use crate::mesh::SurfaceMesh;
use crate::volume::VolumeMesh;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Direction of physiological flow through a landmark's patch
pub fn flow_orientation(landmark: &Landmark) -> Vector3D {
    if landmark.key.branch.is_inflow() {
        landmark.direction
    } else {
        -landmark.direction
    }
}

/// Surface after the three branch clips, with its end caps
#[derive(Debug, Clone)]
pub struct ClippedSurface {
    pub surface: SurfaceMesh,
    pub caps: BTreeMap<BranchTag, SurfaceMesh>,
    /// Clipped wall plus caps
    pub combined: SurfaceMesh,
}

impl ClippedSurface {
    /// Write `clipped.stl`, `<branch>_cap.stl` and `combined.stl` under `dir`
    pub fn write_stl(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;
        let mut written = Vec::new();

        let path = dir.join("clipped.stl");
        self.surface.write_stl(&path)?;
        written.push(path);
        for (tag, cap) in &self.caps {
            let path = dir.join(format!("{}_cap.stl", tag));
            cap.write_stl(&path)?;
            written.push(path);
        }
        let path = dir.join("combined.stl");
        self.combined.write_stl(&path)?;
        written.push(path);

        Ok(written)
    }
}

/// Bisection, patch construction and bounded cuts
#[derive(Debug, Clone)]
pub struct GeometricClipper {
    patches: PatchSizing,
    spheres: SphereSizing,
    tolerance: f64,
}

impl GeometricClipper {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            patches: config.patches.clone(),
            spheres: config.spheres.clone(),
            tolerance: config.session.weld_tolerance,
        }
    }

    /// Split a surface through its bounding-box center: (positive half, negative half)
    pub fn bisect_surface(&self, surface: &SurfaceMesh, axis: Axis) -> Result<(SurfaceMesh, SurfaceMesh)> {
        let center = surface
            .center()
            .ok_or_else(|| Error::geometry("surface bisection", "empty surface"))?;
        let plane = Plane::new(center, axis.unit());
        let (positive, negative) = surface_clip::split_surface(surface, &plane, self.tolerance);
        log::info!(
            "  Surface bisected along {:?}: {} / {} faces",
            axis,
            positive.num_faces(),
            negative.num_faces()
        );
        Ok((positive, negative))
    }

    /// Split a volume through its bounding-box center by tetrahedron centroid
    pub fn bisect_volume(&self, volume: &VolumeMesh, axis: Axis) -> Result<(VolumeMesh, VolumeMesh)> {
        let center = volume
            .center()
            .ok_or_else(|| Error::geometry("volume bisection", "empty volume"))?;
        let (positive, negative) = volume.split_by_plane(&Plane::new(center, axis.unit()));
        log::info!(
            "  Volume bisected along {:?}: {} / {} tets",
            axis,
            positive.num_tets(),
            negative.num_tets()
        );
        Ok((positive, negative))
    }

    pub fn build_planes(&self, landmarks: &LandmarkSet) -> PlaneSet {
        PlaneSet::build(landmarks, &self.patches)
    }

    /// Clip cca, ica then eca with sphere-masked cuts and cap each opening
    pub fn clip_surface(
        &self,
        surface: &SurfaceMesh,
        landmarks: &LandmarkSet,
        planes: &PlaneSet,
    ) -> Result<ClippedSurface> {
        log::info!("=== Surface Clipping ===");

        let mut clipped = surface.clone();
        let mut caps = BTreeMap::new();
        for tag in BranchTag::ALL {
            let patch = planes
                .clipper(tag)
                .ok_or_else(|| Error::NotFound(format!("clip patch for {}", tag)))?;
            let radius = sphere_radius(landmarks.clip(tag), &self.spheres, 1.0);

            clipped = surface_clip::sphere_masked_clip(
                &clipped,
                &patch.center,
                radius,
                &patch.plane(),
                self.tolerance,
            );
            if clipped.is_empty() {
                return Err(Error::geometry(
                    format!("{} clip", tag),
                    "no faces left after clipping",
                ));
            }

            let cap = intersection::surface_cap(surface, patch, radius, self.tolerance)?;
            log::info!(
                "  {}: {} faces kept, cap area {:.3}",
                tag,
                clipped.num_faces(),
                cap.area()
            );
            caps.insert(tag, cap);
        }

        let mut combined = clipped.clone();
        for cap in caps.values() {
            combined.append(cap);
        }
        let combined = combined.clean(self.tolerance);

        Ok(ClippedSurface {
            surface: clipped,
            caps,
            combined,
        })
    }

    /// Section through one landmark's patch; `scale` converts patch and
    /// sphere into the volume's length unit
    pub fn section(
        &self,
        volume: &VolumeMesh,
        planes: &PlaneSet,
        landmark: &Landmark,
        scale: f64,
    ) -> Result<CrossSection> {
        let patch = planes
            .get(&landmark.key)
            .ok_or_else(|| Error::NotFound(format!("patch for {}", landmark.key)))?;
        let patch = if (scale - 1.0).abs() > f64::EPSILON {
            patch.scaled(scale)
        } else {
            *patch
        };
        let radius = sphere_radius(landmark, &self.spheres, scale);

        intersection::volume_section(
            volume,
            &patch,
            radius,
            landmark.key,
            flow_orientation(landmark),
            self.tolerance * scale,
        )
    }

    /// Sections at every enabled cut landmark that still has a patch
    pub fn cut_volume(
        &self,
        volume: &VolumeMesh,
        planes: &PlaneSet,
        landmarks: &LandmarkSet,
        scale: f64,
    ) -> Result<Vec<CrossSection>> {
        landmarks
            .enabled_cuts()
            .filter(|l| planes.get(&l.key).is_some())
            .map(|l| self.section(volume, planes, l, scale))
            .collect()
    }

    /// Section at the inflow clip landmark
    pub fn measure_inflow(
        &self,
        volume: &VolumeMesh,
        planes: &PlaneSet,
        landmarks: &LandmarkSet,
        scale: f64,
    ) -> Result<CrossSection> {
        let key = LandmarkKey::clip(BranchTag::Cca);
        let landmark = landmarks
            .get(&key)
            .ok_or_else(|| Error::NotFound(format!("landmark {}", key)))?;
        self.section(volume, planes, landmark, scale)
    }
}
