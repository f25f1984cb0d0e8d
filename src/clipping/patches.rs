// Bounded cutting patches built once per side and reused for every time step

use crate::centerline::BranchTag;
use crate::config::{PatchSizing, SphereSizing};
use crate::geometry::BoundedPatch;
use crate::landmarks::{Landmark, LandmarkKey, LandmarkSet};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Square side of the patch for a landmark
pub fn patch_side(landmark: &Landmark, sizing: &PatchSizing) -> f64 {
    let radius = landmark.point.radius;
    if radius < sizing.small_radius_threshold {
        sizing.fixed_patch_size
    } else if landmark.key.is_clip() && landmark.key.branch.is_inflow() {
        radius * sizing.inflow_multiplier
    } else if landmark.key.is_clip() {
        radius * sizing.outflow_multiplier
    } else {
        radius * sizing.cut_plane_multiplier
    }
}

/// Radius of the mask sphere around a landmark, in the units of a dataset
/// scaled by `scale` relative to the skeleton
pub fn sphere_radius(landmark: &Landmark, sizing: &SphereSizing, scale: f64) -> f64 {
    let radius = landmark.point.radius;
    let base = if landmark.key.is_clip()
        && landmark.key.branch.is_inflow()
        && radius < sizing.small_inflow_radius_threshold
    {
        sizing.small_inflow_sphere_radius
    } else {
        radius * sizing.sphere_radius_coef
    };
    base * scale
}

/// Patches keyed by landmark
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaneSet {
    patches: BTreeMap<LandmarkKey, BoundedPatch>,
}

impl PlaneSet {
    /// One patch per landmark, centered on it and facing its direction
    pub fn build(landmarks: &LandmarkSet, sizing: &PatchSizing) -> Self {
        let mut patches = BTreeMap::new();
        for landmark in landmarks.clips().iter().chain(landmarks.enabled_cuts()) {
            let side = patch_side(landmark, sizing);
            patches.insert(
                landmark.key,
                BoundedPatch::new(landmark.point.position, landmark.direction, side, side),
            );
        }
        log::info!("  Built {} cutting patches", patches.len());
        Self { patches }
    }

    pub fn get(&self, key: &LandmarkKey) -> Option<&BoundedPatch> {
        self.patches.get(key)
    }

    pub fn clipper(&self, tag: BranchTag) -> Option<&BoundedPatch> {
        self.patches.get(&LandmarkKey::clip(tag))
    }

    /// Cut patches in key order
    pub fn cuts(&self) -> impl Iterator<Item = (&LandmarkKey, &BoundedPatch)> {
        self.patches.iter().filter(|(k, _)| !k.is_clip())
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Drop de-selected cut patches
    pub fn remove(&mut self, keys: &[LandmarkKey]) {
        for key in keys.iter().filter(|k| !k.is_clip()) {
            self.patches.remove(key);
        }
    }

    /// Write every patch as `<key>_plane.stl` under `dir`
    pub fn write_stl(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;
        let mut written = Vec::with_capacity(self.patches.len());
        for (key, patch) in &self.patches {
            let path = dir.join(format!("{}_plane.stl", key));
            patch.write_stl(&path)?;
            written.push(path);
        }
        Ok(written)
    }
}
