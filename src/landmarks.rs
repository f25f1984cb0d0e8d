// Landmark search along labeled branches
//
// Clip landmarks mark where a branch stops being a clean tube (the radius
// settles near a reference value); cut landmarks are evenly spaced between
// the bifurcation and the clip landmark. Directions always point toward the
// bifurcation.

use crate::centerline::{BranchTag, CenterlineAnalysis, CenterlinePoint, Skeleton};
use crate::config::LandmarkConfig;
use crate::geometry::Vector3D;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of equal index intervals between the bifurcation and the clip point
pub const CUT_INTERVALS: usize = 5;

/// How the clip search walks from the branch endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchMode {
    /// First sample whose radius matches the endpoint radius
    Forward,
    /// First sample whose radius matches its distal neighbour
    Backward,
}

/// Arena address of a landmark: `index == None` is the branch's clip landmark,
/// `Some(i)` its i-th cut landmark
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LandmarkKey {
    pub branch: BranchTag,
    pub index: Option<usize>,
}

impl LandmarkKey {
    pub fn clip(branch: BranchTag) -> Self {
        Self { branch, index: None }
    }

    pub fn cut(branch: BranchTag, index: usize) -> Self {
        Self {
            branch,
            index: Some(index),
        }
    }

    pub fn is_clip(&self) -> bool {
        self.index.is_none()
    }
}

impl fmt::Display for LandmarkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            None => write!(f, "{}", self.branch),
            Some(i) => write!(f, "{}{}", self.branch, i),
        }
    }
}

/// Point + unit direction on a branch
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Landmark {
    pub key: LandmarkKey,
    pub point: CenterlinePoint,
    /// Unit finite difference toward the bifurcation
    pub direction: Vector3D,
    /// Operator may de-select misplaced cut landmarks
    pub enabled: bool,
}

/// All landmarks of one side, stored contiguously
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LandmarkSet {
    clips: Vec<Landmark>,
    cuts: Vec<Landmark>,
}

impl LandmarkSet {
    /// Clip search then cut sampling on every branch
    pub fn locate(
        skeleton: &Skeleton,
        analysis: &CenterlineAnalysis,
        config: &LandmarkConfig,
    ) -> Result<Self> {
        log::info!("=== Landmark Search ===");
        log::info!("  Variation rate: {:.3}", config.variation_rate);

        let mut clips = Vec::with_capacity(3);
        let mut cuts = Vec::with_capacity(3 * (CUT_INTERVALS - 1));

        for tag in BranchTag::ALL {
            let line = analysis.branch_line(tag);
            let mode = if tag.is_inflow() {
                config.inflow_search
            } else {
                config.outflow_search
            };
            let reference = analysis.endpoint(tag).radius;

            let clip_pos = find_clip_position(skeleton, line, reference, mode, config)
                .ok_or_else(|| {
                    Error::NotFound(format!(
                        "no radius-convergence point on {} ({:?} search, {} samples)",
                        tag,
                        mode,
                        line.len()
                    ))
                })?;
            let clip = make_landmark(skeleton, line, clip_pos, LandmarkKey::clip(tag))?;
            log::info!(
                "  {} clip point: id {} (radius {:.3}, {} samples from endpoint)",
                tag,
                clip.point.id,
                clip.point.radius,
                line.len() - 1 - clip_pos
            );
            clips.push(clip);

            // Cut points lie between the bifurcation and the clip point
            let segment = &line[..=clip_pos];
            let positions = sample_cut_positions(segment.len()).map_err(|_| Error::BranchTooShort {
                branch: tag.name().to_string(),
                length: segment.len(),
                required: CUT_INTERVALS,
            })?;
            for (i, pos) in positions.into_iter().enumerate() {
                cuts.push(make_landmark(skeleton, segment, pos, LandmarkKey::cut(tag, i))?);
            }
            log::info!("  {} cut points: {}", tag, CUT_INTERVALS - 1);
        }

        Ok(Self { clips, cuts })
    }

    pub fn clip(&self, tag: BranchTag) -> &Landmark {
        &self.clips[tag.index()]
    }

    pub fn clips(&self) -> &[Landmark] {
        &self.clips
    }

    /// Cut landmarks of one branch, enabled or not, in index order
    pub fn cuts(&self, tag: BranchTag) -> impl Iterator<Item = &Landmark> {
        self.cuts.iter().filter(move |l| l.key.branch == tag)
    }

    /// Enabled cut landmarks, branch order then index order
    pub fn enabled_cuts(&self) -> impl Iterator<Item = &Landmark> {
        self.cuts.iter().filter(|l| l.enabled)
    }

    pub fn get(&self, key: &LandmarkKey) -> Option<&Landmark> {
        match key.index {
            None => self.clips.iter().find(|l| l.key == *key),
            Some(_) => self.cuts.iter().find(|l| l.key == *key),
        }
    }

    /// De-select cut landmarks before volume processing
    pub fn disable(&mut self, keys: &[LandmarkKey]) -> Result<()> {
        for key in keys {
            if key.is_clip() {
                return Err(Error::Configuration(format!(
                    "clip landmark {} cannot be disabled",
                    key
                )));
            }
            let landmark = self
                .cuts
                .iter_mut()
                .find(|l| l.key == *key)
                .ok_or_else(|| Error::NotFound(format!("cut landmark {}", key)))?;
            landmark.enabled = false;
            log::info!("  Cut plane {} disabled", key);
        }
        Ok(())
    }
}

/// Position (index into `line`) of the clip sample, or None when the walk
/// reaches the bifurcation or the step budget without converging.
///
/// `line` runs from the bifurcation (position 0) to the endpoint.
pub fn find_clip_position(
    skeleton: &Skeleton,
    line: &[usize],
    reference_radius: f64,
    mode: SearchMode,
    config: &LandmarkConfig,
) -> Option<usize> {
    let v = config.variation_rate;
    let inside = |r: f64, reference: f64| r > (1.0 - v) * reference && r < (1.0 + v) * reference;
    let last = line.len().checked_sub(1)?;

    match mode {
        SearchMode::Forward => {
            let start = last.checked_sub(config.forward_start_offset)?;
            // Position 0 is the bifurcation itself
            (1..=start)
                .rev()
                .take(config.max_search_steps)
                .find(|&pos| inside(skeleton.radius(line[pos]), reference_radius))
        }
        SearchMode::Backward => {
            let mut current = last.checked_sub(config.backward_start_offset)?;
            let mut steps = 0;
            // The clip sample (current - 1) needs its own predecessor
            while current >= 2 && steps < config.max_search_steps {
                let current_radius = skeleton.radius(line[current]);
                let previous_radius = skeleton.radius(line[current - 1]);
                if inside(previous_radius, current_radius) {
                    return Some(current - 1);
                }
                current -= 1;
                steps += 1;
            }
            None
        }
    }
}

/// Positions splitting a sequence of `len` ids into equal index intervals
pub fn sample_cut_positions(len: usize) -> Result<Vec<usize>> {
    if len < CUT_INTERVALS {
        return Err(Error::BranchTooShort {
            branch: String::new(),
            length: len,
            required: CUT_INTERVALS,
        });
    }
    Ok((1..CUT_INTERVALS)
        .map(|i| ((i * (len - 1)) as f64 / CUT_INTERVALS as f64).round() as usize)
        .collect())
}

fn make_landmark(skeleton: &Skeleton, line: &[usize], pos: usize, key: LandmarkKey) -> Result<Landmark> {
    let id = line[pos];
    let toward_bifurcation = skeleton.position(line[pos - 1]) - skeleton.position(id);
    let length = toward_bifurcation.norm();
    if length < 1e-12 {
        return Err(Error::geometry(
            format!("{} direction", key),
            "coincident consecutive centerline samples",
        ));
    }

    let mut point = skeleton.point(id);
    point.branch = Some(key.branch);
    Ok(Landmark {
        key,
        point,
        direction: toward_bifurcation / length,
        enabled: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::centerline::AxisPolicy;
    use crate::geometry::Point3D;

    /// Straight branch from the bifurcation (position 0) along +X with the given radii
    fn straight_branch(radii: &[f64]) -> (Skeleton, Vec<usize>) {
        let points = (0..radii.len()).map(|i| Point3D::new(i as f64, 0.0, 0.0)).collect();
        let line: Vec<usize> = (0..radii.len()).collect();
        (Skeleton::new(points, radii.to_vec(), vec![line.clone()]).unwrap(), line)
    }

    #[test]
    fn test_forward_search_matches_reference() {
        // Endpoint radius 2.0 at the far end; a bulge near the end
        let radii = [3.0, 2.6, 2.5, 2.1, 2.9, 3.1, 2.0];
        let (skeleton, line) = straight_branch(&radii);
        let config = LandmarkConfig::default();

        let pos = find_clip_position(&skeleton, &line, 2.0, SearchMode::Forward, &config);
        // Offset 1 skips position 6; 3.1 and 2.9 are outside (1.8, 2.2); 2.1 is inside
        assert_eq!(pos, Some(3));
    }

    #[test]
    fn test_backward_search_on_tapering_branch() {
        // Radius shrinks quickly near the endpoint, then levels off proximally
        let radii = [
            3.0, 2.9, 2.85, 2.8, 2.75, 2.7, 2.2, 1.6, 1.2, 0.9, 0.7, 0.6, 0.5, 0.4, 0.3,
        ];
        let (skeleton, line) = straight_branch(&radii);
        let config = LandmarkConfig::default();

        let pos = find_clip_position(&skeleton, &line, 0.3, SearchMode::Backward, &config);
        // Start at position 14 - 5 = 9 (0.9): 1.2 outside (0.81, 0.99); 8 (1.2): 1.6 outside;
        // 7 (1.6): 2.2 outside; 6 (2.2): 2.7 outside (1.98, 2.42); 5 (2.7): 2.75 inside
        assert_eq!(pos, Some(4));
    }

    #[test]
    fn test_search_is_deterministic() {
        let radii: Vec<f64> = (0..40).map(|i| 3.0 - (i as f64 * 0.37).sin().abs() * 0.5 - i as f64 * 0.03).collect();
        let (skeleton, line) = straight_branch(&radii);
        let config = LandmarkConfig::default();

        for mode in [SearchMode::Forward, SearchMode::Backward] {
            let first = find_clip_position(&skeleton, &line, radii[39], mode, &config);
            let second = find_clip_position(&skeleton, &line, radii[39], mode, &config);
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_search_exhaustion_returns_none() {
        // Radius doubles at every step: nothing ever converges
        let radii: Vec<f64> = (0..12).map(|i| 2f64.powi(12 - i)).collect();
        let (skeleton, line) = straight_branch(&radii);
        let config = LandmarkConfig::default();

        assert_eq!(find_clip_position(&skeleton, &line, 1.0, SearchMode::Backward, &config), None);
        assert_eq!(find_clip_position(&skeleton, &line, 0.1, SearchMode::Forward, &config), None);

        let bounded = LandmarkConfig {
            max_search_steps: 1,
            ..LandmarkConfig::default()
        };
        let flat = [1.0; 12];
        let (skeleton, line) = straight_branch(&flat);
        // One step is enough on a flat branch
        assert_eq!(find_clip_position(&skeleton, &line, 1.0, SearchMode::Backward, &bounded), Some(5));
    }

    #[test]
    fn test_cut_positions() {
        assert_eq!(sample_cut_positions(11).unwrap(), vec![2, 4, 6, 8]);
        assert_eq!(sample_cut_positions(5).unwrap(), vec![1, 2, 2, 3]);
        assert_eq!(sample_cut_positions(14).unwrap(), vec![3, 5, 8, 10]);
        assert!(matches!(sample_cut_positions(4), Err(Error::BranchTooShort { .. })));
    }

    #[test]
    fn test_locate_on_y_skeleton() {
        let skeleton = crate::centerline::tests::y_skeleton(30);
        let analysis = CenterlineAnalysis::analyze(&skeleton, &AxisPolicy::default()).unwrap();
        let set = LandmarkSet::locate(&skeleton, &analysis, &LandmarkConfig::default()).unwrap();

        for tag in BranchTag::ALL {
            let clip = set.clip(tag);
            assert_eq!(clip.key, LandmarkKey::clip(tag));
            assert_eq!(clip.point.branch, Some(tag));
            assert!((clip.direction.norm() - 1.0).abs() < 1e-12);

            // Direction points back toward the bifurcation
            let to_bifurcation = analysis.bifurcation.position - clip.point.position;
            assert!(clip.direction.dot(&to_bifurcation) > 0.0);

            let cuts: Vec<&Landmark> = set.cuts(tag).collect();
            assert_eq!(cuts.len(), CUT_INTERVALS - 1);
            for (i, cut) in cuts.iter().enumerate() {
                assert_eq!(cut.key.index, Some(i));
            }
        }

        // Uniform radii: forward search stops right after the offset
        let cca_line = analysis.branch_line(BranchTag::Cca);
        assert_eq!(set.clip(BranchTag::Cca).point.id, cca_line[cca_line.len() - 2]);
    }

    /// Y skeleton with a flat trunk and outflow branches that taper toward their ends.
    /// Outflow polylines are stored endpoint first.
    fn tapering_y_skeleton() -> Skeleton {
        let ica_radii = [2.4, 2.3, 2.2, 2.1, 2.0, 1.9, 1.8, 1.7, 1.6, 1.5, 1.2, 1.0, 0.8, 0.7, 0.6];
        let eca_radii = [2.0, 1.95, 1.9, 1.85, 1.8, 1.3, 0.9, 0.6, 0.45, 0.4, 0.36, 0.33, 0.3, 0.28];

        let mut points = vec![Point3D::origin()];
        let mut radii = vec![3.0];
        let mut trunk = vec![0];
        for i in 1..=12 {
            points.push(Point3D::new(0.0, 0.0, -(i as f64)));
            radii.push(3.0);
            trunk.push(points.len() - 1);
        }

        let mut lines = vec![trunk];
        for (lateral, branch_radii) in [(-0.6, &ica_radii[..]), (0.6, &eca_radii[..])] {
            let mut branch = vec![0];
            for (i, &r) in branch_radii.iter().enumerate() {
                let t = (i + 1) as f64;
                points.push(Point3D::new(0.0, lateral * t, 0.8 * t));
                radii.push(r);
                branch.push(points.len() - 1);
            }
            branch.reverse();
            lines.push(branch);
        }
        Skeleton::new(points, radii, lines).unwrap()
    }

    #[test]
    fn test_locate_on_tapering_branches() {
        let skeleton = tapering_y_skeleton();
        let analysis = CenterlineAnalysis::analyze(&skeleton, &AxisPolicy::default()).unwrap();
        let set = LandmarkSet::locate(&skeleton, &analysis, &LandmarkConfig::default()).unwrap();

        // Trunk ids 1..=12, ica ids 13..=27, eca ids 28..=41
        // cca: forward from position 11, flat radius matches at once
        assert_eq!(set.clip(BranchTag::Cca).point.id, 11);
        // ica: backward from position 10 (1.5); 1.6 is already within 10%
        assert_eq!(set.clip(BranchTag::Ica).point.id, 21);
        // eca: backward from position 9 (0.45); steps down to 1.8 before 1.85 matches
        assert_eq!(set.clip(BranchTag::Eca).point.id, 31);

        assert!((set.clip(BranchTag::Cca).direction - Vector3D::z()).norm() < 1e-12);
        let ica_direction = Vector3D::new(0.0, 0.6, -0.8);
        let eca_direction = Vector3D::new(0.0, -0.6, -0.8);
        assert!((set.clip(BranchTag::Ica).direction - ica_direction).norm() < 1e-12);
        assert!((set.clip(BranchTag::Eca).direction - eca_direction).norm() < 1e-12);
        for tag in BranchTag::ALL {
            assert!((set.clip(tag).direction.norm() - 1.0).abs() < 1e-12);
        }

        let cut_ids = |tag| set.cuts(tag).map(|l| l.point.id).collect::<Vec<_>>();
        assert_eq!(cut_ids(BranchTag::Cca), vec![2, 4, 7, 9]);
        assert_eq!(cut_ids(BranchTag::Ica), vec![14, 16, 17, 19]);
        assert_eq!(cut_ids(BranchTag::Eca), vec![28, 29, 29, 30]);
        assert!(set
            .cuts(BranchTag::Ica)
            .all(|l| (l.direction - ica_direction).norm() < 1e-12));
    }

    #[test]
    fn test_disable_cut_landmarks() {
        let skeleton = crate::centerline::tests::y_skeleton(30);
        let analysis = CenterlineAnalysis::analyze(&skeleton, &AxisPolicy::default()).unwrap();
        let mut set = LandmarkSet::locate(&skeleton, &analysis, &LandmarkConfig::default()).unwrap();

        set.disable(&[LandmarkKey::cut(BranchTag::Ica, 2)]).unwrap();
        assert_eq!(set.enabled_cuts().count(), 3 * (CUT_INTERVALS - 1) - 1);
        assert!(!set.get(&LandmarkKey::cut(BranchTag::Ica, 2)).unwrap().enabled);

        assert!(set.disable(&[LandmarkKey::clip(BranchTag::Cca)]).is_err());
        assert!(set.disable(&[LandmarkKey::cut(BranchTag::Eca, 9)]).is_err());
        assert_eq!(LandmarkKey::cut(BranchTag::Eca, 3).to_string(), "eca3");
    }
}
