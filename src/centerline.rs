// Centerline topology: bifurcation, labeled endpoints and oriented branches
//
// The skeleton is a curve network extracted from the vessel surface. In a
// carotid bifurcation exactly one point is shared by three polylines; the
// three remaining free ends are the inflow (common carotid) and the two
// outflow branches (internal and external carotid).

use crate::geometry::{Axis, Point3D};
use crate::spatial_grid::{NearestPointQuery, PointLocator};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Anatomical branch label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BranchTag {
    /// Common carotid artery (inflow)
    Cca,
    /// Internal carotid artery
    Ica,
    /// External carotid artery
    Eca,
}

impl BranchTag {
    /// Processing order used throughout the pipeline
    pub const ALL: [BranchTag; 3] = [BranchTag::Cca, BranchTag::Ica, BranchTag::Eca];

    pub fn name(&self) -> &'static str {
        match self {
            BranchTag::Cca => "cca",
            BranchTag::Ica => "ica",
            BranchTag::Eca => "eca",
        }
    }

    pub fn is_inflow(&self) -> bool {
        matches!(self, BranchTag::Cca)
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            BranchTag::Cca => 0,
            BranchTag::Ica => 1,
            BranchTag::Eca => 2,
        }
    }
}

impl fmt::Display for BranchTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which coordinate axes carry anatomical meaning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisPolicy {
    /// Lowest endpoint along this axis is the inflow branch
    pub elevation: Axis,
    /// Of the two outflow endpoints, the lower one along this axis is the ICA
    pub lateral: Axis,
}

impl Default for AxisPolicy {
    fn default() -> Self {
        Self {
            elevation: Axis::Z,
            lateral: Axis::Y,
        }
    }
}

/// A sample of the skeleton
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CenterlinePoint {
    /// Index into the skeleton's coordinate array
    pub id: usize,
    pub position: Point3D,
    /// Maximal inscribed sphere radius
    pub radius: f64,
    pub branch: Option<BranchTag>,
    pub critical: Option<bool>,
}

/// Curve network with a radius per point
#[derive(Debug, Clone)]
pub struct Skeleton {
    points: Vec<Point3D>,
    radii: Vec<f64>,
    lines: Vec<Vec<usize>>,
}

impl Skeleton {
    pub fn new(points: Vec<Point3D>, radii: Vec<f64>, lines: Vec<Vec<usize>>) -> Result<Self> {
        if points.len() != radii.len() {
            return Err(Error::Topology(format!(
                "skeleton has {} points but {} radii",
                points.len(),
                radii.len()
            )));
        }
        for (li, line) in lines.iter().enumerate() {
            if let Some(&bad) = line.iter().find(|&&id| id >= points.len()) {
                return Err(Error::Topology(format!(
                    "polyline {} references point {} of {}",
                    li,
                    bad,
                    points.len()
                )));
            }
        }
        Ok(Self { points, radii, lines })
    }

    pub fn points(&self) -> &[Point3D] {
        &self.points
    }

    pub fn radii(&self) -> &[f64] {
        &self.radii
    }

    pub fn lines(&self) -> &[Vec<usize>] {
        &self.lines
    }

    pub fn radius(&self, id: usize) -> f64 {
        self.radii[id]
    }

    pub fn position(&self, id: usize) -> Point3D {
        self.points[id]
    }

    pub fn point(&self, id: usize) -> CenterlinePoint {
        CenterlinePoint {
            id,
            position: self.points[id],
            radius: self.radii[id],
            branch: None,
            critical: None,
        }
    }

    /// Id of the skeleton point closest to a coordinate
    pub fn locate(&self, coordinate: &Point3D) -> Option<usize> {
        PointLocator::new(self.points.clone()).nearest(coordinate)
    }
}

/// Output of the topology analysis
#[derive(Debug, Clone)]
pub struct CenterlineAnalysis {
    pub bifurcation: CenterlinePoint,
    endpoints: [CenterlinePoint; 3],
    /// Oriented id sequences bifurcation → endpoint, indexed like `BranchTag::ALL`
    branches: [Vec<usize>; 3],
}

impl CenterlineAnalysis {
    /// Find the bifurcation, label the three endpoints and orient each branch
    pub fn analyze(skeleton: &Skeleton, policy: &AxisPolicy) -> Result<Self> {
        log::info!("=== Centerline Analysis ===");
        log::info!(
            "  Skeleton: {} points, {} polylines",
            skeleton.points.len(),
            skeleton.lines.len()
        );

        let bifurcation_id = find_bifurcation(skeleton)?;
        let mut bifurcation = skeleton.point(bifurcation_id);
        bifurcation.critical = Some(true);
        log::info!(
            "  Bifurcation point: id {} at ({:.3}, {:.3}, {:.3})",
            bifurcation_id,
            bifurcation.position.x,
            bifurcation.position.y,
            bifurcation.position.z
        );

        let free_ends = find_endpoints(skeleton, bifurcation_id)?;
        let labeled = label_endpoints(skeleton, &free_ends, policy);

        let mut endpoints = [bifurcation; 3];
        let mut branches: [Vec<usize>; 3] = Default::default();
        for (tag, end_id) in labeled {
            let mut point = skeleton.point(end_id);
            point.branch = Some(tag);
            endpoints[tag.index()] = point;

            let line = skeleton
                .lines
                .iter()
                .find_map(|line| label_line_segment(line, bifurcation_id, end_id))
                .ok_or_else(|| {
                    Error::Topology(format!("{} line not found", tag.name().to_uppercase()))
                })?;
            log::info!(
                "  {} endpoint: id {} (radius {:.3}), branch of {} points",
                tag,
                end_id,
                point.radius,
                line.len()
            );
            branches[tag.index()] = line;
        }

        Ok(Self {
            bifurcation,
            endpoints,
            branches,
        })
    }

    pub fn endpoint(&self, tag: BranchTag) -> &CenterlinePoint {
        &self.endpoints[tag.index()]
    }

    /// Oriented id sequence from the bifurcation to the branch endpoint
    pub fn branch_line(&self, tag: BranchTag) -> &[usize] {
        &self.branches[tag.index()]
    }

    /// The three branches as standalone labeled polylines
    pub fn split_lines(&self) -> Vec<(BranchTag, Vec<usize>)> {
        BranchTag::ALL
            .iter()
            .map(|&tag| (tag, self.branches[tag.index()].clone()))
            .collect()
    }

    /// Skeleton holding only the three branches, renumbered so the
    /// bifurcation is point 0 and each branch follows in order
    pub fn split_skeleton(&self, skeleton: &Skeleton) -> Result<(Skeleton, Vec<BranchTag>)> {
        let mut remap: HashMap<usize, usize> = HashMap::new();
        let mut points = Vec::new();
        let mut radii = Vec::new();
        let mut lines = Vec::with_capacity(3);
        let mut tags = Vec::with_capacity(3);

        for (tag, line) in self.split_lines() {
            let renumbered: Vec<usize> = line
                .iter()
                .map(|&old| {
                    *remap.entry(old).or_insert_with(|| {
                        points.push(skeleton.position(old));
                        radii.push(skeleton.radius(old));
                        points.len() - 1
                    })
                })
                .collect();
            lines.push(renumbered);
            tags.push(tag);
        }

        Ok((Skeleton::new(points, radii, lines)?, tags))
    }
}

/// Point shared by exactly three polylines
fn find_bifurcation(skeleton: &Skeleton) -> Result<usize> {
    // Polylines per point; a line revisiting a point counts once
    let mut usage: BTreeMap<usize, usize> = BTreeMap::new();
    for line in &skeleton.lines {
        let distinct: BTreeSet<usize> = line.iter().copied().collect();
        for id in distinct {
            *usage.entry(id).or_insert(0) += 1;
        }
    }

    let candidates: Vec<usize> = usage
        .into_iter()
        .filter(|&(_, count)| count == 3)
        .map(|(id, _)| id)
        .collect();

    match candidates.as_slice() {
        [] => Err(Error::Topology("no point is shared by exactly 3 polylines".to_string())),
        [id] => Ok(*id),
        many => Err(Error::Topology(format!(
            "ambiguous bifurcation: {} candidate points {:?}",
            many.len(),
            many
        ))),
    }
}

/// Deduplicated polyline ends other than the bifurcation
fn find_endpoints(skeleton: &Skeleton, bifurcation_id: usize) -> Result<Vec<usize>> {
    let mut ends: Vec<usize> = skeleton
        .lines
        .iter()
        .filter(|line| !line.is_empty())
        .flat_map(|line| [line[0], line[line.len() - 1]])
        .filter(|&id| id != bifurcation_id)
        .collect();
    ends.sort_unstable();
    ends.dedup();

    if ends.len() != 3 {
        return Err(Error::Topology(format!(
            "expected exactly 3 endpoints, found {}",
            ends.len()
        )));
    }
    Ok(ends)
}

fn label_endpoints(skeleton: &Skeleton, ends: &[usize], policy: &AxisPolicy) -> [(BranchTag, usize); 3] {
    let elevation = |id: usize| policy.elevation.component(&skeleton.points[id]);
    let lateral = |id: usize| policy.lateral.component(&skeleton.points[id]);

    let mut by_elevation = ends.to_vec();
    by_elevation.sort_by(|&a, &b| elevation(a).total_cmp(&elevation(b)));
    let cca = by_elevation[0];

    let (first, second) = (by_elevation[1], by_elevation[2]);
    let (ica, eca) = if lateral(first) < lateral(second) {
        (first, second)
    } else {
        (second, first)
    };

    [(BranchTag::Cca, cca), (BranchTag::Ica, ica), (BranchTag::Eca, eca)]
}

/// Slice of `line` between the bifurcation and an endpoint, oriented
/// bifurcation → endpoint. None when either id is missing from the line.
pub fn label_line_segment(line: &[usize], bifurcation_id: usize, end_id: usize) -> Option<Vec<usize>> {
    let bifurcation_idx = line.iter().position(|&id| id == bifurcation_id)?;
    let end_idx = line.iter().position(|&id| id == end_id)?;

    if bifurcation_idx <= end_idx {
        Some(line[bifurcation_idx..=end_idx].to_vec())
    } else {
        Some(line[end_idx..=bifurcation_idx].iter().rev().copied().collect())
    }
}
