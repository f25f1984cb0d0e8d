// Synthetic two-sided carotid: square-section voxel vessels shaped like a T
#![allow(dead_code)]

use carotid_flow::{PipelineConfig, Point3D, Side, Skeleton, SurfaceMesh, Vector3D, VolumeMesh};
use nalgebra::{Matrix4, Rotation3, Unit, Vector3};
use std::collections::BTreeSet;

/// Skeleton radius of every sample; vessels are 2 mm wide
pub const RADIUS: f64 = 1.2;

/// Lateral position (mm) of each side's vessel
pub fn side_offset(side: Side) -> i64 {
    match side {
        Side::Left => 20,
        Side::Right => -20,
    }
}

/// Trunk along -Z down to z = -12, ICA along -Y to y = -15, ECA along +Y to
/// y = 13. Cells are 1 mm cubes indexed by their minimum corner.
pub fn vessel_cells(side: Side) -> Vec<[i64; 3]> {
    let ox = side_offset(side);
    let mut cells = BTreeSet::new();
    for x in [ox - 1, ox] {
        for y in [-1, 0] {
            for z in -12..=0 {
                cells.insert([x, y, z]);
            }
        }
        for z in [-1, 0] {
            for y in -15..=-2 {
                cells.insert([x, y, z]);
            }
            for y in 1..=12 {
                cells.insert([x, y, z]);
            }
        }
    }
    cells.into_iter().collect()
}

fn all_cells() -> Vec<[i64; 3]> {
    Side::ALL.iter().flat_map(|&side| vessel_cells(side)).collect()
}

/// Plug flow: 2a up the trunk, a into the ICA, a/2 into the ECA, still junction
pub fn flow_at(p: &Point3D, amplitude: f64) -> Vector3D {
    let eps = 1e-9;
    if p.y <= -1.0 + eps && p.z >= -1.0 - eps {
        Vector3D::new(0.0, -amplitude, 0.0)
    } else if p.y >= 1.0 - eps && p.z >= -1.0 - eps {
        Vector3D::new(0.0, 0.5 * amplitude, 0.0)
    } else if p.z <= -1.0 + eps {
        Vector3D::new(0.0, 0.0, 2.0 * amplitude)
    } else {
        Vector3D::zeros()
    }
}

/// Pulsatile amplitude of a time step
pub fn amplitude(step: usize, total: usize) -> f64 {
    1.0 + 0.5 * (std::f64::consts::TAU * step as f64 / total as f64).sin()
}

/// Both vessels in the surface frame (mm)
pub fn anatomy_volume(amplitude: f64) -> VolumeMesh {
    VolumeMesh::from_voxels(&all_cells(), 1.0).with_flow_field(|p| flow_at(p, amplitude))
}

pub fn vessel_surface() -> SurfaceMesh {
    anatomy_volume(1.0).boundary_surface()
}

/// Scanner pose of the anatomy: a small tilt, a quarter turn about Z, a shift
pub fn scanner_from_anatomy() -> Matrix4<f64> {
    let tilt = Rotation3::from_axis_angle(
        &Unit::new_normalize(Vector3::new(1.0, 2.0, 3.0)),
        1.5_f64.to_radians(),
    );
    let quarter = Rotation3::from_axis_angle(&Vector3::z_axis(), std::f64::consts::FRAC_PI_2);
    Matrix4::new_translation(&Vector3::new(3.0, -2.0, 5.0)) * quarter.to_homogeneous() * tilt.to_homogeneous()
}

pub fn scanner_volume(amplitude: f64) -> VolumeMesh {
    anatomy_volume(amplitude).transformed(&scanner_from_anatomy())
}

/// Undoes the quarter turn so each vessel lands in the half its side expects
pub fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.registration.precondition_rotation = [[0.0, 1.0, 0.0], [-1.0, 0.0, 0.0], [0.0, 0.0, 1.0]];
    config
}

/// Centerline through the middle of one side's vessel
pub fn skeleton(side: Side) -> Skeleton {
    let x = side_offset(side) as f64;
    let mut points = vec![Point3D::new(x, 0.0, 0.0)];
    let mut lines = Vec::new();

    let mut trunk = vec![0];
    for i in 1..=12 {
        points.push(Point3D::new(x, 0.0, 0.5 - i as f64));
        trunk.push(points.len() - 1);
    }
    lines.push(trunk);

    let mut ica = vec![0];
    for i in 1..=14 {
        points.push(Point3D::new(x, 0.5 - i as f64, 0.0));
        ica.push(points.len() - 1);
    }
    lines.push(ica);

    // Stored endpoint first
    let mut eca = vec![0];
    for i in 1..=12 {
        points.push(Point3D::new(x, i as f64 - 0.5, 0.0));
        eca.push(points.len() - 1);
    }
    eca.reverse();
    lines.push(eca);

    let radii = vec![RADIUS; points.len()];
    Skeleton::new(points, radii, lines).expect("valid skeleton")
}
