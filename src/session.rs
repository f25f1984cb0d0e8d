// Per-side processing state and the background time-step worker

use crate::centerline::{BranchTag, CenterlineAnalysis, Skeleton};
use crate::clipping::{flow_orientation, ClippedSurface, GeometricClipper, PlaneSet};
use crate::config::PipelineConfig;
use crate::flow_balance::{scaled_inflow_velocities, BalancedStep, FlowBalancer, FlowRateTable, FlowSeries};
use crate::flux::CrossSection;
use crate::geometry::Vector3D;
use crate::landmarks::{LandmarkKey, LandmarkSet};
use crate::mesh::SurfaceMesh;
use crate::registration::{RegistrationTransform, RigidRegistrationSolver};
use crate::volume::VolumeMesh;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::JoinHandle;

/// Patient side; each side owns one half of the bisected datasets
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Side {
    /// Positive half along the split axis
    Left,
    /// Negative half along the split axis
    Right,
}

impl Side {
    pub const ALL: [Side; 2] = [Side::Left, Side::Right];

    pub fn name(&self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }

    /// This side's half of a (positive, negative) split
    pub fn pick<T>(&self, halves: (T, T)) -> T {
        match self {
            Side::Left => halves.0,
            Side::Right => halves.1,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Result of one processed time step
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub balanced: BalancedStep,
    /// Flux per enabled cut landmark
    pub fluxes: Vec<(LandmarkKey, f64)>,
    pub measured_inflow: f64,
    /// Inlet velocity profile rescaled by the step's cca constant
    pub inlet_velocities: Vec<Vector3D>,
}

/// Everything one side keeps between time steps
#[derive(Debug, Clone)]
pub struct SideSession {
    side: Side,
    surface: SurfaceMesh,
    landmarks: LandmarkSet,
    planes: PlaneSet,
    clipped: ClippedSurface,
    transform: Option<RegistrationTransform>,
    /// Set once registration has failed; the side is never registered again
    registration_failure: Option<String>,
    target_domain: Option<VolumeMesh>,
    inlet: Option<SurfaceMesh>,
    table: FlowRateTable,
    series: FlowSeries,
}

impl SideSession {
    pub fn side(&self) -> Side {
        self.side
    }

    /// This side's half of the vessel surface (registration target)
    pub fn surface(&self) -> &SurfaceMesh {
        &self.surface
    }

    pub fn landmarks(&self) -> &LandmarkSet {
        &self.landmarks
    }

    pub fn planes(&self) -> &PlaneSet {
        &self.planes
    }

    pub fn clipped(&self) -> &ClippedSurface {
        &self.clipped
    }

    pub fn transform(&self) -> Option<&RegistrationTransform> {
        self.transform.as_ref()
    }

    pub fn registration_failure(&self) -> Option<&str> {
        self.registration_failure.as_deref()
    }

    /// Transform ready, or the reason the side cannot be processed
    fn frozen_transform(&self) -> Result<RegistrationTransform> {
        if let Some(details) = &self.registration_failure {
            return Err(Error::RegistrationFailed {
                side: self.side.to_string(),
                details: details.clone(),
            });
        }
        self.transform
            .ok_or_else(|| Error::NotRegistered(self.side.to_string()))
    }

    pub fn series(&self) -> &FlowSeries {
        &self.series
    }

    /// Samples of the step in progress; empty between steps
    pub fn table(&self) -> &FlowRateTable {
        &self.table
    }

    /// Freeze an externally computed transform
    pub fn freeze_transform(&mut self, transform: RegistrationTransform) -> Result<()> {
        if self.transform.is_some() {
            return Err(Error::AlreadyRegistered(self.side.to_string()));
        }
        self.transform = Some(transform);
        Ok(())
    }

    pub fn set_target_domain(&mut self, domain: VolumeMesh) {
        self.target_domain = Some(domain);
    }

    pub fn set_inlet_surface(&mut self, inlet: SurfaceMesh) {
        self.inlet = Some(inlet);
    }

    /// Patches, clipped surfaces, transform and series under `dir`
    pub fn write_outputs(&self, dir: &Path, config: &PipelineConfig) -> Result<Vec<PathBuf>> {
        let dir = dir.join(self.side.name());
        let mut written = self.planes.write_stl(&dir.join("planes"))?;
        written.extend(self.clipped.write_stl(&dir)?);

        if let Some(transform) = &self.transform {
            let path = dir.join("transform.txt");
            transform.write_text(&path)?;
            written.push(path);
        }

        let path = dir.join("flow_series.json");
        self.series.to_json_file(&path)?;
        written.push(path);

        for tag in [BranchTag::Ica, BranchTag::Eca] {
            let path = dir.join(format!("{}_outlet.txt", tag));
            self.series
                .write_boundary_table(&path, tag, 3, config.session.time_step_duration)?;
            written.push(path);
        }
        Ok(written)
    }
}

/// Both sides of one patient, sharing the configuration
#[derive(Debug, Clone)]
pub struct Session {
    config: PipelineConfig,
    clipper: GeometricClipper,
    sides: BTreeMap<Side, SideSession>,
}

impl Session {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            clipper: GeometricClipper::new(&config),
            config,
            sides: BTreeMap::new(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn side(&self, side: Side) -> Option<&SideSession> {
        self.sides.get(&side)
    }

    pub fn side_mut(&mut self, side: Side) -> Result<&mut SideSession> {
        self.sides
            .get_mut(&side)
            .ok_or_else(|| Error::NotFound(format!("{} side has not been prepared", side)))
    }

    /// Landmarks, patches and clipped surface of one side.
    ///
    /// `surface` is the combined two-sided vessel surface; `skeleton` is this
    /// side's centerline in the same frame.
    pub fn prepare_side(&mut self, side: Side, surface: &SurfaceMesh, skeleton: &Skeleton) -> Result<&SideSession> {
        log::info!("=== Preparing {} side ===", side);

        let half = side.pick(
            self.clipper
                .bisect_surface(surface, self.config.session.surface_split_axis)?,
        );
        let analysis = CenterlineAnalysis::analyze(skeleton, &self.config.axis_policy)?;
        let landmarks = LandmarkSet::locate(skeleton, &analysis, &self.config.landmarks)?;
        let planes = self.clipper.build_planes(&landmarks);
        let clipped = self.clipper.clip_surface(&half, &landmarks, &planes)?;

        let session = SideSession {
            side,
            surface: half,
            landmarks,
            planes,
            clipped,
            transform: None,
            registration_failure: None,
            target_domain: None,
            inlet: None,
            table: FlowRateTable::new(),
            series: FlowSeries::new(),
        };
        self.sides.insert(side, session);
        self.side(side)
            .ok_or_else(|| Error::NotFound(format!("{} side", side)))
    }

    /// De-select misplaced cut planes before volume processing
    pub fn customize_cut_planes(&mut self, side: Side, disabled: &[LandmarkKey]) -> Result<()> {
        let session = self.side_mut(side)?;
        session.landmarks.disable(disabled)?;
        session.planes.remove(disabled);
        Ok(())
    }

    /// Compute and freeze the side's transform from the reference volume
    pub fn register(&mut self, side: Side, reference: &VolumeMesh) -> Result<RegistrationTransform> {
        let axis = self.config.session.volume_split_axis;
        let clipper = self.clipper.clone();
        let mut solver = RigidRegistrationSolver::new(&self.config.registration);

        let session = self.side_mut(side)?;
        if session.transform.is_some() {
            return Err(Error::AlreadyRegistered(side.to_string()));
        }
        if let Some(details) = &session.registration_failure {
            return Err(Error::RegistrationFailed {
                side: side.to_string(),
                details: details.clone(),
            });
        }

        let result = clipper
            .bisect_volume(reference, axis)
            .and_then(|halves| solver.register(&side.pick(halves), &session.surface));
        match result {
            Ok(transform) => {
                session.transform = Some(transform);
                log::info!("  {} side transform frozen", side);
                Ok(transform)
            }
            Err(e) => {
                log::error!("  {} side registration failed: {}", side, e);
                session.registration_failure = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Mark a side whose reference volume never arrived
    pub fn abandon_registration(&mut self, side: Side, details: impl Into<String>) -> Result<()> {
        let session = self.side_mut(side)?;
        if session.transform.is_none() && session.registration_failure.is_none() {
            session.registration_failure = Some(details.into());
        }
        Ok(())
    }

    /// Cut, integrate and reconcile one time step on one side
    pub fn process_time_step(&mut self, side: Side, step: usize, volume: &VolumeMesh) -> Result<StepOutcome> {
        log::info!("=== {} side, time step {} ===", side, step);

        let axis = self.config.session.volume_split_axis;
        let scale = self.config.session.volume_unit_scale;
        let kernel = self.config.kernel.clone();
        let balancer = FlowBalancer::new(self.config.session.trim_fraction);
        let time = step as f64 * self.config.session.time_step_duration;
        let clipper = self.clipper.clone();

        let session = self.side_mut(side)?;
        if let Some(last) = session.series.steps().last() {
            if step <= last.step {
                return Err(Error::FlowBalance(format!(
                    "{} side already processed step {}",
                    side, last.step
                )));
            }
        }
        let transform = session.frozen_transform()?;
        let half = side.pick(clipper.bisect_volume(volume, axis)?);
        let registered = transform.apply_to_volume(&half);

        // Reference pass in the surface frame
        let reference = clipper.cut_volume(&registered, &session.planes, &session.landmarks, 1.0)?;
        let reference_inflow = clipper.measure_inflow(&registered, &session.planes, &session.landmarks, 1.0)?;

        // Target pass on the simulation domain, flow carried over by the kernel
        let (sections, inflow): (Vec<CrossSection>, CrossSection) = match &session.target_domain {
            Some(domain) => {
                let targets = clipper.cut_volume(domain, &session.planes, &session.landmarks, scale)?;
                let sections = targets
                    .iter()
                    .zip(&reference)
                    .map(|(target, source)| target.resampled_from(&source.scaled(scale), &kernel))
                    .collect();
                let inflow = clipper
                    .measure_inflow(domain, &session.planes, &session.landmarks, scale)?
                    .resampled_from(&reference_inflow.scaled(scale), &kernel);
                (sections, inflow)
            }
            None => (reference, reference_inflow),
        };

        let inlet = match &session.inlet {
            Some(mesh) => {
                let cca = session.landmarks.clip(BranchTag::Cca);
                CrossSection::new(
                    cca.key,
                    mesh.clone(),
                    vec![Vector3D::zeros(); mesh.num_vertices()],
                    flow_orientation(cca),
                )?
                .resampled_from(&inflow, &kernel)
            }
            None => inflow,
        };
        let measured_inflow = inlet.flux();

        session.table.clear();
        for section in &sections {
            session.table.record(section.key, section.flux());
        }
        session.table.set_measured_inflow(measured_inflow);
        let fluxes: Vec<(LandmarkKey, f64)> = sections.iter().map(|s| (s.key, s.flux())).collect();

        let balanced = balancer.reconcile(&session.table);
        session.table.clear();
        let balanced = balanced?;

        let record = BalancedStep {
            step,
            time,
            cca_constant: balanced.cca_constant,
            ica: balanced.ica,
            eca: balanced.eca,
        };
        session.series.push(record)?;

        Ok(StepOutcome {
            balanced: record,
            fluxes,
            measured_inflow,
            inlet_velocities: scaled_inflow_velocities(&inlet.flow, balanced.cca_constant),
        })
    }
}

/// Time-step volumes in step order
pub trait VolumeSource: Send {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn volume(&mut self, step: usize) -> Result<VolumeMesh>;
}

impl VolumeSource for Vec<VolumeMesh> {
    fn len(&self) -> usize {
        <[VolumeMesh]>::len(self)
    }

    fn volume(&mut self, step: usize) -> Result<VolumeMesh> {
        self.get(step)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("volume for time step {}", step)))
    }
}

fn needs_registration(session: &Session, side: Side) -> bool {
    session
        .side(side)
        .map(|s| s.transform().is_none() && s.registration_failure().is_none())
        .unwrap_or(false)
}

/// Progress reported by the background worker
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Started { total_steps: usize },
    Registered { side: Side },
    RegistrationFailed { side: Side, error: String },
    StepCompleted { side: Side, step: BalancedStep },
    StepFailed { side: Side, step: usize, error: String },
    Finished,
}

/// Runs every time step on a background thread; owns the session until joined
pub struct VolumeProcessingWorker {
    handle: JoinHandle<Session>,
    events: mpsc::Receiver<WorkerEvent>,
}

impl VolumeProcessingWorker {
    /// Sides without a frozen transform are registered once, on step 0
    pub fn spawn<S>(mut session: Session, sides: Vec<Side>, mut source: S) -> Self
    where
        S: VolumeSource + 'static,
    {
        let (tx, rx) = mpsc::channel();

        let handle = std::thread::spawn(move || {
            let total = source.len();
            let _ = tx.send(WorkerEvent::Started { total_steps: total });

            for step in 0..total {
                let volume = match source.volume(step) {
                    Ok(volume) => volume,
                    Err(e) => {
                        log::error!("Time step {} unavailable: {}", step, e);
                        for &side in &sides {
                            if step == 0 && needs_registration(&session, side) {
                                let details = format!("reference volume unavailable: {}", e);
                                if session.abandon_registration(side, details.clone()).is_ok() {
                                    let _ = tx.send(WorkerEvent::RegistrationFailed { side, error: details });
                                }
                            }
                            let _ = tx.send(WorkerEvent::StepFailed {
                                side,
                                step,
                                error: e.to_string(),
                            });
                        }
                        continue;
                    }
                };

                for &side in &sides {
                    // Only the first time step is the registration reference
                    if step == 0 && needs_registration(&session, side) {
                        let event = match session.register(side, &volume) {
                            Ok(_) => WorkerEvent::Registered { side },
                            Err(e) => WorkerEvent::RegistrationFailed {
                                side,
                                error: e.to_string(),
                            },
                        };
                        let _ = tx.send(event);
                    }

                    let event = match session.process_time_step(side, step, &volume) {
                        Ok(outcome) => WorkerEvent::StepCompleted {
                            side,
                            step: outcome.balanced,
                        },
                        Err(e) => {
                            log::error!("{} side, step {} failed: {}", side, step, e);
                            WorkerEvent::StepFailed {
                                side,
                                step,
                                error: e.to_string(),
                            }
                        }
                    };
                    let _ = tx.send(event);
                }
            }

            let _ = tx.send(WorkerEvent::Finished);
            session
        });

        Self { handle, events: rx }
    }

    pub fn events(&self) -> &mpsc::Receiver<WorkerEvent> {
        &self.events
    }

    /// Non-blocking poll
    pub fn try_progress(&self) -> Option<WorkerEvent> {
        self.events.try_recv().ok()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the run and take the session back
    pub fn join(self) -> Result<Session> {
        self.handle
            .join()
            .map_err(|_| Error::geometry("volume processing worker", "background thread panicked"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_picks_half() {
        assert_eq!(Side::Left.pick((1, 2)), 1);
        assert_eq!(Side::Right.pick((1, 2)), 2);
        assert_eq!(Side::Right.to_string(), "right");
    }

    #[test]
    fn test_unprepared_side() {
        let mut session = Session::new(PipelineConfig::default()).unwrap();
        assert!(session.side(Side::Left).is_none());
        assert!(matches!(
            session.customize_cut_planes(Side::Left, &[]),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = PipelineConfig::default();
        config.session.trim_fraction = 2.0;
        assert!(matches!(Session::new(config), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_vec_volume_source() {
        let mut source = vec![VolumeMesh::default(), VolumeMesh::default()];
        assert_eq!(VolumeSource::len(&source), 2);
        assert!(source.volume(1).is_ok());
        assert!(matches!(source.volume(2), Err(Error::NotFound(_))));
    }
}
