// Example: run both sides of a synthetic carotid through the full pipeline

#[path = "../tests/common/mod.rs"]
mod common;

use carotid_flow::session::WorkerEvent;
use carotid_flow::*;
use std::path::PathBuf;

fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    log::info!("Carotid Flow - Synthetic Bifurcation");
    log::info!("====================================\n");

    let output_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("carotid_output"));
    let total_steps = 8;

    // Step 1: Geometry
    log::info!("Step 1: Building vessel surface and centerlines");
    let surface = common::vessel_surface();
    log::info!("  Surface: {} faces, area {:.2} mm²\n", surface.num_faces(), surface.area());

    // Step 2: Landmarks, planes and clipping
    log::info!("Step 2: Preparing both sides");
    let config = common::config();
    std::fs::create_dir_all(&output_dir)?;
    config.to_json_file(output_dir.join("config.json"))?;
    let mut session = Session::new(config)?;
    for side in Side::ALL {
        let prepared = session.prepare_side(side, &surface, &common::skeleton(side))?;
        log::info!("  {}: {} patches\n", side, prepared.planes().len());
    }

    // Step 3: Time-resolved flow volumes in the scanner frame
    log::info!("Step 3: Generating {} flow volumes", total_steps);
    let volumes: Vec<VolumeMesh> = (0..total_steps)
        .map(|step| common::scanner_volume(common::amplitude(step, total_steps)))
        .collect();

    // Step 4: Registration and reconciliation in the background
    log::info!("Step 4: Processing time steps");
    let worker = VolumeProcessingWorker::spawn(session, Side::ALL.to_vec(), volumes);
    for event in worker.events().iter() {
        match event {
            WorkerEvent::StepCompleted { side, step } => log::info!(
                "  {} step {}: ica {:.4}, eca {:.4}, cca constant {:.4}",
                side,
                step.step,
                step.ica,
                step.eca,
                step.cca_constant
            ),
            WorkerEvent::StepFailed { side, step, error } => {
                log::warn!("  {} step {} failed: {}", side, step, error)
            }
            WorkerEvent::Finished => break,
            _ => {}
        }
    }
    let session = worker.join()?;

    // Step 5: Outputs
    log::info!("\nStep 5: Writing outputs to {:?}", output_dir);
    for side in Side::ALL {
        if let Some(side_session) = session.side(side) {
            let written = side_session.write_outputs(&output_dir, session.config())?;
            log::info!("  {}: {} files", side, written.len());
        }
    }

    log::info!("✓ Done");
    Ok(())
}
