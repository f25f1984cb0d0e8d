// Core modules for carotid landmark extraction and flow reconciliation
pub mod geometry;
pub mod mesh;
pub mod volume;
pub mod spatial_grid;
pub mod config;
pub mod centerline;
pub mod landmarks;
pub mod clipping;
pub mod flux;
pub mod registration;
pub mod flow_balance;
pub mod session;

// Re-export commonly used types
pub use geometry::{Axis, BoundedPatch, Plane, Point3D, Triangle, Vector3D};
pub use mesh::{MeshError, SurfaceMesh};
pub use volume::VolumeMesh;
pub use config::PipelineConfig;
pub use centerline::{BranchTag, CenterlineAnalysis, Skeleton};
pub use landmarks::{LandmarkKey, LandmarkSet};
pub use registration::{RegistrationTransform, RigidRegistrationSolver};
pub use flow_balance::{FlowBalancer, FlowRateTable, FlowSeries};
pub use session::{Session, Side, VolumeProcessingWorker};

/// Main result type for the pipeline
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the pipeline
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Mesh error: {0}")]
    Mesh(#[from] MeshError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Geometry error in {operation}: {details}")]
    Geometry { operation: String, details: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Landmark not found: {0}")]
    NotFound(String),

    #[error("Branch {branch} too short for cut sampling: {length} points, need at least {required}")]
    BranchTooShort {
        branch: String,
        length: usize,
        required: usize,
    },

    #[error("Flow balance error: {0}")]
    FlowBalance(String),

    #[error("Side {0} already has a frozen registration transform")]
    AlreadyRegistered(String),

    #[error("Side {0} has no registration transform yet")]
    NotRegistered(String),

    #[error("Side {side} registration failed and is not retried: {details}")]
    RegistrationFailed { side: String, details: String },
}

impl Error {
    /// Geometry failure, logged before it is returned
    pub fn geometry(operation: impl Into<String>, details: impl Into<String>) -> Self {
        let operation = operation.into();
        let details = details.into();
        log::error!("{} failed: {}", operation, details);
        Error::Geometry { operation, details }
    }
}
