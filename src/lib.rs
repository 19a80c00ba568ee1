//! Proximity Engine
//!
//! Answers "which tracked entities passed near this point during this window,
//! and how close did they get?" over batched, capped location-history fetches.

pub mod api;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod fetcher;
pub mod filter;
pub mod geo;
pub mod metrics;
pub mod model;
pub mod report;
pub mod source;

pub use config::EngineConfig;
pub use engine::{EngineState, ProximityEngine, RunHandle, RunStatus};
pub use errors::{ProximityError, Result};
pub use model::*;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    /// Hard per-request record cap on location-history calls.
    pub const RECORD_CAP: usize = 50_000;
    /// Entities per batched remote call.
    pub const CHUNK_SIZE: usize = 400;
    pub const UNIT_RADIUS_M: f64 = 250.0;
    /// Concentric bands drawn around the center; the filter radius is the outermost.
    pub const BAND_COUNT: u32 = 5;
    pub const EARTH_RADIUS_M: f64 = 6_371_000.0;
    pub const PROGRESS_CAPACITY: usize = 1024;
    pub const DEFAULT_CENTER: (f64, f64) = (43.434497, -79.709441);
    pub const DEFAULT_ADDR: &str = "0.0.0.0:8081";
}

/// Error types for the proximity engine
pub mod errors {
    pub type Result<T> = std::result::Result<T, ProximityError>;

    #[derive(Debug, Clone, PartialEq, thiserror::Error)]
    pub enum ProximityError {
        #[error("invalid query: {}", .0.join("; "))]
        Validation(Vec<String>),

        #[error("Could not find the address: {0}")]
        AddressNotFound(String),

        #[error("remote call failed: {0}")]
        Transport(String),

        #[error("batched call returned {actual} results for {expected} requests")]
        MisalignedBatch { expected: usize, actual: usize },

        #[error("filter worker failed: {0}")]
        Worker(String),

        #[error("run failed: {0}")]
        RunFailed(String),

        #[error("run controller stopped without reporting a result")]
        RunAborted,

        #[error("run not found: {0}")]
        RunNotFound(uuid::Uuid),
    }

    impl ProximityError {
        pub fn validation(message: impl Into<String>) -> Self {
            Self::Validation(vec![message.into()])
        }
    }
}
