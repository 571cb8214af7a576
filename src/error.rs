//! Error types for the task farm and the reconstruction built on it

use std::time::Duration;
use thiserror::Error;

use crate::jobs::WorkerFault;

/// Boxed error returned by worker functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Task farm errors
#[derive(Error, Debug)]
pub enum FarmError {
    #[error("Failed to spawn worker {worker}: {reason}")]
    Spawn { worker: usize, reason: String },

    #[error("Invalid farm configuration: {0}")]
    InvalidConfig(String),

    #[error("Worker fault: {0}")]
    WorkerFault(WorkerFault),

    #[error("Accounting violation: {0}")]
    AccountingViolation(&'static str),

    #[error("Timed out after {waited:?} during {stage}: expected {expected}, observed {observed}")]
    Timeout {
        stage: &'static str,
        waited: Duration,
        expected: usize,
        observed: usize,
    },

    #[error("All workers exited with {received} of {expected} results received")]
    WorkersLost { expected: usize, received: usize },
}

/// Reporter errors
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image encoding error: {0}")]
    Image(#[from] image::ImageError),

    #[error("MessagePack encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Grid of {rows}x{cols} cannot be rendered")]
    EmptyImage { rows: usize, cols: usize },
}

/// Reconstruction errors
#[derive(Error, Debug)]
pub enum ReconstructionError {
    #[error("Slice {slice}, iteration {iteration}, projection {projection}: {source}")]
    Farm {
        slice: usize,
        iteration: usize,
        projection: usize,
        #[source]
        source: FarmError,
    },

    #[error("Task farm error: {0}")]
    Dispatch(#[from] FarmError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Reporting failed for slice {slice}: {source}")]
    Report {
        slice: usize,
        #[source]
        source: ReportError,
    },
}
