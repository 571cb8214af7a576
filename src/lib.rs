// src/lib.rs

pub mod dispatcher;
pub mod error;
pub mod farm;
pub mod interface;
pub mod jobs;
pub mod logging;
pub mod reconstruction;
pub mod report;

// Re-export key items for easier access
pub use dispatcher::{chunk_ranges, Dispatcher, PoolMode};
pub use error::{BoxError, FarmError, ReconstructionError, ReportError};
pub use farm::{FarmOptions, ShutdownReport, TaskFarm};
pub use interface::{NullReporter, ReporterTraits, SliceReport};
pub use jobs::{Job, JobResult, WorkerFault};
pub use reconstruction::{Grid, Projections, Sart, SartOptions};
