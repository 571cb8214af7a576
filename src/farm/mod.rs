pub mod farm; // Exposes the `farm.rs` file as a submodule
pub mod worker;

// Re-export the main components for external use
pub use farm::{FarmOptions, ShutdownReport, TaskFarm, WorkerHandle};
pub use worker::{WorkerExit, WorkerFn};
