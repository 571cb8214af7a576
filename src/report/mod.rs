pub mod report; // Exposes the `report.rs` file as a submodule

// Re-export the main components for external use
pub use report::{central_square, render_png, FileReporter, Options, ReconstructionRecord};
