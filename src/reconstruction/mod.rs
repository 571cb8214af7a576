pub mod grid;
pub mod ray;
pub mod sart;
pub mod volume;

pub use grid::Grid;
pub use ray::{forward_project, ray_update, ray_weights, RayPayload, RayResult};
pub use sart::{reduce_unit, Accumulators, Sart, SartOptions, SliceReconstruction};
pub use volume::Projections;
