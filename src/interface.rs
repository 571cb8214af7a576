use async_trait::async_trait;

use crate::error::ReportError;
use crate::reconstruction::Grid;

/// State handed to a reporter at the start of a slice (`iteration` is
/// `None`) and after every completed iteration.
#[derive(Debug, Clone, Copy)]
pub struct SliceReport<'a> {
    pub slice: usize,
    pub iteration: Option<usize>,
    pub estimate: &'a Grid,
    pub sinogram: &'a Grid,
}

// Define the Reporter trait
#[async_trait]
pub trait ReporterTraits: Send + Sync {
    async fn publish(&self, report: &SliceReport<'_>) -> Result<(), ReportError>;
}

/// Reporter that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

#[async_trait]
impl ReporterTraits for NullReporter {
    async fn publish(&self, _report: &SliceReport<'_>) -> Result<(), ReportError> {
        Ok(())
    }
}
