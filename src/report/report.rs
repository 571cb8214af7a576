use async_trait::async_trait;
use image::{GrayImage, ImageFormat};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::ReportError;
use crate::interface::{ReporterTraits, SliceReport};
use crate::reconstruction::Grid;

const ESTIMATE_PREFIX: &str = "sart";
const SINOGRAM_PREFIX: &str = "sinogram";
const RECORD_PREFIX: &str = "reco";

#[derive(Debug, Clone)]
pub struct Options {
    pub output_dir: PathBuf,
    pub write_sinogram: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            write_sinogram: true,
        }
    }
}

/// Serialized estimate written next to each rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionRecord {
    pub slice: usize,
    pub iteration: Option<usize>,
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f64>,
}

/// Writes `sart_<slice>.png`, `reco_<slice>.msgpack` and, at the start of a
/// slice, `sinogram_<slice>.png`. Later reports overwrite earlier ones.
#[derive(Debug, Clone)]
pub struct FileReporter {
    opts: Options,
}

impl FileReporter {
    pub fn new(opts: Options) -> Self {
        FileReporter { opts }
    }

    pub fn output_dir(&self) -> &Path {
        &self.opts.output_dir
    }

    pub fn artifact_path(&self, kind: &str, slice: usize, ext: &str) -> PathBuf {
        self.opts.output_dir.join(format!("{}_{}.{}", kind, slice, ext))
    }
}

#[async_trait]
impl ReporterTraits for FileReporter {
    async fn publish(&self, report: &SliceReport<'_>) -> Result<(), ReportError> {
        tokio::fs::create_dir_all(&self.opts.output_dir).await?;

        let png = render_png(&central_square(report.estimate))?;
        tokio::fs::write(self.artifact_path(ESTIMATE_PREFIX, report.slice, "png"), png).await?;

        let record = ReconstructionRecord {
            slice: report.slice,
            iteration: report.iteration,
            rows: report.estimate.rows(),
            cols: report.estimate.cols(),
            data: report.estimate.as_slice().to_vec(),
        };
        let encoded = rmp_serde::to_vec_named(&record)?;
        tokio::fs::write(self.artifact_path(RECORD_PREFIX, report.slice, "msgpack"), encoded).await?;

        if report.iteration.is_none() && self.opts.write_sinogram {
            let png = render_png(report.sinogram)?;
            tokio::fs::write(self.artifact_path(SINOGRAM_PREFIX, report.slice, "png"), png).await?;
        }

        debug!(slice = report.slice, iteration = ?report.iteration, "Artifacts written");
        Ok(())
    }
}

/// The square inscribed in the reconstruction circle, centred on the grid.
pub fn central_square(grid: &Grid) -> Grid {
    let n = grid.rows().min(grid.cols());
    let extent = ((n as f64 / std::f64::consts::SQRT_2).floor() / 2.0).floor() as usize;
    if extent == 0 {
        return grid.clone();
    }
    let start = (n / 2).saturating_sub(extent);
    grid.crop(start, start, 2 * extent, 2 * extent)
}

/// Min/max-normalised 8-bit grayscale PNG.
pub fn render_png(grid: &Grid) -> Result<Vec<u8>, ReportError> {
    let empty = ReportError::EmptyImage {
        rows: grid.rows(),
        cols: grid.cols(),
    };
    let (lo, hi) = grid.min_max().ok_or(empty)?;
    let span = hi - lo;

    let pixels = grid
        .as_slice()
        .iter()
        .map(|v| {
            if span > 0.0 && span.is_finite() {
                (((v - lo) / span) * 255.0).round().clamp(0.0, 255.0) as u8
            } else {
                0
            }
        })
        .collect();

    let image = GrayImage::from_raw(grid.cols() as u32, grid.rows() as u32, pixels).ok_or(
        ReportError::EmptyImage {
            rows: grid.rows(),
            cols: grid.cols(),
        },
    )?;

    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn central_square_of_sixteen() {
        // floor(16 / sqrt 2) = 11, extent 5 -> rows 3..13
        let mut g = Grid::square(16);
        g[(3, 3)] = 1.0;
        g[(2, 2)] = 9.0;
        let c = central_square(&g);
        assert_eq!((c.rows(), c.cols()), (10, 10));
        assert_eq!(c[(0, 0)], 1.0);
    }

    #[test]
    fn tiny_grids_are_kept_whole() {
        let g = Grid::square(1);
        assert_eq!(central_square(&g), g);
    }

    #[test]
    fn renders_valid_png() {
        let g = Grid::from_vec(2, 3, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        let png = render_png(&g).unwrap();
        let decoded = image::load_from_memory(&png).unwrap().to_luma8();
        assert_eq!(decoded.dimensions(), (3, 2));
        assert_eq!(decoded.get_pixel(0, 0).0[0], 0);
        assert_eq!(decoded.get_pixel(2, 1).0[0], 255);
    }

    #[test]
    fn empty_grid_is_an_error() {
        assert!(render_png(&Grid::zeros(0, 0)).is_err());
    }
}
