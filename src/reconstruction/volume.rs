use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use super::grid::Grid;
use crate::error::ReconstructionError;

/// Measured projections indexed `[angle, x, y]`, with the projection angle
/// in degrees for each leading index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projections {
    pub angles: Vec<f64>,
    pub shape: [usize; 3],
    pub data: Vec<f64>,
}

impl Projections {
    pub fn new(angles: Vec<f64>, shape: [usize; 3], data: Vec<f64>) -> Result<Self, ReconstructionError> {
        let projections = Projections { angles, shape, data };
        projections.validate()?;
        Ok(projections)
    }

    /// Builds a single-slice volume from a sinogram of `angles.len()` rows.
    pub fn from_sinogram(angles: Vec<f64>, sinogram: &Grid) -> Result<Self, ReconstructionError> {
        let shape = [sinogram.rows(), 1, sinogram.cols()];
        Self::new(angles, shape, sinogram.as_slice().to_vec())
    }

    pub fn validate(&self) -> Result<(), ReconstructionError> {
        let [n_proj, nx, ny] = self.shape;
        if self.angles.len() != n_proj {
            return Err(ReconstructionError::InvalidInput(format!(
                "{} angles for {} projections",
                self.angles.len(),
                n_proj
            )));
        }
        let needed = n_proj
            .checked_mul(nx)
            .and_then(|n| n.checked_mul(ny))
            .ok_or_else(|| {
                ReconstructionError::InvalidInput(format!("shape {:?} is too large", self.shape))
            })?;
        if self.data.len() != needed {
            return Err(ReconstructionError::InvalidInput(format!(
                "volume holds {} values, shape {:?} needs {}",
                self.data.len(),
                self.shape,
                needed
            )));
        }
        if n_proj == 0 || nx == 0 || ny == 0 {
            return Err(ReconstructionError::InvalidInput(format!(
                "empty volume of shape {:?}",
                self.shape
            )));
        }
        Ok(())
    }

    pub fn n_proj(&self) -> usize {
        self.shape[0]
    }

    pub fn nx(&self) -> usize {
        self.shape[1]
    }

    pub fn ny(&self) -> usize {
        self.shape[2]
    }

    /// The `[angle, y]` plane at detector row `slice`.
    pub fn sinogram(&self, slice: usize) -> Grid {
        let [n_proj, nx, ny] = self.shape;
        let mut sinogram = Grid::zeros(n_proj, ny);
        for a in 0..n_proj {
            let start = (a * nx + slice) * ny;
            for y in 0..ny {
                sinogram[(a, y)] = self.data[start + y];
            }
        }
        sinogram
    }

    /// Reads a volume from `.json` or `.msgpack`.
    pub async fn load(path: &Path) -> Result<Self, ReconstructionError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            ReconstructionError::InvalidInput(format!("cannot read {}: {}", path.display(), e))
        })?;

        let projections: Projections = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_slice(&bytes)
                .map_err(|e| ReconstructionError::InvalidInput(e.to_string()))?,
            Some("msgpack") | Some("mpk") => rmp_serde::from_slice(&bytes)
                .map_err(|e| ReconstructionError::InvalidInput(e.to_string()))?,
            other => {
                return Err(ReconstructionError::InvalidInput(format!(
                    "unsupported input extension {:?}, expected json or msgpack",
                    other
                )))
            }
        };

        projections.validate()?;
        debug!(path = %path.display(), shape = ?projections.shape, "Loaded projections");
        Ok(projections)
    }
}
