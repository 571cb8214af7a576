//! Ray weighting and the per-chunk update computed by each worker.
//!
//! A ray for detector column `j` is the `n x n` image with column `j` set to
//! one, rotated about the image centre by the projection angle (degrees).
//! Rotation uses bilinear interpolation with zero fill and keeps the shape.

use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;

use super::grid::Grid;
use crate::error::BoxError;

/// Work shipped to a worker for one chunk of detector columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RayPayload {
    pub angle: f64,
    pub row: Vec<f64>,
    pub estimate: Arc<Grid>,
    pub chunk: Range<usize>,
    pub compute_weight: bool,
}

/// Partial update for one chunk, plus the partial ray weight sum when asked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RayResult {
    pub update: Grid,
    pub weight: Option<Grid>,
}

/// Weights of detector column `column` at `angle` degrees on an `n x n` grid.
pub fn ray_weights(n: usize, column: usize, angle: f64) -> Grid {
    let mut wij = Grid::square(n);
    let c = (n as f64 - 1.0) / 2.0;
    let (sin, cos) = angle.to_radians().sin_cos();

    for r in 0..n {
        let y = r as f64 - c;
        for col in 0..n {
            let x = col as f64 - c;
            // Inverse rotation back into the unrotated ray image
            let src_x = cos * x + sin * y + c;
            let src_y = -sin * x + cos * y + c;
            wij[(r, col)] = sample_column(n, column, src_y, src_x);
        }
    }
    wij
}

/// Bilinear sample at `(y, x)` of the image holding ones in `column` only.
fn sample_column(n: usize, column: usize, y: f64, x: f64) -> f64 {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;

    let wx = if x0 == column as f64 {
        1.0 - fx
    } else if x0 + 1.0 == column as f64 {
        fx
    } else {
        return 0.0;
    };

    let inside = |v: f64| v >= 0.0 && v < n as f64;
    let wy = if inside(y0) { 1.0 - fy } else { 0.0 } + if inside(y0 + 1.0) { fy } else { 0.0 };
    wx * wy
}

/// Worker function: accumulates the additive correction of every ray in the
/// payload's chunk against the estimate snapshot.
pub fn ray_update(payload: RayPayload) -> Result<RayResult, BoxError> {
    let RayPayload {
        angle,
        row,
        estimate,
        chunk,
        compute_weight,
    } = payload;

    let n = estimate.rows();
    if estimate.cols() != n {
        return Err(format!("estimate must be square, got {}x{}", n, estimate.cols()).into());
    }
    if row.len() != n {
        return Err(format!("projection row has {} samples for a {}-wide grid", row.len(), n).into());
    }
    if chunk.end > n {
        return Err(format!("chunk {:?} exceeds detector width {}", chunk, n).into());
    }
    if !angle.is_finite() {
        return Err(format!("non-finite projection angle {}", angle).into());
    }

    let mut update = Grid::square(n);
    let mut weight = compute_weight.then(|| Grid::square(n));

    for j in chunk {
        let wij = ray_weights(n, j, angle);
        let norm = wij.dot(&wij);
        if norm > 0.0 {
            let residual = row[j] - wij.dot(&estimate);
            update.add_scaled(residual / norm, &wij);
        }
        if let Some(weight) = weight.as_mut() {
            weight.add_assign(&wij);
        }
    }

    Ok(RayResult { update, weight })
}

/// Simulated measurement of `image` at each angle, one sinogram row per angle.
pub fn forward_project(image: &Grid, angles: &[f64]) -> Grid {
    let n = image.rows();
    let mut sinogram = Grid::zeros(angles.len(), n);
    for (a, &angle) in angles.iter().enumerate() {
        for j in 0..n {
            sinogram[(a, j)] = ray_weights(n, j, angle).dot(image);
        }
    }
    sinogram
}
