use serde::{Deserialize, Serialize};
use std::ops::{Index, IndexMut};

/// Dense row-major 2-D array of `f64`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Grid {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Grid {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn square(n: usize) -> Self {
        Self::zeros(n, n)
    }

    /// Returns `None` when `data` does not hold exactly `rows * cols` values.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f64>) -> Option<Self> {
        (data.len() == rows * cols).then_some(Grid { rows, cols, data })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn row(&self, r: usize) -> &[f64] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn fill(&mut self, value: f64) {
        self.data.iter_mut().for_each(|v| *v = value);
    }

    pub fn same_shape(&self, other: &Grid) -> bool {
        self.rows == other.rows && self.cols == other.cols
    }

    /// Elementwise `self += other`.
    pub fn add_assign(&mut self, other: &Grid) {
        debug_assert!(self.same_shape(other));
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += b;
        }
    }

    /// Elementwise `self += scale * other`.
    pub fn add_scaled(&mut self, scale: f64, other: &Grid) {
        debug_assert!(self.same_shape(other));
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += scale * b;
        }
    }

    pub fn dot(&self, other: &Grid) -> f64 {
        self.data.iter().zip(&other.data).map(|(a, b)| a * b).sum()
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    pub fn min_max(&self) -> Option<(f64, f64)> {
        self.data.iter().fold(None, |acc, &v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
    }

    pub fn is_zero(&self) -> bool {
        self.data.iter().all(|v| *v == 0.0)
    }

    /// Copies the window `[r0, r0 + rows) x [c0, c0 + cols)`, clipped to the grid.
    pub fn crop(&self, r0: usize, c0: usize, rows: usize, cols: usize) -> Grid {
        let r1 = (r0 + rows).min(self.rows);
        let c1 = (c0 + cols).min(self.cols);
        let r0 = r0.min(r1);
        let c0 = c0.min(c1);
        let mut out = Grid::zeros(r1 - r0, c1 - c0);
        for r in r0..r1 {
            for c in c0..c1 {
                out[(r - r0, c - c0)] = self[(r, c)];
            }
        }
        out
    }
}

impl Index<(usize, usize)> for Grid {
    type Output = f64;

    fn index(&self, (r, c): (usize, usize)) -> &f64 {
        &self.data[r * self.cols + c]
    }
}

impl IndexMut<(usize, usize)> for Grid {
    fn index_mut(&mut self, (r, c): (usize, usize)) -> &mut f64 {
        &mut self.data[r * self.cols + c]
    }
}
