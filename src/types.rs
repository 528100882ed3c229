//! Grid geometry and the two tensors a training run revolves around.
//!
//! Grids are stored flattened: a cell with coordinates `(e1, e2, ..)` lives at
//! the row-major index over the extent (last axis fastest). An `E×Z` tensor
//! therefore becomes a `|E|×Z` [`DMatrix`], and a column of that matrix is the
//! contiguous slice of one term over the whole grid.

use crate::error::{CgError, Result};
use crate::histogram::normalize_rows;
use nalgebra::DMatrix;
use rand::Rng;

/// Validated toroidal extent together with the aggregation window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GridGeometry {
    extent: Vec<usize>,
    window: Vec<usize>,
    strides: Vec<usize>,
}

impl GridGeometry {
    /// Builds a geometry from integer components.
    pub fn new(extent: &[usize], window: &[usize]) -> Result<Self> {
        let extent_f: Vec<f64> = extent.iter().map(|&v| v as f64).collect();
        let window_f: Vec<f64> = window.iter().map(|&v| v as f64).collect();
        Self::from_f64(&extent_f, &window_f)
    }

    /// Builds a geometry from raw numeric components (e.g. parsed JSON),
    /// rejecting anything that is not a positive whole number.
    pub fn from_f64(extent: &[f64], window: &[f64]) -> Result<Self> {
        if extent.len() != window.len() {
            return Err(CgError::DimensionMismatch {
                extent: extent.len(),
                window: window.len(),
            });
        }
        if extent.is_empty() {
            return Err(CgError::EmptyGeometry);
        }
        let extent = positive_integers("extent", extent)?;
        let window = positive_integers("window", window)?;
        for (axis, (&e, &w)) in extent.iter().zip(&window).enumerate() {
            if w >= e {
                return Err(CgError::WindowExceedsExtent {
                    axis,
                    window: w,
                    extent: e,
                });
            }
        }
        let strides = row_major_strides(&extent);
        Ok(Self {
            extent,
            window,
            strides,
        })
    }

    pub fn extent(&self) -> &[usize] {
        &self.extent
    }

    pub fn window(&self) -> &[usize] {
        &self.window
    }

    /// Number of grid axes `D`.
    pub fn dims(&self) -> usize {
        self.extent.len()
    }

    /// Number of cells `|E|`.
    pub fn cells(&self) -> usize {
        self.extent.iter().product()
    }

    /// Number of cells covered by one window, `|W|`.
    pub fn window_volume(&self) -> usize {
        self.window.iter().product()
    }

    /// `|E| / |W|`, the number of non-overlapping windows the grid can hold.
    pub fn capacity(&self) -> f64 {
        self.cells() as f64 / self.window_volume() as f64
    }

    /// Flat index of an in-range coordinate.
    pub fn flat_index(&self, coords: &[usize]) -> usize {
        debug_assert_eq!(coords.len(), self.extent.len());
        coords
            .iter()
            .zip(&self.strides)
            .map(|(&c, &s)| c * s)
            .sum()
    }

    /// Coordinates of a flat cell index.
    pub fn coords(&self, mut index: usize) -> Vec<usize> {
        let mut out = vec![0; self.extent.len()];
        for (axis, &stride) in self.strides.iter().enumerate() {
            out[axis] = index / stride;
            index %= stride;
        }
        out
    }

    /// Flat index of `coords + offset` with toroidal wrap-around on every axis.
    pub fn wrapped_index(&self, coords: &[usize], offset: &[usize]) -> usize {
        coords
            .iter()
            .zip(offset)
            .zip(self.extent.iter().zip(&self.strides))
            .map(|((&c, &o), (&e, &s))| ((c + o) % e) * s)
            .sum()
    }

    /// Flat indices of the forward window `[cell, cell + W)`, wrapping around.
    pub fn window_cells(&self, cell: &[usize]) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.window_volume());
        let mut offset = vec![0usize; self.dims()];
        loop {
            out.push(self.wrapped_index(cell, &offset));
            if !advance_odometer(&mut offset, &self.window) {
                break;
            }
        }
        out
    }
}

fn positive_integers(what: &'static str, values: &[f64]) -> Result<Vec<usize>> {
    values
        .iter()
        .enumerate()
        .map(|(axis, &value)| {
            if value.is_finite() && value >= 1.0 && value.fract() == 0.0 {
                Ok(value as usize)
            } else {
                Err(CgError::InvalidComponent { what, axis, value })
            }
        })
        .collect()
}

pub(crate) fn row_major_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; dims.len()];
    for axis in (0..dims.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * dims[axis + 1];
    }
    strides
}

/// Increments a mixed-radix counter; returns `false` once it wraps to zero.
pub(crate) fn advance_odometer(counter: &mut [usize], radix: &[usize]) -> bool {
    for axis in (0..counter.len()).rev() {
        counter[axis] += 1;
        if counter[axis] < radix[axis] {
            return true;
        }
        counter[axis] = 0;
    }
    false
}

/// Per-cell distribution over the vocabulary (the `π` tensor, shape `E×Z`).
#[derive(Clone, Debug, PartialEq)]
pub struct Emissions {
    extent: Vec<usize>,
    probs: DMatrix<f64>,
}

impl Emissions {
    /// Wraps a `|E|×Z` matrix laid out over `extent`.
    pub fn new(extent: Vec<usize>, probs: DMatrix<f64>) -> Result<Self> {
        let cells: usize = extent.iter().product();
        if probs.nrows() != cells {
            return Err(CgError::ShapeMismatch {
                what: "emission tensor",
                expected: vec![cells, probs.ncols()],
                found: vec![probs.nrows(), probs.ncols()],
            });
        }
        Ok(Self { extent, probs })
    }

    /// Constant tensor, not necessarily normalized.
    pub fn constant(extent: &[usize], vocab: usize, value: f64) -> Self {
        let cells = extent.iter().product();
        Self {
            extent: extent.to_vec(),
            probs: DMatrix::from_element(cells, vocab, value),
        }
    }

    /// Uniform `[0, 1)` draws from `rng`, normalized per cell.
    pub fn random<R: Rng + ?Sized>(extent: &[usize], vocab: usize, rng: &mut R) -> Self {
        let cells = extent.iter().product();
        let mut probs = DMatrix::from_fn(cells, vocab, |_, _| rng.gen::<f64>());
        normalize_rows(&mut probs);
        Self {
            extent: extent.to_vec(),
            probs,
        }
    }

    pub fn extent(&self) -> &[usize] {
        &self.extent
    }

    /// Tensor rank: one axis per grid dimension plus the vocabulary axis.
    pub fn rank(&self) -> usize {
        self.extent.len() + 1
    }

    pub fn cells(&self) -> usize {
        self.probs.nrows()
    }

    pub fn vocab(&self) -> usize {
        self.probs.ncols()
    }

    /// Full shape `extent ++ [Z]`.
    pub fn shape(&self) -> Vec<usize> {
        let mut shape = self.extent.clone();
        shape.push(self.vocab());
        shape
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.probs
    }

    pub fn matrix_mut(&mut self) -> &mut DMatrix<f64> {
        &mut self.probs
    }

    pub fn into_matrix(self) -> DMatrix<f64> {
        self.probs
    }

    /// Values of term `z` over all cells (contiguous, row-major grid order).
    pub fn term_slice(&self, z: usize) -> &[f64] {
        let cells = self.cells();
        &self.probs.as_slice()[z * cells..(z + 1) * cells]
    }

    pub fn term_slice_mut(&mut self, z: usize) -> &mut [f64] {
        let cells = self.cells();
        &mut self.probs.as_mut_slice()[z * cells..(z + 1) * cells]
    }
}

/// Per-document placement distribution over the grid (the `q` tensor).
///
/// Stored cells-by-documents so every document is one contiguous column;
/// [`Posterior::doc_major`] returns the conventional `T×|E|` view.
#[derive(Clone, Debug, PartialEq)]
pub struct Posterior {
    extent: Vec<usize>,
    probs: DMatrix<f64>,
}

impl Posterior {
    pub(crate) fn from_cell_major(extent: Vec<usize>, probs: DMatrix<f64>) -> Self {
        debug_assert_eq!(probs.nrows(), extent.iter().product::<usize>());
        Self { extent, probs }
    }

    pub fn extent(&self) -> &[usize] {
        &self.extent
    }

    pub fn documents(&self) -> usize {
        self.probs.ncols()
    }

    pub fn cells(&self) -> usize {
        self.probs.nrows()
    }

    /// Placement distribution of document `t` over the flattened grid.
    pub fn document(&self, t: usize) -> &[f64] {
        let cells = self.cells();
        &self.probs.as_slice()[t * cells..(t + 1) * cells]
    }

    /// `|E|×T` matrix, one column per document.
    pub fn cell_major(&self) -> &DMatrix<f64> {
        &self.probs
    }

    /// `T×|E|` matrix, one row per document.
    pub fn doc_major(&self) -> DMatrix<f64> {
        self.probs.transpose()
    }

    /// Most likely cell (flat index) for document `t`.
    pub fn argmax_cell(&self, t: usize) -> usize {
        argmax(self.document(t))
    }
}

/// Index of the first maximum of a slice (0 for an empty slice).
pub(crate) fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    let mut best_val = f64::NEG_INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_flat_index_round_trips_coords() {
        let g = GridGeometry::new(&[3, 4, 5], &[1, 2, 2]).unwrap();
        assert_eq!(g.cells(), 60);
        assert_eq!(g.window_volume(), 4);
        assert_eq!(g.flat_index(&[2, 1, 3]), 2 * 20 + 5 + 3);
        assert_eq!(g.coords(48), vec![2, 1, 3]);
    }

    #[test]
    fn geometry_rejects_fractional_and_zero_components() {
        let err = GridGeometry::from_f64(&[5.0, 5.5], &[2.0, 2.0]).unwrap_err();
        assert!(matches!(err, CgError::InvalidComponent { what: "extent", axis: 1, .. }));
        let err = GridGeometry::from_f64(&[5.0, 5.0], &[0.0, 2.0]).unwrap_err();
        assert!(matches!(err, CgError::InvalidComponent { what: "window", axis: 0, .. }));
        let err = GridGeometry::from_f64(&[5.0, -3.0], &[2.0, 2.0]).unwrap_err();
        assert!(matches!(err, CgError::InvalidComponent { .. }));
    }

    #[test]
    fn geometry_rejects_mismatched_dimensions() {
        let err = GridGeometry::new(&[5, 5], &[2]).unwrap_err();
        assert_eq!(err, CgError::DimensionMismatch { extent: 2, window: 1 });
        assert_eq!(GridGeometry::new(&[], &[]).unwrap_err(), CgError::EmptyGeometry);
    }

    #[test]
    fn geometry_rejects_window_not_smaller_than_extent() {
        let err = GridGeometry::new(&[4, 4], &[2, 4]).unwrap_err();
        assert!(matches!(err, CgError::WindowExceedsExtent { axis: 1, .. }));
    }

    #[test]
    fn window_cells_wrap_around_the_torus() {
        let g = GridGeometry::new(&[4, 4], &[2, 2]).unwrap();
        let mut cells = g.window_cells(&[3, 3]);
        cells.sort_unstable();
        assert_eq!(cells, vec![0, 3, 12, 15]);
    }

    #[test]
    fn emissions_term_slice_is_a_column() {
        let m = DMatrix::from_fn(4, 3, |r, c| (r * 10 + c) as f64);
        let pi = Emissions::new(vec![2, 2], m).unwrap();
        assert_eq!(pi.term_slice(1), &[1.0, 11.0, 21.0, 31.0]);
        assert_eq!(pi.shape(), vec![2, 2, 3]);
        assert_eq!(pi.rank(), 3);
    }

    #[test]
    fn emissions_reject_wrong_cell_count() {
        let err = Emissions::new(vec![3, 3], DMatrix::zeros(8, 2)).unwrap_err();
        assert!(matches!(err, CgError::ShapeMismatch { .. }));
    }
}
