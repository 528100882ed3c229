//! Toroidal windowed histograms via summed-area tables.
//!
//! Every EM iteration needs, for each cell `e`, the sum of a per-cell quantity
//! over the `W`-sized block of cells around `e` on the torus. Summing each
//! block directly costs `O(|E|·|W|·Z)`; instead the grid is padded circularly
//! by `W`, integrated along every axis, and each block sum is read back from
//! the `2^D` corners of the integral by inclusion–exclusion. The cost is
//! `O(|E|·Z)` whatever the window size.
//!
//! Two block orientations are needed:
//! - [`Anchor::Forward`] sums `[e, e + W)` and is what the emission histogram
//!   `h` uses;
//! - [`Anchor::Backward`] sums `(e − W, e]`, the adjoint block used by the
//!   M-step and by window-mask convolutions.
//!
//! A [`WindowSumPlan`] precomputes the padding map, the per-cell corner bases
//! and the corner signs once per geometry; applying it to a column is then a
//! gather, `D` prefix passes and a `2^D`-term readout per cell.

use crate::types::{row_major_strides, GridGeometry};
use nalgebra::DMatrix;

/// Which block of cells a window sum anchored at `e` covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Anchor {
    /// Cells `[e, e + W)` along every axis.
    Forward,
    /// Cells `(e − W, e]` along every axis.
    Backward,
}

/// Precomputed summed-area layout for one extent, window and anchor.
#[derive(Clone, Debug)]
pub struct WindowSumPlan {
    cells: usize,
    padded_dims: Vec<usize>,
    padded_strides: Vec<usize>,
    /// Source cell for every padded slot; `None` on the leading zero planes.
    source: Vec<Option<usize>>,
    /// Lower-corner padded index for every output cell.
    bases: Vec<usize>,
    /// Padded offset and inclusion–exclusion sign of each of the `2^D` corners.
    corners: Vec<(usize, f64)>,
}

impl WindowSumPlan {
    pub fn new(geometry: &GridGeometry, anchor: Anchor) -> Self {
        Self::for_window(geometry.extent(), geometry.window(), anchor)
    }

    /// Plan for an arbitrary positive `window` over `extent`.
    ///
    /// Windows larger than the extent are allowed here and simply wrap more
    /// than once.
    pub fn for_window(extent: &[usize], window: &[usize], anchor: Anchor) -> Self {
        assert_eq!(extent.len(), window.len(), "extent/window rank mismatch");
        let dims = extent.len();
        let cells: usize = extent.iter().product();

        // One leading zero plane per axis so that P[a] = sum over j < a.
        let padded_dims: Vec<usize> = extent
            .iter()
            .zip(window)
            .map(|(&e, &w)| e + w + 1)
            .collect();
        let padded_strides = row_major_strides(&padded_dims);
        let padded_len: usize = padded_dims.iter().product();
        let shift: Vec<usize> = match anchor {
            Anchor::Forward => vec![0; dims],
            Anchor::Backward => window.to_vec(),
        };

        let extent_strides = row_major_strides(extent);
        let mut source = Vec::with_capacity(padded_len);
        let mut p = vec![0usize; dims];
        for _ in 0..padded_len {
            let mut flat = Some(0usize);
            for axis in 0..dims {
                if p[axis] == 0 {
                    flat = None;
                    break;
                }
                let e = extent[axis] as isize;
                let orig = (p[axis] as isize - 1 - shift[axis] as isize).rem_euclid(e) as usize;
                flat = flat.map(|f| f + orig * extent_strides[axis]);
            }
            source.push(flat);
            crate::types::advance_odometer(&mut p, &padded_dims);
        }

        let lower_shift = match anchor {
            Anchor::Forward => 0,
            Anchor::Backward => 1,
        };
        let mut bases = Vec::with_capacity(cells);
        let mut e = vec![0usize; dims];
        for _ in 0..cells {
            let base: usize = e
                .iter()
                .zip(&padded_strides)
                .map(|(&c, &s)| (c + lower_shift) * s)
                .sum();
            bases.push(base);
            crate::types::advance_odometer(&mut e, extent);
        }

        let corners = (0..(1usize << dims))
            .map(|mask| {
                let mut offset = 0;
                let mut upper = 0;
                for axis in 0..dims {
                    if mask & (1 << axis) != 0 {
                        offset += window[axis] * padded_strides[axis];
                        upper += 1;
                    }
                }
                let sign = if (dims - upper) % 2 == 0 { 1.0 } else { -1.0 };
                (offset, sign)
            })
            .collect();

        Self {
            cells,
            padded_dims,
            padded_strides,
            source,
            bases,
            corners,
        }
    }

    pub fn cells(&self) -> usize {
        self.cells
    }

    /// Window sums of one per-cell column, written into `out`.
    ///
    /// `scratch` is resized as needed and may be reused across calls.
    pub fn apply_into(&self, column: &[f64], scratch: &mut Vec<f64>, out: &mut [f64]) {
        assert_eq!(column.len(), self.cells, "column length must equal cell count");
        assert_eq!(out.len(), self.cells, "output length must equal cell count");
        scratch.clear();
        scratch.extend(self.source.iter().map(|s| s.map_or(0.0, |i| column[i])));

        for (&dim, &stride) in self.padded_dims.iter().zip(&self.padded_strides) {
            let block = dim * stride;
            for outer in (0..scratch.len()).step_by(block) {
                for p in 1..dim {
                    let row = outer + p * stride;
                    for i in row..row + stride {
                        scratch[i] += scratch[i - stride];
                    }
                }
            }
        }

        for (dst, &base) in out.iter_mut().zip(&self.bases) {
            *dst = self
                .corners
                .iter()
                .map(|&(offset, sign)| sign * scratch[base + offset])
                .sum();
        }
    }

    /// Window sums of one per-cell column.
    pub fn apply(&self, column: &[f64]) -> Vec<f64> {
        let mut scratch = Vec::new();
        let mut out = vec![0.0; self.cells];
        self.apply_into(column, &mut scratch, &mut out);
        out
    }

    /// Window sums of every column of a `|E|×K` matrix.
    pub fn apply_columns(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        assert_eq!(x.nrows(), self.cells, "matrix rows must equal cell count");
        let mut out = DMatrix::zeros(self.cells, x.ncols());
        let mut scratch = Vec::new();
        let cells = self.cells;
        for (src, dst) in x
            .as_slice()
            .chunks(cells)
            .zip(out.as_mut_slice().chunks_mut(cells))
        {
            self.apply_into(src, &mut scratch, dst);
        }
        out
    }
}

/// Un-normalized toroidal window sums of every column of `x` (`|E|×K`).
pub fn window_sums(x: &DMatrix<f64>, geometry: &GridGeometry, anchor: Anchor) -> DMatrix<f64> {
    WindowSumPlan::new(geometry, anchor).apply_columns(x)
}

/// Emission histogram `h`: forward window sums of `pi`, normalized per cell.
pub fn compute_histogram(pi: &DMatrix<f64>, geometry: &GridGeometry) -> DMatrix<f64> {
    let mut h = window_sums(pi, geometry, Anchor::Forward);
    normalize_rows(&mut h);
    h
}

/// Normalizes every row to sum to one; rows without mass become uniform.
pub fn normalize_rows(m: &mut DMatrix<f64>) {
    let cols = m.ncols();
    if cols == 0 {
        return;
    }
    let sums = m.column_sum();
    let uniform = 1.0 / cols as f64;
    for mut col in m.column_iter_mut() {
        for (v, &s) in col.iter_mut().zip(sums.iter()) {
            *v = if s > 0.0 && s.is_finite() { *v / s } else { uniform };
        }
    }
}

/// Normalizes every column to sum to one; columns without mass become uniform.
pub fn normalize_columns(m: &mut DMatrix<f64>) {
    let rows = m.nrows();
    if rows == 0 {
        return;
    }
    let uniform = 1.0 / rows as f64;
    for mut col in m.column_iter_mut() {
        let s = col.sum();
        if s > 0.0 && s.is_finite() {
            col /= s;
        } else {
            col.fill(uniform);
        }
    }
}
