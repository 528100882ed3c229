//! Morphological tightening of emission tensors for display.
//!
//! For every term the grid is thresholded into a binary mask, the mask is
//! split into face-connected components (no wrap-around), and each component
//! collapses onto its strongest cell. The result reads as a set of peaks
//! instead of smeared blobs. Training tensors are never modified; the
//! function works on a copy.

use crate::params::TightenParams;
use crate::types::{row_major_strides, Emissions};

/// Tightened copy of `pi` using `params.threshold`.
pub fn tighten(pi: &Emissions, params: &TightenParams) -> Emissions {
    let mut out = pi.clone();
    let extent = pi.extent().to_vec();
    let strides = row_major_strides(&extent);
    let mut labels = vec![usize::MAX; pi.cells()];
    let mut stack = Vec::new();
    let mut component = Vec::new();

    for z in 0..pi.vocab() {
        let values = out.term_slice_mut(z);
        labels.fill(usize::MAX);
        for seed in 0..values.len() {
            if labels[seed] != usize::MAX || values[seed] <= params.threshold {
                continue;
            }
            component.clear();
            stack.push(seed);
            labels[seed] = seed;
            while let Some(cell) = stack.pop() {
                component.push(cell);
                for_each_face_neighbor(cell, &extent, &strides, |n| {
                    if labels[n] == usize::MAX && values[n] > params.threshold {
                        labels[n] = seed;
                        stack.push(n);
                    }
                });
            }
            // Flood order is not raster order; ties go to the lowest index.
            component.sort_unstable();
            let mut best = component[0];
            for &cell in &component[1..] {
                if values[cell] > values[best] {
                    best = cell;
                }
            }
            let peak = values[best];
            for &cell in &component {
                values[cell] = 0.0;
            }
            values[best] = peak;
        }
        for (v, &label) in values.iter_mut().zip(&labels) {
            if label == usize::MAX {
                *v = 0.0;
            }
        }
    }
    out
}

fn for_each_face_neighbor(
    cell: usize,
    extent: &[usize],
    strides: &[usize],
    mut visit: impl FnMut(usize),
) {
    for (&dim, &stride) in extent.iter().zip(strides) {
        let coord = (cell / stride) % dim;
        if coord > 0 {
            visit(cell - stride);
        }
        if coord + 1 < dim {
            visit(cell + stride);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;

    fn from_planes(extent: &[usize], planes: &[&[f64]]) -> Emissions {
        let cells: usize = extent.iter().product();
        let m = DMatrix::from_fn(cells, planes.len(), |e, z| planes[z][e]);
        Emissions::new(extent.to_vec(), m).unwrap()
    }

    #[test]
    fn components_collapse_to_their_peak() {
        #[rustfmt::skip]
        let first = [
            0.5, 0.5, 0.0, 0.0,
            0.7, 0.0, 0.0, 0.5,
            0.5, 0.0, 0.0, 0.6,
            0.5, 0.0, 0.5, 0.0,
        ];
        #[rustfmt::skip]
        let second = [
            0.004, 0.5, 0.0, 0.0,
            0.5, 0.0, 0.0, 0.0,
            100.0, 0.0, 0.0, 0.0,
            0.0, 0.0, 0.0, 0.5,
        ];
        #[rustfmt::skip]
        let first_out = [
            0.0, 0.0, 0.0, 0.0,
            0.7, 0.0, 0.0, 0.0,
            0.0, 0.0, 0.0, 0.6,
            0.0, 0.0, 0.5, 0.0,
        ];
        #[rustfmt::skip]
        let second_out = [
            0.0, 0.0, 0.0, 0.0,
            0.0, 0.0, 0.0, 0.0,
            100.0, 0.0, 0.0, 0.0,
            0.0, 0.0, 0.0, 0.5,
        ];
        let pi = from_planes(&[4, 4], &[&first, &second]);
        let out = tighten(&pi, &TightenParams::default());
        assert_eq!(out.term_slice(0), &first_out);
        assert_eq!(out.term_slice(1), &second_out);
        assert_eq!(pi.term_slice(0), &first, "input must be untouched");
    }

    #[test]
    fn components_do_not_wrap_around_edges() {
        let plane = [0.2, 0.0, 0.3];
        let out = tighten(&from_planes(&[3], &[&plane]), &TightenParams::default());
        assert_eq!(out.term_slice(0), &plane);
    }

    #[test]
    fn ties_keep_the_first_cell_in_raster_order() {
        let plane = [0.0, 0.4, 0.4, 0.4];
        let out = tighten(&from_planes(&[2, 2], &[&plane]), &TightenParams::default());
        assert_eq!(out.term_slice(0), &[0.0, 0.4, 0.0, 0.0]);
    }

    #[test]
    fn below_threshold_planes_become_zero() {
        let plane = [1e-4, 5e-4, 1e-3, 0.0];
        let out = tighten(&from_planes(&[2, 2], &[&plane]), &TightenParams::default());
        assert!(out.term_slice(0).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn three_dimensional_faces_connect_along_every_axis() {
        let mut plane = vec![0.0; 8];
        plane[0] = 0.5;
        plane[4] = 0.9; // below cell 0 along the first axis
        plane[3] = 0.1; // diagonal only, separate component
        let out = tighten(&from_planes(&[2, 2, 2], &[&plane]), &TightenParams::default());
        let s = out.term_slice(0);
        assert_eq!(s[0], 0.0);
        assert_eq!(s[4], 0.9);
        assert_eq!(s[3], 0.1);
    }
}
