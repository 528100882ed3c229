//! Display artifacts derived from a trained grid.
//!
//! Only the numbers are computed here; turning them into files is left to the
//! caller (the `cg_train` tool serializes them as JSON).

use crate::error::{CgError, Result};
use crate::histogram::{Anchor, WindowSumPlan};
use crate::params::ArtifactParams;
use crate::tighten::tighten;
use crate::types::{argmax, row_major_strides, Emissions, GridGeometry, Posterior};
use serde::Serialize;
use std::cmp::Ordering;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TermWeight {
    pub term: usize,
    pub weight: f64,
}

/// Strongest terms of one cell.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CellTerms {
    pub cell: Vec<usize>,
    pub top: Vec<TermWeight>,
    /// Terms that made no cell's top list and peak in this cell.
    pub missing: Vec<TermWeight>,
}

/// Per cell, the `params.max_terms` heaviest terms of the tightened `pi`.
///
/// Terms that appear in no list at all are attached to the cell where they
/// peak, so every term of the vocabulary is placed somewhere.
pub fn top_terms(pi: &Emissions, params: &ArtifactParams) -> Vec<CellTerms> {
    let tight = tighten(pi, &params.tighten);
    let m = tight.matrix();
    let (cells, vocab) = (tight.cells(), tight.vocab());
    let strides = row_major_strides(tight.extent());
    let coords = |e: usize| -> Vec<usize> {
        strides
            .iter()
            .zip(tight.extent())
            .map(|(&s, &d)| (e / s) % d)
            .collect()
    };

    let mut listed = vec![false; vocab];
    let mut out: Vec<CellTerms> = (0..cells)
        .map(|e| {
            let mut order: Vec<usize> = (0..vocab).collect();
            order.sort_by(|&a, &b| m[(e, b)].partial_cmp(&m[(e, a)]).unwrap_or(Ordering::Equal));
            order.truncate(params.max_terms);
            let top = order
                .into_iter()
                .map(|z| {
                    listed[z] = true;
                    TermWeight {
                        term: z,
                        weight: m[(e, z)],
                    }
                })
                .collect();
            CellTerms {
                cell: coords(e),
                top,
                missing: Vec::new(),
            }
        })
        .collect();

    for z in (0..vocab).filter(|&z| !listed[z]) {
        let column = tight.term_slice(z);
        let peak = argmax(column);
        out[peak].missing.push(TermWeight {
            term: z,
            weight: column[peak],
        });
    }
    out
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DocPlacement {
    pub document: usize,
    pub mass: f64,
    pub layer: usize,
}

/// Documents visible from one cell.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CellDocs {
    pub cell: Vec<usize>,
    pub documents: Vec<DocPlacement>,
}

/// Document map: q smoothed by the window mask, then, per cell, every
/// document whose smoothed mass exceeds `threshold`, tagged with its layer.
pub fn doc_map(
    q: &Posterior,
    id_layer: &[usize],
    geometry: &GridGeometry,
    threshold: f64,
) -> Result<Vec<CellDocs>> {
    if q.extent() != geometry.extent() {
        return Err(CgError::ShapeMismatch {
            what: "posterior extent",
            expected: geometry.extent().to_vec(),
            found: q.extent().to_vec(),
        });
    }
    if id_layer.len() != q.documents() {
        return Err(CgError::ShapeMismatch {
            what: "layer ids",
            expected: vec![q.documents()],
            found: vec![id_layer.len()],
        });
    }
    let smoothed = WindowSumPlan::new(geometry, Anchor::Backward).apply_columns(q.cell_major());
    Ok((0..geometry.cells())
        .map(|e| CellDocs {
            cell: geometry.coords(e),
            documents: smoothed
                .row(e)
                .iter()
                .enumerate()
                .filter(|&(_, &mass)| mass > threshold)
                .map(|(t, &mass)| DocPlacement {
                    document: t,
                    mass,
                    layer: id_layer[t],
                })
                .collect(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;

    #[test]
    fn top_terms_are_sorted_and_missing_terms_are_placed() {
        // Term 2 only peaks where term 0 is stronger.
        #[rustfmt::skip]
        let m = DMatrix::from_row_slice(4, 3, &[
            0.6, 0.3, 0.3,
            0.1, 0.7, 0.1,
            0.5, 0.2, 0.1,
            0.2, 0.6, 0.1,
        ]);
        let pi = Emissions::new(vec![2, 2], m).unwrap();
        let params = ArtifactParams {
            max_terms: 1,
            ..ArtifactParams::default()
        };
        let terms = top_terms(&pi, &params);
        assert_eq!(terms.len(), 4);
        assert_eq!(terms[1].cell, vec![0, 1]);
        assert!(terms.iter().all(|c| c.top.len() == 1));
        let placed: Vec<_> = terms
            .iter()
            .flat_map(|c| c.missing.iter().map(move |w| (c.cell.clone(), w.term)))
            .collect();
        assert_eq!(placed, vec![(vec![0, 0], 2)]);
        assert_eq!(terms[0].top[0], TermWeight { term: 0, weight: 0.6 });
    }

    #[test]
    fn doc_map_lists_documents_above_threshold() {
        let geometry = GridGeometry::new(&[3, 3], &[1, 1]).unwrap();
        let mut probs = DMatrix::from_element(9, 2, 0.0);
        probs[(4, 0)] = 1.0;
        probs[(0, 1)] = 0.5;
        probs[(8, 1)] = 0.5;
        let q = Posterior::from_cell_major(vec![3, 3], probs);
        let map = doc_map(&q, &[0, 1], &geometry, 0.01).unwrap();
        assert_eq!(map[4].documents.len(), 1);
        assert_eq!(map[4].documents[0].document, 0);
        assert_eq!(map[8].documents[0].layer, 1);
        assert!(map[2].documents.is_empty());
    }

    #[test]
    fn doc_map_spreads_mass_over_the_window() {
        let geometry = GridGeometry::new(&[3, 3], &[2, 2]).unwrap();
        let mut probs = DMatrix::from_element(9, 1, 0.0);
        probs[(0, 0)] = 1.0;
        let q = Posterior::from_cell_major(vec![3, 3], probs);
        let map = doc_map(&q, &[0], &geometry, 0.5).unwrap();
        let hits: Vec<usize> = (0..9).filter(|&e| !map[e].documents.is_empty()).collect();
        assert_eq!(hits, vec![0, 1, 3, 4]);
    }

    #[test]
    fn doc_map_checks_layer_ids() {
        let geometry = GridGeometry::new(&[2, 2], &[1, 1]).unwrap();
        let q = Posterior::from_cell_major(vec![2, 2], DMatrix::from_element(4, 3, 0.25));
        assert!(doc_map(&q, &[0, 0], &geometry, 0.01).is_err());
    }
}
