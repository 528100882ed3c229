//! Multi-layer mixture refinement of a converged counting grid.
//!
//! Each of `L` layers owns its own emission tensor. Documents pick a layer
//! (`qla`, `L×T`), cells carry a prior over layers (`plal`, `L×|E|`), and a
//! short joint EM pass sharpens all three together with the grid posterior.
//! The result is condensed into IDF-weighted display tensors: a per-layer
//! stack and a single grid blended by a layer-affinity field.

use crate::backend::{EmBackend, EmContext, MStep};
use crate::error::Result;
use crate::histogram::{normalize_columns, normalize_rows, Anchor, WindowSumPlan};
use crate::output::NamedTensor;
use crate::params::LayerParams;
use crate::types::{argmax, Emissions, Posterior};
use log::debug;
use nalgebra::DMatrix;
use rand::Rng;

/// Tolerance under which a smoothed cell mass counts as empty.
const EMPTY_MASS: f64 = 1e-8;

/// Output of the layered refinement.
#[derive(Clone, Debug)]
pub struct LayeredBundle {
    /// Layer-blended, IDF-weighted emissions, normalized per cell.
    pub pi2_idf: Emissions,
    /// Per-layer emissions scaled by the inverse document frequency.
    pub pi_la_idf: Vec<Emissions>,
    /// Most likely layer of every document (0-based).
    pub id_layer: Vec<usize>,
    /// Grid posterior after the joint rounds.
    pub q: Posterior,
    /// Transposed count matrix, `Z×T`.
    pub counts_to_show: DMatrix<f64>,
    /// Single-layer emissions the refinement started from.
    pub pi: Emissions,
    pub pi_la: Vec<Emissions>,
    /// Layer posterior, `L×T`.
    pub qla: DMatrix<f64>,
    /// Cell-to-layer prior, `L×|E|`.
    pub plal: DMatrix<f64>,
}

impl LayeredBundle {
    pub fn layers(&self) -> usize {
        self.pi_la.len()
    }

    pub fn tensors(&self) -> Vec<NamedTensor> {
        vec![
            NamedTensor::from_emissions("pi2_idf", &self.pi2_idf),
            NamedTensor::stacked("pi_la_idf", &self.pi_la_idf),
            NamedTensor::from_labels("id_layer", &self.id_layer),
            NamedTensor::from_posterior("q", &self.q),
            NamedTensor::from_matrix("counts_to_show", &self.counts_to_show),
            NamedTensor::from_emissions("pi", &self.pi),
            NamedTensor::stacked("pi_la", &self.pi_la),
            NamedTensor::from_matrix("qla", &self.qla),
        ]
    }
}

/// Runs the layered refinement with one backend and one set of constants.
pub struct LayeredExtension<'a> {
    backend: &'a dyn EmBackend,
    ctx: &'a EmContext,
    params: &'a LayerParams,
}

impl<'a> LayeredExtension<'a> {
    pub fn new(backend: &'a dyn EmBackend, ctx: &'a EmContext, params: &'a LayerParams) -> Self {
        Self {
            backend,
            ctx,
            params,
        }
    }

    /// Fits `layers` layers on top of a converged `(pi, q)`.
    pub fn run<R: Rng + ?Sized>(
        &self,
        data: &DMatrix<f64>,
        pi: &Emissions,
        q: &Posterior,
        layers: usize,
        noise: f64,
        rng: &mut R,
    ) -> Result<LayeredBundle> {
        self.params.validate(self.ctx.geometry.dims())?;
        let backend = self.backend;
        let ctx = self.ctx;
        let alpha = ctx.params.alpha;
        let eps = f64::EPSILON;
        let cells = ctx.geometry.cells();
        let docs = data.nrows();

        let mut pi_la: Vec<DMatrix<f64>> = (0..layers)
            .map(|_| {
                let mut m = pi.matrix().map(|v| v + rng.gen::<f64>() * noise);
                normalize_rows(&mut m);
                m
            })
            .collect();
        let mut h_la: Vec<DMatrix<f64>> = pi_la
            .iter()
            .map(|p| backend.compute_histogram(p, ctx))
            .collect();

        let mut q = q.cell_major().map(|v| v + self.params.q_noise_scale * noise);
        normalize_columns(&mut q);

        let mut qla = DMatrix::from_element(layers, docs, 1.0);
        let mut plal = DMatrix::from_element(layers, cells, 1.0 / layers as f64);
        let pseudocounts = ctx.pseudocounts(data);
        let prior_offset = self.params.dirichlet_prior - 1.0;
        let smoothing = self
            .params
            .plal_smoothing
            .as_ref()
            .map(|kernel| WindowSumPlan::for_window(ctx.geometry.extent(), kernel, Anchor::Backward));

        for round in 0..self.params.iterations {
            debug!("LayeredExtension::run round {} of {}", round + 1, self.params.iterations);

            if round >= self.params.q_refresh_from {
                let mut lql = DMatrix::<f64>::zeros(cells, docs);
                for (l, h) in h_la.iter().enumerate() {
                    let scores = backend.log_scores(h, data, eps);
                    for (t, (mut acc, s)) in lql.column_iter_mut().zip(scores.column_iter()).enumerate() {
                        acc.axpy(qla[(l, t)], &s, 1.0);
                    }
                }
                q = backend.normalize_log_scores(&lql, None);
            }

            let mut lqla = DMatrix::<f64>::zeros(layers, docs);
            for (l, h) in h_la.iter().enumerate() {
                let scores = backend.log_scores(h, data, alpha);
                let log_prior: Vec<f64> = plal.row(l).iter().map(|p| p.ln()).collect();
                for t in 0..docs {
                    lqla[(l, t)] = q
                        .column(t)
                        .iter()
                        .zip(scores.column(t).iter())
                        .zip(&log_prior)
                        .map(|((&qv, &s), &lp)| qv * (s + lp))
                        .sum();
                }
            }
            qla = backend.normalize_log_scores(&lqla, None);

            for l in 0..layers {
                let weights: Vec<f64> = qla.row(l).iter().copied().collect();
                let updated = backend.update_pi(
                    MStep {
                        pi: &pi_la[l],
                        h: &h_la[l],
                        q: &q,
                        data,
                        doc_weights: Some(&weights),
                        prior_offset,
                        pseudocounts,
                    },
                    ctx,
                );
                h_la[l] = backend.compute_histogram(&updated, ctx);
                pi_la[l] = updated;
            }

            let smoothed = match &smoothing {
                Some(plan) => backend.window_sums(&q, plan),
                None => q.clone(),
            };
            plal = self.layer_prior(&smoothed, &qla);
        }

        let idf = inverse_document_frequency(data);
        let pi_la_idf: Vec<DMatrix<f64>> = pi_la
            .iter()
            .map(|p| {
                let mut scaled = p.clone();
                for (mut col, &w) in scaled.column_iter_mut().zip(&idf) {
                    col *= w;
                }
                scaled
            })
            .collect();

        let id_layer: Vec<usize> = qla.as_slice().chunks(layers).map(argmax).collect();

        let wg = self.layer_affinity(&q, &id_layer, layers);
        let mut pi2_idf = DMatrix::<f64>::zeros(cells, data.ncols());
        for (l, layer) in pi_la_idf.iter().enumerate() {
            for (mut dst, src) in pi2_idf.column_iter_mut().zip(layer.column_iter()) {
                for ((d, &s), &w) in dst.iter_mut().zip(src.iter()).zip(wg.column(l).iter()) {
                    *d += s * w;
                }
            }
        }
        normalize_rows(&mut pi2_idf);

        let extent = ctx.geometry.extent().to_vec();
        let wrap = |m: DMatrix<f64>| Emissions::new(extent.clone(), m);
        Ok(LayeredBundle {
            pi2_idf: wrap(pi2_idf)?,
            pi_la_idf: pi_la_idf.into_iter().map(wrap).collect::<Result<_>>()?,
            id_layer,
            q: Posterior::from_cell_major(extent.clone(), q),
            counts_to_show: data.transpose(),
            pi: pi.clone(),
            pi_la: pi_la.into_iter().map(wrap).collect::<Result<_>>()?,
            qla,
            plal,
        })
    }

    /// `plal[l,e] = Σ_t qs[e,t]·qla[l,t] / Σ_t qs[e,t]`, floored and
    /// normalized over layers.
    fn layer_prior(&self, smoothed: &DMatrix<f64>, qla: &DMatrix<f64>) -> DMatrix<f64> {
        let mut mass: Vec<f64> = smoothed.row_iter().map(|r| r.sum()).collect();
        if mass.iter().any(|m| m.abs() <= EMPTY_MASS) {
            mass.iter_mut().for_each(|m| *m += f64::EPSILON);
        }
        // (L×T)·(T×|E|) = L×|E|
        let mut plal = qla * smoothed.transpose();
        for (mut col, &m) in plal.column_iter_mut().zip(&mass) {
            col /= m;
        }
        let floor = self.params.plal_floor;
        plal.apply(|v| {
            if *v < floor {
                *v = floor;
            }
        });
        normalize_columns(&mut plal);
        plal
    }

    /// `wg[e,l]`: backward window sums of the posterior mass of the documents
    /// assigned to layer `l`, normalized over layers.
    fn layer_affinity(&self, q: &DMatrix<f64>, id_layer: &[usize], layers: usize) -> DMatrix<f64> {
        let cells = q.nrows();
        let mut mass = DMatrix::<f64>::zeros(cells, layers);
        for (t, &l) in id_layer.iter().enumerate() {
            mass.column_mut(l).axpy(1.0, &q.column(t), 1.0);
        }
        let mut wg = self
            .backend
            .window_sums(&mass, self.ctx.plan(Anchor::Backward));
        for e in 0..cells {
            let total: f64 = wg.row(e).sum();
            let denom = if self.params.bit_parity || total == 0.0 {
                total + f64::EPSILON
            } else {
                total
            };
            for l in 0..layers {
                wg[(e, l)] /= denom;
            }
        }
        wg
    }
}

/// `ln(T + eps) − ln(#documents containing z + eps)` for every term.
pub fn inverse_document_frequency(data: &DMatrix<f64>) -> Vec<f64> {
    let eps = f64::EPSILON;
    let docs = data.nrows() as f64;
    data.column_iter()
        .map(|col| {
            let present = col.iter().filter(|&&v| v > 0.0).count() as f64;
            (docs + eps).ln() - (present + eps).ln()
        })
        .collect()
}
