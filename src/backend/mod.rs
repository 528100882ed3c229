//! EM kernels behind one interface with interchangeable executors.
//!
//! The counting-grid updates are expressed once, as provided methods of
//! [`EmBackend`], on top of a single primitive: apply a per-column kernel to
//! every column of a matrix. [`DenseBackend`] walks the columns in order on
//! the calling thread, [`ParallelBackend`] hands them to a rayon pool. Both
//! feed every column through the same arithmetic, so swapping backends never
//! changes the trained tensors.
//!
//! Layout conventions
//! - `pi`, `h`: `|E|×Z`, one row per cell.
//! - `q`: `|E|×T`, one column per document.
//! - `data`: `T×Z`, one row per document.

mod dense;
#[cfg(feature = "parallel")]
mod parallel;

pub use dense::DenseBackend;
#[cfg(feature = "parallel")]
pub use parallel::ParallelBackend;

use crate::error::Result;
use crate::histogram::{normalize_rows, Anchor, WindowSumPlan};
use crate::params::{BackendKind, EngineParams};
use crate::types::GridGeometry;
use nalgebra::DMatrix;

/// Per-column kernel: reads one source column, fills one output column.
pub type ColumnKernel<'a> = dyn Fn(&[f64], &mut [f64]) + Sync + 'a;

/// Geometry-dependent state shared by every update of one training run.
#[derive(Clone, Debug)]
pub struct EmContext {
    pub geometry: GridGeometry,
    pub params: EngineParams,
    forward: WindowSumPlan,
    backward: WindowSumPlan,
}

impl EmContext {
    pub fn new(geometry: GridGeometry, params: EngineParams) -> Self {
        let forward = WindowSumPlan::new(&geometry, Anchor::Forward);
        let backward = WindowSumPlan::new(&geometry, Anchor::Backward);
        Self {
            geometry,
            params,
            forward,
            backward,
        }
    }

    pub fn plan(&self, anchor: Anchor) -> &WindowSumPlan {
        match anchor {
            Anchor::Forward => &self.forward,
            Anchor::Backward => &self.backward,
        }
    }

    /// Posterior floor `1 / (factor · |E|)`.
    pub fn min_prob(&self) -> f64 {
        1.0 / (self.params.min_prob_factor * self.geometry.cells() as f64)
    }

    /// `mean(document length) / (|E| · scale)`.
    pub fn pseudocounts(&self, data: &DMatrix<f64>) -> f64 {
        if data.nrows() == 0 {
            return 0.0;
        }
        let mean_len = data.sum() / data.nrows() as f64;
        mean_len / (self.geometry.cells() as f64 * self.params.pseudocount_scale)
    }
}

/// Inputs of one emission update.
pub struct MStep<'a> {
    /// Current emissions.
    pub pi: &'a DMatrix<f64>,
    /// Histogram of the current emissions.
    pub h: &'a DMatrix<f64>,
    /// Current posterior, `|E|×T`.
    pub q: &'a DMatrix<f64>,
    /// Count matrix, `T×Z`.
    pub data: &'a DMatrix<f64>,
    /// Optional per-document weight (layer responsibilities).
    pub doc_weights: Option<&'a [f64]>,
    /// Added to the expected counts before the window aggregation
    /// (`dirichlet prior − 1`).
    pub prior_offset: f64,
    pub pseudocounts: f64,
}

/// One algorithm, several executors.
pub trait EmBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Runs `kernel` over every column of `src`, producing a matrix with
    /// `out_rows` rows and as many columns as `src`.
    fn map_columns(&self, src: &DMatrix<f64>, out_rows: usize, kernel: &ColumnKernel<'_>)
        -> DMatrix<f64>;

    /// Toroidal window sums of every column of `x`.
    fn window_sums(&self, x: &DMatrix<f64>, plan: &WindowSumPlan) -> DMatrix<f64> {
        self.map_columns(x, plan.cells(), &|src: &[f64], dst: &mut [f64]| {
            let mut scratch = Vec::new();
            plan.apply_into(src, &mut scratch, dst);
        })
    }

    /// Emission histogram `h = normalize(ForwardWindowSum(pi))`.
    fn compute_histogram(&self, pi: &DMatrix<f64>, ctx: &EmContext) -> DMatrix<f64> {
        let mut h = self.window_sums(pi, ctx.plan(Anchor::Forward));
        normalize_rows(&mut h);
        h
    }

    /// Per-cell log-likelihood of every document, `|E|×T`:
    /// `s(e,t) = Σ_z data[t,z] · ln(h[e,z] + eps)`.
    fn log_scores(&self, h: &DMatrix<f64>, data: &DMatrix<f64>, eps: f64) -> DMatrix<f64> {
        let log_h = h.map(|v| (v + eps).ln());
        log_h * data.transpose()
    }

    /// Column-wise log-domain softmax with an optional floor-and-renormalize.
    fn normalize_log_scores(&self, scores: &DMatrix<f64>, floor: Option<f64>) -> DMatrix<f64> {
        self.map_columns(scores, scores.nrows(), &|src: &[f64], dst: &mut [f64]| {
            softmax_into(src, dst, floor)
        })
    }

    /// E-step: placement posterior `q` (`|E|×T`) from the current histogram.
    fn update_q(&self, h: &DMatrix<f64>, data: &DMatrix<f64>, ctx: &EmContext) -> DMatrix<f64> {
        let scores = self.log_scores(h, data, ctx.params.alpha);
        self.normalize_log_scores(&scores, Some(ctx.min_prob()))
    }

    /// M-step: new emissions from the current posterior.
    fn update_pi(&self, step: MStep<'_>, ctx: &EmContext) -> DMatrix<f64> {
        let alpha = ctx.params.alpha;
        let window_floor = ctx.geometry.window_volume() as f64 * alpha;

        let expected = match step.doc_weights {
            Some(weights) => {
                let mut weighted = step.data.clone();
                for (mut row, &w) in weighted.row_iter_mut().zip(weights) {
                    row *= w;
                }
                step.q * weighted
            }
            None => step.q * step.data,
        };
        let ratio = expected.zip_map(step.h, |n, hv| (n + step.prior_offset) / (hv + window_floor));

        let mut aggregated = self.window_sums(&ratio, ctx.plan(Anchor::Backward));
        aggregated.apply(|v| {
            if *v < 0.0 {
                *v = 0.0;
            }
        });
        let mut unnormalized =
            aggregated.zip_map(step.pi, |qh, p| step.pseudocounts + qh * (p + alpha));
        normalize_rows(&mut unnormalized);
        unnormalized
    }
}

/// Stable softmax of `src` into `dst`; entries below `floor` are raised to it
/// and the column renormalized.
pub(crate) fn softmax_into(src: &[f64], dst: &mut [f64], floor: Option<f64>) {
    let max = src.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        let uniform = 1.0 / dst.len().max(1) as f64;
        dst.iter_mut().for_each(|v| *v = uniform);
        return;
    }
    let mut total = 0.0;
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = (s - max).exp();
        total += *d;
    }
    for d in dst.iter_mut() {
        *d /= total;
    }
    if let Some(floor) = floor {
        let mut total = 0.0;
        for d in dst.iter_mut() {
            if *d < floor {
                *d = floor;
            }
            total += *d;
        }
        for d in dst.iter_mut() {
            *d /= total;
        }
    }
}

/// Returns the executor for `kind`.
pub fn backend_for(kind: BackendKind) -> Result<Box<dyn EmBackend>> {
    match kind {
        BackendKind::Dense => Ok(Box::new(DenseBackend)),
        #[cfg(feature = "parallel")]
        BackendKind::Parallel => Ok(Box::new(ParallelBackend)),
        #[cfg(not(feature = "parallel"))]
        BackendKind::Parallel => Err(crate::error::CgError::BackendUnavailable(kind.name())),
    }
}
