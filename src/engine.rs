//! Counting-grid training engine.
//!
//! [`CountingGrid`] is immutable configuration: a validated geometry plus the
//! numeric constants. Every [`CountingGrid::fit`] call allocates its own π
//! and q, runs exactly `max_iter` EM iterations, optionally refines a layered
//! mixture on top, hands the tensors to a writer and returns them.
//!
//! Typical usage:
//! ```no_run
//! use counting_grids::prelude::*;
//! use nalgebra::DMatrix;
//! use rand::SeedableRng;
//!
//! let grid = CountingGrid::new(&[8, 8], &[3, 3]).unwrap();
//! let data = DMatrix::from_element(20, 50, 1.0);
//! let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0);
//! let fit = grid
//!     .fit(&data, &FitOptions::default(), &mut rng, &[], None)
//!     .unwrap();
//! println!("{:?}", fit.q.argmax_cell(0));
//! ```

use crate::backend::{backend_for, EmContext, MStep};
use crate::diagnostics::timing::elapsed_ms;
use crate::diagnostics::{FitReport, Stage, TimingBreakdown};
use crate::error::{CgError, Result};
use crate::layers::{LayeredBundle, LayeredExtension};
use crate::output::{NamedTensor, TensorWriter};
use crate::params::{EngineParams, LayerParams};
use crate::progress::{dispatch, percent_complete, ProgressSink};
use crate::types::{Emissions, GridGeometry, Posterior};
use log::debug;
use nalgebra::DMatrix;
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;

/// Per-call options of [`CountingGrid::fit`].
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FitOptions {
    /// Exact number of EM iterations; there is no convergence test.
    pub max_iter: usize,
    /// Scale of the uniform noise used when seeding layers.
    pub noise: f64,
    /// When false only the posterior is updated (π stays at its start value).
    pub learn_pi: bool,
    /// Warm-start emissions, returned as given when π is not learned.
    /// Otherwise every cell starts from a random distribution.
    #[serde(skip)]
    pub pi_init: Option<Emissions>,
    /// Number of mixture layers; `1` skips the layered refinement.
    pub layers: usize,
    /// Record the squared π change of every iteration.
    pub track_pi_change: bool,
    pub layer_params: LayerParams,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            max_iter: 100,
            noise: 1e-6,
            learn_pi: true,
            pi_init: None,
            layers: 1,
            track_pi_change: false,
            layer_params: LayerParams::default(),
        }
    }
}

/// Everything a fit produces.
#[derive(Clone, Debug)]
pub struct FitResult {
    pub pi: Emissions,
    pub q: Posterior,
    pub layered: Option<LayeredBundle>,
    pub report: FitReport,
}

impl FitResult {
    /// The tensors handed to the writer: `{pi, q}`, or the layered bundle.
    pub fn tensors(&self) -> Vec<NamedTensor> {
        match &self.layered {
            Some(bundle) => bundle.tensors(),
            None => vec![
                NamedTensor::from_emissions("pi", &self.pi),
                NamedTensor::from_posterior("q", &self.q),
            ],
        }
    }
}

/// Validates a geometry given as raw numbers and, optionally, an emission
/// tensor that has to live on it.
pub fn check_model(extent: &[f64], window: &[f64], pi: Option<&Emissions>) -> Result<GridGeometry> {
    let geometry = GridGeometry::from_f64(extent, window)?;
    if let Some(pi) = pi {
        check_emissions(&geometry, pi, None)?;
    }
    Ok(geometry)
}

fn check_emissions(geometry: &GridGeometry, pi: &Emissions, vocab: Option<usize>) -> Result<()> {
    if pi.rank() != geometry.dims() + 1 {
        return Err(CgError::RankMismatch {
            expected: geometry.dims() + 1,
            found: pi.rank(),
        });
    }
    let mut expected = geometry.extent().to_vec();
    expected.push(vocab.unwrap_or(pi.vocab()));
    if pi.shape() != expected {
        return Err(CgError::ShapeMismatch {
            what: "emission tensor",
            expected,
            found: pi.shape(),
        });
    }
    Ok(())
}

fn check_data(data: &DMatrix<f64>) -> Result<()> {
    if data.nrows() == 0 || data.ncols() == 0 {
        return Err(CgError::EmptyData {
            rows: data.nrows(),
            cols: data.ncols(),
        });
    }
    for (col, column) in data.column_iter().enumerate() {
        if let Some((row, &value)) = column
            .iter()
            .enumerate()
            .find(|(_, v)| !(v.is_finite() && **v >= 0.0))
        {
            return Err(CgError::InvalidCounts { row, col, value });
        }
    }
    Ok(())
}

/// Sum of squared differences between two equally shaped matrices.
pub(crate) fn squared_change(a: &DMatrix<f64>, b: &DMatrix<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Counting grid over a fixed toroidal geometry.
#[derive(Clone, Debug)]
pub struct CountingGrid {
    geometry: GridGeometry,
    params: EngineParams,
}

impl CountingGrid {
    pub fn new(extent: &[usize], window: &[usize]) -> Result<Self> {
        Ok(Self::from_geometry(GridGeometry::new(extent, window)?))
    }

    pub fn from_geometry(geometry: GridGeometry) -> Self {
        Self {
            geometry,
            params: EngineParams::default(),
        }
    }

    pub fn with_params(mut self, params: EngineParams) -> Self {
        self.params = params;
        self
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    pub fn params(&self) -> &EngineParams {
        &self.params
    }

    /// Fits π and q to a `T×Z` count matrix.
    ///
    /// All validation (data, warm start, layer parameters, backend, writer
    /// target) happens before any training tensor is allocated. Progress
    /// sinks are notified after every iteration; their failures are logged
    /// and ignored. The writer, if any, is called exactly once at the end.
    pub fn fit<R: Rng + ?Sized>(
        &self,
        data: &DMatrix<f64>,
        options: &FitOptions,
        rng: &mut R,
        sinks: &[Arc<dyn ProgressSink>],
        writer: Option<&mut (dyn TensorWriter + '_)>,
    ) -> Result<FitResult> {
        let total_start = Instant::now();
        check_data(data)?;
        if let Some(pi) = &options.pi_init {
            check_emissions(&self.geometry, pi, Some(data.ncols()))?;
        }
        if options.layers == 0 {
            return Err(CgError::InvalidParameter {
                name: "layers",
                reason: "need at least one layer".into(),
            });
        }
        if options.layers > 1 {
            options.layer_params.validate(self.geometry.dims())?;
        }
        let backend = backend_for(self.params.backend)?;
        if let Some(w) = writer.as_deref() {
            w.validate_target()?;
        }

        let (docs, vocab) = data.shape();
        let cells = self.geometry.cells();
        debug!(
            "CountingGrid::fit docs={} vocab={} extent={:?} window={:?} backend={}",
            docs,
            vocab,
            self.geometry.extent(),
            self.geometry.window(),
            backend.kind().name()
        );

        let ctx = EmContext::new(self.geometry.clone(), self.params.clone());
        let mut pi = match &options.pi_init {
            Some(init) => init.matrix().clone(),
            None => Emissions::random(self.geometry.extent(), vocab, rng).into_matrix(),
        };
        let mut h = backend.compute_histogram(&pi, &ctx);
        let mut q = DMatrix::from_element(cells, docs, 1.0 / cells as f64);
        let pseudocounts = ctx.pseudocounts(data);

        let mut timing = TimingBreakdown::default();
        let mut pi_ssd = Vec::new();
        for iteration in 1..=options.max_iter {
            let start = Instant::now();
            q = backend.update_q(&h, data, &ctx);
            if options.learn_pi {
                let updated = backend.update_pi(
                    MStep {
                        pi: &pi,
                        h: &h,
                        q: &q,
                        data,
                        doc_weights: None,
                        prior_offset: 0.0,
                        pseudocounts,
                    },
                    &ctx,
                );
                if options.track_pi_change {
                    pi_ssd.push(squared_change(&pi, &updated));
                }
                pi = updated;
                h = backend.compute_histogram(&pi, &ctx);
            }
            timing.record_since(Stage::EmIteration { index: iteration }, start);
            dispatch(sinks, percent_complete(iteration, options.max_iter));
        }
        debug!("CountingGrid::fit finished {} iterations", options.max_iter);

        let extent = self.geometry.extent().to_vec();
        let pi = Emissions::new(extent.clone(), pi)?;
        let q = Posterior::from_cell_major(extent, q);

        let layered = if options.layers > 1 {
            let start = Instant::now();
            let extension = LayeredExtension::new(backend.as_ref(), &ctx, &options.layer_params);
            let bundle = extension.run(data, &pi, &q, options.layers, options.noise, rng)?;
            timing.record_since(Stage::Layers, start);
            Some(bundle)
        } else {
            None
        };

        timing.total_ms = elapsed_ms(total_start);
        let result = FitResult {
            pi,
            q,
            layered,
            report: FitReport {
                backend: backend.kind(),
                documents: docs,
                vocab,
                cells,
                iterations: options.max_iter,
                layers: options.layers,
                pseudocounts,
                pi_ssd,
                timing,
            },
        };

        if let Some(w) = writer {
            w.write_tensors(&result.tensors())?;
        }
        Ok(result)
    }

    /// Likelihood of an out-of-sample bag of words placed at the window
    /// anchored on `cell`:
    /// `exp(Σ_z count_z · ln(Σ_{k∈window(cell)} π[k,z]) − N · ln|W|)`.
    pub fn predict_probabilities(&self, pi: &Emissions, counts: &[f64], cell: &[usize]) -> Result<f64> {
        let geometry = &self.geometry;
        if cell.len() != geometry.dims() {
            return Err(CgError::CellRankMismatch {
                expected: geometry.dims(),
                found: cell.len(),
            });
        }
        check_emissions(geometry, pi, None)?;
        if counts.len() != pi.vocab() {
            return Err(CgError::ShapeMismatch {
                what: "bag-of-words counts",
                expected: vec![pi.vocab()],
                found: vec![counts.len()],
            });
        }
        if cell.iter().zip(geometry.extent()).any(|(&c, &e)| c >= e) {
            return Err(CgError::CellOutOfRange {
                cell: cell.to_vec(),
                extent: geometry.extent().to_vec(),
            });
        }

        let window = geometry.window_cells(cell);
        let mut log_p = 0.0;
        for (z, &count) in counts.iter().enumerate() {
            if count > 0.0 {
                let column = pi.term_slice(z);
                let mass: f64 = window.iter().map(|&k| column[k]).sum();
                log_p += count * mass.ln();
            }
        }
        let words: f64 = counts.iter().sum();
        let log_window = (geometry.window_volume() as f64).ln();
        Ok((log_p - words * log_window).exp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::MemoryWriter;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol
    }

    fn small_data() -> DMatrix<f64> {
        DMatrix::from_row_slice(
            5,
            7,
            &[
                1.0, 0.0, 2.0, 0.0, 0.0, 1.0, 0.0, //
                0.0, 3.0, 0.0, 1.0, 0.0, 0.0, 0.0, //
                0.0, 0.0, 1.0, 0.0, 4.0, 0.0, 1.0, //
                2.0, 0.0, 0.0, 0.0, 1.0, 0.0, 3.0, //
                0.0, 1.0, 0.0, 2.0, 0.0, 1.0, 0.0,
            ],
        )
    }

    #[test]
    fn check_model_rejects_bad_geometry() {
        assert!(matches!(
            check_model(&[5.0, 5.0], &[2.0], None),
            Err(CgError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            check_model(&[5.0, 5.5], &[2.0, 2.0], None),
            Err(CgError::InvalidComponent { .. })
        ));
        assert!(matches!(
            check_model(&[5.0, 5.0], &[0.0, 2.0], None),
            Err(CgError::InvalidComponent { .. })
        ));
        assert!(matches!(
            check_model(&[5.0, 5.0], &[2.0, 5.0], None),
            Err(CgError::WindowExceedsExtent { .. })
        ));
    }

    #[test]
    fn check_model_rejects_wrong_rank_emissions() {
        let pi = Emissions::constant(&[25], 7, 1.0);
        assert_eq!(
            check_model(&[5.0, 5.0], &[2.0, 3.0], Some(&pi)).unwrap_err(),
            CgError::RankMismatch {
                expected: 3,
                found: 2
            }
        );
    }

    #[test]
    fn single_iteration_from_flat_emissions_gives_uniform_posterior() {
        let grid = CountingGrid::new(&[5, 5], &[2, 3]).unwrap();
        let options = FitOptions {
            max_iter: 1,
            pi_init: Some(Emissions::constant(&[5, 5], 7, 1.0 / 1000.0)),
            ..FitOptions::default()
        };
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let fit = grid.fit(&small_data(), &options, &mut rng, &[], None).unwrap();
        assert!(fit.q.cell_major().iter().all(|&v| approx_eq(v, 0.04, 1e-9)));
    }

    #[test]
    fn posterior_is_stochastic_and_floored() {
        let grid = CountingGrid::new(&[4, 6], &[2, 2]).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let options = FitOptions {
            max_iter: 15,
            track_pi_change: true,
            ..FitOptions::default()
        };
        let fit = grid.fit(&small_data(), &options, &mut rng, &[], None).unwrap();
        let floor = 1.0 / (10.0 * 24.0);
        for t in 0..fit.q.documents() {
            let doc = fit.q.document(t);
            assert!(approx_eq(doc.iter().sum::<f64>(), 1.0, 1e-12));
            assert!(doc.iter().all(|&v| v >= floor * 0.5));
        }
        for row in fit.pi.matrix().row_iter() {
            assert!(approx_eq(row.sum(), 1.0, 1e-12));
        }
        assert_eq!(fit.report.pi_ssd.len(), 15);
        assert_eq!(fit.report.timing.stages.len(), 15);
    }

    #[test]
    fn frozen_emissions_stay_put() {
        let grid = CountingGrid::new(&[3, 3], &[1, 2]).unwrap();
        let init = Emissions::constant(&[3, 3], 7, 1.0 / 7.0);
        let options = FitOptions {
            max_iter: 3,
            learn_pi: false,
            pi_init: Some(init.clone()),
            ..FitOptions::default()
        };
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let fit = grid.fit(&small_data(), &options, &mut rng, &[], None).unwrap();
        assert_eq!(fit.pi, init);
    }

    #[test]
    fn untrained_random_emissions_are_distributions() {
        let grid = CountingGrid::new(&[3, 4], &[2, 2]).unwrap();
        for options in [
            FitOptions {
                max_iter: 0,
                ..FitOptions::default()
            },
            FitOptions {
                max_iter: 3,
                learn_pi: false,
                ..FitOptions::default()
            },
        ] {
            let mut rng = ChaCha8Rng::seed_from_u64(17);
            let fit = grid.fit(&small_data(), &options, &mut rng, &[], None).unwrap();
            for row in fit.pi.matrix().row_iter() {
                assert!(approx_eq(row.sum(), 1.0, 1e-12));
            }
        }
    }

    #[test]
    fn timing_has_one_stage_per_iteration_then_layers() {
        let grid = CountingGrid::new(&[3, 3], &[2, 2]).unwrap();
        let options = FitOptions {
            max_iter: 4,
            layers: 2,
            ..FitOptions::default()
        };
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let fit = grid.fit(&small_data(), &options, &mut rng, &[], None).unwrap();
        let stages: Vec<_> = fit.report.timing.stages.iter().map(|s| s.stage).collect();
        assert_eq!(stages.len(), 5);
        assert_eq!(stages[0], Stage::EmIteration { index: 1 });
        assert_eq!(stages[3], Stage::EmIteration { index: 4 });
        assert_eq!(stages[4], Stage::Layers);
        assert!(fit.report.timing.layers_ms().is_some());
        assert!(fit.report.timing.slowest_iteration().is_some());
    }

    #[test]
    fn warm_start_with_wrong_vocabulary_fails_before_training() {
        let grid = CountingGrid::new(&[3, 3], &[1, 1]).unwrap();
        let options = FitOptions {
            pi_init: Some(Emissions::constant(&[3, 3], 4, 0.25)),
            ..FitOptions::default()
        };
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let err = grid.fit(&small_data(), &options, &mut rng, &[], None).unwrap_err();
        assert!(matches!(err, CgError::ShapeMismatch { .. }));
    }

    #[test]
    fn negative_counts_are_rejected() {
        let grid = CountingGrid::new(&[3, 3], &[1, 1]).unwrap();
        let mut data = small_data();
        data[(2, 3)] = -1.0;
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let err = grid
            .fit(&data, &FitOptions::default(), &mut rng, &[], None)
            .unwrap_err();
        assert_eq!(
            err,
            CgError::InvalidCounts {
                row: 2,
                col: 3,
                value: -1.0
            }
        );
    }

    #[test]
    fn writer_receives_pi_and_q_once() {
        let grid = CountingGrid::new(&[3, 4], &[2, 2]).unwrap();
        let mut writer = MemoryWriter::new();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let options = FitOptions {
            max_iter: 2,
            ..FitOptions::default()
        };
        grid.fit(&small_data(), &options, &mut rng, &[], Some(&mut writer))
            .unwrap();
        let records = writer.records();
        assert_eq!(records.len(), 1);
        let names: Vec<_> = records[0].tensors.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["pi", "q"]);
        assert_eq!(records[0].tensors[1].shape, vec![5, 3, 4]);
    }

    #[test]
    fn predict_uses_wrapped_window_mass() {
        let grid = CountingGrid::new(&[3, 3], &[2, 2]).unwrap();
        let pi = Emissions::constant(&[3, 3], 2, 0.5);
        // Every window holds mass 4 · 0.5 = 2 per term, so p = (2 / 4)^N.
        let p = grid
            .predict_probabilities(&pi, &[1.0, 2.0], &[2, 2])
            .unwrap();
        assert!(approx_eq(p, 0.5f64.powi(3), 1e-12));
    }

    #[test]
    fn predict_validates_inputs() {
        let grid = CountingGrid::new(&[3, 3], &[2, 2]).unwrap();
        let pi = Emissions::constant(&[3, 3], 2, 0.5);
        assert!(matches!(
            grid.predict_probabilities(&pi, &[1.0, 0.0], &[1]),
            Err(CgError::CellRankMismatch { .. })
        ));
        assert!(matches!(
            grid.predict_probabilities(&pi, &[1.0], &[1, 1]),
            Err(CgError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            grid.predict_probabilities(&pi, &[1.0, 0.0], &[3, 0]),
            Err(CgError::CellOutOfRange { .. })
        ));
    }
}
