//! Incremental training over overlapping windows of a time-ordered corpus.
//!
//! Documents are assumed sorted by time. The trainer fits one grid per window
//! `[min(i·s, T), min(w + i·s, T))`, seeding every fit with the emissions of
//! the previous one so that the grids stay visually aligned across windows.

use crate::engine::{CountingGrid, FitOptions, FitResult};
use crate::error::{CgError, Result};
use crate::output::TensorWriter;
use crate::progress::ProgressSink;
use log::{debug, warn};
use nalgebra::DMatrix;
use rand::Rng;
use std::sync::Arc;

/// Validated window schedule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlidingWindowPlan {
    documents: usize,
    window: usize,
    stride: usize,
    iterations: Vec<usize>,
}

impl SlidingWindowPlan {
    /// `iterations` holds one EM budget per window and must have
    /// `ceil((T − w) / s) + 1` entries.
    pub fn new(documents: usize, window: usize, stride: usize, iterations: Vec<usize>) -> Result<Self> {
        if window == 0 || window >= documents {
            return Err(CgError::InvalidPlan(format!(
                "window size {window} must satisfy 0 < w < T = {documents}"
            )));
        }
        if stride == 0 {
            return Err(CgError::InvalidPlan("stride must be positive".into()));
        }
        let expected = Self::window_count(documents, window, stride);
        if iterations.len() != expected {
            return Err(CgError::InvalidPlan(format!(
                "need {expected} iteration budgets, got {}",
                iterations.len()
            )));
        }
        Ok(Self {
            documents,
            window,
            stride,
            iterations,
        })
    }

    /// `ceil((T − w) / s) + 1`.
    pub fn window_count(documents: usize, window: usize, stride: usize) -> usize {
        (documents - window).div_ceil(stride) + 1
    }

    pub fn documents(&self) -> usize {
        self.documents
    }

    pub fn iterations(&self) -> &[usize] {
        &self.iterations
    }

    /// `(first_index, last_index)` of every window, half-open. When the
    /// stride exceeds the window the trailing pair can be empty (`(T, T)`).
    pub fn windows(&self) -> Vec<(usize, usize)> {
        let t = self.documents;
        (0..self.iterations.len())
            .map(|i| {
                let offset = i * self.stride;
                (offset.min(t), (self.window + offset).min(t))
            })
            .collect()
    }
}

/// Fit of one window.
#[derive(Clone, Debug)]
pub struct WindowOutcome {
    pub index: usize,
    pub first_index: usize,
    pub last_index: usize,
    pub fit: FitResult,
}

/// Runs a [`SlidingWindowPlan`] with one grid configuration.
#[derive(Clone, Debug)]
pub struct SlidingWindowTrainer {
    grid: CountingGrid,
    plan: SlidingWindowPlan,
    /// Iteration budget of the optional initial fit over `[0, w)`.
    initial_iterations: Option<usize>,
}

impl SlidingWindowTrainer {
    pub fn new(grid: CountingGrid, plan: SlidingWindowPlan) -> Self {
        Self {
            grid,
            plan,
            initial_iterations: None,
        }
    }

    /// Runs a fit over the first window before the schedule starts; its
    /// tensors go to the root writer target.
    pub fn with_initial_fit(mut self, max_iter: usize) -> Self {
        self.initial_iterations = Some(max_iter);
        self
    }

    pub fn plan(&self) -> &SlidingWindowPlan {
        &self.plan
    }

    /// Fits every non-empty window in order. `options` supplies everything
    /// but the iteration budget and the warm start, which the schedule
    /// controls.
    pub fn run<R: Rng + ?Sized>(
        &self,
        data: &DMatrix<f64>,
        options: &FitOptions,
        rng: &mut R,
        sinks: &[Arc<dyn ProgressSink>],
        mut writer: Option<&mut (dyn TensorWriter + '_)>,
    ) -> Result<Vec<WindowOutcome>> {
        if data.nrows() != self.plan.documents {
            return Err(CgError::InvalidPlan(format!(
                "plan covers {} documents, data has {}",
                self.plan.documents,
                data.nrows()
            )));
        }
        if let Some(w) = writer.as_deref() {
            w.validate_target()?;
        }

        let mut pi = options.pi_init.clone();
        if let Some(max_iter) = self.initial_iterations {
            debug!("SlidingWindowTrainer::run initial fit over [0, {})", self.plan.window);
            let first = data.rows(0, self.plan.window).into_owned();
            let initial = FitOptions {
                max_iter,
                pi_init: pi.take(),
                ..options.clone()
            };
            let fit = self
                .grid
                .fit(&first, &initial, rng, sinks, writer.as_deref_mut())?;
            pi = Some(fit.pi);
        }

        let mut outcomes = Vec::with_capacity(self.plan.iterations.len());
        for (index, ((first_index, last_index), &max_iter)) in self
            .plan
            .windows()
            .into_iter()
            .zip(&self.plan.iterations)
            .enumerate()
        {
            if first_index == last_index {
                warn!("SlidingWindowTrainer::run window {index} is empty, skipping");
                continue;
            }
            debug!(
                "SlidingWindowTrainer::run window {} covers [{}, {})",
                index, first_index, last_index
            );
            let slice = data.rows(first_index, last_index - first_index).into_owned();
            let window_options = FitOptions {
                max_iter,
                pi_init: pi.take(),
                ..options.clone()
            };
            let mut window_writer = match writer.as_deref() {
                Some(root) => Some(root.for_window(index)?),
                None => None,
            };
            let fit = self.grid.fit(
                &slice,
                &window_options,
                rng,
                sinks,
                window_writer.as_deref_mut(),
            )?;
            pi = Some(fit.pi.clone());
            outcomes.push(WindowOutcome {
                index,
                first_index,
                last_index,
                fit,
            });
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::MemoryWriter;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn plan_windows_end_at_corpus_length() {
        let plan = SlidingWindowPlan::new(10, 4, 3, vec![1; 3]).unwrap();
        assert_eq!(plan.windows(), vec![(0, 4), (3, 7), (6, 10)]);

        let plan = SlidingWindowPlan::new(11, 4, 3, vec![1; 4]).unwrap();
        let windows = plan.windows();
        assert_eq!(windows.last(), Some(&(9, 11)));
        for pair in windows.windows(2) {
            assert!(pair[0].0 <= pair[1].0 && pair[0].1 <= pair[1].1);
        }
    }

    #[test]
    fn plan_rejects_bad_inputs() {
        assert!(SlidingWindowPlan::new(10, 10, 1, vec![1]).is_err());
        assert!(SlidingWindowPlan::new(10, 0, 1, vec![1; 11]).is_err());
        assert!(SlidingWindowPlan::new(10, 4, 0, vec![1]).is_err());
        assert!(SlidingWindowPlan::new(10, 4, 3, vec![1; 2]).is_err());
    }

    #[test]
    fn every_valid_plan_ends_at_the_corpus_length() {
        for t in 2..=24 {
            for w in 1..t {
                for s in 1..=2 * t {
                    let count = SlidingWindowPlan::window_count(t, w, s);
                    let plan = SlidingWindowPlan::new(t, w, s, vec![1; count])
                        .unwrap_or_else(|e| panic!("T={t} w={w} s={s}: {e}"));
                    let windows = plan.windows();
                    assert_eq!(windows.len(), count);
                    assert_eq!(windows[0], (0, w));
                    assert_eq!(windows.last().map(|p| p.1), Some(t), "T={t} w={w} s={s}");
                    for &(first, last) in &windows {
                        assert!(first <= last && last <= t);
                    }
                    for pair in windows.windows(2) {
                        assert!(pair[0].0 <= pair[1].0 && pair[0].1 <= pair[1].1);
                    }
                }
            }
        }
    }

    #[test]
    fn empty_trailing_window_is_skipped() {
        let data = DMatrix::from_fn(10, 4, |t, z| ((t + z) % 3) as f64);
        let plan = SlidingWindowPlan::new(10, 4, 10, vec![2, 2]).unwrap();
        assert_eq!(plan.windows(), vec![(0, 4), (10, 10)]);
        let grid = CountingGrid::new(&[3, 3], &[2, 2]).unwrap();
        let mut writer = MemoryWriter::new();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let outcomes = SlidingWindowTrainer::new(grid, plan)
            .run(&data, &FitOptions::default(), &mut rng, &[], Some(&mut writer))
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!((outcomes[0].first_index, outcomes[0].last_index), (0, 4));
        let targets: Vec<_> = writer.records().into_iter().map(|r| r.target).collect();
        assert_eq!(targets, vec!["iter0"]);
    }

    #[test]
    fn root_writer_is_usable_after_a_run() {
        let data = DMatrix::from_fn(8, 6, |t, z| ((t * 5 + z) % 3) as f64);
        let grid = CountingGrid::new(&[3, 3], &[2, 2]).unwrap();
        let plan = SlidingWindowPlan::new(8, 5, 3, vec![1, 1]).unwrap();
        let trainer = SlidingWindowTrainer::new(grid.clone(), plan).with_initial_fit(1);
        let mut writer = MemoryWriter::new();
        let mut rng = ChaCha8Rng::seed_from_u64(12);
        {
            let root: &mut dyn TensorWriter = &mut writer;
            trainer
                .run(&data, &FitOptions::default(), &mut rng, &[], Some(&mut *root))
                .unwrap();
            let options = FitOptions {
                max_iter: 1,
                ..FitOptions::default()
            };
            grid.fit(&data, &options, &mut rng, &[], Some(root)).unwrap();
        }
        assert_eq!(writer.records().len(), 4);
    }

    #[test]
    fn windows_are_written_below_the_root_target() {
        let data = DMatrix::from_fn(8, 6, |t, z| ((t * 3 + z) % 4) as f64);
        let grid = CountingGrid::new(&[3, 3], &[2, 2]).unwrap();
        let plan = SlidingWindowPlan::new(8, 5, 3, vec![2, 3]).unwrap();
        let trainer = SlidingWindowTrainer::new(grid, plan).with_initial_fit(2);
        let mut writer = MemoryWriter::new();
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let outcomes = trainer
            .run(&data, &FitOptions::default(), &mut rng, &[], Some(&mut writer))
            .unwrap();

        assert_eq!(outcomes.len(), 2);
        assert_eq!((outcomes[1].first_index, outcomes[1].last_index), (3, 8));
        assert_eq!(outcomes[1].fit.report.iterations, 3);
        assert_eq!(outcomes[0].fit.q.documents(), 5);
        let targets: Vec<_> = writer.records().into_iter().map(|r| r.target).collect();
        assert_eq!(targets, vec!["", "iter0", "iter1"]);
    }

    #[test]
    fn plan_and_data_length_must_agree() {
        let data = DMatrix::from_element(6, 3, 1.0);
        let grid = CountingGrid::new(&[3, 3], &[1, 1]).unwrap();
        let plan = SlidingWindowPlan::new(8, 5, 3, vec![1, 1]).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let err = SlidingWindowTrainer::new(grid, plan)
            .run(&data, &FitOptions::default(), &mut rng, &[], None)
            .unwrap_err();
        assert!(matches!(err, CgError::InvalidPlan(_)));
    }
}
