#![doc = include_str!("../README.md")]

// Public modules (stable-ish surface)
pub mod artifacts;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod layers;
pub mod output;
pub mod params;
pub mod progress;
pub mod sliding;
pub mod tighten;
pub mod types;

// Building blocks – public for tools and benchmarks, less stable.
pub mod backend;
pub mod config;
pub mod histogram;
pub mod io;

// --- High-level re-exports -------------------------------------------------

pub use crate::engine::{check_model, CountingGrid, FitOptions, FitResult};
pub use crate::error::{CgError, Result};
pub use crate::layers::LayeredBundle;
pub use crate::sliding::{SlidingWindowPlan, SlidingWindowTrainer, WindowOutcome};
pub use crate::types::{Emissions, GridGeometry, Posterior};

// --- Prelude ---------------------------------------------------------------

/// Small prelude for quick experiments.
///
/// ```no_run
/// use counting_grids::prelude::*;
/// use nalgebra::DMatrix;
/// use rand::SeedableRng;
///
/// # fn main() -> Result<(), CgError> {
/// let data = DMatrix::from_fn(40, 30, |t, z| ((t + z) % 5) as f64);
/// let grid = CountingGrid::new(&[10, 10], &[3, 3])?;
/// let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0);
/// let options = FitOptions { max_iter: 50, ..Default::default() };
/// let fit = grid.fit(&data, &options, &mut rng, &[], None)?;
/// println!("doc 0 lives at cell {}", fit.q.argmax_cell(0));
/// # Ok(())
/// # }
/// ```
pub mod prelude {
    pub use crate::output::{JsonDirWriter, MemoryWriter, TensorWriter};
    pub use crate::params::{BackendKind, EngineParams, LayerParams};
    pub use crate::progress::{LogProgress, ProgressSink};
    pub use crate::{CgError, CountingGrid, Emissions, FitOptions, FitResult, GridGeometry};
}
