//! Parameter types for the training stages.
//!
//! Every constant the EM updates depend on is exposed here with the value the
//! reference models were trained with as its default. Changing them changes
//! the trained tensors, so they travel with a run configuration rather than
//! living as literals in the update code.

use crate::error::{CgError, Result};
use serde::{Deserialize, Serialize};

/// Numeric backend executing the EM kernels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Single-threaded dense nalgebra arrays.
    #[default]
    Dense,
    /// Same kernels spread over a rayon pool (feature `parallel`).
    Parallel,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Dense => "dense",
            BackendKind::Parallel => "parallel",
        }
    }
}

/// Constants of the single-layer EM loop.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineParams {
    /// Additive floor inside every log and divide (`alpha`).
    pub alpha: f64,
    /// `pseudocounts = mean(document length) / (|E| · pseudocount_scale)`.
    pub pseudocount_scale: f64,
    /// Posterior floor is `1 / (min_prob_factor · |E|)`.
    pub min_prob_factor: f64,
    /// Backend used for every `fit` call of the engine.
    pub backend: BackendKind,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            alpha: 1e-10,
            pseudocount_scale: 2.5,
            min_prob_factor: 10.0,
            backend: BackendKind::Dense,
        }
    }
}

/// Knobs of the multi-layer mixture refinement.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LayerParams {
    /// Joint EM rounds after the layers are seeded.
    pub iterations: usize,
    /// First round (0-based) that refreshes the grid posterior from the layers.
    pub q_refresh_from: usize,
    /// Fraction of the fit `noise` added to q before the rounds start.
    pub q_noise_scale: f64,
    /// Symmetric Dirichlet prior on each layer's emissions; `1.0` is flat.
    pub dirichlet_prior: f64,
    /// Lower clamp for the cell-to-layer prior before renormalizing.
    pub plal_floor: f64,
    /// Box kernel used to smooth q before deriving the cell-to-layer prior.
    /// `None` uses the single-cell kernel, i.e. q itself.
    pub plal_smoothing: Option<Vec<usize>>,
    /// Reproduces the historical unconditional epsilon in the layer-affinity
    /// normalizer. Leave off unless matching previously trained artifacts.
    pub bit_parity: bool,
}

impl Default for LayerParams {
    fn default() -> Self {
        Self {
            iterations: 2,
            q_refresh_from: 1,
            q_noise_scale: 0.25,
            dirichlet_prior: 1.0,
            plal_floor: 1e-100,
            plal_smoothing: None,
            bit_parity: false,
        }
    }
}

impl LayerParams {
    /// Checks the values that cannot be repaired numerically.
    pub fn validate(&self, dims: usize) -> Result<()> {
        if !(self.dirichlet_prior.is_finite() && self.dirichlet_prior > 0.0) {
            return Err(CgError::InvalidParameter {
                name: "dirichlet_prior",
                reason: format!("must be positive, got {}", self.dirichlet_prior),
            });
        }
        if !(self.plal_floor.is_finite() && self.plal_floor > 0.0) {
            return Err(CgError::InvalidParameter {
                name: "plal_floor",
                reason: format!("must be positive, got {}", self.plal_floor),
            });
        }
        if let Some(kernel) = &self.plal_smoothing {
            if kernel.len() != dims || kernel.iter().any(|&k| k == 0) {
                return Err(CgError::InvalidParameter {
                    name: "plal_smoothing",
                    reason: format!("need {dims} positive sizes, got {kernel:?}"),
                });
            }
        }
        Ok(())
    }
}

/// Morphological tightening of display emissions.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TightenParams {
    /// Cells with probability strictly above this value form the mask.
    pub threshold: f64,
}

impl Default for TightenParams {
    fn default() -> Self {
        Self { threshold: 1e-3 }
    }
}

/// Display artifact extraction.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ArtifactParams {
    /// Terms listed per cell in the top-terms table.
    pub max_terms: usize,
    /// Minimum smoothed placement mass for a document to appear in a cell.
    pub doc_map_threshold: f64,
    pub tighten: TightenParams,
}

impl Default for ArtifactParams {
    fn default() -> Self {
        Self {
            max_terms: 80,
            doc_map_threshold: 0.01,
            tighten: TightenParams::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_constants() {
        let e = EngineParams::default();
        assert_eq!(e.alpha, 1e-10);
        assert_eq!(e.pseudocount_scale, 2.5);
        assert_eq!(LayerParams::default().iterations, 2);
        assert_eq!(TightenParams::default().threshold, 1e-3);
    }

    #[test]
    fn partial_json_keeps_remaining_defaults() {
        let p: LayerParams = serde_json::from_str(r#"{ "iterations": 5 }"#).unwrap();
        assert_eq!(p.iterations, 5);
        assert_eq!(p.q_refresh_from, 1);
        let b: EngineParams = serde_json::from_str(r#"{ "backend": "parallel" }"#).unwrap();
        assert_eq!(b.backend, BackendKind::Parallel);
    }

    #[test]
    fn smoothing_kernel_rank_is_checked() {
        let p = LayerParams {
            plal_smoothing: Some(vec![3]),
            ..LayerParams::default()
        };
        assert!(p.validate(2).is_err());
        assert!(LayerParams::default().validate(2).is_ok());
    }
}
