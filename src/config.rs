//! JSON run configuration for the `cg_train` tool.
//!
//! Extent and window are read as plain JSON numbers and validated through
//! [`check_model`], so `[5.5, 4]` or `[0, 3]` are rejected with the same
//! errors as a programmatic call.

use crate::engine::{check_model, FitOptions};
use crate::error::{CgError, Result};
use crate::params::{ArtifactParams, EngineParams};
use crate::types::GridGeometry;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory receiving the tensors; created if missing.
    pub dir: PathBuf,
    /// Write top-terms and document-map JSON next to the tensors.
    pub artifacts: bool,
    /// Terms rendered as grayscale PNG heat maps (2-D grids only).
    pub heatmap_terms: Vec<usize>,
}

/// Sliding-window schedule; absent means a single fit over all documents.
#[derive(Clone, Debug, Deserialize)]
pub struct SlidingConfig {
    pub window: usize,
    pub stride: usize,
    pub iterations: Vec<usize>,
    #[serde(default)]
    pub initial_iterations: Option<usize>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TrainingConfig {
    /// JSON array of count rows, one per document.
    pub counts: PathBuf,
    pub extent: Vec<f64>,
    pub window: Vec<f64>,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub engine: EngineParams,
    #[serde(default)]
    pub fit: FitOptions,
    #[serde(default)]
    pub sliding: Option<SlidingConfig>,
    #[serde(default)]
    pub artifacts: ArtifactParams,
    #[serde(default)]
    pub output: OutputConfig,
}

impl TrainingConfig {
    pub fn geometry(&self) -> Result<GridGeometry> {
        check_model(&self.extent, &self.window, None)
    }
}

pub fn load_config(path: &Path) -> Result<TrainingConfig> {
    let contents = fs::read_to_string(path)
        .map_err(|e| CgError::Config(format!("Failed to read config {}: {e}", path.display())))?;
    parse_config(&contents)
        .map_err(|e| CgError::Config(format!("Failed to parse config {}: {e}", path.display())))
}

pub fn parse_config(json: &str) -> std::result::Result<TrainingConfig, serde_json::Error> {
    serde_json::from_str(json)
}
