//! Error type shared by every fallible entry point of the crate.
//!
//! All variants are configuration or pre-flight failures. Numerical trouble
//! inside the EM loop (empty cells, underflowing posteriors) is handled in
//! place and never surfaces here.

use thiserror::Error;

/// Fatal configuration error raised before any training tensor is allocated.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CgError {
    /// Extent and window have a different number of axes.
    #[error("extent has {extent} dimensions but window has {window}")]
    DimensionMismatch { extent: usize, window: usize },
    /// A grid has to have at least one axis.
    #[error("extent and window must have at least one dimension")]
    EmptyGeometry,
    /// Extent or window component that is zero, negative or not a whole number.
    #[error("{what}[{axis}] must be a positive integer, got {value}")]
    InvalidComponent {
        what: &'static str,
        axis: usize,
        value: f64,
    },
    /// Window does not fit strictly inside the extent along one axis.
    #[error("window[{axis}]={window} must be smaller than extent[{axis}]={extent}")]
    WindowExceedsExtent {
        axis: usize,
        window: usize,
        extent: usize,
    },
    /// Emission tensor rank differs from `window.len() + 1`.
    #[error("emission tensor has rank {found}, expected {expected}")]
    RankMismatch { expected: usize, found: usize },
    /// A tensor or vector does not have the shape the geometry requires.
    #[error("{what}: expected shape {expected:?}, found {found:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    /// Grid coordinate with the wrong number of axes.
    #[error("grid cell has {found} coordinates, expected {expected}")]
    CellRankMismatch { expected: usize, found: usize },
    /// Grid coordinate outside the extent.
    #[error("cell {cell:?} lies outside extent {extent:?}")]
    CellOutOfRange { cell: Vec<usize>, extent: Vec<usize> },
    /// Count matrix with negative or non-finite entries.
    #[error("count matrix entry ({row}, {col}) = {value} is not a finite non-negative count")]
    InvalidCounts { row: usize, col: usize, value: f64 },
    /// The count matrix has no documents or no terms.
    #[error("count matrix must have at least one document and one term, got {rows}x{cols}")]
    EmptyData { rows: usize, cols: usize },
    /// The requested numeric backend was not compiled into this build.
    #[error("backend `{0}` is not available in this build")]
    BackendUnavailable(&'static str),
    /// The writer rejected its output location during pre-flight.
    #[error("invalid output target {target}: {reason}")]
    InvalidOutputTarget { target: String, reason: String },
    /// Writing the trained tensors failed.
    #[error("failed to write tensors to {target}: {reason}")]
    Write { target: String, reason: String },
    /// Sliding-window schedule that cannot cover the corpus.
    #[error("invalid sliding-window plan: {0}")]
    InvalidPlan(String),
    /// Any other invalid parameter value.
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    /// Run configuration could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CgError>;
