//! File helpers used by the `cg_train` tool and the JSON writer.
//!
//! - `load_counts`: read a dense `T×Z` count matrix stored as a JSON array of rows.
//! - `write_json_file`: pretty-print a serializable value to disk.
//! - `save_term_heatmap`: render one term of a 2-D emission tensor to a grayscale PNG.
use crate::types::Emissions;
use image::{GrayImage, Luma};
use nalgebra::DMatrix;
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Load a dense count matrix from a JSON array of equally long rows.
pub fn load_counts(path: &Path) -> Result<DMatrix<f64>, String> {
    let text = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read counts {}: {e}", path.display()))?;
    let rows: Vec<Vec<f64>> = serde_json::from_str(&text)
        .map_err(|e| format!("Failed to parse counts {}: {e}", path.display()))?;
    counts_from_rows(&rows).map_err(|e| format!("{}: {e}", path.display()))
}

/// Build a `T×Z` matrix from row vectors.
pub fn counts_from_rows(rows: &[Vec<f64>]) -> Result<DMatrix<f64>, String> {
    let cols = rows.first().map_or(0, Vec::len);
    if let Some((t, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != cols) {
        return Err(format!(
            "row {t} has {} entries, expected {cols}",
            row.len()
        ));
    }
    Ok(DMatrix::from_fn(rows.len(), cols, |t, z| rows[t][z]))
}

/// Serialize a value as pretty JSON to `path`, creating parent directories.
pub fn write_json_file<T: Serialize>(path: &Path, value: &T) -> Result<(), String> {
    ensure_parent_dir(path)?;
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| format!("Failed to serialize JSON for {}: {e}", path.display()))?;
    fs::write(path, json).map_err(|e| format!("Failed to write JSON {}: {e}", path.display()))
}

/// Save term `z` of a two-dimensional emission tensor as a grayscale PNG,
/// scaled so the strongest cell is white.
pub fn save_term_heatmap(pi: &Emissions, z: usize, path: &Path) -> Result<(), String> {
    let [rows, cols] = match pi.extent() {
        &[r, c] => [r, c],
        other => return Err(format!("heat maps need a 2-D grid, got extent {other:?}")),
    };
    if z >= pi.vocab() {
        return Err(format!("term {z} out of range for vocabulary {}", pi.vocab()));
    }
    ensure_parent_dir(path)?;
    let slice = pi.term_slice(z);
    let max = slice.iter().copied().fold(0.0f64, f64::max);
    let scale = if max > 0.0 { 255.0 / max } else { 0.0 };
    let mut out = GrayImage::new(cols as u32, rows as u32);
    for r in 0..rows {
        for c in 0..cols {
            let v = (slice[r * cols + c] * scale).clamp(0.0, 255.0);
            out.put_pixel(c as u32, r as u32, Luma([v as u8]));
        }
    }
    out.save(path)
        .map_err(|e| format!("Failed to save {}: {e}", path.display()))
}

pub(crate) fn ensure_parent_dir(path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create {}: {e}", parent.display()))?;
        }
    }
    Ok(())
}
