//! Writer capability for trained tensors.
//!
//! The engine does not own a file format. At the end of a fit it hands a list
//! of [`NamedTensor`]s to a [`TensorWriter`]; what happens to them is the
//! writer's business. Two writers ship with the crate: [`JsonDirWriter`]
//! stores one pretty JSON file per tensor, [`MemoryWriter`] keeps them in
//! memory for tests and embedders.

use crate::error::{CgError, Result};
use crate::io::write_json_file;
use crate::types::{Emissions, Posterior};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Dense tensor with a row-major (last axis fastest) payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl NamedTensor {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: Vec<f64>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        Self {
            name: name.into(),
            shape,
            data,
        }
    }

    /// Emission tensor with shape `extent ++ [Z]`.
    pub fn from_emissions(name: impl Into<String>, pi: &Emissions) -> Self {
        Self::new(name, pi.shape(), row_major(pi.matrix()))
    }

    /// Posterior with shape `[T] ++ extent`.
    pub fn from_posterior(name: impl Into<String>, q: &Posterior) -> Self {
        let mut shape = vec![q.documents()];
        shape.extend_from_slice(q.extent());
        Self::new(name, shape, q.cell_major().as_slice().to_vec())
    }

    /// Plain matrix with shape `[rows, cols]`.
    pub fn from_matrix(name: impl Into<String>, m: &DMatrix<f64>) -> Self {
        Self::new(name, vec![m.nrows(), m.ncols()], row_major(m))
    }

    /// Several emission tensors stacked on a trailing axis, shape
    /// `extent ++ [Z, L]`.
    pub fn stacked(name: impl Into<String>, layers: &[Emissions]) -> Self {
        let Some(first) = layers.first() else {
            return Self::new(name, vec![0], Vec::new());
        };
        let (cells, vocab, depth) = (first.cells(), first.vocab(), layers.len());
        let mut data = vec![0.0; cells * vocab * depth];
        for (l, layer) in layers.iter().enumerate() {
            let m = layer.matrix();
            for e in 0..cells {
                for z in 0..vocab {
                    data[(e * vocab + z) * depth + l] = m[(e, z)];
                }
            }
        }
        let mut shape = first.shape();
        shape.push(depth);
        Self::new(name, shape, data)
    }

    /// Integer labels stored as floats, shape `[len]`.
    pub fn from_labels(name: impl Into<String>, labels: &[usize]) -> Self {
        Self::new(
            name,
            vec![labels.len()],
            labels.iter().map(|&v| v as f64).collect(),
        )
    }
}

fn row_major(m: &DMatrix<f64>) -> Vec<f64> {
    m.transpose().as_slice().to_vec()
}

/// Persistence collaborator invoked once per fit.
pub trait TensorWriter: Send {
    /// Human-readable description of where tensors go.
    fn target(&self) -> String;

    /// Pre-flight check run before any training tensor is allocated.
    fn validate_target(&self) -> Result<()> {
        Ok(())
    }

    fn write_tensors(&mut self, tensors: &[NamedTensor]) -> Result<()>;

    /// Writer for the `index`-th sliding window (`iter{index}` below this one).
    fn for_window(&self, index: usize) -> Result<Box<dyn TensorWriter>>;
}

/// Writes `<dir>/<name>.json` for every tensor.
#[derive(Clone, Debug)]
pub struct JsonDirWriter {
    dir: PathBuf,
}

impl JsonDirWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl TensorWriter for JsonDirWriter {
    fn target(&self) -> String {
        self.dir.display().to_string()
    }

    fn validate_target(&self) -> Result<()> {
        if self.dir.as_os_str().is_empty() {
            return Err(CgError::InvalidOutputTarget {
                target: self.target(),
                reason: "empty path".into(),
            });
        }
        if !self.dir.is_dir() {
            return Err(CgError::InvalidOutputTarget {
                target: self.target(),
                reason: "directory does not exist".into(),
            });
        }
        Ok(())
    }

    fn write_tensors(&mut self, tensors: &[NamedTensor]) -> Result<()> {
        for tensor in tensors {
            let path = self.dir.join(format!("{}.json", tensor.name));
            write_json_file(&path, tensor).map_err(|reason| CgError::Write {
                target: self.target(),
                reason,
            })?;
        }
        log::debug!("wrote {} tensors to {}", tensors.len(), self.target());
        Ok(())
    }

    fn for_window(&self, index: usize) -> Result<Box<dyn TensorWriter>> {
        let dir = self.dir.join(format!("iter{index}"));
        std::fs::create_dir_all(&dir).map_err(|e| CgError::InvalidOutputTarget {
            target: dir.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Box::new(JsonDirWriter::new(dir)))
    }
}

/// One `write_tensors` call captured by a [`MemoryWriter`].
#[derive(Clone, Debug, PartialEq)]
pub struct WriteRecord {
    pub target: String,
    pub tensors: Vec<NamedTensor>,
}

/// Keeps every write in a shared log; window writers append to the same log.
#[derive(Clone, Debug, Default)]
pub struct MemoryWriter {
    target: String,
    log: Arc<Mutex<Vec<WriteRecord>>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all writes so far, in call order.
    pub fn records(&self) -> Vec<WriteRecord> {
        match self.log.lock() {
            Ok(log) => log.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Tensor `name` from the most recent write to `target`.
    pub fn find(&self, target: &str, name: &str) -> Option<NamedTensor> {
        self.records()
            .into_iter()
            .rev()
            .filter(|r| r.target == target)
            .find_map(|r| r.tensors.into_iter().find(|t| t.name == name))
    }
}

impl TensorWriter for MemoryWriter {
    fn target(&self) -> String {
        self.target.clone()
    }

    fn write_tensors(&mut self, tensors: &[NamedTensor]) -> Result<()> {
        let mut log = self.log.lock().map_err(|_| CgError::Write {
            target: self.target(),
            reason: "memory log poisoned".into(),
        })?;
        log.push(WriteRecord {
            target: self.target.clone(),
            tensors: tensors.to_vec(),
        });
        Ok(())
    }

    fn for_window(&self, index: usize) -> Result<Box<dyn TensorWriter>> {
        let target = if self.target.is_empty() {
            format!("iter{index}")
        } else {
            format!("{}/iter{index}", self.target)
        };
        Ok(Box::new(MemoryWriter {
            target,
            log: Arc::clone(&self.log),
        }))
    }
}
