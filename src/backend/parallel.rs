use super::{ColumnKernel, EmBackend};
use crate::params::BackendKind;
use nalgebra::DMatrix;
use rayon::prelude::*;

/// Distributes columns over the global rayon pool.
///
/// Each column is still processed by exactly the same kernel as
/// [`super::DenseBackend`], so results are bit-identical.
#[derive(Clone, Copy, Debug, Default)]
pub struct ParallelBackend;

impl EmBackend for ParallelBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Parallel
    }

    fn map_columns(
        &self,
        src: &DMatrix<f64>,
        out_rows: usize,
        kernel: &ColumnKernel<'_>,
    ) -> DMatrix<f64> {
        let mut out = DMatrix::zeros(out_rows, src.ncols());
        if src.nrows() == 0 || out_rows == 0 {
            return out;
        }
        src.as_slice()
            .par_chunks(src.nrows())
            .zip(out.as_mut_slice().par_chunks_mut(out_rows))
            .for_each(|(col, dst)| kernel(col, dst));
        out
    }
}
