use super::{ColumnKernel, EmBackend};
use crate::params::BackendKind;
use nalgebra::DMatrix;

/// Runs every kernel column by column on the calling thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct DenseBackend;

impl EmBackend for DenseBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Dense
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
        for (col, dst) in src
            .as_slice()
            .chunks(src.nrows())
            .zip(out.as_mut_slice().chunks_mut(out_rows))
        {
            kernel(col, dst);
        }
        out
    }
}
