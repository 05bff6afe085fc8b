//! Right-aligned broadcasting rules shared by dispatch and codegen.

use texmat_api::{EngineError, Result};

/// Broadcast two shapes together. Dimensions are aligned from the
/// right; each pair must be equal or contain a 1.
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0usize; rank];
    for i in 0..rank {
        let da = dim_from_right(a, i);
        let db = dim_from_right(b, i);
        if da != db && da != 1 && db != 1 {
            return Err(EngineError::ShapeMismatch(format!(
                "operands {a:?} and {b:?} are incompatible at dimension {} ({da} vs {db})",
                rank - 1 - i
            )));
        }
        out[rank - 1 - i] = da.max(db);
    }
    Ok(out)
}

fn dim_from_right(shape: &[usize], i: usize) -> usize {
    if i < shape.len() {
        shape[shape.len() - 1 - i]
    } else {
        1
    }
}

/// Input-frame indices of the dimensions the input is broadcast along:
/// those where the input has extent 1 and the output extent exceeds 1.
pub fn broadcast_dims(in_shape: &[usize], out_shape: &[usize]) -> Vec<usize> {
    let mut dims = Vec::new();
    for i in 0..in_shape.len() {
        let dim = in_shape.len() - 1 - i;
        let a = in_shape[dim];
        let b = dim_from_right(out_shape, i);
        if b > 1 && a == 1 {
            dims.insert(0, dim);
        }
    }
    dims
}

/// True when the broadcast dims are exactly the leading input axes, so
/// broadcasting reduces to wrapping the flat index modulo the input
/// size.
pub fn broadcast_dims_are_outer(dims: &[usize]) -> bool {
    dims.iter().enumerate().all(|(i, &d)| d == i)
}
