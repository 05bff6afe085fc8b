//! Logical-shape arithmetic and the logical → texture-shape mapping.

use texmat_api::{EngineError, Result};

pub fn size_of(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Row-major strides, one per dimension, innermost stride 1.
pub fn strides(shape: &[usize]) -> Vec<usize> {
    let rank = shape.len();
    let mut out = vec![1usize; rank];
    for d in (0..rank.saturating_sub(1)).rev() {
        out[d] = out[d + 1] * shape[d + 1];
    }
    out
}

/// Drop all size-1 dimensions. Returns the squeezed shape and, for each
/// kept dimension, its index in the original shape.
pub fn squeeze_shape(shape: &[usize]) -> (Vec<usize>, Vec<usize>) {
    let mut new_shape = Vec::new();
    let mut kept_dims = Vec::new();
    for (d, &s) in shape.iter().enumerate() {
        if s != 1 {
            new_shape.push(s);
            kept_dims.push(d);
        }
    }
    (new_shape, kept_dims)
}

/// Largest factorization `[a, size / a]` with `a <= sqrt(size)`.
fn squarish(size: usize) -> [usize; 2] {
    let mut a = (size as f64).sqrt().floor() as usize;
    while a > 1 {
        if size % a == 0 {
            return [a, size / a];
        }
        a -= 1;
    }
    [1, size]
}

/// Map a logical shape to a `[rows, cols]` texture shape under the
/// device's maximum texture dimension.
///
/// Rank != 2 shapes are squeezed first; rank <= 1 becomes a column,
/// rank 2 is used directly when it fits, rank 3/4 fold trailing
/// dimensions into columns, anything else falls back to a near-square
/// factorization of the element count.
pub fn texture_shape(logical: &[usize], max_dim: usize) -> Result<[usize; 2]> {
    let size = size_of(logical);
    if size == 0 {
        return Err(EngineError::ShapeMismatch(format!(
            "shape {logical:?} has no elements"
        )));
    }
    let squeezed;
    let shape: &[usize] = if logical.len() != 2 {
        squeezed = squeeze_shape(logical).0;
        &squeezed
    } else {
        logical
    };

    let tex = match shape.len() {
        0 | 1 if size <= max_dim => [size, 1],
        2 if shape[0] <= max_dim && shape[1] <= max_dim => [shape[0], shape[1]],
        3 if shape[0] <= max_dim && shape[1] * shape[2] <= max_dim => {
            [shape[0], shape[1] * shape[2]]
        }
        4 if shape[0] <= max_dim && shape[1] * shape[2] * shape[3] <= max_dim => {
            [shape[0], shape[1] * shape[2] * shape[3]]
        }
        _ => squarish(size),
    };

    if tex[0] > max_dim || tex[1] > max_dim {
        return Err(EngineError::SizeExceeded {
            shape: logical.to_vec(),
            max_dim,
        });
    }
    Ok(tex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strides_are_row_major() {
        assert_eq!(strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(strides(&[5]), vec![1]);
        assert_eq!(strides(&[]), Vec::<usize>::new());
    }

    #[test]
    fn squeeze_reports_kept_dims() {
        let (shape, kept) = squeeze_shape(&[1, 3, 1, 4]);
        assert_eq!(shape, vec![3, 4]);
        assert_eq!(kept, vec![1, 3]);

        let (shape, kept) = squeeze_shape(&[1, 1]);
        assert!(shape.is_empty());
        assert!(kept.is_empty());
    }

    #[test]
    fn scalar_and_vector_map_to_column() {
        assert_eq!(texture_shape(&[], 4096).unwrap(), [1, 1]);
        assert_eq!(texture_shape(&[7], 4096).unwrap(), [7, 1]);
    }

    #[test]
    fn rank2_passes_through_when_it_fits() {
        assert_eq!(texture_shape(&[3, 5], 4096).unwrap(), [3, 5]);
        // Rank 2 is never squeezed, even with size-1 dims.
        assert_eq!(texture_shape(&[1, 5], 4096).unwrap(), [1, 5]);
    }

    #[test]
    fn higher_ranks_fold_trailing_dims() {
        assert_eq!(texture_shape(&[2, 3, 4], 4096).unwrap(), [2, 12]);
        assert_eq!(texture_shape(&[2, 3, 4, 5], 4096).unwrap(), [2, 60]);
    }

    #[test]
    fn size1_dims_are_elided_before_mapping() {
        assert_eq!(texture_shape(&[1, 3, 1], 4096).unwrap(), [3, 1]);
        assert_eq!(texture_shape(&[2, 1, 3], 4096).unwrap(), [2, 3]);
    }

    #[test]
    fn oversized_rows_fall_back_to_squarish() {
        // A long vector that cannot stand as a single column.
        assert_eq!(texture_shape(&[12], 5).unwrap(), [3, 4]);
    }

    #[test]
    fn prime_sizes_that_cannot_factor_error_out() {
        let err = texture_shape(&[13], 5).unwrap_err();
        assert!(matches!(err, EngineError::SizeExceeded { .. }));
    }

    #[test]
    fn texture_shape_respects_limit_and_capacity() {
        let shapes: &[&[usize]] = &[
            &[1],
            &[100],
            &[33, 1],
            &[1, 33],
            &[7, 11],
            &[2, 3, 4],
            &[1, 5, 1, 6],
            &[9, 9, 9],
            &[6, 2, 2, 2],
        ];
        for &shape in shapes {
            for max_dim in [16usize, 64, 4096] {
                match texture_shape(shape, max_dim) {
                    Ok([rows, cols]) => {
                        assert!(rows <= max_dim && cols <= max_dim, "{shape:?} @ {max_dim}");
                        assert!(rows * cols >= size_of(shape), "{shape:?} @ {max_dim}");
                    }
                    Err(EngineError::SizeExceeded { .. }) => {}
                    Err(other) => panic!("unexpected error for {shape:?}: {other}"),
                }
            }
        }
    }

    #[test]
    fn zero_size_shapes_are_rejected() {
        let err = texture_shape(&[0, 4], 4096).unwrap_err();
        assert!(matches!(err, EngineError::ShapeMismatch(_)));
    }
}
