//! Host-side value <-> texel codecs.
//!
//! Three encodings exist: native float (a plain `f32` per channel,
//! handled by `bytemuck` casts at the call sites), packed 2x2 (one RGBA
//! texel carries a 2x2 logical block of a matrix), and 8-bit quantized
//! (one RGBA8 texel carries a single float spread across four byte
//! planes of decreasing significance).

use crate::config::QuantRange;

/// Per-plane decode weights for the quantized encoding.
pub const FLOAT_DELTAS: [f64; 4] = [
    1.0,
    1.0 / 255.0,
    1.0 / (255.0 * 255.0),
    1.0 / (255.0 * 255.0 * 255.0),
];
const FLOAT_POWERS: [f64; 3] = [1.0, 255.0, 255.0 * 255.0];

/// All four planes at this value mark a NaN texel.
pub const BYTE_NAN: u8 = 0;

/// Texture shape `[width, height]` for a packed `rows x cols` matrix.
/// Each texel holds a 2x2 block, so both axes are halved, rounded up.
pub fn packed_texture_shape(rows: usize, cols: usize) -> [usize; 2] {
    [(cols + 1) / 2, (rows + 1) / 2]
}

/// Encode floats into 4 bytes each. NaN becomes the all-zero sentinel;
/// finite values are clamped into the quantization window first so the
/// integer plane cannot overflow a byte.
pub fn encode_floats_quantized(values: &[f32], range: QuantRange) -> Vec<u8> {
    let step = range.step() as f64;
    let min = range.min as f64;
    let max = range.max as f64;
    let mut bytes = vec![0u8; values.len() * 4];
    for (i, &v) in values.iter().enumerate() {
        let dst = i * 4;
        if v.is_nan() {
            bytes[dst] = BYTE_NAN;
            bytes[dst + 1] = BYTE_NAN;
            bytes[dst + 2] = BYTE_NAN;
            bytes[dst + 3] = BYTE_NAN;
            continue;
        }
        let clamped = (v as f64).clamp(min, max);
        let normalized = (clamped - min) / step;
        bytes[dst] = normalized.floor() as u8;
        for (j, pow) in FLOAT_POWERS.iter().enumerate() {
            bytes[dst + 1 + j] = (((pow * normalized) % 1.0) * 255.0).floor() as u8;
        }
    }
    bytes
}

/// Inverse of `encode_floats_quantized`.
pub fn decode_floats_quantized(bytes: &[u8], range: QuantRange) -> Vec<f32> {
    let step = range.step() as f64;
    let min = range.min as f64;
    let mut values = vec![0f32; bytes.len() / 4];
    for (i, value) in values.iter_mut().enumerate() {
        let src = i * 4;
        let texel = &bytes[src..src + 4];
        if texel.iter().all(|&b| b == BYTE_NAN) {
            *value = f32::NAN;
            continue;
        }
        let mut dot = 0.0f64;
        for (j, delta) in FLOAT_DELTAS.iter().enumerate() {
            dot += delta * texel[j] as f64;
        }
        *value = (dot * step + min) as f32;
    }
    values
}

/// Worst-case absolute error of a quantized round trip: one step of the
/// finest plane plus floor truncation on each of the four planes.
pub fn quantized_tolerance(range: QuantRange) -> f32 {
    range.step() / (255.0 * 255.0 * 255.0) * 2.0
}

/// Pack a row-major `rows x cols` matrix into RGBA texels, one 2x2
/// block per texel: R=top-left, G=top-right, B=bottom-left,
/// A=bottom-right. Odd edges leave the out-of-range channels zero.
pub fn encode_matrix_packed(matrix: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let [tex_w, tex_h] = packed_texture_shape(rows, cols);
    let mut packed = vec![0f32; tex_w * tex_h * 4];

    let odd_width = cols % 2 == 1;
    let odd_height = rows % 2 == 1;
    let full_blocks_x = cols / 2;
    let full_blocks_y = rows / 2;

    // Full 2x2 blocks.
    let mut dst = 0;
    for block_y in 0..full_blocks_y {
        let src_row = block_y * 2 * cols;
        for block_x in 0..full_blocks_x {
            let src = src_row + block_x * 2;
            packed[dst] = matrix[src];
            packed[dst + 1] = matrix[src + 1];
            packed[dst + 2] = matrix[src + cols];
            packed[dst + 3] = matrix[src + cols + 1];
            dst += 4;
        }
        if odd_width {
            dst += 4;
        }
    }

    // Down the odd final column: R above B, no right half.
    if odd_width {
        let mut src = cols - 1;
        let mut dst = (tex_w - 1) * 4;
        for _ in 0..full_blocks_y {
            packed[dst] = matrix[src];
            packed[dst + 2] = matrix[src + cols];
            src += 2 * cols;
            dst += tex_w * 4;
        }
    }

    // Across the odd final row: R beside G, no bottom half.
    if odd_height {
        let mut src = (rows - 1) * cols;
        let mut dst = (tex_h - 1) * tex_w * 4;
        for _ in 0..full_blocks_x {
            packed[dst] = matrix[src];
            packed[dst + 1] = matrix[src + 1];
            src += 2;
            dst += 4;
        }
    }

    // The odd corner holds a single value in R.
    if odd_width && odd_height {
        let last = packed.len() - 4;
        packed[last] = matrix[matrix.len() - 1];
    }

    packed
}

/// Inverse of `encode_matrix_packed`.
pub fn decode_matrix_packed(packed: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let [tex_w, tex_h] = packed_texture_shape(rows, cols);
    let mut matrix = vec![0f32; rows * cols];

    let odd_width = cols % 2 == 1;
    let odd_height = rows % 2 == 1;
    let full_blocks_x = cols / 2;
    let full_blocks_y = rows / 2;

    let mut src = 0;
    for block_y in 0..full_blocks_y {
        let dst_row = block_y * 2 * cols;
        for block_x in 0..full_blocks_x {
            let dst = dst_row + block_x * 2;
            matrix[dst] = packed[src];
            matrix[dst + 1] = packed[src + 1];
            matrix[dst + cols] = packed[src + 2];
            matrix[dst + cols + 1] = packed[src + 3];
            src += 4;
        }
        if odd_width {
            src += 4;
        }
    }

    if odd_width {
        let mut dst = cols - 1;
        let mut src = (tex_w - 1) * 4;
        for _ in 0..full_blocks_y {
            matrix[dst] = packed[src];
            matrix[dst + cols] = packed[src + 2];
            dst += 2 * cols;
            src += tex_w * 4;
        }
    }

    if odd_height {
        let mut dst = (rows - 1) * cols;
        let mut src = (tex_h - 1) * tex_w * 4;
        for _ in 0..full_blocks_x {
            matrix[dst] = packed[src];
            matrix[dst + 1] = packed[src + 1];
            dst += 2;
            src += 4;
        }
    }

    if odd_width && odd_height {
        let last = matrix.len() - 1;
        matrix[last] = packed[packed.len() - 4];
    }

    matrix
}

/// Extract the leading `channels` components of every RGBA texel as
/// floats in `0..=255`. Used when reading back an image-layout tensor.
pub fn decode_rgba_color(bytes: &[u8], channels: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(bytes.len() / 4 * channels);
    for texel in bytes.chunks_exact(4) {
        for &b in &texel[..channels] {
            out.push(b as f32);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip_quantized(values: &[f32]) -> Vec<f32> {
        let range = QuantRange::default();
        decode_floats_quantized(&encode_floats_quantized(values, range), range)
    }

    #[test]
    fn quantized_round_trip_is_within_tolerance() {
        let values = [0.0, 1.0, -1.0, 0.5, 3.14159, -271.828, 19999.0, -19999.0];
        let decoded = round_trip_quantized(&values);
        let tol = quantized_tolerance(QuantRange::default());
        assert!(tol <= 1e-3, "tolerance {tol} too coarse");
        for (v, d) in values.iter().zip(&decoded) {
            assert!((v - d).abs() <= tol, "{v} decoded as {d}");
        }
    }

    #[test]
    fn quantized_nan_uses_all_zero_sentinel() {
        let range = QuantRange::default();
        let bytes = encode_floats_quantized(&[f32::NAN], range);
        assert_eq!(bytes, vec![BYTE_NAN; 4]);
        assert!(decode_floats_quantized(&bytes, range)[0].is_nan());
    }

    #[test]
    fn quantized_clamps_out_of_window_values() {
        let range = QuantRange::default();
        let decoded = round_trip_quantized(&[1e9, -1e9]);
        let tol = quantized_tolerance(range);
        assert!((decoded[0] - range.max).abs() <= tol);
        // The window minimum collides with the NaN sentinel.
        assert!(decoded[1].is_nan() || (decoded[1] - range.min).abs() <= tol);
    }

    #[test]
    fn packed_shape_halves_both_axes_rounding_up() {
        assert_eq!(packed_texture_shape(4, 6), [3, 2]);
        assert_eq!(packed_texture_shape(5, 6), [3, 3]);
        assert_eq!(packed_texture_shape(4, 7), [4, 2]);
        assert_eq!(packed_texture_shape(1, 1), [1, 1]);
    }

    fn iota(n: usize) -> Vec<f32> {
        (0..n).map(|i| i as f32).collect()
    }

    #[test]
    fn packed_even_grid_round_trips() {
        let m = iota(4 * 6);
        assert_eq!(decode_matrix_packed(&encode_matrix_packed(&m, 4, 6), 4, 6), m);
    }

    #[test]
    fn packed_even_grid_block_channels() {
        // 2x2 matrix [[0,1],[2,3]] is one texel (R,G,B,A) = (0,1,2,3).
        let packed = encode_matrix_packed(&iota(4), 2, 2);
        assert_eq!(packed, vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn packed_odd_column_uses_r_and_b() {
        // 2x3: last column becomes its own texel with values in R and B.
        let packed = encode_matrix_packed(&iota(6), 2, 3);
        assert_eq!(packed, vec![0.0, 1.0, 3.0, 4.0, 2.0, 0.0, 5.0, 0.0]);
        assert_eq!(decode_matrix_packed(&packed, 2, 3), iota(6));
    }

    #[test]
    fn packed_odd_row_uses_r_and_g() {
        // 3x2: last row becomes texels with values in R and G only.
        let packed = encode_matrix_packed(&iota(6), 3, 2);
        assert_eq!(packed, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 0.0, 0.0]);
        assert_eq!(decode_matrix_packed(&packed, 3, 2), iota(6));
    }

    #[test]
    fn packed_odd_corner_round_trips() {
        for (rows, cols) in [(3, 3), (5, 7), (1, 1), (1, 4), (4, 1)] {
            let m = iota(rows * cols);
            assert_eq!(
                decode_matrix_packed(&encode_matrix_packed(&m, rows, cols), rows, cols),
                m,
                "{rows}x{cols}"
            );
        }
    }

    // Small deterministic value generator; keeps values inside the
    // quantization window.
    fn pseudo_random(n: usize) -> Vec<f32> {
        let mut state = 0x2545f491u64;
        (0..n)
            .map(|i| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let v = ((state >> 33) as f32 / (u32::MAX >> 1) as f32 - 0.5) * 30000.0;
                if i % 17 == 0 {
                    f32::NAN
                } else {
                    v
                }
            })
            .collect()
    }

    #[test]
    fn quantized_round_trip_across_matrix_sizes() {
        let range = QuantRange::default();
        let tol = quantized_tolerance(range);
        for (rows, cols) in [(1, 1), (1, 2), (2, 1), (2, 2), (3, 3), (4, 3), (3, 4), (128, 128)] {
            let values = pseudo_random(rows * cols);
            let decoded = decode_floats_quantized(&encode_floats_quantized(&values, range), range);
            for (i, (v, d)) in values.iter().zip(&decoded).enumerate() {
                if v.is_nan() {
                    assert!(d.is_nan(), "{rows}x{cols} element {i}: NaN lost");
                } else {
                    assert!((v - d).abs() <= tol, "{rows}x{cols} element {i}: {v} -> {d}");
                }
            }
        }
    }

    #[test]
    fn rgba_color_extracts_leading_channels() {
        let bytes = [10, 20, 30, 255, 40, 50, 60, 255];
        assert_eq!(decode_rgba_color(&bytes, 1), vec![10.0, 40.0]);
        assert_eq!(
            decode_rgba_color(&bytes, 3),
            vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0]
        );
    }
}
