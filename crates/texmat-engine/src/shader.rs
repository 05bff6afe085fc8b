//! Runtime WGSL generation.
//!
//! `make_shader` is a pure function from operand shape/layout
//! descriptions, the storage mode, and an operation body to a complete
//! WGSL module. Identical inputs always yield byte-identical source,
//! which is what makes program caching by source key sound.
//!
//! The generated module reads its inputs with `textureLoad` through
//! per-operand addressing functions (`get_<name>`), decodes the output
//! texel position from `@builtin(position)`, and writes through
//! `set_output`, whose definition depends on the storage mode.

use crate::broadcast::{broadcast_dims, broadcast_dims_are_outer};
use crate::config::StorageMode;
use crate::shape::{squeeze_shape, strides};
use crate::texture::TextureLayout;
use texmat_api::{EngineError, Result};

/// Shape/layout description of one shader operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputInfo {
    /// WGSL-identifier-safe operand name, e.g. "a".
    pub name: String,
    pub logical_shape: Vec<usize>,
    /// `[rows, cols]` of the backing texture.
    pub tex_shape: [usize; 2],
    pub layout: TextureLayout,
}

/// Shape description of the shader output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputInfo {
    pub logical_shape: Vec<usize>,
    pub tex_shape: [usize; 2],
}

const MAX_RANK: usize = 4;

/// Generate the complete WGSL module for one operation.
///
/// `body` must define `fn run_op()` in terms of the generated samplers,
/// `get_output_coords()` and `set_output(value)`.
pub fn make_shader(
    inputs: &[InputInfo],
    output: &OutputInfo,
    mode: StorageMode,
    broadcast: bool,
    body: &str,
) -> Result<String> {
    if output.logical_shape.len() > MAX_RANK {
        return Err(EngineError::UnsupportedRank {
            rank: output.logical_shape.len(),
        });
    }
    for input in inputs {
        if input.logical_shape.len() > MAX_RANK {
            return Err(EngineError::UnsupportedRank {
                rank: input.logical_shape.len(),
            });
        }
        if input.layout == TextureLayout::Packed {
            return Err(EngineError::UnsupportedOp(format!(
                "packed-layout operand '{}' cannot be sampled by a generated program",
                input.name
            )));
        }
    }

    let mut src = String::with_capacity(4096);
    src.push_str(PRELUDE);

    for (i, input) in inputs.iter().enumerate() {
        src.push_str(&format!(
            "@group(0) @binding({i}) var tex_{}: texture_2d<f32>;\n",
            input.name
        ));
    }
    if mode == StorageMode::Quantized {
        src.push_str(&format!(
            "\nstruct QuantParams {{\n    nan: f32,\n    min_value: f32,\n    max_value: f32,\n    range: f32,\n}}\n@group(0) @binding({}) var<uniform> quant: QuantParams;\n",
            inputs.len()
        ));
    }

    src.push('\n');
    src.push_str(match mode {
        StorageMode::NativeFloat => SAMPLE_SET_NATIVE,
        StorageMode::Quantized => SAMPLE_SET_QUANTIZED,
    });
    if inputs.iter().any(|i| i.layout == TextureLayout::RgbaColor) {
        src.push_str(SAMPLE_DEPTH);
    }

    for input in inputs {
        let tex_var = format!("tex_{}", input.name);
        let fname = format!("get_{}", input.name);
        let flat_name = format!("{fname}_flat");
        src.push_str(&flat_sampler(&flat_name, &tex_var, input.tex_shape));
        src.push_str(&nd_sampler(input, &fname, &flat_name, &tex_var)?);
        if input.layout == TextureLayout::Default
            && (broadcast || input.logical_shape == output.logical_shape)
        {
            src.push_str(&at_out_coords_sampler(input, output, &fname, &tex_var, broadcast));
        }
    }

    src.push_str(&output_coords(output));
    src.push('\n');
    src.push_str(body);
    src.push_str(FRAGMENT_ENTRY);
    Ok(src)
}

/// Fixed module head: fullscreen two-triangle vertex entry, the NaN
/// self-inequality test, and the shared flat-index -> texel helper.
const PRELUDE: &str = r#"@vertex
fn vs_main(@builtin(vertex_index) vertex_index: u32) -> @builtin(position) vec4<f32> {
    var corners = array<vec2<f32>, 6>(
        vec2<f32>(-1.0, -1.0), vec2<f32>(1.0, -1.0), vec2<f32>(-1.0, 1.0),
        vec2<f32>(-1.0, 1.0), vec2<f32>(1.0, -1.0), vec2<f32>(1.0, 1.0),
    );
    return vec4<f32>(corners[vertex_index], 0.0, 1.0);
}

fn is_nan_value(val: f32) -> bool {
    return val != val;
}

fn coords_from_index(tex_num_c: i32, index: i32) -> vec2<i32> {
    let tex_r = index / tex_num_c;
    let tex_c = index - tex_r * tex_num_c;
    return vec2<i32>(tex_r, tex_c);
}

var<private> out_rc: vec2<i32>;
var<private> frag_color: vec4<f32>;

"#;

const SAMPLE_SET_NATIVE: &str = r#"fn sample_texel(t: texture_2d<f32>, rc: vec2<i32>) -> f32 {
    return textureLoad(t, vec2<i32>(rc.y, rc.x), 0).r;
}

fn set_output(value: f32) {
    frag_color = vec4<f32>(value, 0.0, 0.0, 0.0);
}

"#;

const SAMPLE_SET_QUANTIZED: &str = r#"const QUANT_DELTAS: vec4<f32> = vec4<f32>(1.0, 1.0 / 255.0, 1.0 / 65025.0, 1.0 / 16581375.0);

fn sample_texel(t: texture_2d<f32>, rc: vec2<i32>) -> f32 {
    let texel = textureLoad(t, vec2<i32>(rc.y, rc.x), 0);
    if (all(texel == vec4<f32>(0.0))) {
        return quant.nan;
    }
    let planes = floor(texel * 255.0 + 0.5);
    return dot(planes, QUANT_DELTAS) * quant.range + quant.min_value;
}

fn set_output(value: f32) {
    if (is_nan_value(value)) {
        frag_color = vec4<f32>(0.0);
        return;
    }
    let clamped = clamp(value, quant.min_value, quant.max_value);
    let normalized = (clamped - quant.min_value) / quant.range;
    let b = fract(normalized) * 255.0;
    let c = fract(b) * 255.0;
    let d = fract(c) * 255.0;
    frag_color = floor(vec4<f32>(normalized, b, c, d)) / 255.0;
}

"#;

const SAMPLE_DEPTH: &str = r#"fn sample_texel_depth(t: texture_2d<f32>, rc: vec2<i32>, depth: i32) -> f32 {
    let texel = textureLoad(t, vec2<i32>(rc.y, rc.x), 0);
    var value: f32;
    if (depth == 0) {
        value = texel.r;
    } else if (depth == 1) {
        value = texel.g;
    } else if (depth == 2) {
        value = texel.b;
    } else {
        value = texel.a;
    }
    return floor(value * 255.0 + 0.5);
}

"#;

const FRAGMENT_ENTRY: &str = r#"
@fragment
fn fs_main(@builtin(position) frag_pos: vec4<f32>) -> @location(0) vec4<f32> {
    out_rc = vec2<i32>(frag_pos.yx);
    run_op();
    return frag_color;
}
"#;

/// Linear-index sampler for one operand.
fn flat_sampler(flat_name: &str, tex_var: &str, tex_shape: [usize; 2]) -> String {
    let [tex_r, tex_c] = tex_shape;
    let rc = if tex_r == 1 && tex_c == 1 {
        "vec2<i32>(0, 0)".to_string()
    } else if tex_c == 1 {
        "vec2<i32>(index, 0)".to_string()
    } else if tex_r == 1 {
        "vec2<i32>(0, index)".to_string()
    } else {
        format!("coords_from_index({tex_c}, index)")
    };
    format!(
        "fn {flat_name}(index: i32) -> f32 {{\n    return sample_texel({tex_var}, {rc});\n}}\n\n"
    )
}

const ND_PARAMS: [&str; 4] = ["row", "col", "depth", "depth2"];

fn param_list(rank: usize) -> String {
    ND_PARAMS[..rank]
        .iter()
        .map(|p| format!("{p}: i32"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Shape-aware sampler for one operand. Size-1 dimensions are elided by
/// emitting the squeezed-shape sampler under a `_sq` suffix and a
/// forwarding wrapper with the full parameter list.
fn nd_sampler(
    input: &InputInfo,
    fname: &str,
    flat_name: &str,
    tex_var: &str,
) -> Result<String> {
    let shape = &input.logical_shape;
    let [tex_r, tex_c] = input.tex_shape;
    match shape.len() {
        0 => Ok(format!(
            "fn {fname}() -> f32 {{\n    return sample_texel({tex_var}, vec2<i32>(0, 0));\n}}\n\n"
        )),
        1 => Ok(format!(
            "fn {fname}(index: i32) -> f32 {{\n    return {flat_name}(index);\n}}\n\n"
        )),
        2 => {
            if input.layout == TextureLayout::Default && [shape[0], shape[1]] == input.tex_shape {
                return Ok(format!(
                    "fn {fname}(row: i32, col: i32) -> f32 {{\n    return sample_texel({tex_var}, vec2<i32>(row, col));\n}}\n\n"
                ));
            }
            if let Some(forward) = squeezed_sampler(input, fname, flat_name, tex_var)? {
                return Ok(forward);
            }
            let body = if tex_c == 1 {
                format!("vec2<i32>(row * {} + col, 0)", shape[1])
            } else if tex_r == 1 {
                format!("vec2<i32>(0, row * {} + col)", shape[1])
            } else {
                format!("coords_from_index({tex_c}, row * {} + col)", shape[1])
            };
            Ok(format!(
                "fn {fname}(row: i32, col: i32) -> f32 {{\n    return sample_texel({tex_var}, {body});\n}}\n\n"
            ))
        }
        3 => {
            if input.layout == TextureLayout::RgbaColor {
                return Ok(format!(
                    "fn {fname}(row: i32, col: i32, depth: i32) -> f32 {{\n    return sample_texel_depth({tex_var}, vec2<i32>(row, col), depth);\n}}\n\n"
                ));
            }
            if let Some(forward) = squeezed_sampler(input, fname, flat_name, tex_var)? {
                return Ok(forward);
            }
            let st = strides(shape);
            let (stride0, stride1) = (st[0], st[1]);
            let body = if tex_c == stride0 {
                format!("vec2<i32>(row, col * {stride1} + depth)")
            } else if tex_c == stride1 {
                format!("vec2<i32>(row * {} + col, depth)", shape[1])
            } else {
                format!("coords_from_index({tex_c}, row * {stride0} + col * {stride1} + depth)")
            };
            Ok(format!(
                "fn {fname}(row: i32, col: i32, depth: i32) -> f32 {{\n    return sample_texel({tex_var}, {body});\n}}\n\n"
            ))
        }
        4 => {
            if let Some(forward) = squeezed_sampler(input, fname, flat_name, tex_var)? {
                return Ok(forward);
            }
            let st = strides(shape);
            let (stride0, stride1, stride2) = (st[0], st[1], st[2]);
            let body = if tex_c == stride0 {
                format!("vec2<i32>(row, col * {stride1} + depth * {stride2} + depth2)")
            } else if tex_c == stride2 {
                format!(
                    "vec2<i32>(row * {} + col * {} + depth, depth2)",
                    shape[1] * shape[2],
                    shape[2]
                )
            } else {
                format!(
                    "coords_from_index({tex_c}, row * {stride0} + col * {stride1} + depth * {stride2} + depth2)"
                )
            };
            Ok(format!(
                "fn {fname}(row: i32, col: i32, depth: i32, depth2: i32) -> f32 {{\n    return sample_texel({tex_var}, {body});\n}}\n\n"
            ))
        }
        rank => Err(EngineError::UnsupportedRank { rank }),
    }
}

/// If the operand has size-1 dimensions, emit its squeezed-shape
/// sampler plus a forwarding wrapper. Returns `None` when nothing can
/// be squeezed.
fn squeezed_sampler(
    input: &InputInfo,
    fname: &str,
    flat_name: &str,
    tex_var: &str,
) -> Result<Option<String>> {
    let (new_shape, kept_dims) = squeeze_shape(&input.logical_shape);
    if new_shape.len() >= input.logical_shape.len() {
        return Ok(None);
    }
    let squeezed = InputInfo {
        name: input.name.clone(),
        logical_shape: new_shape,
        tex_shape: input.tex_shape,
        layout: input.layout,
    };
    let sq_name = format!("{fname}_sq");
    let inner = nd_sampler(&squeezed, &sq_name, flat_name, tex_var)?;
    let args = kept_dims
        .iter()
        .map(|&d| ND_PARAMS[d].to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let params = param_list(input.logical_shape.len());
    Ok(Some(format!(
        "{inner}fn {fname}({params}) -> f32 {{\n    return {sq_name}({args});\n}}\n\n"
    )))
}

/// Sampler that reads the operand at the output's logical coordinates,
/// covering both broadcast styles: inner-axis broadcast zeroes
/// coordinate components, outer-axis broadcast wraps the flat index
/// modulo the operand size.
fn at_out_coords_sampler(
    input: &InputInfo,
    output: &OutputInfo,
    fname: &str,
    tex_var: &str,
    broadcast: bool,
) -> String {
    let in_rank = input.logical_shape.len();
    let out_rank = output.logical_shape.len();
    let dims = broadcast_dims(&input.logical_shape, &output.logical_shape);
    let rank_diff = out_rank - in_rank;
    let do_broadcast = broadcast && (out_rank > in_rank || !dims.is_empty());
    let over_outer = broadcast_dims_are_outer(&dims);
    let at_name = format!("{fname}_at_out_coords");

    if do_broadcast && !over_outer {
        let coords_snippet = if in_rank == 0 {
            String::new()
        } else if out_rank < 2 && !dims.is_empty() {
            "    coords = 0;\n".to_string()
        } else {
            dims.iter()
                .map(|&d| format!("    coords[{}] = 0;\n", d + rank_diff))
                .collect()
        };
        let args = if in_rank == 0 {
            String::new()
        } else if out_rank < 2 {
            "coords".to_string()
        } else {
            (0..in_rank)
                .map(|i| format!("coords[{}]", i + rank_diff))
                .collect::<Vec<_>>()
                .join(", ")
        };
        return format!(
            "fn {at_name}() -> f32 {{\n    var coords = get_output_coords();\n{coords_snippet}    return {fname}({args});\n}}\n\n"
        );
    }

    if !do_broadcast && input.tex_shape == output.tex_shape {
        return format!(
            "fn {at_name}() -> f32 {{\n    return sample_texel({tex_var}, out_rc);\n}}\n\n"
        );
    }

    let in_size = input.tex_shape[0] * input.tex_shape[1];
    let wrap = if do_broadcast {
        format!("    index = index - (index / {in_size}) * {in_size};\n")
    } else {
        String::new()
    };
    let in_c = input.tex_shape[1];
    let out_c = output.tex_shape[1];
    format!(
        "fn {at_name}() -> f32 {{\n    var index = out_rc.x * {out_c} + out_rc.y;\n{wrap}    let tex_r = index / {in_c};\n    let tex_c = index - tex_r * {in_c};\n    return sample_texel({tex_var}, vec2<i32>(tex_r, tex_c));\n}}\n\n"
    )
}

/// Decoder from the fragment's texel position to the output's logical
/// coordinates.
fn output_coords(output: &OutputInfo) -> String {
    let shape = &output.logical_shape;
    let [tex_r, tex_c] = output.tex_shape;
    match shape.len() {
        0 => "fn get_output_coords() -> i32 {\n    return 0;\n}\n".to_string(),
        1 => {
            let expr = if tex_r == 1 {
                "out_rc.y".to_string()
            } else if tex_c == 1 {
                "out_rc.x".to_string()
            } else {
                format!("out_rc.x * {tex_c} + out_rc.y")
            };
            format!("fn get_output_coords() -> i32 {{\n    return {expr};\n}}\n")
        }
        2 => {
            if [shape[0], shape[1]] == output.tex_shape {
                return "fn get_output_coords() -> vec2<i32> {\n    return out_rc;\n}\n"
                    .to_string();
            }
            let index = format!("out_rc.x * {tex_c} + out_rc.y");
            if shape[1] == 1 {
                return format!(
                    "fn get_output_coords() -> vec2<i32> {{\n    return vec2<i32>({index}, 0);\n}}\n"
                );
            }
            if shape[0] == 1 {
                return format!(
                    "fn get_output_coords() -> vec2<i32> {{\n    return vec2<i32>(0, {index});\n}}\n"
                );
            }
            format!(
                "fn get_output_coords() -> vec2<i32> {{\n    let index = {index};\n    let r = index / {};\n    let c = index - r * {};\n    return vec2<i32>(r, c);\n}}\n",
                shape[1], shape[1]
            )
        }
        3 => {
            let st = strides(shape);
            format!(
                "fn get_output_coords() -> vec3<i32> {{\n    var index = out_rc.x * {tex_c} + out_rc.y;\n    let r = index / {s0};\n    index = index - r * {s0};\n    let c = index / {s1};\n    let d = index - c * {s1};\n    return vec3<i32>(r, c, d);\n}}\n",
                s0 = st[0],
                s1 = st[1]
            )
        }
        _ => {
            let st = strides(shape);
            format!(
                "fn get_output_coords() -> vec4<i32> {{\n    var index = out_rc.x * {tex_c} + out_rc.y;\n    let r = index / {s0};\n    index = index - r * {s0};\n    let c = index / {s1};\n    index = index - c * {s1};\n    let d = index / {s2};\n    let d2 = index - d * {s2};\n    return vec4<i32>(r, c, d, d2);\n}}\n",
                s0 = st[0],
                s1 = st[1],
                s2 = st[2]
            )
        }
    }
}

/// True when every generated identifier for this operand name is a
/// legal WGSL identifier.
pub fn valid_operand_name(name: &str) -> bool {
    !name.is_empty()
        && name.chars().next().is_some_and(|c| c.is_ascii_lowercase())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
