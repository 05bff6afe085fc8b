//! The closed set of operations the engine can dispatch.
//!
//! Each kernel carries its own shape rule, broadcast behavior, cache
//! tag, and WGSL body; the engine never dispatches on strings.

use crate::broadcast::broadcast_shape;
use texmat_api::{DType, EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel {
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Abs,
    Exp,
    Relu,
    MatMul,
    /// Materialize a numeric tensor from an image-layout operand with
    /// the given channel count (1..=4).
    FromPixels { channels: usize },
}

impl Kernel {
    /// Cache-key tag. Shapes and layouts are keyed separately.
    pub fn tag(&self) -> &'static str {
        match self {
            Kernel::Add => "add",
            Kernel::Sub => "sub",
            Kernel::Mul => "mul",
            Kernel::Div => "div",
            Kernel::Neg => "neg",
            Kernel::Abs => "abs",
            Kernel::Exp => "exp",
            Kernel::Relu => "relu",
            Kernel::MatMul => "matmul",
            Kernel::FromPixels { .. } => "frompixels",
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            Kernel::Add | Kernel::Sub | Kernel::Mul | Kernel::Div | Kernel::MatMul => 2,
            _ => 1,
        }
    }

    /// Operand names used in the generated source, in binding order.
    pub fn input_names(&self) -> &'static [&'static str] {
        match self.arity() {
            2 => &["a", "b"],
            _ => &["x"],
        }
    }

    /// Whether the generated program samples inputs at output
    /// coordinates with broadcasting enabled.
    pub fn broadcasts(&self) -> bool {
        matches!(
            self,
            Kernel::Add | Kernel::Sub | Kernel::Mul | Kernel::Div
        )
    }

    pub fn output_dtype(&self) -> DType {
        match self {
            Kernel::FromPixels { .. } => DType::I32,
            _ => DType::F32,
        }
    }

    pub fn output_shape(&self, input_shapes: &[&[usize]]) -> Result<Vec<usize>> {
        self.check_arity(input_shapes.len())?;
        match self {
            Kernel::Add | Kernel::Sub | Kernel::Mul | Kernel::Div => {
                broadcast_shape(input_shapes[0], input_shapes[1])
            }
            Kernel::Neg | Kernel::Abs | Kernel::Exp | Kernel::Relu => {
                Ok(input_shapes[0].to_vec())
            }
            Kernel::MatMul => {
                let (a, b) = (input_shapes[0], input_shapes[1]);
                if a.len() != 2 || b.len() != 2 {
                    return Err(EngineError::ShapeMismatch(format!(
                        "matmul expects rank-2 operands, got {a:?} and {b:?}"
                    )));
                }
                if a[1] != b[0] {
                    return Err(EngineError::ShapeMismatch(format!(
                        "matmul inner dimensions disagree: {a:?} x {b:?}"
                    )));
                }
                Ok(vec![a[0], b[1]])
            }
            Kernel::FromPixels { channels } => {
                let x = input_shapes[0];
                if !(1..=4).contains(channels) {
                    return Err(EngineError::UnsupportedOp(format!(
                        "frompixels supports 1..=4 channels, got {channels}"
                    )));
                }
                if x.len() != 3 || x[2] != *channels {
                    return Err(EngineError::ShapeMismatch(format!(
                        "frompixels expects a [height, width, {channels}] operand, got {x:?}"
                    )));
                }
                Ok(x.to_vec())
            }
        }
    }

    /// WGSL body defining `fn run_op()`.
    pub fn body(&self, input_shapes: &[&[usize]]) -> Result<String> {
        self.check_arity(input_shapes.len())?;
        let src = match self {
            Kernel::Add => binary_body("+"),
            Kernel::Sub => binary_body("-"),
            Kernel::Mul => binary_body("*"),
            Kernel::Div => binary_body("/"),
            Kernel::Neg => unary_body("-x"),
            Kernel::Abs => unary_body("abs(x)"),
            Kernel::Exp => unary_body("exp(x)"),
            Kernel::Relu => unary_body("max(x, 0.0)"),
            Kernel::MatMul => {
                let shared = input_shapes[0]
                    .get(1)
                    .copied()
                    .ok_or_else(|| EngineError::ShapeMismatch("matmul operand is not rank 2".into()))?;
                format!(
                    "fn run_op() {{\n    let coords = get_output_coords();\n    var sum = 0.0;\n    for (var k = 0; k < {shared}; k = k + 1) {{\n        sum = sum + get_a(coords.x, k) * get_b(k, coords.y);\n    }}\n    set_output(sum);\n}}\n"
                )
            }
            Kernel::FromPixels { .. } => "fn run_op() {\n    let coords = get_output_coords();\n    set_output(get_x(coords.x, coords.y, coords.z));\n}\n"
                .to_string(),
        };
        Ok(src)
    }

    fn check_arity(&self, got: usize) -> Result<()> {
        if got != self.arity() {
            return Err(EngineError::UnsupportedOp(format!(
                "{} takes {} operand(s), got {got}",
                self.tag(),
                self.arity()
            )));
        }
        Ok(())
    }
}

fn binary_body(op: &str) -> String {
    format!(
        "fn run_op() {{\n    let a = get_a_at_out_coords();\n    let b = get_b_at_out_coords();\n    set_output(a {op} b);\n}}\n"
    )
}

fn unary_body(expr: &str) -> String {
    format!(
        "fn run_op() {{\n    let x = get_x_at_out_coords();\n    set_output({expr});\n}}\n"
    )
}
