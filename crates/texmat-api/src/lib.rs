//! Shared data-plane types for the TexMat engine.
//!
//! This crate is dependency-light on purpose: callers that only pass
//! handles around should not pull in the GPU stack.

use serde::{Deserialize, Serialize};

/// Opaque identifier for a tensor registered with an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TensorId(pub u64);

impl std::fmt::Display for TensorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Element type of a tensor as seen by the host.
///
/// On the GPU every value is carried as f32; the dtype governs how
/// host buffers are produced on read and interpreted on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    I32,
    Bool,
}

impl DType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::I32 => "i32",
            DType::Bool => "bool",
        }
    }
}

/// Handle to a tensor living in an engine. Carries everything a caller
/// needs to describe the operand without touching engine internals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorHandle {
    pub id: TensorId,
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl TensorHandle {
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Host-side tensor contents, typed per dtype.
#[derive(Debug, Clone, PartialEq)]
pub enum HostBuffer {
    F32(Vec<f32>),
    I32(Vec<i32>),
    Bool(Vec<bool>),
}

impl HostBuffer {
    pub fn len(&self) -> usize {
        match self {
            HostBuffer::F32(v) => v.len(),
            HostBuffer::I32(v) => v.len(),
            HostBuffer::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            HostBuffer::F32(_) => DType::F32,
            HostBuffer::I32(_) => DType::I32,
            HostBuffer::Bool(_) => DType::Bool,
        }
    }

    /// The contents widened to f32, the form the GPU consumes.
    pub fn to_f32(&self) -> Vec<f32> {
        match self {
            HostBuffer::F32(v) => v.clone(),
            HostBuffer::I32(v) => v.iter().map(|&x| x as f32).collect(),
            HostBuffer::Bool(v) => v.iter().map(|&x| if x { 1.0 } else { 0.0 }).collect(),
        }
    }

    /// Rebuild a typed buffer from f32 values coming off the GPU.
    pub fn from_f32(dtype: DType, values: Vec<f32>) -> Self {
        match dtype {
            DType::F32 => HostBuffer::F32(values),
            DType::I32 => HostBuffer::I32(values.iter().map(|&x| x.round() as i32).collect()),
            DType::Bool => HostBuffer::Bool(values.iter().map(|&x| x != 0.0).collect()),
        }
    }
}

/// An RGBA8 image as ingested by `write_pixels`. `data` holds
/// `width * height * 4` bytes in row-major order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelData {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl PixelData {
    pub fn byte_len(&self) -> usize {
        self.width * self.height * 4
    }
}

/// Error taxonomy of the engine. Every fallible engine entry point
/// returns one of these.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("unsupported rank {rank} (supported: 0..=4)")]
    UnsupportedRank { rank: usize },

    #[error("unsupported operation: {0}")]
    UnsupportedOp(String),

    #[error("size exceeded: logical shape {shape:?} cannot be fit into a texture of at most {max_dim}x{max_dim}")]
    SizeExceeded { shape: Vec<usize>, max_dim: usize },

    #[error("shader compile/link failure: {0}")]
    CompileOrLinkFailure(String),

    #[error("use of disposed context: {0}")]
    DisposedContextUse(String),

    #[error("no suitable GPU device: {0}")]
    DeviceUnavailable(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_buffer_round_trips_through_f32() {
        let b = HostBuffer::I32(vec![-2, 0, 7]);
        let f = b.to_f32();
        assert_eq!(f, vec![-2.0, 0.0, 7.0]);
        assert_eq!(HostBuffer::from_f32(DType::I32, f), b);

        let b = HostBuffer::Bool(vec![true, false, true]);
        assert_eq!(HostBuffer::from_f32(DType::Bool, b.to_f32()), b);
    }

    #[test]
    fn handle_size_is_shape_product() {
        let h = TensorHandle {
            id: TensorId(3),
            shape: vec![2, 3, 4],
            dtype: DType::F32,
        };
        assert_eq!(h.rank(), 3);
        assert_eq!(h.size(), 24);
    }

    #[test]
    fn scalar_handle_has_size_one() {
        let h = TensorHandle {
            id: TensorId(0),
            shape: vec![],
            dtype: DType::F32,
        };
        assert_eq!(h.rank(), 0);
        assert_eq!(h.size(), 1);
    }
}
