//! TexMat: a GPU tensor compute engine built on textures.
//!
//! N-dimensional arrays are stored as 2D textures, one WGSL program is
//! generated and cached per (operation, shape/layout signature), and
//! results stay on the GPU until read. Devices without renderable
//! float textures fall back to an 8-bit quantized encoding
//! transparently.
//!
//! ```no_run
//! use texmat_engine::{Engine, EngineOptions, Kernel};
//! use texmat_api::{DType, HostBuffer};
//!
//! # fn main() -> texmat_api::Result<()> {
//! let mut engine = Engine::new(EngineOptions::default())?;
//! let a = engine.register(&[3, 1], DType::F32)?;
//! let b = engine.register(&[1, 4], DType::F32)?;
//! engine.write(a.id, &HostBuffer::F32(vec![1.0, 2.0, 3.0]))?;
//! engine.write(b.id, &HostBuffer::F32(vec![10.0, 20.0, 30.0, 40.0]))?;
//! let sum = engine.execute_kernel(Kernel::Add, &[&a, &b], None)?;
//! let values = engine.read(sum.id)?;
//! assert_eq!(values.len(), 12);
//! engine.dispose()
//! # }
//! ```

pub mod backend;
pub mod broadcast;
pub mod codec;
pub mod config;
pub mod context;
pub mod ops;
pub mod program;
pub mod shader;
pub mod shape;
pub mod texture;

pub use backend::Engine;
pub use config::{BackoffPolicy, EngineOptions, QuantRange, StorageMode};
pub use context::WriteRegion;
pub use ops::Kernel;

pub use texmat_api::{
    DType, EngineError, HostBuffer, PixelData, Result, TensorHandle, TensorId,
};
