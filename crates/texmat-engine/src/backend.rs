//! The engine: tensor records, host I/O, and kernel dispatch.
//!
//! Storage is delayed: `write` only caches values on the host, the
//! texture is created and filled the first time the tensor feeds a
//! kernel, and `read` pulls values back to the host cache and returns
//! the texture to the pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::codec;
use crate::config::{EngineOptions, QuantRange, StorageMode};
use crate::context::{GpuContext, WriteRegion};
use crate::ops::Kernel;
use crate::program::{make_program_key, ProgramCache};
use crate::shader::{make_shader, InputInfo, OutputInfo};
use crate::shape::{size_of, texture_shape};
use crate::texture::{TexelFormat, TextureKey, TextureLayout, TextureManager};
use texmat_api::{DType, EngineError, HostBuffer, PixelData, Result, TensorHandle, TensorId};

const MAX_RANK: usize = 4;

/// Host-side cache of a record's contents.
enum HostValues {
    /// Canonical f32 values, row-major, one per logical element.
    Floats(Vec<f32>),
    /// Raw RGBA bytes for image-layout records.
    Pixels(Vec<u8>),
}

struct TextureRecord {
    shape: Vec<usize>,
    dtype: DType,
    layout: TextureLayout,
    tex_shape: [usize; 2],
    texture: Option<wgpu::Texture>,
    host: Option<HostValues>,
}

impl TextureRecord {
    fn size(&self) -> usize {
        size_of(&self.shape)
    }

    fn texture_key(&self, mode: StorageMode) -> TextureKey {
        let format = match (self.layout, mode) {
            (TextureLayout::Default, StorageMode::NativeFloat) => TexelFormat::R32Float,
            (TextureLayout::Default, StorageMode::Quantized) => TexelFormat::Rgba8Unorm,
            (TextureLayout::Packed, _) => TexelFormat::Rgba32Float,
            (TextureLayout::RgbaColor, _) => TexelFormat::Rgba8Unorm,
        };
        TextureKey {
            rows: self.tex_shape[0],
            cols: self.tex_shape[1],
            format,
        }
    }
}

pub struct Engine {
    ctx: GpuContext,
    textures: TextureManager,
    programs: ProgramCache,
    records: HashMap<TensorId, TextureRecord>,
    next_id: AtomicU64,
    quant_range: QuantRange,
}

impl Engine {
    pub fn new(options: EngineOptions) -> Result<Self> {
        let ctx = GpuContext::new(&options)?;
        Ok(Engine {
            ctx,
            textures: TextureManager::default(),
            programs: ProgramCache::default(),
            records: HashMap::new(),
            next_id: AtomicU64::new(1),
            quant_range: options.quant_range,
        })
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.ctx.storage_mode()
    }

    /// (used, free, allocated) texture pool counters.
    pub fn texture_pool_stats(&self) -> (usize, usize, usize) {
        (
            self.textures.num_used(),
            self.textures.num_free(),
            self.textures.num_allocated(),
        )
    }

    pub fn program_compile_count(&self) -> usize {
        self.programs.compile_count()
    }

    /// Register an empty tensor. Validates rank and that the logical
    /// shape fits a texture on this device.
    pub fn register(&mut self, shape: &[usize], dtype: DType) -> Result<TensorHandle> {
        self.register_record(shape, dtype, TextureLayout::Default, None)
    }

    fn register_record(
        &mut self,
        shape: &[usize],
        dtype: DType,
        layout: TextureLayout,
        host: Option<HostValues>,
    ) -> Result<TensorHandle> {
        if shape.len() > MAX_RANK {
            return Err(EngineError::UnsupportedRank { rank: shape.len() });
        }
        let tex_shape = match layout {
            TextureLayout::RgbaColor => [shape[0], shape[1]],
            TextureLayout::Packed => {
                let [w, h] = codec::packed_texture_shape(shape[0], shape[1]);
                [h, w]
            }
            TextureLayout::Default => texture_shape(shape, self.ctx.max_texture_dim())?,
        };
        let id = TensorId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.records.insert(
            id,
            TextureRecord {
                shape: shape.to_vec(),
                dtype,
                layout,
                tex_shape,
                texture: None,
                host,
            },
        );
        Ok(TensorHandle {
            id,
            shape: shape.to_vec(),
            dtype,
        })
    }

    fn record(&self, id: TensorId) -> Result<&TextureRecord> {
        self.records
            .get(&id)
            .ok_or_else(|| EngineError::DisposedContextUse(format!("tensor {id} is not registered")))
    }

    fn record_mut(&mut self, id: TensorId) -> Result<&mut TextureRecord> {
        self.records
            .get_mut(&id)
            .ok_or_else(|| EngineError::DisposedContextUse(format!("tensor {id} is not registered")))
    }

    /// Replace a tensor's contents. Any resident texture is released;
    /// the upload happens lazily on next use.
    pub fn write(&mut self, id: TensorId, values: &HostBuffer) -> Result<()> {
        let mode = self.ctx.storage_mode();
        let rec = self.record(id)?;
        if values.dtype() != rec.dtype {
            return Err(EngineError::ShapeMismatch(format!(
                "writing {} values into a {} tensor",
                values.dtype().as_str(),
                rec.dtype.as_str()
            )));
        }
        if values.len() != rec.size() {
            return Err(EngineError::ShapeMismatch(format!(
                "writing {} values into shape {:?} ({} elements)",
                values.len(),
                rec.shape,
                rec.size()
            )));
        }
        let floats = values.to_f32();
        self.reset_record_layout(id, TextureLayout::Default, mode)?;
        let rec = self.record_mut(id)?;
        rec.host = Some(HostValues::Floats(floats));
        Ok(())
    }

    /// Store a rank-2 tensor in the packed 2x2-block layout. Only
    /// meaningful with native float storage.
    pub fn write_packed(&mut self, id: TensorId, values: &HostBuffer) -> Result<()> {
        if self.ctx.storage_mode() != StorageMode::NativeFloat {
            return Err(EngineError::UnsupportedOp(
                "packed storage requires native float textures".into(),
            ));
        }
        let mode = self.ctx.storage_mode();
        let rec = self.record(id)?;
        if rec.shape.len() != 2 {
            return Err(EngineError::ShapeMismatch(format!(
                "packed layout is rank-2 only, tensor has shape {:?}",
                rec.shape
            )));
        }
        if values.len() != rec.size() {
            return Err(EngineError::ShapeMismatch(format!(
                "writing {} values into shape {:?}",
                values.len(),
                rec.shape
            )));
        }
        let floats = values.to_f32();
        self.reset_record_layout(id, TextureLayout::Packed, mode)?;
        let rec = self.record_mut(id)?;
        rec.host = Some(HostValues::Floats(floats));
        Ok(())
    }

    /// Drop any resident texture back to the pool and switch the
    /// record to `layout`, recomputing its texture shape.
    fn reset_record_layout(
        &mut self,
        id: TensorId,
        layout: TextureLayout,
        mode: StorageMode,
    ) -> Result<()> {
        let max_dim = self.ctx.max_texture_dim();
        let rec = self.record_mut(id)?;
        let stale_key = rec.texture_key(mode);
        let stale = rec.texture.take();
        rec.layout = layout;
        rec.tex_shape = match layout {
            TextureLayout::Packed => {
                let [w, h] = codec::packed_texture_shape(rec.shape[0], rec.shape[1]);
                [h, w]
            }
            TextureLayout::RgbaColor => [rec.shape[0], rec.shape[1]],
            TextureLayout::Default => texture_shape(&rec.shape, max_dim)?,
        };
        if let Some(texture) = stale {
            self.textures.release(stale_key, texture)?;
        }
        Ok(())
    }

    /// Ingest RGBA image bytes as a `[height, width, channels]` tensor
    /// in image layout, bypassing numeric encoding.
    pub fn write_pixels(&mut self, pixels: &PixelData, channels: usize) -> Result<TensorHandle> {
        if !(1..=4).contains(&channels) {
            return Err(EngineError::UnsupportedOp(format!(
                "write_pixels supports 1..=4 channels, got {channels}"
            )));
        }
        if pixels.data.len() != pixels.byte_len() {
            return Err(EngineError::ShapeMismatch(format!(
                "pixel buffer holds {} bytes, {}x{} RGBA needs {}",
                pixels.data.len(),
                pixels.width,
                pixels.height,
                pixels.byte_len()
            )));
        }
        self.register_record(
            &[pixels.height, pixels.width, channels],
            DType::I32,
            TextureLayout::RgbaColor,
            Some(HostValues::Pixels(pixels.data.clone())),
        )
    }

    /// `write_pixels` followed by a `FromPixels` dispatch, yielding a
    /// numeric tensor and disposing the staging image tensor.
    pub fn from_pixels(&mut self, pixels: &PixelData, channels: usize) -> Result<TensorHandle> {
        let staged = self.write_pixels(pixels, channels)?;
        let result = self.execute_kernel(Kernel::FromPixels { channels }, &[&staged], None);
        self.dispose_tensor(staged.id)?;
        result
    }

    /// Make sure the record's texture exists and holds its host values.
    /// A record that was never written and never computed is an error.
    fn ensure_resident(&mut self, id: TensorId) -> Result<()> {
        let mode = self.ctx.storage_mode();
        let quant_range = self.quant_range;
        let rec = self.record(id)?;
        if rec.texture.is_some() {
            return Ok(());
        }
        let key = rec.texture_key(mode);
        let tex_size = key.rows * key.cols;

        let bytes: Vec<u8> = match (&rec.host, rec.layout) {
            (None, _) => {
                return Err(EngineError::UnsupportedOp(format!(
                    "tensor {id} has never been written or computed"
                )))
            }
            (Some(HostValues::Pixels(p)), TextureLayout::RgbaColor) => p.clone(),
            (Some(HostValues::Pixels(_)), _) => {
                return Err(EngineError::UnsupportedOp(
                    "pixel values on a non-image record".into(),
                ))
            }
            (Some(HostValues::Floats(f)), TextureLayout::Packed) => {
                let packed = codec::encode_matrix_packed(f, rec.shape[0], rec.shape[1]);
                bytemuck::cast_slice(&packed).to_vec()
            }
            (Some(HostValues::Floats(f)), _) => {
                let mut padded = f.clone();
                padded.resize(tex_size, 0.0);
                match mode {
                    StorageMode::NativeFloat => bytemuck::cast_slice(&padded).to_vec(),
                    StorageMode::Quantized => codec::encode_floats_quantized(&padded, quant_range),
                }
            }
        };

        let texture = self.textures.acquire(&self.ctx, key)?;
        self.ctx.upload_texture(&texture, key, &bytes)?;
        let rec = self.record_mut(id)?;
        rec.texture = Some(texture);
        Ok(())
    }

    /// Run one kernel over the given operands and return the (unread)
    /// result tensor.
    pub fn execute_kernel(
        &mut self,
        kernel: Kernel,
        inputs: &[&TensorHandle],
        write_region: Option<WriteRegion>,
    ) -> Result<TensorHandle> {
        let mode = self.ctx.storage_mode();

        // Records are authoritative for shapes and layouts.
        let mut shapes: Vec<Vec<usize>> = Vec::with_capacity(inputs.len());
        let mut infos: Vec<InputInfo> = Vec::with_capacity(inputs.len());
        let names = kernel.input_names();
        if inputs.len() != names.len() {
            return Err(EngineError::UnsupportedOp(format!(
                "{} takes {} operand(s), got {}",
                kernel.tag(),
                names.len(),
                inputs.len()
            )));
        }
        for (handle, name) in inputs.iter().zip(names) {
            let rec = self.record(handle.id)?;
            shapes.push(rec.shape.clone());
            infos.push(InputInfo {
                name: (*name).to_string(),
                logical_shape: rec.shape.clone(),
                tex_shape: rec.tex_shape,
                layout: rec.layout,
            });
        }
        let shape_refs: Vec<&[usize]> = shapes.iter().map(|s| s.as_slice()).collect();
        let out_shape = kernel.output_shape(&shape_refs)?;
        let out_info = OutputInfo {
            logical_shape: out_shape.clone(),
            tex_shape: texture_shape(&out_shape, self.ctx.max_texture_dim())?,
        };
        let quantized = mode == StorageMode::Quantized;
        let out_format = if quantized {
            TexelFormat::Rgba8Unorm
        } else {
            TexelFormat::R32Float
        };

        for handle in inputs {
            self.ensure_resident(handle.id)?;
        }

        let key = make_program_key(kernel.tag(), &infos, &out_info, mode, kernel.broadcasts());
        let body = kernel.body(&shape_refs)?;
        let label = format!("texmat-{}", kernel.tag());
        let ctx = &self.ctx;
        let input_count = infos.len();
        self.programs.get_or_compile(&key, || {
            let source = make_shader(&infos, &out_info, mode, kernel.broadcasts(), &body)?;
            log::debug!("compiling {label} ({} bytes of wgsl)", source.len());
            ctx.compile_program(&source, &label, input_count, quantized, out_format)
        })?;

        let out_handle = self.register_record(
            &out_shape,
            kernel.output_dtype(),
            TextureLayout::Default,
            None,
        )?;
        let out_key = self.record(out_handle.id)?.texture_key(mode);
        let out_texture = self.textures.acquire(&self.ctx, out_key)?;

        let mut input_textures: Vec<&wgpu::Texture> = Vec::with_capacity(inputs.len());
        for handle in inputs {
            let rec = self
                .records
                .get(&handle.id)
                .ok_or_else(|| EngineError::DisposedContextUse(format!("tensor {}", handle.id)))?;
            let texture = rec.texture.as_ref().ok_or_else(|| {
                EngineError::DisposedContextUse(format!("tensor {} lost its texture", handle.id))
            })?;
            input_textures.push(texture);
        }
        let program = self.programs.get(&key).ok_or_else(|| {
            EngineError::CompileOrLinkFailure(format!("program {key} missing from cache"))
        })?;
        let run = self
            .ctx
            .run_program(program, &input_textures, &out_texture, out_key, write_region);
        if let Err(err) = run {
            self.textures.release(out_key, out_texture)?;
            self.records.remove(&out_handle.id);
            return Err(err);
        }

        let rec = self.record_mut(out_handle.id)?;
        rec.texture = Some(out_texture);
        Ok(out_handle)
    }

    /// Read through the blocking path.
    pub fn read_sync(&mut self, id: TensorId) -> Result<HostBuffer> {
        self.read_impl(id, true)
    }

    /// Read through the polled async path (bounded backoff, blocking
    /// fallback).
    pub fn read(&mut self, id: TensorId) -> Result<HostBuffer> {
        self.read_impl(id, false)
    }

    fn read_impl(&mut self, id: TensorId, sync: bool) -> Result<HostBuffer> {
        let mode = self.ctx.storage_mode();
        let quant_range = self.quant_range;
        let rec = self.record(id)?;
        let dtype = rec.dtype;
        let size = rec.size();

        if let Some(HostValues::Floats(f)) = &rec.host {
            return Ok(HostBuffer::from_f32(dtype, f.clone()));
        }
        if let Some(HostValues::Pixels(p)) = &rec.host {
            let channels = rec.shape[2];
            let floats = codec::decode_rgba_color(p, channels);
            return Ok(HostBuffer::from_f32(dtype, floats));
        }

        let key = rec.texture_key(mode);
        let layout = rec.layout;
        let shape = rec.shape.clone();
        let rec = self.record_mut(id)?;
        let texture = rec.texture.take().ok_or_else(|| {
            EngineError::UnsupportedOp(format!("tensor {id} has never been written or computed"))
        })?;

        let bytes = if sync {
            self.ctx.read_texture_sync(&texture, key)
        } else {
            self.ctx.read_texture(&texture, key)
        };
        let bytes = match bytes {
            Ok(b) => b,
            Err(err) => {
                // Put the texture back so the tensor stays readable.
                if let Ok(rec) = self.record_mut(id) {
                    rec.texture = Some(texture);
                }
                return Err(err);
            }
        };
        self.textures.release(key, texture)?;

        let mut floats = match (layout, mode) {
            (TextureLayout::RgbaColor, _) => codec::decode_rgba_color(&bytes, shape[2]),
            (TextureLayout::Packed, _) => {
                // Readback bytes are not f32-aligned; pod_collect copies.
                let texels: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes);
                codec::decode_matrix_packed(&texels, shape[0], shape[1])
            }
            (TextureLayout::Default, StorageMode::NativeFloat) => {
                bytemuck::pod_collect_to_vec(&bytes)
            }
            (TextureLayout::Default, StorageMode::Quantized) => {
                codec::decode_floats_quantized(&bytes, quant_range)
            }
        };
        floats.truncate(size);

        let rec = self.record_mut(id)?;
        rec.host = Some(HostValues::Floats(floats.clone()));
        Ok(HostBuffer::from_f32(dtype, floats))
    }

    /// Drop one tensor, returning its texture to the pool.
    pub fn dispose_tensor(&mut self, id: TensorId) -> Result<()> {
        let mode = self.ctx.storage_mode();
        let rec = self.records.remove(&id).ok_or_else(|| {
            EngineError::DisposedContextUse(format!("tensor {id} is not registered"))
        })?;
        let key = rec.texture_key(mode);
        if let Some(texture) = rec.texture {
            self.textures.release(key, texture)?;
        }
        Ok(())
    }

    /// Tear the engine down: destroy every texture, drop the program
    /// cache, and poison the context. Taking `self` by value makes a
    /// second dispose unrepresentable.
    pub fn dispose(mut self) -> Result<()> {
        let mode = self.ctx.storage_mode();
        let outstanding = self.records.len();
        let records = std::mem::take(&mut self.records);
        for (_, rec) in records {
            let key = rec.texture_key(mode);
            if let Some(texture) = rec.texture {
                self.textures.release(key, texture)?;
            }
        }
        self.textures.dispose()?;
        self.ctx.dispose(outstanding)
    }
}
