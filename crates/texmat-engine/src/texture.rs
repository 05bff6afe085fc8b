//! Texture formats, layouts, and the free/used texture pool.

use std::collections::HashMap;

use texmat_api::{EngineError, Result};

/// Physical channel format of a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TexelFormat {
    /// One f32 per texel (native-float default layout).
    R32Float,
    /// Four f32 per texel (packed layout).
    Rgba32Float,
    /// Four bytes per texel (quantized fallback and image ingestion).
    Rgba8Unorm,
}

impl TexelFormat {
    pub fn wgpu_format(&self) -> wgpu::TextureFormat {
        match self {
            TexelFormat::R32Float => wgpu::TextureFormat::R32Float,
            TexelFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
            TexelFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        }
    }

    pub fn bytes_per_texel(&self) -> usize {
        match self {
            TexelFormat::R32Float => 4,
            TexelFormat::Rgba32Float => 16,
            TexelFormat::Rgba8Unorm => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TexelFormat::R32Float => "r32f",
            TexelFormat::Rgba32Float => "rgba32f",
            TexelFormat::Rgba8Unorm => "rgba8",
        }
    }
}

/// How logical values map onto texels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureLayout {
    /// One value per texel, texture shape from the shape mapper.
    Default,
    /// Four interleaved channel values per texel (image ingestion).
    RgbaColor,
    /// A 2x2 logical block per texel (rank-2 only).
    Packed,
}

impl TextureLayout {
    pub fn as_str(&self) -> &'static str {
        match self {
            TextureLayout::Default => "def",
            TextureLayout::RgbaColor => "rgba",
            TextureLayout::Packed => "pack",
        }
    }
}

/// Pool bucket key. Textures are interchangeable iff all three match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureKey {
    pub rows: usize,
    pub cols: usize,
    pub format: TexelFormat,
}

/// Pool bookkeeping, generic over the pooled resource so the counting
/// rules are testable without a device.
#[derive(Debug)]
pub struct PoolState<T> {
    free: HashMap<TextureKey, Vec<T>>,
    num_used: usize,
    num_free: usize,
    num_allocated: usize,
    disposed: bool,
}

impl<T> Default for PoolState<T> {
    fn default() -> Self {
        PoolState {
            free: HashMap::new(),
            num_used: 0,
            num_free: 0,
            num_allocated: 0,
            disposed: false,
        }
    }
}

impl<T> PoolState<T> {
    pub fn num_used(&self) -> usize {
        self.num_used
    }

    pub fn num_free(&self) -> usize {
        self.num_free
    }

    pub fn num_allocated(&self) -> usize {
        self.num_allocated
    }

    fn guard(&self) -> Result<()> {
        if self.disposed {
            return Err(EngineError::DisposedContextUse(
                "texture pool already disposed".into(),
            ));
        }
        Ok(())
    }

    /// Reuse a free resource for `key`, or allocate one with `make`.
    pub fn acquire(&mut self, key: TextureKey, make: impl FnOnce() -> Result<T>) -> Result<T> {
        self.guard()?;
        if let Some(bucket) = self.free.get_mut(&key) {
            if let Some(item) = bucket.pop() {
                self.num_free -= 1;
                self.num_used += 1;
                log::debug!(
                    "texture pool hit {}x{} {} (used={} free={})",
                    key.rows,
                    key.cols,
                    key.format.as_str(),
                    self.num_used,
                    self.num_free
                );
                return Ok(item);
            }
        }
        let item = make()?;
        self.num_allocated += 1;
        self.num_used += 1;
        log::debug!(
            "texture pool alloc {}x{} {} (allocated={})",
            key.rows,
            key.cols,
            key.format.as_str(),
            self.num_allocated
        );
        Ok(item)
    }

    /// Return a resource to its bucket. No physical free happens here.
    pub fn release(&mut self, key: TextureKey, item: T) -> Result<()> {
        self.guard()?;
        self.num_used -= 1;
        self.num_free += 1;
        self.free.entry(key).or_default().push(item);
        Ok(())
    }

    /// Drain every free resource, zero the counters, and poison the
    /// pool. A second dispose is an error.
    pub fn dispose(&mut self) -> Result<Vec<T>> {
        self.guard()?;
        self.disposed = true;
        let drained = self.free.drain().flat_map(|(_, v)| v).collect();
        self.num_used = 0;
        self.num_free = 0;
        self.num_allocated = 0;
        Ok(drained)
    }
}

/// The engine's texture pool.
#[derive(Debug, Default)]
pub struct TextureManager {
    pool: PoolState<wgpu::Texture>,
}

impl TextureManager {
    pub fn num_used(&self) -> usize {
        self.pool.num_used()
    }

    pub fn num_free(&self) -> usize {
        self.pool.num_free()
    }

    pub fn num_allocated(&self) -> usize {
        self.pool.num_allocated()
    }

    pub fn acquire(
        &mut self,
        ctx: &crate::context::GpuContext,
        key: TextureKey,
    ) -> Result<wgpu::Texture> {
        self.pool.acquire(key, || ctx.create_texture(key))
    }

    pub fn release(&mut self, key: TextureKey, texture: wgpu::Texture) -> Result<()> {
        self.pool.release(key, texture)
    }

    /// Destroy all pooled textures and poison the manager.
    pub fn dispose(&mut self) -> Result<()> {
        for texture in self.pool.dispose()? {
            texture.destroy();
        }
        Ok(())
    }
}
