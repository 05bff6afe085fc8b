//! Device/queue wrapper: texture allocation and transfer, program
//! compilation, draw dispatch, and readback.

use std::borrow::Cow;

use wgpu::util::DeviceExt;

use crate::config::{BackoffPolicy, EngineOptions, StorageMode};
use crate::program::ProgramBinary;
use crate::texture::{TexelFormat, TextureKey};
use texmat_api::{EngineError, Result};

/// Sub-rectangle of the output texture a dispatch is allowed to write,
/// in texel coordinates. Everything outside reads back as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRegion {
    pub row: usize,
    pub col: usize,
    pub rows: usize,
    pub cols: usize,
}

pub struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    storage_mode: StorageMode,
    max_texture_dim: usize,
    debug_validation: bool,
    backoff: BackoffPolicy,
    /// `{nan, min, max, range}`, bound by every quantized program.
    quant_uniform: Option<wgpu::Buffer>,
    disposed: bool,
}

impl GpuContext {
    pub fn new(options: &EngineOptions) -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: options.power_preference,
            force_fallback_adapter: options.force_fallback_adapter,
            compatible_surface: None,
        }))
        .ok_or_else(|| EngineError::DeviceUnavailable("no compatible adapter".into()))?;

        let info = adapter.get_info();
        log::info!(
            "texmat adapter: {} ({:?}, {:?})",
            info.name,
            info.backend,
            info.device_type
        );

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("texmat-device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults()
                    .using_resolution(adapter.limits()),
            },
            None,
        ))
        .map_err(|e| EngineError::DeviceUnavailable(format!("request_device failed: {e}")))?;
        device.on_uncaptured_error(Box::new(|err| {
            log::error!("uncaptured device error: {err}");
        }));

        let detected = detect_storage_mode(&adapter);
        let storage_mode = options.forced_storage_mode.unwrap_or(detected);
        if storage_mode == StorageMode::Quantized {
            log::warn!("float render targets unavailable or overridden; using 8-bit quantized storage");
        } else {
            log::info!("using native float storage");
        }

        let hw_max = device.limits().max_texture_dimension_2d as usize;
        let max_texture_dim = match options.max_texture_dim {
            Some(forced) => (forced as usize).min(hw_max),
            None => hw_max,
        };

        let quant_uniform = if storage_mode == StorageMode::Quantized {
            let r = options.quant_range;
            let params = [f32::NAN, r.min, r.max, r.step()];
            Some(device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("texmat-quant-params"),
                contents: bytemuck::cast_slice(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            }))
        } else {
            None
        };

        Ok(GpuContext {
            device,
            queue,
            storage_mode,
            max_texture_dim,
            debug_validation: options.debug_validation,
            backoff: options.read_backoff.clone(),
            quant_uniform,
            disposed: false,
        })
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.storage_mode
    }

    pub fn max_texture_dim(&self) -> usize {
        self.max_texture_dim
    }

    fn guard(&self) -> Result<()> {
        if self.disposed {
            return Err(EngineError::DisposedContextUse(
                "GPU context already disposed".into(),
            ));
        }
        Ok(())
    }

    fn debug_scope_begin(&self) {
        if self.debug_validation {
            self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        }
    }

    fn debug_scope_end(&self, what: &str) -> Result<()> {
        if !self.debug_validation {
            return Ok(());
        }
        self.device.poll(wgpu::Maintain::Poll);
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(EngineError::CompileOrLinkFailure(format!(
                "validation failed during {what}: {err}"
            )));
        }
        Ok(())
    }

    pub fn create_texture(&self, key: TextureKey) -> Result<wgpu::Texture> {
        self.guard()?;
        if key.rows == 0
            || key.cols == 0
            || key.rows > self.max_texture_dim
            || key.cols > self.max_texture_dim
        {
            return Err(EngineError::SizeExceeded {
                shape: vec![key.rows, key.cols],
                max_dim: self.max_texture_dim,
            });
        }
        self.debug_scope_begin();
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("texmat-tensor"),
            size: wgpu::Extent3d {
                width: key.cols as u32,
                height: key.rows as u32,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: key.format.wgpu_format(),
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        self.debug_scope_end("create_texture")?;
        Ok(texture)
    }

    /// Fire-and-forget upload of the full texture contents.
    pub fn upload_texture(
        &self,
        texture: &wgpu::Texture,
        key: TextureKey,
        bytes: &[u8],
    ) -> Result<()> {
        self.guard()?;
        let expected = key.rows * key.cols * key.format.bytes_per_texel();
        if bytes.len() != expected {
            return Err(EngineError::ShapeMismatch(format!(
                "upload of {} bytes into a {}x{} {} texture (expected {expected})",
                bytes.len(),
                key.rows,
                key.cols,
                key.format.as_str()
            )));
        }
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytes,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some((key.cols * key.format.bytes_per_texel()) as u32),
                rows_per_image: Some(key.rows as u32),
            },
            wgpu::Extent3d {
                width: key.cols as u32,
                height: key.rows as u32,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    /// Build a render pipeline from generated source. Compile and link
    /// diagnostics are captured through a validation error scope; on
    /// failure the source is logged with line numbers and the offending
    /// line marked.
    pub fn compile_program(
        &self,
        source: &str,
        label: &str,
        input_count: usize,
        quantized: bool,
        output_format: TexelFormat,
    ) -> Result<ProgramBinary> {
        self.guard()?;
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(source)),
        });

        let mut entries: Vec<wgpu::BindGroupLayoutEntry> =
            (0..input_count).map(|i| texture_entry(i as u32)).collect();
        if quantized {
            entries.push(uniform_entry(input_count as u32));
        }
        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(&format!("{label}-layout")),
                entries: &entries,
            });
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(&format!("{label}-pipeline-layout")),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
        let pipeline = self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &module,
                    entry_point: "vs_main",
                    buffers: &[],
                },
                primitive: wgpu::PrimitiveState::default(),
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                fragment: Some(wgpu::FragmentState {
                    module: &module,
                    entry_point: "fs_main",
                    targets: &[Some(wgpu::ColorTargetState {
                        format: output_format.wgpu_format(),
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                multiview: None,
            });

        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            let message = err.to_string();
            log_annotated_source(source, &message);
            return Err(EngineError::CompileOrLinkFailure(message));
        }

        Ok(ProgramBinary {
            pipeline,
            layout,
            input_count,
            quantized,
        })
    }

    /// One fullscreen two-triangle draw with viewport and scissor sized
    /// to the output texture. A write region narrows the scissor only;
    /// the attachment is cleared first, so texels outside the region
    /// come back zero even when the texture is reused from the pool.
    pub fn run_program(
        &self,
        program: &ProgramBinary,
        inputs: &[&wgpu::Texture],
        output: &wgpu::Texture,
        out_key: TextureKey,
        write_region: Option<WriteRegion>,
    ) -> Result<()> {
        self.guard()?;
        if inputs.len() != program.input_count {
            return Err(EngineError::UnsupportedOp(format!(
                "program expects {} bound textures, got {}",
                program.input_count,
                inputs.len()
            )));
        }
        let (sx, sy, sw, sh) = match write_region {
            Some(r) => {
                if r.rows == 0
                    || r.cols == 0
                    || r.row + r.rows > out_key.rows
                    || r.col + r.cols > out_key.cols
                {
                    return Err(EngineError::ShapeMismatch(format!(
                        "write region {r:?} exceeds output texture {}x{}",
                        out_key.rows, out_key.cols
                    )));
                }
                (r.col, r.row, r.cols, r.rows)
            }
            None => (0, 0, out_key.cols, out_key.rows),
        };

        self.debug_scope_begin();
        let views: Vec<wgpu::TextureView> = inputs
            .iter()
            .map(|t| t.create_view(&wgpu::TextureViewDescriptor::default()))
            .collect();
        let mut entries: Vec<wgpu::BindGroupEntry> = views
            .iter()
            .enumerate()
            .map(|(i, view)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: wgpu::BindingResource::TextureView(view),
            })
            .collect();
        if program.quantized {
            let buffer = self.quant_uniform.as_ref().ok_or_else(|| {
                EngineError::UnsupportedOp(
                    "quantized program dispatched on a native-float context".into(),
                )
            })?;
            entries.push(wgpu::BindGroupEntry {
                binding: inputs.len() as u32,
                resource: buffer.as_entire_binding(),
            });
        }
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("texmat-operands"),
            layout: &program.layout,
            entries: &entries,
        });

        let out_view = output.create_view(&wgpu::TextureViewDescriptor::default());
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("texmat-dispatch"),
            });
        {
            let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("texmat-draw"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &out_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        // Pooled textures keep their previous contents.
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            rpass.set_pipeline(&program.pipeline);
            rpass.set_bind_group(0, &bind_group, &[]);
            rpass.set_viewport(0.0, 0.0, out_key.cols as f32, out_key.rows as f32, 0.0, 1.0);
            rpass.set_scissor_rect(sx as u32, sy as u32, sw as u32, sh as u32);
            rpass.draw(0..6, 0..1);
        }
        self.queue.submit(Some(encoder.finish()));
        self.debug_scope_end("draw")?;
        Ok(())
    }

    /// Blocking readback: copy to a mappable staging buffer, wait for
    /// the queue, map, and strip the row padding.
    pub fn read_texture_sync(&self, texture: &wgpu::Texture, key: TextureKey) -> Result<Vec<u8>> {
        self.guard()?;
        let staging = self.begin_readback(texture, key);
        let slice = staging.buffer.slice(..);
        let (tx, rx) = futures::channel::oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        self.device.poll(wgpu::Maintain::Wait);
        let mapped = pollster::block_on(rx)
            .map_err(|_| EngineError::DeviceUnavailable("readback channel canceled".into()))?;
        mapped.map_err(|e| EngineError::DeviceUnavailable(format!("readback map failed: {e:?}")))?;
        Ok(staging.take_rows())
    }

    /// Polled readback: spin on `Maintain::Poll` under the configured
    /// backoff, falling back to a blocking wait when the poll budget is
    /// exhausted.
    pub fn read_texture(&self, texture: &wgpu::Texture, key: TextureKey) -> Result<Vec<u8>> {
        self.guard()?;
        let staging = self.begin_readback(texture, key);
        let slice = staging.buffer.slice(..);
        let (tx, mut rx) = futures::channel::oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });

        let mut attempt = 0u32;
        let mapped = loop {
            self.device.poll(wgpu::Maintain::Poll);
            match rx.try_recv() {
                Ok(Some(res)) => break res,
                Ok(None) => {}
                Err(_) => {
                    return Err(EngineError::DeviceUnavailable(
                        "readback channel canceled".into(),
                    ))
                }
            }
            if attempt >= self.backoff.max_attempts {
                log::debug!("readback poll budget exhausted after {attempt} attempts; blocking");
                self.device.poll(wgpu::Maintain::Wait);
                break pollster::block_on(rx).map_err(|_| {
                    EngineError::DeviceUnavailable("readback channel canceled".into())
                })?;
            }
            std::thread::sleep(self.backoff.delay_for(attempt));
            attempt += 1;
        };
        mapped.map_err(|e| EngineError::DeviceUnavailable(format!("readback map failed: {e:?}")))?;
        Ok(staging.take_rows())
    }

    fn begin_readback(&self, texture: &wgpu::Texture, key: TextureKey) -> ReadbackStaging {
        let unpadded = key.cols * key.format.bytes_per_texel();
        let padded = padded_bytes_per_row(unpadded);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("texmat-readback"),
            size: (padded * key.rows) as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("texmat-readback"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded as u32),
                    rows_per_image: Some(key.rows as u32),
                },
            },
            wgpu::Extent3d {
                width: key.cols as u32,
                height: key.rows as u32,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));
        ReadbackStaging {
            buffer,
            padded,
            unpadded,
            rows: key.rows,
        }
    }

    /// Flush outstanding work and poison the context. `outstanding` is
    /// the number of records still alive, reported as a leak.
    pub fn dispose(&mut self, outstanding: usize) -> Result<()> {
        self.guard()?;
        if outstanding > 0 {
            log::warn!("disposing GPU context with {outstanding} undisposed tensor(s)");
        }
        self.disposed = true;
        self.device.poll(wgpu::Maintain::Wait);
        self.device.destroy();
        Ok(())
    }
}

struct ReadbackStaging {
    buffer: wgpu::Buffer,
    padded: usize,
    unpadded: usize,
    rows: usize,
}

impl ReadbackStaging {
    /// Copy mapped rows out, dropping the per-row alignment padding.
    fn take_rows(&self) -> Vec<u8> {
        let data = self.buffer.slice(..).get_mapped_range();
        let mut out = Vec::with_capacity(self.unpadded * self.rows);
        for row in 0..self.rows {
            let start = row * self.padded;
            out.extend_from_slice(&data[start..start + self.unpadded]);
        }
        drop(data);
        self.buffer.unmap();
        out
    }
}

fn detect_storage_mode(adapter: &wgpu::Adapter) -> StorageMode {
    let r32 = adapter.get_texture_format_features(wgpu::TextureFormat::R32Float);
    let rgba32 = adapter.get_texture_format_features(wgpu::TextureFormat::Rgba32Float);
    let renderable = r32
        .allowed_usages
        .contains(wgpu::TextureUsages::RENDER_ATTACHMENT)
        && rgba32
            .allowed_usages
            .contains(wgpu::TextureUsages::RENDER_ATTACHMENT);
    if renderable {
        StorageMode::NativeFloat
    } else {
        StorageMode::Quantized
    }
}

fn texture_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Round a row length up to the copy alignment wgpu requires for
/// texture-to-buffer transfers.
pub(crate) fn padded_bytes_per_row(unpadded: usize) -> usize {
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as usize;
    unpadded.div_ceil(align) * align
}

/// Log generated source with line numbers, marking the line a WGSL
/// diagnostic points at (naga's `wgsl:<line>:<col>` form).
fn log_annotated_source(source: &str, message: &str) {
    let bad_line = find_error_line(message);
    let mut annotated = String::new();
    for (i, line) in source.lines().enumerate() {
        let n = i + 1;
        let marker = if Some(n) == bad_line { ">>" } else { "  " };
        annotated.push_str(&format!("{marker}{n:4}  {line}\n"));
    }
    log::error!("shader compile failed: {message}\n{annotated}");
}

/// Extract the 1-based line number from a `wgsl:<line>:<col>` span.
pub(crate) fn find_error_line(message: &str) -> Option<usize> {
    let idx = message.find("wgsl:")?;
    let rest = &message[idx + 5..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_padding_rounds_up_to_256() {
        assert_eq!(padded_bytes_per_row(1), 256);
        assert_eq!(padded_bytes_per_row(256), 256);
        assert_eq!(padded_bytes_per_row(257), 512);
        assert_eq!(padded_bytes_per_row(3 * 4), 256);
    }

    #[test]
    fn error_line_is_parsed_from_wgsl_spans() {
        assert_eq!(
            find_error_line("Shader error\n  \u{250c}\u{2500} wgsl:12:7\n"),
            Some(12)
        );
        assert_eq!(find_error_line("no span here"), None);
    }
}
