//! Compiled-program caching keyed by the codegen inputs.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::config::StorageMode;
use crate::shader::{InputInfo, OutputInfo};
use texmat_api::Result;

/// A compiled operation: pipeline plus the bind-group layout its
/// operands are attached through.
pub struct ProgramBinary {
    pub pipeline: wgpu::RenderPipeline,
    pub layout: wgpu::BindGroupLayout,
    pub input_count: usize,
    pub quantized: bool,
}

/// Cache key covering everything the generated source depends on: the
/// operation tag, every operand's logical shape, texture shape and
/// layout, the output shapes, the storage mode and the broadcast flag.
pub fn make_program_key(
    tag: &str,
    inputs: &[InputInfo],
    output: &OutputInfo,
    mode: StorageMode,
    broadcast: bool,
) -> String {
    let mut key = String::with_capacity(96);
    key.push_str(tag);
    key.push('|');
    key.push_str(mode.as_str());
    if broadcast {
        key.push_str("|bc");
    }
    for input in inputs {
        key.push('|');
        key.push_str(&input.name);
        key.push(':');
        push_shape(&mut key, &input.logical_shape);
        key.push(':');
        push_shape(&mut key, &input.tex_shape);
        key.push(':');
        key.push_str(input.layout.as_str());
    }
    key.push_str("|out:");
    push_shape(&mut key, &output.logical_shape);
    key.push(':');
    push_shape(&mut key, &output.tex_shape);
    key
}

fn push_shape(key: &mut String, shape: &[usize]) {
    key.push('[');
    for (i, d) in shape.iter().enumerate() {
        if i > 0 {
            key.push('x');
        }
        key.push_str(&d.to_string());
    }
    key.push(']');
}

/// Insert-only cache, generic over the compiled artifact so the
/// bookkeeping is testable without a device.
pub struct Cache<P> {
    map: HashMap<String, P>,
    compile_count: usize,
}

pub type ProgramCache = Cache<ProgramBinary>;

impl<P> Default for Cache<P> {
    fn default() -> Self {
        Cache {
            map: HashMap::new(),
            compile_count: 0,
        }
    }
}

impl<P> Cache<P> {
    /// Number of times `build` has actually run.
    pub fn compile_count(&self) -> usize {
        self.compile_count
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&P> {
        self.map.get(key)
    }

    pub fn get_or_compile(
        &mut self,
        key: &str,
        build: impl FnOnce() -> Result<P>,
    ) -> Result<&P> {
        match self.map.entry(key.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let built = build()?;
                self.compile_count += 1;
                Ok(entry.insert(built))
            }
        }
    }
}
