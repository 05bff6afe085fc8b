//! Engine construction options and environment overrides.

use std::time::Duration;

/// How float values are stored in textures.
///
/// `NativeFloat` keeps one f32 per channel; `Quantized` falls back to
/// 8-bit RGBA textures with values spread across the four byte planes.
/// The engine picks the mode from device capabilities unless forced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageMode {
    NativeFloat,
    Quantized,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::NativeFloat => "native",
            StorageMode::Quantized => "quantized",
        }
    }
}

/// The value window used by the quantized codec. Values outside the
/// window are clamped on encode; a narrower window buys precision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantRange {
    pub min: f32,
    pub max: f32,
}

impl Default for QuantRange {
    fn default() -> Self {
        QuantRange {
            min: -20000.0,
            max: 20000.0,
        }
    }
}

impl QuantRange {
    /// Step size of the coarsest (integer) byte plane.
    pub fn step(&self) -> f32 {
        (self.max - self.min) / 255.0
    }
}

/// Delay schedule for polling async readback completion. Attempt `n`
/// waits `initial * multiplier^n`, capped at `max_delay`; after
/// `max_attempts` polls the read falls back to a blocking wait.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            initial: Duration::from_micros(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(4),
            max_attempts: 16,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.initial.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}

/// Options for `Engine::new`.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub power_preference: wgpu::PowerPreference,
    pub force_fallback_adapter: bool,
    /// Override capability detection. `None` = detect.
    pub forced_storage_mode: Option<StorageMode>,
    /// Wrap every GPU call in an error scope and resolve it immediately.
    pub debug_validation: bool,
    /// Clamp the texture-dimension limit below the hardware maximum.
    pub max_texture_dim: Option<u32>,
    pub quant_range: QuantRange,
    pub read_backoff: BackoffPolicy,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            forced_storage_mode: None,
            debug_validation: false,
            max_texture_dim: None,
            quant_range: QuantRange::default(),
            read_backoff: BackoffPolicy::default(),
        }
    }
}

impl EngineOptions {
    /// Apply `TEXMAT_*` environment overrides on top of the options.
    pub fn from_env() -> Self {
        let mut opts = EngineOptions::default();
        if let Ok(val) = std::env::var("TEXMAT_POWER_PREF") {
            match val.trim().to_ascii_lowercase().as_str() {
                "low" => opts.power_preference = wgpu::PowerPreference::LowPower,
                "high" => opts.power_preference = wgpu::PowerPreference::HighPerformance,
                other => log::warn!("ignoring unrecognized TEXMAT_POWER_PREF={other}"),
            }
        }
        if let Ok(val) = std::env::var("TEXMAT_STORAGE_MODE") {
            match val.trim().to_ascii_lowercase().as_str() {
                "native" => opts.forced_storage_mode = Some(StorageMode::NativeFloat),
                "quantized" => opts.forced_storage_mode = Some(StorageMode::Quantized),
                other => log::warn!("ignoring unrecognized TEXMAT_STORAGE_MODE={other}"),
            }
        }
        if let Ok(val) = std::env::var("TEXMAT_DEBUG") {
            opts.debug_validation = val.trim() == "1";
        }
        if let Ok(val) = std::env::var("TEXMAT_MAX_TEX_DIM") {
            match val.trim().parse::<u32>() {
                Ok(parsed) if parsed > 0 => opts.max_texture_dim = Some(parsed),
                _ => log::warn!("ignoring unparsable TEXMAT_MAX_TEX_DIM={val}"),
            }
        }
        opts
    }
}
