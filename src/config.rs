use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::governor::MemoryProbe;

fn default_sample_rate() -> u32 {
    44100
}

fn default_max_voices() -> usize {
    6
}

fn default_volume() -> f32 {
    0.2
}

fn default_ramp_secs() -> f64 {
    0.05
}

fn default_memory_check_secs() -> f64 {
    10.0
}

fn default_resource_check_secs() -> f64 {
    30.0
}

fn default_long_running_secs() -> f64 {
    1800.0
}

fn default_idle_release_secs() -> f64 {
    300.0
}

fn default_high_watermark() -> f32 {
    0.7
}

fn default_critical_watermark() -> f32 {
    0.85
}

fn default_buffer_idle_secs() -> f64 {
    120.0
}

fn default_max_cache_entries() -> usize {
    8
}

fn default_buffer_secs() -> f64 {
    3.0
}

fn default_max_lattice_pairs() -> usize {
    6
}

fn default_max_oscillators() -> usize {
    8
}

/// Engine tuning knobs, loadable from TOML. Constructed explicitly and
/// handed to [`crate::engine::ToneEngine`]; there is no ambient global.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_sample_rate", alias = "sampleRate")]
    pub sample_rate: u32,
    /// Upper bound on concurrently governed voices; the pool evicts the
    /// oldest voice beyond it.
    #[serde(default = "default_max_voices", alias = "maxSimultaneousTones")]
    pub max_voices: usize,
    /// Master gain applied after voice mixing, 0..=1.
    #[serde(default = "default_volume", alias = "defaultVolume")]
    pub master_volume: f32,
    /// Gain ramp length for voice start/stop and volume changes.
    #[serde(default = "default_ramp_secs")]
    pub gain_ramp_secs: f64,
    #[serde(default = "default_memory_check_secs")]
    pub memory_check_secs: f64,
    #[serde(default = "default_resource_check_secs")]
    pub resource_check_secs: f64,
    /// Voices older than this are cleaned up regardless of pool size.
    #[serde(default = "default_long_running_secs")]
    pub long_running_secs: f64,
    /// With zero voices for this long, buffers are dropped and the output
    /// pipeline suspends.
    #[serde(default = "default_idle_release_secs")]
    pub idle_release_secs: f64,
    #[serde(default = "default_high_watermark")]
    pub memory_high_watermark: f32,
    #[serde(default = "default_critical_watermark")]
    pub memory_critical_watermark: f32,
    /// Pattern buffers unused for this long are evicted.
    #[serde(default = "default_buffer_idle_secs")]
    pub buffer_idle_secs: f64,
    /// Hard cap on cached pattern buffers (LRU beyond it).
    #[serde(default = "default_max_cache_entries")]
    pub max_cache_entries: usize,
    /// Loop buffer length for precomputed patterns, clamped to 2..=10 s.
    #[serde(default = "default_buffer_secs")]
    pub pattern_buffer_secs: f64,
    /// Prime-pair budget for live lattice synthesis; beyond it the pattern
    /// is routed to the buffer cache.
    #[serde(default = "default_max_lattice_pairs")]
    pub max_live_lattice_pairs: usize,
    /// Oscillator budget for a single pattern voice.
    #[serde(default = "default_max_oscillators")]
    pub max_pattern_oscillators: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            max_voices: default_max_voices(),
            master_volume: default_volume(),
            gain_ramp_secs: default_ramp_secs(),
            memory_check_secs: default_memory_check_secs(),
            resource_check_secs: default_resource_check_secs(),
            long_running_secs: default_long_running_secs(),
            idle_release_secs: default_idle_release_secs(),
            memory_high_watermark: default_high_watermark(),
            memory_critical_watermark: default_critical_watermark(),
            buffer_idle_secs: default_buffer_idle_secs(),
            max_cache_entries: default_max_cache_entries(),
            pattern_buffer_secs: default_buffer_secs(),
            max_live_lattice_pairs: default_max_lattice_pairs(),
            max_pattern_oscillators: default_max_oscillators(),
        }
    }
}

impl EngineConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let txt = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&txt)?)
    }

    /// Write the default configuration as a TOML file.
    pub fn generate_default<P: AsRef<Path>>(path: P) -> Result<()> {
        let txt = toml::to_string_pretty(&Self::default())?;
        std::fs::write(path, txt)?;
        Ok(())
    }

    /// Defaults adapted to the host: fewer voices and shorter buffers on
    /// low-core machines, tighter oscillator budgets under memory pressure.
    pub fn detected(probe: Option<&dyn MemoryProbe>) -> Self {
        let mut cfg = Self::default();

        if let Ok(cores) = std::thread::available_parallelism() {
            if cores.get() <= 2 {
                cfg.max_voices = 3;
                cfg.max_pattern_oscillators = 3;
                cfg.pattern_buffer_secs = 2.0;
            }
        }

        if let Some(info) = probe.and_then(|p| p.heap_info()) {
            // Under 400 MB of headroom counts as a constrained host.
            if info.limit_bytes < 400 * 1024 * 1024 {
                cfg.max_voices = cfg.max_voices.min(4);
                cfg.max_pattern_oscillators = cfg.max_pattern_oscillators.min(4);
                cfg.pattern_buffer_secs = cfg.pattern_buffer_secs.min(2.0);
            }
        }

        cfg
    }

    pub fn ramp_frames(&self) -> u32 {
        (self.gain_ramp_secs * self.sample_rate as f64) as u32
    }

    pub fn clamped_buffer_secs(&self) -> f64 {
        self.pattern_buffer_secs.clamp(2.0, 10.0)
    }
}
