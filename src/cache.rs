//! Offline pattern rendering and buffer reuse. Heavy patterns are rendered
//! once into a looping buffer; the cache hands the same buffer to every
//! voice that asks for a close-enough frequency, and drops what nobody has
//! used for a while.

use std::collections::HashMap;
use std::sync::Arc;

use crate::dsp::apply_edge_fades;
use crate::error::Result;
use crate::patterns::{oscillator_set, BufferRequest, PatternKind};
use crate::voice::OscillatorBank;

/// Frames rendered per build step, short enough to interleave with
/// control work.
pub const BUILD_STEP_FRAMES: usize = 2000;
const EDGE_FADE_SECS: f32 = 0.01;
const NORMALIZE_PEAK: f32 = 0.95;

/// A rendered, loopable pattern. Samples are interleaved stereo.
#[derive(Debug, Clone)]
pub struct PatternBuffer {
    pub kind: PatternKind,
    pub sample_rate: u32,
    pub duration_secs: u32,
    pub samples: Vec<f32>,
}

impl PatternBuffer {
    pub fn frames(&self) -> usize {
        self.samples.len() / 2
    }

    pub fn frame(&self, index: usize) -> (f32, f32) {
        (self.samples[index * 2], self.samples[index * 2 + 1])
    }
}

/// Cache identity: pattern kind, base frequency rounded to the nearest
/// Hz, and buffer length. Requests within half a Hz share a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: PatternKind,
    pub base_round_hz: i64,
    pub duration_secs: u32,
}

impl CacheKey {
    pub fn new(kind: PatternKind, base_hz: f32, duration_secs: u32) -> Self {
        CacheKey {
            kind,
            base_round_hz: base_hz.round() as i64,
            duration_secs,
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    buffer: Arc<PatternBuffer>,
    last_used: u64,
}

/// Bounded buffer store. Time is the engine's sample clock; entries idle
/// past the limit are dropped, and inserts beyond capacity evict the
/// least recently used entry.
#[derive(Debug)]
pub struct PatternCache {
    entries: HashMap<CacheKey, CacheEntry>,
    max_entries: usize,
    idle_frames: u64,
}

impl PatternCache {
    pub fn new(max_entries: usize, idle_frames: u64) -> Self {
        PatternCache {
            entries: HashMap::new(),
            max_entries: max_entries.max(1),
            idle_frames,
        }
    }

    pub fn get(&mut self, key: &CacheKey, now: u64) -> Option<Arc<PatternBuffer>> {
        let stale = {
            let entry = self.entries.get(key)?;
            now.saturating_sub(entry.last_used) > self.idle_frames
        };
        if stale {
            self.entries.remove(key);
            return None;
        }
        let entry = self.entries.get_mut(key)?;
        entry.last_used = now;
        Some(Arc::clone(&entry.buffer))
    }

    pub fn insert(&mut self, key: CacheKey, buffer: Arc<PatternBuffer>, now: u64) {
        self.trim_idle(now);
        while self.entries.len() >= self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| *key);
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
        self.entries.insert(key, CacheEntry { buffer, last_used: now });
    }

    /// Drop entries idle past the limit. Returns how many were removed.
    pub fn trim_idle(&mut self, now: u64) -> usize {
        let before = self.entries.len();
        let idle_frames = self.idle_frames;
        self.entries
            .retain(|_, entry| now.saturating_sub(entry.last_used) <= idle_frames);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Incremental offline render of one pattern buffer. Offline renders are
/// always full complexity; the chunked stepping keeps any single call
/// cheap so builds can be spread across control ticks.
pub struct BufferBuild {
    key: CacheKey,
    bank: OscillatorBank,
    samples: Vec<f32>,
    sample_rate: u32,
    total_frames: usize,
    rendered_frames: usize,
}

impl BufferBuild {
    pub fn new(request: BufferRequest, duration_secs: u32, sample_rate: u32) -> Result<Self> {
        let set = oscillator_set(request.kind, request.base_hz, 1.0)?;
        let total_frames = duration_secs as usize * sample_rate as usize;
        Ok(BufferBuild {
            key: CacheKey::new(request.kind, request.base_hz, duration_secs),
            bank: OscillatorBank::new(set, sample_rate),
            samples: vec![0.0; total_frames * 2],
            sample_rate,
            total_frames,
            rendered_frames: 0,
        })
    }

    pub fn key(&self) -> CacheKey {
        self.key
    }

    pub fn is_done(&self) -> bool {
        self.rendered_frames >= self.total_frames
    }

    /// Render the next chunk. Returns true once the buffer is fully
    /// rendered.
    pub fn step(&mut self) -> bool {
        let remaining = self.total_frames - self.rendered_frames;
        let chunk = remaining.min(BUILD_STEP_FRAMES);
        for i in 0..chunk {
            let (l, r) = self.bank.next_frame();
            let at = (self.rendered_frames + i) * 2;
            self.samples[at] = l;
            self.samples[at + 1] = r;
        }
        self.bank.end_block();
        self.rendered_frames += chunk;
        self.is_done()
    }

    /// Fade the edges and normalize, yielding the shareable buffer.
    /// Callers step the build to completion first.
    pub fn finish(mut self) -> PatternBuffer {
        let fade = ((self.sample_rate as f32 * EDGE_FADE_SECS) as usize).min(self.total_frames / 10);
        apply_edge_fades(&mut self.samples, fade);
        let peak = self.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        if peak > 0.0 {
            let scale = NORMALIZE_PEAK / peak;
            for s in &mut self.samples {
                *s *= scale;
            }
        }
        PatternBuffer {
            kind: self.key.kind,
            sample_rate: self.sample_rate,
            duration_secs: self.key.duration_secs,
            samples: self.samples,
        }
    }
}
