//! The voice pool: every playing voice, the simultaneous-voice limit, the
//! master gain and the final mix. The pool owns the engine's sample clock,
//! which all age and idle bookkeeping is measured against.

use crate::config::EngineConfig;
use crate::dsp::{LinearRamp, SoftLimiter};
use crate::voice::Voice;

pub const LIMITER_THRESHOLD: f32 = 0.95;

/// What happened when a voice was admitted: whether it replaced an older
/// voice with the same id, and which voices were stopped to stay under
/// the limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterOutcome {
    pub replaced: bool,
    pub evicted: Vec<String>,
}

/// Read-only view of an active voice, for resource decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceInfo {
    pub id: String,
    pub created_at: u64,
    pub seq: u64,
    pub pattern: bool,
    pub remote: bool,
}

pub struct VoicePool {
    voices: Vec<Voice>,
    max_voices: usize,
    master: LinearRamp,
    limiter: SoftLimiter,
    ramp_frames: u32,
    suspended: bool,
    absolute_sample: u64,
    next_seq: u64,
}

impl VoicePool {
    pub fn new(config: &EngineConfig) -> Self {
        VoicePool {
            voices: Vec::new(),
            max_voices: config.max_voices.max(1),
            master: LinearRamp::hold(config.master_volume.clamp(0.0, 1.0)),
            limiter: SoftLimiter::new(LIMITER_THRESHOLD),
            ramp_frames: config.ramp_frames(),
            suspended: false,
            absolute_sample: 0,
            next_seq: 0,
        }
    }

    /// Admit a voice. An active voice with the same id is faded out first;
    /// if the pool is still at capacity, the oldest active voices are
    /// stopped until the newcomer fits.
    pub fn register(&mut self, mut voice: Voice) -> RegisterOutcome {
        let mut outcome = RegisterOutcome::default();
        for existing in &mut self.voices {
            if existing.id == voice.id && existing.is_active() {
                existing.stop();
                outcome.replaced = true;
            }
        }
        while self.active_len() >= self.max_voices {
            // Insertion order doubles as age order.
            match self.voices.iter_mut().find(|v| v.is_active()) {
                Some(oldest) => {
                    outcome.evicted.push(oldest.id.clone());
                    oldest.stop();
                }
                None => break,
            }
        }
        voice.created_at = self.absolute_sample;
        voice.seq = self.next_seq;
        self.next_seq += 1;
        self.voices.push(voice);
        outcome
    }

    /// Start the most recently registered idle voice with this id.
    pub fn start(&mut self, id: &str) -> bool {
        for voice in self.voices.iter_mut().rev() {
            if voice.id == id && !voice.is_active() && !voice.is_released() {
                voice.start();
                return true;
            }
        }
        false
    }

    /// Fade out every non-released voice with this id. Returns false when
    /// nothing matched.
    pub fn stop(&mut self, id: &str) -> bool {
        let mut found = false;
        for voice in &mut self.voices {
            if voice.id == id && !voice.is_released() {
                voice.stop();
                found = true;
            }
        }
        found
    }

    pub fn stop_all(&mut self) {
        for voice in &mut self.voices {
            voice.stop();
        }
    }

    pub fn set_master_volume(&mut self, value: f32) {
        self.master.ramp_to(value.clamp(0.0, 1.0), self.ramp_frames);
    }

    pub fn master_volume(&self) -> f32 {
        self.master.target()
    }

    /// Remove voices that have finished fading out, returning their ids.
    pub fn take_released(&mut self) -> Vec<String> {
        let mut released = Vec::new();
        self.voices.retain(|voice| {
            if voice.is_released() {
                released.push(voice.id.clone());
                false
            } else {
                true
            }
        });
        released
    }

    pub fn snapshot(&self) -> Vec<VoiceInfo> {
        self.voices
            .iter()
            .filter(|v| v.is_active())
            .map(|v| VoiceInfo {
                id: v.id.clone(),
                created_at: v.created_at,
                seq: v.seq,
                pattern: v.pattern,
                remote: v.is_remote(),
            })
            .collect()
    }

    pub fn active_len(&self) -> usize {
        self.voices.iter().filter(|v| v.is_active()).count()
    }

    pub fn has_active(&self) -> bool {
        self.voices.iter().any(|v| v.is_active())
    }

    pub fn suspend(&mut self) {
        self.suspended = true;
    }

    pub fn resume(&mut self) {
        self.suspended = false;
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Absolute sample position. Frozen while suspended.
    pub fn now(&self) -> u64 {
        self.absolute_sample
    }

    pub fn ramp_frames(&self) -> u32 {
        self.ramp_frames
    }

    /// Mix one interleaved stereo block, then apply master gain and the
    /// block limiter. The external realtime feed reaches the mix only
    /// through a remote voice's gain, so an orphaned feed stays silent.
    pub fn render_block(&mut self, out: &mut [f32], external: Option<&[f32]>) {
        out.fill(0.0);
        if self.suspended {
            return;
        }
        for voice in &mut self.voices {
            voice.render(out, external);
        }
        for frame in out.chunks_exact_mut(2) {
            let gain = self.master.next();
            frame[0] *= gain;
            frame[1] *= gain;
        }
        self.limiter.process(out);
        self.absolute_sample += (out.len() / 2) as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::PatternKind;
    use crate::voice::{tone_set, OscillatorBank, RemoteHandle, VoiceSource};
    use approx::assert_abs_diff_eq;

    const SR: u32 = 44100;

    fn test_config(max_voices: usize) -> EngineConfig {
        EngineConfig {
            max_voices,
            master_volume: 1.0,
            // One-frame ramps keep the arithmetic exact.
            gain_ramp_secs: 0.0,
            ..EngineConfig::default()
        }
    }

    fn tone_voice(id: &str, frequency_hz: f32) -> Voice {
        let bank = OscillatorBank::new(tone_set(frequency_hz), SR);
        Voice::new(id.to_string(), VoiceSource::Bank(bank), false, 1)
    }

    fn block(pool: &mut VoicePool, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; frames * 2];
        pool.render_block(&mut out, None);
        out
    }

    #[test]
    fn oldest_voice_is_evicted_at_capacity() {
        let mut pool = VoicePool::new(&test_config(2));
        for id in ["a", "b"] {
            assert!(pool.register(tone_voice(id, 440.0)).evicted.is_empty());
            pool.start(id);
        }
        block(&mut pool, 4);
        let outcome = pool.register(tone_voice("c", 440.0));
        pool.start("c");
        assert_eq!(outcome.evicted, vec!["a".to_string()]);
        assert!(!outcome.replaced);
        block(&mut pool, 4);
        let mut ids: Vec<String> = pool.snapshot().into_iter().map(|v| v.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn same_id_replaces_without_eviction() {
        let mut pool = VoicePool::new(&test_config(2));
        pool.register(tone_voice("x", 440.0));
        pool.start("x");
        let outcome = pool.register(tone_voice("x", 220.0));
        pool.start("x");
        assert!(outcome.replaced);
        assert!(outcome.evicted.is_empty());
        block(&mut pool, 4);
        assert_eq!(pool.active_len(), 1);
    }

    #[test]
    fn released_voices_are_drained() {
        let mut pool = VoicePool::new(&test_config(4));
        pool.register(tone_voice("gone", 440.0));
        pool.start("gone");
        assert!(pool.stop("gone"));
        assert!(!pool.stop("missing"));
        block(&mut pool, 4);
        assert_eq!(pool.take_released(), vec!["gone".to_string()]);
        assert!(pool.take_released().is_empty());
        assert!(!pool.has_active());
    }

    #[test]
    fn mix_is_capped_by_the_limiter() {
        let mut pool = VoicePool::new(&test_config(4));
        // Three identical voices sum to 1.5 before the limiter.
        for id in ["a", "b", "c"] {
            pool.register(tone_voice(id, 1000.0));
            pool.start(id);
        }
        let out = block(&mut pool, 512);
        let peak = out.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak <= LIMITER_THRESHOLD + 1e-4, "peak {peak}");
        assert!(peak > 0.9, "expected a hot block, got {peak}");
    }

    fn remote_voice(id: &str) -> Voice {
        let remote = RemoteHandle {
            kind: PatternKind::FmContinuum,
        };
        Voice::new(id.to_string(), VoiceSource::Remote(remote), true, 1)
    }

    #[test]
    fn external_feed_is_mixed_through_a_remote_voice() {
        let mut pool = VoicePool::new(&test_config(4));
        let external = vec![0.25f32; 8];

        // No remote voice: an orphaned feed is dropped.
        let mut out = vec![0.0f32; 8];
        pool.render_block(&mut out, Some(&external));
        assert!(out.iter().all(|&s| s == 0.0));

        pool.register(remote_voice("rt"));
        pool.start("rt");
        let mut out = vec![0.0f32; 8];
        pool.render_block(&mut out, Some(&external));
        for &s in &out {
            assert_abs_diff_eq!(s, 0.25, epsilon = 1e-6);
        }
        pool.set_master_volume(0.5);
        let mut out = vec![0.0f32; 8];
        pool.render_block(&mut out, Some(&external));
        assert_abs_diff_eq!(out[6], 0.125, epsilon = 1e-6);
    }

    #[test]
    fn suspension_silences_and_freezes_the_clock() {
        let mut pool = VoicePool::new(&test_config(4));
        pool.register(tone_voice("s", 440.0));
        pool.start("s");
        block(&mut pool, 16);
        let before = pool.now();
        assert_eq!(before, 16);
        pool.suspend();
        let out = block(&mut pool, 16);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(pool.now(), before);
        pool.resume();
        block(&mut pool, 16);
        assert_eq!(pool.now(), before + 16);
    }

    #[test]
    fn volume_change_ramps_instead_of_stepping() {
        let config = EngineConfig {
            master_volume: 0.0,
            sample_rate: 8,
            gain_ramp_secs: 1.0,
            ..EngineConfig::default()
        };
        let mut pool = VoicePool::new(&config);
        pool.register(remote_voice("rt"));
        pool.start("rt");
        pool.set_master_volume(1.0);
        let external = vec![1.0f32; 16];
        let mut out = vec![0.0f32; 16];
        pool.render_block(&mut out, Some(&external));
        // Eight ramp frames: 0.125, 0.25, ... 1.0.
        assert_abs_diff_eq!(out[0], 0.125, epsilon = 1e-6);
        assert_abs_diff_eq!(out[8], 0.625, epsilon = 1e-6);
        assert_abs_diff_eq!(out[14], 1.0, epsilon = 1e-6);
        assert_eq!(pool.master_volume(), 1.0);
    }
}
