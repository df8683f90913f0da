//! Voices: one playing tone each, from request to released. A voice owns
//! its audio source (live oscillator bank, looping pattern buffer, or a
//! remote handle for audio produced on the realtime path) and a gain ramp
//! that makes every start and stop click-free.

use std::sync::Arc;

use crate::cache::PatternBuffer;
use crate::dsp::{crossfade_gains, pan_attenuate, triangle, wrap_phase, LinearRamp, TWO_PI};
use crate::error::{EngineError, Result};
use crate::patterns::{
    generate, ModMode, OscRole, OscillatorDescriptor, OscillatorSet, PatternCaps, PatternGraph,
    PatternKind, Waveform,
};

const TONE_AMP: f32 = 0.5;
/// Fraction of the buffer after which a loop renews itself.
pub const LOOP_RENEW_RATIO: f32 = 0.8;
/// Crossfade length masking the seam between outgoing and incoming loop.
pub const LOOP_OVERLAP_SECS: f32 = 0.05;

/// What the caller wants to hear.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ToneRequest {
    Tone {
        frequency_hz: f32,
    },
    /// Plain carrier in the left ear, carrier plus beat in the right.
    Binaural {
        beat_hz: f32,
        carrier_hz: f32,
    },
    Pattern {
        kind: PatternKind,
        base_hz: f32,
        complexity: f32,
    },
}

impl ToneRequest {
    pub fn is_pattern(&self) -> bool {
        matches!(self, ToneRequest::Pattern { .. })
    }

    /// Expand the request into something renderable under the given live
    /// budget.
    pub fn graph(&self, caps: PatternCaps) -> Result<PatternGraph> {
        match *self {
            ToneRequest::Tone { frequency_hz } => {
                check_frequency("tone", frequency_hz)?;
                Ok(PatternGraph::Live(tone_set(frequency_hz)))
            }
            ToneRequest::Binaural {
                beat_hz,
                carrier_hz,
            } => {
                check_frequency("binaural", carrier_hz)?;
                if !beat_hz.is_finite() || beat_hz < 0.0 {
                    return Err(EngineError::Generation {
                        kind: "binaural".to_string(),
                        reason: format!("beat frequency {beat_hz} out of range"),
                    });
                }
                Ok(PatternGraph::Live(binaural_set(beat_hz, carrier_hz)))
            }
            ToneRequest::Pattern {
                kind,
                base_hz,
                complexity,
            } => generate(kind, base_hz, complexity, caps),
        }
    }
}

fn check_frequency(kind: &str, value: f32) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(EngineError::Generation {
            kind: kind.to_string(),
            reason: format!("frequency {value} out of range"),
        })
    }
}

pub fn tone_set(frequency_hz: f32) -> OscillatorSet {
    OscillatorSet {
        oscillators: vec![OscillatorDescriptor::carrier(frequency_hz, TONE_AMP)],
        routes: Vec::new(),
        osc_fade_secs: 0.0,
    }
}

pub fn binaural_set(beat_hz: f32, carrier_hz: f32) -> OscillatorSet {
    let mut left = OscillatorDescriptor::carrier(carrier_hz, TONE_AMP);
    left.pan = -1.0;
    let mut right = OscillatorDescriptor::carrier(carrier_hz + beat_hz, TONE_AMP);
    right.pan = 1.0;
    OscillatorSet {
        oscillators: vec![left, right],
        routes: Vec::new(),
        osc_fade_secs: 0.0,
    }
}

#[derive(Debug, Clone)]
struct BankOsc {
    desc: OscillatorDescriptor,
    phase: f32,
}

/// Live additive/modulated renderer for one oscillator set. Modulators are
/// sampled first each frame so carrier routes read current values; phases
/// are wrapped once per block.
#[derive(Debug, Clone)]
pub struct OscillatorBank {
    oscillators: Vec<BankOsc>,
    routes: Vec<crate::patterns::ModRoute>,
    mod_scratch: Vec<f32>,
    sample_rate: f32,
    fade_frames: u32,
    frames_rendered: u64,
}

impl OscillatorBank {
    pub fn new(set: OscillatorSet, sample_rate: u32) -> Self {
        let oscillators: Vec<BankOsc> = set
            .oscillators
            .iter()
            .map(|&desc| BankOsc {
                phase: desc.phase,
                desc,
            })
            .collect();
        let mod_scratch = vec![0.0; oscillators.len()];
        OscillatorBank {
            oscillators,
            routes: set.routes,
            mod_scratch,
            sample_rate: sample_rate as f32,
            fade_frames: (set.osc_fade_secs * sample_rate as f32) as u32,
            frames_rendered: 0,
        }
    }

    pub fn oscillator_count(&self) -> usize {
        self.oscillators.len()
    }

    pub fn next_frame(&mut self) -> (f32, f32) {
        for (i, osc) in self.oscillators.iter_mut().enumerate() {
            if osc.desc.role == OscRole::Modulator {
                self.mod_scratch[i] = osc.phase.sin();
                osc.phase += TWO_PI * osc.desc.frequency_hz / self.sample_rate;
            }
        }
        let fade_gain = if self.fade_frames > 0 {
            (self.frames_rendered as f32 / self.fade_frames as f32).min(1.0)
        } else {
            1.0
        };
        let mut left = 0.0f32;
        let mut right = 0.0f32;
        for (i, osc) in self.oscillators.iter_mut().enumerate() {
            if osc.desc.role != OscRole::Carrier {
                continue;
            }
            let mut frequency = osc.desc.frequency_hz;
            let mut env = 1.0f32;
            for route in &self.routes {
                if route.carrier != i {
                    continue;
                }
                let m = self.mod_scratch[route.modulator];
                match route.mode {
                    ModMode::Frequency => frequency += route.index * m,
                    ModMode::Amplitude => env *= 1.0 - route.index * 0.5 * (1.0 + m),
                }
            }
            let wave = match osc.desc.waveform {
                Waveform::Sine => osc.phase.sin(),
                Waveform::Triangle => triangle(osc.phase),
            };
            let sample = wave * osc.desc.amplitude * env * fade_gain;
            let (l, r) = pan_attenuate(sample, osc.desc.pan);
            left += l;
            right += r;
            osc.phase += TWO_PI * frequency / self.sample_rate;
        }
        self.frames_rendered += 1;
        (left, right)
    }

    /// Wrap accumulated phases, called once per render block.
    pub fn end_block(&mut self) {
        for osc in &mut self.oscillators {
            osc.phase = wrap_phase(osc.phase);
        }
    }
}

/// Looping playback over a shared pattern buffer. Near the end of each pass
/// a second cursor starts from the top and the two are crossfaded, so the
/// loop point is never audible.
#[derive(Debug, Clone)]
pub struct LoopHandle {
    buffer: Arc<PatternBuffer>,
    main: usize,
    incoming: Option<usize>,
    renew_at: usize,
    overlap_frames: usize,
}

impl LoopHandle {
    pub fn new(buffer: Arc<PatternBuffer>) -> Self {
        let frames = buffer.frames().max(1);
        let overlap_frames = ((buffer.sample_rate as f32 * LOOP_OVERLAP_SECS) as usize)
            .clamp(1, frames);
        let renew_at = ((frames as f32 * LOOP_RENEW_RATIO) as usize).max(1);
        LoopHandle {
            buffer,
            main: 0,
            incoming: None,
            renew_at,
            overlap_frames,
        }
    }

    pub fn buffer(&self) -> &Arc<PatternBuffer> {
        &self.buffer
    }

    pub fn next_frame(&mut self) -> (f32, f32) {
        let frames = self.buffer.frames();
        if frames == 0 {
            return (0.0, 0.0);
        }
        let (mut l, mut r) = self.buffer.frame(self.main % frames);
        if let Some(pos) = self.incoming {
            let progress = pos as f32 / self.overlap_frames as f32;
            let (fade_out, fade_in) = crossfade_gains(progress);
            let (il, ir) = self.buffer.frame(pos % frames);
            l = l * fade_out + il * fade_in;
            r = r * fade_out + ir * fade_in;
            let next = pos + 1;
            if next >= self.overlap_frames {
                // The incoming cursor takes over as the main one.
                self.main = next;
                self.incoming = None;
            } else {
                self.incoming = Some(next);
                self.main += 1;
            }
        } else {
            self.main += 1;
            if self.main >= self.renew_at {
                self.incoming = Some(0);
            }
        }
        (l, r)
    }
}

/// Marker for a voice whose audio comes from the realtime processor; the
/// voice tracks lifecycle and gain while samples arrive via the external
/// mix input.
#[derive(Debug, Clone, Copy)]
pub struct RemoteHandle {
    pub kind: PatternKind,
}

#[derive(Debug, Clone)]
pub enum VoiceSource {
    Bank(OscillatorBank),
    Loop(LoopHandle),
    Remote(RemoteHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Idle,
    Starting,
    Playing,
    Stopping,
    Released,
}

impl VoiceState {
    pub fn is_active(&self) -> bool {
        matches!(self, VoiceState::Starting | VoiceState::Playing)
    }
}

#[derive(Debug, Clone)]
pub struct Voice {
    pub id: String,
    pub state: VoiceState,
    pub source: VoiceSource,
    /// Sample-clock time the voice was registered, for age ordering.
    pub created_at: u64,
    /// Tie-break for voices registered in the same block.
    pub seq: u64,
    pub pattern: bool,
    gain: LinearRamp,
    target_gain: f32,
    ramp_frames: u32,
}

impl Voice {
    pub fn new(id: String, source: VoiceSource, pattern: bool, ramp_frames: u32) -> Self {
        Voice {
            id,
            state: VoiceState::Idle,
            source,
            created_at: 0,
            seq: 0,
            pattern,
            gain: LinearRamp::hold(0.0),
            target_gain: 1.0,
            ramp_frames,
        }
    }

    pub fn start(&mut self) {
        if self.state == VoiceState::Idle {
            self.state = VoiceState::Starting;
            self.gain.ramp_to(self.target_gain, self.ramp_frames);
        }
    }

    /// Idempotent. A voice that never started releases immediately; a
    /// playing one fades out first.
    pub fn stop(&mut self) {
        match self.state {
            VoiceState::Idle => self.state = VoiceState::Released,
            VoiceState::Starting | VoiceState::Playing => {
                self.state = VoiceState::Stopping;
                self.gain.ramp_to(0.0, self.ramp_frames);
            }
            VoiceState::Stopping | VoiceState::Released => {}
        }
    }

    pub fn set_gain(&mut self, value: f32) {
        self.target_gain = value.clamp(0.0, 1.0);
        if self.state.is_active() {
            self.gain.ramp_to(self.target_gain, self.ramp_frames);
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_released(&self) -> bool {
        self.state == VoiceState::Released
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.source, VoiceSource::Remote(_))
    }

    /// Add this voice's audio into an interleaved stereo block. A remote
    /// voice contributes the external realtime feed, routed through its
    /// own gain ramp so starts and stops stay click-free.
    pub fn render(&mut self, out: &mut [f32], external: Option<&[f32]>) {
        if matches!(self.state, VoiceState::Idle | VoiceState::Released) {
            return;
        }
        for (n, frame) in out.chunks_exact_mut(2).enumerate() {
            let g = self.gain.next();
            let (l, r) = match &mut self.source {
                VoiceSource::Bank(bank) => bank.next_frame(),
                VoiceSource::Loop(looped) => looped.next_frame(),
                VoiceSource::Remote(_) => match external {
                    Some(ext) => (ext[n * 2], ext[n * 2 + 1]),
                    None => (0.0, 0.0),
                },
            };
            frame[0] += l * g;
            frame[1] += r * g;
        }
        if let VoiceSource::Bank(bank) = &mut self.source {
            bank.end_block();
        }
        if self.gain.is_settled() {
            match self.state {
                VoiceState::Starting => self.state = VoiceState::Playing,
                VoiceState::Stopping => self.state = VoiceState::Released,
                _ => {}
            }
        }
    }
}
