//! Procedural pattern synthesis. Each pattern kind expands into a plain
//! data description (oscillators plus modulation routes) that the voice
//! layer renders live or the buffer builder renders offline. Keeping the
//! expansion free of audio state makes the same tables usable from the
//! realtime processor, the live bank and the cache.

use std::fmt;

use crate::error::{EngineError, Result};

pub const DEFAULT_BASE_HZ: f32 = 432.0;
pub const GOLDEN_RATIO: f32 = 1.618_034;
/// Schumann resonance, the modulator of the amplitude fallback pattern.
pub const SCHUMANN_HZ: f32 = 7.83;
/// Modulator placement for the continuum pattern: pi/2, e/3, sqrt(2),
/// sqrt(3)/2 above the carrier.
pub const FM_RATIOS: [f32; 4] = [
    std::f32::consts::FRAC_PI_2,
    std::f32::consts::E / 3.0,
    std::f32::consts::SQRT_2,
    1.732_050_8 / 2.0,
];
pub const LATTICE_PRIMES: [u32; 6] = [2, 3, 5, 7, 11, 13];

/// Fade-in applied to each partial of the countable series.
const SERIES_FADE_SECS: f32 = 0.1;
const FM_CARRIER_AMP: f32 = 0.7;
const LATTICE_CARRIER_AMP: f32 = 0.5;
const FALLBACK_CARRIER_AMP: f32 = 0.7;
const FALLBACK_DEPTH: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternKind {
    /// Partials spaced by the golden ratio over a shared base.
    CountableSeries,
    /// One carrier frequency-modulated by up to four irrational ratios.
    FmContinuum,
    /// Tone pairs built from ratios of small primes, panned apart.
    PrimeLattice,
    /// Minimal carrier with slow amplitude modulation. Also the pattern
    /// every unknown tag resolves to, so playback always has something
    /// to fall back on.
    AmFallback,
}

impl PatternKind {
    pub const ALL: [PatternKind; 4] = [
        PatternKind::CountableSeries,
        PatternKind::FmContinuum,
        PatternKind::PrimeLattice,
        PatternKind::AmFallback,
    ];

    /// Total mapping from catalog tags. Unrecognized tags degrade to the
    /// amplitude fallback rather than failing.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "aleph-null" => PatternKind::CountableSeries,
            "aleph-one" => PatternKind::FmContinuum,
            "aleph-two" => PatternKind::PrimeLattice,
            _ => PatternKind::AmFallback,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            PatternKind::CountableSeries => "aleph-null",
            PatternKind::FmContinuum => "aleph-one",
            PatternKind::PrimeLattice => "aleph-two",
            PatternKind::AmFallback => "am-fallback",
        }
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OscRole {
    /// Mixed into the output.
    Carrier,
    /// Sampled only as a modulation source.
    Modulator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Waveform {
    #[default]
    Sine,
    Triangle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModMode {
    /// Route index is the peak deviation in Hz.
    Frequency,
    /// Route index is the modulation depth in 0..=1.
    Amplitude,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OscillatorDescriptor {
    pub frequency_hz: f32,
    pub amplitude: f32,
    pub phase: f32,
    /// -1 full left, 0 center, 1 full right.
    pub pan: f32,
    pub role: OscRole,
    pub waveform: Waveform,
}

impl OscillatorDescriptor {
    pub fn carrier(frequency_hz: f32, amplitude: f32) -> Self {
        OscillatorDescriptor {
            frequency_hz,
            amplitude,
            phase: 0.0,
            pan: 0.0,
            role: OscRole::Carrier,
            waveform: Waveform::Sine,
        }
    }

    pub fn modulator(frequency_hz: f32) -> Self {
        OscillatorDescriptor {
            frequency_hz,
            amplitude: 1.0,
            phase: 0.0,
            pan: 0.0,
            role: OscRole::Modulator,
            waveform: Waveform::Sine,
        }
    }
}

/// Directed modulation edge between two oscillators of a set. Indices
/// point into [`OscillatorSet::oscillators`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModRoute {
    pub carrier: usize,
    pub modulator: usize,
    pub index: f32,
    pub mode: ModMode,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct OscillatorSet {
    pub oscillators: Vec<OscillatorDescriptor>,
    pub routes: Vec<ModRoute>,
    /// Fade-in applied per oscillator when the set starts live.
    pub osc_fade_secs: f32,
}

impl OscillatorSet {
    pub fn carrier_count(&self) -> usize {
        self.oscillators
            .iter()
            .filter(|o| o.role == OscRole::Carrier)
            .count()
    }
}

/// Budget for live rendering. Sets that exceed it are sent to the
/// offline buffer path instead of being truncated audibly mid-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternCaps {
    pub max_oscillators: usize,
    pub max_live_lattice_pairs: usize,
}

impl Default for PatternCaps {
    fn default() -> Self {
        PatternCaps {
            max_oscillators: 8,
            max_live_lattice_pairs: 6,
        }
    }
}

/// What the cache needs to render a pattern offline. Offline renders are
/// always full complexity, so the request carries none.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferRequest {
    pub kind: PatternKind,
    pub base_hz: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PatternGraph {
    Live(OscillatorSet),
    Buffered(BufferRequest),
}

/// Expand a pattern at its natural size, with no live budget applied.
/// This is what the realtime processor and the buffer builder use.
pub fn oscillator_set(kind: PatternKind, base_hz: f32, complexity: f32) -> Result<OscillatorSet> {
    let complexity = validate(kind, base_hz, complexity)?;
    Ok(match kind {
        PatternKind::CountableSeries => countable_series(base_hz, complexity),
        PatternKind::FmContinuum => fm_continuum(base_hz, complexity),
        PatternKind::PrimeLattice => prime_lattice(base_hz, complexity),
        PatternKind::AmFallback => am_fallback(base_hz),
    })
}

/// Expand a pattern under a live budget. Sets that fit the budget come
/// back as [`PatternGraph::Live`]; anything larger is deferred to the
/// buffer path at full fidelity.
pub fn generate(
    kind: PatternKind,
    base_hz: f32,
    complexity: f32,
    caps: PatternCaps,
) -> Result<PatternGraph> {
    let complexity = validate(kind, base_hz, complexity)?;
    let set = match kind {
        PatternKind::CountableSeries => countable_series(base_hz, complexity),
        PatternKind::FmContinuum => fm_continuum(base_hz, complexity),
        PatternKind::PrimeLattice => {
            let set = prime_lattice(base_hz, complexity);
            let pairs = (set.oscillators.len() - 1) / 2;
            if pairs > caps.max_live_lattice_pairs {
                return Ok(PatternGraph::Buffered(BufferRequest { kind, base_hz }));
            }
            set
        }
        PatternKind::AmFallback => return Ok(PatternGraph::Live(am_fallback(base_hz))),
    };
    if set.oscillators.len() > caps.max_oscillators {
        Ok(PatternGraph::Buffered(BufferRequest { kind, base_hz }))
    } else {
        Ok(PatternGraph::Live(set))
    }
}

fn validate(kind: PatternKind, base_hz: f32, complexity: f32) -> Result<f32> {
    if !base_hz.is_finite() || base_hz <= 0.0 {
        return Err(EngineError::Generation {
            kind: kind.tag().to_string(),
            reason: format!("base frequency {base_hz} out of range"),
        });
    }
    if !complexity.is_finite() || complexity < 0.0 {
        return Err(EngineError::Generation {
            kind: kind.tag().to_string(),
            reason: format!("complexity {complexity} out of range"),
        });
    }
    Ok(complexity.min(1.0))
}

/// Partials at base * (1 + phi / i), i counted from 1. Every third
/// partial is a triangle for a slightly brighter blend.
fn countable_series(base_hz: f32, complexity: f32) -> OscillatorSet {
    let partials = ((8.0 * complexity) as usize).max(2);
    let mut oscillators = Vec::with_capacity(partials);
    for i in 1..=partials {
        let mut osc = OscillatorDescriptor::carrier(
            base_hz * (1.0 + GOLDEN_RATIO / i as f32),
            0.5 / (i as f32 + 1.0).sqrt(),
        );
        if i % 3 == 0 {
            osc.waveform = Waveform::Triangle;
        }
        oscillators.push(osc);
    }
    OscillatorSet {
        oscillators,
        routes: Vec::new(),
        osc_fade_secs: SERIES_FADE_SECS,
    }
}

fn fm_continuum(base_hz: f32, complexity: f32) -> OscillatorSet {
    let mod_count = ((4.0 * complexity) as usize).clamp(1, FM_RATIOS.len());
    let mut oscillators = vec![OscillatorDescriptor::carrier(base_hz, FM_CARRIER_AMP)];
    let mut routes = Vec::with_capacity(mod_count);
    for (i, ratio) in FM_RATIOS.iter().take(mod_count).enumerate() {
        oscillators.push(OscillatorDescriptor::modulator(base_hz * ratio));
        routes.push(ModRoute {
            carrier: 0,
            modulator: i + 1,
            // Deviation shrinks for the higher modulators.
            index: 40.0 / ((i as f32 + 1.0) * 2.0),
            mode: ModMode::Frequency,
        });
    }
    OscillatorSet {
        oscillators,
        routes,
        osc_fade_secs: 0.0,
    }
}

/// One base carrier plus a mirrored pair of ratio tones per prime pair:
/// base * p/q panned to one side and base * q/p panned to the other.
fn prime_lattice(base_hz: f32, complexity: f32) -> OscillatorSet {
    let usable = ((6.0 * complexity) as usize)
        .max(2)
        .min(LATTICE_PRIMES.len());
    let mut oscillators = vec![OscillatorDescriptor::carrier(base_hz, LATTICE_CARRIER_AMP)];
    for i in 0..usable {
        for j in (i + 1)..usable {
            let p = LATTICE_PRIMES[i] as f32;
            let q = LATTICE_PRIMES[j] as f32;
            let amplitude = 0.2 / ((i as f32 + 1.0) * (j as f32 + 1.0));
            let pan = if i % 2 == 0 { 0.5 } else { -0.5 };
            let mut up = OscillatorDescriptor::carrier(base_hz * p / q, amplitude);
            up.pan = pan;
            let mut down = OscillatorDescriptor::carrier(base_hz * q / p, amplitude);
            down.pan = -pan;
            oscillators.push(up);
            oscillators.push(down);
        }
    }
    OscillatorSet {
        oscillators,
        routes: Vec::new(),
        osc_fade_secs: 0.0,
    }
}

fn am_fallback(base_hz: f32) -> OscillatorSet {
    let oscillators = vec![
        OscillatorDescriptor::carrier(base_hz, FALLBACK_CARRIER_AMP),
        OscillatorDescriptor::modulator(SCHUMANN_HZ),
    ];
    let routes = vec![ModRoute {
        carrier: 0,
        modulator: 1,
        index: FALLBACK_DEPTH,
        mode: ModMode::Amplitude,
    }];
    OscillatorSet {
        oscillators,
        routes,
        osc_fade_secs: 0.0,
    }
}
