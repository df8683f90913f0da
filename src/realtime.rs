//! The realtime pattern path and the arbitration between playback paths.
//!
//! [`RealtimeProcessor`] lives inside the audio callback: it renders the
//! currently configured pattern straight into the output block and watches
//! its own peak level, reporting overruns back to the control thread.
//! [`RealtimeArbiter`] lives on the control side: it remembers whether the
//! realtime path probed healthy and how far complexity has been backed
//! off in response to overruns.

use crossbeam::channel::Sender;
use once_cell::sync::OnceCell;

use crate::command::{RealtimeCommand, RealtimeReport};
use crate::patterns::{oscillator_set, PatternGraph, PatternKind, DEFAULT_BASE_HZ};
use crate::voice::OscillatorBank;

/// Peak level that counts as an overrun.
pub const OVERRUN_THRESHOLD: f32 = 0.9;
/// Peak level the output must fall back under before another overrun can
/// be reported.
pub const RECOVERY_THRESHOLD: f32 = 0.72;
/// Complexity multiplier applied per overrun report.
pub const COMPLEXITY_BACKOFF: f32 = 0.7;

/// How a tone will actually be produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPath {
    /// Rendered by the processor inside the audio callback.
    Realtime,
    /// Rendered live by an oscillator bank in the engine mix.
    Synthesis,
    /// Played from a cached offline render.
    Buffered,
}

pub struct RealtimeProcessor {
    bank: Option<OscillatorBank>,
    kind: PatternKind,
    base_hz: f32,
    complexity: f32,
    running: bool,
    overrun: bool,
    sample_rate: u32,
    reports: Sender<RealtimeReport>,
}

impl RealtimeProcessor {
    pub fn new(sample_rate: u32, reports: Sender<RealtimeReport>) -> Self {
        RealtimeProcessor {
            bank: None,
            kind: PatternKind::AmFallback,
            base_hz: DEFAULT_BASE_HZ,
            complexity: 1.0,
            running: false,
            overrun: false,
            sample_rate,
            reports,
        }
    }

    pub fn handle(&mut self, command: RealtimeCommand) {
        match command {
            RealtimeCommand::Configure { kind, base_hz } => {
                self.kind = kind;
                self.base_hz = base_hz;
                self.rebuild();
            }
            RealtimeCommand::Start => self.running = true,
            RealtimeCommand::Stop => self.running = false,
            RealtimeCommand::ReduceComplexity { factor } => {
                if factor.is_finite() && factor > 0.0 {
                    self.complexity *= factor;
                    self.rebuild();
                }
            }
        }
    }

    fn rebuild(&mut self) {
        self.bank = oscillator_set(self.kind, self.base_hz, self.complexity)
            .ok()
            .map(|set| OscillatorBank::new(set, self.sample_rate));
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Fill one interleaved stereo block, replacing its contents.
    pub fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        let bank = match (&mut self.bank, self.running) {
            (Some(bank), true) => bank,
            _ => return,
        };
        for frame in out.chunks_exact_mut(2) {
            let (l, r) = bank.next_frame();
            frame[0] = l;
            frame[1] = r;
        }
        bank.end_block();
        let peak = out.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        self.watch_peak(peak);
    }

    /// Overrun detection with hysteresis so one loud stretch produces a
    /// single report.
    fn watch_peak(&mut self, peak: f32) {
        if peak > OVERRUN_THRESHOLD && !self.overrun {
            self.overrun = true;
            let _ = self.reports.send(RealtimeReport::BufferStatus { overrun: true });
        } else if peak < RECOVERY_THRESHOLD && self.overrun {
            self.overrun = false;
            let _ = self.reports.send(RealtimeReport::BufferStatus { overrun: false });
        }
    }
}

/// Control-side record of realtime health. The probe result is memoized:
/// once the path has been judged usable or not, the verdict stands for
/// the lifetime of the engine.
#[derive(Debug)]
pub struct RealtimeArbiter {
    probe: OnceCell<bool>,
    complexity_scale: f32,
}

impl Default for RealtimeArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RealtimeArbiter {
    pub fn new() -> Self {
        RealtimeArbiter {
            probe: OnceCell::new(),
            complexity_scale: 1.0,
        }
    }

    /// Record the outcome of the one-time path probe. Later calls are
    /// ignored.
    pub fn note_probe(&self, healthy: bool) {
        let _ = self.probe.set(healthy);
    }

    pub fn realtime_ok(&self) -> bool {
        *self.probe.get().unwrap_or(&false)
    }

    /// Cumulative complexity scale after overrun backoffs.
    pub fn complexity_scale(&self) -> f32 {
        self.complexity_scale
    }

    /// Digest one processor report. An overrun returns the backoff factor
    /// to reissue; recovery reports change nothing, reduced complexity is
    /// never restored.
    pub fn note_report(&mut self, report: RealtimeReport) -> Option<f32> {
        match report {
            RealtimeReport::BufferStatus { overrun: true } => {
                self.complexity_scale *= COMPLEXITY_BACKOFF;
                Some(COMPLEXITY_BACKOFF)
            }
            RealtimeReport::BufferStatus { overrun: false } => None,
        }
    }

    /// Pick the playback path for a pattern graph.
    pub fn select_path(&self, link_attached: bool, graph: &PatternGraph) -> PlaybackPath {
        if link_attached && self.realtime_ok() {
            return PlaybackPath::Realtime;
        }
        match graph {
            PatternGraph::Live(_) => PlaybackPath::Synthesis,
            PatternGraph::Buffered(_) => PlaybackPath::Buffered,
        }
    }
}
