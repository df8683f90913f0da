//! The engine: one context object owning the pool, the pattern cache, the
//! resource governor, the realtime link and the event bus. Hosts construct
//! it explicitly and drive it from a control loop; the audio callback only
//! ever sees the shared pool.

use std::sync::Arc;

use crossbeam::channel::Receiver;
use parking_lot::Mutex;
use ringbuf::traits::Producer;
use ringbuf::HeapProd;

use crate::cache::{BufferBuild, CacheKey, PatternBuffer, PatternCache};
use crate::catalog::{is_audible, Catalog};
use crate::command::{RealtimeCommand, RealtimeReport};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::governor::{ActionReason, GovernorAction, HeapInfo, MemoryProbe, ResourceGovernor};
use crate::patterns::{
    oscillator_set, BufferRequest, PatternCaps, PatternGraph, PatternKind, DEFAULT_BASE_HZ,
};
use crate::pool::VoicePool;
use crate::realtime::{PlaybackPath, RealtimeArbiter};
use crate::voice::{LoopHandle, OscillatorBank, RemoteHandle, ToneRequest, Voice, VoiceSource};

const EVICTION_MESSAGE: &str =
    "Maximum number of simultaneous tones reached. Oldest tone stopped.";
const CRITICAL_MEMORY_MESSAGE: &str =
    "High memory usage detected. Some tones have been stopped automatically.";
const PATTERN_PRESSURE_MESSAGE: &str =
    "Multiple complex patterns detected. Oldest pattern stopped to conserve memory.";

/// Bytes of headroom assumed per second of cached pattern buffer.
const BUFFER_BYTES_PER_SEC: u64 = 2 * 1024 * 1024;

/// Control-side handle to the audio callback: commands go out over the
/// lock-free ring, reports come back over the channel.
pub struct RealtimeLink {
    pub commands: HeapProd<RealtimeCommand>,
    pub reports: Receiver<RealtimeReport>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub active_voices: usize,
    pub cached_buffers: usize,
    pub suspended: bool,
    pub volume: f32,
    pub realtime: bool,
}

pub struct ToneEngine {
    config: EngineConfig,
    pool: Arc<Mutex<VoicePool>>,
    cache: PatternCache,
    governor: ResourceGovernor,
    arbiter: RealtimeArbiter,
    events: EventBus,
    link: Option<RealtimeLink>,
    probe: Option<Box<dyn MemoryProbe>>,
    pending_builds: Vec<BufferBuild>,
    /// Id of the voice currently fed by the realtime processor, if any.
    realtime_voice: Option<String>,
}

impl ToneEngine {
    pub fn new(config: EngineConfig) -> Self {
        let pool = Arc::new(Mutex::new(VoicePool::new(&config)));
        let idle_frames = (config.buffer_idle_secs * config.sample_rate as f64) as u64;
        let cache = PatternCache::new(config.max_cache_entries, idle_frames);
        let governor = ResourceGovernor::new(&config);
        ToneEngine {
            config,
            pool,
            cache,
            governor,
            arbiter: RealtimeArbiter::new(),
            events: EventBus::new(),
            link: None,
            probe: None,
            pending_builds: Vec::new(),
            realtime_voice: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared pool handle for the audio callback.
    pub fn pool(&self) -> Arc<Mutex<VoicePool>> {
        Arc::clone(&self.pool)
    }

    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Wire up a running realtime path. The first attach doubles as the
    /// path probe.
    pub fn attach_realtime(&mut self, link: RealtimeLink) {
        self.arbiter.note_probe(true);
        self.link = Some(link);
    }

    /// Record that the realtime path could not be brought up; patterns
    /// will use the buffered and live paths from here on.
    pub fn mark_realtime_unavailable(&mut self) {
        self.arbiter.note_probe(false);
    }

    pub fn set_memory_probe(&mut self, probe: Box<dyn MemoryProbe>) {
        self.probe = Some(probe);
    }

    pub fn status(&self) -> EngineStatus {
        let pool = self.pool.lock();
        EngineStatus {
            active_voices: pool.active_len(),
            cached_buffers: self.cache.len(),
            suspended: pool.is_suspended(),
            volume: pool.master_volume(),
            realtime: self.arbiter.realtime_ok(),
        }
    }

    /// Start a catalog preset by id.
    pub fn start_preset(&mut self, catalog: &Catalog, id: &str) -> Result<()> {
        let spec = catalog.find(id).ok_or_else(|| EngineError::UnknownTone {
            id: id.to_string(),
        })?;
        if let Some(warning) = &spec.warning {
            tracing::warn!(id, "{warning}");
        }
        let request = spec.request()?;
        self.start_tone(id, request)
    }

    pub fn start_tone(&mut self, id: &str, request: ToneRequest) -> Result<()> {
        {
            let mut pool = self.pool.lock();
            if pool.is_suspended() {
                pool.resume();
            }
        }
        if let ToneRequest::Tone { frequency_hz } = request {
            if !is_audible(frequency_hz as f64) {
                tracing::warn!(id, frequency_hz, "tone frequency outside the audible range");
            }
        }
        let caps = self.pattern_caps();
        let graph = self.pattern_graph(request, caps)?;
        let realtime_eligible =
            request.is_pattern() && self.link.is_some() && self.realtime_voice.is_none();
        let path = self.arbiter.select_path(realtime_eligible, &graph);
        let source = match (path, request, graph) {
            (PlaybackPath::Realtime, ToneRequest::Pattern { kind, base_hz, .. }, _) => {
                self.arm_realtime(id, kind, base_hz)
            }
            (_, _, PatternGraph::Live(set)) => {
                VoiceSource::Bank(OscillatorBank::new(set, self.config.sample_rate))
            }
            (_, _, PatternGraph::Buffered(request)) => {
                VoiceSource::Loop(LoopHandle::new(self.obtain_buffer(request)?))
            }
        };
        self.admit(id, source, request.is_pattern());
        Ok(())
    }

    /// Fade out a tone. The matching ToneStopped event fires once the
    /// fade completes and the voice is drained.
    pub fn stop_tone(&mut self, id: &str) -> Result<()> {
        if self.pool.lock().stop(id) {
            Ok(())
        } else {
            Err(EngineError::UnknownTone { id: id.to_string() })
        }
    }

    pub fn stop_all(&mut self) {
        self.pool.lock().stop_all();
    }

    pub fn set_volume(&mut self, value: f32) {
        let value = value.clamp(0.0, 1.0);
        self.pool.lock().set_master_volume(value);
        self.events.emit(EngineEvent::VolumeChanged { value });
    }

    pub fn volume(&self) -> f32 {
        self.pool.lock().master_volume()
    }

    /// Queue offline builds for the given pattern kinds so later starts
    /// hit the cache. Builds are stepped by [`ToneEngine::advance`].
    pub fn precompute_patterns(&mut self, kinds: &[PatternKind], base_hz: f32) -> Result<()> {
        let duration = self.buffer_duration_secs();
        let now = self.pool.lock().now();
        for &kind in kinds {
            // The fallback pattern always renders live.
            if kind == PatternKind::AmFallback {
                continue;
            }
            let key = CacheKey::new(kind, base_hz, duration);
            if self.cache.get(&key, now).is_some() {
                continue;
            }
            if self.pending_builds.iter().any(|b| b.key() == key) {
                continue;
            }
            let request = BufferRequest { kind, base_hz };
            self.pending_builds
                .push(BufferBuild::new(request, duration, self.config.sample_rate)?);
        }
        Ok(())
    }

    /// Control-loop housekeeping: digest realtime reports, step pending
    /// buffer builds, drain finished voices and run due governor sweeps.
    pub fn advance(&mut self) {
        self.pump_reports();
        self.step_builds();
        self.drain_released();
        let (now, snapshot) = {
            let pool = self.pool.lock();
            (pool.now(), pool.snapshot())
        };
        let heap = self.heap_info();
        let actions = self.governor.tick(now, &snapshot, heap);
        self.apply_actions(actions);
    }

    /// Render one interleaved stereo block without an audio device, then
    /// advance. This is the offline pump used by renders and tests.
    pub fn render_block(&mut self, out: &mut [f32]) {
        self.pool.lock().render_block(out, None);
        self.advance();
    }

    pub fn shutdown(&mut self) {
        self.pool.lock().stop_all();
        self.release_realtime();
        self.governor.shutdown();
        self.pending_builds.clear();
        self.cache.clear();
    }

    fn heap_info(&self) -> Option<HeapInfo> {
        self.probe.as_ref().and_then(|p| p.heap_info())
    }

    /// Live budget for new patterns. Without a probe the configured
    /// budget stands; with one, headroom shrinks it.
    fn pattern_caps(&self) -> PatternCaps {
        let mut caps = PatternCaps {
            max_oscillators: self.config.max_pattern_oscillators,
            max_live_lattice_pairs: self.config.max_live_lattice_pairs,
        };
        if let Some(info) = self.heap_info() {
            let ratio = info.ratio();
            let mut safe = if ratio > 0.7 {
                3
            } else if ratio > 0.5 {
                5
            } else {
                caps.max_oscillators
            };
            if self.pool.lock().active_len() > 4 {
                safe = safe.saturating_sub(2);
            }
            caps.max_oscillators = safe.max(2);
        }
        caps
    }

    /// Seconds of pattern buffer we can afford, derived from heap
    /// headroom when a probe exists.
    fn buffer_duration_secs(&self) -> u32 {
        match self.heap_info() {
            Some(info) => ((info.available_bytes() / BUFFER_BYTES_PER_SEC) as u32).clamp(2, 10),
            None => self.config.clamped_buffer_secs() as u32,
        }
    }

    /// Expand a request, degrading failed pattern generation to the
    /// amplitude fallback instead of failing the start.
    fn pattern_graph(&self, request: ToneRequest, caps: PatternCaps) -> Result<PatternGraph> {
        match request.graph(caps) {
            Ok(graph) => Ok(graph),
            Err(err) if request.is_pattern() && err.is_recoverable() => {
                tracing::warn!(error = %err, "pattern generation failed, using amplitude fallback");
                self.events.emit(EngineEvent::AudioError {
                    message: err.to_string(),
                });
                let set = oscillator_set(PatternKind::AmFallback, DEFAULT_BASE_HZ, 1.0)?;
                Ok(PatternGraph::Live(set))
            }
            Err(err) => Err(err),
        }
    }

    fn arm_realtime(&mut self, id: &str, kind: PatternKind, base_hz: f32) -> VoiceSource {
        if let Some(link) = self.link.as_mut() {
            let configure = RealtimeCommand::Configure { kind, base_hz };
            if link.commands.try_push(configure).is_ok() {
                let _ = link.commands.try_push(RealtimeCommand::Start);
                self.realtime_voice = Some(id.to_string());
                tracing::debug!(id, kind = %kind, "pattern routed to the realtime path");
            } else {
                tracing::warn!(id, "realtime command ring full, pattern not armed");
            }
        }
        VoiceSource::Remote(RemoteHandle { kind })
    }

    fn obtain_buffer(&mut self, request: BufferRequest) -> Result<Arc<PatternBuffer>> {
        let duration = self.buffer_duration_secs();
        let now = self.pool.lock().now();
        let key = CacheKey::new(request.kind, request.base_hz, duration);
        if let Some(buffer) = self.cache.get(&key, now) {
            return Ok(buffer);
        }
        // Cold start: adopt a matching in-flight build if there is one,
        // then run it to completion right here.
        let mut build = match self.pending_builds.iter().position(|b| b.key() == key) {
            Some(i) => self.pending_builds.swap_remove(i),
            None => BufferBuild::new(request, duration, self.config.sample_rate)?,
        };
        while !build.step() {}
        let buffer = Arc::new(build.finish());
        self.cache.insert(key, Arc::clone(&buffer), now);
        tracing::debug!(kind = %key.kind, duration, "pattern buffer rendered");
        Ok(buffer)
    }

    fn admit(&mut self, id: &str, source: VoiceSource, pattern: bool) {
        let (outcome, now) = {
            let mut pool = self.pool.lock();
            let ramp = pool.ramp_frames();
            let outcome = pool.register(Voice::new(id.to_string(), source, pattern, ramp));
            pool.start(id);
            (outcome, pool.now())
        };
        if outcome.replaced {
            tracing::debug!(id, "replaced a playing tone with the same id");
        }
        for evicted in outcome.evicted {
            tracing::info!(id = evicted.as_str(), "voice limit reached, oldest stopped");
            self.events.emit(EngineEvent::ResourceLimitReached {
                id: evicted,
                message: EVICTION_MESSAGE.to_string(),
            });
        }
        self.events.emit(EngineEvent::ToneStarted { id: id.to_string() });
        self.governor.note_registered(now);
    }

    fn pump_reports(&mut self) {
        let mut factors = Vec::new();
        if let Some(link) = &self.link {
            while let Ok(report) = link.reports.try_recv() {
                if let Some(factor) = self.arbiter.note_report(report) {
                    factors.push(factor);
                }
            }
        }
        if factors.is_empty() {
            return;
        }
        if let Some(link) = self.link.as_mut() {
            for factor in factors {
                let pushed = link
                    .commands
                    .try_push(RealtimeCommand::ReduceComplexity { factor });
                if pushed.is_ok() {
                    tracing::info!(factor, "realtime overrun, reducing pattern complexity");
                }
            }
        }
    }

    fn step_builds(&mut self) {
        let done = match self.pending_builds.first_mut() {
            Some(build) => build.step(),
            None => return,
        };
        if done {
            let build = self.pending_builds.remove(0);
            let key = build.key();
            let now = self.pool.lock().now();
            self.cache.insert(key, Arc::new(build.finish()), now);
            tracing::debug!(kind = %key.kind, "pattern buffer precomputed");
        }
    }

    fn drain_released(&mut self) {
        let (released, has_active, now) = {
            let mut pool = self.pool.lock();
            let released = pool.take_released();
            (released, pool.has_active(), pool.now())
        };
        if released.is_empty() {
            return;
        }
        for id in released {
            if self.realtime_voice.as_deref() == Some(id.as_str()) {
                self.release_realtime();
            }
            self.events.emit(EngineEvent::ToneStopped { id });
        }
        if !has_active {
            self.governor.note_emptied(now);
        }
    }

    fn release_realtime(&mut self) {
        if self.realtime_voice.take().is_some() {
            if let Some(link) = self.link.as_mut() {
                let _ = link.commands.try_push(RealtimeCommand::Stop);
            }
        }
    }

    fn apply_actions(&mut self, actions: Vec<GovernorAction>) {
        for action in actions {
            match action {
                GovernorAction::StopVoice { id, reason } => {
                    if !self.pool.lock().stop(&id) {
                        continue;
                    }
                    match reason {
                        ActionReason::LongRunning => {
                            tracing::info!(id = id.as_str(), "stopping long-running voice");
                            self.events.emit(EngineEvent::AutoCleanup {
                                id,
                                reason: "long-running".to_string(),
                            });
                        }
                        ActionReason::MemoryCritical => {
                            self.events.emit(EngineEvent::ResourceLimitReached {
                                id,
                                message: CRITICAL_MEMORY_MESSAGE.to_string(),
                            });
                        }
                        ActionReason::MemoryHigh => {
                            self.events.emit(EngineEvent::ResourceLimitReached {
                                id,
                                message: PATTERN_PRESSURE_MESSAGE.to_string(),
                            });
                        }
                    }
                }
                GovernorAction::TrimCache => {
                    let now = self.pool.lock().now();
                    let removed = self.cache.trim_idle(now);
                    if removed > 0 {
                        tracing::debug!(removed, "dropped idle pattern buffers");
                    }
                }
                GovernorAction::ClearCache => {
                    self.cache.clear();
                    tracing::debug!("cleared the pattern buffer cache");
                }
                GovernorAction::Suspend => {
                    tracing::info!("engine idle, suspending output");
                    self.pool.lock().suspend();
                }
            }
        }
    }
}
