//! End-to-end engine tests driven through the public API: voices are
//! started, blocks are pumped offline and governor behaviour is observed
//! through the event stream.

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use tone_engine::{
    EngineConfig, EngineEvent, HeapInfo, MemoryProbe, PatternKind, ToneEngine, ToneRequest,
};

struct FakeProbe {
    used_bytes: u64,
    limit_bytes: u64,
}

impl MemoryProbe for FakeProbe {
    fn heap_info(&self) -> Option<HeapInfo> {
        Some(HeapInfo {
            used_bytes: self.used_bytes,
            limit_bytes: self.limit_bytes,
        })
    }
}

fn probe(used_mb: u64, limit_mb: u64) -> Box<FakeProbe> {
    Box::new(FakeProbe {
        used_bytes: used_mb * 1024 * 1024,
        limit_bytes: limit_mb * 1024 * 1024,
    })
}

fn base_config() -> EngineConfig {
    EngineConfig {
        sample_rate: 8000,
        ..EngineConfig::default()
    }
}

fn pump(engine: &mut ToneEngine, blocks: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; 512];
    let mut collected = Vec::new();
    for _ in 0..blocks {
        engine.render_block(&mut out);
        collected.extend_from_slice(&out);
    }
    collected
}

#[test]
fn critical_memory_halves_the_active_voices() {
    let mut engine = ToneEngine::new(EngineConfig {
        memory_check_secs: 0.01,
        ..base_config()
    });
    engine.set_memory_probe(probe(90, 100));
    let rx = engine.subscribe();

    for id in ["a", "b", "c", "d"] {
        engine
            .start_tone(id, ToneRequest::Tone { frequency_hz: 440.0 })
            .unwrap();
    }
    pump(&mut engine, 20);

    assert_eq!(engine.status().active_voices, 2);
    let events: Vec<EngineEvent> = rx.try_iter().collect();
    let critical = "High memory usage detected. Some tones have been stopped automatically.";
    for id in ["a", "b"] {
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::ResourceLimitReached { id: i, message } if i == id && message == critical
        )));
        assert!(events
            .iter()
            .any(|e| *e == EngineEvent::ToneStopped { id: id.to_string() }));
    }
    // The survivors were never told to stop.
    assert!(!events.iter().any(
        |e| matches!(e, EngineEvent::ResourceLimitReached { id, .. } if id == "c" || id == "d")
    ));
}

#[test]
fn high_memory_stops_only_the_oldest_pattern() {
    let mut engine = ToneEngine::new(EngineConfig {
        memory_check_secs: 0.01,
        ..base_config()
    });
    engine.set_memory_probe(probe(75, 100));
    let rx = engine.subscribe();

    engine
        .start_tone("plain", ToneRequest::Tone { frequency_hz: 440.0 })
        .unwrap();
    for id in ["pat-a", "pat-b"] {
        engine
            .start_tone(
                id,
                ToneRequest::Pattern {
                    kind: PatternKind::AmFallback,
                    base_hz: 432.0,
                    complexity: 1.0,
                },
            )
            .unwrap();
    }
    pump(&mut engine, 20);

    assert_eq!(engine.status().active_voices, 2);
    let events: Vec<EngineEvent> = rx.try_iter().collect();
    let pressure = "Multiple complex patterns detected. Oldest pattern stopped to conserve memory.";
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::ResourceLimitReached { id, message } if id == "pat-a" && message == pressure
    )));
    assert!(!events
        .iter()
        .any(|e| matches!(e, EngineEvent::ResourceLimitReached { id, .. } if id == "pat-b")));
}

#[test]
fn long_running_voices_are_cleaned_up() {
    let mut engine = ToneEngine::new(EngineConfig {
        resource_check_secs: 0.01,
        long_running_secs: 0.02,
        ..base_config()
    });
    let rx = engine.subscribe();
    engine
        .start_tone("marathon", ToneRequest::Tone { frequency_hz: 440.0 })
        .unwrap();
    pump(&mut engine, 16);

    assert_eq!(engine.status().active_voices, 0);
    let events: Vec<EngineEvent> = rx.try_iter().collect();
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::AutoCleanup { id, reason } if id == "marathon" && reason == "long-running"
    )));
}

#[test]
fn idle_engine_clears_buffers_and_suspends() {
    let mut engine = ToneEngine::new(EngineConfig {
        idle_release_secs: 0.01,
        ..base_config()
    });
    engine
        .start_tone(
            "lattice",
            ToneRequest::Pattern {
                kind: PatternKind::PrimeLattice,
                base_hz: 432.0,
                complexity: 1.0,
            },
        )
        .unwrap();
    assert_eq!(engine.status().cached_buffers, 1);

    engine.stop_tone("lattice").unwrap();
    pump(&mut engine, 16);

    let status = engine.status();
    assert!(status.suspended);
    assert_eq!(status.active_voices, 0);
    assert_eq!(status.cached_buffers, 0);
}

#[test]
fn precomputed_buffers_are_reused_on_start() {
    let mut engine = ToneEngine::new(base_config());
    engine
        .precompute_patterns(&[PatternKind::PrimeLattice, PatternKind::AmFallback], 432.0)
        .unwrap();
    // Builds advance one chunk per control tick.
    for _ in 0..40 {
        engine.advance();
    }
    // The fallback pattern never gets a buffer.
    assert_eq!(engine.status().cached_buffers, 1);

    engine
        .start_tone(
            "lattice",
            ToneRequest::Pattern {
                kind: PatternKind::PrimeLattice,
                base_hz: 432.0,
                complexity: 1.0,
            },
        )
        .unwrap();
    assert_eq!(engine.status().cached_buffers, 1);
    assert_eq!(engine.status().active_voices, 1);
}

#[test]
fn randomized_start_stop_never_exceeds_the_voice_limit() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(0x746f_6e65);
    let mut engine = ToneEngine::new(EngineConfig {
        max_voices: 3,
        ..base_config()
    });
    for step in 0..200u32 {
        let id = format!("v{}", rng.gen_range(0..8));
        if rng.gen_bool(0.6) {
            engine
                .start_tone(
                    &id,
                    ToneRequest::Tone {
                        frequency_hz: 100.0 + step as f32,
                    },
                )
                .unwrap();
        } else {
            let _ = engine.stop_tone(&id);
        }
        assert!(engine.status().active_voices <= 3);
        if rng.gen_bool(0.3) {
            pump(&mut engine, 1);
        }
    }
    engine.stop_all();
    pump(&mut engine, 8);
    assert_eq!(engine.status().active_voices, 0);
}

#[test]
fn buffered_series_keeps_its_golden_ratio_fundamental() {
    let sample_rate = 8000u32;
    let mut engine = ToneEngine::new(EngineConfig {
        sample_rate,
        ..EngineConfig::default()
    });
    // Shrink the live budget so the full series takes the buffered path.
    engine.set_memory_probe(probe(80, 100));
    engine
        .start_tone(
            "series",
            ToneRequest::Pattern {
                kind: PatternKind::CountableSeries,
                base_hz: 432.0,
                complexity: 1.0,
            },
        )
        .unwrap();
    assert_eq!(engine.status().cached_buffers, 1);

    let samples = pump(&mut engine, 40);
    // Past the gain ramp and the buffer edge fade.
    let frames: Vec<f32> = samples
        .chunks_exact(2)
        .skip(1024)
        .take(8192)
        .map(|frame| frame[0])
        .collect();
    assert_eq!(frames.len(), 8192);

    let len = frames.len();
    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(len);
    let mut buffer: Vec<Complex<f32>> = frames
        .iter()
        .enumerate()
        .map(|(n, &s)| {
            let window =
                0.5 * (1.0 - (2.0 * std::f32::consts::PI * n as f32 / (len - 1) as f32).cos());
            Complex::new(s * window, 0.0)
        })
        .collect();
    fft.process(&mut buffer);

    let peak_bin = buffer[1..len / 2]
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.norm().total_cmp(&b.norm()))
        .map(|(i, _)| i + 1)
        .unwrap();
    let peak_hz = peak_bin as f32 * sample_rate as f32 / len as f32;
    // Loudest partial of the series sits at base * (1 + phi).
    let expected = 432.0 * 2.618_034;
    assert!(
        (peak_hz - expected).abs() < 8.0,
        "peak at {peak_hz} Hz, expected near {expected} Hz"
    );
}
