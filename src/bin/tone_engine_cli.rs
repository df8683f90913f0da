use clap::{Args as ClapArgs, Parser, Subcommand};
use crossbeam::channel::unbounded;
use ringbuf::traits::Split;
use ringbuf::HeapRb;
use tone_engine::audio_io;
use tone_engine::catalog::{self, Catalog};
use tone_engine::command::RealtimeCommand;
use tone_engine::{
    EngineConfig, EngineEvent, PatternKind, RealtimeLink, ToneEngine, ToneRequest,
};
use tracing_subscriber::EnvFilter;

/// CLI for playing or rendering tones with the tone engine
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a tone on the default output device until Ctrl+C
    Play(ToneArgs),
    /// Render a tone to a WAV file
    Render(RenderArgs),
    /// Generate a default config file and exit
    GenerateConfig(ConfigArgs),
}

#[derive(ClapArgs)]
struct ToneArgs {
    /// Engine config TOML (built-in defaults when omitted)
    #[arg(long)]
    config: Option<String>,
    /// Frequency catalog JSON for --preset lookups
    #[arg(long)]
    catalog: Option<String>,
    /// Catalog preset id to play
    #[arg(long)]
    preset: Option<String>,
    /// Pure tone frequency in Hz
    #[arg(long)]
    frequency: Option<f32>,
    /// Binaural beat frequency in Hz, mixed onto --carrier
    #[arg(long)]
    beat: Option<f32>,
    /// Carrier frequency for binaural beats
    #[arg(long, default_value_t = 200.0)]
    carrier: f32,
    /// Procedural pattern tag (aleph-null, aleph-one, aleph-two)
    #[arg(long)]
    pattern: Option<String>,
    /// Base frequency for patterns
    #[arg(long, default_value_t = 432.0)]
    base: f32,
    /// Pattern complexity in 0..=1
    #[arg(long, default_value_t = 1.0)]
    complexity: f32,
}

#[derive(ClapArgs)]
struct RenderArgs {
    #[command(flatten)]
    tone: ToneArgs,
    /// Seconds of audio to render
    #[arg(long, default_value_t = 10.0)]
    duration: f64,
    /// Output WAV path
    #[arg(long, default_value = "tone.wav")]
    out: String,
}

#[derive(ClapArgs)]
struct ConfigArgs {
    /// Output path for the generated configuration
    #[arg(long, default_value = "config.toml")]
    out: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Play(args) => play_command(args)?,
        Commands::Render(args) => render_command(args)?,
        Commands::GenerateConfig(cfg) => {
            EngineConfig::generate_default(&cfg.out)?;
            println!("Generated default config at {}", cfg.out);
        }
    }
    Ok(())
}

fn load_config(path: &Option<String>) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    match path {
        Some(p) => Ok(EngineConfig::from_file(p)?),
        None => Ok(EngineConfig::default()),
    }
}

fn resolve_tone(args: &ToneArgs) -> Result<(String, ToneRequest), Box<dyn std::error::Error>> {
    if let Some(preset) = &args.preset {
        let path = args.catalog.as_ref().ok_or("--preset requires --catalog")?;
        let catalog = Catalog::from_file(path)?;
        let spec = catalog
            .find(preset)
            .ok_or_else(|| format!("unknown preset {preset}"))?;
        println!(
            "{} ({})",
            spec.title,
            catalog::format_frequency(spec.frequency_hz)
        );
        if let Some(warning) = &spec.warning {
            eprintln!("warning: {warning}");
        }
        return Ok((preset.clone(), spec.request()?));
    }
    if let Some(tag) = &args.pattern {
        return Ok((
            tag.clone(),
            ToneRequest::Pattern {
                kind: PatternKind::from_tag(tag),
                base_hz: args.base,
                complexity: args.complexity,
            },
        ));
    }
    if let Some(beat) = args.beat {
        return Ok((
            format!("binaural-{beat}"),
            ToneRequest::Binaural {
                beat_hz: beat,
                carrier_hz: args.carrier,
            },
        ));
    }
    if let Some(frequency) = args.frequency {
        return Ok((
            format!("tone-{frequency}"),
            ToneRequest::Tone {
                frequency_hz: frequency,
            },
        ));
    }
    Err("select a tone with --preset, --pattern, --beat or --frequency".into())
}

fn play_command(args: ToneArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(&args.config)?;
    config.sample_rate = audio_io::default_output_rate()?;
    let sample_rate = config.sample_rate;
    let (id, request) = resolve_tone(&args)?;

    let mut engine = ToneEngine::new(config);
    let events = engine.subscribe();

    let rb = HeapRb::<RealtimeCommand>::new(1024);
    let (prod, cons) = rb.split();
    let (report_tx, report_rx) = unbounded();
    let stream = audio_io::run_output_stream(engine.pool(), cons, report_tx, sample_rate)?;
    engine.attach_realtime(RealtimeLink {
        commands: prod,
        reports: report_rx,
    });

    engine.start_tone(&id, request)?;
    println!("Playing {id}... press Ctrl+C to stop");

    let (stop_tx, stop_rx) = unbounded();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })?;

    loop {
        if stop_rx
            .recv_timeout(std::time::Duration::from_millis(50))
            .is_ok()
        {
            break;
        }
        engine.advance();
        for event in events.try_iter() {
            announce(&event);
        }
    }

    engine.shutdown();
    // Let the release ramp play out before the stream is dropped.
    std::thread::sleep(std::time::Duration::from_millis(200));
    drop(stream);
    Ok(())
}

fn render_command(args: RenderArgs) -> Result<(), Box<dyn std::error::Error>> {
    use hound::{SampleFormat, WavSpec, WavWriter};

    let config = load_config(&args.tone.config)?;
    let sample_rate = config.sample_rate;
    let (id, request) = resolve_tone(&args.tone)?;

    let mut engine = ToneEngine::new(config);
    engine.start_tone(&id, request)?;

    let spec = WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(&args.out, spec)?;
    let start_time = std::time::Instant::now();
    let mut remaining = (args.duration * sample_rate as f64) as usize;
    let mut buffer = vec![0.0f32; 512 * 2];
    while remaining > 0 {
        let frames = 512.min(remaining);
        buffer.resize(frames * 2, 0.0);
        engine.render_block(&mut buffer);
        for sample in &buffer[..frames * 2] {
            let s = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer.write_sample(s)?;
        }
        remaining -= frames;
    }
    writer.finalize()?;
    let elapsed = start_time.elapsed().as_secs_f32();
    println!("Rendered {}s to {} in {elapsed:.2}s", args.duration, args.out);
    Ok(())
}

fn announce(event: &EngineEvent) {
    match event {
        EngineEvent::ToneStarted { id } => println!("started {id}"),
        EngineEvent::ToneStopped { id } => println!("stopped {id}"),
        EngineEvent::ResourceLimitReached { id, message } => println!("{message} ({id})"),
        EngineEvent::AutoCleanup { id, reason } => println!("cleaned up {id} ({reason})"),
        EngineEvent::AudioError { message } => eprintln!("audio error: {message}"),
        EngineEvent::VolumeChanged { value } => println!("volume {value:.2}"),
    }
}
