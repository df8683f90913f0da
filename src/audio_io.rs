//! Output stream plumbing. The audio callback owns the realtime pattern
//! processor; each block it drains pending commands, renders the realtime
//! pattern into a scratch buffer, then lets the pool mix everything.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleFormat, SampleRate, StreamConfig};
use crossbeam::channel::Sender;
use parking_lot::Mutex;
use ringbuf::traits::Consumer;
use ringbuf::HeapCons;
use std::sync::Arc;

use crate::command::{RealtimeCommand, RealtimeReport};
use crate::error::{EngineError, Result};
use crate::pool::VoicePool;
use crate::realtime::RealtimeProcessor;

fn output_device() -> Result<(cpal::Device, cpal::SupportedStreamConfig)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| EngineError::Initialization {
            reason: "no output device available".to_string(),
        })?;
    let supported = device
        .default_output_config()
        .map_err(|e| EngineError::Initialization {
            reason: format!("no default output config: {e}"),
        })?;
    Ok((device, supported))
}

/// Sample rate of the default output device, so the engine can be built
/// to match before the stream exists.
pub fn default_output_rate() -> Result<u32> {
    let (_, supported) = output_device()?;
    Ok(supported.sample_rate().0)
}

/// Build and start the output stream. Playback stops when the returned
/// stream is dropped.
pub fn run_output_stream(
    pool: Arc<Mutex<VoicePool>>,
    mut commands: HeapCons<RealtimeCommand>,
    reports: Sender<RealtimeReport>,
    sample_rate: u32,
) -> Result<cpal::Stream> {
    let (device, supported) = output_device()?;
    let sample_format = supported.sample_format();
    let config = StreamConfig {
        channels: 2,
        sample_rate: SampleRate(sample_rate),
        buffer_size: BufferSize::Default,
    };

    let mut processor = RealtimeProcessor::new(sample_rate, reports);
    let mut scratch: Vec<f32> = Vec::new();
    let audio_callback = move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
        while let Some(command) = commands.try_pop() {
            processor.handle(command);
        }
        if scratch.len() != data.len() {
            scratch.resize(data.len(), 0.0);
        }
        processor.render(&mut scratch);
        pool.lock().render_block(data, Some(&scratch));
    };
    let err_fn = |err| tracing::error!("stream error: {err}");

    let stream = match sample_format {
        SampleFormat::F32 => {
            device
                .build_output_stream(&config, audio_callback, err_fn, None)
                .map_err(|e| EngineError::Initialization {
                    reason: format!("failed to build output stream: {e}"),
                })?
        }
        other => {
            return Err(EngineError::Initialization {
                reason: format!("unsupported sample format {other:?}"),
            })
        }
    };
    stream.play().map_err(|e| EngineError::Initialization {
        reason: format!("failed to start output stream: {e}"),
    })?;
    Ok(stream)
}
