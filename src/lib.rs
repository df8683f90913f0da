//! Tone generation engine: binaural, solfeggio and procedural pattern
//! synthesis with a fixed-size voice pool, buffered pattern playback and
//! memory-pressure governance.
//!
//! Hosts build a [`ToneEngine`], hand its pool to an output stream (see
//! [`audio_io::run_output_stream`]) and drive [`ToneEngine::advance`]
//! from a control loop.

pub mod audio_io;
pub mod cache;
pub mod catalog;
pub mod command;
pub mod config;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod events;
pub mod governor;
pub mod patterns;
pub mod pool;
pub mod realtime;
pub mod voice;

pub use config::EngineConfig;
pub use engine::{EngineStatus, RealtimeLink, ToneEngine};
pub use error::{EngineError, Result};
pub use events::EngineEvent;
pub use governor::{HeapInfo, MemoryProbe};
pub use patterns::PatternKind;
pub use voice::ToneRequest;
