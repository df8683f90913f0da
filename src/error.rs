//! Error taxonomy for the tone engine.
//!
//! Only initialization failures surface to callers as hard errors. Pattern
//! generation problems degrade to the AM fallback pattern, resource pressure
//! is resolved by the governor, and transient node failures are logged and
//! swallowed. No error path may take the whole engine down.

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    /// The audio output pipeline could not be brought up. The engine stays
    /// inert; a later start may retry initialization.
    #[error("audio initialization failed: {reason}")]
    Initialization { reason: String },

    /// A waveform generator rejected its inputs or exceeded its budget.
    #[error("pattern generation failed ({kind}): {reason}")]
    Generation { kind: String, reason: String },

    /// The governor refused a request outright (distinct from automatic
    /// eviction, which is reported through the event bus instead).
    #[error("resource limit: {reason}")]
    ResourceExhaustion { reason: String },

    /// A single node in an otherwise healthy chain failed mid-flight.
    #[error("transient node failure: {reason}")]
    TransientNode { reason: String },

    #[error("unknown tone id: {id}")]
    UnknownTone { id: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("config serialize error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    #[error("catalog parse error: {0}")]
    Catalog(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether the engine recovers from this error on its own (fallback
    /// pattern, eviction, retry) rather than needing caller intervention.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::Generation { .. }
                | EngineError::ResourceExhaustion { .. }
                | EngineError::TransientNode { .. }
        )
    }
}
