use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

/// Notifications emitted by the engine. Delivery is fire-and-forget: a
/// subscriber that falls behind buffers events in its channel, a dropped
/// subscriber is pruned on the next emit.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    ToneStarted { id: String },
    ToneStopped { id: String },
    ResourceLimitReached { id: String, message: String },
    AutoCleanup { id: String, reason: String },
    AudioError { message: String },
    VolumeChanged { value: f32 },
}

impl EngineEvent {
    /// Wire name of the event, for host bridges that key handlers by string.
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::ToneStarted { .. } => "toneStarted",
            EngineEvent::ToneStopped { .. } => "toneStopped",
            EngineEvent::ResourceLimitReached { .. } => "resourceLimitReached",
            EngineEvent::AutoCleanup { .. } => "autoCleanup",
            EngineEvent::AudioError { .. } => "audioError",
            EngineEvent::VolumeChanged { .. } => "volumeChanged",
        }
    }
}

/// Multi-subscriber event fan-out over crossbeam channels.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<EngineEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: EngineEvent) {
        let mut subs = self.subscribers.lock();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
