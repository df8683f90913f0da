//! Resource governance. The governor watches the pool through periodic
//! sweeps on the engine's sample clock: a memory sweep that sheds voices
//! under heap pressure, and a slower sweep that retires long-running
//! voices and trims the buffer cache. Sweeps only run while voices exist;
//! once the pool drains they are replaced by a single idle deadline that
//! clears the cache and suspends rendering.

use crate::config::EngineConfig;
use crate::pool::VoiceInfo;

/// Coarse heap snapshot supplied by the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapInfo {
    pub used_bytes: u64,
    pub limit_bytes: u64,
}

impl HeapInfo {
    pub fn ratio(&self) -> f32 {
        if self.limit_bytes == 0 {
            0.0
        } else {
            self.used_bytes as f32 / self.limit_bytes as f32
        }
    }

    pub fn available_bytes(&self) -> u64 {
        self.limit_bytes.saturating_sub(self.used_bytes)
    }
}

/// Where heap snapshots come from. Hosts without one simply return None,
/// which disables pressure handling without disabling anything else.
pub trait MemoryProbe: Send {
    fn heap_info(&self) -> Option<HeapInfo>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionReason {
    LongRunning,
    MemoryHigh,
    MemoryCritical,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GovernorAction {
    StopVoice { id: String, reason: ActionReason },
    TrimCache,
    ClearCache,
    Suspend,
}

pub struct ResourceGovernor {
    memory_check_frames: u64,
    resource_check_frames: u64,
    long_running_frames: u64,
    idle_release_frames: u64,
    high_watermark: f32,
    critical_watermark: f32,
    next_memory_check: Option<u64>,
    next_resource_check: Option<u64>,
    idle_deadline: Option<u64>,
}

impl ResourceGovernor {
    pub fn new(config: &EngineConfig) -> Self {
        let sr = config.sample_rate as f64;
        ResourceGovernor {
            memory_check_frames: (config.memory_check_secs * sr) as u64,
            resource_check_frames: (config.resource_check_secs * sr) as u64,
            long_running_frames: (config.long_running_secs * sr) as u64,
            idle_release_frames: (config.idle_release_secs * sr) as u64,
            high_watermark: config.memory_high_watermark,
            critical_watermark: config.memory_critical_watermark,
            next_memory_check: None,
            next_resource_check: None,
            idle_deadline: None,
        }
    }

    /// A voice was admitted: make sure the sweeps are armed and cancel
    /// any pending idle release.
    pub fn note_registered(&mut self, now: u64) {
        self.idle_deadline = None;
        if self.next_memory_check.is_none() {
            self.next_memory_check = Some(now + self.memory_check_frames);
        }
        if self.next_resource_check.is_none() {
            self.next_resource_check = Some(now + self.resource_check_frames);
        }
    }

    /// The last voice is gone: stop sweeping and schedule one idle
    /// release instead.
    pub fn note_emptied(&mut self, now: u64) {
        self.next_memory_check = None;
        self.next_resource_check = None;
        self.idle_deadline = Some(now + self.idle_release_frames);
    }

    pub fn shutdown(&mut self) {
        self.next_memory_check = None;
        self.next_resource_check = None;
        self.idle_deadline = None;
    }

    /// Run everything that is due at `now`. Voices are the pool's active
    /// snapshot; `heap` is this tick's probe reading, if any.
    pub fn tick(
        &mut self,
        now: u64,
        voices: &[VoiceInfo],
        heap: Option<HeapInfo>,
    ) -> Vec<GovernorAction> {
        let mut actions = Vec::new();

        if let Some(deadline) = self.idle_deadline {
            if now >= deadline {
                self.idle_deadline = None;
                actions.push(GovernorAction::ClearCache);
                actions.push(GovernorAction::Suspend);
            }
        }

        if let Some(due) = self.next_memory_check {
            if now >= due {
                self.next_memory_check = Some(now + self.memory_check_frames);
                if let Some(heap) = heap {
                    self.memory_sweep(heap, voices, &mut actions);
                }
            }
        }

        if let Some(due) = self.next_resource_check {
            if now >= due {
                self.next_resource_check = Some(now + self.resource_check_frames);
                self.resource_sweep(now, voices, &mut actions);
            }
        }

        actions
    }

    fn memory_sweep(&self, heap: HeapInfo, voices: &[VoiceInfo], actions: &mut Vec<GovernorAction>) {
        let ratio = heap.ratio();
        if ratio > self.critical_watermark {
            if voices.len() > 2 {
                let shed = voices.len().div_ceil(2);
                for voice in oldest_first(voices).into_iter().take(shed) {
                    actions.push(GovernorAction::StopVoice {
                        id: voice.id.clone(),
                        reason: ActionReason::MemoryCritical,
                    });
                }
            }
            actions.push(GovernorAction::ClearCache);
        } else if ratio > self.high_watermark {
            let patterns: Vec<&VoiceInfo> = oldest_first(voices)
                .into_iter()
                .filter(|v| v.pattern)
                .collect();
            if patterns.len() > 1 {
                actions.push(GovernorAction::StopVoice {
                    id: patterns[0].id.clone(),
                    reason: ActionReason::MemoryHigh,
                });
            }
        }
    }

    fn resource_sweep(&self, now: u64, voices: &[VoiceInfo], actions: &mut Vec<GovernorAction>) {
        for voice in voices {
            if now.saturating_sub(voice.created_at) > self.long_running_frames {
                actions.push(GovernorAction::StopVoice {
                    id: voice.id.clone(),
                    reason: ActionReason::LongRunning,
                });
            }
        }
        actions.push(GovernorAction::TrimCache);
    }
}

fn oldest_first(voices: &[VoiceInfo]) -> Vec<&VoiceInfo> {
    let mut by_age: Vec<&VoiceInfo> = voices.iter().collect();
    by_age.sort_by_key(|v| (v.created_at, v.seq));
    by_age
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EngineConfig {
        EngineConfig {
            sample_rate: 1000,
            memory_check_secs: 1.0,
            resource_check_secs: 2.0,
            long_running_secs: 10.0,
            idle_release_secs: 5.0,
            ..EngineConfig::default()
        }
    }

    fn voice(id: &str, created_at: u64, pattern: bool) -> VoiceInfo {
        VoiceInfo {
            id: id.to_string(),
            created_at,
            seq: created_at,
            pattern,
            remote: false,
        }
    }

    fn heap(ratio: f32) -> Option<HeapInfo> {
        Some(HeapInfo {
            used_bytes: (ratio * 1000.0) as u64,
            limit_bytes: 1000,
        })
    }

    fn stops(actions: &[GovernorAction]) -> Vec<(&str, ActionReason)> {
        actions
            .iter()
            .filter_map(|a| match a {
                GovernorAction::StopVoice { id, reason } => Some((id.as_str(), *reason)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn critical_pressure_sheds_half_the_pool_oldest_first() {
        let mut gov = ResourceGovernor::new(&config());
        gov.note_registered(0);
        let voices = vec![
            voice("a", 0, false),
            voice("b", 100, true),
            voice("c", 200, false),
            voice("d", 300, false),
        ];
        let actions = gov.tick(1000, &voices, heap(0.9));
        assert_eq!(
            stops(&actions),
            vec![
                ("a", ActionReason::MemoryCritical),
                ("b", ActionReason::MemoryCritical)
            ]
        );
        assert!(actions.contains(&GovernorAction::ClearCache));
        assert!(!actions.contains(&GovernorAction::Suspend));
    }

    #[test]
    fn critical_pressure_with_two_voices_only_clears_the_cache() {
        let mut gov = ResourceGovernor::new(&config());
        gov.note_registered(0);
        let voices = vec![voice("a", 0, false), voice("b", 100, false)];
        let actions = gov.tick(1000, &voices, heap(0.95));
        assert!(stops(&actions).is_empty());
        assert!(actions.contains(&GovernorAction::ClearCache));
    }

    #[test]
    fn high_pressure_stops_only_the_oldest_pattern() {
        let mut gov = ResourceGovernor::new(&config());
        gov.note_registered(0);
        let voices = vec![
            voice("tone", 0, false),
            voice("p1", 100, true),
            voice("p2", 200, true),
        ];
        let actions = gov.tick(1000, &voices, heap(0.75));
        assert_eq!(stops(&actions), vec![("p1", ActionReason::MemoryHigh)]);
        assert!(!actions.contains(&GovernorAction::ClearCache));

        // A single pattern is left alone.
        let actions = gov.tick(2000, &voices[..2], heap(0.75));
        assert!(stops(&actions).is_empty());
    }

    #[test]
    fn no_probe_reading_means_no_pressure_actions() {
        let mut gov = ResourceGovernor::new(&config());
        gov.note_registered(0);
        let voices = vec![voice("a", 0, true), voice("b", 1, true), voice("c", 2, true)];
        let actions = gov.tick(1000, &voices, None);
        assert!(stops(&actions).is_empty());
        // The sweep still rescheduled itself.
        let actions = gov.tick(2000, &voices, heap(0.99));
        assert!(!stops(&actions).is_empty());
    }

    #[test]
    fn sweeps_fire_only_when_due() {
        let mut gov = ResourceGovernor::new(&config());
        gov.note_registered(0);
        let voices = vec![voice("a", 0, false)];
        assert!(gov.tick(999, &voices, heap(0.99)).is_empty());
        let actions = gov.tick(1000, &voices, heap(0.99));
        // One voice: critical clears the cache but stops nothing.
        assert!(actions.contains(&GovernorAction::ClearCache));
    }

    #[test]
    fn long_running_voices_are_retired_and_cache_trimmed() {
        let mut gov = ResourceGovernor::new(&config());
        gov.note_registered(0);
        let voices = vec![voice("old", 0, true), voice("young", 15_000, false)];
        let actions = gov.tick(22_000, &voices, None);
        assert_eq!(stops(&actions), vec![("old", ActionReason::LongRunning)]);
        assert!(actions.contains(&GovernorAction::TrimCache));
    }

    #[test]
    fn empty_pool_swaps_sweeps_for_one_idle_release() {
        let mut gov = ResourceGovernor::new(&config());
        gov.note_registered(0);
        gov.note_emptied(1000);
        // Sweeps are gone.
        assert!(gov.tick(4000, &[], heap(0.99)).is_empty());
        let actions = gov.tick(6000, &[], None);
        assert_eq!(
            actions,
            vec![GovernorAction::ClearCache, GovernorAction::Suspend]
        );
        // One-shot: nothing fires a second time.
        assert!(gov.tick(20_000, &[], None).is_empty());
    }

    #[test]
    fn registration_cancels_a_pending_idle_release() {
        let mut gov = ResourceGovernor::new(&config());
        gov.note_registered(0);
        gov.note_emptied(1000);
        gov.note_registered(2000);
        let voices = vec![voice("a", 2000, false)];
        let actions = gov.tick(7000, &voices, None);
        assert!(!actions.contains(&GovernorAction::Suspend));
        assert!(!actions.contains(&GovernorAction::ClearCache));
    }
}
