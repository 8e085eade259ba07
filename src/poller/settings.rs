use std::time::Duration;

use crate::channel::IsoTPSettings;

/// Poller configuration
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PollerSettings {
    /// Length of one poller tick. Repeat periods are counted in ticks
    pub tick_period_ms: u32,
    /// Number of scheduling slots per tick. Each slot can issue one request
    pub entries_per_tick: u32,
    /// Maximum number of requests issued per tick. 0 = unlimited
    pub throttle: u32,
    /// Minimum time between a successful poll and the next request
    pub time_between_success_ms: u32,
    /// STmin requested from ECUs sending multi-frame responses
    pub response_separation_ms: u32,
    /// Time an ECU has to answer a poll. Every frame received for the poll restarts it
    pub response_timeout_ms: u32,
    /// Time the ECU gets after it responds with 'response pending'
    pub pending_extension_ms: u32,
    /// Number of [super::OperatingState]s the vehicle uses
    pub state_count: usize,
    /// ISO-TP settings used for polls
    pub isotp: IsoTPSettings,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            tick_period_ms: 1000,
            entries_per_tick: 1,
            throttle: 1,
            time_between_success_ms: 0,
            response_separation_ms: 25,
            response_timeout_ms: 2000,
            pending_extension_ms: 60_000,
            state_count: 4,
            isotp: IsoTPSettings::default(),
        }
    }
}

impl PollerSettings {
    /// Time between two scheduling slots
    pub fn slot_period(&self) -> Duration {
        Duration::from_millis((self.tick_period_ms / self.entries_per_tick.max(1)).max(1) as u64)
    }
}
