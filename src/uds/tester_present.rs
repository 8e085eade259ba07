//! TesterPresent keep-alive
//!
//! Each ECU kept in a non-default session has a countdown in seconds. Every [SessionHelper::keepalive_tick]
//! sends a TesterPresent, with the positive response suppressed, to each ECU whose countdown
//! is running, and decrements the countdowns.

use std::{sync::atomic::Ordering, time::Duration};

use automotive_diag::uds::UdsCommand;

use super::{EcuAddress, SessionHelper};
use crate::DiagResult;

/// TesterPresent sub function with the 'suppress positive response' bit set
pub const SUPPRESS_POSITIVE_RESPONSE: u8 = 0x80;

impl SessionHelper {
    /// Sends a single TesterPresent to the ECU without waiting for a response
    pub fn send_tester_present(&self, ecu: EcuAddress) -> DiagResult<()> {
        self.shared.handle(ecu.bus)?.send_unsolicited(
            ecu.tx_id,
            &[UdsCommand::TesterPresent.into(), SUPPRESS_POSITIVE_RESPONSE],
        )
    }

    /// Keeps the ECU alive for at least `seconds`. A longer running countdown is kept
    pub fn refresh_tester_present(&self, ecu: EcuAddress, seconds: u32) {
        let mut timers = self.shared.timers();
        let t = timers.entry(ecu).or_insert(0);
        *t = (*t).max(seconds);
    }

    /// Stops keeping the ECU alive
    pub fn stop_tester_present(&self, ecu: EcuAddress) {
        self.shared.timers().remove(&ecu);
    }

    /// Seconds the ECU is still kept alive
    pub fn tester_present_remaining(&self, ecu: EcuAddress) -> u32 {
        self.shared.timers().get(&ecu).copied().unwrap_or(0)
    }

    /// Sends a TesterPresent to every ECU that is kept alive, and decrements their countdowns
    pub fn keepalive_tick(&self) {
        tick_timers(&self.shared);
    }

    /// Starts a thread calling [SessionHelper::keepalive_tick] every
    /// [super::SessionOptions::keepalive_interval_ms], until the helper is dropped
    pub fn start_keepalive(&mut self) {
        if self.keepalive.is_some() {
            return;
        }
        self.keepalive_running.store(true, Ordering::Relaxed);
        let running = self.keepalive_running.clone();
        let shared = self.shared.clone();
        let interval = Duration::from_millis(self.options.keepalive_interval_ms as u64);
        self.keepalive = Some(std::thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                std::thread::sleep(interval);
                tick_timers(&shared);
            }
        }));
    }
}

fn tick_timers(shared: &super::SessionShared) {
    let due: Vec<EcuAddress> = {
        let mut timers = shared.timers();
        let due = timers
            .iter()
            .filter(|(_, t)| **t > 0)
            .map(|(ecu, _)| *ecu)
            .collect();
        timers.values_mut().for_each(|t| *t = t.saturating_sub(1));
        timers.retain(|_, t| *t > 0);
        due
    };
    for ecu in due {
        let res = shared.handle(ecu.bus).and_then(|h| {
            h.send_unsolicited(
                ecu.tx_id,
                &[UdsCommand::TesterPresent.into(), SUPPRESS_POSITIVE_RESPONSE],
            )
        });
        if let Err(e) = res {
            log::warn!("TesterPresent to ECU 0x{:03X} failed: {e}", ecu.tx_id);
        }
    }
}
