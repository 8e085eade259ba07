//! Module for UDS (Unified diagnostic services - ISO14229) sessions
//!
//! The [SessionHelper] runs request/response exchanges on top of the bus pollers. Requests are
//! queued on the poller of the bus as synchronous requests, and are therefore served between
//! two polls, never interleaved with them.
//!
//! Non-default diagnostic sessions time out on the ECU unless they are kept alive with
//! TesterPresent messages. The helper keeps a countdown per ECU for this, see [tester_present].

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use crate::{
    BusId, DiagError, DiagResult,
    helpers::nrc_name,
    poller::{PollerHandle, RequestOutcome},
};

mod diagnostic_session_control;
pub mod tester_present;

/// Address of an ECU on a bus
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EcuAddress {
    /// Bus the ECU is attached to
    pub bus: BusId,
    /// CAN ID requests are sent to
    pub tx_id: u32,
    /// CAN ID the ECU responds with
    pub rx_id: u32,
}

impl EcuAddress {
    /// Creates a new ECU address
    pub fn new(bus: BusId, tx_id: u32, rx_id: u32) -> Self {
        Self { bus, tx_id, rx_id }
    }

    /// ECU using the OBD2 addressing scheme, where the response ID is the request ID + 8
    pub fn obd(bus: BusId, tx_id: u32) -> Self {
        Self::new(bus, tx_id, tx_id + 8)
    }
}

/// Session helper options
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionOptions {
    /// Length of one wait tick
    pub tick_ms: u32,
    /// Default number of ticks to wait for a response
    pub timeout_ticks: u32,
    /// Delay between the steps of [SessionHelper::run_in_session]
    pub step_delay_ms: u32,
    /// Seconds a session entered with [SessionHelper::enter_extended_session] is kept alive
    pub keepalive_seconds: u32,
    /// Interval of the keep-alive thread
    pub keepalive_interval_ms: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            tick_ms: 50,
            timeout_ticks: 50,
            step_delay_ms: 50,
            keepalive_seconds: 5,
            keepalive_interval_ms: 1000,
        }
    }
}

#[derive(Debug)]
pub(crate) struct SessionShared {
    handles: BTreeMap<BusId, PollerHandle>,
    tester_present: Mutex<HashMap<EcuAddress, u32>>,
}

impl SessionShared {
    fn handle(&self, bus: BusId) -> DiagResult<&PollerHandle> {
        self.handles.get(&bus).ok_or(DiagError::UnknownBus(bus))
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<EcuAddress, u32>> {
        self.tester_present
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Synchronous diagnostic exchanges and session management for the ECUs of a vehicle
#[derive(Debug)]
pub struct SessionHelper {
    options: SessionOptions,
    shared: Arc<SessionShared>,
    keepalive_running: Arc<AtomicBool>,
    keepalive: Option<JoinHandle<()>>,
}

impl SessionHelper {
    /// Creates a new helper using the given pollers
    pub fn new(pollers: Vec<PollerHandle>, options: SessionOptions) -> Self {
        Self {
            options,
            shared: Arc::new(SessionShared {
                handles: pollers.into_iter().map(|h| (h.bus(), h)).collect(),
                tester_present: Mutex::new(HashMap::new()),
            }),
            keepalive_running: Arc::new(AtomicBool::new(false)),
            keepalive: None,
        }
    }

    /// Helper options
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Sends a request to an ECU and waits for its response.
    ///
    /// A 'response pending' negative response extends the wait instead of completing it.
    ///
    /// ## Parameters
    /// * ecu - Target ECU
    /// * request - Request payload, starting with the service ID
    /// * timeout_ticks - Number of [SessionOptions::tick_ms] ticks to wait for the response
    pub fn send_synchronous(
        &self,
        ecu: EcuAddress,
        request: &[u8],
        timeout_ticks: u32,
    ) -> DiagResult<RequestOutcome> {
        let timeout = Duration::from_millis(timeout_ticks as u64 * self.options.tick_ms as u64);
        let outcome = self.shared.handle(ecu.bus)?.send_synchronous(
            ecu.tx_id,
            ecu.rx_id,
            request,
            timeout,
        )?;
        match &outcome {
            RequestOutcome::Success(resp) => {
                log::debug!("ECU 0x{:03X} responded {resp:02X?}", ecu.rx_id)
            }
            RequestOutcome::NegativeResponse(nrc) => log::warn!(
                "ECU 0x{:03X} rejected {request:02X?}: {}",
                ecu.rx_id,
                nrc_name(*nrc)
            ),
            other => log::warn!(
                "Request {request:02X?} to ECU 0x{:03X} failed: {:?}",
                ecu.tx_id,
                other.failure()
            ),
        }
        Ok(outcome)
    }

    /// Like [SessionHelper::send_synchronous], with the default timeout
    pub fn send_default_timeout(
        &self,
        ecu: EcuAddress,
        request: &[u8],
    ) -> DiagResult<RequestOutcome> {
        self.send_synchronous(ecu, request, self.options.timeout_ticks)
    }

    fn step_delay(&self) {
        std::thread::sleep(Duration::from_millis(self.options.step_delay_ms as u64));
    }
}

impl Drop for SessionHelper {
    fn drop(&mut self) {
        self.keepalive_running.store(false, Ordering::Relaxed);
        if let Some(t) = self.keepalive.take() {
            let _ = t.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        hardware::simulation::SimulationBus,
        poller::{BusTask, PollReply, PollReplyHandler, PollerSettings},
    };

    struct Ignore;

    impl PollReplyHandler for Ignore {
        fn on_reply(&mut self, _reply: &PollReply<'_>) {}
    }

    fn options() -> SessionOptions {
        SessionOptions {
            tick_ms: 10,
            timeout_ticks: 10,
            step_delay_ms: 5,
            keepalive_seconds: 3,
            keepalive_interval_ms: 20,
        }
    }

    fn spawn_poller(bus: &SimulationBus) -> BusTask {
        let settings = PollerSettings {
            tick_period_ms: 20,
            ..Default::default()
        };
        BusTask::spawn(
            0,
            Box::new(bus.create_channel("poller")),
            settings,
            Arc::new(Mutex::new(Ignore)),
        )
        .unwrap()
    }

    fn tester_present_frames(bus: &SimulationBus, id: u32) -> usize {
        bus.frames_with_id(id)
            .iter()
            .filter(|f| f.frame.get_data()[..3] == [0x02, 0x3E, 0x80])
            .count()
    }

    #[test]
    fn test_refresh_keeps_longest() {
        let helper = SessionHelper::new(vec![], options());
        let ecu = EcuAddress::obd(0, 0x7E0);
        assert_eq!(ecu.rx_id, 0x7E8);
        helper.refresh_tester_present(ecu, 5);
        helper.refresh_tester_present(ecu, 2);
        assert_eq!(helper.tester_present_remaining(ecu), 5);
        helper.refresh_tester_present(ecu, 8);
        assert_eq!(helper.tester_present_remaining(ecu), 8);
        helper.stop_tester_present(ecu);
        assert_eq!(helper.tester_present_remaining(ecu), 0);
    }

    #[test]
    fn test_unknown_bus() {
        let helper = SessionHelper::new(vec![], options());
        let res = helper.send_synchronous(EcuAddress::obd(3, 0x7E0), &[0x10, 0x03], 1);
        assert!(matches!(res, Err(DiagError::UnknownBus(3))));
    }

    #[test]
    fn test_keepalive_tick() {
        let _ = env_logger::try_init();
        let bus = SimulationBus::new();
        let task = spawn_poller(&bus);
        let helper = SessionHelper::new(vec![task.handle()], options());
        let ecu = EcuAddress::obd(0, 0x7E0);

        helper.refresh_tester_present(ecu, 2);
        helper.keepalive_tick();
        assert_eq!(helper.tester_present_remaining(ecu), 1);
        helper.keepalive_tick();
        assert_eq!(helper.tester_present_remaining(ecu), 0);
        // Countdown expired, nothing is sent anymore
        helper.keepalive_tick();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(tester_present_frames(&bus, 0x7E0), 2);
    }

    #[test]
    fn test_keepalive_thread() {
        let bus = SimulationBus::new();
        let task = spawn_poller(&bus);
        let mut helper = SessionHelper::new(vec![task.handle()], options());
        let ecu = EcuAddress::obd(0, 0x7E1);
        helper.refresh_tester_present(ecu, 3);
        helper.start_keepalive();
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(helper.tester_present_remaining(ecu), 0);
        drop(helper);
        assert_eq!(tester_present_frames(&bus, 0x7E1), 3);
    }
}
