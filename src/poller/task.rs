use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::{
    BusId, DiagError, DiagResult,
    channel::{CanChannel, CanFrame, ChannelError},
    isotp::SINGLE_FRAME_MAX_LEN,
};

use super::{
    BusPoller, OperatingState, PollEntry, PollSeries, PollerSettings, RequestOutcome,
    SharedHandler, SingleRequest, TransportFlags,
};

#[derive(Debug)]
enum PollerCommand {
    SetPidList(Vec<PollEntry>, mpsc::Sender<DiagResult<()>>),
    AddSeries(PollSeries, mpsc::Sender<DiagResult<()>>),
    RemoveSeries(String),
    SetState(OperatingState),
    SetThrottling(u32),
    SetTimeBetweenSuccess(u32),
    SetResponseSeparationTime(u32),
    SetTicker(u32, u32),
    Pause,
    Resume,
    Single(SingleRequest),
    SendUnsolicited(u32, Vec<u8>, TransportFlags),
}

/// Handle to the poller task of one bus. Can be cloned and used from any thread.
///
/// Commands are applied by the task between two scheduling slots.
#[derive(Debug, Clone)]
pub struct PollerHandle {
    bus: BusId,
    settings: PollerSettings,
    sender: mpsc::Sender<PollerCommand>,
    running: Arc<AtomicBool>,
}

impl PollerHandle {
    /// Bus the poller runs on
    pub fn bus(&self) -> BusId {
        self.bus
    }

    /// Returns true while the poller task is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    fn send(&self, cmd: PollerCommand) -> DiagResult<()> {
        if !self.is_running() {
            return Err(DiagError::PollerNotRunning(self.bus));
        }
        self.sender
            .send(cmd)
            .map_err(|_| DiagError::PollerNotRunning(self.bus))
    }

    fn send_and_wait(
        &self,
        cmd: impl FnOnce(mpsc::Sender<DiagResult<()>>) -> PollerCommand,
    ) -> DiagResult<()> {
        let (tx, rx) = mpsc::channel();
        self.send(cmd(tx))?;
        rx.recv().map_err(|_| DiagError::PollerNotRunning(self.bus))?
    }

    /// Replaces the primary poll list of the bus
    pub fn set_pid_list(&self, entries: Vec<PollEntry>) -> DiagResult<()> {
        self.send_and_wait(|tx| PollerCommand::SetPidList(entries, tx))
    }

    /// Adds a series to the bus, replacing any series with the same name
    pub fn add_series(&self, series: PollSeries) -> DiagResult<()> {
        self.send_and_wait(|tx| PollerCommand::AddSeries(series, tx))
    }

    /// Removes a series from the bus
    pub fn remove_series(&self, name: &str) -> DiagResult<()> {
        self.send(PollerCommand::RemoveSeries(name.to_string()))
    }

    /// Sets the operating state of the bus
    pub fn set_state(&self, state: OperatingState) -> DiagResult<()> {
        if state.0 >= self.settings.state_count {
            return Err(DiagError::StateOutOfRange {
                state: state.0,
                count: self.settings.state_count,
            });
        }
        self.send(PollerCommand::SetState(state))
    }

    /// Sets the maximum number of requests per tick (0 = unlimited)
    pub fn set_throttling(&self, n: u32) -> DiagResult<()> {
        self.send(PollerCommand::SetThrottling(n))
    }

    /// Sets the minimum time between a successful poll and the next request
    pub fn set_time_between_success(&self, ms: u32) -> DiagResult<()> {
        self.send(PollerCommand::SetTimeBetweenSuccess(ms))
    }

    /// Sets the STmin requested from ECUs sending multi-frame responses
    pub fn set_response_separation_time(&self, ms: u32) -> DiagResult<()> {
        self.send(PollerCommand::SetResponseSeparationTime(ms))
    }

    /// Sets the tick length and the number of scheduling slots per tick
    pub fn set_ticker(&self, tick_period_ms: u32, entries_per_tick: u32) -> DiagResult<()> {
        if tick_period_ms == 0 || entries_per_tick == 0 {
            return Err(DiagError::ParameterInvalid(
                "Tick period and entries per tick must be larger than 0".into(),
            ));
        }
        self.send(PollerCommand::SetTicker(tick_period_ms, entries_per_tick))
    }

    /// Stops issuing poll requests
    pub fn pause(&self) -> DiagResult<()> {
        self.send(PollerCommand::Pause)
    }

    /// Resumes issuing poll requests
    pub fn resume(&self) -> DiagResult<()> {
        self.send(PollerCommand::Resume)
    }

    /// Sends a request and blocks until the ECU answers, or the timeout expires.
    ///
    /// The request is served before any entry of the poll series.
    ///
    /// ## Parameters
    /// * tx_id - CAN ID the request is sent to
    /// * rx_id - CAN ID the response is expected from
    /// * request - Request payload, starting with the service ID
    /// * timeout - Time the ECU has to answer
    ///
    /// ## Returns
    /// The outcome of the request. Errors are only returned if the request could not be made at all
    pub fn send_synchronous(
        &self,
        tx_id: u32,
        rx_id: u32,
        request: &[u8],
        timeout: Duration,
    ) -> DiagResult<RequestOutcome> {
        if request.is_empty() {
            return Err(DiagError::ParameterInvalid("Empty request".into()));
        }
        let (tx, rx) = mpsc::channel();
        self.send(PollerCommand::Single(SingleRequest {
            tx_id,
            rx_id,
            payload: request.to_vec(),
            timeout,
            transport: self.default_transport(),
            reply: tx,
        }))?;
        // The task reports its own timeout, this only guards against the task going away
        let guard = timeout
            + Duration::from_millis(self.settings.pending_extension_ms as u64)
            + Duration::from_millis(self.settings.tick_period_ms as u64);
        match rx.recv_timeout(guard) {
            Ok(outcome) => Ok(outcome),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(RequestOutcome::Timeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(DiagError::PollerNotRunning(self.bus)),
        }
    }

    /// Sends a payload without waiting for a response. The payload must fit a single frame
    pub fn send_unsolicited(&self, tx_id: u32, payload: &[u8]) -> DiagResult<()> {
        if payload.is_empty() || payload.len() > SINGLE_FRAME_MAX_LEN {
            return Err(DiagError::ParameterInvalid(format!(
                "Unsolicited payloads must be 1 to {SINGLE_FRAME_MAX_LEN} bytes, got {}",
                payload.len()
            )));
        }
        self.send(PollerCommand::SendUnsolicited(
            tx_id,
            payload.to_vec(),
            self.default_transport(),
        ))
    }

    fn default_transport(&self) -> TransportFlags {
        if self.settings.isotp.can_use_ext_addr {
            TransportFlags::EXTENDED_ID
        } else {
            TransportFlags::empty()
        }
    }
}

/// Runs the [BusPoller] of one bus on its own thread, together with its [CanChannel].
///
/// The thread stops when the task is dropped.
#[derive(Debug)]
pub struct BusTask {
    handle: PollerHandle,
    thread: Option<JoinHandle<()>>,
}

impl BusTask {
    /// Opens the channel and starts the poller thread
    ///
    /// ## Parameters
    /// * bus - Bus index
    /// * channel - CAN channel of the bus
    /// * settings - Poller settings
    /// * handler - Default handler for replies and failures of this bus
    pub fn spawn(
        bus: BusId,
        mut channel: Box<dyn CanChannel>,
        settings: PollerSettings,
        handler: SharedHandler,
    ) -> DiagResult<Self> {
        channel.open()?;
        let running = Arc::new(AtomicBool::new(true));
        let running_c = running.clone();
        let (sender, receiver) = mpsc::channel::<PollerCommand>();

        let thread = std::thread::Builder::new()
            .name(format!("poller-bus{bus}"))
            .spawn(move || {
                let mut poller = BusPoller::new(bus, settings, handler);
                let mut next_slot = Instant::now() + poller.settings().slot_period();
                while running_c.load(Ordering::Relaxed) {
                    let now = Instant::now();
                    let mut out = Vec::new();

                    match receiver.recv_timeout(Duration::from_millis(1)) {
                        Ok(cmd) => {
                            debug_command(&cmd);
                            let retime = matches!(cmd, PollerCommand::SetTicker(..));
                            out.extend(apply_command(&mut poller, cmd, now));
                            if retime {
                                next_slot = now + poller.settings().slot_period();
                            }
                        }
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }

                    let now = Instant::now();
                    match channel.read_packets(32, 0) {
                        Ok(frames) => {
                            for f in &frames {
                                out.extend(poller.on_frame(f, now));
                            }
                        }
                        Err(ChannelError::BufferEmpty) => {}
                        Err(e) => log::error!("Bus {bus} read error: {e}"),
                    }
                    out.extend(poller.poll(now));
                    if now >= next_slot {
                        out.extend(poller.tick(now));
                        next_slot += poller.settings().slot_period();
                        if next_slot < now {
                            next_slot = now + poller.settings().slot_period();
                        }
                    }
                    if !out.is_empty() {
                        if let Err(e) = channel.write_packets(out, 0) {
                            log::error!("Bus {bus} write error: {e}");
                            poller.on_transmit_error();
                        }
                    }
                }
                running_c.store(false, Ordering::Relaxed);
                if let Err(e) = channel.close() {
                    log::warn!("Bus {bus} close error: {e}");
                }
                log::debug!("Poller for bus {bus} stopped");
            })
            .map_err(|e| DiagError::ChannelError(ChannelError::IOError(e)))?;

        Ok(Self {
            handle: PollerHandle {
                bus,
                settings,
                sender,
                running,
            },
            thread: Some(thread),
        })
    }

    /// Returns a handle to the poller
    pub fn handle(&self) -> PollerHandle {
        self.handle.clone()
    }
}

impl Drop for BusTask {
    fn drop(&mut self) {
        self.handle.running.store(false, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

fn debug_command(cmd: &PollerCommand) {
    match cmd {
        PollerCommand::Single(req) => {
            log::debug!("Synchronous request to 0x{:03X}: {:02X?}", req.tx_id, req.payload)
        }
        PollerCommand::SendUnsolicited(id, data, _) => {
            log::debug!("Unsolicited send to 0x{id:03X}: {data:02X?}")
        }
        other => log::debug!("Poller command {other:?}"),
    }
}

fn apply_command(poller: &mut BusPoller, cmd: PollerCommand, now: Instant) -> Vec<CanFrame> {
    match cmd {
        PollerCommand::SetPidList(entries, resp) => {
            let _ = resp.send(poller.set_pid_list(entries));
        }
        PollerCommand::AddSeries(series, resp) => {
            let _ = resp.send(poller.add_series(series));
        }
        PollerCommand::RemoveSeries(name) => {
            poller.remove_series(&name);
        }
        PollerCommand::SetState(state) => {
            if let Err(e) = poller.set_state(state) {
                log::error!("Could not set poll state: {e}");
            }
        }
        PollerCommand::SetThrottling(n) => poller.set_throttling(n),
        PollerCommand::SetTimeBetweenSuccess(ms) => poller.set_time_between_success(ms),
        PollerCommand::SetResponseSeparationTime(ms) => poller.set_response_separation_time(ms),
        PollerCommand::SetTicker(period, n) => poller.set_ticker(period, n),
        PollerCommand::Pause => poller.pause(),
        PollerCommand::Resume => poller.resume(),
        PollerCommand::Single(req) => poller.submit(req),
        PollerCommand::SendUnsolicited(id, data, transport) => {
            match poller.send_unsolicited(id, &data, transport, now) {
                Ok(frames) => return frames,
                Err(e) => log::error!("Could not send to 0x{id:03X}: {e}"),
            }
        }
    }
    Vec::new()
}

/// Poller tasks of all buses of a vehicle
pub struct Pollers {
    handler: SharedHandler,
    tasks: BTreeMap<BusId, BusTask>,
}

impl std::fmt::Debug for Pollers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pollers")
            .field("tasks", &self.tasks)
            .finish()
    }
}

impl Pollers {
    /// Creates an empty set of pollers. `handler` receives the replies of all buses,
    /// unless a series has its own handler
    pub fn new(handler: SharedHandler) -> Self {
        Self {
            handler,
            tasks: BTreeMap::new(),
        }
    }

    /// Starts polling a bus. A running poller for the same bus is stopped first
    pub fn add_bus(
        &mut self,
        bus: BusId,
        channel: Box<dyn CanChannel>,
        settings: PollerSettings,
    ) -> DiagResult<PollerHandle> {
        self.tasks.remove(&bus);
        let task = BusTask::spawn(bus, channel, settings, self.handler.clone())?;
        let handle = task.handle();
        self.tasks.insert(bus, task);
        Ok(handle)
    }

    /// Handle of a bus
    pub fn handle(&self, bus: BusId) -> DiagResult<PollerHandle> {
        self.tasks
            .get(&bus)
            .map(|t| t.handle())
            .ok_or(DiagError::UnknownBus(bus))
    }

    /// Handles of all buses
    pub fn handles(&self) -> Vec<PollerHandle> {
        self.tasks.values().map(|t| t.handle()).collect()
    }

    /// Replaces the primary poll list of a bus
    pub fn set_pid_list(&self, bus: BusId, entries: Vec<PollEntry>) -> DiagResult<()> {
        self.handle(bus)?.set_pid_list(entries)
    }

    /// Adds a series to a bus
    pub fn add_series(&self, bus: BusId, series: PollSeries) -> DiagResult<()> {
        self.handle(bus)?.add_series(series)
    }

    /// Removes a series from a bus
    pub fn remove_series(&self, bus: BusId, name: &str) -> DiagResult<()> {
        self.handle(bus)?.remove_series(name)
    }

    fn for_all(&self, f: impl Fn(&PollerHandle) -> DiagResult<()>) -> DiagResult<()> {
        for t in self.tasks.values() {
            f(&t.handle)?;
        }
        Ok(())
    }

    /// Sets the operating state on all buses
    pub fn set_state(&self, state: OperatingState) -> DiagResult<()> {
        self.for_all(|h| h.set_state(state))
    }

    /// Sets the per-tick request limit on all buses
    pub fn set_throttling(&self, n: u32) -> DiagResult<()> {
        self.for_all(|h| h.set_throttling(n))
    }

    /// Sets the minimum time between a successful poll and the next request on all buses
    pub fn set_time_between_success(&self, ms: u32) -> DiagResult<()> {
        self.for_all(|h| h.set_time_between_success(ms))
    }

    /// Sets the STmin requested from ECUs on all buses
    pub fn set_response_separation_time(&self, ms: u32) -> DiagResult<()> {
        self.for_all(|h| h.set_response_separation_time(ms))
    }

    /// Sets the tick length and slots per tick on all buses
    pub fn set_ticker(&self, tick_period_ms: u32, entries_per_tick: u32) -> DiagResult<()> {
        self.for_all(|h| h.set_ticker(tick_period_ms, entries_per_tick))
    }

    /// Pauses polling on all buses
    pub fn pause(&self) -> DiagResult<()> {
        self.for_all(|h| h.pause())
    }

    /// Resumes polling on all buses
    pub fn resume(&self) -> DiagResult<()> {
        self.for_all(|h| h.resume())
    }

    /// Stops all poller threads and closes their channels
    pub fn shutdown(&mut self) {
        self.tasks.clear();
    }
}
