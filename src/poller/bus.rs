use std::{
    collections::VecDeque,
    sync::{PoisonError, mpsc},
    time::{Duration, Instant},
};

use crate::{
    BusId, DiagError, DiagResult,
    channel::CanFrame,
    helpers::{ResponseClass, classify_response, nrc_name},
    isotp::{IsoTpEndpoint, IsoTpError, SINGLE_FRAME_MAX_LEN, encode_st_min_ms},
};

use super::{
    FailureReason, OBD_BROADCAST_ID, OBD_RESPONSE_IDS, OperatingState, PRIMARY_SERIES, PidWidth,
    PollEntry, PollReply, PollSeries, PollerSettings, RequestOutcome, SharedHandler,
    TransportFlags,
};

/// A request that is answered directly to its sender, instead of a [super::PollReplyHandler].
///
/// Synchronous requests are served before any series entry, and are not subject to throttling.
#[derive(Debug, Clone)]
pub struct SingleRequest {
    /// CAN ID the request is sent to
    pub tx_id: u32,
    /// CAN ID the response is expected from
    pub rx_id: u32,
    /// Request payload, starting with the service ID
    pub payload: Vec<u8>,
    /// Time the ECU has to answer
    pub timeout: Duration,
    /// Transport flags
    pub transport: TransportFlags,
    /// Receives the outcome
    pub reply: mpsc::Sender<RequestOutcome>,
}

/// State of the outstanding request of a bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingStatus {
    /// Waiting for the response
    Pending,
    /// Positive response received
    Matched {
        /// CAN ID of the ECU which responded
        responder: u32,
        /// Full response, including the service ID
        response: Vec<u8>,
    },
    /// Response did not match the request
    Mismatched,
    /// No response before the deadline
    TimedOut,
    /// Negative response
    NegativeResponse(u8),
    /// ISO-TP error
    TransportError(IsoTpError),
    /// The request could not be written to the bus
    TransmitFailed,
}

impl PendingStatus {
    fn outcome(&self) -> Option<RequestOutcome> {
        Some(match self {
            PendingStatus::Pending => return None,
            PendingStatus::Matched { response, .. } => RequestOutcome::Success(response.clone()),
            PendingStatus::Mismatched => RequestOutcome::Mismatch,
            PendingStatus::TimedOut => RequestOutcome::Timeout,
            PendingStatus::NegativeResponse(nrc) => RequestOutcome::NegativeResponse(*nrc),
            PendingStatus::TransportError(e) => RequestOutcome::Transport(*e),
            PendingStatus::TransmitFailed => RequestOutcome::TransmitFailed,
        })
    }
}

#[derive(Debug)]
enum PendingOwner {
    Series {
        name: String,
        index: usize,
        issued_tick: u64,
    },
    Sync(mpsc::Sender<RequestOutcome>),
}

#[derive(Debug)]
struct PendingRequest {
    owner: PendingOwner,
    tx_id: u32,
    rx_id: u32,
    service: u8,
    pid_echo: Vec<u8>,
    transport: TransportFlags,
    timeout: Duration,
    deadline: Instant,
    status: PendingStatus,
}

impl PendingRequest {
    fn is_broadcast(&self) -> bool {
        self.tx_id == OBD_BROADCAST_ID
    }

    fn accepts(&self, addr: u32) -> bool {
        if self.is_broadcast() {
            OBD_RESPONSE_IDS.contains(&addr)
        } else {
            addr == self.rx_id
        }
    }

    fn fc_addr(&self, responder: u32) -> u32 {
        if self.is_broadcast() {
            responder - 8
        } else {
            self.tx_id
        }
    }

    fn is_owned_by(&self, series: &str) -> bool {
        matches!(&self.owner, PendingOwner::Series { name, .. } if name == series)
    }
}

/// Poll scheduler of one bus.
///
/// This does no IO and keeps no clock. The owner calls [BusPoller::tick] once per scheduling slot,
/// [BusPoller::poll] frequently, hands every received frame to [BusPoller::on_frame], and writes
/// the frames returned by all three to the bus.
pub struct BusPoller {
    bus: BusId,
    settings: PollerSettings,
    endpoint: IsoTpEndpoint,
    raw_out: Vec<CanFrame>,
    series: Vec<PollSeries>,
    series_cursor: usize,
    sync_queue: VecDeque<SingleRequest>,
    pending: Option<PendingRequest>,
    state: OperatingState,
    handler: SharedHandler,
    ticker: u64,
    slot: u32,
    issued_this_tick: u32,
    last_success: Option<Instant>,
    chaining: bool,
    paused: bool,
}

impl std::fmt::Debug for BusPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusPoller")
            .field("bus", &self.bus)
            .field("settings", &self.settings)
            .field("series", &self.series)
            .field("pending", &self.pending)
            .field("state", &self.state)
            .field("ticker", &self.ticker)
            .field("paused", &self.paused)
            .finish()
    }
}

impl BusPoller {
    /// Creates a new poller for a bus.
    ///
    /// ## Parameters
    /// * bus - Bus index
    /// * settings - Poller settings
    /// * handler - Default handler for replies and failures
    pub fn new(bus: BusId, settings: PollerSettings, handler: SharedHandler) -> Self {
        let mut isotp = settings.isotp;
        isotp.st_min = encode_st_min_ms(settings.response_separation_ms);
        Self {
            bus,
            settings,
            endpoint: IsoTpEndpoint::new(bus, isotp),
            raw_out: Vec::new(),
            series: Vec::new(),
            series_cursor: 0,
            sync_queue: VecDeque::new(),
            pending: None,
            state: OperatingState::default(),
            handler,
            ticker: 0,
            slot: 0,
            issued_this_tick: 0,
            last_success: None,
            chaining: false,
            paused: false,
        }
    }

    /// Bus index
    pub fn bus(&self) -> BusId {
        self.bus
    }

    /// Current settings
    pub fn settings(&self) -> &PollerSettings {
        &self.settings
    }

    /// Current operating state
    pub fn state(&self) -> OperatingState {
        self.state
    }

    /// Number of ticks so far
    pub fn ticker(&self) -> u64 {
        self.ticker
    }

    /// Returns true if a request is outstanding
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// State of the outstanding request, if there is one
    pub fn pending_status(&self) -> Option<&PendingStatus> {
        self.pending.as_ref().map(|p| &p.status)
    }

    /// Names of all installed series, in scan order
    pub fn series_names(&self) -> Vec<&str> {
        self.series.iter().map(|s| s.name()).collect()
    }

    /// Looks up a series by name
    pub fn series(&self, name: &str) -> Option<&PollSeries> {
        self.series.iter().find(|s| s.name() == name)
    }

    fn check_entries<'a>(&self, entries: impl Iterator<Item = &'a PollEntry>) -> DiagResult<()> {
        for e in entries {
            if e.periods.len() > self.settings.state_count {
                return Err(DiagError::ParameterInvalid(format!(
                    "Entry 0x{:03X} 0x{:04X} has {} periods, but only {} states are configured",
                    e.tx_id,
                    e.pid,
                    e.periods.len(),
                    self.settings.state_count
                )));
            }
            if e.service.pid_width() == PidWidth::Byte && e.pid > 0xFF {
                return Err(DiagError::ParameterInvalid(format!(
                    "PID 0x{:04X} of entry 0x{:03X} does not fit the 8bit PID of {:?}",
                    e.pid, e.tx_id, e.service
                )));
            }
            if e.transport.contains(TransportFlags::RAW_FRAME) && e.request_bytes().len() > 8 {
                return Err(DiagError::ParameterInvalid(format!(
                    "Raw frame request to 0x{:03X} is longer than 8 bytes",
                    e.tx_id
                )));
            }
        }
        Ok(())
    }

    /// Replaces the primary series of the bus.
    /// Entries for other buses are skipped
    pub fn set_pid_list(&mut self, entries: Vec<PollEntry>) -> DiagResult<()> {
        let bus = self.bus;
        let entries: Vec<PollEntry> = entries
            .into_iter()
            .filter(|e| {
                let ok = e.bus.is_none_or(|b| b == bus);
                if !ok {
                    log::warn!(
                        "Skipping entry 0x{:03X} 0x{:04X}, it belongs to bus {:?}",
                        e.tx_id,
                        e.pid,
                        e.bus
                    );
                }
                ok
            })
            .collect();
        self.check_entries(entries.iter())?;
        self.cancel_owned_by(PRIMARY_SERIES);
        let series = PollSeries::new(PRIMARY_SERIES, entries);
        match self.series.iter().position(|s| s.name() == PRIMARY_SERIES) {
            Some(idx) => self.series[idx] = series,
            None => self.series.insert(0, series),
        }
        Ok(())
    }

    /// Adds a series. A series with the same name is replaced
    pub fn add_series(&mut self, series: PollSeries) -> DiagResult<()> {
        self.check_entries(series.entries())?;
        if let Some(e) = series.entries().find(|e| e.bus.is_some_and(|b| b != self.bus)) {
            return Err(DiagError::ParameterInvalid(format!(
                "Entry 0x{:03X} 0x{:04X} does not belong to bus {}",
                e.tx_id, e.pid, self.bus
            )));
        }
        self.cancel_owned_by(series.name());
        match self.series.iter().position(|s| s.name() == series.name()) {
            Some(idx) => self.series[idx] = series,
            None => self.series.push(series),
        }
        Ok(())
    }

    /// Removes a series. If one of its entries is outstanding, the request is
    /// abandoned without calling any handler
    pub fn remove_series(&mut self, name: &str) -> bool {
        self.cancel_owned_by(name);
        let before = self.series.len();
        self.series.retain(|s| s.name() != name);
        before != self.series.len()
    }

    fn cancel_owned_by(&mut self, name: &str) {
        if self.pending.as_ref().is_some_and(|p| p.is_owned_by(name)) {
            if let Some(p) = self.pending.take() {
                log::debug!("Abandoning outstanding request to 0x{:03X} of series {name}", p.tx_id);
                self.endpoint.cancel_send();
                if p.is_broadcast() {
                    for id in OBD_RESPONSE_IDS {
                        self.endpoint.abort_reception(id);
                    }
                } else {
                    self.endpoint.abort_reception(p.rx_id);
                }
            }
        }
    }

    /// Changes the operating state. All series restart from their first entry
    pub fn set_state(&mut self, state: OperatingState) -> DiagResult<()> {
        if state.0 >= self.settings.state_count {
            return Err(DiagError::StateOutOfRange {
                state: state.0,
                count: self.settings.state_count,
            });
        }
        if state != self.state {
            log::info!("Bus {} poll state {} -> {}", self.bus, self.state.0, state.0);
        }
        self.state = state;
        for s in &mut self.series {
            s.reset_cursor();
        }
        Ok(())
    }

    /// Sets the maximum number of requests per tick (0 = unlimited)
    pub fn set_throttling(&mut self, n: u32) {
        self.settings.throttle = n;
    }

    /// Sets the minimum time between a successful poll and the next request
    pub fn set_time_between_success(&mut self, ms: u32) {
        self.settings.time_between_success_ms = ms;
    }

    /// Sets the STmin requested from ECUs sending multi-frame responses
    pub fn set_response_separation_time(&mut self, ms: u32) {
        self.settings.response_separation_ms = ms;
        self.endpoint.set_separation_time(encode_st_min_ms(ms));
    }

    /// Sets the tick length and number of slots per tick
    pub fn set_ticker(&mut self, tick_period_ms: u32, entries_per_tick: u32) {
        self.settings.tick_period_ms = tick_period_ms.max(1);
        self.settings.entries_per_tick = entries_per_tick.max(1);
        self.slot = 0;
    }

    /// Stops issuing poll requests. Synchronous requests are still served
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Resumes issuing poll requests
    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Returns true if polling is paused
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Queues a synchronous request
    pub fn submit(&mut self, request: SingleRequest) {
        self.sync_queue.push_back(request);
    }

    /// Sends a payload without expecting a response, EG: a TesterPresent with
    /// suppressed positive response. This does not touch the outstanding request.
    ///
    /// Nothing listens for flow control of an unsolicited payload, so it must fit a single frame
    pub fn send_unsolicited(
        &mut self,
        tx_id: u32,
        payload: &[u8],
        transport: TransportFlags,
        now: Instant,
    ) -> DiagResult<Vec<CanFrame>> {
        let ext = transport.contains(TransportFlags::EXTENDED_ID);
        if transport.contains(TransportFlags::RAW_FRAME) {
            self.push_raw(tx_id, ext, payload)?;
        } else if payload.len() > SINGLE_FRAME_MAX_LEN {
            return Err(DiagError::ParameterInvalid(format!(
                "Unsolicited payload to 0x{tx_id:03X} does not fit a single frame ({} bytes)",
                payload.len()
            )));
        } else {
            self.endpoint.send_with_id_type(tx_id, ext, payload, now)?;
        }
        Ok(self.drain_frames())
    }

    /// Marks the outstanding request as failed to transmit. Called when
    /// writing frames to the bus failed
    pub fn on_transmit_error(&mut self) {
        if let Some(p) = self.pending.as_mut() {
            if p.status == PendingStatus::Pending {
                p.status = PendingStatus::TransmitFailed;
                self.endpoint.cancel_send();
            }
        }
        self.finish_sync();
    }

    /// Runs one scheduling slot
    pub fn tick(&mut self, now: Instant) -> Vec<CanFrame> {
        if self.slot == 0 {
            self.ticker += 1;
            self.issued_this_tick = 0;
        }
        self.slot = (self.slot + 1) % self.settings.entries_per_tick.max(1);

        self.expire_pending(now);
        self.finish_sync();
        self.dispatch_resolved();
        if self.pending.is_none() && !self.issue_sync(now) {
            self.issue_poll(now);
        }
        self.drain_frames()
    }

    /// Drives the transport layer and synchronous requests between slots.
    ///
    /// A successful poll is handed to its handler straight away, and the next due entry
    /// follows it within the same tick, as far as throttling and time-between-success allow
    pub fn poll(&mut self, now: Instant) -> Vec<CanFrame> {
        if let Err(e) = self.endpoint.poll(now) {
            log::error!("Bus {} transport error: {e}", self.bus);
            self.fail_pending(PendingStatus::TransportError(e));
        }
        self.expire_pending(now);
        self.finish_sync();
        if self
            .pending
            .as_ref()
            .is_some_and(|p| matches!(p.status, PendingStatus::Matched { .. }))
        {
            self.dispatch_resolved();
        }
        if self.pending.is_none() && !self.issue_sync(now) {
            self.chain_next(now);
        }
        self.drain_frames()
    }

    fn chain_next(&mut self, now: Instant) {
        if !self.chaining || self.waiting_after_success(now) {
            return;
        }
        self.chaining = false;
        self.issue_poll(now);
    }

    fn waiting_after_success(&self, now: Instant) -> bool {
        let between = Duration::from_millis(self.settings.time_between_success_ms as u64);
        self.last_success
            .is_some_and(|t| now.saturating_duration_since(t) < between)
    }

    /// Processes a frame received on the bus
    pub fn on_frame(&mut self, frame: &CanFrame, now: Instant) -> Vec<CanFrame> {
        let addr = frame.get_address();
        let Some(p) = self.pending.as_mut() else {
            return Vec::new();
        };
        if p.status != PendingStatus::Pending || !p.accepts(addr) {
            return Vec::new();
        }
        if p.transport.contains(TransportFlags::RAW_FRAME) {
            self.apply_response(addr, frame.get_data(), now);
        } else {
            let fc_addr = p.fc_addr(addr);
            p.deadline = p.deadline.max(now + p.timeout);
            match self.endpoint.on_frame(frame, fc_addr, now) {
                Ok(Some(payload)) => self.apply_response(addr, &payload, now),
                Ok(None) => {}
                Err(e) => {
                    log::error!("Bus {} transport error from 0x{addr:03X}: {e}", self.bus);
                    self.fail_pending(PendingStatus::TransportError(e));
                }
            }
        }
        self.finish_sync();
        self.drain_frames()
    }

    fn apply_response(&mut self, responder: u32, response: &[u8], now: Instant) {
        let pending_extension = Duration::from_millis(self.settings.pending_extension_ms as u64);
        let Some(p) = self.pending.as_mut() else {
            return;
        };
        match classify_response(p.service, &p.pid_echo, response) {
            ResponseClass::Positive(_) => {
                p.status = PendingStatus::Matched {
                    responder,
                    response: response.to_vec(),
                };
                if matches!(p.owner, PendingOwner::Series { .. }) {
                    self.last_success = Some(now);
                }
            }
            ResponseClass::Negative(nrc) => {
                log::warn!(
                    "ECU 0x{responder:03X} negative response to 0x{:02X}: {}",
                    p.service,
                    nrc_name(nrc)
                );
                p.status = PendingStatus::NegativeResponse(nrc);
            }
            ResponseClass::Pending => {
                log::debug!("ECU 0x{responder:03X} requested more time");
                p.deadline = now + pending_extension;
            }
            ResponseClass::Mismatch => p.status = PendingStatus::Mismatched,
        }
    }

    fn fail_pending(&mut self, status: PendingStatus) {
        if let Some(p) = self.pending.as_mut() {
            if p.status == PendingStatus::Pending {
                p.status = status;
            }
        }
    }

    fn expire_pending(&mut self, now: Instant) {
        if let Some(p) = self.pending.as_mut() {
            if p.status == PendingStatus::Pending && now >= p.deadline {
                log::debug!("Request to 0x{:03X} timed out", p.tx_id);
                p.status = PendingStatus::TimedOut;
                self.endpoint.cancel_send();
            }
        }
    }

    /// Completes a resolved synchronous request
    fn finish_sync(&mut self) {
        let resolved = self.pending.as_ref().is_some_and(|p| {
            matches!(p.owner, PendingOwner::Sync(_)) && p.status != PendingStatus::Pending
        });
        if !resolved {
            return;
        }
        if let Some(p) = self.pending.take() {
            if let (PendingOwner::Sync(sender), Some(outcome)) = (p.owner, p.status.outcome()) {
                if sender.send(outcome).is_err() {
                    log::debug!("Synchronous caller went away before the outcome");
                }
            }
        }
    }

    /// Hands a resolved poll to its handler, and advances its series
    fn dispatch_resolved(&mut self) {
        let resolved = self.pending.as_ref().is_some_and(|p| {
            matches!(p.owner, PendingOwner::Series { .. }) && p.status != PendingStatus::Pending
        });
        if !resolved {
            return;
        }
        let Some(p) = self.pending.take() else {
            return;
        };
        let PendingOwner::Series {
            name,
            index,
            issued_tick,
        } = p.owner
        else {
            return;
        };
        let Some(outcome) = p.status.outcome() else {
            return;
        };
        let Some(series) = self.series.iter().find(|s| s.name() == name) else {
            return;
        };
        let Some(entry) = series.entry(index).cloned() else {
            return;
        };
        let handler = series.handler().cloned().unwrap_or_else(|| self.handler.clone());

        let success = match (&outcome, &p.status) {
            (RequestOutcome::Success(response), PendingStatus::Matched { responder, .. }) => {
                let header = 1 + p.pid_echo.len();
                let reply = PollReply {
                    bus: self.bus,
                    service: entry.service,
                    responder: *responder,
                    pid: entry.pid,
                    payload: response.get(header..).unwrap_or_default(),
                    bytes_remaining: 0,
                };
                handler
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .on_reply(&reply);
                true
            }
            _ => {
                let reason = outcome.failure().unwrap_or(FailureReason::Mismatch);
                handler
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .on_failure(self.bus, &entry, reason);
                false
            }
        };

        self.chaining = success;
        let mut exhausted = false;
        if let Some(series) = self.series.iter_mut().find(|s| s.name() == name) {
            series.complete(index, success, issued_tick);
            exhausted = series.is_exhausted();
        }
        if exhausted {
            log::debug!("Series {name} on bus {} is done", self.bus);
            self.series.retain(|s| s.name() != name);
        }
    }

    fn issue_sync(&mut self, now: Instant) -> bool {
        let Some(req) = self.sync_queue.pop_front() else {
            return false;
        };
        let service = req.payload.first().copied().unwrap_or_default();
        self.issue(
            PendingOwner::Sync(req.reply),
            req.tx_id,
            req.rx_id,
            &req.payload,
            service,
            Vec::new(),
            req.transport,
            req.timeout,
            now,
        );
        true
    }

    fn issue_poll(&mut self, now: Instant) {
        if self.paused || self.series.is_empty() {
            return;
        }
        if self.settings.throttle != 0 && self.issued_this_tick >= self.settings.throttle {
            return;
        }
        if self.waiting_after_success(now) {
            return;
        }

        let count = self.series.len();
        let mut found = None;
        for step in 0..count {
            let idx = (self.series_cursor + step) % count;
            if let Some(entry_idx) = self.series[idx].next_due(self.state, self.ticker) {
                found = Some((idx, entry_idx));
                break;
            }
        }
        // Scanning can complete passes
        let before = self.series.len();
        self.series.retain(|s| !s.is_exhausted());
        if self.series.len() != before {
            self.series_cursor = 0;
            return;
        }
        let Some((series_idx, entry_idx)) = found else {
            return;
        };
        self.series_cursor = (series_idx + 1) % count;
        let series = &self.series[series_idx];
        let Some(entry) = series.entry(entry_idx).cloned() else {
            return;
        };
        let owner = PendingOwner::Series {
            name: series.name().to_string(),
            index: entry_idx,
            issued_tick: self.ticker,
        };
        log::debug!(
            "Bus {} polling 0x{:03X} {:?} 0x{:04X}",
            self.bus,
            entry.tx_id,
            entry.service,
            entry.pid
        );
        self.issue(
            owner,
            entry.tx_id,
            entry.rx_id,
            &entry.request_bytes(),
            u8::from(entry.service),
            entry.pid_echo(),
            entry.transport,
            Duration::from_millis(self.settings.response_timeout_ms as u64),
            now,
        );
        self.issued_this_tick += 1;
    }

    #[allow(clippy::too_many_arguments)]
    fn issue(
        &mut self,
        owner: PendingOwner,
        tx_id: u32,
        rx_id: u32,
        request: &[u8],
        service: u8,
        pid_echo: Vec<u8>,
        transport: TransportFlags,
        timeout: Duration,
        now: Instant,
    ) {
        let mut pending = PendingRequest {
            owner,
            tx_id,
            rx_id,
            service,
            pid_echo,
            transport,
            timeout,
            deadline: now + timeout,
            status: PendingStatus::Pending,
        };
        let ext = transport.contains(TransportFlags::EXTENDED_ID);
        let res = if transport.contains(TransportFlags::RAW_FRAME) {
            self.push_raw(tx_id, ext, request)
        } else {
            if !pending.is_broadcast() {
                self.endpoint.abort_reception(rx_id);
            }
            self.endpoint.send_with_id_type(tx_id, ext, request, now)
        };
        if let Err(e) = res {
            log::error!("Could not send request to 0x{tx_id:03X}: {e}");
            pending.status = PendingStatus::TransportError(e);
        }
        self.pending = Some(pending);
        self.finish_sync();
    }

    fn push_raw(&mut self, tx_id: u32, ext: bool, payload: &[u8]) -> Result<(), IsoTpError> {
        if payload.is_empty() || payload.len() > 8 {
            return Err(IsoTpError::InvalidLength(payload.len()));
        }
        let mut data = payload.to_vec();
        let settings = self.endpoint.settings();
        if settings.pad_frame {
            data.resize(8, settings.padding_byte);
        }
        self.raw_out.push(CanFrame::new(tx_id, &data, ext));
        Ok(())
    }

    fn drain_frames(&mut self) -> Vec<CanFrame> {
        let mut out = std::mem::take(&mut self.raw_out);
        out.extend(self.endpoint.take_frames());
        out
    }
}
