//! ISO-TP segmentation

use std::time::{Duration, Instant};

use crate::channel::IsoTPSettings;

use super::{FlowControl, FlowStatus, IsoTpError};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum TxState {
    Idle,
    AwaitingFlowControl { since: Instant },
    Sending,
}

/// Segments one payload at a time into ISO-TP frames.
///
/// Returned frame data is not padded, see [super::IsoTpEndpoint] for that.
#[derive(Debug)]
pub struct IsoTpSender {
    settings: IsoTPSettings,
    addr: u32,
    ext: bool,
    data: Vec<u8>,
    pos: usize,
    seq: u8,
    state: TxState,
    block_size: u8,
    frames_in_block: u8,
    st_min: Duration,
    last_tx: Option<Instant>,
}

impl IsoTpSender {
    /// Creates a new idle sender
    pub fn new(settings: IsoTPSettings) -> Self {
        Self {
            settings,
            addr: 0,
            ext: false,
            data: Vec::new(),
            pos: 0,
            seq: 1,
            state: TxState::Idle,
            block_size: 0,
            frames_in_block: 0,
            st_min: Duration::ZERO,
            last_tx: None,
        }
    }

    /// Checks that a payload can be sent at all
    pub fn validate(&self, payload: &[u8]) -> Result<(), IsoTpError> {
        if payload.is_empty() {
            Err(IsoTpError::InvalidLength(0))
        } else if payload.len() > self.settings.max_payload.min(super::MAX_PAYLOAD_LEN) {
            Err(IsoTpError::PayloadTooLarge {
                len: payload.len(),
                max: self.settings.max_payload.min(super::MAX_PAYLOAD_LEN),
            })
        } else {
            Ok(())
        }
    }

    /// Starts sending a payload. Returns the data of the single frame or first frame to send.
    ///
    /// If a first frame is returned, the sender waits for a flow control frame
    /// before any consecutive frame is produced by [IsoTpSender::poll]
    pub fn start(
        &mut self,
        addr: u32,
        ext: bool,
        payload: &[u8],
        now: Instant,
    ) -> Result<Vec<u8>, IsoTpError> {
        if self.is_active() {
            return Err(IsoTpError::Busy);
        }
        self.validate(payload)?;
        self.addr = addr;
        self.ext = ext;
        if payload.len() <= 7 {
            let mut tx = Vec::with_capacity(payload.len() + 1);
            tx.push(payload.len() as u8);
            tx.extend_from_slice(payload);
            return Ok(tx);
        }
        let mut tx = Vec::with_capacity(8);
        tx.push(0x10 | ((payload.len() >> 8) & 0x0F) as u8);
        tx.push((payload.len() & 0xFF) as u8);
        tx.extend_from_slice(&payload[0..6]);
        self.data = payload.to_vec();
        self.pos = 6;
        self.seq = 1;
        self.frames_in_block = 0;
        self.last_tx = None;
        self.state = TxState::AwaitingFlowControl { since: now };
        Ok(tx)
    }

    /// Processes a flow control frame from the receiver
    pub fn on_flow_control(&mut self, fc: FlowControl, now: Instant) -> Result<(), IsoTpError> {
        if !matches!(self.state, TxState::AwaitingFlowControl { .. }) {
            log::debug!("Ignoring unexpected flow control {fc:02X?}");
            return Ok(());
        }
        match fc.status {
            FlowStatus::ContinueToSend => {
                self.block_size = fc.block_size;
                self.st_min = fc.separation_time();
                self.frames_in_block = 0;
                self.state = TxState::Sending;
            }
            FlowStatus::Wait => {
                log::debug!("Receiver requested to wait");
                self.state = TxState::AwaitingFlowControl { since: now };
            }
            FlowStatus::Overflow => {
                log::error!("Receiver 0x{:03X} reported overflow, aborting", self.addr);
                self.cancel();
                return Err(IsoTpError::FlowControlOverflow);
            }
        }
        Ok(())
    }

    /// Returns the next consecutive frame, if one is due at `now`.
    ///
    /// Returns an error if the flow control did not arrive in time, which also cancels the transfer
    pub fn poll(&mut self, now: Instant) -> Option<Result<Vec<u8>, IsoTpError>> {
        match self.state {
            TxState::Idle => None,
            TxState::AwaitingFlowControl { since } => {
                let timeout = Duration::from_millis(self.settings.fc_timeout_ms as u64);
                if now.saturating_duration_since(since) > timeout {
                    log::error!("Awaiting FC from 0x{:03X} timed out", self.addr);
                    self.cancel();
                    Some(Err(IsoTpError::FlowControlTimeout))
                } else {
                    None
                }
            }
            TxState::Sending => {
                if let Some(last) = self.last_tx {
                    if now.saturating_duration_since(last) < self.st_min {
                        return None;
                    }
                }
                let max_data = (self.data.len() - self.pos).min(7);
                let mut tx = Vec::with_capacity(8);
                tx.push(0x20 | self.seq);
                tx.extend_from_slice(&self.data[self.pos..self.pos + max_data]);
                self.pos += max_data;
                self.seq = (self.seq + 1) & 0x0F;
                self.frames_in_block = self.frames_in_block.wrapping_add(1);
                self.last_tx = Some(now);

                if self.pos >= self.data.len() {
                    log::debug!("Tx to 0x{:03X} done", self.addr);
                    self.state = TxState::Idle;
                    self.data.clear();
                } else if self.block_size != 0 && self.frames_in_block == self.block_size {
                    log::debug!("Awaiting FC");
                    self.frames_in_block = 0;
                    self.state = TxState::AwaitingFlowControl { since: now };
                }
                Some(Ok(tx))
            }
        }
    }

    /// Returns true while a multi-frame transfer is in progress
    pub fn is_active(&self) -> bool {
        self.state != TxState::Idle
    }

    /// CAN ID and extended flag of the current transfer
    pub fn target(&self) -> (u32, bool) {
        (self.addr, self.ext)
    }

    /// Aborts the current transfer
    pub fn cancel(&mut self) {
        self.state = TxState::Idle;
        self.data.clear();
        self.pos = 0;
    }
}
