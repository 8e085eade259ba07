//! ISO-TP reassembly

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use crate::{BusId, channel::IsoTPSettings};

use super::{FlowControl, IsoTpError, IsoTpFrame};

/// Identifies one reassembly session: the bus and the CAN ID of the sender
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    /// Bus the frames arrive on
    pub bus: BusId,
    /// CAN ID of the sender
    pub addr: u32,
}

#[derive(Debug)]
struct ReassemblySession {
    buffer: Vec<u8>,
    declared_len: usize,
    next_seq: u8,
    frames_in_block: u8,
    last_activity: Instant,
}

/// Result of feeding a frame to the [Reassembler]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RxEvent {
    /// A payload is complete
    Complete(Vec<u8>),
    /// A flow control frame has to be sent back to the sender
    SendFlowControl(FlowControl),
    /// The frame was a flow control frame for our own transmission
    FlowControl(FlowControl),
    /// Frame was accepted, payload is not complete yet
    InProgress,
}

/// Reassembles ISO-TP payloads, one session per [SessionKey]
#[derive(Debug)]
pub struct Reassembler {
    settings: IsoTPSettings,
    sessions: HashMap<SessionKey, ReassemblySession>,
}

impl Reassembler {
    /// Creates a new reassembler
    pub fn new(settings: IsoTPSettings) -> Self {
        Self {
            settings,
            sessions: HashMap::new(),
        }
    }

    /// Sets the STmin sent in our flow control frames
    pub fn set_separation_time(&mut self, st_min: u8) {
        self.settings.st_min = st_min;
    }

    /// Flow control we send after a first frame, and after each complete block
    pub fn own_flow_control(&self) -> FlowControl {
        FlowControl::clear_to_send(self.settings.block_size, self.settings.st_min)
    }

    /// Returns true if a multi-frame payload from `key` is being received
    pub fn is_receiving(&self, key: &SessionKey) -> bool {
        self.sessions.contains_key(key)
    }

    /// Drops the session of `key`, returning true if there was one
    pub fn abort(&mut self, key: &SessionKey) -> bool {
        self.sessions.remove(key).is_some()
    }

    /// Drops all sessions which have not seen a frame for longer than the frame gap timeout.
    /// Returns the keys of the dropped sessions
    pub fn expire(&mut self, now: Instant) -> Vec<SessionKey> {
        let gap = Duration::from_millis(self.settings.frame_gap_timeout_ms as u64);
        let expired: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_activity) > gap)
            .map(|(k, _)| *k)
            .collect();
        for k in &expired {
            log::warn!("ISO-TP reception from 0x{:03X} on bus {} timed out", k.addr, k.bus);
            self.sessions.remove(k);
        }
        expired
    }

    /// Processes one CAN frame
    ///
    /// ## Parameters
    /// * key - Bus and CAN ID the frame was received from
    /// * data - Frame data
    /// * now - Time of reception
    pub fn on_frame(
        &mut self,
        key: SessionKey,
        data: &[u8],
        now: Instant,
    ) -> Result<RxEvent, IsoTpError> {
        match IsoTpFrame::parse(data)? {
            IsoTpFrame::Single(payload) => {
                if self.sessions.remove(&key).is_some() {
                    log::warn!(
                        "Single frame from 0x{:03X} interrupted a multi-frame reception",
                        key.addr
                    );
                }
                Ok(RxEvent::Complete(payload.to_vec()))
            }
            IsoTpFrame::First { len, data } => {
                if len > self.settings.max_payload {
                    self.sessions.remove(&key);
                    return Err(IsoTpError::PayloadTooLarge {
                        len,
                        max: self.settings.max_payload,
                    });
                }
                if self.sessions.contains_key(&key) {
                    log::error!(
                        "New first frame from 0x{:03X} replaces an unfinished payload",
                        key.addr
                    );
                }
                let take = len.min(data.len());
                let mut buffer = Vec::with_capacity(len);
                buffer.extend_from_slice(&data[..take]);
                if buffer.len() == len {
                    self.sessions.remove(&key);
                    return Ok(RxEvent::Complete(buffer));
                }
                self.sessions.insert(
                    key,
                    ReassemblySession {
                        buffer,
                        declared_len: len,
                        next_seq: 1,
                        frames_in_block: 0,
                        last_activity: now,
                    },
                );
                Ok(RxEvent::SendFlowControl(self.own_flow_control()))
            }
            IsoTpFrame::Consecutive { seq, data } => {
                let gap = Duration::from_millis(self.settings.frame_gap_timeout_ms as u64);
                let block_size = self.settings.block_size;
                let session = self
                    .sessions
                    .get_mut(&key)
                    .ok_or(IsoTpError::UnexpectedConsecutiveFrame)?;
                if now.saturating_duration_since(session.last_activity) > gap {
                    self.sessions.remove(&key);
                    return Err(IsoTpError::SessionTimeout);
                }
                if seq != session.next_seq {
                    let expected = session.next_seq;
                    self.sessions.remove(&key);
                    return Err(IsoTpError::SequenceMismatch { expected, got: seq });
                }
                let take = (session.declared_len - session.buffer.len()).min(data.len());
                session.buffer.extend_from_slice(&data[..take]);
                session.next_seq = (session.next_seq + 1) & 0x0F;
                session.frames_in_block = session.frames_in_block.wrapping_add(1);
                session.last_activity = now;

                if session.buffer.len() == session.declared_len {
                    let payload = self
                        .sessions
                        .remove(&key)
                        .map(|s| s.buffer)
                        .unwrap_or_default();
                    Ok(RxEvent::Complete(payload))
                } else if block_size != 0 && session.frames_in_block == block_size {
                    session.frames_in_block = 0;
                    Ok(RxEvent::SendFlowControl(self.own_flow_control()))
                } else {
                    Ok(RxEvent::InProgress)
                }
            }
            IsoTpFrame::FlowControl(fc) => Ok(RxEvent::FlowControl(fc)),
        }
    }
}
