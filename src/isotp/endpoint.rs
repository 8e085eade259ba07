use std::{collections::VecDeque, time::Instant};

use crate::{
    BusId,
    channel::{CanFrame, IsoTPSettings},
};

use super::{IsoTpError, IsoTpSender, Reassembler, RxEvent, SessionKey};

/// ISO-TP endpoint on one bus: a [Reassembler] for incoming payloads, an [IsoTpSender]
/// for outgoing ones, and an outbox of CAN frames waiting to be written to the bus.
///
/// Payloads handed to [IsoTpEndpoint::send] while a multi-frame transfer is in progress are
/// queued and sent in order.
#[derive(Debug)]
pub struct IsoTpEndpoint {
    bus: BusId,
    settings: IsoTPSettings,
    reassembler: Reassembler,
    sender: IsoTpSender,
    queue: VecDeque<(u32, bool, Vec<u8>)>,
    outbox: Vec<CanFrame>,
}

impl IsoTpEndpoint {
    /// Creates a new endpoint
    pub fn new(bus: BusId, settings: IsoTPSettings) -> Self {
        Self {
            bus,
            settings,
            reassembler: Reassembler::new(settings),
            sender: IsoTpSender::new(settings),
            queue: VecDeque::new(),
            outbox: Vec::new(),
        }
    }

    /// ISO-TP settings of the endpoint
    pub fn settings(&self) -> &IsoTPSettings {
        &self.settings
    }

    /// Sets the STmin we ask senders for in our flow control frames
    pub fn set_separation_time(&mut self, st_min: u8) {
        self.settings.st_min = st_min;
        self.reassembler.set_separation_time(st_min);
    }

    /// Sends a payload to `addr` using the configured ID type
    pub fn send(&mut self, addr: u32, payload: &[u8], now: Instant) -> Result<(), IsoTpError> {
        self.send_with_id_type(addr, self.settings.can_use_ext_addr, payload, now)
    }

    /// Sends a payload to `addr`.
    ///
    /// ## Parameters
    /// * addr - Target CAN ID
    /// * ext - Use a 29bit CAN ID
    /// * payload - Payload to send (1-4095 bytes)
    /// * now - Current time
    pub fn send_with_id_type(
        &mut self,
        addr: u32,
        ext: bool,
        payload: &[u8],
        now: Instant,
    ) -> Result<(), IsoTpError> {
        self.sender.validate(payload)?;
        if self.sender.is_active() {
            log::debug!("ISO-TP sender busy, queueing payload to 0x{addr:03X}");
            self.queue.push_back((addr, ext, payload.to_vec()));
            return Ok(());
        }
        let data = self.sender.start(addr, ext, payload, now)?;
        self.push_frame(addr, ext, data);
        Ok(())
    }

    /// Processes a received frame.
    ///
    /// Returns the payload if the frame completed one. Flow control frames that
    /// have to be sent back go to `fc_addr`.
    pub fn on_frame(
        &mut self,
        frame: &CanFrame,
        fc_addr: u32,
        now: Instant,
    ) -> Result<Option<Vec<u8>>, IsoTpError> {
        let key = SessionKey {
            bus: self.bus,
            addr: frame.get_address(),
        };
        match self.reassembler.on_frame(key, frame.get_data(), now)? {
            RxEvent::Complete(payload) => Ok(Some(payload)),
            RxEvent::SendFlowControl(fc) => {
                self.push_frame(fc_addr, frame.is_extended(), fc.to_bytes().to_vec());
                Ok(None)
            }
            RxEvent::FlowControl(fc) => {
                if let Err(e) = self.sender.on_flow_control(fc, now) {
                    self.start_next(now);
                    return Err(e);
                }
                self.pump(now)?;
                Ok(None)
            }
            RxEvent::InProgress => Ok(None),
        }
    }

    /// Emits consecutive frames that are due, detects flow control timeouts and
    /// starts queued payloads. Should be called frequently
    pub fn poll(&mut self, now: Instant) -> Result<(), IsoTpError> {
        for key in self.reassembler.expire(now) {
            log::debug!("Dropped stale reception from 0x{:03X}", key.addr);
        }
        self.pump(now)
    }

    fn pump(&mut self, now: Instant) -> Result<(), IsoTpError> {
        while let Some(res) = self.sender.poll(now) {
            match res {
                Ok(data) => {
                    let (addr, ext) = self.sender.target();
                    self.push_frame(addr, ext, data);
                }
                Err(e) => {
                    self.start_next(now);
                    return Err(e);
                }
            }
        }
        if !self.sender.is_active() {
            self.start_next(now);
        }
        Ok(())
    }

    fn start_next(&mut self, now: Instant) {
        while !self.sender.is_active() {
            let Some((addr, ext, payload)) = self.queue.pop_front() else {
                return;
            };
            match self.sender.start(addr, ext, &payload, now) {
                Ok(data) => self.push_frame(addr, ext, data),
                Err(e) => log::error!("Could not send queued payload to 0x{addr:03X}: {e}"),
            }
        }
    }

    /// Removes all frames waiting to be written to the bus
    pub fn take_frames(&mut self) -> Vec<CanFrame> {
        std::mem::take(&mut self.outbox)
    }

    /// Returns true if a multi-frame transfer is in progress
    pub fn is_sending(&self) -> bool {
        self.sender.is_active()
    }

    /// Aborts the current transfer and drops all queued payloads
    pub fn cancel_send(&mut self) {
        self.sender.cancel();
        self.queue.clear();
    }

    /// Drops a partially received payload from `addr`
    pub fn abort_reception(&mut self, addr: u32) -> bool {
        self.reassembler.abort(&SessionKey {
            bus: self.bus,
            addr,
        })
    }

    fn push_frame(&mut self, addr: u32, ext: bool, mut data: Vec<u8>) {
        if self.settings.pad_frame {
            data.resize(8, self.settings.padding_byte);
        }
        self.outbox.push(CanFrame::new(addr, &data, ext));
    }
}
