//! Module for scheduling diagnostic polls on one or more CAN buses
//!
//! Each bus has its own [BusPoller], which works through a set of [PollSeries], sending at most one
//! request at a time and handing every reply to a [PollReplyHandler].
//! Which entries are due is decided by the repeat period of the entry in the current [OperatingState],
//! counted in poller ticks.
//!
//! The [BusPoller] itself does no IO. [BusTask] runs one on its own thread together with a
//! [crate::channel::CanChannel], and [Pollers] manages the tasks of all buses.

use std::sync::{Arc, Mutex};

use crate::{BusId, isotp::IsoTpError};

mod bus;
mod series;
mod settings;
mod task;

pub use bus::{BusPoller, PendingStatus, SingleRequest};
pub use series::PollSeries;
pub use settings::PollerSettings;
pub use task::{BusTask, PollerHandle, Pollers};

/// Functional (broadcast) request ID of OBD2
pub const OBD_BROADCAST_ID: u32 = 0x7DF;
/// Range of response IDs accepted for a request sent to [OBD_BROADCAST_ID]
pub const OBD_RESPONSE_IDS: std::ops::RangeInclusive<u32> = 0x7E8..=0x7EF;
/// Name of the series installed by [BusPoller::set_pid_list]
pub const PRIMARY_SERIES: &str = "standard";

/// Vehicle operating state, used as index into the repeat periods of a [PollEntry].
///
/// What each state means is up to the vehicle, EG: 0 = off, 1 = on, 2 = charging
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OperatingState(pub usize);

bitflags::bitflags! {
    /// How a request is transported
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct TransportFlags: u8 {
        /// Send the request as a single raw CAN frame without ISO-TP, and take the
        /// first frame from the ECU as the complete response
        const RAW_FRAME = 1;
        /// Use 29bit CAN IDs
        const EXTENDED_ID = 1 << 1;
    }
}

/// Width of the PID that follows the service ID in a request, and is echoed in the response
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PidWidth {
    /// Service has no PID
    None,
    /// 8bit PID
    Byte,
    /// 16bit PID, big endian
    Word,
}

impl PidWidth {
    /// PID bytes as they appear on the wire
    pub fn encode(&self, pid: u16) -> Vec<u8> {
        match self {
            PidWidth::None => vec![],
            PidWidth::Byte => vec![pid as u8],
            PidWidth::Word => pid.to_be_bytes().to_vec(),
        }
    }
}

/// Diagnostic service of a [PollEntry]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    /// OBD2 Mode 01, current data
    ReadDataByPid,
    /// OBD2 Mode 02, freeze frame data
    ReadFreezeFrame,
    /// OBD2 Mode 03, stored DTCs
    ReadStoredDtc,
    /// OBD2 Mode 04, clear DTCs
    ClearDtc,
    /// OBD2 Mode 05, oxygen sensor test results
    ReadOxygenSensorTest,
    /// OBD2 Mode 07, pending DTCs
    ReadPendingDtc,
    /// OBD2 Mode 09, vehicle information (PID 0x02 is the VIN)
    ReadVehicleInfo,
    /// OBD2 Mode 0A, permanent DTCs
    ReadPermanentDtc,
    /// UDS diagnostic session control
    SessionControl,
    /// UDS clear diagnostic information
    ClearDiagnosticInformation,
    /// KWP2000 read data by local identifier (8bit)
    ReadDataByIdGroup,
    /// UDS read data by identifier (16bit)
    ReadDataByIdExtended,
    /// UDS read memory by address
    ReadMemoryByAddress,
    /// UDS read scaling data by identifier
    ReadScalingDataById,
    /// UDS write data by identifier
    WriteDataById,
    /// UDS input output control by identifier
    IoControlById,
    /// UDS tester present
    TesterPresent,
    /// Any other service ID
    Other(u8),
}

impl From<u8> for ServiceKind {
    fn from(sid: u8) -> Self {
        match sid {
            0x01 => ServiceKind::ReadDataByPid,
            0x02 => ServiceKind::ReadFreezeFrame,
            0x03 => ServiceKind::ReadStoredDtc,
            0x04 => ServiceKind::ClearDtc,
            0x05 => ServiceKind::ReadOxygenSensorTest,
            0x07 => ServiceKind::ReadPendingDtc,
            0x09 => ServiceKind::ReadVehicleInfo,
            0x0A => ServiceKind::ReadPermanentDtc,
            0x10 => ServiceKind::SessionControl,
            0x14 => ServiceKind::ClearDiagnosticInformation,
            0x21 => ServiceKind::ReadDataByIdGroup,
            0x22 => ServiceKind::ReadDataByIdExtended,
            0x23 => ServiceKind::ReadMemoryByAddress,
            0x24 => ServiceKind::ReadScalingDataById,
            0x2E => ServiceKind::WriteDataById,
            0x2F => ServiceKind::IoControlById,
            0x3E => ServiceKind::TesterPresent,
            _ => ServiceKind::Other(sid),
        }
    }
}

impl From<ServiceKind> for u8 {
    fn from(kind: ServiceKind) -> Self {
        match kind {
            ServiceKind::ReadDataByPid => 0x01,
            ServiceKind::ReadFreezeFrame => 0x02,
            ServiceKind::ReadStoredDtc => 0x03,
            ServiceKind::ClearDtc => 0x04,
            ServiceKind::ReadOxygenSensorTest => 0x05,
            ServiceKind::ReadPendingDtc => 0x07,
            ServiceKind::ReadVehicleInfo => 0x09,
            ServiceKind::ReadPermanentDtc => 0x0A,
            ServiceKind::SessionControl => 0x10,
            ServiceKind::ClearDiagnosticInformation => 0x14,
            ServiceKind::ReadDataByIdGroup => 0x21,
            ServiceKind::ReadDataByIdExtended => 0x22,
            ServiceKind::ReadMemoryByAddress => 0x23,
            ServiceKind::ReadScalingDataById => 0x24,
            ServiceKind::WriteDataById => 0x2E,
            ServiceKind::IoControlById => 0x2F,
            ServiceKind::TesterPresent => 0x3E,
            ServiceKind::Other(x) => x,
        }
    }
}

impl ServiceKind {
    /// Width of the PID used by the service
    pub fn pid_width(&self) -> PidWidth {
        match u8::from(*self) {
            0x05 | 0x22 | 0x24 | 0x2E | 0x2F => PidWidth::Word,
            0x03 | 0x04 | 0x07 | 0x0A | 0x14 | 0x18 | 0x23 => PidWidth::None,
            _ => PidWidth::Byte,
        }
    }
}

/// One diagnostic request in a [PollSeries]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollEntry {
    /// CAN ID the request is sent to
    pub tx_id: u32,
    /// CAN ID the response is expected from. Ignored for requests to [OBD_BROADCAST_ID]
    pub rx_id: u32,
    /// Diagnostic service
    pub service: ServiceKind,
    /// PID or sub function
    pub pid: u16,
    /// Extra request bytes sent after the PID
    pub args: Vec<u8>,
    /// Repeat period in ticks, indexed by [OperatingState]. 0 or a missing slot means
    /// the entry is not polled in that state
    pub periods: Vec<u16>,
    /// Bus the entry is meant for. None means the bus of the series it is added to
    pub bus: Option<BusId>,
    /// Transport flags
    pub transport: TransportFlags,
}

impl PollEntry {
    /// Creates a new ISO-TP entry
    pub fn new(tx_id: u32, rx_id: u32, service: ServiceKind, pid: u16, periods: &[u16]) -> Self {
        Self {
            tx_id,
            rx_id,
            service,
            pid,
            args: Vec::new(),
            periods: periods.to_vec(),
            bus: None,
            transport: TransportFlags::empty(),
        }
    }

    /// Sets the extra request bytes
    pub fn with_args(mut self, args: &[u8]) -> Self {
        self.args = args.to_vec();
        self
    }

    /// Restricts the entry to a bus
    pub fn with_bus(mut self, bus: BusId) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Sets the transport flags
    pub fn with_transport(mut self, transport: TransportFlags) -> Self {
        self.transport = transport;
        self
    }

    /// Repeat period in the given state
    pub fn period(&self, state: OperatingState) -> u16 {
        self.periods.get(state.0).copied().unwrap_or(0)
    }

    /// PID bytes a response has to echo
    pub fn pid_echo(&self) -> Vec<u8> {
        self.service.pid_width().encode(self.pid)
    }

    /// The request payload
    pub fn request_bytes(&self) -> Vec<u8> {
        let mut req = vec![u8::from(self.service)];
        req.extend(self.pid_echo());
        req.extend_from_slice(&self.args);
        req
    }

    /// Returns true if the request goes to the OBD2 broadcast ID
    pub fn is_broadcast(&self) -> bool {
        self.tx_id == OBD_BROADCAST_ID
    }
}

/// A reply to a [PollEntry]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollReply<'a> {
    /// Bus the reply arrived on
    pub bus: BusId,
    /// Service of the request
    pub service: ServiceKind,
    /// CAN ID of the ECU which replied
    pub responder: u32,
    /// PID of the request
    pub pid: u16,
    /// Response data, after the service ID and PID echo
    pub payload: &'a [u8],
    /// Bytes of the response still to come. Always 0, replies are only delivered once complete
    pub bytes_remaining: usize,
}

/// Why a poll failed
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum_macros::Display, strum_macros::IntoStaticStr)]
pub enum FailureReason {
    /// No response before the deadline
    #[strum(serialize = "timeout")]
    Timeout,
    /// ECU responded with a negative response code
    #[strum(serialize = "negative response")]
    NegativeResponse(u8),
    /// ECU responded with something that does not match the request
    #[strum(serialize = "mismatch")]
    Mismatch,
    /// ISO-TP error while receiving or sending
    #[strum(serialize = "transport error")]
    Transport(IsoTpError),
    /// The request could not be written to the bus
    #[strum(serialize = "transmit failed")]
    TransmitFailed,
}

/// Outcome of a synchronous request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Positive response. Contains the full response including the response service ID
    Success(Vec<u8>),
    /// ECU responded with a negative response code
    NegativeResponse(u8),
    /// No response before the deadline
    Timeout,
    /// ECU responded with something that does not match the request
    Mismatch,
    /// ISO-TP error while receiving or sending
    Transport(IsoTpError),
    /// The request could not be written to the bus
    TransmitFailed,
}

impl RequestOutcome {
    /// Returns true for [RequestOutcome::Success]
    pub fn is_success(&self) -> bool {
        matches!(self, RequestOutcome::Success(_))
    }

    /// Returns the failure reason, or None on success
    pub fn failure(&self) -> Option<FailureReason> {
        match self {
            RequestOutcome::Success(_) => None,
            RequestOutcome::NegativeResponse(nrc) => Some(FailureReason::NegativeResponse(*nrc)),
            RequestOutcome::Timeout => Some(FailureReason::Timeout),
            RequestOutcome::Mismatch => Some(FailureReason::Mismatch),
            RequestOutcome::Transport(e) => Some(FailureReason::Transport(*e)),
            RequestOutcome::TransmitFailed => Some(FailureReason::TransmitFailed),
        }
    }
}

/// Receives the results of polls
pub trait PollReplyHandler: Send {
    /// Called with the complete reply to a poll
    fn on_reply(&mut self, reply: &PollReply<'_>);

    /// Called when a poll failed. The entry will be polled again once it is due
    fn on_failure(&mut self, bus: BusId, entry: &PollEntry, reason: FailureReason) {
        log::debug!(
            "Poll of 0x{:03X} {:?} 0x{:04X} on bus {bus} failed: {reason}",
            entry.tx_id,
            entry.service,
            entry.pid
        );
    }
}

/// A [PollReplyHandler] that can be shared between the pollers of several buses
pub type SharedHandler = Arc<Mutex<dyn PollReplyHandler>>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_service_round_trip() {
        for sid in 0..=0xFFu8 {
            assert_eq!(u8::from(ServiceKind::from(sid)), sid);
        }
    }

    #[test]
    fn test_request_bytes() {
        let e = PollEntry::new(0x7E4, 0x7EC, ServiceKind::ReadDataByIdExtended, 0x0101, &[0, 2]);
        assert_eq!(e.request_bytes(), vec![0x22, 0x01, 0x01]);
        assert_eq!(e.period(OperatingState(1)), 2);
        assert_eq!(e.period(OperatingState(3)), 0);

        let e = PollEntry::new(0x7DF, 0, ServiceKind::ReadDataByPid, 0x0C, &[1]);
        assert_eq!(e.request_bytes(), vec![0x01, 0x0C]);
        assert!(e.is_broadcast());

        let e = PollEntry::new(0x7E0, 0x7E8, ServiceKind::ReadMemoryByAddress, 0, &[1])
            .with_args(&[0x14, 0x20, 0x00, 0x10]);
        assert_eq!(e.request_bytes(), vec![0x23, 0x14, 0x20, 0x00, 0x10]);

        let e = PollEntry::new(0x7E0, 0x7E8, ServiceKind::ReadVehicleInfo, 0x02, &[1]);
        assert_eq!(e.request_bytes(), vec![0x09, 0x02]);
    }

    #[test]
    fn test_failure_names() {
        assert_eq!(FailureReason::Timeout.to_string(), "timeout");
        let name: &'static str = FailureReason::NegativeResponse(0x31).into();
        assert_eq!(name, "negative response");
        assert_eq!(
            RequestOutcome::NegativeResponse(0x22).failure(),
            Some(FailureReason::NegativeResponse(0x22))
        );
        assert!(RequestOutcome::Success(vec![0x50, 0x03]).failure().is_none());
    }
}
