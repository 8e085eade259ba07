//! Software ISO-TP (ISO15765-2) layer
//!
//! This module is sans-IO. Received CAN frames are handed to a [Reassembler] (or an [IsoTpEndpoint]),
//! and frames to be sent are returned to the caller, who writes them to a [crate::channel::CanChannel].
//! Time is always passed in explicitly, which keeps STmin pacing and timeouts testable.
//!
//! Only normal (11bit or 29bit) addressing is supported, extended addressing
//! with a target address byte in front of the PCI is not.

use std::time::Duration;

mod endpoint;
mod rx;
mod tx;

pub use endpoint::IsoTpEndpoint;
pub use rx::{Reassembler, RxEvent, SessionKey};
pub use tx::IsoTpSender;

/// Largest payload that can be described by the 12bit length of a first frame
pub const MAX_PAYLOAD_LEN: usize = 4095;
/// Largest payload that fits a single frame
pub const SINGLE_FRAME_MAX_LEN: usize = 7;

/// ISO-TP transport error
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IsoTpError {
    /// CAN frame had no data at all
    #[error("Empty ISO-TP frame")]
    EmptyFrame,
    /// First nibble of the PCI byte is not a known frame type
    #[error("Invalid ISO-TP frame type 0x{0:02X}")]
    InvalidFrameType(u8),
    /// Frame is shorter than its frame type requires
    #[error("ISO-TP frame too short")]
    FrameTooShort,
    /// Length field of a frame is invalid
    #[error("Invalid ISO-TP payload length {0}")]
    InvalidLength(usize),
    /// Payload is larger than what is allowed
    #[error("ISO-TP payload of {len} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge {
        /// Payload length
        len: usize,
        /// Maximum allowed length
        max: usize,
    },
    /// Consecutive frame arrived out of order. The payload is discarded
    #[error("Consecutive frame sequence mismatch. Expected {expected}, got {got}")]
    SequenceMismatch {
        /// Expected sequence number
        expected: u8,
        /// Received sequence number
        got: u8,
    },
    /// Consecutive frame without a preceding first frame
    #[error("Consecutive frame received without a first frame")]
    UnexpectedConsecutiveFrame,
    /// Too much time passed between two frames of one payload
    #[error("Multi-frame reception timed out")]
    SessionTimeout,
    /// Receiver did not send a flow control frame in time
    #[error("Timeout waiting for flow control")]
    FlowControlTimeout,
    /// Receiver aborted the transfer with an overflow flow control
    #[error("Receiver reported overflow, transfer aborted")]
    FlowControlOverflow,
    /// Flow control frame had an unknown flow status
    #[error("Invalid flow control status 0x{0:02X}")]
    InvalidFlowStatus(u8),
    /// A multi-frame transfer is already in progress
    #[error("ISO-TP sender is busy")]
    Busy,
}

/// Flow status of a flow control frame
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FlowStatus {
    /// Clear to send
    ContinueToSend,
    /// Receiver is not ready yet, keep waiting for another flow control
    Wait,
    /// Receiver cannot take the payload
    Overflow,
}

impl TryFrom<u8> for FlowStatus {
    type Error = IsoTpError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::ContinueToSend),
            1 => Ok(Self::Wait),
            2 => Ok(Self::Overflow),
            x => Err(IsoTpError::InvalidFlowStatus(x)),
        }
    }
}

impl From<FlowStatus> for u8 {
    fn from(value: FlowStatus) -> Self {
        match value {
            FlowStatus::ContinueToSend => 0,
            FlowStatus::Wait => 1,
            FlowStatus::Overflow => 2,
        }
    }
}

/// Contents of a flow control frame
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FlowControl {
    /// Flow status
    pub status: FlowStatus,
    /// Number of consecutive frames that may be sent before waiting for the next flow control.
    /// 0 means no limit
    pub block_size: u8,
    /// Raw STmin byte
    pub st_min: u8,
}

impl FlowControl {
    /// Clear to send flow control
    pub fn clear_to_send(block_size: u8, st_min: u8) -> Self {
        Self {
            status: FlowStatus::ContinueToSend,
            block_size,
            st_min,
        }
    }

    /// Raw bytes of the flow control frame (Without padding)
    pub fn to_bytes(&self) -> [u8; 3] {
        [0x30 | u8::from(self.status), self.block_size, self.st_min]
    }

    /// Minimum time between consecutive frames requested by this flow control
    pub fn separation_time(&self) -> Duration {
        decode_st_min(self.st_min)
    }
}

/// A parsed ISO-TP frame
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IsoTpFrame<'a> {
    /// Single frame. Contains the complete payload
    Single(&'a [u8]),
    /// First frame of a multi-frame payload
    First {
        /// Total payload length
        len: usize,
        /// Payload bytes contained in this frame
        data: &'a [u8],
    },
    /// Consecutive frame
    Consecutive {
        /// Sequence number (0-15)
        seq: u8,
        /// Payload bytes contained in this frame (Might include padding on the last frame)
        data: &'a [u8],
    },
    /// Flow control frame
    FlowControl(FlowControl),
}

impl<'a> IsoTpFrame<'a> {
    /// Classifies CAN frame data by the high nibble of its PCI byte
    pub fn parse(data: &'a [u8]) -> Result<Self, IsoTpError> {
        let pci = *data.first().ok_or(IsoTpError::EmptyFrame)?;
        match pci & 0xF0 {
            0x00 => {
                let len = (pci & 0x0F) as usize;
                if len == 0 || len > 7 || len + 1 > data.len() {
                    return Err(IsoTpError::InvalidLength(len));
                }
                Ok(Self::Single(&data[1..1 + len]))
            }
            0x10 => {
                if data.len() < 2 {
                    return Err(IsoTpError::FrameTooShort);
                }
                let len = (((pci & 0x0F) as usize) << 8) | data[1] as usize;
                if len == 0 {
                    return Err(IsoTpError::InvalidLength(0));
                }
                Ok(Self::First {
                    len,
                    data: &data[2..],
                })
            }
            0x20 => Ok(Self::Consecutive {
                seq: pci & 0x0F,
                data: &data[1..],
            }),
            0x30 => {
                if data.len() < 3 {
                    return Err(IsoTpError::FrameTooShort);
                }
                Ok(Self::FlowControl(FlowControl {
                    status: FlowStatus::try_from(pci & 0x0F)?,
                    block_size: data[1],
                    st_min: data[2],
                }))
            }
            _ => Err(IsoTpError::InvalidFrameType(pci)),
        }
    }
}

/// Decodes a raw STmin byte.
///
/// 0x00-0x7F are milliseconds, 0xF1-0xF9 are 100-900 microseconds.
/// Reserved values are treated as the largest valid value (127ms)
pub fn decode_st_min(raw: u8) -> Duration {
    match raw {
        0x00..=0x7F => Duration::from_millis(raw as u64),
        0xF1..=0xF9 => Duration::from_micros((raw - 0xF0) as u64 * 100),
        _ => Duration::from_millis(0x7F),
    }
}

/// Encodes a separation time in milliseconds as a STmin byte
pub fn encode_st_min_ms(ms: u32) -> u8 {
    ms.min(0x7F) as u8
}
