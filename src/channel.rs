//! Module for CAN communication channels
//!
//! The engine only needs one kind of channel, a raw CAN channel ([CanChannel]),
//! ISO-TP is done in software by [crate::isotp] on top of it.

/// Communication channel result
pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Debug)]
/// Error produced by a communication channel
pub enum ChannelError {
    /// Underlying IO Error with channel
    IOError(std::io::Error),
    /// Timeout when writing data to the channel
    WriteTimeout,
    /// Timeout when reading from the channel
    ReadTimeout,
    /// The channel's Rx buffer is empty. Only applies when read timeout is 0
    BufferEmpty,
    /// The channels Tx buffer is full
    BufferFull,
    /// The interface is not open
    InterfaceNotOpen,
    /// The other end of the channel went away
    Disconnected,
    /// Other channel error
    Other(String),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::IOError(e) => write!(f, "IO error: {e}"),
            ChannelError::ReadTimeout => write!(f, "timeout reading from channel"),
            ChannelError::WriteTimeout => write!(f, "timeout writing to channel"),
            ChannelError::BufferFull => write!(f, "channel's Transmit buffer is full"),
            ChannelError::BufferEmpty => write!(f, "channel's Receive buffer is empty"),
            ChannelError::InterfaceNotOpen => write!(f, "channel's interface is not open"),
            ChannelError::Disconnected => write!(f, "channel was disconnected"),
            ChannelError::Other(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        if let Self::IOError(io_err) = self {
            Some(io_err)
        } else {
            None
        }
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        Self::IOError(err)
    }
}

/// A single CAN 2.0 frame
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CanFrame {
    id: u32,
    dlc: u8,
    data: [u8; 8],
    ext: bool,
}

impl CanFrame {
    /// Creates a new CAN Frame given data and an ID.
    /// ## Parameters
    /// * id - Arbitration ID of the frame
    /// * data - Data of the frame. Only the first 8 bytes are used
    /// * is_ext - Indicates if the ID is a 29bit (extended) ID
    pub fn new(id: u32, data: &[u8], is_ext: bool) -> Self {
        let dlc = data.len().min(8);
        let mut tmp = [0; 8];
        tmp[0..dlc].copy_from_slice(&data[0..dlc]);
        Self {
            id,
            dlc: dlc as u8,
            data: tmp,
            ext: is_ext,
        }
    }

    /// Returns the arbitration ID of the frame
    pub fn get_address(&self) -> u32 {
        self.id
    }

    /// Returns the data of the frame (Only up to the DLC)
    pub fn get_data(&self) -> &[u8] {
        &self.data[0..self.dlc as usize]
    }

    /// Returns true if the frame uses a 29bit ID
    pub fn is_extended(&self) -> bool {
        self.ext
    }
}

/// A raw CAN channel. This is the only thing the engine needs from a CAN interface.
///
/// Implementations must be able to be moved to the thread that drives a bus.
pub trait CanChannel: Send {
    /// Opens the interface
    fn open(&mut self) -> ChannelResult<()>;

    /// Closes the interface
    fn close(&mut self) -> ChannelResult<()>;

    /// Attempts to write frames to the channel, in order
    ///
    /// ## Parameters
    /// * packets - Frames to write
    /// * timeout_ms - Timeout for writing. If a value of 0 is used, it tells the channel to write without checking if
    ///   data was actually written.
    fn write_packets(&mut self, packets: Vec<CanFrame>, timeout_ms: u32) -> ChannelResult<()>;

    /// Attempts to read frames from the channel
    ///
    /// ## Parameters
    /// * max - Maximum number of frames to return
    /// * timeout_ms - Timeout for reading. If a value of 0 is used, it instructs the channel to immediately
    ///   return with whatever was in its receiving buffer
    fn read_packets(&mut self, max: usize, timeout_ms: u32) -> ChannelResult<Vec<CanFrame>>;

    /// Tells the channel to clear its Rx buffer
    fn clear_rx_buffer(&mut self) -> ChannelResult<()>;
}

/// ISO-TP configuration options
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IsoTPSettings {
    /// Block size sent in our flow control frames (0 = send everything without further flow control)
    pub block_size: u8,
    /// Minimum separation time between consecutive frames we ask the sender for (In milliseconds)
    pub st_min: u8,
    /// Pad frames over ISO-TP if data size < 8
    pub pad_frame: bool,
    /// Byte used to pad frames
    pub padding_byte: u8,
    /// Maximum time between two frames of one multi-frame payload before it is discarded
    pub frame_gap_timeout_ms: u32,
    /// Maximum time to wait for a flow control frame when sending
    pub fc_timeout_ms: u32,
    /// Largest payload that will be sent or accepted
    pub max_payload: usize,
    /// Does the CAN Network use extended addressing (29bit) or standard addressing (11bit)
    pub can_use_ext_addr: bool,
}

impl Default for IsoTPSettings {
    fn default() -> Self {
        Self {
            block_size: 0,
            st_min: 25,
            pad_frame: true,
            padding_byte: 0x55,
            frame_gap_timeout_ms: 1000,
            fc_timeout_ms: 1000,
            max_payload: 4095,
            can_use_ext_addr: false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_frame_dlc() {
        let f = CanFrame::new(0x7E0, &[0x02, 0x01, 0x0C], false);
        assert_eq!(f.get_data(), &[0x02, 0x01, 0x0C]);
        assert_eq!(f.get_address(), 0x7E0);
        assert!(!f.is_extended());

        let f = CanFrame::new(0x18DAF110, &[0; 12], true);
        assert_eq!(f.get_data().len(), 8);
        assert!(f.is_extended());
    }
}
