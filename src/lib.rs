#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications,
    clippy::uninlined_format_args
)]

//! A crate which provides the protocol machinery needed to poll diagnostic data from
//! the ECUs of a vehicle over one or more CAN buses, as well as to answer OBD2 requests
//! on behalf of the vehicle.
//!
//! ## Layers
//!
//! ### ISO-TP (ISO15765-2)
//! The [isotp] module segments payloads of up to 4095 bytes into CAN frames and reassembles
//! them again, including flow control handling and STmin pacing. It is completely sans-IO,
//! frames are handed in and out by the caller.
//!
//! ### Poll scheduling
//! The [poller] module keeps a table of diagnostic requests per bus, each with a repeat period
//! per vehicle operating state, and works through it one request at a time. Replies are handed
//! to a [poller::PollReplyHandler] once fully reassembled.
//!
//! ### UDS session helper
//! ISO14229 - The [uds] module provides synchronous request/response exchanges on top of the poller,
//! used for switching diagnostic sessions, keeping them alive with TesterPresent and running a single
//! command inside a non-default session.
//!
//! ### OBD2 responder
//! The [obd2] module emulates an OBD2 ECU, answering Mode 01 and Mode 09 requests from a table of
//! PID bindings, so that generic OBD2 tools can read vehicle data.
//!
//! ## Hardware support
//!
//! Any CAN interface implementing [channel::CanChannel] can be used.
//! An in-memory bus for testing is provided in [hardware::simulation], and SocketCAN
//! on Linux behind the `socketcan` feature.

pub mod channel;
pub mod hardware;
pub(crate) mod helpers;
pub mod isotp;
pub mod obd2;
pub mod poller;
pub mod uds;

use channel::ChannelError;
use isotp::IsoTpError;

pub use automotive_diag::ByteWrapper::*;

/// Index of a CAN bus managed by the engine
pub type BusId = u8;

/// Diagnostic engine result
pub type DiagResult<T> = Result<T, DiagError>;

#[derive(Debug, thiserror::Error)]
/// Diagnostic engine error
pub enum DiagError {
    /// The poller task of the bus is no longer running
    #[error("Poller for bus {0} is not running")]
    PollerNotRunning(BusId),
    /// No poller has been registered for the bus
    #[error("No poller is registered for bus {0}")]
    UnknownBus(BusId),
    /// A parameter given to the function is invalid. Check the function's documentation
    /// for more information
    #[error("Diagnostic function parameter invalid: {0}")]
    ParameterInvalid(String),
    /// Operating state index is larger than the configured number of states
    #[error("Operating state {state} is out of range, {count} states are configured")]
    StateOutOfRange {
        /// Requested state
        state: usize,
        /// Number of configured states
        count: usize,
    },
    /// ISO-TP transport error
    #[error("ISO-TP transport error")]
    Transport(
        #[from]
        #[source]
        IsoTpError,
    ),
    /// Error with underlying communication channel
    #[error("Diagnostic hardware channel error")]
    ChannelError(
        #[from]
        #[source]
        ChannelError,
    ),
}
