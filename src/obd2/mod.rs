//! Module for answering OBD2 (SAE J1979) requests
//!
//! The [EcuResponder] emulates an OBD2 ECU on a CAN bus, so that generic OBD2 scan tools
//! can read vehicle data. Mode 01 PIDs are answered from a table of [PidBinding]s, Mode 09
//! answers the VIN and ECU name.

use std::{fmt, sync::Arc};

use crate::channel::IsoTPSettings;

mod pid_format;
mod responder;

pub use pid_format::*;
pub use responder::*;

/// Encodes the supported PID bitmap for PIDs `base + 1` to `base + 32`
pub(crate) fn encode_pid_bitmap(base: u8, supported: impl Iterator<Item = u8>) -> [u8; 4] {
    let mut bitmap = 0u32;
    for pid in supported {
        let offset = pid.wrapping_sub(base);
        if (1..=32).contains(&offset) {
            bitmap |= 1 << (32 - offset as u32);
        }
    }
    bitmap.to_be_bytes()
}

/// Function to decode PID support response from ECU
pub fn decode_pid_bitmap(x: &[u8]) -> Vec<bool> {
    let mut resp: Vec<bool> = Vec::new();
    for b in x {
        let mut mask: u8 = 0b10000000;
        for _ in 0..8 {
            resp.push(b & mask != 0x00);
            mask >>= 1;
        }
    }
    resp
}

/// Evaluates the expressions of [PidBinding::Script] bindings
pub trait ScriptEngine: Send {
    /// Evaluates `script`, returning None if it has no numeric result
    fn evaluate(&mut self, script: &str) -> Option<f32>;
}

/// Source of the value of a Mode 01 PID
#[derive(Clone)]
pub enum PidBinding {
    /// PID is answered with zeros, and not advertised as supported
    Unimplemented,
    /// Value is read from the vehicle model
    Internal(Arc<dyn Fn() -> f32 + Send + Sync>),
    /// Value is the result of a script, evaluated by the responder's [ScriptEngine]
    Script(String),
}

impl fmt::Debug for PidBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unimplemented => write!(f, "Unimplemented"),
            Self::Internal(_) => write!(f, "Internal"),
            Self::Script(s) => f.debug_tuple("Script").field(s).finish(),
        }
    }
}

impl PidBinding {
    /// Binds the PID to a value source
    pub fn internal<F: Fn() -> f32 + Send + Sync + 'static>(f: F) -> Self {
        Self::Internal(Arc::new(f))
    }

    /// Returns false for [PidBinding::Unimplemented]
    pub fn is_implemented(&self) -> bool {
        !matches!(self, Self::Unimplemented)
    }
}

/// Responder settings
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResponderSettings {
    /// Functional (broadcast) request ID
    pub functional_id: u32,
    /// Physical request ID of the emulated ECU
    pub physical_id: u32,
    /// Response ID of the emulated ECU
    pub response_id: u32,
    /// Answer requested PIDs that are not bound with zeros, instead of skipping them.
    /// They are added to the table as [PidBinding::Unimplemented]
    pub autocreate: bool,
    /// Do not give out the VIN
    pub private: bool,
    /// Vehicle identification number
    pub vin: String,
    /// ECU name, Mode 09 PID 0x0A
    pub ecu_name: String,
    /// ISO-TP settings
    pub isotp: IsoTPSettings,
}

impl Default for ResponderSettings {
    fn default() -> Self {
        Self {
            functional_id: crate::poller::OBD_BROADCAST_ID,
            physical_id: 0x7E0,
            response_id: 0x7E8,
            autocreate: false,
            private: false,
            vin: String::new(),
            ecu_name: "ECU-POLLER".into(),
            isotp: IsoTPSettings {
                st_min: 0,
                ..Default::default()
            },
        }
    }
}
