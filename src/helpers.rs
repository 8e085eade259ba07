//! When matching ECU responses to requests,
//! some functions in here can be useful

use automotive_diag::uds::UdsErrorByte;

/// Negative response service ID
pub(crate) const NEGATIVE_RESPONSE: u8 = 0x7F;
/// Negative response code 'request correctly received, response pending'
pub(crate) const RESPONSE_PENDING: u8 = 0x78;

/// How a response payload relates to a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseClass {
    /// Positive response. Contains the length of the response header (SID and PID echo)
    Positive(usize),
    /// Negative response with its NRC
    Negative(u8),
    /// ECU needs more time, the real response follows later
    Pending,
    /// Response is for a different request
    Mismatch,
}

/// Checks if the response payload matches the request.
/// For both KWP and UDS, the matching response SID is request + 0x40,
/// followed by an echo of the requested PID.
///
/// ## Parameters
/// * sid - The SID of the request
/// * pid_echo - PID bytes the response has to echo after the SID. Empty if the service has no PID
/// * resp - Response from the ECU to check
pub(crate) fn classify_response(sid: u8, pid_echo: &[u8], resp: &[u8]) -> ResponseClass {
    match resp {
        [NEGATIVE_RESPONSE, req_sid, nrc, ..] if *req_sid == sid => {
            if *nrc == RESPONSE_PENDING {
                ResponseClass::Pending
            } else {
                log::debug!(
                    "ECU negative response to 0x{sid:02X}: 0x{nrc:02X} ({:?})",
                    UdsErrorByte::from(*nrc)
                );
                ResponseClass::Negative(*nrc)
            }
        }
        [resp_sid, rest @ ..] if *resp_sid == sid.wrapping_add(0x40) => {
            if rest.starts_with(pid_echo) {
                ResponseClass::Positive(1 + pid_echo.len())
            } else {
                log::error!(
                    "ECU PID mismatch. Requested {pid_echo:02X?}, response was {resp:02X?}"
                );
                ResponseClass::Mismatch
            }
        }
        _ => {
            log::error!(
                "ECU SID mismatch. Request SID was 0x{sid:02X}, response was {resp:02X?}"
            );
            ResponseClass::Mismatch
        }
    }
}

/// Human readable name of a negative response code
pub(crate) fn nrc_name(nrc: u8) -> String {
    format!("{:?}", UdsErrorByte::from(nrc))
}
