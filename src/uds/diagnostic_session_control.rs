//!  Provides methods to manipulate the ECUs diagnostic session mode

use automotive_diag::uds::{UdsCommand, UdsSessionType, UdsSessionTypeByte};

use super::{EcuAddress, SessionHelper};
use crate::{DiagResult, Standard, poller::RequestOutcome};

impl SessionHelper {
    /// Requests the ECU to go into a specific diagnostic session mode
    pub fn set_session(
        &self,
        ecu: EcuAddress,
        session_mode: UdsSessionTypeByte,
    ) -> DiagResult<RequestOutcome> {
        self.send_default_timeout(
            ecu,
            &[UdsCommand::DiagnosticSessionControl.into(), session_mode.into()],
        )
    }

    /// Puts the ECU in the extended diagnostic session, and keeps it alive
    /// for [super::SessionOptions::keepalive_seconds]
    pub fn enter_extended_session(&self, ecu: EcuAddress) -> DiagResult<RequestOutcome> {
        let outcome = self.set_session(ecu, Standard(UdsSessionType::Extended))?;
        if outcome.is_success() {
            self.refresh_tester_present(ecu, self.options.keepalive_seconds);
        }
        Ok(outcome)
    }

    /// Runs a single request inside a non-default diagnostic session.
    ///
    /// The ECU is switched to `session_mode`, the request is sent, and the ECU is put back
    /// into the default session. The default session is requested exactly once whatever
    /// happened before, a failure to do so is only logged.
    ///
    /// ## Returns
    /// The outcome of the session switch if it failed, otherwise the outcome of the request
    pub fn run_in_session(
        &self,
        ecu: EcuAddress,
        request: &[u8],
        session_mode: UdsSessionTypeByte,
    ) -> DiagResult<RequestOutcome> {
        let res = self.session_steps(ecu, request, session_mode);

        self.step_delay();
        match self.set_session(ecu, Standard(UdsSessionType::Default)) {
            Ok(RequestOutcome::Success(_)) => {}
            Ok(other) => log::warn!(
                "ECU 0x{:03X} did not return to the default session: {:?}",
                ecu.tx_id,
                other.failure()
            ),
            Err(e) => log::error!(
                "Could not return ECU 0x{:03X} to the default session: {e}",
                ecu.tx_id
            ),
        }
        self.stop_tester_present(ecu);
        res
    }

    fn session_steps(
        &self,
        ecu: EcuAddress,
        request: &[u8],
        session_mode: UdsSessionTypeByte,
    ) -> DiagResult<RequestOutcome> {
        self.send_tester_present(ecu)?;
        self.step_delay();
        let outcome = self.set_session(ecu, session_mode)?;
        if !outcome.is_success() {
            return Ok(outcome);
        }
        self.step_delay();
        self.send_tester_present(ecu)?;
        self.step_delay();
        self.send_default_timeout(ecu, request)
    }
}
