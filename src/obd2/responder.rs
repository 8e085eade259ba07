use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::{
    DiagError, DiagResult,
    channel::{CanChannel, CanFrame, ChannelError},
    helpers::NEGATIVE_RESPONSE,
    isotp::{IsoTpEndpoint, IsoTpError},
};

use super::{PidBinding, PidFormat, ResponderSettings, ScriptEngine, encode_pid_bitmap};

/// NRC 'sub function not supported', sent for PIDs we do not answer
const NRC_SUB_FUNCTION_NOT_SUPPORTED: u8 = 0x12;
/// NRC 'request out of range'
const NRC_REQUEST_OUT_OF_RANGE: u8 = 0x31;
/// NRC 'service not supported'
const NRC_SERVICE_NOT_SUPPORTED: u8 = 0x11;

const VIN_LEN: usize = 17;
const ECU_NAME_LEN: usize = 20;

/// Emulated OBD2 ECU
pub struct EcuResponder {
    settings: ResponderSettings,
    endpoint: IsoTpEndpoint,
    bindings: BTreeMap<u8, (PidBinding, PidFormat)>,
    scripts: Option<Box<dyn ScriptEngine>>,
}

impl fmt::Debug for EcuResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcuResponder")
            .field("settings", &self.settings)
            .field("bindings", &self.bindings)
            .field("has_script_engine", &self.scripts.is_some())
            .finish()
    }
}

impl EcuResponder {
    /// Creates a responder without any bound PIDs
    pub fn new(settings: ResponderSettings) -> Self {
        Self {
            endpoint: IsoTpEndpoint::new(0, settings.isotp),
            settings,
            bindings: BTreeMap::new(),
            scripts: None,
        }
    }

    /// Sets the engine evaluating [PidBinding::Script] bindings
    pub fn with_script_engine(mut self, engine: Box<dyn ScriptEngine>) -> Self {
        self.scripts = Some(engine);
        self
    }

    /// Responder settings
    pub fn settings(&self) -> &ResponderSettings {
        &self.settings
    }

    /// Binds a Mode 01 PID, encoded with its standard format
    pub fn bind(&mut self, pid: u8, binding: PidBinding) {
        self.bind_with_format(pid, binding, PidFormat::for_pid(pid));
    }

    /// Binds a Mode 01 PID with an explicit format
    pub fn bind_with_format(&mut self, pid: u8, binding: PidBinding, format: PidFormat) {
        log::debug!("Binding PID 0x{pid:02X} to {binding:?} as {format}");
        self.bindings.insert(pid, (binding, format));
    }

    /// Removes a PID binding. Returns true if the PID was bound
    pub fn unbind(&mut self, pid: u8) -> bool {
        self.bindings.remove(&pid).is_some()
    }

    /// Returns true if the PID is bound
    pub fn is_bound(&self, pid: u8) -> bool {
        self.bindings.contains_key(&pid)
    }

    fn implemented(&self) -> impl Iterator<Item = u8> + '_ {
        self.bindings
            .iter()
            .filter(|(_, (b, _))| b.is_implemented())
            .map(|(pid, _)| *pid)
    }

    /// Supported PID bitmap for the PIDs `base + 1` to `base + 32`.
    ///
    /// The last bit, the next bitmap PID, is set if any PID above it is implemented
    pub fn supported_bitmap(&self, base: u8) -> [u8; 4] {
        let next = base as u16 + 0x20;
        let mut pids: Vec<u8> = self
            .implemented()
            .filter(|p| *p > base && (*p as u16) < next && *p % 0x20 != 0)
            .collect();
        // The 0xE0 bitmap has no successor
        if next <= 0xFF && self.implemented().any(|p| p as u16 > next) {
            pids.push(next as u8);
        }
        encode_pid_bitmap(base, pids.into_iter())
    }

    fn pid_value(&mut self, pid: u8) -> Option<Vec<u8>> {
        if pid % 0x20 == 0 {
            return (pid == 0 || self.implemented().any(|p| p > pid))
                .then(|| self.supported_bitmap(pid).to_vec());
        }
        if !self.bindings.contains_key(&pid) {
            if !self.settings.autocreate {
                return None;
            }
            self.bind(pid, PidBinding::Unimplemented);
        }
        let (binding, format) = self.bindings.get(&pid)?;
        let value = match binding {
            PidBinding::Unimplemented => return Some(vec![0; format.len()]),
            PidBinding::Internal(f) => f(),
            PidBinding::Script(script) => {
                match self.scripts.as_mut().and_then(|e| e.evaluate(script)) {
                    Some(v) => v,
                    None => {
                        log::warn!("Script for PID 0x{pid:02X} has no value: {script}");
                        0.0
                    }
                }
            }
        };
        Some(format.encode(value))
    }

    fn service_01(&mut self, pids: &[u8]) -> Vec<u8> {
        let mut resp = vec![0x41];
        for pid in pids {
            match self.pid_value(*pid) {
                Some(data) => {
                    resp.push(*pid);
                    resp.extend(data);
                }
                None => log::debug!("Skipping unsupported PID 0x{pid:02X}"),
            }
        }
        if resp.len() == 1 {
            vec![NEGATIVE_RESPONSE, 0x01, NRC_REQUEST_OUT_OF_RANGE]
        } else {
            resp
        }
    }

    fn service_09(&self, pid: Option<u8>) -> Vec<u8> {
        let vin = !self.settings.private && !self.settings.vin.is_empty();
        match pid {
            Some(0x00) => {
                let supported = [vin.then_some(0x02), Some(0x0A)];
                let mut resp = vec![0x49, 0x00];
                resp.extend(encode_pid_bitmap(0x00, supported.into_iter().flatten()));
                resp
            }
            Some(0x02) if vin => {
                let mut resp = vec![0x49, 0x02, 0x01];
                resp.extend(padded(&self.settings.vin, VIN_LEN));
                resp
            }
            Some(0x0A) => {
                let mut resp = vec![0x49, 0x0A, 0x01];
                resp.extend(padded(&self.settings.ecu_name, ECU_NAME_LEN));
                resp
            }
            Some(_) => vec![NEGATIVE_RESPONSE, 0x09, NRC_REQUEST_OUT_OF_RANGE],
            None => vec![NEGATIVE_RESPONSE, 0x09, NRC_SUB_FUNCTION_NOT_SUPPORTED],
        }
    }

    /// Builds the response to a request. Returns None if the request is not answered
    pub fn handle_request(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        let (mode, args) = request.split_first()?;
        let resp = match *mode {
            0x01 => self.service_01(args),
            0x09 => self.service_09(args.first().copied()),
            // Stored, pending and permanent DTCs. We never have any
            0x03 | 0x07 | 0x0A => vec![mode + 0x40, 0x00],
            m => vec![NEGATIVE_RESPONSE, m, NRC_SERVICE_NOT_SUPPORTED],
        };
        Some(resp)
    }

    /// Processes a received frame, answering completed requests
    pub fn on_frame(&mut self, frame: &CanFrame, now: Instant) -> Result<(), IsoTpError> {
        let id = frame.get_address();
        if id != self.settings.functional_id && id != self.settings.physical_id {
            return Ok(());
        }
        let response_id = self.settings.response_id;
        if let Some(request) = self.endpoint.on_frame(frame, response_id, now)? {
            log::debug!("OBD2 request on 0x{id:03X}: {request:02X?}");
            if let Some(resp) = self.handle_request(&request) {
                log::debug!("OBD2 response: {resp:02X?}");
                self.endpoint.send(response_id, &resp, now)?;
            }
        }
        Ok(())
    }

    /// Paces multi-frame responses. Should be called frequently
    pub fn poll(&mut self, now: Instant) -> Result<(), IsoTpError> {
        self.endpoint.poll(now)
    }

    /// Removes all frames waiting to be written to the bus
    pub fn take_frames(&mut self) -> Vec<CanFrame> {
        self.endpoint.take_frames()
    }
}

fn padded(s: &str, len: usize) -> Vec<u8> {
    let mut v: Vec<u8> = s.bytes().take(len).collect();
    v.resize(len, 0);
    v
}

#[derive(Debug)]
enum ResponderCommand {
    Bind(u8, PidBinding, Option<PidFormat>),
    Unbind(u8),
}

/// Handle to a [ResponderTask]. Bindings changed through the handle take effect
/// before the next received frame is processed
#[derive(Debug, Clone)]
pub struct ResponderHandle {
    sender: mpsc::Sender<ResponderCommand>,
    running: Arc<AtomicBool>,
}

impl ResponderHandle {
    fn send(&self, cmd: ResponderCommand) -> DiagResult<()> {
        let stopped = || DiagError::ChannelError(ChannelError::Disconnected);
        if !self.running.load(Ordering::Relaxed) {
            return Err(stopped());
        }
        self.sender.send(cmd).map_err(|_| stopped())
    }

    /// Binds a Mode 01 PID, encoded with its standard format
    pub fn bind(&self, pid: u8, binding: PidBinding) -> DiagResult<()> {
        self.send(ResponderCommand::Bind(pid, binding, None))
    }

    /// Binds a Mode 01 PID with an explicit format
    pub fn bind_with_format(
        &self,
        pid: u8,
        binding: PidBinding,
        format: PidFormat,
    ) -> DiagResult<()> {
        self.send(ResponderCommand::Bind(pid, binding, Some(format)))
    }

    /// Removes a PID binding
    pub fn unbind(&self, pid: u8) -> DiagResult<()> {
        self.send(ResponderCommand::Unbind(pid))
    }
}

/// Runs an [EcuResponder] on its own thread. The thread stops when the task is dropped
#[derive(Debug)]
pub struct ResponderTask {
    handle: ResponderHandle,
    thread: Option<JoinHandle<()>>,
}

impl ResponderTask {
    /// Opens the channel and starts answering requests
    pub fn spawn(
        mut channel: Box<dyn CanChannel>,
        mut responder: EcuResponder,
    ) -> DiagResult<Self> {
        channel.open()?;
        let running = Arc::new(AtomicBool::new(true));
        let running_c = running.clone();
        let (sender, receiver) = mpsc::channel::<ResponderCommand>();

        let thread = std::thread::Builder::new()
            .name("obd2-responder".into())
            .spawn(move || {
                while running_c.load(Ordering::Relaxed) {
                    match receiver.recv_timeout(Duration::from_millis(1)) {
                        Ok(ResponderCommand::Bind(pid, binding, Some(format))) => {
                            responder.bind_with_format(pid, binding, format)
                        }
                        Ok(ResponderCommand::Bind(pid, binding, None)) => {
                            responder.bind(pid, binding)
                        }
                        Ok(ResponderCommand::Unbind(pid)) => {
                            responder.unbind(pid);
                        }
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                    let now = Instant::now();
                    match channel.read_packets(32, 0) {
                        Ok(frames) => {
                            for f in &frames {
                                if let Err(e) = responder.on_frame(f, now) {
                                    log::error!("OBD2 responder transport error: {e}");
                                }
                            }
                        }
                        Err(ChannelError::BufferEmpty) => {}
                        Err(e) => log::error!("OBD2 responder read error: {e}"),
                    }
                    if let Err(e) = responder.poll(Instant::now()) {
                        log::error!("OBD2 responder transport error: {e}");
                    }
                    let out = responder.take_frames();
                    if !out.is_empty() {
                        if let Err(e) = channel.write_packets(out, 0) {
                            log::error!("OBD2 responder write error: {e}");
                        }
                    }
                }
                running_c.store(false, Ordering::Relaxed);
                let _ = channel.close();
            })
            .map_err(|e| DiagError::ChannelError(ChannelError::IOError(e)))?;

        Ok(Self {
            handle: ResponderHandle { sender, running },
            thread: Some(thread),
        })
    }

    /// Returns a handle to the responder
    pub fn handle(&self) -> ResponderHandle {
        self.handle.clone()
    }
}

impl Drop for ResponderTask {
    fn drop(&mut self) {
        self.handle.running.store(false, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Length;

    impl ScriptEngine for Length {
        fn evaluate(&mut self, script: &str) -> Option<f32> {
            (!script.is_empty()).then_some(script.len() as f32)
        }
    }

    fn responder() -> EcuResponder {
        let mut r = EcuResponder::new(ResponderSettings {
            vin: "WVWZZZ1JZXW000001".into(),
            ..Default::default()
        });
        r.bind(0x0C, PidBinding::internal(|| 1726.0));
        r.bind(0x0D, PidBinding::internal(|| 50.0));
        r
    }

    #[test]
    fn test_service_01() {
        let mut r = responder();
        assert_eq!(
            r.handle_request(&[0x01, 0x0C, 0x0D]),
            Some(vec![0x41, 0x0C, 0x1A, 0xF8, 0x0D, 0x32])
        );
        // Unbound PIDs are skipped
        assert_eq!(
            r.handle_request(&[0x01, 0x05, 0x0D]),
            Some(vec![0x41, 0x0D, 0x32])
        );
        assert_eq!(
            r.handle_request(&[0x01, 0x05]),
            Some(vec![0x7F, 0x01, 0x31])
        );
        assert_eq!(r.handle_request(&[0x01]), Some(vec![0x7F, 0x01, 0x31]));
        assert!(r.unbind(0x0D));
        assert!(!r.unbind(0x0D));
        assert_eq!(
            r.handle_request(&[0x01, 0x0D]),
            Some(vec![0x7F, 0x01, 0x31])
        );
    }

    #[test]
    fn test_autocreate() {
        let mut r = EcuResponder::new(ResponderSettings {
            autocreate: true,
            ..Default::default()
        });
        assert_eq!(
            r.handle_request(&[0x01, 0x0C]),
            Some(vec![0x41, 0x0C, 0x00, 0x00])
        );
        assert!(r.is_bound(0x0C));
        // Unimplemented PIDs are not advertised
        assert_eq!(r.supported_bitmap(0x00), [0, 0, 0, 0]);
    }

    #[test]
    fn test_supported_bitmap() {
        let mut r = responder();
        r.bind(0x2F, PidBinding::internal(|| 80.0));
        r.bind(0x05, PidBinding::Unimplemented);
        assert_eq!(
            r.handle_request(&[0x01, 0x00]),
            Some(vec![0x41, 0x00, 0x00, 0x18, 0x00, 0x01])
        );
        assert_eq!(
            r.handle_request(&[0x01, 0x20]),
            Some(vec![0x41, 0x20, 0x00, 0x02, 0x00, 0x00])
        );
        // Nothing above 0x40
        assert_eq!(
            r.handle_request(&[0x01, 0x40]),
            Some(vec![0x7F, 0x01, 0x31])
        );
    }

    #[test]
    fn test_supported_bitmap_last_range() {
        let mut r = EcuResponder::new(ResponderSettings::default());
        r.bind(0xE5, PidBinding::internal(|| 1.0));
        r.bind(0xFF, PidBinding::internal(|| 1.0));
        assert_eq!(r.supported_bitmap(0xC0), [0x00, 0x00, 0x00, 0x01]);
        assert_eq!(r.supported_bitmap(0xE0), [0x08, 0x00, 0x00, 0x02]);
        assert_eq!(
            r.handle_request(&[0x01, 0xE0]),
            Some(vec![0x41, 0xE0, 0x08, 0x00, 0x00, 0x02])
        );
    }

    #[test]
    fn test_script_binding() {
        let mut r =
            EcuResponder::new(ResponderSettings::default()).with_script_engine(Box::new(Length));
        r.bind_with_format(0x0B, PidBinding::Script("abcde".into()), PidFormat::Byte);
        r.bind_with_format(0x33, PidBinding::Script(String::new()), PidFormat::Byte);
        assert_eq!(
            r.handle_request(&[0x01, 0x0B, 0x33]),
            Some(vec![0x41, 0x0B, 0x05, 0x33, 0x00])
        );
    }

    #[test]
    fn test_service_09() {
        let mut r = responder();
        assert_eq!(
            r.handle_request(&[0x09, 0x00]),
            Some(vec![0x49, 0x00, 0x40, 0x40, 0x00, 0x00])
        );
        let vin = r.handle_request(&[0x09, 0x02]).unwrap();
        assert_eq!(&vin[..3], &[0x49, 0x02, 0x01]);
        assert_eq!(&vin[3..], b"WVWZZZ1JZXW000001");
        let name = r.handle_request(&[0x09, 0x0A]).unwrap();
        assert_eq!(name.len(), 23);
        assert_eq!(&name[3..13], b"ECU-POLLER");
        assert!(name[13..].iter().all(|b| *b == 0));
        assert_eq!(r.handle_request(&[0x09, 0x04]), Some(vec![0x7F, 0x09, 0x31]));

        let mut private = EcuResponder::new(ResponderSettings {
            vin: "WVWZZZ1JZXW000001".into(),
            private: true,
            ..Default::default()
        });
        assert_eq!(
            private.handle_request(&[0x09, 0x00]),
            Some(vec![0x49, 0x00, 0x00, 0x40, 0x00, 0x00])
        );
        assert_eq!(
            private.handle_request(&[0x09, 0x02]),
            Some(vec![0x7F, 0x09, 0x31])
        );
    }

    #[test]
    fn test_other_services() {
        let mut r = responder();
        assert_eq!(r.handle_request(&[0x03]), Some(vec![0x43, 0x00]));
        assert_eq!(r.handle_request(&[0x0A]), Some(vec![0x4A, 0x00]));
        assert_eq!(r.handle_request(&[0x22, 0xF1, 0x90]), Some(vec![0x7F, 0x22, 0x11]));
        assert_eq!(r.handle_request(&[]), None);
    }

    #[test]
    fn test_on_frame() {
        let mut r = responder();
        let now = Instant::now();
        // Not addressed to us
        r.on_frame(&CanFrame::new(0x7E1, &[0x02, 0x01, 0x0C], false), now)
            .unwrap();
        assert!(r.take_frames().is_empty());

        r.on_frame(&CanFrame::new(0x7DF, &[0x02, 0x01, 0x0D, 0, 0, 0, 0, 0], false), now)
            .unwrap();
        let out = r.take_frames();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get_address(), 0x7E8);
        assert_eq!(out[0].get_data(), &[0x03, 0x41, 0x0D, 0x32, 0x55, 0x55, 0x55, 0x55]);
    }
}
