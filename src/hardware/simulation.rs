//! Simulation hardware for testing pollers and responders without a real CAN bus
//!
//! A [SimulationBus] connects any number of [SimulationCanChannel]s. Every frame written by one
//! channel is received by all others, and is recorded in the bus log with a timestamp.

use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::{
    BusId,
    channel::{CanChannel, CanFrame, ChannelError, ChannelResult, IsoTPSettings},
    isotp::IsoTpEndpoint,
};

/// A frame seen on a [SimulationBus]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LoggedFrame {
    /// Time the frame was written
    pub time: Instant,
    /// Name of the channel that wrote the frame
    pub sender: &'static str,
    /// The frame
    pub frame: CanFrame,
}

#[derive(Debug, Default)]
struct SimBusState {
    nodes: Vec<(usize, mpsc::Sender<CanFrame>)>,
    log: Vec<LoggedFrame>,
    next_node: usize,
}

/// In-memory CAN bus
#[derive(Debug, Clone, Default)]
pub struct SimulationBus {
    state: Arc<Mutex<SimBusState>>,
}

impl SimulationBus {
    /// Creates a new, empty bus
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimBusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches a new channel to the bus
    pub fn create_channel(&self, name: &'static str) -> SimulationCanChannel {
        let (tx, rx) = mpsc::channel();
        let mut state = self.lock();
        let node = state.next_node;
        state.next_node += 1;
        state.nodes.push((node, tx));
        SimulationCanChannel {
            name,
            node,
            bus: self.clone(),
            rx,
            open: false,
        }
    }

    /// Returns every frame written to the bus so far
    pub fn log(&self) -> Vec<LoggedFrame> {
        self.lock().log.clone()
    }

    /// Returns every frame written to the bus with a specific CAN ID
    pub fn frames_with_id(&self, id: u32) -> Vec<LoggedFrame> {
        self.lock()
            .log
            .iter()
            .filter(|f| f.frame.get_address() == id)
            .copied()
            .collect()
    }

    /// Clears the bus log
    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    fn transmit(&self, node: usize, sender: &'static str, frame: CanFrame) {
        let mut state = self.lock();
        state.log.push(LoggedFrame {
            time: Instant::now(),
            sender,
            frame,
        });
        for (id, tx) in &state.nodes {
            if *id != node {
                let _ = tx.send(frame);
            }
        }
    }

    fn detach(&self, node: usize) {
        self.lock().nodes.retain(|(id, _)| *id != node);
    }
}

/// A channel attached to a [SimulationBus]
#[derive(Debug)]
pub struct SimulationCanChannel {
    name: &'static str,
    node: usize,
    bus: SimulationBus,
    rx: mpsc::Receiver<CanFrame>,
    open: bool,
}

impl Drop for SimulationCanChannel {
    fn drop(&mut self) {
        self.bus.detach(self.node);
    }
}

impl CanChannel for SimulationCanChannel {
    fn open(&mut self) -> ChannelResult<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> ChannelResult<()> {
        self.open = false;
        Ok(())
    }

    fn write_packets(&mut self, packets: Vec<CanFrame>, _timeout_ms: u32) -> ChannelResult<()> {
        if !self.open {
            return Err(ChannelError::InterfaceNotOpen);
        }
        for p in packets {
            log::debug!("{} Out -> {p:02X?}", self.name);
            self.bus.transmit(self.node, self.name, p);
        }
        Ok(())
    }

    fn read_packets(&mut self, max: usize, timeout_ms: u32) -> ChannelResult<Vec<CanFrame>> {
        if !self.open {
            return Err(ChannelError::InterfaceNotOpen);
        }
        let mut read_packets = vec![];
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        while read_packets.len() < max {
            let res = if timeout_ms == 0 || !read_packets.is_empty() {
                self.rx.try_recv().ok()
            } else {
                self.rx
                    .recv_timeout(deadline.saturating_duration_since(Instant::now()))
                    .ok()
            };
            match res {
                Some(f) => {
                    log::debug!("{} In  -> {f:02X?}", self.name);
                    read_packets.push(f);
                }
                None => break,
            }
        }
        if read_packets.is_empty() {
            Err(ChannelError::BufferEmpty)
        } else {
            Ok(read_packets)
        }
    }

    fn clear_rx_buffer(&mut self) -> ChannelResult<()> {
        while self.rx.try_recv().is_ok() {}
        Ok(())
    }
}

/// A scripted ECU on a simulated bus.
///
/// Every ISO-TP payload received on `request_id` is handed to the handler,
/// and whatever it returns is sent back from `response_id`
#[derive(Debug)]
pub struct SimulationEcu {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SimulationEcu {
    /// Starts the ECU on its own thread
    ///
    /// ## Parameters
    /// * channel - Channel the ECU is attached to
    /// * request_id - CAN ID the ECU listens on
    /// * response_id - CAN ID the ECU replies with
    /// * settings - ISO-TP settings of the ECU
    /// * handler - Produces the response payload for a request, or None to stay silent
    pub fn spawn<F>(
        mut channel: SimulationCanChannel,
        request_id: u32,
        response_id: u32,
        settings: IsoTPSettings,
        mut handler: F,
    ) -> ChannelResult<Self>
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        channel.open()?;
        let running = Arc::new(AtomicBool::new(true));
        let running_c = running.clone();
        let handle = std::thread::spawn(move || {
            let bus: BusId = 0;
            let mut endpoint = IsoTpEndpoint::new(bus, settings);
            while running_c.load(Ordering::Relaxed) {
                let now = Instant::now();
                if let Ok(frames) = channel.read_packets(16, 2) {
                    for f in frames.iter().filter(|f| f.get_address() == request_id) {
                        match endpoint.on_frame(f, response_id, now) {
                            Ok(Some(request)) => {
                                if let Some(resp) = handler(&request) {
                                    if let Err(e) = endpoint.send(response_id, &resp, now) {
                                        log::error!("Simulated ECU could not reply: {e}");
                                    }
                                }
                            }
                            Ok(None) => {}
                            Err(e) => log::error!("Simulated ECU transport error: {e}"),
                        }
                    }
                }
                if let Err(e) = endpoint.poll(Instant::now()) {
                    log::error!("Simulated ECU transport error: {e}");
                }
                let out = endpoint.take_frames();
                if !out.is_empty() {
                    let _ = channel.write_packets(out, 0);
                }
            }
            let _ = channel.close();
        });
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }
}

impl Drop for SimulationEcu {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bus_delivery() {
        let bus = SimulationBus::new();
        let mut a = bus.create_channel("A");
        let mut b = bus.create_channel("B");
        let mut c = bus.create_channel("C");
        a.open().unwrap();
        b.open().unwrap();
        c.open().unwrap();

        a.write_packets(vec![CanFrame::new(0x7DF, &[0x02, 0x01, 0x00], false)], 0)
            .unwrap();
        assert_eq!(b.read_packets(10, 0).unwrap().len(), 1);
        assert_eq!(c.read_packets(10, 0).unwrap().len(), 1);
        // Sender does not receive its own frame
        assert!(matches!(a.read_packets(10, 0), Err(ChannelError::BufferEmpty)));
        assert_eq!(bus.frames_with_id(0x7DF).len(), 1);
        assert_eq!(bus.log()[0].sender, "A");
    }

    #[test]
    fn test_closed_channel() {
        let bus = SimulationBus::new();
        let mut a = bus.create_channel("A");
        assert!(matches!(
            a.write_packets(vec![], 0),
            Err(ChannelError::InterfaceNotOpen)
        ));
    }
}
