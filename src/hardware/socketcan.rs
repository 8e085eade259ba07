//! SocketCAN module (Linux only)

use std::time::{Duration, Instant};

use socketcan::{CanSocket, EmbeddedFrame, ExtendedId, Id, Socket, StandardId};

use crate::channel::{CanChannel, CanFrame, ChannelError, ChannelResult};

/// Raw CAN channel on a SocketCAN interface
pub struct SocketCanChannel {
    if_name: String,
    socket: Option<CanSocket>,
}

impl std::fmt::Debug for SocketCanChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketCanChannel")
            .field("if_name", &self.if_name)
            .field("open", &self.socket.is_some())
            .finish()
    }
}

impl SocketCanChannel {
    /// Creates a channel for an interface, EG: `can0`. The interface is not opened yet
    pub fn new(if_name: &str) -> Self {
        Self {
            if_name: if_name.to_string(),
            socket: None,
        }
    }

    fn safe_with_iface<X, T: FnOnce(&CanSocket) -> ChannelResult<X>>(
        &self,
        function: T,
    ) -> ChannelResult<X> {
        match self.socket.as_ref() {
            Some(socket) => function(socket),
            None => Err(ChannelError::InterfaceNotOpen),
        }
    }
}

fn to_socketcan_frame(frame: &CanFrame) -> ChannelResult<socketcan::CanFrame> {
    let id: Id = if frame.is_extended() {
        ExtendedId::new(frame.get_address()).map(Id::Extended)
    } else {
        u16::try_from(frame.get_address())
            .ok()
            .and_then(StandardId::new)
            .map(Id::Standard)
    }
    .ok_or_else(|| ChannelError::Other(format!("Invalid CAN ID 0x{:X}", frame.get_address())))?;
    socketcan::CanFrame::new(id, frame.get_data())
        .ok_or_else(|| ChannelError::Other("Invalid CAN frame data".into()))
}

fn from_socketcan_frame(frame: &socketcan::CanFrame) -> CanFrame {
    match frame.id() {
        Id::Standard(id) => CanFrame::new(id.as_raw() as u32, frame.data(), false),
        Id::Extended(id) => CanFrame::new(id.as_raw(), frame.data(), true),
    }
}

impl CanChannel for SocketCanChannel {
    fn open(&mut self) -> ChannelResult<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        let socket = CanSocket::open(&self.if_name)?;
        socket.set_nonblocking(true)?;
        self.socket = Some(socket);
        Ok(())
    }

    fn close(&mut self) -> ChannelResult<()> {
        self.socket = None;
        Ok(())
    }

    fn write_packets(&mut self, packets: Vec<CanFrame>, timeout_ms: u32) -> ChannelResult<()> {
        self.safe_with_iface(|socket| {
            let start = Instant::now();
            for p in &packets {
                let frame = to_socketcan_frame(p)?;
                loop {
                    match socket.write_frame(&frame) {
                        Ok(()) => break,
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            if start.elapsed() > Duration::from_millis(timeout_ms as u64) {
                                return Err(if timeout_ms == 0 {
                                    ChannelError::BufferFull
                                } else {
                                    ChannelError::WriteTimeout
                                });
                            }
                            std::thread::sleep(Duration::from_micros(200));
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            Ok(())
        })
    }

    fn read_packets(&mut self, max: usize, timeout_ms: u32) -> ChannelResult<Vec<CanFrame>> {
        self.safe_with_iface(|socket| {
            let start = Instant::now();
            let mut res = vec![];
            while res.len() < max {
                match socket.read_frame() {
                    Ok(f) => res.push(from_socketcan_frame(&f)),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        if !res.is_empty()
                            || start.elapsed() >= Duration::from_millis(timeout_ms as u64)
                        {
                            break;
                        }
                        std::thread::sleep(Duration::from_micros(200));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            if res.is_empty() {
                Err(ChannelError::BufferEmpty)
            } else {
                Ok(res)
            }
        })
    }

    fn clear_rx_buffer(&mut self) -> ChannelResult<()> {
        self.safe_with_iface(|socket| {
            while socket.read_frame().is_ok() {}
            Ok(())
        })
    }
}
