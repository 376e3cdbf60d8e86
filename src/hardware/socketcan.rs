//! SocketCAN module

use std::{
    io::ErrorKind,
    time::{Duration, Instant},
};

use socketcan::{CanSocket, EmbeddedFrame, ExtendedId, Frame, Socket, StandardId};

use super::{HardwareError, HardwareResult};
use crate::channel::{CanChannel, CanFrame, ChannelError, ChannelResult, Packet, PacketChannel};

/// SocketCAN CAN channel
#[derive(Debug)]
pub struct SocketCanCanChannel {
    if_name: String,
    channel: Option<CanSocket>,
}

impl SocketCanCanChannel {
    /// Creates a channel for a network interface (`can0`, `vcan0`)
    pub fn new(if_name: &str) -> HardwareResult<Self> {
        if !std::path::Path::new(&format!("/sys/class/net/{if_name}")).exists() {
            return Err(HardwareError::DeviceNotFound(if_name.into()));
        }
        Ok(Self {
            if_name: if_name.into(),
            channel: None,
        })
    }

    fn safe_with_iface<X, T: FnOnce(&CanSocket) -> ChannelResult<X>>(
        &mut self,
        function: T,
    ) -> ChannelResult<X> {
        match self.channel {
            Some(ref channel) => function(channel),
            None => Err(ChannelError::InterfaceNotOpen),
        }
    }
}

fn to_socketcan_frame(p: &CanFrame) -> ChannelResult<socketcan::CanFrame> {
    let frame = if p.is_extended() {
        ExtendedId::new(p.get_address()).and_then(|id| socketcan::CanFrame::new(id, p.get_data()))
    } else {
        StandardId::new(p.get_address() as u16)
            .and_then(|id| socketcan::CanFrame::new(id, p.get_data()))
    };
    frame.ok_or_else(|| ChannelError::Other(format!("invalid CAN frame {p:?}")))
}

impl PacketChannel<CanFrame> for SocketCanCanChannel {
    fn open(&mut self) -> ChannelResult<()> {
        if self.channel.is_some() {
            return Ok(()); // Already open!
        }
        let channel = CanSocket::open(&self.if_name)?;
        channel.set_nonblocking(true)?;
        self.channel = Some(channel);
        Ok(())
    }

    fn close(&mut self) -> ChannelResult<()> {
        self.channel = None;
        Ok(())
    }

    fn write_packets(&mut self, packets: Vec<CanFrame>, timeout_ms: u32) -> ChannelResult<()> {
        let timeout = Duration::from_millis(timeout_ms.max(100) as u64);
        self.safe_with_iface(|iface| {
            for p in &packets {
                let cf = to_socketcan_frame(p)?;
                let start = Instant::now();
                loop {
                    match iface.write_frame(&cf) {
                        Ok(()) => break,
                        // Kernel Tx queue full, retry until the timeout
                        Err(e) if e.kind() == ErrorKind::WouldBlock => {
                            if start.elapsed() > timeout {
                                return Err(ChannelError::WriteTimeout);
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
        let timeout = Duration::from_millis(timeout_ms as u64);
        let mut result: Vec<CanFrame> = Vec::with_capacity(max.min(16));
        self.safe_with_iface(|iface| {
            let start = Instant::now();
            while result.len() < max {
                match iface.read_frame() {
                    Ok(read) => {
                        if let socketcan::CanFrame::Data(_) = read {
                            result.push(CanFrame::new(read.raw_id(), read.data(), read.is_extended()));
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        if !result.is_empty() || start.elapsed() >= timeout {
                            break;
                        }
                        std::thread::sleep(Duration::from_micros(200));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(())
        })?;
        Ok(result)
    }

    fn clear_rx_buffer(&mut self) -> ChannelResult<()> {
        // Drain whatever the kernel already queued
        self.read_packets(usize::MAX, 0).map(|_| ())
    }

    fn clear_tx_buffer(&mut self) -> ChannelResult<()> {
        Ok(())
    }
}

impl CanChannel for SocketCanCanChannel {
    /// SocketCAN ignores this function as the channel is pre-configured
    /// by the OS' kernel.
    fn set_can_cfg(&mut self, _baud: u32, _use_extended: bool) -> ChannelResult<()> {
        Ok(())
    }
}
