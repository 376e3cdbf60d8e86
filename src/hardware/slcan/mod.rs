//! SLCAN Module
//!
//! NOTE: This module was not tested with a genuine SLCAN device, therefore is considered EXPERIMENTAL
//! The following sketch was as a base for implementation of SLCAN device on Teensy 4.1:
//! https://github.com/buched/teensy-slcan-flexcan-T4

use std::time::{Duration, Instant};

use device::{SlCanDevice, SlCanError, get_speed_cmd};

use super::{HardwareError, HardwareResult};
use crate::channel::{CanChannel, CanFrame, ChannelError, ChannelResult, PacketChannel};

pub mod device;

/// SLCAN CAN channel
#[derive(Debug)]
pub struct SlCanChannel {
    device: SlCanDevice,
    can_speed: Option<u32>,
    is_open: bool,
}

impl SlCanChannel {
    /// Creates a channel on an already opened adapter
    pub fn new(device: SlCanDevice) -> Self {
        Self {
            device,
            can_speed: None,
            is_open: false,
        }
    }

    /// Opens the serial port of an adapter
    pub fn open_port(path: &str, serial_baud: u32, rx_queue_limit: usize) -> HardwareResult<Self> {
        let port = serialport::new(path, serial_baud)
            .timeout(Duration::from_millis(10))
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => HardwareError::DeviceNotFound(path.into()),
                _ => HardwareError::APIError {
                    code: 0,
                    desc: e.to_string(),
                },
            })?;
        log::debug!("Opened serial port {path} at {serial_baud} baud");
        Ok(Self::new(SlCanDevice::new(path, port, rx_queue_limit)))
    }

    fn ensure_open(&self) -> ChannelResult<()> {
        if self.is_open {
            Ok(())
        } else {
            Err(ChannelError::InterfaceNotOpen)
        }
    }
}

impl PacketChannel<CanFrame> for SlCanChannel {
    fn open(&mut self) -> ChannelResult<()> {
        if self.is_open {
            return Ok(());
        }
        let speed = self.can_speed.ok_or(ChannelError::ConfigurationError)?;
        self.device.open(speed)?;
        self.is_open = true;
        Ok(())
    }

    fn close(&mut self) -> ChannelResult<()> {
        if !self.is_open {
            return Ok(());
        }
        self.is_open = false;
        self.device.close()?;
        Ok(())
    }

    fn write_packets(&mut self, packets: Vec<CanFrame>, _timeout_ms: u32) -> ChannelResult<()> {
        self.ensure_open()?;
        for p in packets {
            self.device.write(p)?;
        }
        Ok(())
    }

    fn read_packets(&mut self, max: usize, timeout_ms: u32) -> ChannelResult<Vec<CanFrame>> {
        self.ensure_open()?;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        let mut result = Vec::with_capacity(max.min(16));
        while result.len() < max {
            // Only the first frame is waited for
            let wait = if result.is_empty() {
                deadline.saturating_duration_since(Instant::now())
            } else {
                Duration::ZERO
            };
            match self.device.read(wait) {
                Ok(Some(f)) => result.push(f),
                Ok(None) => break,
                Err(SlCanError::DecodingFailed) => {
                    log::warn!("SLCAN dropped undecodable line");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(result)
    }

    fn clear_rx_buffer(&mut self) -> ChannelResult<()> {
        self.device.clear_rx_queue()?;
        Ok(())
    }

    fn clear_tx_buffer(&mut self) -> ChannelResult<()> {
        Ok(())
    }
}

impl CanChannel for SlCanChannel {
    fn set_can_cfg(&mut self, baud: u32, _use_extended: bool) -> ChannelResult<()> {
        if self.is_open {
            return Err(ChannelError::ConfigurationError);
        }
        get_speed_cmd(baud)?;
        self.can_speed = Some(baud);
        Ok(())
    }
}

impl Drop for SlCanChannel {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("SLCAN close on drop failed: {e}");
        }
    }
}
