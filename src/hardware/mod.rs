//! The hardware module contains the frame level CAN devices the reader can use,
//! and the software ISO-TP layer built on top of them

pub mod simulation;
pub mod software_isotp;

#[cfg(feature = "slcan")]
pub mod slcan;

#[cfg(all(feature = "socketcan", target_os = "linux"))]
pub mod socketcan;

use serde::{Deserialize, Serialize};

use crate::{channel::{CanChannel, ChannelError}, config::BusConfig};

/// Hardware API result
pub type HardwareResult<T> = Result<T, HardwareError>;

/// Bit rates SLCAN adapters can be configured for
pub const SLCAN_BITRATES: [u32; 10] = [
    10_000, 20_000, 50_000, 100_000, 125_000, 250_000, 500_000, 800_000, 1_000_000, 83_333,
];

/// Kind of CAN adapter
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::EnumString,
    strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InterfaceKind {
    /// Lawicel ASCII protocol over a serial port
    Slcan,
    /// Linux SocketCAN network interface
    SocketCan,
    /// In process virtual bus without ECUs
    Virtual,
}

/// Represents error that can be returned by Hardware API
#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    /// Low level driver error
    #[error("hardware API error. Code {code}, description: {desc}")]
    APIError {
        /// API Error code
        code: u32,
        /// API Error description
        desc: String,
    },
    /// Hardware not found
    #[error("device '{0}' not found")]
    DeviceNotFound(String),
    /// Support for the interface was not compiled in
    #[error("interface '{0}' is not supported by this build")]
    InterfaceNotSupported(InterfaceKind),
    /// Device was found but could not be configured or opened
    #[error("device channel error")]
    ChannelError(
        #[from]
        #[source]
        ChannelError,
    ),
}

/// Opens the frame level device described by the bus configuration.
/// The device is returned unconfigured, [crate::bus::CanBus::open] configures and opens it
pub fn open_device(cfg: &BusConfig) -> HardwareResult<Box<dyn CanChannel>> {
    log::info!("Using {} interface '{}'", cfg.interface, cfg.channel);
    match cfg.interface {
        InterfaceKind::Slcan => open_slcan(cfg),
        InterfaceKind::SocketCan => open_socketcan(cfg),
        InterfaceKind::Virtual => Ok(Box::new(simulation::SimulatedCanDevice::new())),
    }
}

#[cfg(feature = "slcan")]
fn open_slcan(cfg: &BusConfig) -> HardwareResult<Box<dyn CanChannel>> {
    Ok(Box::new(slcan::SlCanChannel::open_port(
        &cfg.channel,
        cfg.serial_baud,
        cfg.rx_queue_limit,
    )?))
}

#[cfg(not(feature = "slcan"))]
fn open_slcan(_cfg: &BusConfig) -> HardwareResult<Box<dyn CanChannel>> {
    Err(HardwareError::InterfaceNotSupported(InterfaceKind::Slcan))
}

#[cfg(all(feature = "socketcan", target_os = "linux"))]
fn open_socketcan(cfg: &BusConfig) -> HardwareResult<Box<dyn CanChannel>> {
    Ok(Box::new(socketcan::SocketCanCanChannel::new(&cfg.channel)?))
}

#[cfg(not(all(feature = "socketcan", target_os = "linux")))]
fn open_socketcan(_cfg: &BusConfig) -> HardwareResult<Box<dyn CanChannel>> {
    Err(HardwareError::InterfaceNotSupported(InterfaceKind::SocketCan))
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn interface_kind_names() {
        assert_eq!(InterfaceKind::from_str("slcan").unwrap(), InterfaceKind::Slcan);
        assert_eq!(InterfaceKind::from_str("socketcan").unwrap(), InterfaceKind::SocketCan);
        assert_eq!(InterfaceKind::Virtual.to_string(), "virtual");
        assert!(InterfaceKind::from_str("pcan").is_err());
    }

    #[test]
    fn virtual_device_needs_no_hardware() {
        let cfg = BusConfig {
            interface: InterfaceKind::Virtual,
            ..Default::default()
        };
        assert!(open_device(&cfg).is_ok());
    }
}
