#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications,
    clippy::uninlined_format_args
)]

//! A crate which reads manufacturer specific data identifiers (UDS ReadDataByIdentifier, ISO14229)
//! from ECUs on a CAN bus, and annotates a CSV template per identifier with the raw bytes returned.
//!
//! ## Reading
//!
//! The ECU answering a request is not always known in advance. With functional addressing
//! any ECU on the network may answer, on any of up to 256 response IDs. An [addressing::AddressingPlan]
//! lists the transmit endpoint and every endpoint a response may arrive on, and
//! [aggregator::send_and_collect] sends the request once and listens on all of them until
//! the first positive response arrives or the deadline passes.
//!
//! Three addressing modes are supported
//! * 11bit physical - request and response IDs are known
//! * 11bit functional - request on 0x7DF, responses on 0x708..=0x7FF
//! * 29bit normal fixed functional - request on 0x18DB_FF_F1, responses on 0x18DA_F1_xx
//!
//! ## Hardware support
//!
//! ### SLCAN
//! Lawicel ASCII protocol adapters on a serial port (feature `slcan`, default)
//!
//! ### SocketCAN (Linux only)
//! Any SocketCAN network interface (feature `socketcan`)
//!
//! ISO-TP is always done in software on top of the raw CAN device, see [hardware::software_isotp]
//!
//! ## Annotation
//!
//! A positive response is matched to `format/did_<key>.csv`, and a copy with an extra
//! `Raw value` column is written to `result/did_<key>.csv`. See [annotate]

use channel::ChannelError;
use config::ConfigError;
use hardware::HardwareError;

pub mod addressing;
pub mod aggregator;
pub mod annotate;
pub mod bus;
pub mod channel;
pub mod config;
pub mod hardware;
pub mod session;
pub mod uds;

/// Reader result
pub type ReaderResult<T> = Result<T, ReaderError>;

/// Errors that abort a run before any request is sent
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    /// Invalid or unreadable configuration
    #[error("configuration error")]
    Config(
        #[from]
        #[source]
        ConfigError,
    ),
    /// CAN adapter could not be found or opened
    #[error("CAN adapter error")]
    Hardware(
        #[from]
        #[source]
        HardwareError,
    ),
    /// CAN bus could not be configured or opened
    #[error("CAN bus error")]
    Bus(
        #[from]
        #[source]
        ChannelError,
    ),
}
