//! Module for logical communication channels with an ECU
//!
//! Currently, the following channel types are defined:
//! * [PacketChannel] - Frame level channel, all device channels implement this trait
//! * [CanChannel] - CAN channel, the frame level interface the [crate::bus::CanBus] is built on
//!
//! Payload level (ISO-TP) channels are found in [crate::hardware::software_isotp]

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Communication channel result
pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Debug, Clone)]
/// Error produced by a communication channel
pub enum ChannelError {
    /// Underlying IO Error with channel
    IOError(Arc<std::io::Error>),
    /// Timeout when writing data to the channel
    WriteTimeout,
    /// Timeout when reading from the channel
    ReadTimeout,
    /// The channels Tx buffer is full
    BufferFull,
    /// Unsupported channel request
    UnsupportedRequest,
    /// The interface is not open
    InterfaceNotOpen,
    /// Channel was used before it was configured, or configured while open
    ConfigurationError,
    /// Underlying API error with hardware
    APIError {
        /// Name of the API EG: 'socketCAN', 'slcan'
        api_name: String,
        /// Internal API error code
        code: u8,
        /// API error description
        desc: String,
    },
    /// Other channel error
    Other(String),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::IOError(e) => write!(f, "IO error: {e}"),
            ChannelError::UnsupportedRequest => write!(f, "unsupported channel request"),
            ChannelError::ReadTimeout => write!(f, "timeout reading from channel"),
            ChannelError::WriteTimeout => write!(f, "timeout writing to channel"),
            ChannelError::BufferFull => write!(f, "channel's Transmit buffer is full"),
            ChannelError::InterfaceNotOpen => write!(f, "channel's interface is not open"),
            ChannelError::ConfigurationError => write!(f, "channel configuration error"),
            ChannelError::APIError {
                api_name,
                code,
                desc,
            } => write!(f, "underlying {api_name} API error ({code}): {desc}"),
            ChannelError::Other(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        if let Self::IOError(io_err) = self {
            Some(io_err.as_ref())
        } else {
            None
        }
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        Self::IOError(Arc::new(err))
    }
}

/// A single frame that can be sent or received over a [PacketChannel]
pub trait Packet: Send + Sync + Sized {
    /// Returns the address (arbitration ID) of the packet
    fn get_address(&self) -> u32;
    /// Returns the data of the packet
    fn get_data(&self) -> &[u8];
}

/// Classic CAN 2.0 frame
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct CanFrame {
    id: u32,
    dlc: u8,
    data: [u8; 8],
    ext: bool,
}

impl std::fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanFrame")
            .field("id", &format_args!("0x{:03X}", self.id))
            .field("data", &self.get_data())
            .field("ext", &self.ext)
            .finish()
    }
}

impl CanFrame {
    /// Creates a new CAN frame. Data beyond 8 bytes is discarded
    pub fn new(id: u32, data: &[u8], is_ext: bool) -> Self {
        let dlc = data.len().min(8);
        let mut buf = [0u8; 8];
        buf[..dlc].copy_from_slice(&data[..dlc]);
        Self {
            id,
            dlc: dlc as u8,
            data: buf,
            ext: is_ext,
        }
    }

    /// Returns true if the frame uses a 29bit identifier
    pub fn is_extended(&self) -> bool {
        self.ext
    }
}

impl Packet for CanFrame {
    fn get_address(&self) -> u32 {
        self.id
    }

    fn get_data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }
}

/// Frame level channel. Devices implement this for the frame type they carry
pub trait PacketChannel<T: Packet>: Send {
    /// Opens the channel. It is ONLY called after the channel has been configured
    fn open(&mut self) -> ChannelResult<()>;

    /// Closes the channel
    fn close(&mut self) -> ChannelResult<()>;

    /// Writes a list of packets to the channel
    ///
    /// ## Parameters
    /// * packets - Packets to write, in order
    /// * timeout_ms - Timeout for writing. If a value of 0 is used, the channel does not wait for confirmation
    fn write_packets(&mut self, packets: Vec<T>, timeout_ms: u32) -> ChannelResult<()>;

    /// Reads up to `max` packets from the channel.
    ///
    /// ## Parameters
    /// * max - Maximum number of packets to return
    /// * timeout_ms - How long to wait for the first packet. If a value of 0 is used, only packets
    ///   already in the receive buffer are returned. An empty list is not an error
    fn read_packets(&mut self, max: usize, timeout_ms: u32) -> ChannelResult<Vec<T>>;

    /// Tells the channel to clear its Rx buffer
    fn clear_rx_buffer(&mut self) -> ChannelResult<()>;

    /// Tells the channel to clear its Tx buffer
    fn clear_tx_buffer(&mut self) -> ChannelResult<()>;
}

/// CAN channel
pub trait CanChannel: PacketChannel<CanFrame> {
    /// Configures the CAN channel. Must be called before [PacketChannel::open]
    ///
    /// ## Parameters
    /// * baud - CAN bus bit rate
    /// * use_extended - Whether 29bit identifiers are in use on the network
    fn set_can_cfg(&mut self, baud: u32, use_extended: bool) -> ChannelResult<()>;
}

/// How a diagnostic request is addressed on the network
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum TargetAddressType {
    /// Request targets exactly one ECU
    Physical,
    /// Broadcast style request that any matching ECU may answer
    Functional,
}

/// ISO-TP configuration options
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsoTPSettings {
    /// Block size requested from the sender when receiving. 0 means send everything
    pub block_size: u8,
    /// Minimum separation time between consecutive frames requested when receiving (In milliseconds)
    pub st_min: u8,
    /// Pad frames over ISO-TP if data size < 8
    pub pad_frame: bool,
    /// Byte used for padding
    pub padding_byte: u8,
    /// Baud rate of the CAN Network
    pub can_speed: u32,
    /// Time to wait for a flow control frame after sending a first frame
    pub rx_flow_control_timeout_ms: u32,
    /// Time to wait between two consecutive frames while receiving
    pub rx_consecutive_frame_timeout_ms: u32,
    /// Number of flow control 'wait' frames accepted before giving up
    pub wft_max: u8,
    /// Largest payload accepted when receiving
    pub max_frame_size: usize,
}

impl Default for IsoTPSettings {
    fn default() -> Self {
        Self {
            block_size: 0,
            st_min: 0,
            pad_frame: true,
            padding_byte: 0x00,
            can_speed: 500_000,
            rx_flow_control_timeout_ms: 1000,
            rx_consecutive_frame_timeout_ms: 1000,
            wft_max: 0,
            max_frame_size: 4095,
        }
    }
}
