//! Implements SLCAN device

use std::{
    collections::VecDeque,
    fmt::{Debug, Formatter, Result as FmtResult},
    io::{ErrorKind, Read, Write},
    sync::Arc,
    time::{Duration, Instant},
};

use serialport::SerialPort;

use crate::channel::{CanFrame, ChannelError, Packet};

const MAX_PACKET_SIZE: usize = 32;
const HEX: [u8; 16] = *b"0123456789ABCDEF";
const ACK_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, thiserror::Error)]
/// Error produced by an SLCAN adapter
pub enum SlCanError {
    /// IO Error
    #[error("IO error")]
    IOError(
        #[from]
        #[source]
        Arc<std::io::Error>,
    ),
    /// Unsupported speed
    #[error("Unsupported speed {0}")]
    UnsupportedSpeed(u32),
    /// Read timeout
    #[error("Read timeout")]
    ReadTimeout,
    /// Rx buffer full
    #[error("Rx buffer full")]
    RxBufferFull,
    /// Decoding failed
    #[error("Decoding failed")]
    DecodingFailed,
    /// Not acknowledged
    #[error("Not acknowledged")]
    NotAcknowledged,
}

/// SLCAN Result
pub type SlCanResult<T> = Result<T, SlCanError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlCanLine {
    Ack,
    Nack,
    CanFrame(CanFrame),
}

/// SLCAN Device
pub struct SlCanDevice {
    name: String,
    port: Box<dyn SerialPort>,
    line: Vec<u8>,
    rx_queue: VecDeque<CanFrame>,
    rx_queue_limit: usize,
}

impl Debug for SlCanDevice {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "SlCanDevice {}", self.name)
    }
}

impl SlCanDevice {
    /// Creates a new SLCAN device
    pub fn new(name: &str, port: Box<dyn SerialPort>, rx_queue_limit: usize) -> Self {
        SlCanDevice {
            name: name.into(),
            port,
            line: Vec::with_capacity(MAX_PACKET_SIZE),
            rx_queue: VecDeque::new(),
            rx_queue_limit,
        }
    }

    /// Reads one line from the adapter, waiting up to `wait` for each byte.
    /// A line interrupted by the timeout is continued on the next call
    fn read_line(&mut self, wait: Duration) -> SlCanResult<Option<SlCanLine>> {
        self.port.set_timeout(wait).map_err(|e| {
            SlCanError::IOError(Arc::new(std::io::Error::other(e.to_string())))
        })?;
        let mut byte = [0u8; 1];
        loop {
            match self.port.read(&mut byte) {
                Ok(1) => {}
                Ok(_) => return Ok(None),
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                    return Ok(None);
                }
                Err(e) => return Err(convert_io_error(e)),
            }
            match byte[0] {
                b'\r' | 0x07 => {
                    let line = std::mem::take(&mut self.line);
                    return decode_line(&line, byte[0]).map(Some);
                }
                b => {
                    if self.line.len() == MAX_PACKET_SIZE {
                        self.line.clear();
                        return Err(SlCanError::RxBufferFull);
                    }
                    self.line.push(b);
                }
            }
        }
    }

    fn send_command_with_ack(&mut self, cmd: &[u8]) -> SlCanResult<()> {
        self.port.write_all(cmd).map_err(convert_io_error)?;
        // Frames received before the ACK are kept for later reads
        let start = Instant::now();
        while start.elapsed() <= ACK_TIMEOUT {
            match self.read_line(ACK_TIMEOUT.saturating_sub(start.elapsed()))? {
                Some(SlCanLine::Ack) => return Ok(()),
                Some(SlCanLine::Nack) => return Err(SlCanError::NotAcknowledged),
                Some(SlCanLine::CanFrame(f)) => {
                    if self.rx_queue.len() >= self.rx_queue_limit {
                        return Err(SlCanError::RxBufferFull);
                    }
                    self.rx_queue.push_back(f)
                }
                None => {}
            }
        }
        Err(SlCanError::ReadTimeout)
    }

    /// Sets can speed and opens SLCAN channel
    pub fn open(&mut self, can_speed: u32) -> SlCanResult<()> {
        // Adapters may still be open from a previous session
        if let Err(e) = self.close() {
            log::debug!("SLCAN close before open: {e}");
        }
        self.send_command_with_ack(get_speed_cmd(can_speed)?.as_ref())?;
        self.send_command_with_ack(b"O\r")
    }

    /// Closes SLCAN channel
    pub fn close(&mut self) -> SlCanResult<()> {
        self.send_command_with_ack(b"C\r")
    }

    /// Reads a CAN frame, waiting up to `wait` for it to arrive
    pub fn read(&mut self, wait: Duration) -> SlCanResult<Option<CanFrame>> {
        if let Some(f) = self.rx_queue.pop_front() {
            return Ok(Some(f));
        }
        let start = Instant::now();
        loop {
            match self.read_line(wait.saturating_sub(start.elapsed()))? {
                Some(SlCanLine::CanFrame(f)) => return Ok(Some(f)),
                Some(line) => log::trace!("SLCAN unexpected {line:?}"),
                None => return Ok(None),
            }
        }
    }

    /// Sends can frames to SLCAN device
    pub fn write(&mut self, frame: CanFrame) -> SlCanResult<()> {
        self.send_command_with_ack(&encode_frame(&frame))
    }

    /// Clears RX queue
    pub fn clear_rx_queue(&mut self) -> SlCanResult<()> {
        self.rx_queue.clear();
        self.line.clear();
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| SlCanError::IOError(Arc::new(std::io::Error::other(e.to_string()))))
    }
}

fn encode_frame(frame: &CanFrame) -> Vec<u8> {
    let mut buf = Vec::with_capacity(27);
    if frame.is_extended() {
        buf.push(b'T');
        let id = (frame.get_address() & 0x1FFF_FFFF).to_be_bytes();
        for i in id {
            buf.push(HEX[i as usize >> 4]);
            buf.push(HEX[i as usize & 0xF]);
        }
    } else {
        buf.push(b't');
        let id = frame.get_address() & 0x7FF;
        buf.push(HEX[id as usize >> 8]);
        buf.push(HEX[(id as usize >> 4) & 0xF]);
        buf.push(HEX[id as usize & 0xF]);
    }
    buf.push(HEX[frame.get_data().len() & 0xF]);
    for d in frame.get_data() {
        buf.push(HEX[*d as usize >> 4]);
        buf.push(HEX[*d as usize & 0xF]);
    }
    buf.push(b'\r');
    buf
}

fn decode_line(buf: &[u8], terminator: u8) -> SlCanResult<SlCanLine> {
    if terminator == 0x07 {
        return Ok(SlCanLine::Nack);
    }
    let (ext, id_len) = match buf.first() {
        None => return Ok(SlCanLine::Ack),
        // Transmit acknowledged
        Some(b'z' | b'Z') if buf.len() == 1 => return Ok(SlCanLine::Ack),
        Some(b't') => (false, 3),
        Some(b'T') => (true, 8),
        Some(_) => return Err(SlCanError::DecodingFailed),
    };
    if buf.len() < 2 + id_len {
        return Err(SlCanError::DecodingFailed);
    }
    let id = buf[1..1 + id_len]
        .iter()
        .try_fold(0u32, |acc, h| -> SlCanResult<u32> {
            Ok(acc << 4 | hex_to_byte(*h)? as u32)
        })?;
    let dlc = hex_to_byte(buf[1 + id_len])? as usize;
    let data_start = 2 + id_len;
    if dlc > 8 || buf.len() < data_start + dlc * 2 {
        return Err(SlCanError::DecodingFailed);
    }
    let mut data = [0u8; 8];
    for (i, d) in data.iter_mut().take(dlc).enumerate() {
        *d = hex_to_byte(buf[data_start + i * 2])? << 4 | hex_to_byte(buf[data_start + i * 2 + 1])?;
    }
    Ok(SlCanLine::CanFrame(CanFrame::new(id, &data[..dlc], ext)))
}

pub(crate) fn get_speed_cmd(can_speed: u32) -> SlCanResult<[u8; 3]> {
    match can_speed {
        10_000 => Ok(*b"S0\r"),
        20_000 => Ok(*b"S1\r"),
        50_000 => Ok(*b"S2\r"),
        100_000 => Ok(*b"S3\r"),
        125_000 => Ok(*b"S4\r"),
        250_000 => Ok(*b"S5\r"),
        500_000 => Ok(*b"S6\r"),
        800_000 => Ok(*b"S7\r"),
        1_000_000 => Ok(*b"S8\r"),
        83_333 => Ok(*b"S9\r"), // Vendor extension, not in the Lawicel command set
        _ => Err(SlCanError::UnsupportedSpeed(can_speed)),
    }
}

fn convert_io_error(error: std::io::Error) -> SlCanError {
    SlCanError::IOError(Arc::new(error))
}

fn hex_to_byte(hex: u8) -> SlCanResult<u8> {
    match hex {
        b'0'..=b'9' => Ok(hex - b'0'),
        b'a'..=b'f' => Ok(hex - b'a' + 10),
        b'A'..=b'F' => Ok(hex - b'A' + 10),
        _ => Err(SlCanError::DecodingFailed),
    }
}

impl From<SlCanError> for ChannelError {
    fn from(value: SlCanError) -> Self {
        match value {
            SlCanError::IOError(err) => ChannelError::IOError(err),
            SlCanError::ReadTimeout => ChannelError::ReadTimeout,
            SlCanError::RxBufferFull => ChannelError::BufferFull,
            _ => ChannelError::APIError {
                api_name: "slcan".into(),
                code: 0,
                desc: value.to_string(),
            },
        }
    }
}
