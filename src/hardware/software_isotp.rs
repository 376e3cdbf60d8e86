//! Software ISOTP layer
//!
//! ISO 15765-2 segmentation and reassembly on top of a [CanBus]. Reception runs
//! inside [CanBus::pump], so flow control for a multi frame response is sent as
//! soon as the first frame is seen, regardless of which channel is being polled.

use std::{
    cmp::min,
    collections::VecDeque,
    time::{Duration, Instant},
};

use crate::{
    addressing::{AddressSpec, CanAddress},
    bus::{CanBus, ListenerId},
    channel::{CanFrame, ChannelError, ChannelResult, IsoTPSettings, Packet, TargetAddressType},
};

/// Largest payload an ISO-TP (classic CAN) first frame can announce
pub const MAX_ISOTP_PAYLOAD: usize = 4095;

const PCI_SINGLE: u8 = 0x00;
const PCI_FIRST: u8 = 0x10;
const PCI_CONSECUTIVE: u8 = 0x20;
const PCI_FLOW_CONTROL: u8 = 0x30;

/// Flow status sent or received in a flow control frame
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FlowStatus {
    /// Continue to send
    ContinueToSend,
    /// Receiver is busy, wait for another flow control
    Wait,
    /// Payload is too large for the receiver
    Overflow,
}

/// Flow control frame received for one of our own transmissions
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FlowControl {
    /// Flow status
    pub status: FlowStatus,
    /// Number of consecutive frames before the next flow control (0 = all)
    pub block_size: u8,
    /// Raw STmin byte
    pub st_min: u8,
}

impl FlowControl {
    fn parse(data: &[u8]) -> Option<Self> {
        let status = match data.first()? & 0x0F {
            0 => FlowStatus::ContinueToSend,
            1 => FlowStatus::Wait,
            2 => FlowStatus::Overflow,
            _ => return None,
        };
        Some(Self {
            status,
            block_size: data.get(1).copied().unwrap_or(0),
            st_min: data.get(2).copied().unwrap_or(0),
        })
    }

    fn encode(&self) -> [u8; 3] {
        let status = match self.status {
            FlowStatus::ContinueToSend => 0,
            FlowStatus::Wait => 1,
            FlowStatus::Overflow => 2,
        };
        [PCI_FLOW_CONTROL | status, self.block_size, self.st_min]
    }
}

/// Converts a raw STmin byte into a separation time.
/// Reserved values are treated as the maximum (127ms)
pub fn st_min_duration(st_min: u8) -> Duration {
    match st_min {
        0x00..=0x7F => Duration::from_millis(st_min as u64),
        0xF1..=0xF9 => Duration::from_micros((st_min - 0xF0) as u64 * 100),
        _ => Duration::from_millis(0x7F),
    }
}

fn padded(mut data: Vec<u8>, cfg: &IsoTPSettings) -> Vec<u8> {
    if cfg.pad_frame {
        data.resize(8, cfg.padding_byte);
    }
    data
}

struct IsoTpRxMemory {
    last_rx_time: Instant,
    receiving: bool,
    frames_received: usize,
    next_sn: u8,
    data: Vec<u8>,
    max_size: usize,
}

impl Default for IsoTpRxMemory {
    fn default() -> Self {
        Self {
            last_rx_time: Instant::now(),
            receiving: false,
            frames_received: 0,
            next_sn: 1,
            data: vec![],
            max_size: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum IsoTpRxAction {
    None,
    Completed(Vec<u8>),
    SendFC(FlowControl),
}

impl IsoTpRxMemory {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn add_single_frame(&mut self, s: &[u8]) -> IsoTpRxAction {
        let len = (s[0] & 0x0F) as usize;
        if len == 0 || len > s.len() - 1 {
            log::warn!("Invalid ISOTP single frame length {len}: {s:02X?}");
            return IsoTpRxAction::None;
        }
        if self.receiving {
            log::warn!("Single frame interrupted multi frame reception");
            self.reset();
        }
        IsoTpRxAction::Completed(s[1..1 + len].to_vec())
    }

    fn add_start_frame(&mut self, s: &[u8], cfg: &IsoTPSettings) -> IsoTpRxAction {
        if s.len() < 8 {
            log::warn!("ISOTP first frame too short: {s:02X?}");
            return IsoTpRxAction::None;
        }
        let size = (((s[0] & 0x0F) as usize) << 8) | s[1] as usize;
        if size < 8 {
            log::warn!("ISOTP first frame announces {size} bytes, ignoring");
            return IsoTpRxAction::None;
        }
        if self.receiving {
            log::warn!("New first frame restarts multi frame reception");
        }
        self.reset();
        if size > min(cfg.max_frame_size, MAX_ISOTP_PAYLOAD) {
            log::warn!("ISOTP payload of {size} bytes exceeds receive limit");
            return IsoTpRxAction::SendFC(FlowControl {
                status: FlowStatus::Overflow,
                block_size: 0,
                st_min: 0,
            });
        }
        self.max_size = size;
        self.receiving = true;
        self.data.extend_from_slice(&s[2..8]);
        self.last_rx_time = Instant::now();
        IsoTpRxAction::SendFC(FlowControl {
            status: FlowStatus::ContinueToSend,
            block_size: cfg.block_size,
            st_min: cfg.st_min,
        })
    }

    fn add_consecutive_frame(&mut self, s: &[u8], cfg: &IsoTPSettings) -> IsoTpRxAction {
        if !self.receiving {
            log::trace!("Consecutive frame without first frame, ignoring");
            return IsoTpRxAction::None;
        }
        let sn = s[0] & 0x0F;
        if sn != self.next_sn {
            log::warn!(
                "ISOTP sequence error. Expected {}, got {sn}. Aborting reception",
                self.next_sn
            );
            self.reset();
            return IsoTpRxAction::None;
        }
        self.next_sn = (self.next_sn + 1) & 0x0F;
        let max_copy = min(self.max_size - self.data.len(), min(7, s.len() - 1));
        self.data.extend_from_slice(&s[1..1 + max_copy]);
        self.frames_received += 1;
        self.last_rx_time = Instant::now();
        if self.data.len() == self.max_size {
            let payload = std::mem::take(&mut self.data);
            self.reset();
            IsoTpRxAction::Completed(payload)
        } else if cfg.block_size != 0 && self.frames_received == cfg.block_size as usize {
            self.frames_received = 0;
            IsoTpRxAction::SendFC(FlowControl {
                status: FlowStatus::ContinueToSend,
                block_size: cfg.block_size,
                st_min: cfg.st_min,
            })
        } else {
            IsoTpRxAction::None
        }
    }
}

/// Per channel receive state, owned by the [CanBus] listener registry
pub(crate) struct IsoTpListener {
    address: CanAddress,
    settings: IsoTPSettings,
    rx: IsoTpRxMemory,
    completed: VecDeque<Vec<u8>>,
    flow_control: VecDeque<FlowControl>,
}

impl std::fmt::Debug for IsoTpListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsoTpListener")
            .field("address", &self.address)
            .field("receiving", &self.rx.receiving)
            .field("completed", &self.completed.len())
            .finish()
    }
}

impl IsoTpListener {
    pub(crate) fn new(address: CanAddress, settings: IsoTPSettings) -> Self {
        Self {
            address,
            settings,
            rx: IsoTpRxMemory::default(),
            completed: VecDeque::new(),
            flow_control: VecDeque::new(),
        }
    }

    /// Returns true if a frame is addressed to this listener
    pub(crate) fn accepts(&self, frame: &CanFrame) -> bool {
        frame.get_address() == self.address.rx_can_id()
            && frame.is_extended() == self.address.is_extended()
    }

    /// Processes one received frame. Returns a flow control frame to send, if any
    pub(crate) fn on_frame(&mut self, frame: &CanFrame) -> Option<CanFrame> {
        let data = frame.get_data();
        let Some(pci) = data.first() else {
            log::warn!("ISOTP CAN frame too short! {frame:?}");
            return None;
        };
        let action = match pci & 0xF0 {
            PCI_SINGLE => {
                log::debug!("ISOTP single frame {data:02X?}");
                self.rx.add_single_frame(data)
            }
            PCI_FIRST => {
                log::debug!("ISOTP first frame {data:02X?}");
                self.rx.add_start_frame(data, &self.settings)
            }
            PCI_CONSECUTIVE => {
                log::debug!("ISOTP consecutive frame {data:02X?}");
                self.rx.add_consecutive_frame(data, &self.settings)
            }
            PCI_FLOW_CONTROL => {
                log::debug!("ISOTP flow control {data:02X?}");
                match FlowControl::parse(data) {
                    Some(fc) => self.flow_control.push_back(fc),
                    None => log::warn!("Invalid flow status in {frame:?}"),
                }
                IsoTpRxAction::None
            }
            _ => {
                log::warn!("Invalid ISOTP CAN frame! {frame:?}");
                IsoTpRxAction::None
            }
        };
        match action {
            IsoTpRxAction::None => None,
            IsoTpRxAction::Completed(payload) => {
                log::debug!(
                    "ISOTP Rx done on 0x{:X}: {payload:02X?}",
                    self.address.rx_can_id()
                );
                self.completed.push_back(payload);
                None
            }
            IsoTpRxAction::SendFC(fc) => Some(CanFrame::new(
                self.address.flow_control_can_id(),
                &padded(fc.encode().to_vec(), &self.settings),
                self.address.is_extended(),
            )),
        }
    }

    /// Abandons a multi frame reception the sender stopped servicing
    pub(crate) fn check_timeout(&mut self) {
        if self.rx.receiving
            && self.rx.last_rx_time.elapsed()
                > Duration::from_millis(self.settings.rx_consecutive_frame_timeout_ms as u64)
        {
            log::warn!(
                "ISOTP consecutive frame timeout on 0x{:X}",
                self.address.rx_can_id()
            );
            self.rx.reset();
        }
    }

    pub(crate) fn take_payload(&mut self) -> Option<Vec<u8>> {
        self.completed.pop_front()
    }

    pub(crate) fn take_flow_control(&mut self) -> Option<FlowControl> {
        self.flow_control.pop_front()
    }

    pub(crate) fn clear_flow_control(&mut self) {
        self.flow_control.clear();
    }
}

/// Software ISOTP channel for one [AddressSpec].
///
/// The channel holds a non owning reference to the bus. [SoftwareIsoTpChannel::start] registers
/// it as a listener and [SoftwareIsoTpChannel::stop] removes it. A started channel is stopped
/// when dropped, so a channel can never outlive the scope it was started in.
pub struct SoftwareIsoTpChannel<'bus> {
    bus: &'bus CanBus,
    spec: AddressSpec,
    settings: IsoTPSettings,
    listener: Option<ListenerId>,
}

impl std::fmt::Debug for SoftwareIsoTpChannel<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareIsoTpChannel")
            .field("spec", &self.spec)
            .field("listener", &self.listener)
            .finish()
    }
}

impl Drop for SoftwareIsoTpChannel<'_> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<'bus> SoftwareIsoTpChannel<'bus> {
    /// Creates a stopped channel
    pub fn new(bus: &'bus CanBus, spec: AddressSpec, settings: IsoTPSettings) -> Self {
        Self {
            bus,
            spec,
            settings,
            listener: None,
        }
    }

    /// Endpoint of this channel
    pub fn spec(&self) -> &AddressSpec {
        &self.spec
    }

    /// Starts listening. Frames already handed out by [CanBus::pump] are not delivered,
    /// frames still queued in the device are. See [CanBus::discard_pending]
    pub fn start(&mut self) {
        if self.listener.is_none() {
            self.listener = Some(self.bus.register(self.spec.address, self.settings));
        }
    }

    /// Stops listening and discards anything not yet read
    pub fn stop(&mut self) {
        if let Some(id) = self.listener.take() {
            self.bus.deregister(id);
        }
    }

    fn listener(&self) -> ChannelResult<ListenerId> {
        self.listener.ok_or(ChannelError::InterfaceNotOpen)
    }

    /// Receives one complete payload, waiting up to `timeout`.
    /// `Ok(None)` means nothing arrived in time
    pub fn recv(&self, timeout: Duration) -> ChannelResult<Option<Vec<u8>>> {
        let id = self.listener()?;
        let start = Instant::now();
        loop {
            if let Some(p) = self.bus.take_payload(id) {
                return Ok(Some(p));
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Ok(None);
            }
            self.bus.pump(timeout - elapsed)?;
        }
    }

    /// Sends a payload. Multi frame payloads wait for flow control from the receiver
    pub fn send(&self, payload: &[u8], target: TargetAddressType) -> ChannelResult<()> {
        let id = self.listener()?;
        let addr = self.spec.address;
        let tx_id = addr.tx_can_id(target);
        let ext = addr.is_extended();
        if payload.is_empty() {
            return Err(ChannelError::Other("cannot send an empty ISOTP payload".into()));
        }
        if payload.len() <= 7 {
            let mut sf = Vec::with_capacity(8);
            sf.push(payload.len() as u8);
            sf.extend_from_slice(payload);
            log::debug!("ISOTP Tx on 0x{tx_id:X} ({target}): {payload:02X?}");
            return self
                .bus
                .write_frame(CanFrame::new(tx_id, &padded(sf, &self.settings), ext));
        }
        if target == TargetAddressType::Functional {
            log::error!("Multi frame ISOTP transmission is not possible with functional addressing");
            return Err(ChannelError::UnsupportedRequest);
        }
        if payload.len() > MAX_ISOTP_PAYLOAD {
            return Err(ChannelError::UnsupportedRequest);
        }
        self.bus.clear_flow_control(id);

        let mut ff = vec![
            PCI_FIRST | ((payload.len() >> 8) & 0x0F) as u8,
            (payload.len() & 0xFF) as u8,
        ];
        ff.extend_from_slice(&payload[..6]);
        log::debug!("ISOTP Tx on 0x{tx_id:X}: first frame of {} bytes", payload.len());
        self.bus.write_frame(CanFrame::new(tx_id, &ff, ext))?;

        let mut pos = 6;
        let mut sn = 1u8;
        while pos < payload.len() {
            let fc = self.await_flow_control(id)?;
            let st_min = st_min_duration(fc.st_min);
            let mut sent_in_block = 0usize;
            while pos < payload.len() {
                if sent_in_block > 0 && !st_min.is_zero() {
                    std::thread::sleep(st_min);
                }
                let max_data = min(7, payload.len() - pos);
                let mut cf = Vec::with_capacity(8);
                cf.push(PCI_CONSECUTIVE | sn);
                cf.extend_from_slice(&payload[pos..pos + max_data]);
                self.bus
                    .write_frame(CanFrame::new(tx_id, &padded(cf, &self.settings), ext))?;
                pos += max_data;
                sn = (sn + 1) & 0x0F;
                sent_in_block += 1;
                if fc.block_size != 0 && sent_in_block == fc.block_size as usize {
                    break;
                }
            }
        }
        log::debug!("ISOTP Tx done!");
        Ok(())
    }

    fn await_flow_control(&self, id: ListenerId) -> ChannelResult<FlowControl> {
        let timeout = Duration::from_millis(self.settings.rx_flow_control_timeout_ms as u64);
        let mut waits = 0u8;
        let mut start = Instant::now();
        loop {
            if let Some(fc) = self.bus.take_flow_control(id) {
                match fc.status {
                    FlowStatus::ContinueToSend => return Ok(fc),
                    FlowStatus::Overflow => {
                        log::error!("Receiver reported overflow, aborting transmission");
                        return Err(ChannelError::BufferFull);
                    }
                    FlowStatus::Wait => {
                        waits += 1;
                        if waits > self.settings.wft_max {
                            log::error!("Receiver sent too many wait frames ({waits})");
                            return Err(ChannelError::WriteTimeout);
                        }
                        start = Instant::now();
                        continue;
                    }
                }
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                log::error!("Awaiting FC timed out after {}ms", elapsed.as_millis());
                return Err(ChannelError::WriteTimeout);
            }
            self.bus.pump(min(timeout - elapsed, Duration::from_millis(10)))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> IsoTPSettings {
        IsoTPSettings::default()
    }

    fn listener() -> IsoTpListener {
        IsoTpListener::new(
            CanAddress::Normal11Bit {
                tx_id: 0x7E0,
                rx_id: 0x7E8,
            },
            cfg(),
        )
    }

    #[test]
    fn st_min_conversion() {
        assert_eq!(st_min_duration(0), Duration::ZERO);
        assert_eq!(st_min_duration(0x14), Duration::from_millis(20));
        assert_eq!(st_min_duration(0xF3), Duration::from_micros(300));
        assert_eq!(st_min_duration(0x80), Duration::from_millis(127));
    }

    #[test]
    fn single_frame_is_completed() {
        let mut l = listener();
        let fc = l.on_frame(&CanFrame::new(0x7E8, &[0x03, 0x7F, 0x22, 0x78, 0, 0, 0, 0], false));
        assert!(fc.is_none());
        assert_eq!(l.take_payload(), Some(vec![0x7F, 0x22, 0x78]));
        assert_eq!(l.take_payload(), None);
    }

    #[test]
    fn invalid_single_frame_length_is_dropped() {
        let mut l = listener();
        l.on_frame(&CanFrame::new(0x7E8, &[0x07, 0x62, 0xFA], false));
        l.on_frame(&CanFrame::new(0x7E8, &[0x00, 0, 0, 0, 0, 0, 0, 0], false));
        assert_eq!(l.take_payload(), None);
    }

    #[test]
    fn multi_frame_reassembly_sends_flow_control() {
        let mut l = listener();
        let fc = l
            .on_frame(&CanFrame::new(
                0x7E8,
                &[0x10, 0x0A, 0x62, 0xFA, 0x13, 1, 2, 3],
                false,
            ))
            .expect("flow control");
        assert_eq!(fc.get_address(), 0x7E0);
        assert_eq!(fc.get_data(), &[0x30, 0, 0, 0, 0, 0, 0, 0]);
        assert!(l.on_frame(&CanFrame::new(0x7E8, &[0x21, 4, 5, 6, 7, 0, 0, 0], false)).is_none());
        assert_eq!(
            l.take_payload(),
            Some(vec![0x62, 0xFA, 0x13, 1, 2, 3, 4, 5, 6, 7])
        );
    }

    #[test]
    fn sequence_error_aborts_reception() {
        let mut l = listener();
        l.on_frame(&CanFrame::new(0x7E8, &[0x10, 0x10, 1, 2, 3, 4, 5, 6], false));
        l.on_frame(&CanFrame::new(0x7E8, &[0x22, 7, 8, 9, 10, 11, 12, 13], false));
        l.on_frame(&CanFrame::new(0x7E8, &[0x21, 7, 8, 9, 10, 11, 12, 13], false));
        assert_eq!(l.take_payload(), None);
    }

    #[test]
    fn oversize_first_frame_answers_overflow() {
        let mut l = IsoTpListener::new(
            CanAddress::Normal11Bit {
                tx_id: 0x7E0,
                rx_id: 0x7E8,
            },
            IsoTPSettings {
                max_frame_size: 16,
                ..cfg()
            },
        );
        let fc = l
            .on_frame(&CanFrame::new(0x7E8, &[0x10, 0x20, 1, 2, 3, 4, 5, 6], false))
            .expect("flow control");
        assert_eq!(fc.get_data()[0], 0x32);
    }

    #[test]
    fn block_size_requests_another_flow_control() {
        let mut l = IsoTpListener::new(
            CanAddress::NormalFixed29Bit {
                target_address: 0x10,
                source_address: 0xF1,
            },
            IsoTPSettings {
                block_size: 1,
                pad_frame: false,
                ..cfg()
            },
        );
        let first = CanFrame::new(0x18DA_F110, &[0x10, 0x14, 1, 2, 3, 4, 5, 6], true);
        assert!(l.accepts(&first));
        let fc = l.on_frame(&first).expect("flow control");
        assert_eq!(fc.get_address(), 0x18DA_10F1);
        assert!(fc.is_extended());
        assert_eq!(fc.get_data(), &[0x30, 1, 0]);
        let fc = l.on_frame(&CanFrame::new(0x18DA_F110, &[0x21, 7, 8, 9, 10, 11, 12, 13], true));
        assert!(fc.is_some());
    }

    #[test]
    fn flow_control_is_queued_for_sender() {
        let mut l = listener();
        l.on_frame(&CanFrame::new(0x7E8, &[0x31, 0, 0, 0, 0, 0, 0, 0], false));
        l.on_frame(&CanFrame::new(0x7E8, &[0x30, 2, 5, 0, 0, 0, 0, 0], false));
        assert_eq!(
            l.take_flow_control().map(|f| f.status),
            Some(FlowStatus::Wait)
        );
        assert_eq!(
            l.take_flow_control(),
            Some(FlowControl {
                status: FlowStatus::ContinueToSend,
                block_size: 2,
                st_min: 5
            })
        );
    }

    #[test]
    fn standard_frames_ignored_by_extended_listener() {
        let l = IsoTpListener::new(
            CanAddress::NormalFixed29Bit {
                target_address: 0x10,
                source_address: 0xF1,
            },
            cfg(),
        );
        assert!(!l.accepts(&CanFrame::new(0x18DA_F110, &[0x01, 0x50], false)));
    }
}
