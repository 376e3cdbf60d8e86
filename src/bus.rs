//! Shared CAN bus
//!
//! The [CanBus] is the single owner of the frame level device and of every registered
//! ISO-TP listener. Channels only hold a reference to the bus and a [ListenerId].
//! Everything runs on the calling thread, there is no background reader.

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    time::Duration,
};

use crate::{
    addressing::CanAddress,
    channel::{CanChannel, CanFrame, ChannelResult, IsoTPSettings, Packet},
    hardware::software_isotp::{FlowControl, IsoTpListener},
};

/// Handle of a listener registered with a [CanBus]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u32);

/// Maximum frames taken from the device per pump
const FRAMES_PER_PUMP: usize = 100;
/// Upper bound of zero wait reads when discarding, so a busy bus cannot stall a request
const MAX_DISCARD_READS: usize = 64;

/// CAN bus shared by all channels of a run
pub struct CanBus {
    device: RefCell<Box<dyn CanChannel>>,
    listeners: RefCell<BTreeMap<ListenerId, IsoTpListener>>,
    next_id: Cell<u32>,
}

impl std::fmt::Debug for CanBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanBus")
            .field("listeners", &self.listeners.borrow().len())
            .finish()
    }
}

impl CanBus {
    /// Configures and opens the device
    pub fn open(mut device: Box<dyn CanChannel>, bitrate: u32, extended: bool) -> ChannelResult<Self> {
        device.set_can_cfg(bitrate, extended)?;
        device.open()?;
        device.clear_rx_buffer()?;
        log::debug!("CAN bus open at {bitrate} bps");
        Ok(Self {
            device: RefCell::new(device),
            listeners: RefCell::new(BTreeMap::new()),
            next_id: Cell::new(0),
        })
    }

    /// Registers a listener for an endpoint
    pub fn register(&self, address: CanAddress, settings: IsoTPSettings) -> ListenerId {
        let id = ListenerId(self.next_id.get());
        self.next_id.set(self.next_id.get().wrapping_add(1));
        self.listeners
            .borrow_mut()
            .insert(id, IsoTpListener::new(address, settings));
        log::trace!("Listener {id:?} registered on 0x{:X}", address.rx_can_id());
        id
    }

    /// Removes a listener. Payloads it had not handed out are discarded
    pub fn deregister(&self, id: ListenerId) {
        if self.listeners.borrow_mut().remove(&id).is_some() {
            log::trace!("Listener {id:?} deregistered");
        }
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }

    /// Reads whatever the device has (waiting up to `timeout` for the first frame)
    /// and hands every frame to the listeners it is addressed to
    pub fn pump(&self, timeout: Duration) -> ChannelResult<()> {
        let timeout_ms = timeout.as_millis().min(u32::MAX as u128) as u32;
        let frames = self
            .device
            .borrow_mut()
            .read_packets(FRAMES_PER_PUMP, timeout_ms)?;
        let mut replies = Vec::new();
        {
            let mut listeners = self.listeners.borrow_mut();
            for frame in &frames {
                let mut delivered = false;
                for l in listeners.values_mut().filter(|l| l.accepts(frame)) {
                    delivered = true;
                    if let Some(fc) = l.on_frame(frame) {
                        replies.push(fc);
                    }
                }
                if !delivered {
                    log::trace!("Dropping frame without listener {frame:?}");
                }
            }
            listeners.values_mut().for_each(|l| l.check_timeout());
        }
        for fc in replies {
            log::debug!("ISOTP Tx flow control {fc:?}");
            self.write_frame(fc)?;
        }
        Ok(())
    }

    /// Drops every frame the device already holds, without waiting for more.
    /// Returns the number of frames dropped. Listeners see none of them
    pub fn discard_pending(&self) -> ChannelResult<usize> {
        let mut device = self.device.borrow_mut();
        let mut dropped = 0;
        for _ in 0..MAX_DISCARD_READS {
            let frames = device.read_packets(FRAMES_PER_PUMP, 0)?;
            if frames.is_empty() {
                break;
            }
            dropped += frames.len();
        }
        device.clear_rx_buffer()?;
        if dropped != 0 {
            log::debug!("Discarded {dropped} stale frames");
        }
        Ok(dropped)
    }

    /// Takes the oldest completed payload of a listener
    pub fn take_payload(&self, id: ListenerId) -> Option<Vec<u8>> {
        self.listeners
            .borrow_mut()
            .get_mut(&id)
            .and_then(|l| l.take_payload())
    }

    /// Takes the oldest flow control frame received by a listener
    pub fn take_flow_control(&self, id: ListenerId) -> Option<FlowControl> {
        self.listeners
            .borrow_mut()
            .get_mut(&id)
            .and_then(|l| l.take_flow_control())
    }

    pub(crate) fn clear_flow_control(&self, id: ListenerId) {
        if let Some(l) = self.listeners.borrow_mut().get_mut(&id) {
            l.clear_flow_control();
        }
    }

    /// Writes one frame to the device
    pub fn write_frame(&self, frame: CanFrame) -> ChannelResult<()> {
        log::trace!("CAN Tx 0x{:X}: {:02X?}", frame.get_address(), frame.get_data());
        self.device.borrow_mut().write_packets(vec![frame], 0)
    }

    /// Closes the device
    pub fn shutdown(self) -> ChannelResult<()> {
        let count = self.listener_count();
        if count != 0 {
            log::warn!("Shutting down bus with {count} listeners still registered");
        }
        let mut device = self.device.into_inner();
        device.close()?;
        log::debug!("CAN bus shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::simulation::{ScriptedResponse, SimulatedCanDevice, SimulatedEcu};

    fn address() -> CanAddress {
        CanAddress::Normal11Bit {
            tx_id: 0x7E0,
            rx_id: 0x7E8,
        }
    }

    #[test]
    fn discarded_frames_never_reach_listeners() {
        let ecu = SimulatedEcu::normal_11bit("ecu", 0x7E0, 0x7E8)
            .on_request(|_| vec![ScriptedResponse::now(&[0x62, 0xFA, 0x13, 0x01])]);
        let bus = CanBus::open(
            Box::new(SimulatedCanDevice::new().with_ecu(ecu)),
            500_000,
            false,
        )
        .unwrap();
        bus.write_frame(CanFrame::new(0x7E0, &[0x03, 0x22, 0xFA, 0x13], false))
            .unwrap();

        assert_eq!(bus.discard_pending().unwrap(), 1);
        let id = bus.register(address(), IsoTPSettings::default());
        bus.pump(Duration::from_millis(20)).unwrap();
        assert_eq!(bus.take_payload(id), None);
        assert_eq!(bus.discard_pending().unwrap(), 0);
    }

    #[test]
    fn pumped_frames_go_to_matching_listener_only() {
        let ecu = SimulatedEcu::normal_11bit("ecu", 0x7E0, 0x7E8)
            .on_request(|_| vec![ScriptedResponse::now(&[0x62, 0xFA, 0x13, 0x01])]);
        let bus = CanBus::open(
            Box::new(SimulatedCanDevice::new().with_ecu(ecu)),
            500_000,
            false,
        )
        .unwrap();
        let id = bus.register(address(), IsoTPSettings::default());
        let other = bus.register(
            CanAddress::Normal11Bit {
                tx_id: 0x7E1,
                rx_id: 0x7E9,
            },
            IsoTPSettings::default(),
        );
        bus.write_frame(CanFrame::new(0x7E0, &[0x03, 0x22, 0xFA, 0x13], false))
            .unwrap();
        bus.pump(Duration::from_millis(20)).unwrap();
        assert_eq!(bus.take_payload(id), Some(vec![0x62, 0xFA, 0x13, 0x01]));
        assert_eq!(bus.take_payload(other), None);

        bus.deregister(id);
        bus.deregister(other);
        assert_eq!(bus.listener_count(), 0);
        bus.shutdown().unwrap();
    }
}
