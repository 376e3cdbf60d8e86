//! Virtual CAN device with simulated ECUs
//!
//! Used for testing the reader without hardware, and by `--interface virtual`.
//! Each [SimulatedEcu] answers single frame requests through a handler, segmenting
//! long responses and honouring the tester's flow control like a real ECU would.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use crate::channel::{
    CanChannel, CanFrame, ChannelError, ChannelResult, Packet, PacketChannel,
};

/// A response the ECU sends some time after a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedResponse {
    /// Delay after the request (or after the previous response)
    pub delay: Duration,
    /// Application payload
    pub payload: Vec<u8>,
}

impl ScriptedResponse {
    /// Response sent without delay
    pub fn now(payload: &[u8]) -> Self {
        Self::after(Duration::ZERO, payload)
    }

    /// Response sent after a delay
    pub fn after(delay: Duration, payload: &[u8]) -> Self {
        Self {
            delay,
            payload: payload.to_vec(),
        }
    }
}

type RequestHandler = Box<dyn FnMut(&[u8]) -> Vec<ScriptedResponse> + Send>;

struct EcuTx {
    data: Vec<u8>,
    pos: usize,
    sn: u8,
}

/// Simulated ECU attached to a [SimulatedCanDevice]
pub struct SimulatedEcu {
    name: String,
    physical_id: u32,
    functional_ids: Vec<u32>,
    response_id: u32,
    extended: bool,
    handler: RequestHandler,
    tx: Option<EcuTx>,
}

impl std::fmt::Debug for SimulatedEcu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedEcu")
            .field("name", &self.name)
            .field("physical_id", &format_args!("0x{:X}", self.physical_id))
            .field("response_id", &format_args!("0x{:X}", self.response_id))
            .finish()
    }
}

impl SimulatedEcu {
    /// ECU using 11bit identifiers
    pub fn normal_11bit(name: &str, request_id: u32, response_id: u32) -> Self {
        Self {
            name: name.into(),
            physical_id: request_id,
            functional_ids: Vec::new(),
            response_id,
            extended: false,
            handler: Box::new(|_| Vec::new()),
            tx: None,
        }
    }

    /// ECU using 29bit normal fixed identifiers. Answers functional requests sent
    /// to target address 0xFF by `tester_address`
    pub fn normal_fixed_29bit(name: &str, ecu_address: u8, tester_address: u8) -> Self {
        let (ecu, tester) = (ecu_address as u32, tester_address as u32);
        Self {
            name: name.into(),
            physical_id: 0x18DA_0000 | ecu << 8 | tester,
            functional_ids: vec![0x18DB_FF00 | tester],
            response_id: 0x18DA_0000 | tester << 8 | ecu,
            extended: true,
            handler: Box::new(|_| Vec::new()),
            tx: None,
        }
    }

    /// Also accept requests sent to a functional CAN ID
    pub fn listen_functional(mut self, id: u32) -> Self {
        self.functional_ids.push(id);
        self
    }

    /// Sets the request handler
    pub fn on_request<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<ScriptedResponse> + Send + 'static,
    {
        self.handler = Box::new(handler);
        self
    }

    fn accepts_request(&self, frame: &CanFrame) -> bool {
        frame.is_extended() == self.extended
            && (frame.get_address() == self.physical_id
                || self.functional_ids.contains(&frame.get_address()))
    }

    fn frame(&self, data: &[u8]) -> CanFrame {
        let mut buf = data.to_vec();
        buf.resize(8, 0x00);
        CanFrame::new(self.response_id, &buf, self.extended)
    }

    /// Frames that start sending a payload
    fn begin_response(&mut self, payload: &[u8]) -> Vec<CanFrame> {
        if payload.len() <= 7 {
            let mut sf = vec![payload.len() as u8];
            sf.extend_from_slice(payload);
            vec![self.frame(&sf)]
        } else {
            let mut ff = vec![0x10 | (payload.len() >> 8) as u8 & 0x0F, payload.len() as u8];
            ff.extend_from_slice(&payload[..6]);
            self.tx = Some(EcuTx {
                data: payload.to_vec(),
                pos: 6,
                sn: 1,
            });
            vec![self.frame(&ff)]
        }
    }

    /// Consecutive frames sent after a flow control
    fn on_flow_control(&mut self, data: &[u8]) -> Vec<CanFrame> {
        if data.first().map(|b| b & 0x0F) != Some(0) {
            return Vec::new();
        }
        let bs = data.get(1).copied().unwrap_or(0) as usize;
        let Some(mut tx) = self.tx.take() else {
            return Vec::new();
        };
        let mut frames = Vec::new();
        while tx.pos < tx.data.len() && (bs == 0 || frames.len() < bs) {
            let end = (tx.pos + 7).min(tx.data.len());
            let mut cf = vec![0x20 | tx.sn];
            cf.extend_from_slice(&tx.data[tx.pos..end]);
            frames.push(self.frame(&cf));
            tx.pos = end;
            tx.sn = (tx.sn + 1) & 0x0F;
        }
        if tx.pos < tx.data.len() {
            self.tx = Some(tx);
        }
        frames
    }
}

/// Fault injected into a [SimulatedCanDevice]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SimulatedFault {
    /// Every write fails
    Write,
    /// Every read fails
    Read,
}

enum Pending {
    Frame(CanFrame),
    Response { ecu: usize, payload: Vec<u8> },
}

struct SimState {
    ecus: Vec<SimulatedEcu>,
    scheduled: Vec<(Instant, Pending)>,
    rx_queue: VecDeque<CanFrame>,
    tx_log: Arc<Mutex<Vec<CanFrame>>>,
    fault: Option<SimulatedFault>,
    cfg: Option<(u32, bool)>,
    open: bool,
}

/// Virtual CAN device. Frames written by the tester are delivered to the simulated ECUs,
/// never back to the tester
pub struct SimulatedCanDevice {
    state: SimState,
}

impl std::fmt::Debug for SimulatedCanDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedCanDevice")
            .field("ecus", &self.state.ecus)
            .field("open", &self.state.open)
            .finish()
    }
}

impl Default for SimulatedCanDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCanDevice {
    /// Empty virtual bus
    pub fn new() -> Self {
        Self {
            state: SimState {
                ecus: Vec::new(),
                scheduled: Vec::new(),
                rx_queue: VecDeque::new(),
                tx_log: Arc::new(Mutex::new(Vec::new())),
                fault: None,
                cfg: None,
                open: false,
            },
        }
    }

    /// Attaches an ECU
    pub fn with_ecu(mut self, ecu: SimulatedEcu) -> Self {
        self.state.ecus.push(ecu);
        self
    }

    /// Injects a fault
    pub fn with_fault(mut self, fault: SimulatedFault) -> Self {
        self.state.fault = Some(fault);
        self
    }

    /// Shared log of every frame written by the tester
    pub fn tx_log(&self) -> Arc<Mutex<Vec<CanFrame>>> {
        self.state.tx_log.clone()
    }

    fn ensure_open(&self) -> ChannelResult<()> {
        if self.state.open {
            Ok(())
        } else {
            Err(ChannelError::InterfaceNotOpen)
        }
    }

    fn deliver(&mut self, frame: CanFrame) {
        let now = Instant::now();
        let state = &mut self.state;
        for idx in 0..state.ecus.len() {
            let ecu = &mut state.ecus[idx];
            if !ecu.accepts_request(&frame) {
                continue;
            }
            let data = frame.get_data();
            match data.first().map(|b| b & 0xF0) {
                Some(0x00) => {
                    let len = (data[0] & 0x0F) as usize;
                    if len == 0 || len >= data.len() {
                        continue;
                    }
                    let mut at = now;
                    for resp in (ecu.handler)(&data[1..1 + len]) {
                        at += resp.delay;
                        state.scheduled.push((
                            at,
                            Pending::Response {
                                ecu: idx,
                                payload: resp.payload,
                            },
                        ));
                    }
                }
                Some(0x30) if frame.get_address() == ecu.physical_id => {
                    for f in ecu.on_flow_control(data) {
                        state.scheduled.push((now, Pending::Frame(f)));
                    }
                }
                _ => {}
            }
        }
    }

    fn collect_due(&mut self) {
        let now = Instant::now();
        let state = &mut self.state;
        // Stable ordering keeps responses of equal due time in scheduling order
        state.scheduled.sort_by_key(|(at, _)| *at);
        let split = state.scheduled.partition_point(|(at, _)| *at <= now);
        let due: Vec<(Instant, Pending)> = state.scheduled.drain(..split).collect();
        for (_, pending) in due {
            match pending {
                Pending::Frame(f) => state.rx_queue.push_back(f),
                Pending::Response { ecu, payload } => {
                    let frames = state.ecus[ecu].begin_response(&payload);
                    state.rx_queue.extend(frames);
                }
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.state.scheduled.iter().map(|(at, _)| *at).min()
    }
}

impl PacketChannel<CanFrame> for SimulatedCanDevice {
    fn open(&mut self) -> ChannelResult<()> {
        if self.state.cfg.is_none() {
            return Err(ChannelError::ConfigurationError);
        }
        self.state.open = true;
        Ok(())
    }

    fn close(&mut self) -> ChannelResult<()> {
        self.state.open = false;
        self.state.cfg = None;
        Ok(())
    }

    fn write_packets(&mut self, packets: Vec<CanFrame>, _timeout_ms: u32) -> ChannelResult<()> {
        self.ensure_open()?;
        if self.state.fault == Some(SimulatedFault::Write) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated write failure",
            )
            .into());
        }
        for p in packets {
            if let Ok(mut log) = self.state.tx_log.lock() {
                log.push(p);
            }
            self.deliver(p);
        }
        Ok(())
    }

    fn read_packets(&mut self, max: usize, timeout_ms: u32) -> ChannelResult<Vec<CanFrame>> {
        self.ensure_open()?;
        if self.state.fault == Some(SimulatedFault::Read) {
            return Err(ChannelError::APIError {
                api_name: "virtual".into(),
                code: 1,
                desc: "simulated read failure".into(),
            });
        }
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        self.collect_due();
        while self.state.rx_queue.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wake = self.next_due().map_or(deadline, |at| at.min(deadline));
            std::thread::sleep(wake.saturating_duration_since(now));
            self.collect_due();
        }
        let n = max.min(self.state.rx_queue.len());
        Ok(self.state.rx_queue.drain(..n).collect())
    }

    fn clear_rx_buffer(&mut self) -> ChannelResult<()> {
        self.state.rx_queue.clear();
        Ok(())
    }

    fn clear_tx_buffer(&mut self) -> ChannelResult<()> {
        Ok(())
    }
}

impl CanChannel for SimulatedCanDevice {
    fn set_can_cfg(&mut self, baud: u32, use_extended: bool) -> ChannelResult<()> {
        if self.state.open {
            return Err(ChannelError::ConfigurationError);
        }
        self.state.cfg = Some((baud, use_extended));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opened(dev: SimulatedCanDevice) -> SimulatedCanDevice {
        let mut dev = dev;
        dev.set_can_cfg(500_000, false).unwrap();
        dev.open().unwrap();
        dev
    }

    #[test]
    fn requires_configuration_before_open() {
        let mut dev = SimulatedCanDevice::new();
        assert!(matches!(dev.open(), Err(ChannelError::ConfigurationError)));
        assert!(matches!(
            dev.read_packets(1, 0),
            Err(ChannelError::InterfaceNotOpen)
        ));
    }

    #[test]
    fn ecu_answers_single_frame_request() {
        let ecu = SimulatedEcu::normal_11bit("engine", 0x7E0, 0x7E8)
            .on_request(|req| vec![ScriptedResponse::now(&[0x62, req[1], req[2], 0xAA])]);
        let mut dev = opened(SimulatedCanDevice::new().with_ecu(ecu));
        dev.write_packets(vec![CanFrame::new(0x7E0, &[0x03, 0x22, 0xFA, 0x13], false)], 0)
            .unwrap();
        let frames = dev.read_packets(10, 10).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].get_address(), 0x7E8);
        assert_eq!(&frames[0].get_data()[..5], &[0x04, 0x62, 0xFA, 0x13, 0xAA]);
    }

    #[test]
    fn long_response_waits_for_flow_control() {
        let ecu = SimulatedEcu::normal_11bit("engine", 0x7E0, 0x7E8)
            .on_request(|_| vec![ScriptedResponse::now(&[0x62, 0xFA, 0x13, 1, 2, 3, 4, 5, 6, 7])]);
        let mut dev = opened(SimulatedCanDevice::new().with_ecu(ecu));
        dev.write_packets(vec![CanFrame::new(0x7E0, &[0x03, 0x22, 0xFA, 0x13], false)], 0)
            .unwrap();
        let ff = dev.read_packets(10, 10).unwrap();
        assert_eq!(ff.len(), 1);
        assert_eq!(ff[0].get_data()[0..2], [0x10, 0x0A]);
        assert!(dev.read_packets(10, 5).unwrap().is_empty());
        dev.write_packets(vec![CanFrame::new(0x7E0, &[0x30, 0, 0], false)], 0)
            .unwrap();
        let cf = dev.read_packets(10, 10).unwrap();
        assert_eq!(cf.len(), 1);
        assert_eq!(&cf[0].get_data()[..5], &[0x21, 4, 5, 6, 7]);
    }

    #[test]
    fn delayed_response_is_not_delivered_early() {
        let ecu = SimulatedEcu::normal_11bit("slow", 0x7E0, 0x7E8)
            .on_request(|_| vec![ScriptedResponse::after(Duration::from_millis(50), &[0x7F, 0x22, 0x78])]);
        let mut dev = opened(SimulatedCanDevice::new().with_ecu(ecu));
        dev.write_packets(vec![CanFrame::new(0x7E0, &[0x03, 0x22, 0xFA, 0x13], false)], 0)
            .unwrap();
        assert!(dev.read_packets(10, 0).unwrap().is_empty());
        let start = Instant::now();
        let frames = dev.read_packets(10, 200).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn tester_frames_are_logged() {
        let mut dev = opened(SimulatedCanDevice::new());
        let log = dev.tx_log();
        dev.write_packets(vec![CanFrame::new(0x7DF, &[0x03, 0x22, 0xFA, 0x13], false)], 0)
            .unwrap();
        assert_eq!(log.lock().unwrap().len(), 1);
        assert!(dev.read_packets(10, 0).unwrap().is_empty());
    }

    #[test]
    fn injected_write_fault_surfaces_io_error() {
        let mut dev = opened(SimulatedCanDevice::new().with_fault(SimulatedFault::Write));
        let err = dev
            .write_packets(vec![CanFrame::new(0x7DF, &[0x01], false)], 0)
            .unwrap_err();
        assert!(matches!(err, ChannelError::IOError(_)));
    }
}
