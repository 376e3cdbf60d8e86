//! Request/response correlation over many receive channels
//!
//! A request is sent once, then every receive channel of the [AddressingPlan] is polled
//! round robin until a positive response arrives or the deadline passes.

use std::time::{Duration, Instant};

use crate::{
    addressing::AddressingPlan,
    bus::CanBus,
    channel::{ChannelError, IsoTPSettings},
    hardware::software_isotp::SoftwareIsoTpChannel,
    uds::{ResponseKind, ResponseMatcher},
};

/// Result of one request
#[derive(Debug, Clone)]
pub enum ResponseOutcome {
    /// Positive response payload, starting with the response SID
    Received(Vec<u8>),
    /// No positive response before the deadline
    TimedOut,
    /// Sending or receiving failed at the transport level
    TransportError(ChannelError),
}

impl ResponseOutcome {
    /// Payload of a received response
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            ResponseOutcome::Received(p) => Some(p),
            _ => None,
        }
    }
}

/// Timing of [send_and_collect]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CollectSettings {
    /// Overall deadline, counted from the moment the request was sent.
    /// Pending responses do not extend it
    pub timeout: Duration,
    /// Longest time a single channel is waited on per visit
    pub poll_interval: Duration,
    /// ISO-TP parameters of every channel
    pub isotp: IsoTPSettings,
}

impl Default for CollectSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            poll_interval: Duration::from_millis(1),
            isotp: IsoTPSettings::default(),
        }
    }
}

/// Sends `request` once and waits for the first positive response on any receive channel.
///
/// Frames already waiting in the device are discarded first. All channels are started
/// before the request is sent and stopped again before this function returns, whatever
/// the outcome.
pub fn send_and_collect<M: ResponseMatcher + ?Sized>(
    bus: &CanBus,
    plan: &AddressingPlan,
    request: &[u8],
    matcher: &M,
    settings: &CollectSettings,
) -> ResponseOutcome {
    // Late answers to an earlier request must not be taken for this one
    if let Err(e) = bus.discard_pending() {
        log::error!("Failed to flush the bus before sending: {e}");
        return ResponseOutcome::TransportError(e);
    }
    let mut receivers: Vec<SoftwareIsoTpChannel<'_>> = plan
        .receivers()
        .iter()
        .map(|spec| SoftwareIsoTpChannel::new(bus, *spec, settings.isotp))
        .collect();
    receivers.iter_mut().for_each(|c| c.start());

    let mut separate_tx = None;
    let tx: &SoftwareIsoTpChannel<'_> = match plan.transmit_receiver_index() {
        Some(idx) => &receivers[idx],
        None => {
            let mut c = SoftwareIsoTpChannel::new(bus, *plan.transmit(), settings.isotp);
            c.start();
            separate_tx.insert(c)
        }
    };
    log::debug!(
        "Listening on {} channels, sending {request:02X?} ({})",
        receivers.len(),
        plan.target_type()
    );

    if let Err(e) = tx.send(request, plan.target_type()) {
        log::error!("Failed to send request {request:02X?}: {e}");
        return ResponseOutcome::TransportError(e);
    }
    let deadline = Instant::now() + settings.timeout;

    if receivers.is_empty() {
        std::thread::sleep(settings.timeout);
        return ResponseOutcome::TimedOut;
    }
    loop {
        for ch in &receivers {
            let now = Instant::now();
            if now >= deadline {
                log::debug!("No positive response within {}ms", settings.timeout.as_millis());
                return ResponseOutcome::TimedOut;
            }
            let mut wait = settings.poll_interval.min(deadline - now);
            loop {
                let payload = match ch.recv(wait) {
                    Ok(Some(p)) => p,
                    Ok(None) => break,
                    Err(e) => {
                        log::error!("Receive failed on {:?}: {e}", ch.spec().address);
                        return ResponseOutcome::TransportError(e);
                    }
                };
                match matcher.classify(&payload) {
                    ResponseKind::Positive => {
                        log::debug!(
                            "Positive response on 0x{:X}: {payload:02X?}",
                            ch.spec().address.rx_can_id()
                        );
                        return ResponseOutcome::Received(payload);
                    }
                    ResponseKind::Pending => {
                        log::debug!(
                            "Response pending on 0x{:X}",
                            ch.spec().address.rx_can_id()
                        );
                    }
                    ResponseKind::Other => {
                        log::trace!("Ignoring {payload:02X?}");
                    }
                }
                // Drain what already arrived without waiting again
                wait = Duration::ZERO;
            }
        }
    }
}
