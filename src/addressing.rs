//! Addressing plans for diagnostic requests
//!
//! A read operation transmits once and listens on every address an answer may
//! arrive on. When the responding ECU is not known in advance (functional
//! addressing), the plan enumerates every possible responder address.

use serde::{Deserialize, Serialize};

use crate::{channel::TargetAddressType, config::ConfigError};

/// Base of the 29bit normal fixed physical CAN identifier (`0x18DA_TA_SA`)
const NORMAL_FIXED_PHYSICAL: u32 = 0x18DA_0000;
/// Base of the 29bit normal fixed functional CAN identifier (`0x18DB_TA_SA`)
const NORMAL_FIXED_FUNCTIONAL: u32 = 0x18DB_0000;
/// Highest 11bit CAN identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// CAN level addressing mode of an endpoint
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum AddressingMode {
    /// 11bit identifiers, explicit Tx and Rx IDs
    #[strum(serialize = "11bits")]
    Normal11Bit,
    /// 29bit normal fixed identifiers built from target and source address bytes
    #[strum(serialize = "29bits")]
    NormalFixed29Bit,
}

/// Numeric identifiers of one ISO-TP endpoint
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CanAddress {
    /// 11bit normal addressing
    Normal11Bit {
        /// ID the tester transmits with (also used for flow control)
        tx_id: u32,
        /// ID the tester listens to
        rx_id: u32,
    },
    /// 29bit normal fixed addressing
    NormalFixed29Bit {
        /// Target address byte (the ECU)
        target_address: u8,
        /// Source address byte (the tester)
        source_address: u8,
    },
}

impl CanAddress {
    /// Addressing mode of this endpoint
    pub fn mode(&self) -> AddressingMode {
        match self {
            CanAddress::Normal11Bit { .. } => AddressingMode::Normal11Bit,
            CanAddress::NormalFixed29Bit { .. } => AddressingMode::NormalFixed29Bit,
        }
    }

    /// Returns true if this endpoint uses 29bit CAN identifiers
    pub fn is_extended(&self) -> bool {
        self.mode() == AddressingMode::NormalFixed29Bit
    }

    /// CAN ID used when transmitting a payload with a given target address type
    pub fn tx_can_id(&self, target: TargetAddressType) -> u32 {
        match (self, target) {
            (CanAddress::Normal11Bit { tx_id, .. }, _) => *tx_id,
            (
                CanAddress::NormalFixed29Bit {
                    target_address,
                    source_address,
                },
                TargetAddressType::Physical,
            ) => NORMAL_FIXED_PHYSICAL | (*target_address as u32) << 8 | *source_address as u32,
            (
                CanAddress::NormalFixed29Bit {
                    target_address,
                    source_address,
                },
                TargetAddressType::Functional,
            ) => NORMAL_FIXED_FUNCTIONAL | (*target_address as u32) << 8 | *source_address as u32,
        }
    }

    /// CAN ID this endpoint listens to
    pub fn rx_can_id(&self) -> u32 {
        match self {
            CanAddress::Normal11Bit { rx_id, .. } => *rx_id,
            CanAddress::NormalFixed29Bit {
                target_address,
                source_address,
            } => NORMAL_FIXED_PHYSICAL | (*source_address as u32) << 8 | *target_address as u32,
        }
    }

    /// CAN ID flow control frames are sent with while receiving
    pub fn flow_control_can_id(&self) -> u32 {
        self.tx_can_id(TargetAddressType::Physical)
    }
}

/// Role of an endpoint within one read operation
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AddressRole {
    /// The request is sent from this endpoint
    Transmit,
    /// Responses are listened for on this endpoint
    Receive,
}

/// One communication endpoint of a read operation
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct AddressSpec {
    /// Identifiers of the endpoint
    pub address: CanAddress,
    /// Transmit or receive
    pub role: AddressRole,
}

impl AddressSpec {
    /// Creates a transmit endpoint
    pub fn transmit(address: CanAddress) -> Self {
        Self {
            address,
            role: AddressRole::Transmit,
        }
    }

    /// Creates a receive endpoint
    pub fn receive(address: CanAddress) -> Self {
        Self {
            address,
            role: AddressRole::Receive,
        }
    }
}

/// Extra physical receive endpoint for [PlanConfig::Physical11Bit]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RxPair {
    /// Flow control ID
    pub tx_id: u32,
    /// Listening ID
    pub rx_id: u32,
}

/// Parameters of one of the three supported addressing modes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode")]
pub enum PlanConfig {
    /// 11bit physical addressing. The responder is known
    #[serde(rename = "physical-11bit")]
    Physical11Bit {
        /// Request ID
        #[serde(default = "default_physical_tx")]
        tx_id: u32,
        /// Response ID
        #[serde(default = "default_physical_rx")]
        rx_id: u32,
        /// Additional endpoints to listen on
        #[serde(default)]
        extra_rx: Vec<RxPair>,
    },
    /// 11bit functional addressing. Any ECU in the enumerated range may answer
    #[serde(rename = "functional-11bit")]
    Functional11Bit {
        /// Functional request ID
        #[serde(default = "default_functional_tx")]
        tx_id: u32,
        /// Listening ID of the transmit endpoint
        #[serde(default = "default_functional_base")]
        tx_rx_id: u32,
        /// First request ID of the enumerated range
        #[serde(default = "default_functional_base")]
        base_id: u32,
        /// Distance between a request ID and its response ID
        #[serde(default = "default_response_offset")]
        response_offset: u32,
        /// Number of enumerated responders
        #[serde(default = "default_functional_count")]
        count: u32,
        /// Offsets within the range that are never listened on
        #[serde(default)]
        excluded_offsets: Vec<u32>,
    },
    /// 29bit normal fixed functional addressing. Any target address byte may answer
    #[serde(rename = "functional-29bit")]
    Functional29Bit {
        /// Target address byte of the request
        #[serde(default = "default_29bit_target")]
        target: u8,
        /// Tester source address byte
        #[serde(default = "default_29bit_source")]
        source: u8,
        /// Target bytes that are never listened on
        #[serde(default = "default_29bit_excluded")]
        excluded_targets: Vec<u8>,
    },
}

fn default_physical_tx() -> u32 {
    0x7F1
}

fn default_physical_rx() -> u32 {
    0x7F9
}

fn default_functional_tx() -> u32 {
    0x7DF
}

fn default_functional_base() -> u32 {
    0x700
}

fn default_response_offset() -> u32 {
    8
}

fn default_functional_count() -> u32 {
    0x100 - 8
}

fn default_29bit_target() -> u8 {
    0xFF
}

fn default_29bit_source() -> u8 {
    0xF1
}

fn default_29bit_excluded() -> Vec<u8> {
    vec![0x33]
}

impl PlanConfig {
    /// Default physical plan
    pub fn physical_11bit() -> Self {
        Self::Physical11Bit {
            tx_id: default_physical_tx(),
            rx_id: default_physical_rx(),
            extra_rx: Vec::new(),
        }
    }

    /// Default 11bit functional plan (OBD functional request ID 0x7DF)
    pub fn functional_11bit() -> Self {
        Self::Functional11Bit {
            tx_id: default_functional_tx(),
            tx_rx_id: default_functional_base(),
            base_id: default_functional_base(),
            response_offset: default_response_offset(),
            count: default_functional_count(),
            excluded_offsets: Vec::new(),
        }
    }

    /// Default 29bit functional plan
    pub fn functional_29bit() -> Self {
        Self::Functional29Bit {
            target: default_29bit_target(),
            source: default_29bit_source(),
            excluded_targets: default_29bit_excluded(),
        }
    }

    /// Human readable description, used in log output
    pub fn describe(&self) -> &'static str {
        match self {
            PlanConfig::Physical11Bit { .. } => "11bits physical address",
            PlanConfig::Functional11Bit { .. } => "11bits functional address",
            PlanConfig::Functional29Bit { .. } => "29bits address",
        }
    }

    /// Checks the parameters can produce a valid plan
    pub fn validate(&self) -> Result<(), ConfigError> {
        let check_std = |name: &'static str, id: u32| {
            if id > MAX_STANDARD_ID {
                Err(ConfigError::IdOutOfRange { name, id })
            } else {
                Ok(())
            }
        };
        match self {
            PlanConfig::Physical11Bit {
                tx_id,
                rx_id,
                extra_rx,
            } => {
                check_std("tx_id", *tx_id)?;
                check_std("rx_id", *rx_id)?;
                if tx_id == rx_id {
                    return Err(ConfigError::Contradictory(format!(
                        "physical tx_id and rx_id are both 0x{tx_id:03X}"
                    )));
                }
                for pair in extra_rx {
                    check_std("extra_rx.tx_id", pair.tx_id)?;
                    check_std("extra_rx.rx_id", pair.rx_id)?;
                }
                Ok(())
            }
            PlanConfig::Functional11Bit {
                tx_id,
                tx_rx_id,
                base_id,
                response_offset,
                count,
                ..
            } => {
                check_std("tx_id", *tx_id)?;
                check_std("tx_rx_id", *tx_rx_id)?;
                if *count == 0 {
                    return Err(ConfigError::Contradictory(
                        "functional plan enumerates no responders".into(),
                    ));
                }
                let last = base_id
                    .checked_add(*count - 1)
                    .and_then(|x| x.checked_add(*response_offset))
                    .unwrap_or(u32::MAX);
                check_std("base_id + count + response_offset", last)
            }
            PlanConfig::Functional29Bit {
                excluded_targets, ..
            } => {
                if excluded_targets.len() >= 0x100
                    && (0..=0xFFu8).all(|t| excluded_targets.contains(&t))
                {
                    return Err(ConfigError::Contradictory(
                        "every 29bit target address is excluded".into(),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Transmit endpoint and the ordered set of receive endpoints of one read operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressingPlan {
    transmit: AddressSpec,
    receivers: Vec<AddressSpec>,
    target_type: TargetAddressType,
}

impl AddressingPlan {
    /// Builds the plan for a given addressing mode. Enumeration always succeeds,
    /// parameters are checked beforehand with [PlanConfig::validate]
    pub fn build(cfg: &PlanConfig) -> Self {
        match cfg {
            PlanConfig::Physical11Bit {
                tx_id,
                rx_id,
                extra_rx,
            } => {
                let tx = CanAddress::Normal11Bit {
                    tx_id: *tx_id,
                    rx_id: *rx_id,
                };
                // Response arrives on the same logical channel as the request
                let rx = std::iter::once(tx).chain(extra_rx.iter().map(|p| {
                    CanAddress::Normal11Bit {
                        tx_id: p.tx_id,
                        rx_id: p.rx_id,
                    }
                }));
                Self::new(tx, rx, TargetAddressType::Physical)
            }
            PlanConfig::Functional11Bit {
                tx_id,
                tx_rx_id,
                base_id,
                response_offset,
                count,
                excluded_offsets,
            } => {
                let tx = CanAddress::Normal11Bit {
                    tx_id: *tx_id,
                    rx_id: *tx_rx_id,
                };
                // IDs grow with the offset, enumeration ends at the first one past 11 bits
                let rx = (0..*count)
                    .filter(|off| !excluded_offsets.contains(off))
                    .map_while(|off| {
                        let tx_id = base_id.checked_add(off)?;
                        let rx_id = tx_id.checked_add(*response_offset)?;
                        (rx_id <= MAX_STANDARD_ID && tx_id <= MAX_STANDARD_ID)
                            .then_some(CanAddress::Normal11Bit { tx_id, rx_id })
                    });
                Self::new(tx, rx, TargetAddressType::Functional)
            }
            PlanConfig::Functional29Bit {
                target,
                source,
                excluded_targets,
            } => {
                let tx = CanAddress::NormalFixed29Bit {
                    target_address: *target,
                    source_address: *source,
                };
                let rx = (0..=0xFFu8)
                    .filter(|t| !excluded_targets.contains(t))
                    .map(|t| CanAddress::NormalFixed29Bit {
                        target_address: t,
                        source_address: *source,
                    });
                Self::new(tx, rx, TargetAddressType::Functional)
            }
        }
    }

    fn new(
        tx: CanAddress,
        rx: impl Iterator<Item = CanAddress>,
        target_type: TargetAddressType,
    ) -> Self {
        let mut receivers: Vec<AddressSpec> = Vec::new();
        for addr in rx {
            if receivers
                .iter()
                .any(|r| r.address.rx_can_id() == addr.rx_can_id())
            {
                log::trace!("Skipping duplicate receive address {addr:?}");
                continue;
            }
            receivers.push(AddressSpec::receive(addr));
        }
        Self {
            transmit: AddressSpec::transmit(tx),
            receivers,
            target_type,
        }
    }

    /// Endpoint the request is sent from
    pub fn transmit(&self) -> &AddressSpec {
        &self.transmit
    }

    /// Endpoints listened on, in polling order
    pub fn receivers(&self) -> &[AddressSpec] {
        &self.receivers
    }

    /// Physical or functional request
    pub fn target_type(&self) -> TargetAddressType {
        self.target_type
    }

    /// Returns the position of the transmit endpoint in the receive set, if it listens too
    pub fn transmit_receiver_index(&self) -> Option<usize> {
        self.receivers
            .iter()
            .position(|r| r.address == self.transmit.address)
    }
}
