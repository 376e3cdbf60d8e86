//! Module for UDS (Unified diagnostic services - ISO14229)
//!
//! Only the payload shapes needed to read data identifiers are implemented here.
//! Transport of the payloads is handled by [crate::hardware::software_isotp].

use automotive_diag::{
    ByteWrapper::Standard,
    uds::{UdsError, UdsErrorByte},
};

mod read_data_by_identifier;

pub use read_data_by_identifier::*;

/// Service ID of a negative response
pub const NEGATIVE_RESPONSE_SID: u8 = 0x7F;
/// Offset added to a service ID in a positive response
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// How a received payload relates to an outstanding request
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    /// Positive response to the request
    Positive,
    /// ECU needs more time, the real answer follows later
    Pending,
    /// Anything else. Negative responses, other services or unrelated traffic
    Other,
}

/// Classifies payloads received while waiting for a response
pub trait ResponseMatcher {
    /// Classifies one complete payload
    fn classify(&self, payload: &[u8]) -> ResponseKind;
}

/// Parses a negative response payload into the rejected service ID and its NRC
pub fn parse_negative_response(payload: &[u8]) -> Option<(u8, UdsErrorByte)> {
    match payload {
        [NEGATIVE_RESPONSE_SID, sid, nrc, ..] => Some((*sid, UdsErrorByte::from(*nrc))),
        _ => None,
    }
}

/// Returns true if an NRC asks the tester to keep waiting
pub fn is_response_pending(nrc: &UdsErrorByte) -> bool {
    matches!(nrc, Standard(UdsError::RequestCorrectlyReceivedResponsePending))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_response_parsing() {
        let (sid, nrc) = parse_negative_response(&[0x7F, 0x22, 0x78]).unwrap();
        assert_eq!(sid, 0x22);
        assert!(is_response_pending(&nrc));
        let (_, nrc) = parse_negative_response(&[0x7F, 0x22, 0x31]).unwrap();
        assert!(!is_response_pending(&nrc));
        assert!(parse_negative_response(&[0x62, 0xFA, 0x13]).is_none());
        assert!(parse_negative_response(&[0x7F, 0x22]).is_none());
    }
}
