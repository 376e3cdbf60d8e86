//! Reads data from the ECU by data identifier (DID)

use automotive_diag::uds::UdsCommand;

use super::{
    POSITIVE_RESPONSE_OFFSET, ResponseKind, ResponseMatcher, is_response_pending,
    parse_negative_response,
};

/// 16bit data identifier
pub type DataIdentifier = u16;

/// Service ID of ReadDataByIdentifier
pub fn read_data_by_identifier_sid() -> u8 {
    UdsCommand::ReadDataByIdentifier.into()
}

/// Builds a ReadDataByIdentifier request for a single identifier
pub fn make_request(did: DataIdentifier) -> Vec<u8> {
    let [hi, lo] = did.to_be_bytes();
    vec![read_data_by_identifier_sid(), hi, lo]
}

/// Recognizes responses to a ReadDataByIdentifier request
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReadDataByIdentifierMatcher {
    did: DataIdentifier,
}

impl ReadDataByIdentifierMatcher {
    /// Matcher for one identifier
    pub fn new(did: DataIdentifier) -> Self {
        Self { did }
    }

    fn positive_prefix(&self) -> [u8; 3] {
        let [hi, lo] = self.did.to_be_bytes();
        [read_data_by_identifier_sid() + POSITIVE_RESPONSE_OFFSET, hi, lo]
    }
}

impl ResponseMatcher for ReadDataByIdentifierMatcher {
    fn classify(&self, payload: &[u8]) -> ResponseKind {
        if payload.starts_with(&self.positive_prefix()) {
            return ResponseKind::Positive;
        }
        match parse_negative_response(payload) {
            Some((sid, nrc)) if sid == read_data_by_identifier_sid() => {
                if payload.len() == 3 && is_response_pending(&nrc) {
                    ResponseKind::Pending
                } else {
                    log::warn!(
                        "ECU rejected read of DID 0x{:04X}: {nrc:?} (0x{:02X})",
                        self.did,
                        payload[2]
                    );
                    ResponseKind::Other
                }
            }
            _ => ResponseKind::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout() {
        assert_eq!(make_request(0xFA13), vec![0x22, 0xFA, 0x13]);
        assert_eq!(make_request(0x0001), vec![0x22, 0x00, 0x01]);
    }

    #[test]
    fn classify_positive() {
        let m = ReadDataByIdentifierMatcher::new(0xFA13);
        assert_eq!(m.classify(&[0x62, 0xFA, 0x13]), ResponseKind::Positive);
        assert_eq!(
            m.classify(&[0x62, 0xFA, 0x13, 0x05, 0x06]),
            ResponseKind::Positive
        );
    }

    #[test]
    fn classify_pending_requires_exact_shape() {
        let m = ReadDataByIdentifierMatcher::new(0xFA13);
        assert_eq!(m.classify(&[0x7F, 0x22, 0x78]), ResponseKind::Pending);
        assert_eq!(m.classify(&[0x7F, 0x22, 0x78, 0x00]), ResponseKind::Other);
        assert_eq!(m.classify(&[0x7F, 0x2E, 0x78]), ResponseKind::Other);
    }

    #[test]
    fn classify_other_traffic() {
        let m = ReadDataByIdentifierMatcher::new(0xFA13);
        assert_eq!(m.classify(&[0x62, 0xFA, 0x14, 0x01]), ResponseKind::Other);
        assert_eq!(m.classify(&[0x7F, 0x22, 0x31]), ResponseKind::Other);
        assert_eq!(m.classify(&[0x62, 0xFA]), ResponseKind::Other);
        assert_eq!(m.classify(&[]), ResponseKind::Other);
        assert_eq!(m.classify(&[0x50, 0x01]), ResponseKind::Other);
    }
}
