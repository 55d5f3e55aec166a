//! OCPP subprotocol negotiation
//!
//! During the WebSocket handshake the charge point advertises the
//! subprotocols it speaks via `Sec-WebSocket-Protocol`. Tokens are
//! normalized (`ocpp1.6`, `OCPP1.6` and `1.6` all mean OCPP 1.6) and the
//! first mutually supported one wins. A missing or unrecognized header is
//! not an error: the session falls back to the configured default.

use crate::domain::ProtocolVersion;

pub struct ProtocolNegotiator {
    /// Versions this gateway serves, in preference order.
    supported: Vec<ProtocolVersion>,
}

impl ProtocolNegotiator {
    pub fn new(supported: Vec<ProtocolVersion>) -> Self {
        Self { supported }
    }

    /// Pick a version from the raw header value. Returns the version and
    /// the exact client token to echo back in the response.
    pub fn negotiate(&self, header_value: &str) -> Option<(ProtocolVersion, String)> {
        for token in header_value.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            if let Some(version) = ProtocolVersion::normalize(token) {
                if self.supported.contains(&version) {
                    return Some((version, token.to_string()));
                }
            }
        }
        None
    }

    pub fn supported(&self) -> &[ProtocolVersion] {
        &self.supported
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiator() -> ProtocolNegotiator {
        ProtocolNegotiator::new(vec![ProtocolVersion::V16])
    }

    #[test]
    fn negotiates_normalized_spellings() {
        for header in ["ocpp1.6", "OCPP1.6", "1.6"] {
            let (version, token) = negotiator().negotiate(header).unwrap();
            assert_eq!(version, ProtocolVersion::V16);
            assert_eq!(token, header);
        }
    }

    #[test]
    fn first_supported_token_wins() {
        let (version, token) = negotiator()
            .negotiate("ocpp2.0.1, ocpp1.6")
            .unwrap();
        assert_eq!(version, ProtocolVersion::V16);
        assert_eq!(token, "ocpp1.6");
    }

    #[test]
    fn unknown_or_empty_header_negotiates_nothing() {
        assert!(negotiator().negotiate("").is_none());
        assert!(negotiator().negotiate("soap, mqtt").is_none());
        // recognized but unsupported here
        assert!(negotiator().negotiate("ocpp2.0.1").is_none());
    }
}
