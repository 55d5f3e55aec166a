//! OCPP protocol version
//!
//! The dispatcher registry is keyed by version; the WebSocket negotiator
//! normalizes whatever token the station advertises onto these keys.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Supported OCPP protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// OCPP 1.6 (JSON / OCPP-J)
    V16,
    /// OCPP 2.0.1; accepted by the registry, no handler is shipped.
    V201,
}

impl ProtocolVersion {
    /// Canonical registry key, e.g. `1.6`.
    pub fn key(&self) -> &'static str {
        match self {
            Self::V16 => "1.6",
            Self::V201 => "2.0.1",
        }
    }

    /// WebSocket subprotocol token advertised in `Sec-WebSocket-Protocol`.
    pub fn subprotocol(&self) -> &'static str {
        match self {
            Self::V16 => "ocpp1.6",
            Self::V201 => "ocpp2.0.1",
        }
    }

    /// Normalize a client-advertised token onto a version key.
    ///
    /// `ocpp1.6`, `OCPP1.6` and `1.6` all map to [`ProtocolVersion::V16`].
    pub fn normalize(token: &str) -> Option<Self> {
        let token = token.trim().to_ascii_lowercase();
        let bare = token.strip_prefix("ocpp").unwrap_or(&token).trim_start_matches(' ');
        match bare {
            "1.6" => Some(Self::V16),
            "2.0.1" => Some(Self::V201),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OCPP {}", self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_all_spellings() {
        for token in ["ocpp1.6", "OCPP1.6", "1.6", " ocpp1.6 ", "Ocpp1.6"] {
            assert_eq!(ProtocolVersion::normalize(token), Some(ProtocolVersion::V16));
        }
        assert_eq!(
            ProtocolVersion::normalize("ocpp2.0.1"),
            Some(ProtocolVersion::V201)
        );
    }

    #[test]
    fn rejects_unknown_tokens() {
        assert_eq!(ProtocolVersion::normalize("ocpp2.1"), None);
        assert_eq!(ProtocolVersion::normalize(""), None);
        assert_eq!(ProtocolVersion::normalize("soap"), None);
    }
}
