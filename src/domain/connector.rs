//! Connector status
//!
//! The nine OCPP 1.6 connector states. Wire form is title-case, which the
//! derived serde names already produce.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectorStatus {
    Available,
    Preparing,
    Charging,
    SuspendedEVSE,
    SuspendedEV,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
}

impl ConnectorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "Available",
            Self::Preparing => "Preparing",
            Self::Charging => "Charging",
            Self::SuspendedEVSE => "SuspendedEVSE",
            Self::SuspendedEV => "SuspendedEV",
            Self::Finishing => "Finishing",
            Self::Reserved => "Reserved",
            Self::Unavailable => "Unavailable",
            Self::Faulted => "Faulted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Available" => Some(Self::Available),
            "Preparing" => Some(Self::Preparing),
            "Charging" => Some(Self::Charging),
            "SuspendedEVSE" => Some(Self::SuspendedEVSE),
            "SuspendedEV" => Some(Self::SuspendedEV),
            "Finishing" => Some(Self::Finishing),
            "Reserved" => Some(Self::Reserved),
            "Unavailable" => Some(Self::Unavailable),
            "Faulted" => Some(Self::Faulted),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
