use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MIN_FREQUENCY_HZ: u64 = 100_000;
pub const MAX_FREQUENCY_HZ: u64 = 30_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RadioMode {
    Usb,
    Lsb,
    Cw,
    Am,
    Fm,
    Digi,
}

impl RadioMode {
    /// Case-insensitive parse of the client-facing mode names.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USB" => Some(Self::Usb),
            "LSB" => Some(Self::Lsb),
            "CW" => Some(Self::Cw),
            "AM" => Some(Self::Am),
            "FM" => Some(Self::Fm),
            "DIGI" => Some(Self::Digi),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Usb => "USB",
            Self::Lsb => "LSB",
            Self::Cw => "CW",
            Self::Am => "AM",
            Self::Fm => "FM",
            Self::Digi => "DIGI",
        }
    }

    /// Mode token understood by rigctld.
    pub fn rig_name(&self) -> &'static str {
        match self {
            Self::Digi => "PKTUSB",
            other => other.as_str(),
        }
    }

    /// Map a rigctld mode token back; rig-specific variants fold into the
    /// nearest client-facing mode.
    pub fn from_rig_name(s: &str) -> Option<Self> {
        match s.trim() {
            "PKTUSB" | "PKTLSB" | "PKTFM" | "RTTY" | "RTTYR" => Some(Self::Digi),
            "CWR" => Some(Self::Cw),
            "WFM" => Some(Self::Fm),
            other => Self::parse(other),
        }
    }
}

/// Last confirmed state of the radio. Only the command scheduler writes it,
/// and only after the control daemon acknowledged the change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RadioState {
    pub frequency: u64,
    pub mode: RadioMode,
    pub power_percent: u8,
    pub ptt: bool,
    pub signal_strength: i32,
    pub connected: bool,
    pub last_update: Option<DateTime<Utc>>,
}

impl Default for RadioState {
    fn default() -> Self {
        Self {
            frequency: 7_050_000,
            mode: RadioMode::Usb,
            power_percent: 100,
            ptt: false,
            signal_strength: 0,
            connected: false,
            last_update: None,
        }
    }
}

pub fn frequency_in_range(hz: u64) -> bool {
    (MIN_FREQUENCY_HZ..=MAX_FREQUENCY_HZ).contains(&hz)
}
