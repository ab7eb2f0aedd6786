//! Link and firmware state reported by the device keep-alive messages.

use std::fmt;

use crate::mcba::constants::{
    CAN_STATE_ERR_PSV_TH, CAN_STATE_WRN_TH, TESTED_CAN_VERSION, TESTED_USB_VERSION,
};
use crate::mcba::usb_protocol::{KeepAliveCan, KeepAliveUsb};

#[derive(Debug, Default, PartialEq, Eq, Copy, Clone, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
}

impl FirmwareVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Major and minor both equal the baseline.
    pub fn matches(&self, baseline: &FirmwareVersion) -> bool {
        self.major == baseline.major && self.minor == baseline.minor
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Firmware of both controllers, `None` until the first keep-alive from that controller.
#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
pub struct FirmwareVersions {
    pub usb: Option<FirmwareVersion>,
    pub can: Option<FirmwareVersion>,
}

#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
pub struct ErrorCounters {
    pub tx: u8,
    pub rx: u8,
}

/// CAN controller error state, derived from the error counters.
#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
pub enum CanState {
    #[default]
    Stopped,
    ErrorActive,
    ErrorWarning,
    ErrorPassive,
    BusOff,
}

impl CanState {
    fn from_report(msg: &KeepAliveCan) -> Self {
        let worst = msg.tx_err_cnt.max(msg.rx_err_cnt);
        if msg.tx_bus_off {
            CanState::BusOff
        } else if worst > CAN_STATE_ERR_PSV_TH {
            CanState::ErrorPassive
        } else if worst > CAN_STATE_WRN_TH {
            CanState::ErrorWarning
        } else {
            CanState::ErrorActive
        }
    }
}

/// Version reported by the first keep-alive of a controller.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct FirstSeen {
    pub version: FirmwareVersion,
    /// Differs from the tested baseline in major or minor
    pub untested: bool,
}

impl FirstSeen {
    fn new(version: FirmwareVersion, baseline: &FirmwareVersion) -> Self {
        Self {
            version,
            untested: !version.matches(baseline),
        }
    }
}

/// Outcome of a CAN keep-alive.
#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
pub struct CanUpdate {
    /// Set on the first report only
    pub first_seen: Option<FirstSeen>,
    /// Set when the error state changed
    pub state: Option<CanState>,
}

#[derive(Debug, Clone)]
pub struct DeviceState {
    baseline: (FirmwareVersion, FirmwareVersion),
    versions: FirmwareVersions,
    counters: ErrorCounters,
    termination: bool,
    can_state: CanState,
    last_report: Option<KeepAliveCan>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceState {
    pub fn new() -> Self {
        Self::with_baseline(TESTED_USB_VERSION, TESTED_CAN_VERSION)
    }

    /// State checking first-seen firmware against the given tested versions.
    pub fn with_baseline(usb: FirmwareVersion, can: FirmwareVersion) -> Self {
        Self {
            baseline: (usb, can),
            versions: FirmwareVersions::default(),
            counters: ErrorCounters::default(),
            termination: false,
            can_state: CanState::default(),
            last_report: None,
        }
    }

    /// Record a USB-side keep-alive. Returns the version the first time one is seen.
    pub fn update_usb(&mut self, msg: &KeepAliveUsb) -> Option<FirstSeen> {
        self.termination = msg.termination;

        match self.versions.usb {
            Some(_) => None,
            None => {
                self.versions.usb = Some(msg.version);
                Some(FirstSeen::new(msg.version, &self.baseline.0))
            }
        }
    }

    /// Record a CAN-side keep-alive. Error counters are live and refreshed on every report.
    pub fn update_can(&mut self, msg: &KeepAliveCan) -> CanUpdate {
        let mut update = CanUpdate::default();

        if self.versions.can.is_none() {
            self.versions.can = Some(msg.version);
            update.first_seen = Some(FirstSeen::new(msg.version, &self.baseline.1));
        }

        self.counters = ErrorCounters {
            tx: msg.tx_err_cnt,
            rx: msg.rx_err_cnt,
        };

        let state = CanState::from_report(msg);
        if state != self.can_state {
            self.can_state = state;
            update.state = Some(state);
        }

        self.last_report = Some(*msg);
        update
    }

    pub fn set_termination(&mut self, enabled: bool) {
        self.termination = enabled;
    }

    pub fn set_can_state(&mut self, state: CanState) {
        self.can_state = state;
    }

    pub fn firmware_versions(&self) -> FirmwareVersions {
        self.versions
    }

    pub fn error_counters(&self) -> ErrorCounters {
        self.counters
    }

    pub fn termination(&self) -> bool {
        self.termination
    }

    pub fn can_state(&self) -> CanState {
        self.can_state
    }

    /// Most recent full CAN keep-alive, for diagnostics.
    pub fn last_report(&self) -> Option<&KeepAliveCan> {
        self.last_report.as_ref()
    }
}
