use crate::mcba::bitrate::Bitrate;
use crate::mcba::constants::{MAX_RX_TRANSFERS, TESTED_CAN_VERSION, TESTED_USB_VERSION};
use crate::mcba::state::FirmwareVersion;

const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Which keep-alive reports are logged in full. Replaces the driver-wide debug flag.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KeepAliveLogging {
    pub usb: bool,
    pub can: bool,
}

impl KeepAliveLogging {
    /// Bit 0 enables USB-side, bit 1 CAN-side logging.
    pub fn from_bits(bits: u8) -> Self {
        Self {
            usb: bits & 0x1 != 0,
            can: bits & 0x2 != 0,
        }
    }
}

/// Adapter configuration, applied when the device is started.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct McbaConfig {
    /// Bitrate to switch to on start. If None, the firmware keeps its current rate.
    pub bitrate: Option<Bitrate>,
    /// Termination resistor to set on start. If None, it is left as is.
    pub termination: Option<bool>,
    /// Number of receive transfers kept in flight, clamped to [`MAX_RX_TRANSFERS`].
    pub rx_transfers: usize,
    pub logging: KeepAliveLogging,
    /// Versions that do not trigger the untested firmware warning
    pub tested_usb_version: FirmwareVersion,
    pub tested_can_version: FirmwareVersion,
    /// USB transfer timeout
    pub timeout: std::time::Duration,
}

impl Default for McbaConfig {
    fn default() -> Self {
        McbaConfig {
            bitrate: None,
            termination: None,
            rx_transfers: MAX_RX_TRANSFERS,
            logging: KeepAliveLogging::default(),
            tested_usb_version: TESTED_USB_VERSION,
            tested_can_version: TESTED_CAN_VERSION,
            timeout: std::time::Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

impl McbaConfig {
    pub fn new(bitrate: Bitrate) -> Self {
        Self {
            bitrate: Some(bitrate),
            ..Default::default()
        }
    }

    pub(crate) fn rx_transfers(&self) -> usize {
        self.rx_transfers.min(MAX_RX_TRANSFERS)
    }
}
