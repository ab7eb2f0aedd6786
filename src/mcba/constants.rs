use strum_macros::FromRepr;

use crate::mcba::state::FirmwareVersion;

pub const VENDOR_ID: u16 = 0x04d8;
pub const PRODUCT_ID: u16 = 0x0a30;

/// Every protocol message has this length, whatever the command.
pub const MESSAGE_SIZE: usize = 19;
pub const RX_BUFFER_SIZE: usize = 64;

pub const MAX_RX_TRANSFERS: usize = 20;
pub const MAX_TX_TRANSFERS: usize = 20;

/// Oscillator feeding the CAN controller
pub const CAN_CLOCK_HZ: u32 = 40_000_000;

// CAN message field masks
pub const SIDL_EXID_MASK: u16 = 0x0008;
pub const DLC_MASK: u8 = 0x0f;
pub const DLC_RTR_MASK: u8 = 0x40;

// Error counter thresholds, above which the controller leaves error-active
pub const CAN_STATE_WRN_TH: u8 = 95;
pub const CAN_STATE_ERR_PSV_TH: u8 = 127;

/// Firmware versions this driver was tested against
pub const TESTED_USB_VERSION: FirmwareVersion = FirmwareVersion::new(2, 8);
pub const TESTED_CAN_VERSION: FirmwareVersion = FirmwareVersion::new(2, 6);

#[repr(u8)]
pub enum Endpoint {
    BulkOut = 0x01,
    BulkIn = 0x81,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, FromRepr)]
#[repr(u8)]
pub enum Command {
    ChangeBitrate = 0xa1,
    TransmitMessage = 0xa3,
    SetupTerminationResistance = 0xa8,
    ReadFirmwareVersion = 0xa9,
    TransmitMessageResponse = 0xe2,
    ReceiveMessage = 0xe3,
    AliveFromCan = 0xf5,
    AliveFromUsb = 0xf7,
    NothingToSend = 0xff,
}

/// Target of a firmware version request
#[derive(Debug, PartialEq, Eq, Copy, Clone, FromRepr)]
#[repr(u8)]
pub enum Controller {
    Usb = 1,
    Can = 2,
}
