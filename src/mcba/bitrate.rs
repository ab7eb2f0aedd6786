//! Bitrates supported by the CAN BUS Analyzer firmware.
//!
//! The firmware runs hardcoded bit timing for each rate and is only told the
//! rate in kbps. The segments below reproduce that timing host-side so the
//! reported sample point and bit time match what is on the bus.

use strum_macros::EnumIter;

use crate::can::bitrate::BitTiming;
use crate::mcba::constants::CAN_CLOCK_HZ;
use crate::mcba::error::Error;
use crate::mcba::usb_protocol::Message;

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash, EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Bitrate {
    Kbps20,
    Kbps33_3,
    Kbps50,
    Kbps80,
    Kbps83_3,
    Kbps100,
    Kbps125,
    Kbps150,
    Kbps175,
    Kbps200,
    Kbps225,
    Kbps250,
    Kbps275,
    Kbps300,
    Kbps500,
    Kbps625,
    Kbps800,
    Kbps1000,
}

// (bps, sjw, prop_seg, phase_seg1, phase_seg2, brp, device value)
type TableEntry = (u32, u32, u32, u32, u32, u32, u16);

impl Bitrate {
    const fn entry(&self) -> TableEntry {
        match self {
            Bitrate::Kbps20 => (20_000, 1, 5, 8, 6, 100, 20),
            Bitrate::Kbps33_3 => (33_333, 1, 8, 8, 8, 48, 33),
            Bitrate::Kbps50 => (50_000, 1, 8, 7, 4, 40, 50),
            Bitrate::Kbps80 => (80_000, 1, 8, 8, 8, 20, 80),
            Bitrate::Kbps83_3 => (83_333, 1, 8, 8, 7, 20, 83),
            Bitrate::Kbps100 => (100_000, 1, 1, 5, 3, 40, 100),
            Bitrate::Kbps125 => (125_000, 1, 3, 8, 8, 16, 125),
            Bitrate::Kbps150 => (150_000, 1, 8, 6, 4, 14, 150),
            Bitrate::Kbps175 => (175_000, 1, 8, 6, 4, 12, 175),
            Bitrate::Kbps200 => (200_000, 1, 8, 8, 8, 8, 200),
            Bitrate::Kbps225 => (225_000, 1, 8, 8, 5, 8, 225),
            Bitrate::Kbps250 => (250_000, 1, 3, 8, 8, 8, 250),
            Bitrate::Kbps275 => (275_000, 1, 8, 8, 7, 6, 275),
            Bitrate::Kbps300 => (300_000, 1, 8, 8, 5, 6, 300),
            Bitrate::Kbps500 => (500_000, 1, 3, 8, 8, 4, 500),
            Bitrate::Kbps625 => (625_000, 1, 1, 4, 2, 8, 625),
            Bitrate::Kbps800 => (800_000, 1, 8, 8, 8, 2, 800),
            Bitrate::Kbps1000 => (1_000_000, 1, 3, 8, 8, 2, 1000),
        }
    }

    /// Nominal rate in bits per second, as requested by the user.
    pub const fn bps(&self) -> u32 {
        self.entry().0
    }

    /// Value sent in the change bitrate command.
    pub const fn device_value(&self) -> u16 {
        self.entry().6
    }

    /// Timing used by the firmware at this rate.
    pub const fn timing(&self) -> BitTiming {
        let (_, sjw, prop, seg1, seg2, brp, _) = self.entry();
        BitTiming::from_segments(CAN_CLOCK_HZ, sjw, prop, seg1, seg2, brp)
    }
}

impl TryFrom<u32> for Bitrate {
    type Error = Error;
    fn try_from(bps: u32) -> Result<Self, Self::Error> {
        use strum::IntoEnumIterator;

        Bitrate::iter()
            .find(|b| b.bps() == bps)
            .ok_or(Error::UnsupportedBitrate(bps))
    }
}

/// Everything needed to switch the device to a new bitrate.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BitrateSetting {
    pub bitrate: Bitrate,
    pub timing: BitTiming,
    pub command: Message,
}

/// Look up the timing and device command for a bitrate in bits per second.
pub fn bittiming_for(bps: u32) -> Result<BitrateSetting, Error> {
    let bitrate = Bitrate::try_from(bps)?;

    Ok(BitrateSetting {
        bitrate,
        timing: bitrate.timing(),
        command: Message::ChangeBitrate(bitrate.device_value()),
    })
}
