//! Generic CAN types and traits

pub mod adapter;
pub mod async_can;
pub mod bitrate;

use std::collections::VecDeque;
use std::fmt;

pub use adapter::get_adapter;
pub use async_can::AsyncCanAdapter;

/// Maximum payload of a classic CAN frame
pub const CAN_MAX_DLEN: usize = 8;

pub const CAN_SFF_MASK: u32 = 0x7ff;
pub const CAN_EFF_MASK: u32 = 0x1fffffff;

/// Identifier for a CAN frame
#[derive(Copy, Clone, PartialOrd, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Identifier {
    Standard(u32),
    Extended(u32),
}

impl Identifier {
    pub fn is_standard(&self) -> bool {
        match self {
            Identifier::Standard(_) => true,
            Identifier::Extended(_) => false,
        }
    }
    pub fn is_extended(&self) -> bool {
        !self.is_standard()
    }

    /// Whether the raw value fits the identifier kind
    pub fn is_valid(&self) -> bool {
        match *self {
            Identifier::Standard(id) => id <= CAN_SFF_MASK,
            Identifier::Extended(id) => id <= CAN_EFF_MASK,
        }
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Extended(id) => write!(f, "0x{:08x}", id),
            Identifier::Standard(id) => write!(f, "0x{:03x}", id),
        }
    }
}

impl From<u32> for Identifier {
    fn from(id: u32) -> Identifier {
        if id <= CAN_SFF_MASK {
            Identifier::Standard(id)
        } else {
            Identifier::Extended(id)
        }
    }
}

impl From<Identifier> for u32 {
    fn from(val: Identifier) -> u32 {
        match val {
            Identifier::Standard(id) => id,
            Identifier::Extended(id) => id,
        }
    }
}

/// A classic CAN frame
#[derive(Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Frame {
    /// Arbitration ID
    pub id: Identifier,
    /// Remote Transmission Request, carries a DLC but no data
    pub rtr: bool,
    /// Data Length Code (0-8)
    pub dlc: u8,
    /// Frame Data, empty for remote frames
    pub data: Vec<u8>,
    /// Wheter the frame was sent out by the adapter
    pub loopback: bool,
}
impl Unpin for Frame {}

impl Frame {
    pub fn new(id: Identifier, data: &[u8]) -> Result<Frame, crate::error::Error> {
        if data.len() > CAN_MAX_DLEN || !id.is_valid() {
            return Err(crate::error::Error::MalformedFrame);
        }

        Ok(Frame {
            id,
            rtr: false,
            dlc: data.len() as u8,
            data: data.to_vec(),
            loopback: false,
        })
    }

    /// Remote frame requesting `dlc` bytes.
    pub fn new_remote(id: Identifier, dlc: u8) -> Result<Frame, crate::error::Error> {
        if dlc as usize > CAN_MAX_DLEN || !id.is_valid() {
            return Err(crate::error::Error::MalformedFrame);
        }

        Ok(Frame {
            id,
            rtr: true,
            dlc,
            data: vec![],
            loopback: false,
        })
    }

    /// Number of payload bytes carried on the bus.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("rtr", &self.rtr)
            .field("dlc", &self.dlc)
            .field("data", &hex::encode(&self.data))
            .field("loopback", &self.loopback)
            .finish()
    }
}

/// Trait for a Blocking CAN Adapter
pub trait CanAdapter {
    /// Send as many frames from the front of the queue as the adapter accepts.
    /// Frames that could not be handed over yet stay in the queue. Frames the
    /// adapter refused for good are returned together with the reason.
    fn send(
        &mut self,
        frames: &mut VecDeque<Frame>,
    ) -> Result<Vec<(Frame, crate::error::Error)>, crate::error::Error>;
    fn recv(&mut self) -> Result<Vec<Frame>, crate::error::Error>;
}
