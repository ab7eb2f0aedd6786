//! # The MCBA Crate
//! Driver for the Microchip CAN BUS Analyzer, a USB to CAN adapter. The crate speaks the analyzer's bulk transfer protocol and exposes the device as a fully async CAN interface.
//!
//! ## Async CAN Example
//!
//! The following opens the first analyzer on the system at 500 kbit/s, and then receives all frames.
//!
//! ```rust
//! use tokio_stream::StreamExt;
//! use mcba::mcba::{config::McbaConfig, Bitrate, McbaUsb};
//!
//! async fn can_example() {
//!     let adapter = McbaUsb::new_async(McbaConfig::new(Bitrate::Kbps500)).unwrap();
//!     let mut stream = adapter.recv();
//!
//!     while let Some(frame) = stream.next().await {
//!         let id: u32 = frame.id.into();
//!         println!("0x{:x}\t{}", id, hex::encode(frame.data));
//!     }
//! }
//! ```
//!
//! ## Device state
//!
//! Keep-alive messages from the analyzer update the error counters, the CAN error state and the firmware versions, which are available through [`mcba::device::Mcba`].
//!

pub mod can;
mod error;
pub mod mcba;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

pub use tokio_stream::Stream;
