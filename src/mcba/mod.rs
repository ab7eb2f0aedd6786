//! Microchip CAN BUS Analyzer
//!
//! The analyzer exchanges fixed size 19 byte messages over a pair of bulk
//! endpoints. [`device::Mcba`] drives the transfer lifecycle on top of a
//! [`device::Transport`], [`McbaAdapter`] wraps it into a [`CanAdapter`].

pub mod bitrate;
pub mod config;
pub mod constants;
pub mod context;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod sink;
pub mod state;
pub mod usb_protocol;

#[cfg(feature = "usb")]
mod usb;

use std::collections::VecDeque;
use std::sync::mpsc;

use tracing::warn;

use crate::can::{CanAdapter, Frame};
use crate::error::Error;
use crate::mcba::config::McbaConfig;
use crate::mcba::device::{Completion, Mcba, Transport, TxStatus};
use crate::mcba::sink::QueueSink;

pub use bitrate::Bitrate;
#[cfg(feature = "usb")]
pub use usb::UsbTransport;

/// Blocking adapter for the analyzer. Completions are processed on every
/// [`CanAdapter::send`] and [`CanAdapter::recv`] call.
pub struct McbaAdapter<T: Transport> {
    device: Mcba<T, QueueSink>,
    completions: mpsc::Receiver<Completion>,
}

#[cfg(feature = "usb")]
pub type McbaUsb = McbaAdapter<UsbTransport>;

#[cfg(feature = "usb")]
impl McbaAdapter<UsbTransport> {
    /// Open the first analyzer on the system and start it.
    pub fn open(config: McbaConfig) -> Result<Self, Error> {
        let (transport, completions) = UsbTransport::open(config.timeout)?;
        Self::new(transport, completions, config)
    }

    /// Convenience function to create a new analyzer and wrap it in an
    /// [`AsyncCanAdapter`](crate::can::AsyncCanAdapter).
    pub fn new_async(config: McbaConfig) -> Result<crate::can::AsyncCanAdapter, Error> {
        let mcba = Self::open(config)?;
        Ok(crate::can::AsyncCanAdapter::new(mcba))
    }
}

impl<T: Transport> McbaAdapter<T> {
    /// Start the device on `transport`, whose completions arrive on `completions`.
    pub fn new(
        transport: T,
        completions: mpsc::Receiver<Completion>,
        config: McbaConfig,
    ) -> Result<Self, Error> {
        let device = Mcba::new(transport, QueueSink::new(), config);
        let adapter = McbaAdapter {
            device,
            completions,
        };

        // On failure drop shuts the device down again
        adapter.device.start()?;
        Ok(adapter)
    }

    pub fn device(&self) -> &Mcba<T, QueueSink> {
        &self.device
    }

    fn process_completions(&self) {
        while let Ok(completion) = self.completions.try_recv() {
            self.device.handle_completion(completion);
        }
    }
}

impl<T: Transport> CanAdapter for McbaAdapter<T> {
    fn send(&mut self, frames: &mut VecDeque<Frame>) -> Result<Vec<(Frame, Error)>, Error> {
        self.process_completions();

        let mut rejected = vec![];
        while let Some(frame) = frames.pop_front() {
            match self.device.transmit(&frame) {
                Ok(TxStatus::Queued(_)) => {}
                Ok(TxStatus::Busy) => {
                    frames.push_front(frame);
                    break;
                }
                Err(Error::Disconnected) => {
                    frames.push_front(frame);
                    return Err(Error::Disconnected);
                }
                Err(e) => {
                    warn!("dropping {:?}: {}", frame, e);
                    rejected.push((frame, e));
                }
            }
        }

        Ok(rejected)
    }

    fn recv(&mut self) -> Result<Vec<Frame>, Error> {
        self.process_completions();

        let frames = self.device.sink().drain();
        if frames.is_empty() && self.device.is_detached() {
            return Err(Error::Disconnected);
        }
        Ok(frames)
    }
}

impl<T: Transport> Drop for McbaAdapter<T> {
    fn drop(&mut self) {
        self.device.shutdown();

        // Transport has posted every outstanding completion by now
        self.process_completions();
        if !self.device.is_idle() {
            warn!(
                "{} rx and {} tx transfers still in flight after shutdown",
                self.device.rx_in_flight(),
                self.device.tx_in_flight()
            );
        }
    }
}
