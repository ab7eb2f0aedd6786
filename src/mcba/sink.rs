//! Queue backed [`FrameSink`] used by the polling adapter.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::warn;

use crate::can::Frame;
use crate::mcba::constants::MAX_TX_TRANSFERS;
use crate::mcba::device::FrameSink;
use crate::mcba::state::CanState;

/// Collects received frames and turns transmitted frames into loopback frames, in completion order.
pub struct QueueSink {
    received: Mutex<VecDeque<Frame>>,
    echo: Mutex<[Option<Frame>; MAX_TX_TRANSFERS]>,
    stopped: AtomicBool,
    detached: AtomicBool,
    can_state: Mutex<CanState>,
}

impl Default for QueueSink {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueSink {
    pub fn new() -> Self {
        Self {
            received: Mutex::new(VecDeque::new()),
            echo: Mutex::new(std::array::from_fn(|_| None)),
            stopped: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            can_state: Mutex::new(CanState::default()),
        }
    }

    fn received(&self) -> MutexGuard<'_, VecDeque<Frame>> {
        self.received.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn echo(&self) -> MutexGuard<'_, [Option<Frame>; MAX_TX_TRANSFERS]> {
        self.echo.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take every frame collected so far.
    pub fn drain(&self) -> Vec<Frame> {
        self.received().drain(..).collect()
    }

    /// Producer was asked to stop sending.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    /// Last state reported through [`FrameSink::can_state_changed`].
    pub fn can_state(&self) -> CanState {
        *self.can_state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FrameSink for QueueSink {
    fn deliver_received_frame(&self, frame: Frame) {
        self.received().push_back(frame);
    }

    fn frame_transmitted(&self, slot: usize, _len: usize) {
        let echo = self.echo().get_mut(slot).and_then(Option::take);
        match echo {
            Some(mut frame) => {
                frame.loopback = true;
                self.received().push_back(frame);
            }
            None => warn!("no echo frame stored for slot {}", slot),
        }
    }

    fn request_backpressure(&self, stop: bool) {
        self.stopped.store(stop, Ordering::SeqCst);
    }

    fn put_echo(&self, slot: usize, frame: &Frame) {
        if let Some(echo) = self.echo().get_mut(slot) {
            *echo = Some(frame.clone());
        }
    }

    fn free_echo(&self, slot: usize) {
        if let Some(echo) = self.echo().get_mut(slot) {
            *echo = None;
        }
    }

    fn device_detached(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    fn can_state_changed(&self, state: CanState) {
        *self.can_state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}
