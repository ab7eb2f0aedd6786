//! Transfer lifecycle of the CAN BUS Analyzer.
//!
//! [`Mcba`] owns the transmit context pool and the device state. The
//! transport submits USB transfers and reports their completion, which the
//! owner hands back through [`Mcba::handle_completion`]. Received buffers are
//! dispatched and their transfer resubmitted; finished transmits free their
//! slot and acknowledge the echo to the [`FrameSink`].

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, error, info, warn};

use crate::can::bitrate::BitTiming;
use crate::can::Frame;
use crate::error::Error;
use crate::mcba::bitrate::bittiming_for;
use crate::mcba::config::McbaConfig;
use crate::mcba::constants::{Controller, MAX_TX_TRANSFERS, MESSAGE_SIZE, RX_BUFFER_SIZE};
use crate::mcba::context::{TxContext, TxContextPool, TxPayload};
use crate::mcba::dispatch::{dispatch, MessageHandler};
use crate::mcba::state::{CanState, DeviceState, ErrorCounters, FirmwareVersions};
use crate::mcba::usb_protocol::{CanMessage, KeepAliveCan, KeepAliveUsb, Message};
use crate::Result;

/// A reusable bulk-in transfer. The transport truncates `buffer` to the received length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxTransfer {
    pub index: usize,
    pub buffer: Vec<u8>,
}

impl RxTransfer {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            buffer: vec![0; RX_BUFFER_SIZE],
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.buffer.resize(RX_BUFFER_SIZE, 0);
    }
}

#[derive(Debug, PartialEq)]
pub enum TransferStatus {
    Completed,
    /// Killed by [`Transport::cancel_all`]
    Cancelled,
    Failed(Error),
}

/// Completion event posted by the transport.
#[derive(Debug, PartialEq)]
pub enum Completion {
    Receive {
        transfer: RxTransfer,
        status: TransferStatus,
    },
    Transmit {
        slot: usize,
        status: TransferStatus,
    },
}

/// USB side of the adapter. Submissions must not block on completion; completions are
/// reported as [`Completion`] events.
pub trait Transport: Send + Sync {
    fn submit_receive(&self, transfer: RxTransfer) -> Result<()>;
    fn submit_transmit(&self, slot: usize, message: [u8; MESSAGE_SIZE]) -> Result<()>;
    /// Cancel every outstanding transfer and wait until their completions have been posted.
    fn cancel_all(&self);
}

/// Host side of the adapter, receiving frames, echoes and flow control.
pub trait FrameSink: Send + Sync {
    fn deliver_received_frame(&self, frame: Frame);
    /// The frame stored with [`FrameSink::put_echo`] for `slot` went out
    fn frame_transmitted(&self, slot: usize, len: usize);
    /// `true` asks the producer to stop sending until called again with `false`
    fn request_backpressure(&self, stop: bool);

    fn put_echo(&self, _slot: usize, _frame: &Frame) {}
    fn free_echo(&self, _slot: usize) {}
    fn device_detached(&self) {}
    fn can_state_changed(&self, _state: CanState) {}
}

/// Result of handing a frame to the adapter.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TxStatus {
    /// Submitted in the given slot
    Queued(usize),
    /// No free transmit context, backpressure was requested
    Busy,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Statistics {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_dropped: u64,
    pub rx_format_errors: u64,
    pub rx_unknown: u64,
}

#[derive(Default)]
struct Counters {
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    tx_dropped: AtomicU64,
    rx_format_errors: AtomicU64,
    rx_unknown: AtomicU64,
}

impl Counters {
    fn add(counter: &AtomicU64, val: u64) {
        counter.fetch_add(val, Ordering::Relaxed);
    }

    fn snapshot(&self) -> Statistics {
        Statistics {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            tx_dropped: self.tx_dropped.load(Ordering::Relaxed),
            rx_format_errors: self.rx_format_errors.load(Ordering::Relaxed),
            rx_unknown: self.rx_unknown.load(Ordering::Relaxed),
        }
    }
}

/// One CAN BUS Analyzer, generic over its transport and frame sink.
pub struct Mcba<T: Transport, S: FrameSink> {
    transport: T,
    sink: S,
    config: McbaConfig,
    pool: Mutex<TxContextPool<MAX_TX_TRANSFERS>>,
    state: RwLock<DeviceState>,
    bittiming: Mutex<Option<BitTiming>>,
    counters: Counters,
    rx_in_flight: AtomicUsize,
    detached: AtomicBool,
    stopping: AtomicBool,
}

impl<T: Transport, S: FrameSink> Mcba<T, S> {
    pub fn new(transport: T, sink: S, config: McbaConfig) -> Self {
        let state =
            DeviceState::with_baseline(config.tested_usb_version, config.tested_can_version);

        Self {
            transport,
            sink,
            config,
            pool: Mutex::new(TxContextPool::new()),
            state: RwLock::new(state),
            bittiming: Mutex::new(None),
            counters: Counters::default(),
            rx_in_flight: AtomicUsize::new(0),
            detached: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn config(&self) -> &McbaConfig {
        &self.config
    }

    fn pool(&self) -> MutexGuard<'_, TxContextPool<MAX_TX_TRANSFERS>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> RwLockReadGuard<'_, DeviceState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, DeviceState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fill the receive pipeline, then ask both controllers for their firmware version
    /// and apply the configured bitrate and termination.
    pub fn start(&self) -> Result<()> {
        let wanted = self.config.rx_transfers();
        let mut submitted = 0;

        for index in 0..wanted {
            self.rx_in_flight.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = self.transport.submit_receive(RxTransfer::new(index)) {
                self.rx_in_flight.fetch_sub(1, Ordering::SeqCst);
                if e == Error::Disconnected {
                    self.detach();
                    return Err(e);
                }
                warn!("failed submitting read transfer {}: {}", index, e);
                break;
            }
            submitted += 1;
        }

        if submitted == 0 {
            warn!("couldn't setup read transfers");
            return Err(crate::mcba::error::Error::NoReceiveTransfers.into());
        }
        if submitted < wanted {
            warn!("rx performance may be slow, {} of {} read transfers", submitted, wanted);
        }

        self.state_mut().set_can_state(CanState::ErrorActive);

        self.send_command(&Message::ReadFirmwareVersion(Controller::Usb))?;
        self.send_command(&Message::ReadFirmwareVersion(Controller::Can))?;

        if let Some(bitrate) = self.config.bitrate {
            self.set_bitrate(bitrate.bps())?;
        }
        if let Some(termination) = self.config.termination {
            self.set_termination(termination)?;
        }

        Ok(())
    }

    /// Stop resubmitting and cancel all transfers. Completions arriving afterwards only
    /// release their resources.
    pub fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }

        self.state_mut().set_can_state(CanState::Stopped);
        self.sink.request_backpressure(true);
        self.transport.cancel_all();
    }

    /// Queue a CAN frame. Returns [`TxStatus::Busy`] when all transmit contexts are in flight.
    pub fn transmit(&self, frame: &Frame) -> Result<TxStatus> {
        let msg = CanMessage::try_from(frame)?;
        self.xmit(
            &Message::Transmit(msg),
            TxPayload::Frame { len: msg.len() },
            Some(frame),
        )
    }

    /// Send a bare device command. Fails with [`Error::Busy`] if no transmit context is free.
    pub fn send_command(&self, msg: &Message) -> Result<()> {
        match self.xmit(msg, TxPayload::Command, None)? {
            TxStatus::Queued(_) => Ok(()),
            TxStatus::Busy => {
                warn!("no free transmit context, dropping {:?}", msg.command());
                Err(Error::Busy)
            }
        }
    }

    fn xmit(&self, msg: &Message, payload: TxPayload, echo: Option<&Frame>) -> Result<TxStatus> {
        if self.is_detached() || self.stopping.load(Ordering::SeqCst) {
            return Err(Error::Disconnected);
        }

        let ctx = {
            let mut pool = self.pool();
            match pool.acquire(payload) {
                Some(ctx) => ctx,
                None => {
                    // Slow down tx path
                    self.sink.request_backpressure(true);
                    return Ok(TxStatus::Busy);
                }
            }
        };

        if let Some(frame) = echo {
            self.sink.put_echo(ctx.slot, frame);
        }

        match self.transport.submit_transmit(ctx.slot, msg.encode()) {
            Ok(()) => Ok(TxStatus::Queued(ctx.slot)),
            Err(e) => {
                if echo.is_some() {
                    self.sink.free_echo(ctx.slot);
                }
                self.release(ctx.slot);
                Counters::add(&self.counters.tx_dropped, 1);

                if e == Error::Disconnected {
                    self.detach();
                } else {
                    warn!("failed tx transfer in slot {}: {}", ctx.slot, e);
                }
                Err(e)
            }
        }
    }

    fn release(&self, slot: usize) -> Option<TxContext> {
        let mut pool = self.pool();
        let released = pool.release(slot)?;
        if released.resumed {
            self.sink.request_backpressure(false);
        }
        Some(released.context)
    }

    fn detach(&self) {
        if !self.detached.swap(true, Ordering::SeqCst) {
            warn!("device detached");
            self.state_mut().set_can_state(CanState::Stopped);
            self.sink.device_detached();
        }
    }

    pub fn handle_completion(&self, completion: Completion) {
        match completion {
            Completion::Receive { transfer, status } => self.receive_complete(transfer, status),
            Completion::Transmit { slot, status } => self.transmit_complete(slot, status),
        }
    }

    fn receive_complete(&self, mut transfer: RxTransfer, status: TransferStatus) {
        if self.is_detached() || self.stopping.load(Ordering::SeqCst) {
            self.rx_in_flight.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        match status {
            TransferStatus::Completed => {
                let report = dispatch(&transfer.buffer, &mut RxHandler { mcba: self });
                Counters::add(&self.counters.rx_format_errors, report.format_errors as u64);
                Counters::add(&self.counters.rx_unknown, report.unknown as u64);
            }
            TransferStatus::Cancelled => {
                self.rx_in_flight.fetch_sub(1, Ordering::SeqCst);
                return;
            }
            TransferStatus::Failed(Error::Disconnected) => {
                self.rx_in_flight.fetch_sub(1, Ordering::SeqCst);
                self.detach();
                return;
            }
            TransferStatus::Failed(e) => info!("Rx transfer {} aborted ({})", transfer.index, e),
        }

        transfer.reset();
        if let Err(e) = self.transport.submit_receive(transfer) {
            self.rx_in_flight.fetch_sub(1, Ordering::SeqCst);
            match e {
                Error::Disconnected => self.detach(),
                e => error!("failed resubmitting read bulk transfer: {}", e),
            }
        }
    }

    fn transmit_complete(&self, slot: usize, status: TransferStatus) {
        let ctx = match self.pool().get(slot) {
            Some(ctx) => *ctx,
            None => {
                warn!("Tx completion for free slot {}", slot);
                return;
            }
        };

        if let TransferStatus::Failed(e) = &status {
            info!("Tx transfer in slot {} aborted ({})", slot, e);
        }

        // Acknowledge before the slot can be handed out again
        if let TxPayload::Frame { len } = ctx.payload {
            let aborted = status == TransferStatus::Cancelled
                || self.is_detached()
                || self.stopping.load(Ordering::SeqCst);
            if aborted {
                self.sink.free_echo(slot);
                Counters::add(&self.counters.tx_dropped, 1);
            } else {
                Counters::add(&self.counters.tx_packets, 1);
                Counters::add(&self.counters.tx_bytes, len as u64);
                self.sink.frame_transmitted(slot, len);
            }
        }

        self.release(slot);
    }

    /// Switch the device to a supported bitrate. Unsupported rates are rejected without
    /// touching the device.
    pub fn set_bitrate(&self, bps: u32) -> Result<BitTiming> {
        let setting = match bittiming_for(bps) {
            Ok(setting) => setting,
            Err(e) => {
                error!(
                    "Unsupported bitrate ({}). Use one of: 20000, 33333, 50000, 80000, 83333, 100000, 125000, 150000, 175000, 200000, 225000, 250000, 275000, 300000, 500000, 625000, 800000, 1000000",
                    bps
                );
                return Err(e.into());
            }
        };

        self.send_command(&setting.command)?;
        *self.bittiming.lock().unwrap_or_else(PoisonError::into_inner) = Some(setting.timing);

        info!(
            "bitrate {} bps, sample point {}.{}%",
            setting.timing.bitrate,
            setting.timing.sample_point / 10,
            setting.timing.sample_point % 10
        );
        Ok(setting.timing)
    }

    pub fn set_termination(&self, enabled: bool) -> Result<()> {
        self.send_command(&Message::SetTermination(enabled))?;
        self.state_mut().set_termination(enabled);
        Ok(())
    }

    pub fn error_counters(&self) -> ErrorCounters {
        self.state().error_counters()
    }

    pub fn firmware_versions(&self) -> FirmwareVersions {
        self.state().firmware_versions()
    }

    pub fn termination(&self) -> bool {
        self.state().termination()
    }

    pub fn can_state(&self) -> CanState {
        self.state().can_state()
    }

    /// Most recent CAN keep-alive report.
    pub fn last_report(&self) -> Option<KeepAliveCan> {
        self.state().last_report().copied()
    }

    /// Timing of the last bitrate set through this adapter.
    pub fn bittiming(&self) -> Option<BitTiming> {
        *self.bittiming.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn statistics(&self) -> Statistics {
        self.counters.snapshot()
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    pub fn rx_in_flight(&self) -> usize {
        self.rx_in_flight.load(Ordering::SeqCst)
    }

    pub fn tx_in_flight(&self) -> usize {
        self.pool().in_flight()
    }

    /// No receive or transmit transfer is outstanding.
    pub fn is_idle(&self) -> bool {
        self.rx_in_flight() == 0 && self.pool().is_idle()
    }
}

struct RxHandler<'a, T: Transport, S: FrameSink> {
    mcba: &'a Mcba<T, S>,
}

impl<T: Transport, S: FrameSink> MessageHandler for RxHandler<'_, T, S> {
    fn can_frame(&mut self, msg: &CanMessage) {
        let frame = Frame::from(msg);

        Counters::add(&self.mcba.counters.rx_packets, 1);
        Counters::add(&self.mcba.counters.rx_bytes, frame.len() as u64);
        self.mcba.sink.deliver_received_frame(frame);
    }

    fn usb_keep_alive(&mut self, msg: &KeepAliveUsb) {
        let config = &self.mcba.config;
        if config.logging.usb {
            info!(
                "USB_KA: termination {}, version {}",
                msg.termination, msg.version
            );
        }

        let (first_seen, known) = {
            let mut state = self.mcba.state_mut();
            (state.update_usb(msg), state.firmware_versions().usb)
        };

        match first_seen {
            Some(first) => {
                info!("PIC USB version {}", first.version);
                if first.untested {
                    warn!(
                        "Driver tested against PIC USB {} version only",
                        config.tested_usb_version
                    );
                }
            }
            None if known != Some(msg.version) => {
                debug!("PIC USB reports version {}, keeping {:?}", msg.version, known);
            }
            None => {}
        }
    }

    fn can_keep_alive(&mut self, msg: &KeepAliveCan) {
        let config = &self.mcba.config;
        if config.logging.can {
            info!(
                "CAN_KA: tx_err_cnt {}, rx_err_cnt {}, rx_buff_ovfl {}, tx_bus_off {}, can_bitrate {}, rx_lost {}, can_stat {}, soft_ver {}, debug_mode {}, test_complete {}, test_result {}",
                msg.tx_err_cnt,
                msg.rx_err_cnt,
                msg.rx_buff_ovfl,
                msg.tx_bus_off,
                msg.can_bitrate,
                msg.rx_lost,
                msg.can_stat,
                msg.version,
                msg.debug_mode,
                msg.test_complete,
                msg.test_result
            );
        }

        let (update, known) = {
            let mut state = self.mcba.state_mut();
            (state.update_can(msg), state.firmware_versions().can)
        };

        match update.first_seen {
            Some(first) => {
                info!("PIC CAN version {}", first.version);
                if first.untested {
                    warn!(
                        "Driver tested against PIC CAN {} version only",
                        config.tested_can_version
                    );
                }
            }
            None if known != Some(msg.version) => {
                debug!("PIC CAN reports version {}, keeping {:?}", msg.version, known);
            }
            None => {}
        }

        if let Some(state) = update.state {
            debug!("CAN state {:?}", state);
            self.mcba.sink.can_state_changed(state);
        }
    }

    fn informational(&mut self, msg: &Message) {
        debug!("{:?}", msg.command());
    }
}
