//! Bulk transfers to the analyzer using libusb.

extern crate rusb;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::error::Error;
use crate::mcba::constants::{Endpoint, MESSAGE_SIZE, PRODUCT_ID, VENDOR_ID};
use crate::mcba::device::{Completion, RxTransfer, TransferStatus, Transport};

type Handle = rusb::DeviceHandle<rusb::GlobalContext>;

const INTERFACE: u8 = 0;

/// libusb has no async API in rusb, so receive transfers are served in order by a reader
/// thread. Transmits are written synchronously.
pub struct UsbTransport {
    handle: Arc<Handle>,
    timeout: Duration,
    completions: Mutex<mpsc::Sender<Completion>>,
    rx_queue: Mutex<Option<mpsc::Sender<RxTransfer>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    cancelled: Arc<AtomicBool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn map_usb_error(e: rusb::Error) -> Error {
    match e {
        rusb::Error::NoDevice => Error::Disconnected,
        e => e.into(),
    }
}

impl UsbTransport {
    /// Open the first analyzer found. Returns the transport and the channel its
    /// completions are posted on.
    pub fn open(timeout: Duration) -> Result<(Self, mpsc::Receiver<Completion>), Error> {
        for device in rusb::devices()?.iter() {
            let device_desc = device.device_descriptor()?;

            if device_desc.vendor_id() != VENDOR_ID {
                continue;
            }
            if device_desc.product_id() != PRODUCT_ID {
                continue;
            }

            let handle = device.open()?;
            if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
                debug!("kernel driver auto detach unavailable: {}", e);
            }
            handle.claim_interface(INTERFACE)?;

            info!(
                "Microchip CAN BUS Analyzer connected, bus {} address {}",
                device.bus_number(),
                device.address()
            );
            return Ok(Self::new(handle, timeout));
        }
        Err(Error::NotFound)
    }

    fn new(handle: Handle, timeout: Duration) -> (Self, mpsc::Receiver<Completion>) {
        let (completion_sender, completion_receiver) = mpsc::channel();
        let (rx_sender, rx_receiver) = mpsc::channel();

        let handle = Arc::new(handle);
        let cancelled = Arc::new(AtomicBool::new(false));

        let reader = std::thread::spawn({
            let handle = handle.clone();
            let cancelled = cancelled.clone();
            let completions = completion_sender.clone();
            move || read_loop(&handle, timeout, &cancelled, rx_receiver, completions)
        });

        let transport = UsbTransport {
            handle,
            timeout,
            completions: Mutex::new(completion_sender),
            rx_queue: Mutex::new(Some(rx_sender)),
            reader: Mutex::new(Some(reader)),
            cancelled,
        };
        (transport, completion_receiver)
    }
}

fn read_loop(
    handle: &Handle,
    timeout: Duration,
    cancelled: &AtomicBool,
    queue: mpsc::Receiver<RxTransfer>,
    completions: mpsc::Sender<Completion>,
) {
    while let Ok(mut transfer) = queue.recv() {
        let status = loop {
            if cancelled.load(Ordering::SeqCst) {
                break TransferStatus::Cancelled;
            }

            match handle.read_bulk(Endpoint::BulkIn as u8, &mut transfer.buffer, timeout) {
                Ok(len) => {
                    transfer.buffer.truncate(len);
                    break TransferStatus::Completed;
                }
                Err(rusb::Error::Timeout) => continue,
                Err(e) => break TransferStatus::Failed(map_usb_error(e)),
            }
        };

        if completions.send(Completion::Receive { transfer, status }).is_err() {
            break;
        }
    }
}

/// Map a bulk-out result to the transfer status. A message is only sent when written whole.
fn write_status(written: rusb::Result<usize>) -> Result<TransferStatus, Error> {
    match written {
        Ok(MESSAGE_SIZE) => Ok(TransferStatus::Completed),
        Ok(n) => {
            debug!("short bulk-out write, {} of {} bytes", n, MESSAGE_SIZE);
            Ok(TransferStatus::Failed(Error::Timeout))
        }
        Err(rusb::Error::NoDevice) => Err(Error::Disconnected),
        Err(e) => Ok(TransferStatus::Failed(e.into())),
    }
}

impl Transport for UsbTransport {
    fn submit_receive(&self, transfer: RxTransfer) -> Result<(), Error> {
        match lock(&self.rx_queue).as_ref() {
            Some(queue) => queue.send(transfer).map_err(|_| Error::Disconnected),
            None => Err(Error::Disconnected),
        }
    }

    fn submit_transmit(&self, slot: usize, message: [u8; MESSAGE_SIZE]) -> Result<(), Error> {
        let written = self
            .handle
            .write_bulk(Endpoint::BulkOut as u8, &message, self.timeout);
        let status = write_status(written)?;

        lock(&self.completions)
            .send(Completion::Transmit { slot, status })
            .map_err(|_| Error::Disconnected)
    }

    fn cancel_all(&self) {
        self.cancelled.store(true, Ordering::SeqCst);

        // Reader drains the queued transfers as cancelled, then exits
        lock(&self.rx_queue).take();
        if let Some(reader) = lock(&self.reader).take() {
            if reader.join().is_err() {
                error!("USB reader thread panicked");
            }
        }
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        self.cancel_all();
        if let Err(e) = self.handle.release_interface(INTERFACE) {
            debug!("failed releasing interface: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_write_fails_transfer() {
        assert_eq!(write_status(Ok(MESSAGE_SIZE)), Ok(TransferStatus::Completed));
        assert_eq!(
            write_status(Ok(MESSAGE_SIZE - 1)),
            Ok(TransferStatus::Failed(Error::Timeout))
        );
        assert_eq!(write_status(Ok(0)), Ok(TransferStatus::Failed(Error::Timeout)));
    }

    #[test]
    fn write_errors() {
        assert_eq!(write_status(Err(rusb::Error::NoDevice)), Err(Error::Disconnected));
        assert_eq!(
            write_status(Err(rusb::Error::Pipe)),
            Ok(TransferStatus::Failed(Error::LibUsbError(rusb::Error::Pipe)))
        );
    }
}
