//! Async wrapper for Adapters implementing the [`CanAdapter`] trait.

use std::collections::{HashMap, VecDeque};

use crate::can::CanAdapter;
use crate::can::Frame;
use crate::can::Identifier;
use crate::error::Error;
use crate::Stream;
use async_stream::stream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, warn};

const CAN_TX_BUFFER_SIZE: usize = 128;
const CAN_RX_BUFFER_SIZE: usize = 1024;

type SendResult = Result<(), Error>;
type FrameCallback = (Frame, oneshot::Sender<SendResult>);
type Callbacks = HashMap<Identifier, VecDeque<FrameCallback>>;

/// Remove the oldest callback registered for `frame`.
/// Transfers may complete out of order, so match on content.
fn take_callback(
    callbacks: &mut Callbacks,
    frame: &Frame,
) -> Option<oneshot::Sender<SendResult>> {
    let pending = callbacks.get_mut(&frame.id)?;
    let idx = pending.iter().position(|(tx_frame, _)| tx_frame == frame)?;
    pending.remove(idx).map(|(_, callback)| callback)
}

fn process<T: CanAdapter>(
    mut adapter: T,
    mut shutdown_receiver: oneshot::Receiver<()>,
    rx_sender: broadcast::Sender<Frame>,
    mut tx_receiver: mpsc::Receiver<FrameCallback>,
) {
    let mut buffer: VecDeque<Frame> = VecDeque::new();
    let mut callbacks: Callbacks = HashMap::new();

    while shutdown_receiver.try_recv().is_err() {
        let frames = match adapter.recv() {
            Ok(frames) => frames,
            Err(e) => {
                error!("Adapter receive failed: {}", e);
                break;
            }
        };

        for frame in frames {
            debug!("RX {:?}", frame);

            // Wake up sender
            if frame.loopback {
                match take_callback(&mut callbacks, &frame) {
                    Some(callback) => {
                        // Sender may have given up waiting
                        let _ = callback.send(Ok(()));
                    }
                    None => warn!("Received loopback frame with no pending callback: {:?}", frame),
                };
            }

            // No subscribers is not an error
            let _ = rx_sender.send(frame);
        }

        while let Ok((frame, callback)) = tx_receiver.try_recv() {
            let mut loopback_frame = frame.clone();
            loopback_frame.loopback = true;

            callbacks
                .entry(frame.id)
                .or_default()
                .push_back((loopback_frame, callback));

            debug!("TX {:?}", frame);
            buffer.push_back(frame);
        }

        // Frames the adapter could not take yet stay buffered
        if !buffer.is_empty() {
            match adapter.send(&mut buffer) {
                Ok(rejected) => {
                    for (mut frame, e) in rejected {
                        frame.loopback = true;
                        if let Some(callback) = take_callback(&mut callbacks, &frame) {
                            let _ = callback.send(Err(e));
                        }
                    }
                }
                Err(e) => {
                    error!("Adapter send failed: {}", e);
                    break;
                }
            }
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }

    // Fail everything still waiting, including requests not picked up yet
    tx_receiver.close();
    while let Ok((_, callback)) = tx_receiver.try_recv() {
        let _ = callback.send(Err(Error::Disconnected));
    }
    for (_, callback) in callbacks.into_values().flatten() {
        let _ = callback.send(Err(Error::Disconnected));
    }
}

/// Async wrapper around a [`CanAdapter`]. Starts a background thread to handle sending and receiving frames. Uses tokio channels to communicate with the background thread.
pub struct AsyncCanAdapter {
    processing_handle: Option<std::thread::JoinHandle<()>>,
    recv_receiver: broadcast::Receiver<Frame>,
    send_sender: mpsc::Sender<FrameCallback>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl AsyncCanAdapter {
    pub fn new<T: CanAdapter + Send + 'static>(adapter: T) -> Self {
        let (shutdown_sender, shutdown_receiver) = oneshot::channel();
        let (send_sender, send_receiver) = mpsc::channel(CAN_TX_BUFFER_SIZE);
        let (recv_sender, recv_receiver) = broadcast::channel(CAN_RX_BUFFER_SIZE);

        let mut ret = AsyncCanAdapter {
            shutdown: Some(shutdown_sender),
            processing_handle: None,
            recv_receiver,
            send_sender,
        };

        ret.processing_handle = Some(std::thread::spawn(move || {
            process(adapter, shutdown_receiver, recv_sender, send_receiver);
        }));

        ret
    }

    /// Send a single frame. The Future resolves once the analyzer has accepted the transfer carrying the frame. This does not mean the message is sent out on the CAN bus yet, as this could be pending arbitration.
    ///
    /// Frames the adapter refuses resolve with the adapter's error, and a lost adapter resolves every pending send with [`Error::Disconnected`].
    pub async fn send(&self, frame: &Frame) -> Result<(), Error> {
        // Create oneshot channel to signal the completion of the send operation
        let (callback_sender, callback_receiver) = oneshot::channel();
        self.send_sender
            .send((frame.clone(), callback_sender))
            .await
            .map_err(|_| Error::Disconnected)?;

        callback_receiver.await.map_err(|_| Error::Disconnected)?
    }

    /// Receive all frames.
    pub fn recv(&self) -> impl Stream<Item = Frame> {
        self.recv_filter(|_| true)
    }

    /// Receive frames that match a filter. Useful in combination with stream adapters.
    pub fn recv_filter(&self, filter: impl Fn(&Frame) -> bool) -> impl Stream<Item = Frame> {
        let mut rx = self.recv_receiver.resubscribe();

        Box::pin(stream! {
            loop { match rx.recv().await {
                    Ok(frame) => {
                        if filter(&frame) {
                            yield frame
                        } else {
                            continue
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Receiver lagged, {} frames lost", n);
                        continue
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Drop for AsyncCanAdapter {
    fn drop(&mut self) {
        if let Some(handle) = self.processing_handle.take() {
            // Send shutdown signal to background tread
            if let Some(shutdown) = self.shutdown.take() {
                let _ = shutdown.send(());
            }
            if handle.join().is_err() {
                error!("CAN processing thread panicked");
            }
        }
    }
}
