//! Splits inbound bulk transfers into protocol messages and routes them by command.

use tracing::{debug, error, warn};

use crate::mcba::constants::MESSAGE_SIZE;
use crate::mcba::error::Error;
use crate::mcba::usb_protocol::{CanMessage, KeepAliveCan, KeepAliveUsb, Message};

/// Receives the decoded messages of a buffer, one call per record.
pub trait MessageHandler {
    fn can_frame(&mut self, msg: &CanMessage);
    fn usb_keep_alive(&mut self, msg: &KeepAliveUsb);
    fn can_keep_alive(&mut self, msg: &KeepAliveCan);
    /// Messages that carry no state, like transmit responses
    fn informational(&mut self, _msg: &Message) {}
}

#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
pub struct DispatchReport {
    /// Records decoded and handed to the handler
    pub processed: usize,
    /// Truncated or undecodable records
    pub format_errors: usize,
    /// Records with a command id this driver does not know
    pub unknown: usize,
}

/// Process every complete record in `buffer`. A trailing partial record is dropped and
/// counted as one format error.
pub fn dispatch<H: MessageHandler>(buffer: &[u8], handler: &mut H) -> DispatchReport {
    let mut report = DispatchReport::default();

    for record in buffer.chunks(MESSAGE_SIZE) {
        if record.len() < MESSAGE_SIZE {
            error!("format error, dropping {} trailing bytes", record.len());
            report.format_errors += 1;
            break;
        }

        let msg = match Message::decode(record) {
            Ok(msg) => msg,
            Err(Error::UnknownCommand(id)) => {
                warn!("Unsupported msg (0x{:02X})", id);
                report.unknown += 1;
                continue;
            }
            Err(e) => {
                error!("format error: {}, record {}", e, hex::encode(record));
                report.format_errors += 1;
                continue;
            }
        };

        match &msg {
            Message::Receive(can) => handler.can_frame(can),
            Message::AliveFromUsb(ka) => handler.usb_keep_alive(ka),
            Message::AliveFromCan(ka) => handler.can_keep_alive(ka),
            Message::NothingToSend | Message::TransmitResponse => handler.informational(&msg),
            // Host to device commands have no business on the bulk-in endpoint
            other => {
                debug!("Ignoring {:?} from device", other.command());
                handler.informational(&msg);
            }
        }
        report.processed += 1;
    }

    report
}
