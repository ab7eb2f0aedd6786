use mcba::mcba::config::{KeepAliveLogging, McbaConfig};
use mcba::mcba::{Bitrate, McbaUsb};
use tokio_stream::StreamExt;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = McbaConfig {
        logging: KeepAliveLogging::from_bits(0x2),
        ..McbaConfig::new(Bitrate::Kbps500)
    };
    let adapter = McbaUsb::new_async(config).unwrap();
    let mut stream = adapter.recv();

    while let Some(frame) = stream.next().await {
        let id: u32 = frame.id.into();
        println!("0x{:x}\t{}", id, hex::encode(frame.data));
    }
}
