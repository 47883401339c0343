//! Client that sends messages to the echo server and prints the replies.
//!
//! Run the server first:
//! - cargo run -p pipenet --example server -- 127.0.0.1:7777
//!
//! Then run the client:
//! - cargo run -p pipenet --example client -- 127.0.0.1:7777
//! - cargo run -p pipenet --example client -- 127.0.0.1:7777 10 200
//!   (sends 10 messages, 200ms apart)

use std::{
    env, thread,
    time::{Duration, Instant},
};

use pipenet::prelude::*;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    // Args: <server_addr> [count] [interval_ms]
    let mut args = env::args().skip(1);
    let server_addr = args.next().unwrap_or_else(|| "127.0.0.1:9000".to_string());
    let count: usize = args.next().unwrap_or_else(|| "5".into()).parse().unwrap_or(5);
    let interval = Duration::from_millis(args.next().unwrap_or_else(|| "300".into()).parse().unwrap_or(300));

    let mut driver = NetworkDriver::new(UdpInterface::default())?;
    let reliable = driver.create_pipeline(PipelineBuilder::new().with_stage(ReliableSequencedStage::new()))?;
    let server = driver.create_endpoint(&server_addr)?;
    let connection = driver.connect(&server)?;
    info!(server = %server, "connecting");

    let mut connected = false;
    let mut sent = 0;
    let mut replies = 0;
    let mut next_send = Instant::now();

    while replies < count {
        if let Err(e) = driver.schedule_update() {
            error!(error = %e, "update failed");
        }

        while let Some(event) = driver.pop_event() {
            match event.kind {
                EventKind::Connect => {
                    info!(%connection, "connected");
                    connected = true;
                }
                EventKind::Data => {
                    replies += 1;
                    info!(reply = %String::from_utf8_lossy(driver.event_payload(&event)), "echo");
                }
                EventKind::Disconnect(reason) => {
                    warn!(?reason, "connection closed");
                    return Ok(());
                }
            }
        }

        if connected && sent < count && Instant::now() >= next_send {
            let message = format!("hello #{sent}");
            match driver.send(reliable, connection, message.as_bytes()) {
                Ok(_) => sent += 1,
                Err(ErrorKind::OutgoingQueueIsFull) => warn!("reliable window full, retrying"),
                Err(e) => return Err(e.into()),
            }
            next_send = Instant::now() + interval;
        }

        thread::sleep(Duration::from_millis(10));
    }

    driver.disconnect(connection)?;
    driver.schedule_update()?;
    info!(sent, replies, "done");
    Ok(())
}
