//! Echo server over UDP on a reliable pipeline.
//!
//! Run:
//! - cargo run -p pipenet --example server
//! - cargo run -p pipenet --example server -- 127.0.0.1:7777
//!
//! Set `RUST_LOG=debug` to see connection activity.

use std::{env, thread, time::Duration};

use pipenet::prelude::*;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let bind_addr = env::args().nth(1).unwrap_or_else(|| "127.0.0.1:9000".to_string());

    let mut driver = NetworkDriver::new(UdpInterface::default())?;
    let reliable = driver.create_pipeline(PipelineBuilder::new().with_stage(ReliableSequencedStage::new()))?;
    let endpoint = driver.create_endpoint(&bind_addr)?;
    driver.bind(&endpoint)?;
    driver.listen()?;
    info!(local = %driver.local_endpoint()?, "echo server listening");

    loop {
        if let Err(e) = driver.schedule_update() {
            error!(error = %e, "update failed");
        }

        while let Some(connection) = driver.accept() {
            info!(%connection, remote = %driver.remote_endpoint(connection)?, "accepted");
        }

        while let Some(event) = driver.pop_event() {
            match event.kind {
                EventKind::Data => {
                    let payload = driver.event_payload(&event).to_vec();
                    info!(
                        connection = %event.connection,
                        pipeline = event.pipeline.0,
                        payload = %String::from_utf8_lossy(&payload),
                        "received"
                    );
                    if let Err(e) = driver.send(reliable, event.connection, &payload) {
                        error!(error = %e, "failed to queue echo");
                    }
                }
                EventKind::Disconnect(reason) => info!(connection = %event.connection, ?reason, "disconnected"),
                EventKind::Connect => {}
            }
        }

        thread::sleep(Duration::from_millis(10));
    }
}
