//! Network interfaces shipped with the driver.
//!
//! - [`UdpInterface`]: non-blocking UDP socket
//! - [`IpcInterface`]: in-process loopback through an [`IpcHub`], for tests and local tools

mod ipc;
mod udp;

pub use ipc::{IpcHub, IpcInterface};
pub use udp::UdpInterface;
