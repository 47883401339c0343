#![warn(missing_docs)]

//! pipenet-driver: connections, events and interfaces.
//!
//! The [`NetworkDriver`] ties a [`NetworkInterface`](pipenet_core::NetworkInterface),
//! the connection framing and the registered pipelines together. It is driven
//! by calling [`NetworkDriver::schedule_update`] once per tick and popping the
//! events it produced.

/// Multi-threaded send view.
pub mod concurrent;
/// Connection handles and the connection table.
pub mod connection;
/// The driver itself.
pub mod driver;
/// Events delivered to the application.
pub mod event;
/// UDP and in-process interfaces.
pub mod interface;
mod send;

pub use concurrent::{ConcurrentDriver, ConcurrentSendWriter};
pub use connection::{Connection, ConnectionState};
pub use driver::{DriverStatistics, NetworkDriver};
pub use event::{DisconnectReason, Event, EventKind};
pub use interface::{IpcHub, IpcInterface, UdpInterface};
pub use send::SendWriter;
