#![warn(missing_docs)]

//! pipenet: connection-oriented, pipelined messaging over unreliable datagrams.
//!
//! This crate re-exports the public surface of the workspace:
//!
//! - The driver, connections and events (`NetworkDriver`, `Connection`, `Event`)
//! - Pipelines and the built-in stages (`PipelineBuilder`, `ReliableSequencedStage`, ...)
//! - Interfaces (`UdpInterface`, `IpcInterface`) and core configuration (`Config`)
//! - Payload streams (`DataStreamWriter`, `DataStreamReader`)
//!
//! Example
//! ```no_run
//! use pipenet::prelude::*;
//!
//! let mut driver = NetworkDriver::new(UdpInterface::default()).unwrap();
//! let reliable = driver.create_pipeline(PipelineBuilder::new().with_stage(ReliableSequencedStage::new())).unwrap();
//! let server = driver.create_endpoint("127.0.0.1:9000").unwrap();
//! let connection = driver.connect(&server).unwrap();
//!
//! loop {
//!     driver.schedule_update().unwrap();
//!     while let Some(event) = driver.pop_event() {
//!         if event.kind == EventKind::Connect {
//!             driver.send(reliable, connection, b"hello").unwrap();
//!         }
//!     }
//! #   break;
//! }
//! ```

// Core types
pub use pipenet_core::{
    constants, Clock, Config, Endpoint, ErrorKind, ManualClock, NetworkInterface, Result, StatusCode, SystemClock,
};
// Driver: connections, events and interfaces
pub use pipenet_driver::{
    ConcurrentDriver, ConcurrentSendWriter, Connection, ConnectionState, DisconnectReason, DriverStatistics, Event,
    EventKind, IpcHub, IpcInterface, NetworkDriver, SendWriter, UdpInterface,
};
// Pipelines and stages
pub use pipenet_pipeline::{
    ApplyMode, FragmentationStage, PipelineBuilder, PipelineStage, ReliableSequencedStage, ReliableStatistics,
    SimulatorParameters, SimulatorStage, SimulatorStatistics, StageStatistics, UnreliableSequencedStage,
};
// Protocol: streams and framing
pub use pipenet_protocol::{
    DataStreamReader, DataStreamWriter, NetworkCompressionModel, NetworkProtocol, PipelineId, UdpProtocol,
};

/// Convenience prelude with the most commonly used items.
pub mod prelude {
    pub use crate::{
        Config, Connection, ConnectionState, DisconnectReason, Endpoint, ErrorKind, Event, EventKind,
        FragmentationStage, NetworkDriver, PipelineBuilder, PipelineId, ReliableSequencedStage, StatusCode,
        UdpInterface, UnreliableSequencedStage,
    };
}
