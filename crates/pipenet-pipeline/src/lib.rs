#![warn(missing_docs)]

//! pipenet-pipeline: composable per-connection packet processing.
//!
//! A pipeline is an ordered list of stages shared by every connection of a
//! driver. This crate provides:
//! - The stage traits and request flags
//! - Pipeline construction and layout
//! - The per-connection processor with resume and update handling
//! - Built-in fragmentation, reliable-sequenced, unreliable-sequenced and simulator stages

/// Pipeline construction and the per-driver pipeline list.
pub mod builder;
/// Per-connection stage processing.
pub mod processor;
/// Sliding-window acknowledgement and resend logic.
pub mod reliability;
/// Stage contract.
pub mod stage;
/// Built-in stages.
pub mod stages;
/// Per-connection stage statistics.
pub mod statistics;

pub use builder::{Pipeline, PipelineBuilder, PipelineRegistry};
pub use processor::ConnectionPipelines;
pub use stage::{PipelineStage, StageCapacity, StageConnection, StageContext, StageParameters, StageRequests};
pub use stages::{
    ApplyMode, FragmentationStage, ReliableSequencedStage, SimulatorParameters, SimulatorStage,
    UnreliableSequencedStage,
};
pub use statistics::{ReliableStatistics, SimulatorStatistics, StageStatistics};
