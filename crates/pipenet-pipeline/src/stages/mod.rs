//! Built-in pipeline stages.

mod fragmentation;
mod reliable;
mod simulator;
mod unreliable_sequenced;

pub use fragmentation::{FragmentHeader, FragmentationStage};
pub use reliable::ReliableSequencedStage;
pub use simulator::{ApplyMode, SimulatorParameters, SimulatorStage};
pub use unreliable_sequenced::UnreliableSequencedStage;
