//! Network condition simulator for tests and development.
//!
//! Packets passing through the simulated direction can be dropped, have bits
//! flipped, or be held back for a fixed delay plus random jitter. Held
//! packets live in a bounded per-connection ring and are released by
//! update invocations once due, earliest first, so jitter reorders them.

use std::time::{Duration, Instant};

use pipenet_core::{PacketBuffer, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::trace;

use crate::{
    stage::{PipelineStage, StageCapacity, StageConnection, StageContext, StageParameters, StageRequests},
    statistics::{SimulatorStatistics, StageStatistics},
};

/// Which direction the simulator acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApplyMode {
    /// Inbound packets only.
    #[default]
    Receive,
    /// Outbound packets only.
    Send,
    /// Both directions.
    Both,
}

impl ApplyMode {
    fn on_send(self) -> bool {
        matches!(self, ApplyMode::Send | ApplyMode::Both)
    }

    fn on_receive(self) -> bool {
        matches!(self, ApplyMode::Receive | ApplyMode::Both)
    }
}

/// Simulated network conditions.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorParameters {
    /// Packets that can be held back at once per connection. Overflow is dropped.
    pub max_packet_count: usize,
    /// Fixed delay added to every packet.
    pub packet_delay: Duration,
    /// Random extra delay, uniformly distributed in `[0, packet_jitter]`.
    pub packet_jitter: Duration,
    /// Drop every n-th packet. Zero disables.
    pub packet_drop_interval: u32,
    /// Chance in percent (0-100) that a packet is dropped.
    pub packet_drop_percentage: f32,
    /// Chance in percent (0-100) that each byte past `fuzz_offset` gets a bit flipped.
    pub fuzz_percentage: f32,
    /// Leading bytes left untouched by fuzzing.
    pub fuzz_offset: usize,
    /// RNG seed. `None` seeds from the operating system.
    pub random_seed: Option<u64>,
    /// Direction to act on.
    pub mode: ApplyMode,
}

impl Default for SimulatorParameters {
    fn default() -> Self {
        Self {
            max_packet_count: 64,
            packet_delay: Duration::ZERO,
            packet_jitter: Duration::ZERO,
            packet_drop_interval: 0,
            packet_drop_percentage: 0.0,
            fuzz_percentage: 0.0,
            fuzz_offset: 0,
            random_seed: None,
            mode: ApplyMode::Receive,
        }
    }
}

/// Simulator stage.
#[derive(Debug, Clone, Default)]
pub struct SimulatorStage {
    parameters: SimulatorParameters,
}

impl SimulatorStage {
    /// Creates a stage simulating the given conditions.
    pub fn new(parameters: SimulatorParameters) -> Self {
        Self { parameters }
    }
}

impl PipelineStage for SimulatorStage {
    fn name(&self) -> &'static str {
        "simulator"
    }

    fn static_initialize(&mut self, _parameters: &StageParameters<'_>) -> Result<StageCapacity> {
        Ok(StageCapacity { header_capacity: 0, payload_capacity: None })
    }

    fn initialize_connection(&self) -> Box<dyn StageConnection> {
        let rng = match self.parameters.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Box::new(SimulatorConnection {
            parameters: self.parameters.clone(),
            rng,
            packet_count: 0,
            delayed: Vec::with_capacity(self.parameters.max_packet_count),
            statistics: SimulatorStatistics::default(),
        })
    }
}

#[derive(Debug)]
struct DelayedPacket {
    release_at: Instant,
    data: Vec<u8>,
}

#[derive(Debug)]
struct SimulatorConnection {
    parameters: SimulatorParameters,
    rng: StdRng,
    packet_count: u64,
    delayed: Vec<DelayedPacket>,
    statistics: SimulatorStatistics,
}

impl SimulatorConnection {
    fn should_drop(&mut self) -> bool {
        let interval = self.parameters.packet_drop_interval as u64;
        if interval > 0 && self.packet_count % interval == 0 {
            return true;
        }
        self.parameters.packet_drop_percentage > 0.0
            && self.rng.random_range(0.0f32..100.0) < self.parameters.packet_drop_percentage
    }

    fn fuzz(&mut self, bytes: &mut [u8]) -> bool {
        if self.parameters.fuzz_percentage <= 0.0 {
            return false;
        }
        let mut fuzzed = false;
        for byte in bytes.iter_mut().skip(self.parameters.fuzz_offset) {
            if self.rng.random_range(0.0f32..100.0) < self.parameters.fuzz_percentage {
                *byte ^= 1 << self.rng.random_range(0..8u32);
                fuzzed = true;
            }
        }
        fuzzed
    }

    fn delay(&mut self) -> Duration {
        let jitter = self.parameters.packet_jitter;
        if jitter.is_zero() {
            return self.parameters.packet_delay;
        }
        let extra = self.rng.random_range(0..=jitter.as_micros() as u64);
        self.parameters.packet_delay + Duration::from_micros(extra)
    }

    /// Applies drop, fuzz and delay to the contents of `buffer`.
    fn simulate(&mut self, context: &StageContext, buffer: &mut PacketBuffer, requests: &mut StageRequests) {
        self.packet_count += 1;
        self.statistics.packets_seen += 1;

        if self.should_drop() {
            trace!(packet = self.packet_count, pipeline = context.pipeline.0, "simulator dropped packet");
            self.statistics.packets_dropped += 1;
            buffer.clear();
            return;
        }

        if self.fuzz(buffer.as_mut_slice()) {
            self.statistics.packets_fuzzed += 1;
        }

        let delay = self.delay();
        if delay.is_zero() {
            return;
        }

        let data = buffer.as_slice().to_vec();
        buffer.clear();
        if self.delayed.len() >= self.parameters.max_packet_count {
            trace!(pipeline = context.pipeline.0, "simulator delay ring full, dropping packet");
            self.statistics.ring_overflows += 1;
            return;
        }
        self.statistics.packets_delayed += 1;
        self.delayed.push(DelayedPacket { release_at: context.now + delay, data });
        *requests |= StageRequests::UPDATE;
    }

    /// Releases the earliest due packet into `buffer`.
    fn release(&mut self, now: Instant, buffer: &mut PacketBuffer, requests: &mut StageRequests) {
        let due = self
            .delayed
            .iter()
            .enumerate()
            .filter(|(_, packet)| packet.release_at <= now)
            .min_by_key(|(_, packet)| packet.release_at)
            .map(|(index, _)| index);

        if let Some(index) = due {
            let packet = self.delayed.swap_remove(index);
            buffer.set(&packet.data);
            if self.delayed.iter().any(|packet| packet.release_at <= now) {
                *requests |= StageRequests::RESUME;
            }
        }
        if !self.delayed.is_empty() {
            *requests |= StageRequests::UPDATE;
        }
    }
}

impl StageConnection for SimulatorConnection {
    fn send(&mut self, context: &StageContext, buffer: &mut PacketBuffer, requests: &mut StageRequests) -> Result<()> {
        if !self.parameters.mode.on_send() {
            return Ok(());
        }
        if buffer.is_empty() {
            self.release(context.now, buffer, requests);
        } else {
            self.simulate(context, buffer, requests);
        }
        Ok(())
    }

    fn receive(&mut self, context: &StageContext, buffer: &mut PacketBuffer, requests: &mut StageRequests) {
        if !self.parameters.mode.on_receive() {
            return;
        }
        if buffer.is_empty() {
            self.release(context.now, buffer, requests);
        } else {
            self.simulate(context, buffer, requests);
        }
    }

    fn statistics(&self) -> Option<StageStatistics> {
        Some(StageStatistics::Simulator(self.statistics.clone()))
    }
}
