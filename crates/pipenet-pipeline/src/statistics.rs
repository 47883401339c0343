//! Per-connection stage statistics.
//!
//! Network-level anomalies such as stale, duplicated or reordered packets are
//! absorbed by the stages and only show up here.

use std::time::Duration;

/// Counters of a reliable-sequenced stage for one connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReliableStatistics {
    /// Payload packets sent for the first time
    pub packets_sent: u64,
    /// Payload packets received, whatever their classification
    pub packets_received: u64,
    /// Payload packets sent again after their resend timeout
    pub packets_resent: u64,
    /// Packets too old or too far ahead of the receive window
    pub packets_stale: u64,
    /// Packets already received
    pub packets_duplicated: u64,
    /// Packets buffered until the gap before them closed
    pub packets_out_of_order: u64,
    /// Dedicated acknowledgement packets sent
    pub acks_sent: u64,
    /// Smoothed round-trip time
    pub rtt: Duration,
    /// Round-trip time variance
    pub rtt_variance: Duration,
    /// Current resend timeout
    pub resend_timeout: Duration,
}

impl ReliableStatistics {
    /// Share of sends that had to be repeated (0.0 to 1.0).
    pub fn resend_rate(&self) -> f32 {
        if self.packets_sent == 0 {
            return 0.0;
        }
        self.packets_resent as f32 / self.packets_sent as f32
    }

    /// Resets all statistics counters.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Counters of a simulator stage for one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatorStatistics {
    /// Packets that went through the simulated direction
    pub packets_seen: u64,
    /// Packets dropped on purpose
    pub packets_dropped: u64,
    /// Packets with flipped bits
    pub packets_fuzzed: u64,
    /// Packets held back for later release
    pub packets_delayed: u64,
    /// Packets dropped because every delay slot was taken
    pub ring_overflows: u64,
}

/// Statistics of any stage that keeps them.
#[derive(Debug, Clone, PartialEq)]
pub enum StageStatistics {
    /// Reliable-sequenced stage.
    Reliable(ReliableStatistics),
    /// Network simulator stage.
    Simulator(SimulatorStatistics),
}

impl StageStatistics {
    /// Reliable counters, if this is a reliable stage.
    pub fn as_reliable(&self) -> Option<&ReliableStatistics> {
        match self {
            StageStatistics::Reliable(statistics) => Some(statistics),
            _ => None,
        }
    }

    /// Simulator counters, if this is a simulator stage.
    pub fn as_simulator(&self) -> Option<&SimulatorStatistics> {
        match self {
            StageStatistics::Simulator(statistics) => Some(statistics),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statistics_initialized_to_zero() {
        let stats = ReliableStatistics::default();
        assert_eq!(stats.packets_sent, 0);
        assert_eq!(stats.packets_resent, 0);
        assert_eq!(stats.resend_rate(), 0.0);
    }

    #[test]
    fn test_resend_rate() {
        let mut stats = ReliableStatistics { packets_sent: 40, packets_resent: 4, ..Default::default() };
        assert!((stats.resend_rate() - 0.1).abs() < 0.001);

        stats.reset();
        assert_eq!(stats, ReliableStatistics::default());
    }

    #[test]
    fn test_stage_statistics_accessors() {
        let stats = StageStatistics::Simulator(SimulatorStatistics { packets_dropped: 2, ..Default::default() });
        assert!(stats.as_reliable().is_none());
        assert_eq!(stats.as_simulator().map(|s| s.packets_dropped), Some(2));
    }
}
