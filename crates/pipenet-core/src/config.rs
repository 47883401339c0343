use std::{default::Default, time::Duration};

use crate::{
    constants::{DEFAULT_MTU, MAX_RELIABLE_WINDOW_SIZE, UDP_MAX_HEADER_SIZE},
    error::{ErrorKind, Result},
};

#[derive(Clone, Debug)]
/// Configuration options to tune the driver and the built-in pipeline stages.
pub struct Config {
    /// Time between connection request retries.
    pub connect_timeout: Duration,
    /// Connection requests sent before giving up with `MaxConnectionAttempts`.
    pub max_connect_attempts: u32,
    /// Max idle time before considering a connection disconnected.
    pub disconnect_timeout: Duration,
    /// Send a keep-alive if nothing was sent for this long. None disables heartbeats.
    pub heartbeat_timeout: Option<Duration>,
    /// Max size of one datagram on the wire.
    pub max_message_size: u16,
    /// Max number of live connections accepted while listening. None is unlimited.
    pub max_connections: Option<usize>,
    /// Datagrams buffered by the interface per tick.
    pub receive_queue_capacity: usize,
    /// Outbound datagram slots.
    pub send_queue_capacity: usize,
    /// Event payload bytes reserved up front. The buffer grows past this
    /// when a tick delivers more.
    pub receive_data_capacity: usize,
    /// Largest message accepted by a fragmentation stage.
    pub fragment_payload_capacity: usize,
    /// Reliable packets in flight per connection (1-32).
    pub reliable_window_size: u8,
    /// Lower bound of the reliable resend timeout.
    pub reliable_minimum_resend_time: Duration,
    /// Upper bound of the reliable resend timeout.
    pub reliable_maximum_resend_time: Duration,
    /// Socket receive buffer size in bytes (None = use system default).
    /// Corresponds to SO_RCVBUF socket option.
    pub socket_recv_buffer_size: Option<usize>,
    /// Socket send buffer size in bytes (None = use system default).
    /// Corresponds to SO_SNDBUF socket option.
    pub socket_send_buffer_size: Option<usize>,
    /// Time-to-live for outgoing packets (None = use system default).
    pub socket_ttl: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(1000),
            max_connect_attempts: 60,
            disconnect_timeout: Duration::from_secs(30),
            heartbeat_timeout: Some(Duration::from_millis(500)),
            max_message_size: DEFAULT_MTU,
            max_connections: None,
            receive_queue_capacity: 512,
            send_queue_capacity: 512,
            receive_data_capacity: 1024 * 1024,
            fragment_payload_capacity: 4096,
            reliable_window_size: MAX_RELIABLE_WINDOW_SIZE,
            reliable_minimum_resend_time: Duration::from_millis(64),
            reliable_maximum_resend_time: Duration::from_millis(200),
            socket_recv_buffer_size: None,
            socket_send_buffer_size: None,
            socket_ttl: None,
        }
    }
}

impl Config {
    /// Checks that every value is usable.
    pub fn validate(&self) -> Result<()> {
        if (self.max_message_size as usize) <= UDP_MAX_HEADER_SIZE {
            return Err(ErrorKind::InvalidConfiguration("max_message_size is smaller than the protocol header"));
        }
        if self.reliable_window_size == 0 || self.reliable_window_size > MAX_RELIABLE_WINDOW_SIZE {
            return Err(ErrorKind::InvalidConfiguration("reliable_window_size must be within 1..=32"));
        }
        if self.reliable_minimum_resend_time > self.reliable_maximum_resend_time {
            return Err(ErrorKind::InvalidConfiguration("minimum resend time exceeds maximum resend time"));
        }
        if self.max_connect_attempts == 0 {
            return Err(ErrorKind::InvalidConfiguration("max_connect_attempts must be at least 1"));
        }
        if self.receive_queue_capacity == 0 || self.send_queue_capacity == 0 {
            return Err(ErrorKind::InvalidConfiguration("queue capacities must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_window_size_bounds() {
        let config = Config { reliable_window_size: 33, ..Config::default() };
        assert!(config.validate().is_err());

        let config = Config { reliable_window_size: 0, ..Config::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resend_bounds_must_be_ordered() {
        let config = Config {
            reliable_minimum_resend_time: Duration::from_millis(300),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_message_size_must_exceed_header() {
        let config = Config { max_message_size: 4, ..Config::default() };
        assert!(config.validate().is_err());
    }
}
