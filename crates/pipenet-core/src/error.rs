//! Error types and status codes.

use std::io;

use thiserror::Error;

/// Integer status codes returned across the driver surface.
///
/// Zero is success, every error is negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(i32)]
pub enum StatusCode {
    /// Operation completed.
    #[error("success")]
    Success = 0,
    /// Connection id does not refer to a slot in the connection table.
    #[error("connection id does not exist")]
    NetworkIdMismatch = -1,
    /// Connection handle refers to a recycled slot.
    #[error("connection version does not match")]
    VersionMismatch = -2,
    /// Operation is not valid in the current connection or driver state.
    #[error("invalid state for this operation")]
    StateMismatch = -3,
    /// Payload does not fit in the available buffer.
    #[error("packet does not fit in the buffer")]
    PacketOverflow = -4,
    /// No free slot in the outbound queue.
    #[error("send queue is full")]
    SendQueueFull = -5,
    /// Malformed header.
    #[error("invalid header")]
    HeaderInvalid = -6,
    /// Connection already used by another concurrent send.
    #[error("connection used by more than one concurrent send")]
    ParallelForErr = -7,
    /// Send handle is not valid for this queue.
    #[error("invalid send handle")]
    SendHandleInvalid = -8,
    /// An argument does not match what the driver expects.
    #[error("argument mismatch")]
    ArgumentMismatch = -9,
}

impl StatusCode {
    /// Returns the integer value of the status code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Maps an integer back onto a status code.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => StatusCode::Success,
            -1 => StatusCode::NetworkIdMismatch,
            -2 => StatusCode::VersionMismatch,
            -3 => StatusCode::StateMismatch,
            -4 => StatusCode::PacketOverflow,
            -5 => StatusCode::SendQueueFull,
            -6 => StatusCode::HeaderInvalid,
            -7 => StatusCode::ParallelForErr,
            -8 => StatusCode::SendHandleInvalid,
            -9 => StatusCode::ArgumentMismatch,
            _ => return None,
        })
    }

    /// Returns true for [`StatusCode::Success`].
    pub fn is_success(self) -> bool {
        self == StatusCode::Success
    }
}

/// Errors raised by the transport.
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// A driver operation failed with a status code.
    #[error(transparent)]
    Status(#[from] StatusCode),
    /// The underlying interface reported an I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    /// The reliable window has no free slot for another packet.
    #[error("reliable window is full")]
    OutgoingQueueIsFull,
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(&'static str),
    /// An endpoint could not be parsed or is not valid for this interface.
    #[error("invalid endpoint")]
    InvalidEndpoint,
    /// Another interface is already bound to the endpoint.
    #[error("address already in use")]
    AddressInUse,
    /// Pipelines can no longer be created once a connection exists.
    #[error("pipelines cannot be created after connections exist")]
    PipelinesLocked,
    /// The interface has not been bound yet.
    #[error("interface is not bound")]
    NotBound,
}

impl ErrorKind {
    /// Maps the error onto the integer status contract.
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorKind::Status(code) => *code,
            ErrorKind::OutgoingQueueIsFull => StatusCode::SendQueueFull,
            ErrorKind::InvalidConfiguration(_)
            | ErrorKind::InvalidEndpoint
            | ErrorKind::AddressInUse => StatusCode::ArgumentMismatch,
            ErrorKind::PipelinesLocked | ErrorKind::NotBound | ErrorKind::IoError(_) => {
                StatusCode::StateMismatch
            }
        }
    }
}

/// Convenience result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, ErrorKind>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip() {
        for code in 0..=9 {
            let status = StatusCode::from_code(-code).unwrap();
            assert_eq!(status.code(), -code);
        }
        assert_eq!(StatusCode::from_code(-10), None);
        assert_eq!(StatusCode::from_code(1), None);
    }

    #[test]
    fn test_error_kind_maps_to_status() {
        assert_eq!(ErrorKind::from(StatusCode::VersionMismatch).status(), StatusCode::VersionMismatch);
        assert_eq!(ErrorKind::OutgoingQueueIsFull.status(), StatusCode::SendQueueFull);
        assert_eq!(ErrorKind::PipelinesLocked.status(), StatusCode::StateMismatch);
        assert!(StatusCode::Success.is_success());
    }
}
