//! Medium-agnostic endpoint identifiers.
//!
//! An [`Endpoint`] is an opaque byte blob produced by a network interface. The
//! driver never looks inside it; it only compares endpoints for equality and
//! hands them back to the interface that created them.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

/// Maximum number of bytes an endpoint may hold.
pub const MAX_ENDPOINT_SIZE: usize = 56;

const FAMILY_IPC: u8 = 1;
const FAMILY_IPV4: u8 = 2;
const FAMILY_IPV6: u8 = 3;

/// Fixed-size, opaque endpoint. Equality is byte equality over the used length.
#[derive(Clone, Copy)]
pub struct Endpoint {
    data: [u8; MAX_ENDPOINT_SIZE],
    len: u8,
}

impl Endpoint {
    /// Builds an endpoint from raw bytes. Returns `None` if `bytes` is too long.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > MAX_ENDPOINT_SIZE {
            return None;
        }
        let mut data = [0u8; MAX_ENDPOINT_SIZE];
        data[..bytes.len()].copy_from_slice(bytes);
        Some(Self { data, len: bytes.len() as u8 })
    }

    /// Raw bytes of the endpoint.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// Number of bytes in use.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Returns true for the empty endpoint.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// In-process loopback endpoint. Id 0 means "any".
    pub fn ipc(id: u32) -> Self {
        let mut data = [0u8; MAX_ENDPOINT_SIZE];
        data[0] = FAMILY_IPC;
        data[1..5].copy_from_slice(&id.to_be_bytes());
        Self { data, len: 5 }
    }

    /// Returns the loopback id if this is an IPC endpoint.
    pub fn ipc_id(&self) -> Option<u32> {
        if self.len != 5 || self.data[0] != FAMILY_IPC {
            return None;
        }
        let mut id = [0u8; 4];
        id.copy_from_slice(&self.data[1..5]);
        Some(u32::from_be_bytes(id))
    }

    /// Decodes a socket address if this is an IP endpoint.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        let port = |at: usize| u16::from_be_bytes([self.data[at], self.data[at + 1]]);
        match (self.data[0], self.len) {
            (FAMILY_IPV4, 7) => {
                let ip = Ipv4Addr::new(self.data[1], self.data[2], self.data[3], self.data[4]);
                Some(SocketAddr::new(IpAddr::V4(ip), port(5)))
            }
            (FAMILY_IPV6, 19) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&self.data[1..17]);
                Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port(17)))
            }
            _ => None,
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        let mut data = [0u8; MAX_ENDPOINT_SIZE];
        let len = match addr.ip() {
            IpAddr::V4(ip) => {
                data[0] = FAMILY_IPV4;
                data[1..5].copy_from_slice(&ip.octets());
                data[5..7].copy_from_slice(&addr.port().to_be_bytes());
                7
            }
            IpAddr::V6(ip) => {
                data[0] = FAMILY_IPV6;
                data[1..17].copy_from_slice(&ip.octets());
                data[17..19].copy_from_slice(&addr.port().to_be_bytes());
                19
            }
        };
        Self { data, len }
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Endpoint {}

impl std::hash::Hash for Endpoint {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self { data: [0u8; MAX_ENDPOINT_SIZE], len: 0 }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(addr) = self.to_socket_addr() {
            return write!(f, "{}", addr);
        }
        if let Some(id) = self.ipc_id() {
            return write!(f, "ipc:{}", id);
        }
        write!(f, "endpoint{:02x?}", self.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_addr_round_trip() {
        let v4: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let v6: SocketAddr = "[::1]:9001".parse().unwrap();

        assert_eq!(Endpoint::from(v4).to_socket_addr(), Some(v4));
        assert_eq!(Endpoint::from(v6).to_socket_addr(), Some(v6));
        assert_eq!(Endpoint::from(v4).ipc_id(), None);
    }

    #[test]
    fn test_ipc_endpoint() {
        let endpoint = Endpoint::ipc(42);
        assert_eq!(endpoint.ipc_id(), Some(42));
        assert_eq!(endpoint.to_socket_addr(), None);
        assert_eq!(endpoint.to_string(), "ipc:42");
    }

    #[test]
    fn test_equality_ignores_unused_bytes() {
        let a = Endpoint::from_bytes(&[1, 2, 3]).unwrap();
        let b = Endpoint::from_bytes(&[1, 2, 3]).unwrap();
        let c = Endpoint::from_bytes(&[1, 2]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_rejects_oversized_blob() {
        assert!(Endpoint::from_bytes(&[0u8; MAX_ENDPOINT_SIZE]).is_some());
        assert!(Endpoint::from_bytes(&[0u8; MAX_ENDPOINT_SIZE + 1]).is_none());
    }
}
