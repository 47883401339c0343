use std::{
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket},
};

use pipenet_core::{Config, Endpoint, ErrorKind, NetworkInterface, ReceiveQueue, Result, SendQueue, StatusCode};
use socket2::Socket as Socket2;
use tracing::{debug, error, warn};

/// Applies socket options from configuration to a UdpSocket.
fn apply_socket_options(socket: &UdpSocket, config: &Config) -> io::Result<()> {
    let socket2 = Socket2::from(socket.try_clone()?);

    if let Some(size) = config.socket_recv_buffer_size {
        socket2.set_recv_buffer_size(size)?;
    }
    if let Some(size) = config.socket_send_buffer_size {
        socket2.set_send_buffer_size(size)?;
    }
    if let Some(ttl) = config.socket_ttl {
        socket.set_ttl(ttl)?;
    }
    Ok(())
}

/// Non-blocking UDP interface. Endpoints are socket addresses.
#[derive(Debug)]
pub struct UdpInterface {
    config: Config,
    socket: Option<UdpSocket>,
    buffer: Vec<u8>,
}

impl UdpInterface {
    /// Creates an unbound interface. Socket options are taken from `config`.
    pub fn new(config: &Config) -> Self {
        // One spare byte to detect oversized datagrams.
        let buffer = vec![0; config.max_message_size as usize + 1];
        Self { config: config.clone(), socket: None, buffer }
    }

    fn socket(&self) -> Result<&UdpSocket> {
        self.socket.as_ref().ok_or(ErrorKind::NotBound)
    }
}

impl Default for UdpInterface {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}

impl NetworkInterface for UdpInterface {
    fn bind(&mut self, endpoint: &Endpoint) -> Result<()> {
        if self.socket.is_some() {
            return Err(StatusCode::StateMismatch.into());
        }
        let address = endpoint.to_socket_addr().ok_or(ErrorKind::InvalidEndpoint)?;
        let socket = UdpSocket::bind(address).map_err(|error| match error.kind() {
            io::ErrorKind::AddrInUse => ErrorKind::AddressInUse,
            _ => ErrorKind::IoError(error),
        })?;
        socket.set_nonblocking(true)?;
        apply_socket_options(&socket, &self.config)?;
        debug!(local = ?socket.local_addr().ok(), "udp socket bound");
        self.socket = Some(socket);
        Ok(())
    }

    fn local_endpoint(&self) -> Result<Endpoint> {
        Ok(Endpoint::from(self.socket()?.local_addr()?))
    }

    fn any_endpoint(&self) -> Endpoint {
        Endpoint::from(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))
    }

    fn create_endpoint(&self, address: &str) -> Result<Endpoint> {
        let mut addresses = address.to_socket_addrs().map_err(|_| ErrorKind::InvalidEndpoint)?;
        addresses.next().map(Endpoint::from).ok_or(ErrorKind::InvalidEndpoint)
    }

    fn schedule_receive(&mut self, queue: &mut ReceiveQueue) -> Result<usize> {
        let socket = self.socket.as_ref().ok_or(ErrorKind::NotBound)?;
        let mut received = 0;
        while !queue.is_full() {
            match socket.recv_from(&mut self.buffer) {
                Ok((len, from)) => {
                    if queue.push(Endpoint::from(from), &self.buffer[..len]) {
                        received += 1;
                    } else {
                        warn!(%from, len, "dropping oversized datagram");
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                // ICMP port unreachable from an earlier send surfaces here on some platforms.
                Err(error) if matches!(error.kind(), io::ErrorKind::ConnectionReset | io::ErrorKind::Interrupted) => {
                    continue
                }
                Err(error) => return Err(error.into()),
            }
        }
        Ok(received)
    }

    fn schedule_send(&mut self, queue: &SendQueue) -> Result<usize> {
        let socket = self.socket()?;
        let mut sent = 0;
        for packet in queue.drain() {
            match packet.endpoint.to_socket_addr() {
                Some(address) => match socket.send_to(&packet.data, address) {
                    Ok(_) => sent += 1,
                    Err(error) => error!(%address, %error, "failed to send datagram"),
                },
                None => warn!(endpoint = %packet.endpoint, "dropping datagram to a non-ip endpoint"),
            }
            queue.recycle(packet);
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use std::{thread::sleep, time::Duration};

    use super::*;

    fn loopback(interface: &UdpInterface) -> Endpoint {
        interface.create_endpoint("127.0.0.1:0").unwrap()
    }

    #[test]
    fn test_loopback_round_trip() {
        let mut a = UdpInterface::default();
        let mut b = UdpInterface::default();
        a.bind(&loopback(&a)).unwrap();
        b.bind(&loopback(&b)).unwrap();
        let to = b.local_endpoint().unwrap();

        let queue = SendQueue::new(4, 64);
        queue.push(to, b"ping").unwrap();
        assert_eq!(a.schedule_send(&queue).unwrap(), 1);

        let mut received = ReceiveQueue::new(4, 64);
        for _ in 0..200 {
            if b.schedule_receive(&mut received).unwrap() > 0 {
                break;
            }
            sleep(Duration::from_millis(5));
        }
        assert_eq!(received.get(0), Some((a.local_endpoint().unwrap(), &b"ping"[..])));
    }

    #[test]
    fn test_unbound_interface() {
        let mut interface = UdpInterface::default();
        assert!(matches!(interface.local_endpoint(), Err(ErrorKind::NotBound)));
        let mut queue = ReceiveQueue::new(1, 16);
        assert!(matches!(interface.schedule_receive(&mut queue), Err(ErrorKind::NotBound)));
    }

    #[test]
    fn test_create_endpoint() {
        let interface = UdpInterface::default();
        let endpoint = interface.create_endpoint("127.0.0.1:9000").unwrap();
        assert_eq!(endpoint.to_socket_addr(), Some("127.0.0.1:9000".parse().unwrap()));
        assert!(interface.create_endpoint("not an address").is_err());
        assert_eq!(interface.any_endpoint().to_socket_addr(), Some("0.0.0.0:0".parse().unwrap()));
    }
}
