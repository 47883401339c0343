//! Network interface abstraction for pluggable datagram transports.

use crate::{
    endpoint::Endpoint,
    error::Result,
    packet_pool::{ReceiveQueue, SendQueue},
};

/// Low-level datagram transport.
///
/// An interface moves raw datagrams between the wire and the driver's queues.
/// It knows nothing about connections or pipelines. The driver calls
/// [`NetworkInterface::schedule_receive`] and [`NetworkInterface::schedule_send`]
/// once per tick, in that order, after all connection bookkeeping is done.
pub trait NetworkInterface: Send {
    /// Binds the interface to a local endpoint.
    fn bind(&mut self, endpoint: &Endpoint) -> Result<()>;

    /// Starts accepting datagrams from unknown peers. Most interfaces have nothing to do.
    fn listen(&mut self) -> Result<()> {
        Ok(())
    }

    /// Endpoint the interface is bound to.
    fn local_endpoint(&self) -> Result<Endpoint>;

    /// Endpoint meaning "any local address" for this medium.
    fn any_endpoint(&self) -> Endpoint;

    /// Parses a medium-specific address into an endpoint.
    fn create_endpoint(&self, address: &str) -> Result<Endpoint>;

    /// Appends every datagram waiting on the medium to `queue`. Returns how many were appended.
    fn schedule_receive(&mut self, queue: &mut ReceiveQueue) -> Result<usize>;

    /// Writes every committed datagram in `queue` to the medium. Returns how many were sent.
    fn schedule_send(&mut self, queue: &SendQueue) -> Result<usize>;
}
