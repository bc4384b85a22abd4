//! Outbound datagram abstraction.

use std::io::Result;

/// Destination for datagrams assembled by a peer.
///
/// The host owning the socket implements this; a peer never touches the
/// socket directly. Each call carries exactly one datagram.
pub trait DatagramSink {
    /// Transmits a single datagram to the remote endpoint.
    fn send_datagram(&mut self, datagram: &[u8]) -> Result<()>;
}

/// Collects datagrams in memory, useful for hosts that batch sends and for tests.
impl DatagramSink for Vec<Vec<u8>> {
    fn send_datagram(&mut self, datagram: &[u8]) -> Result<()> {
        self.push(datagram.to_vec());
        Ok(())
    }
}

impl<T: DatagramSink + ?Sized> DatagramSink for &mut T {
    fn send_datagram(&mut self, datagram: &[u8]) -> Result<()> {
        (**self).send_datagram(datagram)
    }
}
