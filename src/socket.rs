
use crate::address::Address;

use std::io;
use std::net;
use std::time::Duration;

pub(crate) enum WaitStatus {
    Ready,
    TimedOut,
    Interrupted,
}

/// A non-blocking UDP socket bound to an IPv6 address, accepting
/// IPv4-mapped traffic where the platform allows dual-stack sockets.
pub(crate) struct Socket {
    socket: net::UdpSocket,
}

impl Socket {
    /// Binds to `address`, or to an OS-assigned port on the wildcard
    /// address for client-only hosts.
    pub fn bind(address: Option<Address>) -> io::Result<Self> {
        let socket = match address {
            Some(address) => net::UdpSocket::bind(address.to_socket_addr())?,
            None => net::UdpSocket::bind((net::Ipv6Addr::UNSPECIFIED, 0))?,
        };

        socket.set_nonblocking(true)?;

        Ok(Self { socket })
    }

    pub fn local_address(&self) -> io::Result<Address> {
        self.socket.local_addr().map(Address::from)
    }

    /// Sends one datagram. A full send buffer is not an error; the datagram
    /// is dropped and the protocol's retransmission recovers it.
    pub fn send(&self, address: Address, data: &[u8]) -> io::Result<usize> {
        match self.socket.send_to(data, address.to_socket_addr()) {
            Ok(sent) => Ok(sent),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(error) => Err(error),
        }
    }

    /// Receives one datagram into `buffer`, returning `None` when nothing
    /// is queued. Interrupted reads are reported as empty reads.
    pub fn receive(&self, buffer: &mut [u8]) -> io::Result<Option<(usize, Address)>> {
        match self.socket.recv_from(buffer) {
            Ok((length, address)) => Ok(Some((length, Address::from(address)))),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Blocks until a datagram is ready to read, the timeout elapses, or
    /// the wait is interrupted by a signal. The socket is returned to
    /// non-blocking mode before this call returns.
    pub fn wait(&self, timeout_ms: u32) -> io::Result<WaitStatus> {
        self.socket.set_nonblocking(false)?;
        self.socket
            .set_read_timeout(Some(Duration::from_millis(timeout_ms.max(1) as u64)))?;

        let mut probe = [0u8; 1];
        let result = self.socket.peek_from(&mut probe);

        self.socket.set_nonblocking(true)?;

        match result {
            Ok(_) => Ok(WaitStatus::Ready),
            Err(error)
                if error.kind() == io::ErrorKind::WouldBlock
                    || error.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(WaitStatus::TimedOut)
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {
                Ok(WaitStatus::Interrupted)
            }
            Err(error) => Err(error),
        }
    }
}
