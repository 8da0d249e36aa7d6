//! The one UDP socket a session owns.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use tracing::{debug, trace};

/// Plug datagrams are at most 42 bytes; 1024 leaves plenty of slack for
/// whatever else arrives on the shared port.
const RECV_BUFFER: usize = 1024;

/// A broadcast-capable UDP socket bound to the protocol port.
///
/// The socket is acquired at construction and released when the transport is
/// dropped, on every exit path.  There is exactly one per session: the plug
/// addresses all replies to the fixed port, so a second bound socket on the
/// same host cannot coexist with this one.
pub struct Transport {
    sock: UdpSocket,
}

impl Transport {
    /// Binds the fixed protocol port (10000) on all interfaces and enables
    /// broadcast sends.
    ///
    /// Fails when another session already holds the port.
    pub fn bind() -> io::Result<Transport> {
        Transport::bind_to(orvibo_core::PORT)
    }

    /// Binds an arbitrary local port.  Port 0 picks an ephemeral port, which
    /// is how the tests talk to an in-process fake plug.
    pub fn bind_to(port: u16) -> io::Result<Transport> {
        let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        sock.set_broadcast(true)?;
        debug!(addr = %sock.local_addr()?, "bound protocol socket");
        Ok(Transport { sock })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    /// Sends one frame to a specific destination.
    pub fn send(&self, frame: &[u8], dest: SocketAddr) -> io::Result<()> {
        trace!(bytes = frame.len(), %dest, "send");
        self.sock.send_to(frame, dest)?;
        Ok(())
    }

    /// Sends one frame to the subnet broadcast address on the protocol port.
    pub fn broadcast(&self, frame: &[u8]) -> io::Result<()> {
        trace!(bytes = frame.len(), "broadcast");
        self.sock
            .send_to(frame, (Ipv4Addr::BROADCAST, orvibo_core::PORT))?;
        Ok(())
    }

    /// Receives one datagram.
    ///
    /// `Ok(None)` means the timeout elapsed with nothing to read.  A timeout
    /// of `None` blocks indefinitely; command acknowledgments should instead
    /// go through the controller's deadline-and-cancel wait.
    pub fn recv(&self, timeout: Option<Duration>) -> io::Result<Option<(Vec<u8>, SocketAddr)>> {
        self.sock.set_read_timeout(timeout)?;
        let mut buf = [0u8; RECV_BUFFER];
        match self.sock.recv_from(&mut buf) {
            Ok((n, src)) => {
                trace!(bytes = n, %src, "recv");
                Ok(Some((buf[..n].to_vec(), src)))
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
