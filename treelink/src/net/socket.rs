//! UDP socket wrapper for mio-based I/O.
//!
//! Thin wrapper around [`mio::net::UdpSocket`] used by the discovery probe
//! sockets (one per interface) and the connector's time-sync unit.

use std::io::{self, ErrorKind};
use std::os::fd::{AsFd, BorrowedFd};

use mio::event::Source;
use mio::net::UdpSocket as MioUdpSocket;
use mio::{Interest, Registry, Token};

use super::Endpoint;

/// A non-blocking UDP socket.
pub struct UdpSocket {
    inner: MioUdpSocket,
}

impl UdpSocket {
    /// Creates a new UDP socket bound to the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound (e.g., address in use).
    pub fn bind(endpoint: Endpoint) -> io::Result<Self> {
        let inner = MioUdpSocket::bind(endpoint.into())?;
        Ok(Self { inner })
    }

    /// Binds to `endpoint` and prepares the socket for sending multicast
    /// probes: loopback delivery on (so a server on the same host sees them),
    /// TTL as given, broadcast permitted.
    ///
    /// # Errors
    ///
    /// Returns an error if binding or any socket option fails.
    pub fn bind_multicast_sender(endpoint: Endpoint, ttl: u32) -> io::Result<Self> {
        let socket = Self::bind(endpoint)?;
        socket.inner.set_multicast_loop_v4(true)?;
        socket.inner.set_multicast_ttl_v4(ttl)?;
        socket.inner.set_broadcast(true)?;
        Ok(socket)
    }

    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.inner.local_addr().map(Endpoint::from)
    }

    /// Sends a datagram to the specified endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or if the socket would block.
    pub fn send_to(&self, buf: &[u8], dest: Endpoint) -> io::Result<usize> {
        self.inner.send_to(buf, dest.into())
    }

    /// Receives a datagram from the socket.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or if the socket would block.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Endpoint)> {
        self.inner
            .recv_from(buf)
            .map(|(n, addr)| (n, Endpoint::from(addr)))
    }

    /// Attempts to send, returning `Ok(None)` instead of `WouldBlock`.
    ///
    /// # Errors
    ///
    /// Returns any I/O error other than `WouldBlock`.
    pub fn try_send_to(&self, buf: &[u8], dest: Endpoint) -> io::Result<Option<usize>> {
        match self.send_to(buf, dest) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Attempts to receive, returning `Ok(None)` instead of `WouldBlock`.
    ///
    /// Reactors call this in a loop after a readable event until it returns
    /// `None`, since mio readiness is edge-triggered.
    ///
    /// # Errors
    ///
    /// Returns any I/O error other than `WouldBlock`.
    pub fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, Endpoint)>> {
        match self.recv_from(buf) {
            Ok((n, ep)) => Ok(Some((n, ep))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Sets the socket's receive buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        // mio doesn't expose buffer sizes
        rustix::net::sockopt::set_socket_recv_buffer_size(self.inner.as_fd(), size)?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the option cannot be retrieved.
    pub fn recv_buffer_size(&self) -> io::Result<usize> {
        Ok(rustix::net::sockopt::get_socket_recv_buffer_size(
            self.inner.as_fd(),
        )?)
    }
}

impl AsFd for UdpSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl Source for UdpSocket {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.inner.deregister(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_send_recv_loopback() {
        let sender = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let receiver = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let receiver_addr = receiver.local_addr().unwrap();

        let msg = b"probe";
        assert_eq!(sender.send_to(msg, receiver_addr).unwrap(), msg.len());

        // Non-blocking: spin briefly until the datagram lands.
        let mut buf = [0u8; 64];
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(1);
        let (received, from) = loop {
            if let Some(got) = receiver.try_recv_from(&mut buf).unwrap() {
                break got;
            }
            assert!(std::time::Instant::now() < deadline, "datagram never arrived");
            std::thread::sleep(std::time::Duration::from_millis(1));
        };
        assert_eq!(&buf[..received], msg);
        assert_eq!(from, sender.local_addr().unwrap());
    }

    #[test]
    fn socket_try_recv_empty() {
        let socket = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let mut buf = [0u8; 64];
        assert!(socket.try_recv_from(&mut buf).unwrap().is_none());
    }

    #[test]
    fn multicast_sender_options_apply() {
        let socket = UdpSocket::bind_multicast_sender(Endpoint::localhost(0), 4).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
        socket.set_recv_buffer_size(256 * 1024).unwrap();
        assert!(socket.recv_buffer_size().unwrap() > 0);
    }
}
