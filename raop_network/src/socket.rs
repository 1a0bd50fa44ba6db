//! The datagram socket seam.
//!
//! Every loop in this crate is generic over [`DatagramSocket`], so tests can substitute
//! sockets that fail, stall or record what is sent through them.

use core::{net::SocketAddr, time::Duration};

/// The subset of [`std::net::UdpSocket`] the receivers need.
///
/// Implementations must be usable from several threads at once: the control socket, for
/// example, is read by the control receiver while the playback thread sends resend
/// requests through it.
pub trait DatagramSocket: Send + Sync + 'static {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> std::io::Result<usize>;

    fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)>;

    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()>;

    fn set_write_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()>;

    fn local_addr(&self) -> std::io::Result<SocketAddr>;
}

impl DatagramSocket for std::net::UdpSocket {
    #[inline(always)]
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> std::io::Result<usize> {
        std::net::UdpSocket::send_to(self, buf, addr)
    }

    #[inline(always)]
    fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        std::net::UdpSocket::recv_from(self, buf)
    }

    #[inline(always)]
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        std::net::UdpSocket::set_read_timeout(self, timeout)
    }

    #[inline(always)]
    fn set_write_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        std::net::UdpSocket::set_write_timeout(self, timeout)
    }

    #[inline(always)]
    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        std::net::UdpSocket::local_addr(self)
    }
}

impl<T: DatagramSocket> DatagramSocket for std::sync::Arc<T> {
    #[inline(always)]
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> std::io::Result<usize> {
        T::send_to(self, buf, addr)
    }

    #[inline(always)]
    fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        T::recv_from(self, buf)
    }

    #[inline(always)]
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        T::set_read_timeout(self, timeout)
    }

    #[inline(always)]
    fn set_write_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        T::set_write_timeout(self, timeout)
    }

    #[inline(always)]
    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        T::local_addr(self)
    }
}

/// Sends `bytes` as a single datagram, treating a partial send as an error.
#[inline]
pub(crate) fn send_packet(
    sock: &impl DatagramSocket,
    bytes: &[u8],
    dest_addr: SocketAddr,
) -> std::io::Result<()> {
    sock.send_to(bytes, dest_addr).and_then(|n| {
        (n == bytes.len())
            .then_some(())
            .ok_or(std::io::ErrorKind::WriteZero.into())
    })
}

#[inline(always)]
pub(crate) fn io_err_is_timeout(e: std::io::ErrorKind) -> bool {
    use std::io::ErrorKind::*;
    [WouldBlock, TimedOut].contains(&e)
}
