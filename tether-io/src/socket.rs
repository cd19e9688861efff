//! UDP socket wrapper for Tether
//!
//! One bound datagram socket shared by the receive thread (blocking reads with
//! a timeout) and the writers (sends are serialized by the owner).

use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, ErrorKind};
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Socket configuration errors
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid socket address")]
    InvalidAddress,
}

/// Bound UDP socket
///
/// Reads block for at most the configured read timeout, so a receive loop can
/// notice shutdown requests between datagrams.
pub struct DatagramSocket {
    inner: Socket,
}

impl DatagramSocket {
    /// Create a socket bound to `addr` with the given read timeout
    pub fn bind(addr: SocketAddr, read_timeout: Duration) -> Result<Self, SocketError> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;

        // A zero timeout means "block forever" to the OS, which would keep the
        // receive thread from ever observing shutdown.
        let read_timeout = read_timeout.max(Duration::from_millis(1));
        socket.set_read_timeout(Some(read_timeout))?;

        tracing::debug!("Bound datagram socket on {}", addr);
        Ok(DatagramSocket { inner: socket })
    }

    /// Set the receive buffer size
    pub fn set_recv_buffer_size(&self, size: usize) -> Result<(), SocketError> {
        self.inner.set_recv_buffer_size(size)?;
        Ok(())
    }

    /// Get the local address this socket is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        self.inner
            .local_addr()?
            .as_socket()
            .ok_or(SocketError::InvalidAddress)
    }

    /// Send one datagram to `target`
    pub fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, SocketError> {
        Ok(self.inner.send_to(buf, &target.into())?)
    }

    /// Receive one datagram
    ///
    /// Returns `Ok(None)` when the read timeout elapsed without data.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, SocketError> {
        // SAFETY: `buf` is initialized memory and the kernel only writes into it.
        let uninit_buf = unsafe {
            std::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut MaybeUninit<u8>, buf.len())
        };

        match self.inner.recv_from(uninit_buf) {
            Ok((n, addr)) => Ok(Some((n, addr.as_socket().ok_or(SocketError::InvalidAddress)?))),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            // Windows reports ICMP port unreachable from an earlier send as a
            // receive error; it says nothing about this socket.
            Err(e) if e.kind() == ErrorKind::ConnectionReset => Ok(None),
            Err(e) => Err(SocketError::Io(e)),
        }
    }

    /// Clone the handle so reads and writes can happen on different threads
    pub fn try_clone(&self) -> Result<Self, SocketError> {
        Ok(DatagramSocket {
            inner: self.inner.try_clone()?,
        })
    }
}
