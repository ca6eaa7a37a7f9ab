//! Raw ICMP endpoint bound to a single destination.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

/// Large enough for an Echo Reply or a Time Exceeded quoting our probe.
pub const RECV_BUFFER_LEN: usize = 128;

/// A raw ICMPv4 socket with matching send and receive timeouts.
///
/// The endpoint closes when the last owner drops it; probe loops rely on
/// that by handing the receive worker its own reference. No call here is
/// retried, failures belong to the caller.
pub struct RawSocket {
    socket: Socket,
    peer: SockAddr,
}

impl RawSocket {
    pub fn open(dest: Ipv4Addr, timeout: Duration) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
        socket.set_write_timeout(Some(timeout))?;
        socket.set_read_timeout(Some(timeout))?;
        Ok(Self {
            socket,
            peer: SockAddr::from(SocketAddrV4::new(dest, 0)),
        })
    }

    pub fn send(&self, datagram: &[u8]) -> io::Result<()> {
        self.socket.send_to(datagram, &self.peer).map(|_| ())
    }

    /// Blocks for one datagram or the configured timeout, whichever comes
    /// first, and reports who sent it.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Ipv4Addr)> {
        // u8 and MaybeUninit<u8> share a layout; recv only ever writes.
        let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
        let (size, from) = self.socket.recv_from(uninit)?;
        let sender = from
            .as_socket_ipv4()
            .map(|addr| *addr.ip())
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        Ok((size, sender))
    }

    /// Hop limit for subsequent sends. Plain ping leaves the platform
    /// default in place.
    pub fn set_ttl(&self, ttl: u32) -> io::Result<()> {
        self.socket.set_ttl(ttl)
    }
}

/// An elapsed receive timeout, the expected steady-state outcome of waiting
/// on a probe. The kernel reports it as either kind depending on platform.
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
