//! Raw-socket ICMP diagnostics: ping, traceroute and subnet scanning over
//! IPv4.
//!
//! Each operation streams its human-readable report lines through an
//! optional `tokio::sync::mpsc::UnboundedSender<String>` and closes it on
//! completion; pass `None` for a silent run. Opening the raw sockets
//! requires the usual elevated privilege, which is the caller's problem.

pub mod icmp;
pub mod internet;
pub mod ping;
pub mod scan;
pub mod socket;
pub mod trace;

pub use icmp::{build_echo_request, parse_reply, DecodeError, Reply};
pub use ping::{PingStats, Pinger};
pub use scan::Scanner;
pub use socket::RawSocket;
pub use trace::Tracer;

pub use pnet::packet::icmp::{IcmpCode, IcmpType};

use pnet::ipnetwork::IpNetworkError;
use std::fmt;
use std::io;

/// Construction failures. Transport and decode problems never surface here:
/// the former go to the output sink, the latter are discarded by design.
#[derive(Debug)]
pub enum Error {
    Resolve { host: String, source: io::Error },
    NoIpv4Address { host: String },
    InvalidCidr { cidr: String, source: IpNetworkError },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Resolve { host, source } => write!(f, "failed to resolve {}: {}", host, source),
            Error::NoIpv4Address { host } => write!(f, "no IPv4 address for {}", host),
            Error::InvalidCidr { cidr, source } => write!(f, "invalid CIDR {}: {}", cidr, source),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Resolve { source, .. } => Some(source),
            Error::InvalidCidr { source, .. } => Some(source),
            Error::NoIpv4Address { .. } => None,
        }
    }
}
