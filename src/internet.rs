use crate::Error;
use dns_lookup::lookup_host;
use std::net::{IpAddr, Ipv4Addr};

/// Resolves a host name (or address literal) to an IPv4 address, failing
/// fast when the name does not resolve or only yields IPv6 records.
pub fn resolve_ipv4(host: &str) -> Result<Ipv4Addr, Error> {
    let addrs = lookup_host(host).map_err(|source| Error::Resolve {
        host: host.to_string(),
        source,
    })?;
    addrs
        .into_iter()
        .filter_map(|addr| match addr {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .last()
        .ok_or_else(|| Error::NoIpv4Address {
            host: host.to_string(),
        })
}
