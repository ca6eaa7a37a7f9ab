//! ICMP echo wire format: request construction and reply decoding.

use byteorder::{ByteOrder, LittleEndian};
use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::{EchoRequestPacket, MutableEchoRequestPacket};
use pnet::packet::icmp::time_exceeded::TimeExceededPacket;
use pnet::packet::icmp::{IcmpCode, IcmpType, IcmpTypes};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::Packet;
use pnet::util;
use std::net::Ipv4Addr;

pub const ICMP_HEADER_LEN: usize = 8;
pub const PAYLOAD_LEN: usize = 48;
pub const IP_HEADER_LEN: usize = 20;

/// Leading payload bytes, the rest of the payload stays zero. The total
/// datagram size matches what stock ping tools put on the wire.
const PAYLOAD_PATTERN: [u8; 4] = [0xde, 0xed, 0xbe, 0xef];

/// A decoded inbound datagram.
///
/// Built fresh for every datagram that survives validation and consumed by
/// the probe loop within the same iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub ttl: u8,
    pub icmp_type: IcmpType,
    pub code: IcmpCode,
    pub checksum: u16,
    pub identifier: u16,
    pub sequence: u16,
    pub size: usize,
    pub responder: Ipv4Addr,
}

/// Why an inbound datagram was not a usable reply. The receive loop treats
/// every variant the same way: drop the datagram and keep reading, since it
/// may belong to another process sharing the raw ICMP namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    Truncated,
    LengthMismatch { declared: usize, actual: usize },
    UnsupportedType(u8),
    IdentifierMismatch(u16),
    ChecksumMismatch { transmitted: u16, computed: u16 },
}

/// Builds an Echo Request datagram: 8-byte header, 48-byte payload, RFC 1071
/// checksum over the whole buffer written back big-endian.
pub fn build_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut buf = vec![0u8; ICMP_HEADER_LEN + PAYLOAD_LEN];
    buf[ICMP_HEADER_LEN..ICMP_HEADER_LEN + PAYLOAD_PATTERN.len()].copy_from_slice(&PAYLOAD_PATTERN);
    let mut packet = MutableEchoRequestPacket::new(&mut buf).unwrap();
    packet.set_icmp_type(IcmpTypes::EchoRequest);
    packet.set_icmp_code(IcmpCode::new(0));
    packet.set_identifier(identifier);
    packet.set_sequence_number(sequence);
    let csum = util::checksum(packet.packet(), 1);
    packet.set_checksum(csum);
    buf
}

/// Decodes a raw inbound datagram (IP header included) into a [`Reply`].
///
/// Validation order: declared IP total length, ICMP type, identifier,
/// checksum. Only Echo Reply and Time Exceeded are usable; for Time Exceeded
/// the identifier comes from the quoted original request inside the error
/// payload, because the outer header has none, and the checksum is not
/// re-verified.
pub fn parse_reply(
    datagram: &[u8],
    expected_identifier: u16,
    responder: Ipv4Addr,
) -> Result<Reply, DecodeError> {
    if datagram.len() < IP_HEADER_LEN + ICMP_HEADER_LEN {
        return Err(DecodeError::Truncated);
    }
    // Raw sockets deliver the IP total-length field in host order on the
    // platforms this targets, hence the little-endian read.
    let declared = LittleEndian::read_u16(&datagram[2..4]) as usize;
    let icmp = &datagram[IP_HEADER_LEN..];
    if declared != icmp.len() {
        return Err(DecodeError::LengthMismatch {
            declared,
            actual: icmp.len(),
        });
    }
    let ttl = datagram[8];
    let icmp_type = IcmpType(icmp[0]);

    if icmp_type == IcmpTypes::EchoReply {
        let echo = EchoReplyPacket::new(icmp).ok_or(DecodeError::Truncated)?;
        let identifier = echo.get_identifier();
        if identifier != expected_identifier {
            return Err(DecodeError::IdentifierMismatch(identifier));
        }
        let transmitted = echo.get_checksum();
        let computed = util::checksum(icmp, 1);
        if transmitted != computed {
            return Err(DecodeError::ChecksumMismatch {
                transmitted,
                computed,
            });
        }
        Ok(Reply {
            ttl,
            icmp_type,
            code: echo.get_icmp_code(),
            checksum: transmitted,
            identifier,
            sequence: echo.get_sequence_number(),
            size: icmp.len(),
            responder,
        })
    } else if icmp_type == IcmpTypes::TimeExceeded {
        let exceeded = TimeExceededPacket::new(icmp).ok_or(DecodeError::Truncated)?;
        let original = Ipv4Packet::new(exceeded.payload()).ok_or(DecodeError::Truncated)?;
        let request = EchoRequestPacket::new(original.payload()).ok_or(DecodeError::Truncated)?;
        let identifier = request.get_identifier();
        if identifier != expected_identifier {
            return Err(DecodeError::IdentifierMismatch(identifier));
        }
        Ok(Reply {
            ttl,
            icmp_type,
            code: exceeded.get_icmp_code(),
            checksum: exceeded.get_checksum(),
            identifier,
            sequence: request.get_sequence_number(),
            size: icmp.len(),
            responder,
        })
    } else {
        Err(DecodeError::UnsupportedType(icmp_type.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::BigEndian;

    const RESPONDER: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);

    /// Prepends a minimal IPv4 header, total length in host (little-endian)
    /// order the way the raw socket hands datagrams to us.
    fn wrap_datagram(icmp: &[u8], ttl: u8) -> Vec<u8> {
        let mut datagram = vec![0u8; IP_HEADER_LEN + icmp.len()];
        datagram[0] = 0x45;
        LittleEndian::write_u16(&mut datagram[2..4], icmp.len() as u16);
        datagram[8] = ttl;
        datagram[9] = 1;
        datagram[IP_HEADER_LEN..].copy_from_slice(icmp);
        datagram
    }

    fn echo_reply(identifier: u16, sequence: u16) -> Vec<u8> {
        let mut icmp = build_echo_request(identifier, sequence);
        icmp[0] = 0;
        let csum = util::checksum(&icmp, 1);
        BigEndian::write_u16(&mut icmp[2..4], csum);
        icmp
    }

    /// Time Exceeded carrying the quoted IP header and the head of the
    /// original Echo Request, the way routers quote expired probes.
    fn time_exceeded(identifier: u16, sequence: u16) -> Vec<u8> {
        let mut icmp = vec![0u8; ICMP_HEADER_LEN + IP_HEADER_LEN + ICMP_HEADER_LEN];
        icmp[0] = 11;
        let quoted = &mut icmp[ICMP_HEADER_LEN..];
        quoted[0] = 0x45;
        BigEndian::write_u16(
            &mut quoted[2..4],
            (IP_HEADER_LEN + ICMP_HEADER_LEN + PAYLOAD_LEN) as u16,
        );
        quoted[9] = 1;
        quoted[IP_HEADER_LEN] = 8;
        BigEndian::write_u16(&mut quoted[IP_HEADER_LEN + 4..IP_HEADER_LEN + 6], identifier);
        BigEndian::write_u16(&mut quoted[IP_HEADER_LEN + 6..IP_HEADER_LEN + 8], sequence);
        let csum = util::checksum(&icmp, 1);
        BigEndian::write_u16(&mut icmp[2..4], csum);
        icmp
    }

    #[test]
    fn builds_conventional_echo_request() {
        let request = build_echo_request(0x1234, 7);
        assert_eq!(request.len(), ICMP_HEADER_LEN + PAYLOAD_LEN);
        assert_eq!(request[0], 8);
        assert_eq!(request[1], 0);
        assert_eq!(BigEndian::read_u16(&request[4..6]), 0x1234);
        assert_eq!(BigEndian::read_u16(&request[6..8]), 7);
        assert_eq!(request[8..12], PAYLOAD_PATTERN);
        assert_eq!(
            BigEndian::read_u16(&request[2..4]),
            util::checksum(&request, 1)
        );
    }

    #[test]
    fn checksum_detects_single_bit_corruption() {
        let request = build_echo_request(0xbeef, 3);
        for byte in 0..request.len() {
            for bit in 0..8 {
                let mut corrupted = request.clone();
                corrupted[byte] ^= 1 << bit;
                assert_ne!(
                    BigEndian::read_u16(&corrupted[2..4]),
                    util::checksum(&corrupted, 1),
                    "flip of byte {} bit {} went unnoticed",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn parses_echo_reply() {
        let datagram = wrap_datagram(&echo_reply(0x4242, 5), 57);
        let reply = parse_reply(&datagram, 0x4242, RESPONDER).unwrap();
        assert_eq!(reply.icmp_type, IcmpTypes::EchoReply);
        assert_eq!(reply.identifier, 0x4242);
        assert_eq!(reply.sequence, 5);
        assert_eq!(reply.ttl, 57);
        assert_eq!(reply.size, ICMP_HEADER_LEN + PAYLOAD_LEN);
        assert_eq!(reply.responder, RESPONDER);
    }

    #[test]
    fn rejects_foreign_identifier() {
        let datagram = wrap_datagram(&echo_reply(0x1111, 0), 64);
        assert_eq!(
            parse_reply(&datagram, 0x2222, RESPONDER),
            Err(DecodeError::IdentifierMismatch(0x1111))
        );
    }

    #[test]
    fn rejects_unsupported_type() {
        let mut icmp = echo_reply(0x1234, 0);
        icmp[0] = 3;
        let datagram = wrap_datagram(&icmp, 64);
        assert_eq!(
            parse_reply(&datagram, 0x1234, RESPONDER),
            Err(DecodeError::UnsupportedType(3))
        );
    }

    #[test]
    fn rejects_corrupted_echo_reply() {
        let mut icmp = echo_reply(0x1234, 1);
        icmp[20] ^= 0xff;
        let datagram = wrap_datagram(&icmp, 64);
        assert!(matches!(
            parse_reply(&datagram, 0x1234, RESPONDER),
            Err(DecodeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn rejects_declared_length_mismatch() {
        let mut datagram = wrap_datagram(&echo_reply(0x1234, 0), 64);
        let bogus = (ICMP_HEADER_LEN + PAYLOAD_LEN + 4) as u16;
        LittleEndian::write_u16(&mut datagram[2..4], bogus);
        assert!(matches!(
            parse_reply(&datagram, 0x1234, RESPONDER),
            Err(DecodeError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn total_length_follows_raw_socket_host_order() {
        // A network-order length field must not parse: the kernel flips the
        // field to host order before delivery on the supported platforms.
        let mut datagram = wrap_datagram(&echo_reply(0x1234, 0), 64);
        BigEndian::write_u16(&mut datagram[2..4], (ICMP_HEADER_LEN + PAYLOAD_LEN) as u16);
        assert!(matches!(
            parse_reply(&datagram, 0x1234, RESPONDER),
            Err(DecodeError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn rejects_truncated_datagram() {
        assert_eq!(
            parse_reply(&[0u8; 12], 0x1234, RESPONDER),
            Err(DecodeError::Truncated)
        );
    }

    #[test]
    fn parses_time_exceeded_from_quoted_request() {
        let datagram = wrap_datagram(&time_exceeded(0xcafe, 9), 255);
        let reply = parse_reply(&datagram, 0xcafe, RESPONDER).unwrap();
        assert_eq!(reply.icmp_type, IcmpTypes::TimeExceeded);
        assert_eq!(reply.identifier, 0xcafe);
        assert_eq!(reply.sequence, 9);
        assert_eq!(reply.ttl, 255);
    }

    #[test]
    fn time_exceeded_identifier_still_isolated() {
        let datagram = wrap_datagram(&time_exceeded(0xcafe, 9), 255);
        assert_eq!(
            parse_reply(&datagram, 0xbabe, RESPONDER),
            Err(DecodeError::IdentifierMismatch(0xcafe))
        );
    }

    #[test]
    fn time_exceeded_skips_checksum_validation() {
        // Routers own the outer checksum; correlation only needs the quoted
        // request, so a bad outer checksum must not cost us the hop.
        let mut icmp = time_exceeded(0xcafe, 2);
        icmp[2] ^= 0xff;
        let datagram = wrap_datagram(&icmp, 255);
        assert!(parse_reply(&datagram, 0xcafe, RESPONDER).is_ok());
    }
}
