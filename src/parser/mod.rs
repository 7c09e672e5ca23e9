//! Packet parser: decodes a raw IP datagram into [`PacketMetadata`] without
//! copying, layering DNS answer extraction and TLS ClientHello SNI
//! extraction on top of the IPv4/IPv6/TCP/UDP decode already used by the
//! connection table's smoltcp device.

pub mod tls;

pub use crate::device::ParseError;
use crate::device::{self, ParsedPacket};
use crate::dns::{self, DnsMapping};
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
    Other,
}

/// Output of a single [`parse`] call. Never mutated after construction;
/// safe to share read-only across the host tracker, metrics, and policy
/// lookups that all consume the same parse result.
#[derive(Debug, Clone)]
pub struct PacketMetadata {
    pub ip_version: IpVersion,
    pub transport: Transport,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub length: usize,
    pub dns_query_name: Option<String>,
    pub dns_answers: Vec<DnsMapping>,
    pub tls_sni: Option<String>,
}

/// Decodes `bytes` into [`PacketMetadata`]. Returns `None` when the version
/// nibble isn't 4/6, a length field overflows the buffer, or a required
/// header is truncated. Never panics, never allocates beyond the returned
/// value (aside from the owned strings/vectors DNS/TLS extraction need).
pub fn parse(bytes: &[u8]) -> Option<PacketMetadata> {
    let parsed = device::parse_packet_validated(bytes).ok()?;
    let length = bytes.len();
    let ip_version = if bytes.first().map(|b| b >> 4) == Some(6) {
        IpVersion::V6
    } else {
        IpVersion::V4
    };

    match parsed {
        ParsedPacket::Tcp(tcp) => {
            let tls_sni = tls::extract_sni(tcp.payload);
            Some(PacketMetadata {
                ip_version,
                transport: Transport::Tcp,
                src_addr: tcp.src,
                dst_addr: tcp.dst,
                src_port: Some(tcp.src_port),
                dst_port: Some(tcp.dst_port),
                length,
                dns_query_name: None,
                dns_answers: Vec::new(),
                tls_sni,
            })
        }
        ParsedPacket::Udp(udp) => {
            let mut dns_answers = Vec::new();
            let mut dns_query_name = None;
            if udp.src_port == 53 || udp.dst_port == 53 {
                dns_answers = dns::parse_response(udp.payload);
                dns_query_name = first_question_name(udp.payload);
            }
            Some(PacketMetadata {
                ip_version,
                transport: Transport::Udp,
                src_addr: udp.src,
                dst_addr: udp.dst,
                src_port: Some(udp.src_port),
                dst_port: Some(udp.dst_port),
                length,
                dns_query_name,
                dns_answers,
                tls_sni: None,
            })
        }
        ParsedPacket::Other => {
            // We still want the addresses for policy/metrics even though
            // there is no transport-layer identity.
            let (src, dst) = addresses_only(bytes)?;
            Some(PacketMetadata {
                ip_version,
                transport: Transport::Other,
                src_addr: src,
                dst_addr: dst,
                src_port: None,
                dst_port: None,
                length,
                dns_query_name: None,
                dns_answers: Vec::new(),
                tls_sni: None,
            })
        }
    }
}

fn addresses_only(bytes: &[u8]) -> Option<(IpAddr, IpAddr)> {
    use std::net::{Ipv4Addr, Ipv6Addr};
    let version = bytes.first()? >> 4;
    match version {
        4 => {
            if bytes.len() < 20 {
                return None;
            }
            Some((
                IpAddr::V4(Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15])),
                IpAddr::V4(Ipv4Addr::new(bytes[16], bytes[17], bytes[18], bytes[19])),
            ))
        }
        6 => {
            if bytes.len() < 40 {
                return None;
            }
            let read = |offset: usize| {
                Ipv6Addr::new(
                    u16::from_be_bytes([bytes[offset], bytes[offset + 1]]),
                    u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]),
                    u16::from_be_bytes([bytes[offset + 4], bytes[offset + 5]]),
                    u16::from_be_bytes([bytes[offset + 6], bytes[offset + 7]]),
                    u16::from_be_bytes([bytes[offset + 8], bytes[offset + 9]]),
                    u16::from_be_bytes([bytes[offset + 10], bytes[offset + 11]]),
                    u16::from_be_bytes([bytes[offset + 12], bytes[offset + 13]]),
                    u16::from_be_bytes([bytes[offset + 14], bytes[offset + 15]]),
                )
            };
            Some((IpAddr::V6(read(8)), IpAddr::V6(read(24))))
        }
        _ => None,
    }
}

/// Extracts only the first question name from a DNS message, used to
/// populate `dns_query_name` on both queries and responses without running
/// the full answer walk.
fn first_question_name(payload: &[u8]) -> Option<String> {
    if payload.len() < 12 {
        return None;
    }
    dns::parse_response(payload)
        .first()
        .map(|m| m.host.clone())
        .or_else(|| dns::peek_question_name(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipv4_udp_dns_query(qname: &str) -> Vec<u8> {
        let mut question = Vec::new();
        for label in qname.split('.') {
            question.push(label.len() as u8);
            question.extend_from_slice(label.as_bytes());
        }
        question.push(0);
        question.extend_from_slice(&1u16.to_be_bytes());
        question.extend_from_slice(&1u16.to_be_bytes());

        let mut dns = vec![0x00, 0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        dns.extend_from_slice(&question);

        let mut udp = Vec::new();
        udp.extend_from_slice(&12345u16.to_be_bytes());
        udp.extend_from_slice(&53u16.to_be_bytes());
        let udp_len = (8 + dns.len()) as u16;
        udp.extend_from_slice(&udp_len.to_be_bytes());
        udp.extend_from_slice(&0u16.to_be_bytes());
        udp.extend_from_slice(&dns);

        let total_len = (20 + udp.len()) as u16;
        let mut packet = vec![
            0x45, 0x00,
        ];
        packet.extend_from_slice(&total_len.to_be_bytes());
        packet.extend_from_slice(&[0, 0, 0x40, 0, 64, 17, 0, 0]);
        packet.extend_from_slice(&[192, 0, 2, 10]);
        packet.extend_from_slice(&[1, 1, 1, 1]);
        packet.extend_from_slice(&udp);
        packet
    }

    #[test]
    fn parses_udp_dns_query_name() {
        let packet = ipv4_udp_dns_query("example.com");
        let metadata = parse(&packet).expect("parse succeeds");
        assert_eq!(metadata.transport, Transport::Udp);
        assert_eq!(metadata.dns_query_name.as_deref(), Some("example.com"));
    }

    #[test]
    fn rejects_empty_buffer() {
        assert!(parse(&[]).is_none());
    }

    #[test]
    fn rejects_bad_version_nibble() {
        let packet = vec![0x00; 40];
        assert!(parse(&packet).is_none());
    }
}
