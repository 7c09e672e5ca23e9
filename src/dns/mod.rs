//! DNS answer parsing shared by the packet parser and the host tracker.

mod system;

pub use system::SystemResolver;

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct DnsMapping {
    pub host: String,
    pub addresses: Vec<IpAddr>,
    pub ttl: Option<u32>,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unsupported hostname")]
    Unsupported,
    #[error("lookup failed: {0}")]
    LookupFailed(String),
}

pub trait Resolver: Send + Sync {
    fn resolve(&self, host: &str) -> Result<ResolveOutcome, ResolveError>;
}

#[derive(Debug, Clone)]
pub struct ResolveOutcome {
    pub addresses: Vec<String>,
    pub ttl: Duration,
}

const TYPE_A: u16 = 1;
const TYPE_CNAME: u16 = 5;
const TYPE_AAAA: u16 = 28;

/// Reads just the first question name out of a DNS message, regardless of
/// whether it is a query or a response. Used for attribution on outbound
/// queries, where there is no answer section to walk yet.
pub fn peek_question_name(payload: &[u8]) -> Option<String> {
    if payload.len() < 12 {
        return None;
    }
    let qd_count = u16::from_be_bytes([payload[4], payload[5]]);
    if qd_count == 0 {
        return None;
    }
    let mut offset = 12;
    read_name(payload, &mut offset)
}

/// Parses a DNS response payload into hostname/address mappings, collapsing
/// CNAME chains to their canonical question name (first matching question,
/// else the first question overall, per the chosen canonicalization rule).
pub fn parse_response(payload: &[u8]) -> Vec<DnsMapping> {
    if payload.len() < 12 {
        return Vec::new();
    }
    let flags = u16::from_be_bytes([payload[2], payload[3]]);
    if flags & 0x8000 == 0 {
        return Vec::new();
    }
    let qd_count = u16::from_be_bytes([payload[4], payload[5]]) as usize;
    let an_count = u16::from_be_bytes([payload[6], payload[7]]) as usize;

    let mut offset = 12;
    let mut questions: Vec<String> = Vec::with_capacity(qd_count);
    for _ in 0..qd_count {
        let Some(name) = read_name(payload, &mut offset) else {
            return Vec::new();
        };
        if offset + 4 > payload.len() {
            return Vec::new();
        }
        offset += 4; // type + class
        questions.push(name);
    }

    let mut alias: HashMap<String, String> = HashMap::new();
    let mut addr_map: HashMap<String, Vec<(IpAddr, u32)>> = HashMap::new();

    for _ in 0..an_count {
        let Some(name) = read_name(payload, &mut offset) else {
            return Vec::new();
        };
        if offset + 10 > payload.len() {
            return Vec::new();
        }
        let record_type = u16::from_be_bytes([payload[offset], payload[offset + 1]]);
        let ttl = u32::from_be_bytes([
            payload[offset + 4],
            payload[offset + 5],
            payload[offset + 6],
            payload[offset + 7],
        ]);
        let rdlength = u16::from_be_bytes([payload[offset + 8], payload[offset + 9]]) as usize;
        let rdata_start = offset + 10;
        if rdata_start + rdlength > payload.len() {
            return Vec::new();
        }

        match record_type {
            TYPE_A if rdlength == 4 => {
                let rdata = &payload[rdata_start..rdata_start + 4];
                let addr = IpAddr::V4(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]));
                addr_map.entry(name).or_default().push((addr, ttl));
            }
            TYPE_AAAA if rdlength == 16 => {
                let rdata = &payload[rdata_start..rdata_start + 16];
                let addr = IpAddr::V6(Ipv6Addr::new(
                    u16::from_be_bytes([rdata[0], rdata[1]]),
                    u16::from_be_bytes([rdata[2], rdata[3]]),
                    u16::from_be_bytes([rdata[4], rdata[5]]),
                    u16::from_be_bytes([rdata[6], rdata[7]]),
                    u16::from_be_bytes([rdata[8], rdata[9]]),
                    u16::from_be_bytes([rdata[10], rdata[11]]),
                    u16::from_be_bytes([rdata[12], rdata[13]]),
                    u16::from_be_bytes([rdata[14], rdata[15]]),
                ));
                addr_map.entry(name).or_default().push((addr, ttl));
            }
            TYPE_CNAME => {
                let mut target_offset = rdata_start;
                if let Some(target) = read_name(payload, &mut target_offset) {
                    alias.entry(name).or_insert(target);
                }
            }
            _ => {}
        }
        offset = rdata_start + rdlength;
    }

    if addr_map.is_empty() {
        return Vec::new();
    }

    let mut ordered_hosts: Vec<String> = Vec::new();
    let mut by_host: HashMap<String, DnsMapping> = HashMap::new();
    let mut resolved_owners: HashSet<String> = HashSet::new();
    let first_question = questions.first().cloned();

    for question in &questions {
        let mut current = question.clone();
        let mut chain_guard: HashSet<String> = HashSet::new();
        chain_guard.insert(current.clone());
        loop {
            if let Some(addrs) = addr_map.get(&current) {
                resolved_owners.insert(current.clone());
                merge_mapping(&mut by_host, &mut ordered_hosts, question, addrs);
                break;
            }
            let Some(target) = alias.get(&current) else {
                break;
            };
            if !chain_guard.insert(target.clone()) {
                break; // CNAME loop
            }
            resolved_owners.insert(current.clone());
            current = target.clone();
        }
    }

    for (owner, addrs) in &addr_map {
        if resolved_owners.contains(owner) {
            continue;
        }
        let host = first_question.clone().unwrap_or_else(|| owner.clone());
        merge_mapping(&mut by_host, &mut ordered_hosts, &host, addrs);
    }

    ordered_hosts
        .into_iter()
        .filter_map(|host| by_host.remove(&host))
        .collect()
}

fn merge_mapping(
    by_host: &mut HashMap<String, DnsMapping>,
    ordered_hosts: &mut Vec<String>,
    host: &str,
    addrs: &[(IpAddr, u32)],
) {
    let entry = by_host.entry(host.to_string()).or_insert_with(|| {
        ordered_hosts.push(host.to_string());
        DnsMapping {
            host: host.to_string(),
            addresses: Vec::new(),
            ttl: None,
        }
    });
    for (addr, ttl) in addrs {
        if !entry.addresses.contains(addr) {
            entry.addresses.push(*addr);
        }
        entry.ttl = Some(entry.ttl.map_or(*ttl, |existing| existing.min(*ttl)));
    }
}

/// Reads a (possibly compressed) DNS name starting at `*offset`, advancing
/// `*offset` past the name as it appears at the call site (not past any
/// followed pointer). Pointer loops are rejected via a bounded set of
/// visited jump targets rather than a hop counter.
fn read_name(buf: &[u8], offset: &mut usize) -> Option<String> {
    let mut labels = Vec::new();
    let mut position = *offset;
    let mut jumped = false;
    let mut visited_pointers: HashSet<usize> = HashSet::new();

    loop {
        if position >= buf.len() {
            return None;
        }
        let len = buf[position] as usize;
        if len == 0 {
            position += 1;
            if !jumped {
                *offset = position;
            }
            break;
        }
        if len & 0xC0 == 0xC0 {
            if position + 1 >= buf.len() {
                return None;
            }
            let pointer = (((len & 0x3F) as usize) << 8) | buf[position + 1] as usize;
            if !jumped {
                *offset = position + 2;
            }
            if !visited_pointers.insert(pointer) {
                return None; // pointer loop
            }
            position = pointer;
            jumped = true;
            continue;
        }
        position += 1;
        if position + len > buf.len() {
            return None;
        }
        labels.push(
            String::from_utf8_lossy(&buf[position..position + len])
                .to_ascii_lowercase(),
        );
        position += len;
        if !jumped {
            *offset = position;
        }
    }

    if labels.is_empty() {
        None
    } else {
        Some(labels.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_bytes(label: &str) -> Vec<u8> {
        let mut out = Vec::new();
        for part in label.split('.') {
            out.push(part.len() as u8);
            out.extend_from_slice(part.as_bytes());
        }
        out.push(0);
        out
    }

    fn header(qd: u16, an: u16) -> Vec<u8> {
        let mut h = vec![0x12, 0x34, 0x81, 0x80];
        h.extend_from_slice(&qd.to_be_bytes());
        h.extend_from_slice(&an.to_be_bytes());
        h.extend_from_slice(&0u16.to_be_bytes());
        h.extend_from_slice(&0u16.to_be_bytes());
        h
    }

    #[test]
    fn parses_a_record_answer() {
        let mut packet = header(1, 1);
        packet.extend_from_slice(&name_bytes("example.com"));
        packet.extend_from_slice(&1u16.to_be_bytes()); // type A
        packet.extend_from_slice(&1u16.to_be_bytes()); // class IN
        packet.extend_from_slice(&name_bytes("example.com"));
        packet.extend_from_slice(&1u16.to_be_bytes());
        packet.extend_from_slice(&1u16.to_be_bytes());
        packet.extend_from_slice(&300u32.to_be_bytes());
        packet.extend_from_slice(&4u16.to_be_bytes());
        packet.extend_from_slice(&[93, 184, 216, 34]);

        let mappings = parse_response(&packet);
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].host, "example.com");
        assert_eq!(mappings[0].addresses, vec![IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))]);
        assert_eq!(mappings[0].ttl, Some(300));
    }

    #[test]
    fn collapses_cname_chain_to_question_name() {
        let mut packet = header(1, 2);
        packet.extend_from_slice(&name_bytes("example.com"));
        packet.extend_from_slice(&1u16.to_be_bytes());
        packet.extend_from_slice(&1u16.to_be_bytes());

        // example.com CNAME www.example.com
        packet.extend_from_slice(&name_bytes("example.com"));
        packet.extend_from_slice(&5u16.to_be_bytes());
        packet.extend_from_slice(&1u16.to_be_bytes());
        packet.extend_from_slice(&300u32.to_be_bytes());
        let target = name_bytes("www.example.com");
        packet.extend_from_slice(&(target.len() as u16).to_be_bytes());
        packet.extend_from_slice(&target);

        // www.example.com A 93.184.216.34
        packet.extend_from_slice(&name_bytes("www.example.com"));
        packet.extend_from_slice(&1u16.to_be_bytes());
        packet.extend_from_slice(&1u16.to_be_bytes());
        packet.extend_from_slice(&60u32.to_be_bytes());
        packet.extend_from_slice(&4u16.to_be_bytes());
        packet.extend_from_slice(&[93, 184, 216, 34]);

        let mappings = parse_response(&packet);
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].host, "example.com");
        assert_eq!(mappings[0].ttl, Some(60));
    }

    #[test]
    fn rejects_pointer_loop() {
        // A name whose compression pointer points back to itself.
        let mut packet = header(1, 0);
        let question_offset = packet.len();
        packet.push(0xC0);
        packet.push(question_offset as u8);
        packet.extend_from_slice(&1u16.to_be_bytes());
        packet.extend_from_slice(&1u16.to_be_bytes());

        assert!(parse_response(&packet).is_empty());
    }

    #[test]
    fn ignores_non_response_packets() {
        let mut packet = header(0, 0);
        packet[2] = 0x01; // clear QR bit (query, not response)
        assert!(parse_response(&packet).is_empty());
    }
}
