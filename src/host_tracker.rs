//! Short-lived IP→hostname bindings used for traffic attribution.
//!
//! Grounded in the connection table's existing DNS-observation path
//! (`policy::PolicyManager::observe_dns_mapping`), but split into its own
//! component per the separation between attribution (host tracker) and
//! enforcement (policy store) — the two need independent concurrency and
//! eviction policies even though they are fed by the same parser output.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use crate::parser::PacketMetadata;

const DEFAULT_MAX_ENTRIES: usize = 4096;
const MIN_TTL_MS: u64 = 1_000;

struct Binding {
    host: String,
    expires_at_ms: u64,
}

pub struct HostTracker {
    bindings: RwLock<HashMap<IpAddr, Binding>>,
    max_entries: usize,
    default_ttl: Duration,
}

impl HostTracker {
    pub fn new(default_ttl: Duration) -> Self {
        Self::with_capacity(default_ttl, DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(default_ttl: Duration, max_entries: usize) -> Self {
        Self {
            bindings: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
            default_ttl,
        }
    }

    /// Inserts/overwrites bindings for each address. Empty host or address
    /// list is a no-op.
    pub fn record(&self, host: &str, addresses: &[IpAddr], ttl: Option<Duration>, now_ms: u64) {
        if host.is_empty() || addresses.is_empty() {
            return;
        }
        let lifetime = ttl.unwrap_or(self.default_ttl).min(self.default_ttl);
        let lifetime_ms = lifetime.as_millis().max(MIN_TTL_MS as u128) as u64;
        let expires_at_ms = now_ms.saturating_add(lifetime_ms);

        let mut guard = self.bindings.write();
        for addr in addresses {
            guard.insert(
                *addr,
                Binding {
                    host: host.to_string(),
                    expires_at_ms,
                },
            );
        }
        evict_if_over_capacity(&mut guard, self.max_entries);
    }

    /// Parses the DNS answers already extracted by the packet parser and
    /// records a binding per mapping, clamping TTL to `min(answer ttl,
    /// configured default)` with a 1-second floor.
    pub fn ingest_dns(&self, metadata: &PacketMetadata, now_ms: u64) {
        for mapping in &metadata.dns_answers {
            let answer_ttl = mapping.ttl.map(|secs| Duration::from_secs(secs as u64));
            let ttl = match answer_ttl {
                Some(answer) => Some(answer.min(self.default_ttl)),
                None => Some(self.default_ttl),
            };
            self.record(&mapping.host, &mapping.addresses, ttl, now_ms);
        }
    }

    /// Binds the TLS SNI (if present) to the packet's destination IP — the
    /// address the SYN/handshake carrying it was addressed to.
    pub fn ingest_tls(&self, metadata: &PacketMetadata, now_ms: u64) {
        if let Some(sni) = &metadata.tls_sni {
            self.record(sni, &[metadata.dst_addr], Some(self.default_ttl), now_ms);
        }
    }

    /// Returns the host iff a non-expired binding exists; a lookup strictly
    /// after `expires_at` returns absent.
    pub fn lookup(&self, ip: &IpAddr, now_ms: u64) -> Option<String> {
        let guard = self.bindings.read();
        guard.get(ip).and_then(|binding| {
            if binding.expires_at_ms > now_ms {
                Some(binding.host.clone())
            } else {
                None
            }
        })
    }

    /// Removes expired entries. Called opportunistically from `record`.
    pub fn purge_expired(&self, now_ms: u64) {
        let mut guard = self.bindings.write();
        guard.retain(|_, binding| binding.expires_at_ms > now_ms);
    }

    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }
}

fn evict_if_over_capacity(guard: &mut HashMap<IpAddr, Binding>, max_entries: usize) {
    while guard.len() > max_entries {
        let Some(oldest_ip) = guard
            .iter()
            .min_by_key(|(_, binding)| binding.expires_at_ms)
            .map(|(ip, _)| *ip)
        else {
            break;
        };
        guard.remove(&oldest_ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn lookup_returns_host_before_expiry_and_absent_after() {
        let tracker = HostTracker::new(Duration::from_secs(60));
        let ip = IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34));
        tracker.record("example.com", &[ip], Some(Duration::from_secs(300)), 1_000);

        assert_eq!(tracker.lookup(&ip, 1_500).as_deref(), Some("example.com"));
        assert_eq!(tracker.lookup(&ip, 1_000 + 300_000 + 1), None);
    }

    #[test]
    fn record_is_noop_for_empty_host_or_addresses() {
        let tracker = HostTracker::new(Duration::from_secs(60));
        let ip = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));
        tracker.record("", &[ip], None, 0);
        tracker.record("host", &[], None, 0);
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn purge_expired_removes_stale_bindings() {
        let tracker = HostTracker::new(Duration::from_secs(1));
        let ip = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));
        tracker.record("host", &[ip], Some(Duration::from_millis(10)), 0);
        tracker.purge_expired(1_000);
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn record_clamps_lifetime_to_configured_default() {
        let tracker = HostTracker::new(Duration::from_secs(60));
        let ip = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));
        tracker.record("host", &[ip], Some(Duration::from_secs(300)), 0);

        assert_eq!(tracker.lookup(&ip, 60_000 - 1).as_deref(), Some("host"));
        assert_eq!(tracker.lookup(&ip, 60_000 + 1), None);
    }

    #[test]
    fn evicts_oldest_expiry_entry_once_over_capacity() {
        let tracker = HostTracker::with_capacity(Duration::from_secs(60), 2);
        let a = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));
        let b = IpAddr::V4(Ipv4Addr::new(2, 2, 2, 2));
        let c = IpAddr::V4(Ipv4Addr::new(3, 3, 3, 3));
        tracker.record("a", &[a], Some(Duration::from_secs(10)), 0);
        tracker.record("b", &[b], Some(Duration::from_secs(20)), 0);
        tracker.record("c", &[c], Some(Duration::from_secs(30)), 0);

        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.lookup(&a, 0), None);
        assert_eq!(tracker.lookup(&c, 0).as_deref(), Some("c"));
    }
}
