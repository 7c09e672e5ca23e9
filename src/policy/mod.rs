//! Host/IP policy store: block and shape rules, matched by normalized host
//! pattern, IP/CIDR literal, and optional port list.
//!
//! Host attribution used to live here as `observe_dns_mapping`; it has moved
//! out to the dedicated host tracker so this store stays purely about rule
//! matching, with callers supplying the already-resolved host.

pub mod shaper;

use parking_lot::RwLock;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use wildmatch::WildMatch;

use crate::config::ShapingRuleSettings;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ShapingConfig {
    pub latency_ms: u32,
    pub jitter_ms: u32,
    pub bytes_per_second: Option<u64>,
}

impl From<&ShapingRuleSettings> for ShapingConfig {
    fn from(settings: &ShapingRuleSettings) -> Self {
        Self {
            latency_ms: settings.fixed_latency_ms,
            jitter_ms: settings.jitter_ms,
            bytes_per_second: settings.bytes_per_second,
        }
    }
}

#[derive(Clone, Debug)]
pub enum RuleAction {
    Block,
    Shape(ShapingConfig),
}

#[derive(Clone, Debug)]
pub struct PolicyDecision {
    pub host: String,
    pub action: RuleAction,
}

#[derive(Clone, Debug)]
enum PatternKind {
    Exact(String),
    Suffix(String),
    Contains(String),
    Glob(WildMatch),
}

impl PatternKind {
    fn matches(&self, host: &str) -> bool {
        match self {
            PatternKind::Exact(s) => host == s,
            PatternKind::Suffix(s) => host == s || host.ends_with(&format!(".{s}")),
            PatternKind::Contains(s) => host.contains(s.as_str()),
            PatternKind::Glob(m) => m.matches(host),
        }
    }
}

/// A compiled host pattern, matching iff any of its normalized forms match.
#[derive(Clone, Debug)]
struct HostPattern(Vec<PatternKind>);

impl HostPattern {
    fn matches(&self, host: &str) -> bool {
        self.0.iter().any(|kind| kind.matches(host))
    }
}

/// Normalizes a configured host pattern per the host-matching rules:
/// `*.x` compiles to `{suffix x, contains x}`; a bare pattern `x` (no
/// wildcard) compiles to `{exact x, suffix x, contains x}` so it matches
/// the host itself, any subdomain, and any host containing it as a
/// substring. Anything else carrying a wildcard character falls back to a
/// general glob match.
fn classify_pattern(raw: &str) -> HostPattern {
    let lower = raw.trim().to_ascii_lowercase();
    if let Some(suffix) = lower.strip_prefix("*.") {
        HostPattern(vec![
            PatternKind::Suffix(suffix.to_string()),
            PatternKind::Contains(suffix.to_string()),
        ])
    } else if lower.len() > 1 && lower.starts_with('*') && lower.ends_with('*') {
        HostPattern(vec![PatternKind::Contains(lower[1..lower.len() - 1].to_string())])
    } else if lower.contains('*') || lower.contains('?') {
        HostPattern(vec![PatternKind::Glob(WildMatch::new(&lower))])
    } else {
        HostPattern(vec![
            PatternKind::Exact(lower.clone()),
            PatternKind::Suffix(lower.clone()),
            PatternKind::Contains(lower),
        ])
    }
}

fn parse_cidr(raw: &str) -> Option<(IpAddr, u8)> {
    let (addr_part, prefix_part) = raw.split_once('/')?;
    let addr: IpAddr = addr_part.parse().ok()?;
    let prefix: u8 = prefix_part.parse().ok()?;
    let max_bits = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max_bits {
        return None;
    }
    Some((addr, prefix))
}

fn cidr_contains(network: IpAddr, prefix_len: u8, candidate: &IpAddr) -> bool {
    match (network, candidate) {
        (IpAddr::V4(net), IpAddr::V4(addr)) => {
            let mask = if prefix_len == 0 {
                0u32
            } else {
                u32::MAX << (32 - prefix_len)
            };
            u32::from(net) & mask == u32::from(*addr) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(addr)) => {
            let mask = if prefix_len == 0 {
                0u128
            } else {
                u128::MAX << (128 - prefix_len)
            };
            u128::from(net) & mask == u128::from(*addr) & mask
        }
        _ => false,
    }
}

#[derive(Clone, Debug)]
pub struct HostRule {
    pub id: u64,
    pattern: HostPattern,
    cidr: Option<(IpAddr, u8)>,
    exact_ip: Option<IpAddr>,
    ports: Option<Vec<u16>>,
    pub action: RuleAction,
}

impl HostRule {
    fn matches(&self, host: Option<&str>, addr: &IpAddr, port: Option<u16>) -> bool {
        if let Some(ports) = &self.ports {
            match port {
                Some(p) if ports.contains(&p) => {}
                _ => return false,
            }
        }
        if let Some(exact_ip) = self.exact_ip {
            if &exact_ip == addr {
                return true;
            }
        }
        if let Some((network, prefix)) = self.cidr {
            if cidr_contains(network, prefix, addr) {
                return true;
            }
        }
        match host {
            Some(h) => self.pattern.matches(&h.to_ascii_lowercase()),
            None => false,
        }
    }
}

pub struct PolicyManager {
    rules: RwLock<Vec<HostRule>>,
    next_id: AtomicU64,
}

impl PolicyManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rules: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Installs a rule matched by host pattern and/or IP literal/CIDR,
    /// optionally restricted to a port list. Returns the rule id for later
    /// removal.
    pub fn install_rule(
        self: &Arc<Self>,
        pattern: &str,
        ports: Option<Vec<u16>>,
        action: RuleAction,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let trimmed = pattern.trim();
        let exact_ip = trimmed.parse::<IpAddr>().ok();
        let cidr = if exact_ip.is_none() {
            parse_cidr(trimmed)
        } else {
            None
        };
        let rule = HostRule {
            id,
            pattern: classify_pattern(trimmed),
            cidr,
            exact_ip,
            ports,
            action,
        };
        self.rules.write().push(rule);
        id
    }

    pub fn remove_rule(&self, id: u64) -> bool {
        let mut guard = self.rules.write();
        let len_before = guard.len();
        guard.retain(|rule| rule.id != id);
        len_before != guard.len()
    }

    /// Finds the last-installed rule matching `addr`/`host`/`port`. Later
    /// installs take priority, matching how firewall rule lists are usually
    /// read (most specific/most recent wins).
    pub fn decide(&self, addr: &IpAddr, host: Option<&str>, port: Option<u16>) -> Option<PolicyDecision> {
        let guard = self.rules.read();
        for rule in guard.iter().rev() {
            if rule.matches(host, addr, port) {
                return Some(PolicyDecision {
                    host: host.map(str::to_string).unwrap_or_else(|| addr.to_string()),
                    action: rule.action.clone(),
                });
            }
        }
        None
    }

    pub fn clear(&self) {
        self.rules.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn bare_pattern_also_covers_its_own_subdomains() {
        // A bare pattern normalizes to {exact, suffix, contains}, so it also
        // reaches subdomains the way "*.x" would.
        let manager = PolicyManager::new();
        manager.install_rule("ads.example.com", None, RuleAction::Block);
        assert!(manager
            .decide(&addr(1, 1, 1, 1), Some("ads.example.com"), None)
            .is_some());
        assert!(manager
            .decide(&addr(1, 1, 1, 1), Some("sub.ads.example.com"), None)
            .is_some());
        assert!(manager
            .decide(&addr(1, 1, 1, 1), Some("unrelated.com"), None)
            .is_none());
    }

    #[test]
    fn suffix_pattern_matches_bare_domain_and_subdomains() {
        let manager = PolicyManager::new();
        manager.install_rule("*.example.com", None, RuleAction::Block);
        assert!(manager.decide(&addr(1, 1, 1, 1), Some("example.com"), None).is_some());
        assert!(manager
            .decide(&addr(1, 1, 1, 1), Some("www.example.com"), None)
            .is_some());
    }

    #[test]
    fn suffix_pattern_also_matches_as_a_substring() {
        // "*.x" normalizes to {suffix x, contains x}; a host carrying the
        // pattern anywhere, not just as a dot-delimited suffix, still hits.
        let manager = PolicyManager::new();
        manager.install_rule("*.ads.example", None, RuleAction::Block);
        assert!(manager
            .decide(&addr(1, 1, 1, 1), Some("tracker.ads.example"), None)
            .is_some());
        assert!(manager
            .decide(&addr(1, 1, 1, 1), Some("notads.example"), None)
            .is_some());
    }

    #[test]
    fn bare_pattern_matches_exact_suffix_and_substring_forms() {
        let manager = PolicyManager::new();
        manager.install_rule("tracker", None, RuleAction::Block);
        assert!(manager.decide(&addr(1, 1, 1, 1), Some("tracker"), None).is_some());
        assert!(manager
            .decide(&addr(1, 1, 1, 1), Some("sub.tracker"), None)
            .is_some());
        assert!(manager
            .decide(&addr(1, 1, 1, 1), Some("adtracker.example"), None)
            .is_some());
    }

    #[test]
    fn cidr_rule_matches_contained_addresses() {
        let manager = PolicyManager::new();
        manager.install_rule("10.0.0.0/8", None, RuleAction::Block);
        assert!(manager.decide(&addr(10, 1, 2, 3), None, None).is_some());
        assert!(manager.decide(&addr(11, 0, 0, 1), None, None).is_none());
    }

    #[test]
    fn port_restricted_rule_ignores_other_ports() {
        let manager = PolicyManager::new();
        manager.install_rule("example.com", Some(vec![443]), RuleAction::Block);
        assert!(manager
            .decide(&addr(1, 1, 1, 1), Some("example.com"), Some(443))
            .is_some());
        assert!(manager
            .decide(&addr(1, 1, 1, 1), Some("example.com"), Some(80))
            .is_none());
    }

    #[test]
    fn later_rule_wins_on_conflict() {
        let manager = PolicyManager::new();
        manager.install_rule(
            "example.com",
            None,
            RuleAction::Shape(ShapingConfig { latency_ms: 10, jitter_ms: 0, bytes_per_second: None }),
        );
        manager.install_rule("example.com", None, RuleAction::Block);
        let decision = manager.decide(&addr(1, 1, 1, 1), Some("example.com"), None).unwrap();
        assert!(matches!(decision.action, RuleAction::Block));
    }

    #[test]
    fn remove_rule_drops_future_matches() {
        let manager = PolicyManager::new();
        let id = manager.install_rule("example.com", None, RuleAction::Block);
        assert!(manager.remove_rule(id));
        assert!(manager.decide(&addr(1, 1, 1, 1), Some("example.com"), None).is_none());
    }
}
