//! Typed configuration tree matching the host-supplied JSON document.
//!
//! Mirrors the shape the bridge's `BridgeConfig` FFI struct used to carry as
//! flat scalars, but expressed as a nested `serde`-deserializable tree since
//! the host now authors a structured JSON blob rather than populating a
//! `#[repr(C)]` value field by field.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::error::CoreError;

const MIN_MTU: u32 = 576;
const MAX_MTU: u32 = 9000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider: ProviderSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    pub ipv4: Ipv4Settings,
    #[serde(default)]
    pub ipv6: Option<Ipv6Settings>,
    pub dns: DnsSettings,
    #[serde(default)]
    pub memory: MemorySettings,
    #[serde(default)]
    pub metrics: MetricsSettings,
    #[serde(default)]
    pub policies: PolicySettings,
}

fn default_mtu() -> u32 {
    1280
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ipv4Settings {
    pub address: IpAddr,
    pub subnet_mask: IpAddr,
    pub remote_address: IpAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ipv6Settings {
    #[serde(default)]
    pub addresses: Vec<IpAddr>,
    #[serde(default)]
    pub prefix_lengths: Vec<u8>,
    #[serde(default)]
    pub routes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsSettings {
    #[serde(default)]
    pub servers: Vec<IpAddr>,
    #[serde(default)]
    pub match_domains: Vec<String>,
    #[serde(default)]
    pub search_domains: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySettings {
    #[serde(default = "default_packet_pool_bytes")]
    pub packet_pool_bytes: u64,
    #[serde(default = "default_per_flow_bytes")]
    pub per_flow_bytes: u64,
    #[serde(default = "default_packet_batch_limit")]
    pub packet_batch_limit: usize,
    #[serde(default = "default_max_sends")]
    pub max_concurrent_network_sends: usize,
}

fn default_packet_pool_bytes() -> u64 {
    4 * 1024 * 1024
}
fn default_per_flow_bytes() -> u64 {
    64 * 1024
}
fn default_packet_batch_limit() -> usize {
    64
}
fn default_max_sends() -> usize {
    32
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            packet_pool_bytes: default_packet_pool_bytes(),
            per_flow_bytes: default_per_flow_bytes(),
            packet_batch_limit: default_packet_batch_limit(),
            max_concurrent_network_sends: default_max_sends(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_reporting_interval_ms")]
    pub reporting_interval_ms: u64,
}

fn default_reporting_interval_ms() -> u64 {
    5_000
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            reporting_interval_ms: default_reporting_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySettings {
    #[serde(default)]
    pub blocked_hosts: Vec<String>,
    #[serde(default)]
    pub traffic_shaping: TrafficShapingSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrafficShapingSettings {
    #[serde(default)]
    pub default_policy: Option<ShapingRuleSettings>,
    #[serde(default)]
    pub rules: Vec<TrafficRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficRule {
    pub hosts: Vec<String>,
    #[serde(default)]
    pub ports: Option<Vec<u16>>,
    pub policy: ShapingRuleSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShapingRuleSettings {
    #[serde(default)]
    pub fixed_latency_ms: u32,
    #[serde(default)]
    pub jitter_ms: u32,
    #[serde(default)]
    pub bytes_per_second: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default)]
    pub enable_debug: bool,
    #[serde(default)]
    pub breadcrumbs: u32,
}

impl ProviderConfig {
    /// Parse and validate a host-supplied configuration document.
    pub fn from_json(text: &str) -> Result<Self, CoreError> {
        let config: ProviderConfig = serde_json::from_str(text)
            .map_err(|e| CoreError::ConfigurationInvalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.provider.mtu < MIN_MTU || self.provider.mtu > MAX_MTU {
            return Err(CoreError::ConfigurationInvalid(format!(
                "mtu {} out of range [{MIN_MTU}, {MAX_MTU}]",
                self.provider.mtu
            )));
        }
        if self.provider.memory.packet_pool_bytes == 0 {
            return Err(CoreError::ConfigurationInvalid(
                "memory.packet_pool_bytes must be non-zero".into(),
            ));
        }
        if self.provider.memory.packet_batch_limit == 0 {
            return Err(CoreError::ConfigurationInvalid(
                "memory.packet_batch_limit must be non-zero".into(),
            ));
        }
        if self.provider.memory.max_concurrent_network_sends == 0 {
            return Err(CoreError::ConfigurationInvalid(
                "memory.max_concurrent_network_sends must be non-zero".into(),
            ));
        }
        for rule in &self.provider.policies.traffic_shaping.rules {
            if rule.hosts.is_empty() {
                return Err(CoreError::ConfigurationInvalid(
                    "traffic shaping rule with no hosts".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn normalized_mtu(&self) -> u32 {
        self.provider.mtu.clamp(MIN_MTU, MAX_MTU)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "provider": {
                "mtu": 1400,
                "ipv4": {"address": "10.0.0.2", "subnet_mask": "255.255.255.0", "remote_address": "10.0.0.1"},
                "dns": {"servers": ["1.1.1.1"], "match_domains": [], "search_domains": []}
            }
        }"#
    }

    #[test]
    fn parses_minimal_document_with_defaults() {
        let config = ProviderConfig::from_json(sample_json()).unwrap();
        assert_eq!(config.provider.mtu, 1400);
        assert_eq!(config.provider.memory.packet_batch_limit, 64);
        assert!(config.provider.policies.blocked_hosts.is_empty());
    }

    #[test]
    fn rejects_mtu_out_of_range() {
        let text = sample_json().replace("1400", "100");
        let err = ProviderConfig::from_json(&text).unwrap_err();
        assert_eq!(err.kind(), "configuration-invalid");
    }

    #[test]
    fn rejects_shaping_rule_without_hosts() {
        let mut text = sample_json().to_string();
        text = text.replace(
            "\"dns\"",
            "\"policies\": {\"traffic_shaping\": {\"rules\": [{\"hosts\": [], \"policy\": {\"fixed_latency_ms\": 10}}]}}, \"dns\"",
        );
        let err = ProviderConfig::from_json(&text).unwrap_err();
        assert_eq!(err.kind(), "configuration-invalid");
    }
}
