//! Five-tuple flow identity and burst coalescing.
//!
//! Modeled on the connlib flow tracker's active-flow map + timeout sweep
//! (`HashMap<FlowKey, FlowValue>` with a `last_packet` watermark), scaled
//! down to what the metrics/policy paths need: a stable flow id per
//! 5-tuple and a burst id that advances whenever the inter-arrival gap
//! exceeds a threshold, so a steady stream of small packets coalesces into
//! one burst for reporting instead of one event per packet.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use crate::parser::{PacketMetadata, Transport};
use crate::time_ids::IdAllocator;

const DEFAULT_MAX_TRACKED_FLOWS: usize = 8192;
const DEFAULT_FLOW_TTL: Duration = Duration::from_secs(30);
const DEFAULT_BURST_THRESHOLD: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlowKey {
    transport: TransportKind,
    src: IpAddr,
    src_port: u16,
    dst: IpAddr,
    dst_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TransportKind {
    Tcp,
    Udp,
    Other,
}

impl From<Transport> for TransportKind {
    fn from(value: Transport) -> Self {
        match value {
            Transport::Tcp => TransportKind::Tcp,
            Transport::Udp => TransportKind::Udp,
            Transport::Other => TransportKind::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BurstMetrics {
    pub packet_count: u64,
    pub byte_count: u64,
    pub inter_arrival_ns_sum: u64,
}

struct FlowState {
    flow_id: u64,
    burst_id: u64,
    last_seen_ms: u64,
    metrics: BurstMetrics,
}

pub struct FlowTracker {
    flows: Mutex<HashMap<FlowKey, FlowState>>,
    flow_ids: IdAllocator,
    max_tracked_flows: usize,
    flow_ttl_ms: u64,
    burst_threshold_ms: u64,
}

impl FlowTracker {
    pub fn new() -> Self {
        Self::with_settings(
            DEFAULT_MAX_TRACKED_FLOWS,
            DEFAULT_FLOW_TTL,
            DEFAULT_BURST_THRESHOLD,
        )
    }

    pub fn with_capacity(max_tracked_flows: usize) -> Self {
        Self::with_settings(max_tracked_flows, DEFAULT_FLOW_TTL, DEFAULT_BURST_THRESHOLD)
    }

    pub fn with_settings(max_tracked_flows: usize, flow_ttl: Duration, burst_threshold: Duration) -> Self {
        Self {
            flows: Mutex::new(HashMap::new()),
            flow_ids: IdAllocator::starting_at(1),
            max_tracked_flows: max_tracked_flows.max(1),
            flow_ttl_ms: flow_ttl.as_millis() as u64,
            burst_threshold_ms: burst_threshold.as_millis() as u64,
        }
    }

    /// Records a packet's arrival, returning the flow's stable id and its
    /// current burst id.
    ///
    /// A flow observed more than `flowTTL` after the previous packet on the
    /// same 5-tuple is treated as a new flow (fresh `flow_id`, `burst_id`
    /// reset to its first value) rather than reusing the stale entry. Within
    /// that window, a gap exceeding `burstThreshold` keeps the `flow_id` but
    /// allocates a new `burst_id`.
    pub fn record(&self, metadata: &PacketMetadata, now_ms: u64) -> (u64, u64) {
        let key = FlowKey {
            transport: metadata.transport.into(),
            src: metadata.src_addr,
            src_port: metadata.src_port.unwrap_or(0),
            dst: metadata.dst_addr,
            dst_port: metadata.dst_port.unwrap_or(0),
        };

        let mut guard = self.flows.lock();

        let expired = guard
            .get(&key)
            .map(|entry| now_ms.saturating_sub(entry.last_seen_ms) > self.flow_ttl_ms)
            .unwrap_or(false);
        if expired {
            guard.remove(&key);
        }

        if !guard.contains_key(&key) && guard.len() >= self.max_tracked_flows {
            evict_oldest(&mut guard);
        }

        let is_new = !guard.contains_key(&key);
        let entry = guard.entry(key).or_insert_with(|| FlowState {
            flow_id: self.flow_ids.next(),
            burst_id: 0,
            last_seen_ms: now_ms,
            metrics: BurstMetrics::default(),
        });

        if !is_new {
            let gap_ms = now_ms.saturating_sub(entry.last_seen_ms);
            if gap_ms > self.burst_threshold_ms {
                entry.burst_id += 1;
                entry.metrics = BurstMetrics::default();
            } else if entry.metrics.packet_count > 0 {
                entry.metrics.inter_arrival_ns_sum += gap_ms.saturating_mul(1_000_000);
            }
        }

        entry.metrics.packet_count += 1;
        entry.metrics.byte_count += metadata.length as u64;
        entry.last_seen_ms = now_ms;

        (entry.flow_id, entry.burst_id)
    }

    pub fn burst_metrics(&self, metadata: &PacketMetadata) -> Option<BurstMetrics> {
        let key = FlowKey {
            transport: metadata.transport.into(),
            src: metadata.src_addr,
            src_port: metadata.src_port.unwrap_or(0),
            dst: metadata.dst_addr,
            dst_port: metadata.dst_port.unwrap_or(0),
        };
        self.flows.lock().get(&key).map(|entry| entry.metrics)
    }

    pub fn tracked_flow_count(&self) -> usize {
        self.flows.lock().len()
    }
}

impl Default for FlowTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn evict_oldest(guard: &mut HashMap<FlowKey, FlowState>) {
    if let Some(oldest) = guard
        .iter()
        .min_by_key(|(_, state)| state.last_seen_ms)
        .map(|(key, _)| *key)
    {
        guard.remove(&oldest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn udp_packet(src_port: u16, length: usize) -> PacketMetadata {
        PacketMetadata {
            ip_version: crate::parser::IpVersion::V4,
            transport: Transport::Udp,
            src_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            src_port: Some(src_port),
            dst_port: Some(53),
            length,
            dns_query_name: None,
            dns_answers: Vec::new(),
            tls_sni: None,
        }
    }

    #[test]
    fn same_flow_reuses_flow_id_across_calls() {
        let tracker = FlowTracker::new();
        let (flow_a, _) = tracker.record(&udp_packet(1000, 64), 0);
        let (flow_b, _) = tracker.record(&udp_packet(1000, 64), 10);
        assert_eq!(flow_a, flow_b);
    }

    #[test]
    fn different_source_ports_get_different_flow_ids() {
        let tracker = FlowTracker::new();
        let (flow_a, _) = tracker.record(&udp_packet(1000, 64), 0);
        let (flow_b, _) = tracker.record(&udp_packet(2000, 64), 0);
        assert_ne!(flow_a, flow_b);
    }

    #[test]
    fn burst_id_advances_after_gap_exceeds_threshold() {
        let tracker = FlowTracker::new();
        let (_, burst_a) = tracker.record(&udp_packet(1000, 64), 0);
        let (_, burst_b) = tracker.record(&udp_packet(1000, 64), 10);
        let (_, burst_c) = tracker.record(&udp_packet(1000, 64), 500);
        assert_eq!(burst_a, 0);
        assert_eq!(burst_a, burst_b);
        assert_eq!(burst_c, burst_b + 1);
    }

    #[test]
    fn flow_ttl_expiry_allocates_a_fresh_flow_id() {
        let tracker = FlowTracker::with_settings(
            DEFAULT_MAX_TRACKED_FLOWS,
            Duration::from_millis(500),
            Duration::from_millis(100),
        );
        let (flow_a, burst_a) = tracker.record(&udp_packet(1000, 64), 1_000);
        let (flow_b, burst_b) = tracker.record(&udp_packet(1000, 64), 1_150);
        let (flow_c, burst_c) = tracker.record(&udp_packet(1000, 64), 2_000);
        assert_eq!(burst_a, 0, "a flow's first packet starts at burst 0");
        assert_eq!(flow_a, flow_b);
        assert_eq!(burst_b, 1, "gap over burstThreshold bumps the burst id within the flow");
        assert_ne!(flow_b, flow_c, "observation after flowTTL gets a new flow id");
        assert_eq!(burst_c, 0, "a freshly allocated flow resets to burst 0");
    }

    #[test]
    fn eviction_drops_oldest_flow_once_over_capacity() {
        let tracker = FlowTracker::with_capacity(1);
        tracker.record(&udp_packet(1000, 64), 0);
        tracker.record(&udp_packet(2000, 64), 1);
        assert_eq!(tracker.tracked_flow_count(), 1);
    }
}
