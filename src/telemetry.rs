use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::logger::{self, BreadcrumbFlags};
use crate::metrics::{Collector, MetricsEvent};

const MAX_EVENTS: usize = 4096;

pub const TELEMETRY_FLAG_DNS: u8 = 0x01;
pub const TELEMETRY_FLAG_DNS_RESPONSE: u8 = 0x02;
pub const TELEMETRY_FLAG_POLICY_BLOCK: u8 = 0x04;
pub const TELEMETRY_FLAG_POLICY_SHAPE: u8 = 0x08;

#[derive(Clone, Copy, Debug)]
pub enum PacketDirection {
    ClientToNetwork,
    #[allow(dead_code)]
    NetworkToClient,
}

#[derive(Clone, Debug)]
pub struct TelemetryEvent {
    pub timestamp_ms: u64,
    pub protocol: u8,
    pub direction: PacketDirection,
    pub payload_len: u32,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub dns_qname: Option<String>,
    pub dns_response: bool,
    pub flags: u8,
}

impl TelemetryEvent {
    pub fn new(
        protocol: u8,
        direction: PacketDirection,
        payload_len: u32,
        src: IpAddr,
        dst: IpAddr,
    ) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            timestamp_ms,
            protocol,
            direction,
            payload_len,
            src,
            dst,
            dns_qname: None,
            dns_response: false,
            flags: 0,
        }
    }
}

#[derive(Default)]
struct TelemetryInner {
    events: VecDeque<TelemetryEvent>,
    dropped: u64,
}

#[derive(Default)]
pub struct Telemetry {
    inner: Mutex<TelemetryInner>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TelemetryInner {
                events: VecDeque::with_capacity(MAX_EVENTS),
                dropped: 0,
            }),
        }
    }

    pub fn record(&self, event: TelemetryEvent) {
        let mut guard = self.inner.lock().unwrap();
        if guard.events.len() >= MAX_EVENTS {
            guard.events.pop_front();
            guard.dropped = guard.dropped.saturating_add(1);
            logger::breadcrumb(
                BreadcrumbFlags::METRICS,
                "telemetry backlog saturated, dropping oldest event".to_string(),
            );
        }
        guard.events.push_back(event);
    }

    pub fn drain(&self, max_events: usize) -> (Vec<TelemetryEvent>, u64) {
        let mut guard = self.inner.lock().unwrap();
        let mut drained = Vec::with_capacity(max_events.min(guard.events.len()));
        while drained.len() < max_events {
            match guard.events.pop_front() {
                Some(event) => drained.push(event),
                None => break,
            }
        }
        let dropped = guard.dropped;
        guard.dropped = 0;
        (drained, dropped)
    }
}

const MAX_PUBLISHED_EVENTS: usize = 1024;
const DRAIN_BATCH: usize = 256;

/// A registered predicate deciding which collector samples are worth
/// surfacing to the host, e.g. "DNS queries only" or "blocked flows only".
pub type TelemetryFilter = dyn Fn(&MetricsEvent) -> bool + Send + Sync;

/// Periodic snapshot of [`Collector`] state filtered through registered
/// predicates into a bounded buffer the host drains.
///
/// Grounded in [`Telemetry`]'s bounded `VecDeque` + oldest-eviction +
/// dropped-event counter above; this is the single canonical
/// `FilterCoordinator` the design notes call for, replacing what the
/// distilled spec's source carried as several divergent variants.
pub struct TelemetryBus {
    collector: Arc<Collector>,
    filters: Mutex<Vec<(String, Box<TelemetryFilter>)>>,
    published: Mutex<VecDeque<MetricsEvent>>,
    dropped: Mutex<u64>,
}

impl TelemetryBus {
    pub fn new(collector: Arc<Collector>) -> Self {
        Self {
            collector,
            filters: Mutex::new(Vec::new()),
            published: Mutex::new(VecDeque::with_capacity(MAX_PUBLISHED_EVENTS)),
            dropped: Mutex::new(0),
        }
    }

    /// Registers a named filter; a sample survives a tick only if every
    /// registered filter accepts it.
    pub fn register_filter(&self, name: impl Into<String>, predicate: Box<TelemetryFilter>) {
        self.filters.lock().unwrap().push((name.into(), predicate));
    }

    pub fn remove_filter(&self, name: &str) -> bool {
        let mut guard = self.filters.lock().unwrap();
        let len_before = guard.len();
        guard.retain(|(n, _)| n != name);
        len_before != guard.len()
    }

    /// Drains new collector events and republishes the ones every filter
    /// accepts. Called from the orchestrator's metrics timer alongside the
    /// collector's own snapshot publication.
    pub fn tick(&self) {
        let (events, collector_dropped) = self.collector.drain_events(DRAIN_BATCH);
        if collector_dropped > 0 {
            logger::breadcrumb(
                BreadcrumbFlags::METRICS,
                format!("telemetry bus observed {collector_dropped} collector drops"),
            );
        }
        let filters = self.filters.lock().unwrap();
        let mut published = self.published.lock().unwrap();
        let mut dropped = self.dropped.lock().unwrap();
        for event in events {
            if !filters.iter().all(|(_, predicate)| predicate(&event)) {
                continue;
            }
            if published.len() >= MAX_PUBLISHED_EVENTS {
                published.pop_front();
                *dropped = dropped.saturating_add(1);
            }
            published.push_back(event);
        }
    }

    pub fn drain_published(&self, max_events: usize) -> (Vec<MetricsEvent>, u64) {
        let mut published = self.published.lock().unwrap();
        let mut drained = Vec::with_capacity(max_events.min(published.len()));
        while drained.len() < max_events {
            match published.pop_front() {
                Some(event) => drained.push(event),
                None => break,
            }
        }
        let mut dropped = self.dropped.lock().unwrap();
        let taken = *dropped;
        *dropped = 0;
        (drained, taken)
    }

    pub fn filter_count(&self) -> usize {
        self.filters.lock().unwrap().len()
    }
}

#[cfg(test)]
mod bus_tests {
    use super::*;
    use crate::metrics::PacketDirection;
    use std::net::Ipv4Addr;

    fn sample(protocol: u8) -> MetricsEvent {
        MetricsEvent::new(
            protocol,
            PacketDirection::ClientToNetwork,
            64,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
        )
    }

    #[test]
    fn event_survives_only_when_every_filter_accepts_it() {
        let collector = Arc::new(Collector::new());
        collector.record(sample(6));
        collector.record(sample(17));
        let bus = TelemetryBus::new(Arc::clone(&collector));
        bus.register_filter("tcp-only", Box::new(|event: &MetricsEvent| event.protocol == 6));
        bus.tick();
        let (published, _) = bus.drain_published(10);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].protocol, 6);
    }

    #[test]
    fn no_filters_passes_every_sample_through() {
        let collector = Arc::new(Collector::new());
        collector.record(sample(6));
        let bus = TelemetryBus::new(Arc::clone(&collector));
        bus.tick();
        let (published, _) = bus.drain_published(10);
        assert_eq!(published.len(), 1);
    }

    #[test]
    fn removing_a_filter_stops_it_from_applying() {
        let bus = TelemetryBus::new(Arc::new(Collector::new()));
        bus.register_filter("reject-all", Box::new(|_: &MetricsEvent| false));
        assert!(bus.remove_filter("reject-all"));
        assert!(!bus.remove_filter("reject-all"));
    }
}
