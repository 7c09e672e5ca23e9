//! Metrics collection: a bounded event ring generalized from the bridge's
//! `Telemetry` type, plus a snapshot store for periodic aggregate
//! publication and a dirty flag the orchestrator's poll loop checks before
//! bothering to serialize anything.

pub mod ring_buffer;
pub mod store;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::logger::{self, BreadcrumbFlags};
use crate::time_ids::wall_clock_millis;
use ring_buffer::RingBuffer;
use store::SnapshotStore;

const MAX_EVENTS: usize = 4096;
const MAX_SNAPSHOTS: usize = 64;
const MAX_SNAPSHOT_BYTES: usize = 1_048_576;

pub const METRICS_FLAG_DNS: u8 = 0x01;
pub const METRICS_FLAG_DNS_RESPONSE: u8 = 0x02;
pub const METRICS_FLAG_POLICY_BLOCK: u8 = 0x04;
pub const METRICS_FLAG_POLICY_SHAPE: u8 = 0x08;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketDirection {
    ClientToNetwork,
    NetworkToClient,
}

#[derive(Clone, Debug)]
pub struct MetricsEvent {
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

impl MetricsEvent {
    pub fn new(
        protocol: u8,
        direction: PacketDirection,
        payload_len: u32,
        src: IpAddr,
        dst: IpAddr,
    ) -> Self {
        Self {
            timestamp_ms: wall_clock_millis(),
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

struct CollectorInner {
    events: RingBuffer<MetricsEvent>,
    snapshots: SnapshotStore,
}

pub struct Collector {
    inner: Mutex<CollectorInner>,
    dirty: AtomicBool,
}

impl Collector {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CollectorInner {
                events: RingBuffer::new(MAX_EVENTS),
                snapshots: SnapshotStore::new(MAX_SNAPSHOTS, MAX_SNAPSHOT_BYTES),
            }),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn record(&self, event: MetricsEvent) {
        let mut guard = self.inner.lock().unwrap();
        let had_room = guard.events.len() < MAX_EVENTS;
        guard.events.push(event);
        if !had_room {
            logger::breadcrumb(
                BreadcrumbFlags::METRICS,
                "metrics backlog saturated, dropping oldest event".to_string(),
            );
        }
        drop(guard);
        self.dirty.store(true, Ordering::Release);
    }

    pub fn drain_events(&self, max_events: usize) -> (Vec<MetricsEvent>, u64) {
        self.inner.lock().unwrap().events.drain(max_events)
    }

    /// Returns `true` exactly once per batch of `record` calls — callers
    /// use this to skip serializing a snapshot when nothing changed since
    /// the last reporting tick.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub fn publish_snapshot(&self, record: &[u8]) -> bool {
        self.inner.lock().unwrap().snapshots.append(record)
    }

    pub fn drain_snapshot_frame(&self) -> Vec<u8> {
        self.inner.lock().unwrap().snapshots.drain_framed()
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sample_event() -> MetricsEvent {
        MetricsEvent::new(
            6,
            PacketDirection::ClientToNetwork,
            128,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
        )
    }

    #[test]
    fn record_marks_collector_dirty() {
        let collector = Collector::new();
        assert!(!collector.take_dirty());
        collector.record(sample_event());
        assert!(collector.take_dirty());
        assert!(!collector.take_dirty());
    }

    #[test]
    fn drain_events_returns_recorded_event() {
        let collector = Collector::new();
        collector.record(sample_event());
        let (events, dropped) = collector.drain_events(10);
        assert_eq!(events.len(), 1);
        assert_eq!(dropped, 0);
    }

    #[test]
    fn snapshot_publication_round_trips_through_store() {
        let collector = Collector::new();
        assert!(collector.publish_snapshot(b"snapshot-1"));
        let framed = collector.drain_snapshot_frame();
        assert_eq!(&framed[0..4], &10u32.to_be_bytes());
    }
}
