//! Tunnel adapter: wires the host's packet read/write surface through the
//! policy/shaper/host-tracker pipeline into an [`Engine`], and the engine's
//! emitted packets back through the same pipeline to the host.
//!
//! Grounded in the engine bridge's `start_poll_loop` (a tokio task driven by
//! `time::interval` combined with a `Notify` wake signal via
//! `tokio::select!`): this generalizes that single fixed-tick loop into the
//! two independent bounded-channel pipelines below, reusing the same
//! `Notify`-driven wake pattern for the read scheduler's backoff and the
//! same `tokio::select!` cancellation idiom at every suspension point.

use std::collections::VecDeque;
use std::ffi::CString;
use std::os::raw::{c_char, c_void};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle as RuntimeHandle;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::byte_budget::ByteBudget;
use crate::connection_table::{ConnectionKind, ConnectionTable};
use crate::engine::Engine;
use crate::error::{CoreError, ProviderEvent};
use crate::ffi::{BridgeCallbacks, FlowCounters, FlowStats};
use crate::flow_tracker::FlowTracker;
use crate::host_tracker::HostTracker;
use crate::logger::{self, BreadcrumbFlags};
use crate::metrics::{Collector, MetricsEvent, PacketDirection};
use crate::parser::{self, PacketMetadata};
use crate::policy::shaper::Shaper;
use crate::policy::{PolicyManager, RuleAction};
use crate::time_ids::wall_clock_millis;

const READ_BACKOFF_BASE_MS: u64 = 1;
const READ_BACKOFF_CEILING_MS: u64 = 5;
const MAX_CONSECUTIVE_EMPTY_READS: u32 = 16;
const MAX_EVENTS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Abstract host surface the orchestrator needs: a pull-based packet read
/// (empty result on a tick with nothing pending, matching the read loop's
/// backoff contract) and a synchronous write-back.
pub trait TunnelHost: Send + Sync {
    fn try_read_packets(&self) -> Option<(Vec<Vec<u8>>, Vec<u32>)>;
    fn write_packets(&self, payloads: &[Vec<u8>], families: &[u32]);
}

pub type PacketTap = dyn Fn(Direction, &[u8], u32) + Send + Sync;

struct PacketBatch {
    payloads: Vec<Vec<u8>>,
    families: Vec<u32>,
    total_bytes: usize,
}

impl PacketBatch {
    fn new(payloads: Vec<Vec<u8>>, families: Vec<u32>) -> Self {
        let total_bytes = payloads.iter().map(Vec::len).sum();
        Self {
            payloads,
            families,
            total_bytes,
        }
    }
}

/// Context handed to the engine as the `context` pointer of an intermediary
/// `BridgeCallbacks`: dial/send/close/dns trampolines forward straight to
/// the host-supplied callbacks, while `emit_packets` is intercepted so
/// emitted bytes flow through the inbound pipeline before reaching the host.
struct CallbackContext {
    inner: BridgeCallbacks,
    inbound_tx: mpsc::Sender<PacketBatch>,
    connection_table: Arc<ConnectionTable>,
    engine: Arc<Mutex<Box<dyn Engine>>>,
    runtime: RuntimeHandle,
}

unsafe extern "C" fn intercept_emit(
    packets: *const *const u8,
    sizes: *const usize,
    protocols: *const u32,
    count: usize,
    context: *mut c_void,
) {
    if context.is_null() || packets.is_null() || sizes.is_null() || protocols.is_null() {
        return;
    }
    let ctx = unsafe { &*(context as *const CallbackContext) };
    let mut payloads = Vec::with_capacity(count);
    let mut families = Vec::with_capacity(count);
    for index in 0..count {
        let ptr = unsafe { *packets.add(index) };
        let len = unsafe { *sizes.add(index) };
        if ptr.is_null() || len == 0 {
            continue;
        }
        let slice = unsafe { std::slice::from_raw_parts(ptr, len) };
        payloads.push(slice.to_vec());
        families.push(unsafe { *protocols.add(index) });
    }
    if payloads.is_empty() {
        return;
    }
    let batch = PacketBatch::new(payloads, families);
    if ctx.inbound_tx.try_send(batch).is_err() {
        logger::breadcrumb(
            BreadcrumbFlags::FLOW,
            "inbound pipeline full, dropping emitted batch".to_string(),
        );
    }
}

unsafe extern "C" fn forward_dial(
    host: *const c_char,
    port: u16,
    handle: u64,
    context: *mut c_void,
) {
    if context.is_null() {
        return;
    }
    let ctx = unsafe { &*(context as *const CallbackContext) };
    ctx.connection_table
        .begin_dial(handle, ConnectionKind::Tcp, Arc::clone(&ctx.engine));
    unsafe { (ctx.inner.request_tcp_dial)(host, port, handle, ctx.inner.context) };
}

unsafe extern "C" fn forward_udp_dial(
    host: *const c_char,
    port: u16,
    handle: u64,
    context: *mut c_void,
) {
    if context.is_null() {
        return;
    }
    let ctx = unsafe { &*(context as *const CallbackContext) };
    ctx.connection_table
        .begin_dial(handle, ConnectionKind::Udp, Arc::clone(&ctx.engine));
    unsafe { (ctx.inner.request_udp_dial)(host, port, handle, ctx.inner.context) };
}

unsafe extern "C" fn forward_tcp_send(
    handle: u64,
    payload: *const u8,
    length: usize,
    context: *mut c_void,
) {
    if context.is_null() || payload.is_null() || length == 0 {
        return;
    }
    let ctx = unsafe { &*(context as *const CallbackContext) };
    let data = unsafe { std::slice::from_raw_parts(payload, length) }.to_vec();
    spawn_chunked_write(ctx, handle, ConnectionKind::Tcp, data);
}

unsafe extern "C" fn forward_udp_send(
    handle: u64,
    payload: *const u8,
    length: usize,
    context: *mut c_void,
) {
    if context.is_null() || payload.is_null() || length == 0 {
        return;
    }
    let ctx = unsafe { &*(context as *const CallbackContext) };
    let data = unsafe { std::slice::from_raw_parts(payload, length) }.to_vec();
    spawn_chunked_write(ctx, handle, ConnectionKind::Udp, data);
}

/// Routes an engine write through the connection table's chunking/send-window
/// discipline on a spawned task, since the host's raw send callback is a
/// synchronous extern "C" function but send-window admission can suspend.
/// A write that fails closes the handle exactly once on both sides.
fn spawn_chunked_write(ctx: &CallbackContext, handle: u64, kind: ConnectionKind, data: Vec<u8>) {
    let table = Arc::clone(&ctx.connection_table);
    let engine = Arc::clone(&ctx.engine);
    let inner = ctx.inner;
    ctx.runtime.spawn(async move {
        let send = move |chunk: &[u8]| unsafe {
            let inner = inner;
            match kind {
                ConnectionKind::Tcp => (inner.tcp_send)(handle, chunk.as_ptr(), chunk.len(), inner.context),
                ConnectionKind::Udp => (inner.udp_send)(handle, chunk.as_ptr(), chunk.len(), inner.context),
            }
        };
        if table.write(handle, kind, &data, &send).await.is_err() && table.close(handle) {
            let reason = match kind {
                ConnectionKind::Tcp => CoreError::WriteTimeout(handle),
                ConnectionKind::Udp => CoreError::SendWindowExhausted(handle),
            };
            if let Ok(message) = CString::new(reason.to_string()) {
                unsafe {
                    match kind {
                        ConnectionKind::Tcp => (inner.tcp_close)(handle, message.as_ptr(), inner.context),
                        ConnectionKind::Udp => (inner.udp_close)(handle, message.as_ptr(), inner.context),
                    }
                }
            }
            if let Ok(mut guard) = engine.lock() {
                match kind {
                    ConnectionKind::Tcp => guard.on_tcp_close(handle),
                    ConnectionKind::Udp => guard.on_udp_close(handle),
                }
            }
        }
    });
}

unsafe extern "C" fn forward_tcp_close(handle: u64, message: *const c_char, context: *mut c_void) {
    if context.is_null() {
        return;
    }
    let ctx = unsafe { &*(context as *const CallbackContext) };
    if !ctx.connection_table.close(handle) {
        return;
    }
    unsafe { (ctx.inner.tcp_close)(handle, message, ctx.inner.context) };
}

unsafe extern "C" fn forward_udp_close(handle: u64, message: *const c_char, context: *mut c_void) {
    if context.is_null() {
        return;
    }
    let ctx = unsafe { &*(context as *const CallbackContext) };
    if !ctx.connection_table.close(handle) {
        return;
    }
    unsafe { (ctx.inner.udp_close)(handle, message, ctx.inner.context) };
}

unsafe extern "C" fn forward_record_dns(
    host: *const c_char,
    addresses: *const *const c_char,
    count: usize,
    ttl_seconds: u32,
    context: *mut c_void,
) {
    if context.is_null() {
        return;
    }
    let ctx = unsafe { &*(context as *const CallbackContext) };
    unsafe { (ctx.inner.record_dns)(host, addresses, count, ttl_seconds, ctx.inner.context) };
}

pub struct Orchestrator {
    engine: Arc<Mutex<Box<dyn Engine>>>,
    host: Arc<dyn TunnelHost>,
    policy: Arc<PolicyManager>,
    host_tracker: Arc<HostTracker>,
    shaper_out: Arc<Shaper>,
    shaper_in: Arc<Shaper>,
    byte_budget: Arc<ByteBudget>,
    flow_tracker: Arc<FlowTracker>,
    connection_table: Arc<ConnectionTable>,
    metrics: Arc<Collector>,
    runtime: RuntimeHandle,
    packet_batch_limit: usize,
    packet_tap: Arc<Mutex<Option<Box<PacketTap>>>>,
    events: Arc<Mutex<VecDeque<ProviderEvent>>>,
    running: Arc<AtomicBool>,
    cancel: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
    callback_context: Option<*mut CallbackContext>,
}

unsafe impl Send for Orchestrator {}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Box<dyn Engine>,
        host: Arc<dyn TunnelHost>,
        policy: Arc<PolicyManager>,
        host_tracker: Arc<HostTracker>,
        shaper_out: Arc<Shaper>,
        shaper_in: Arc<Shaper>,
        byte_budget: Arc<ByteBudget>,
        flow_tracker: Arc<FlowTracker>,
        connection_table: Arc<ConnectionTable>,
        metrics: Arc<Collector>,
        runtime: RuntimeHandle,
        packet_batch_limit: usize,
    ) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
            host,
            policy,
            host_tracker,
            shaper_out,
            shaper_in,
            byte_budget,
            flow_tracker,
            connection_table,
            metrics,
            runtime,
            packet_batch_limit: packet_batch_limit.max(1),
            packet_tap: Arc::new(Mutex::new(None)),
            events: Arc::new(Mutex::new(VecDeque::new())),
            running: Arc::new(AtomicBool::new(false)),
            cancel: Arc::new(Notify::new()),
            tasks: Vec::new(),
            callback_context: None,
        }
    }

    pub fn set_packet_tap(&self, tap: Box<PacketTap>) {
        *self.packet_tap.lock().unwrap() = Some(tap);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn byte_budget_utilization(&self) -> f64 {
        self.byte_budget.utilization()
    }

    pub fn engine_counters(&self) -> FlowCounters {
        self.engine.lock().map(|engine| engine.counters()).unwrap_or_default()
    }

    pub fn engine_stats(&self) -> FlowStats {
        self.engine.lock().map(|engine| engine.stats()).unwrap_or_default()
    }

    /// Host reports data arriving on an engine-dialed TCP handle.
    pub fn report_tcp_receive(&self, handle: u64, payload: &[u8]) -> bool {
        self.engine
            .lock()
            .map(|mut engine| engine.on_tcp_receive(handle, payload))
            .unwrap_or(false)
    }

    /// Host reports data arriving on an engine-dialed UDP handle.
    pub fn report_udp_receive(&self, handle: u64, payload: &[u8]) -> bool {
        self.engine
            .lock()
            .map(|mut engine| engine.on_udp_receive(handle, payload))
            .unwrap_or(false)
    }

    /// Host reports the outcome of a dial it was asked to perform. Dropped
    /// silently if the connection table already resolved the handle (a
    /// prior result, or the dial timeout already fired).
    pub fn report_dial_result(&self, handle: u64, success: bool, reason: Option<&str>) {
        if self.connection_table.on_dial_result(handle, success) {
            if let Ok(mut engine) = self.engine.lock() {
                engine.on_dial_result(handle, success, reason);
            }
        }
    }

    /// Host reports a TCP handle closing. Exactly-once: a handle already
    /// closed (by this call, a dial timeout, or a prior close) is a no-op.
    pub fn report_tcp_close(&self, handle: u64) {
        if self.connection_table.close(handle) {
            if let Ok(mut engine) = self.engine.lock() {
                engine.on_tcp_close(handle);
            }
        }
    }

    /// Host reports a UDP handle closing. Exactly-once, as with TCP.
    pub fn report_udp_close(&self, handle: u64) {
        if self.connection_table.close(handle) {
            if let Ok(mut engine) = self.engine.lock() {
                engine.on_udp_close(handle);
            }
        }
    }

    pub fn drain_events(&self, max: usize) -> Vec<ProviderEvent> {
        let mut guard = self.events.lock().unwrap();
        let mut out = Vec::with_capacity(max.min(guard.len()));
        while out.len() < max {
            match guard.pop_front() {
                Some(event) => out.push(event),
                None => break,
            }
        }
        out
    }

    fn push_event(&self, event: ProviderEvent) {
        let mut guard = self.events.lock().unwrap();
        if guard.len() >= MAX_EVENTS {
            guard.pop_front();
        }
        guard.push_back(event);
    }

    pub fn start(&mut self, callbacks: BridgeCallbacks) -> Result<(), CoreError> {
        self.push_event(ProviderEvent::WillStart);

        let (outbound_tx, outbound_rx) = mpsc::channel::<PacketBatch>(self.packet_batch_limit);
        let (inbound_tx, inbound_rx) = mpsc::channel::<PacketBatch>(self.packet_batch_limit);

        let context = Box::into_raw(Box::new(CallbackContext {
            inner: callbacks,
            inbound_tx,
            connection_table: Arc::clone(&self.connection_table),
            engine: Arc::clone(&self.engine),
            runtime: self.runtime.clone(),
        }));
        let wrapped = BridgeCallbacks {
            emit_packets: intercept_emit,
            request_tcp_dial: forward_dial,
            request_udp_dial: forward_udp_dial,
            tcp_send: forward_tcp_send,
            udp_send: forward_udp_send,
            tcp_close: forward_tcp_close,
            udp_close: forward_udp_close,
            record_dns: forward_record_dns,
            context: context as *mut c_void,
        };

        {
            let mut engine = self
                .engine
                .lock()
                .map_err(|_| CoreError::EngineStartFailed("engine lock poisoned".into()))?;
            engine.start(wrapped)?;
        }
        self.callback_context = Some(context);
        self.running.store(true, Ordering::Release);

        let read_task = self.spawn_read_loop(outbound_tx);
        let outbound_task = self.spawn_outbound_consumer(outbound_rx);
        let inbound_task = self.spawn_inbound_consumer(inbound_rx);
        self.tasks.push(read_task);
        self.tasks.push(outbound_task);
        self.tasks.push(inbound_task);

        self.push_event(ProviderEvent::DidStart);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.cancel.notify_waiters();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Ok(mut engine) = self.engine.lock() {
            engine.stop();
        }
        if let Some(context) = self.callback_context.take() {
            unsafe {
                drop(Box::from_raw(context));
            }
        }
        self.push_event(ProviderEvent::DidStop);
    }

    fn spawn_read_loop(&self, outbound_tx: mpsc::Sender<PacketBatch>) -> JoinHandle<()> {
        let host = Arc::clone(&self.host);
        let byte_budget = Arc::clone(&self.byte_budget);
        let running = Arc::clone(&self.running);
        let cancel = Arc::clone(&self.cancel);
        let events = Arc::clone(&self.events);
        self.runtime.spawn(async move {
            let mut consecutive_empty: u32 = 0;
            loop {
                if !running.load(Ordering::Acquire) {
                    break;
                }
                match host.try_read_packets() {
                    Some((payloads, families)) if !payloads.is_empty() => {
                        consecutive_empty = 0;
                        let batch = PacketBatch::new(payloads, families);
                        if !byte_budget.reserve(batch.total_bytes as u64) {
                            push_bounded(&events, ProviderEvent::DidFail {
                                error: "packet-budget-exhausted".to_string(),
                            });
                            continue;
                        }
                        let reserved = batch.total_bytes as u64;
                        tokio::select! {
                            result = outbound_tx.send(batch) => {
                                if result.is_err() {
                                    byte_budget.release(reserved);
                                    break;
                                }
                            }
                            _ = cancel.notified() => {
                                byte_budget.release(reserved);
                                break;
                            }
                        }
                    }
                    _ => {
                        consecutive_empty = consecutive_empty.saturating_add(1).min(MAX_CONSECUTIVE_EMPTY_READS);
                        let shift = consecutive_empty.saturating_sub(1).min(4);
                        let delay_ms = (READ_BACKOFF_BASE_MS * (1u64 << shift)).min(READ_BACKOFF_CEILING_MS);
                        tokio::select! {
                            _ = sleep(Duration::from_millis(delay_ms)) => {}
                            _ = cancel.notified() => break,
                        }
                    }
                }
            }
        })
    }

    fn spawn_outbound_consumer(&self, mut outbound_rx: mpsc::Receiver<PacketBatch>) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let policy = Arc::clone(&self.policy);
        let host_tracker = Arc::clone(&self.host_tracker);
        let shaper = Arc::clone(&self.shaper_out);
        let flow_tracker = Arc::clone(&self.flow_tracker);
        let metrics = Arc::clone(&self.metrics);
        let byte_budget = Arc::clone(&self.byte_budget);
        let packet_tap = Arc::clone(&self.packet_tap);
        let cancel = Arc::clone(&self.cancel);
        let events = Arc::clone(&self.events);
        self.runtime.spawn(async move {
            loop {
                let batch = tokio::select! {
                    item = outbound_rx.recv() => match item {
                        Some(batch) => batch,
                        None => break,
                    },
                    _ = cancel.notified() => break,
                };
                process_batch(
                    Direction::Outbound,
                    batch,
                    &engine,
                    &policy,
                    &host_tracker,
                    &shaper,
                    &flow_tracker,
                    &metrics,
                    &byte_budget,
                    &packet_tap,
                    &events,
                    &cancel,
                    |engine, payload, family| {
                        let mut engine = engine.lock().unwrap();
                        engine.handle_packet(payload, family)
                    },
                )
                .await;
            }
        })
    }

    fn spawn_inbound_consumer(&self, mut inbound_rx: mpsc::Receiver<PacketBatch>) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let policy = Arc::clone(&self.policy);
        let host_tracker = Arc::clone(&self.host_tracker);
        let shaper = Arc::clone(&self.shaper_in);
        let flow_tracker = Arc::clone(&self.flow_tracker);
        let metrics = Arc::clone(&self.metrics);
        let byte_budget = Arc::clone(&self.byte_budget);
        let packet_tap = Arc::clone(&self.packet_tap);
        let cancel = Arc::clone(&self.cancel);
        let events = Arc::clone(&self.events);
        let host = Arc::clone(&self.host);
        self.runtime.spawn(async move {
            loop {
                let batch = tokio::select! {
                    item = inbound_rx.recv() => match item {
                        Some(batch) => batch,
                        None => break,
                    },
                    _ = cancel.notified() => break,
                };
                let host = Arc::clone(&host);
                process_batch(
                    Direction::Inbound,
                    batch,
                    &engine,
                    &policy,
                    &host_tracker,
                    &shaper,
                    &flow_tracker,
                    &metrics,
                    &byte_budget,
                    &packet_tap,
                    &events,
                    &cancel,
                    move |_engine, payload, family| {
                        host.write_packets(&[payload.to_vec()], &[family]);
                        true
                    },
                )
                .await;
            }
        })
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if self.running.load(Ordering::Acquire) {
            self.stop();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_batch<F>(
    direction: Direction,
    batch: PacketBatch,
    engine: &Arc<Mutex<Box<dyn Engine>>>,
    policy: &Arc<PolicyManager>,
    host_tracker: &Arc<HostTracker>,
    shaper: &Arc<Shaper>,
    flow_tracker: &Arc<FlowTracker>,
    metrics: &Arc<Collector>,
    byte_budget: &Arc<ByteBudget>,
    packet_tap: &Arc<Mutex<Option<Box<PacketTap>>>>,
    events: &Arc<Mutex<VecDeque<ProviderEvent>>>,
    cancel: &Arc<Notify>,
    deliver: F,
) where
    F: Fn(&Arc<Mutex<Box<dyn Engine>>>, &[u8], u32) -> bool,
{
    let total_bytes = batch.total_bytes as u64;
    let now_ms = wall_clock_millis();
    let metrics_direction = match direction {
        Direction::Outbound => PacketDirection::ClientToNetwork,
        Direction::Inbound => PacketDirection::NetworkToClient,
    };

    for (payload, family) in batch.payloads.iter().zip(batch.families.iter()) {
        if let Some(tap) = packet_tap.lock().unwrap().as_ref() {
            tap(direction, payload, *family);
        }

        let metadata = parser::parse(payload);
        if let Some(metadata) = &metadata {
            record_metrics(metrics, metadata, metrics_direction, now_ms);
            flow_tracker.record(metadata, now_ms);
            match direction {
                Direction::Outbound => host_tracker.ingest_tls(metadata, now_ms),
                Direction::Inbound => host_tracker.ingest_dns(metadata, now_ms),
            }
        }

        let mut delay = Duration::ZERO;
        if let Some(metadata) = &metadata {
            let host = host_tracker.lookup(&metadata.dst_addr, now_ms);
            if let Some(decision) = policy.decide(&metadata.dst_addr, host.as_deref(), metadata.dst_port) {
                match decision.action {
                    RuleAction::Block => {
                        push_bounded(
                            events,
                            ProviderEvent::DidFail {
                                error: format!(
                                    "Blocked {} host {}",
                                    transport_label(metadata.transport),
                                    decision.host
                                ),
                            },
                        );
                        continue;
                    }
                    RuleAction::Shape(config) => {
                        let key = shaping_key(metadata);
                        delay = shaper.reserve(key, &config, payload.len(), std::time::Instant::now());
                    }
                }
            }
        }

        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.notified() => {
                    byte_budget.release(total_bytes);
                    return;
                }
            }
        }

        deliver(engine, payload, *family);
    }

    byte_budget.release(total_bytes);
}

fn record_metrics(
    metrics: &Arc<Collector>,
    metadata: &PacketMetadata,
    direction: PacketDirection,
    now_ms: u64,
) {
    let protocol = match metadata.transport {
        parser::Transport::Tcp => 6,
        parser::Transport::Udp => 17,
        parser::Transport::Other => 0,
    };
    let mut event = MetricsEvent::new(
        protocol,
        direction,
        metadata.length as u32,
        metadata.src_addr,
        metadata.dst_addr,
    );
    event.timestamp_ms = now_ms;
    event.dns_qname = metadata.dns_query_name.clone();
    event.dns_response = !metadata.dns_answers.is_empty();
    metrics.record(event);
}

fn shaping_key(metadata: &PacketMetadata) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    metadata.src_addr.hash(&mut hasher);
    metadata.dst_addr.hash(&mut hasher);
    metadata.src_port.hash(&mut hasher);
    metadata.dst_port.hash(&mut hasher);
    hasher.finish()
}

fn transport_label(transport: parser::Transport) -> &'static str {
    match transport {
        parser::Transport::Tcp => "tcp",
        parser::Transport::Udp => "udp",
        parser::Transport::Other => "other",
    }
}

fn push_bounded(events: &Arc<Mutex<VecDeque<ProviderEvent>>>, event: ProviderEvent) {
    let mut guard = events.lock().unwrap();
    if guard.len() >= MAX_EVENTS {
        guard.pop_front();
    }
    guard.push_back(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::noop::NoOpEngine;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;

    struct MockHost {
        queue: Mutex<VecDeque<(Vec<Vec<u8>>, Vec<u32>)>>,
        written: Mutex<Vec<Vec<u8>>>,
    }

    impl MockHost {
        fn new() -> Self {
            Self {
                queue: Mutex::new(VecDeque::new()),
                written: Mutex::new(Vec::new()),
            }
        }

        fn push(&self, payload: Vec<u8>) {
            self.queue
                .lock()
                .unwrap()
                .push_back((vec![payload], vec![4]));
        }
    }

    impl TunnelHost for MockHost {
        fn try_read_packets(&self) -> Option<(Vec<Vec<u8>>, Vec<u32>)> {
            self.queue.lock().unwrap().pop_front()
        }

        fn write_packets(&self, payloads: &[Vec<u8>], _families: &[u32]) {
            self.written.lock().unwrap().extend(payloads.iter().cloned());
        }
    }

    fn ipv4_udp_packet(src: [u8; 4], dst: [u8; 4], src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut udp = Vec::new();
        udp.extend_from_slice(&src_port.to_be_bytes());
        udp.extend_from_slice(&dst_port.to_be_bytes());
        let udp_len = (8 + payload.len()) as u16;
        udp.extend_from_slice(&udp_len.to_be_bytes());
        udp.extend_from_slice(&0u16.to_be_bytes());
        udp.extend_from_slice(payload);

        let total_len = (20 + udp.len()) as u16;
        let mut packet = vec![0x45, 0x00];
        packet.extend_from_slice(&total_len.to_be_bytes());
        packet.extend_from_slice(&[0, 0, 0x40, 0, 64, 17, 0, 0]);
        packet.extend_from_slice(&src);
        packet.extend_from_slice(&dst);
        packet.extend_from_slice(&udp);
        packet
    }

    unsafe extern "C" fn noop_emit(
        _packets: *const *const u8,
        _sizes: *const usize,
        _protocols: *const u32,
        _count: usize,
        _context: *mut c_void,
    ) {
    }
    unsafe extern "C" fn noop_dial(_h: *const c_char, _p: u16, _handle: u64, _c: *mut c_void) {}
    unsafe extern "C" fn noop_send(_h: u64, _p: *const u8, _l: usize, _c: *mut c_void) {}
    unsafe extern "C" fn noop_close(_h: u64, _m: *const c_char, _c: *mut c_void) {}
    unsafe extern "C" fn noop_dns(
        _h: *const c_char,
        _a: *const *const c_char,
        _c: usize,
        _t: u32,
        _ctx: *mut c_void,
    ) {
    }

    fn stub_callbacks() -> BridgeCallbacks {
        BridgeCallbacks {
            emit_packets: noop_emit,
            request_tcp_dial: noop_dial,
            request_udp_dial: noop_dial,
            tcp_send: noop_send,
            udp_send: noop_send,
            tcp_close: noop_close,
            udp_close: noop_close,
            record_dns: noop_dns,
            context: std::ptr::null_mut(),
        }
    }

    fn build_orchestrator(host: Arc<MockHost>) -> Orchestrator {
        Orchestrator::new(
            Box::new(NoOpEngine::new()),
            host,
            PolicyManager::new(),
            Arc::new(HostTracker::new(Duration::from_secs(60))),
            Arc::new(Shaper::new()),
            Arc::new(Shaper::new()),
            Arc::new(ByteBudget::new(1_048_576)),
            Arc::new(FlowTracker::new()),
            ConnectionTable::new(
                tokio::runtime::Handle::current(),
                Arc::new(crate::send_window::SendWindow::new(32)),
                1280,
                65536,
            ),
            Arc::new(Collector::new()),
            tokio::runtime::Handle::current(),
            16,
        )
    }

    #[tokio::test]
    async fn delivers_allowed_packet_to_engine_and_drains_budget() {
        let host = Arc::new(MockHost::new());
        let payload = ipv4_udp_packet([10, 0, 0, 2], [93, 184, 216, 34], 5353, 9000, b"hi");
        host.push(payload);
        let mut orchestrator = build_orchestrator(Arc::clone(&host));
        orchestrator.start(stub_callbacks()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(orchestrator.byte_budget.used(), 0);
        orchestrator.stop();
    }

    #[tokio::test]
    async fn block_rule_prevents_delivery() {
        let host = Arc::new(MockHost::new());
        let target = Ipv4Addr::new(203, 0, 113, 9);
        let payload = ipv4_udp_packet([10, 0, 0, 2], target.octets(), 5353, 9000, b"hi");
        host.push(payload);
        let mut orchestrator = build_orchestrator(Arc::clone(&host));
        orchestrator
            .policy
            .install_rule(&target.to_string(), None, RuleAction::Block);
        orchestrator.start(stub_callbacks()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = orchestrator.drain_events(8);
        assert!(events
            .iter()
            .any(|event| matches!(event, ProviderEvent::DidFail { error } if error.contains("Blocked"))));
        orchestrator.stop();
    }

    #[test]
    fn backoff_never_exceeds_ceiling() {
        let mut consecutive_empty: u32 = MAX_CONSECUTIVE_EMPTY_READS;
        let shift = consecutive_empty.saturating_sub(1).min(4);
        let delay_ms = (READ_BACKOFF_BASE_MS * (1u64 << shift)).min(READ_BACKOFF_CEILING_MS);
        assert_eq!(delay_ms, READ_BACKOFF_CEILING_MS);
        consecutive_empty += 1;
        let _ = AtomicUsize::new(consecutive_empty as usize);
    }
}
