//! Managed connection table: the explicit `Dialing | Ready | Closed` state
//! machine for engine-initiated outbound TCP/UDP handles, sitting at the
//! same junction the orchestrator's callback trampolines already occupy
//! between the engine and the host-supplied physical socket surface.
//!
//! Grounded in the flow manager's dial bookkeeping (`flow_manager::dial`):
//! that module already tracks `pending_dial`/`dial_attempts`/`ready` as
//! loose booleans per flow entry and retries on failure with backoff. This
//! table generalizes the same admission/teardown shape into the named enum
//! the design notes call for, adds the `dialTimeout` the flow manager never
//! armed (it only reacts to a reported failure, never to silence), and adds
//! the `perFlowBytes` write-chunking discipline over `send_window`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle as RuntimeHandle;

use crate::engine::Engine;
use crate::error::CoreError;
use crate::logger::{self, BreadcrumbFlags};
use crate::send_window::SendWindow;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    Tcp,
    Udp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnState {
    Dialing,
    Ready,
    Closed,
}

struct ConnectionEntry {
    kind: ConnectionKind,
    state: ConnState,
}

/// Tracks per-handle connection state and enforces the write discipline
/// (chunking, send-window admission, exactly-once close) uniformly
/// regardless of which [`Engine`] is driving the tunnel.
pub struct ConnectionTable {
    entries: Mutex<HashMap<u64, ConnectionEntry>>,
    send_window: Arc<SendWindow>,
    runtime: RuntimeHandle,
    chunk_bytes: usize,
    per_flow_bytes: usize,
    dial_timeout: Duration,
    write_timeout: Duration,
}

impl ConnectionTable {
    pub fn new(
        runtime: RuntimeHandle,
        send_window: Arc<SendWindow>,
        mtu: usize,
        per_flow_bytes: usize,
    ) -> Arc<Self> {
        Self::with_timeouts(
            runtime,
            send_window,
            mtu,
            per_flow_bytes,
            DEFAULT_DIAL_TIMEOUT,
            DEFAULT_WRITE_TIMEOUT,
        )
    }

    pub fn with_timeouts(
        runtime: RuntimeHandle,
        send_window: Arc<SendWindow>,
        mtu: usize,
        per_flow_bytes: usize,
        dial_timeout: Duration,
        write_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            send_window,
            runtime,
            chunk_bytes: mtu.min(per_flow_bytes).max(1),
            per_flow_bytes: per_flow_bytes.max(1),
            dial_timeout,
            write_timeout,
        })
    }

    /// Registers a handle as `Dialing` and arms the dial timeout. The
    /// timeout watcher fires `on_dial_result(handle, false, "dial_timeout")`
    /// plus the matching close callback on the engine if no result has
    /// arrived by then; a genuine result observed first cancels it instead.
    pub fn begin_dial(self: &Arc<Self>, handle: u64, kind: ConnectionKind, engine: Arc<std::sync::Mutex<Box<dyn Engine>>>) {
        self.entries.lock().insert(handle, ConnectionEntry { kind, state: ConnState::Dialing });
        let table = Arc::clone(self);
        let dial_timeout = self.dial_timeout;
        self.runtime.spawn(async move {
            tokio::time::sleep(dial_timeout).await;
            if table.expire_dial(handle) {
                logger::breadcrumb(
                    BreadcrumbFlags::FLOW,
                    format!("dial timeout for handle {handle} after {dial_timeout:?}"),
                );
                if let Ok(mut guard) = engine.lock() {
                    guard.on_dial_result(handle, false, Some("dial_timeout"));
                    match kind {
                        ConnectionKind::Tcp => guard.on_tcp_close(handle),
                        ConnectionKind::Udp => guard.on_udp_close(handle),
                    }
                }
            }
        });
    }

    fn expire_dial(&self, handle: u64) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&handle) {
            Some(entry) if entry.state == ConnState::Dialing => {
                entry.state = ConnState::Closed;
                true
            }
            _ => false,
        }
    }

    /// Records a dial outcome reported by the host. Returns `false` (and
    /// leaves the table untouched) when the handle already resolved — either
    /// a prior result or the dial timeout already fired — so the caller can
    /// drop a late or duplicate report instead of surfacing it twice.
    pub fn on_dial_result(&self, handle: u64, success: bool) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&handle) {
            Some(entry) if entry.state == ConnState::Dialing => {
                entry.state = if success { ConnState::Ready } else { ConnState::Closed };
                true
            }
            _ => false,
        }
    }

    fn is_ready(&self, handle: u64) -> bool {
        matches!(self.entries.lock().get(&handle), Some(entry) if entry.state == ConnState::Ready)
    }

    /// Exactly-once close: the first caller for a given handle (remote
    /// failure, cancel, engine close, or a timeout that already ran) wins
    /// and the entry is removed; every later caller observes `false` and
    /// must not re-emit a close callback.
    pub fn close(&self, handle: u64) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&handle) {
            Some(entry) if entry.state != ConnState::Closed => {
                entries.remove(&handle);
                true
            }
            Some(_) => false,
            None => false,
        }
    }

    /// Writes `payload` to a Ready handle, applying the TCP chunking /
    /// UDP truncation discipline and acquiring the send window once per
    /// chunk (once per datagram for UDP). `send` is the host's raw
    /// synchronous send callback; the host contract treats it as
    /// non-blocking, so only the send-window wait observes `write_timeout`.
    pub async fn write(
        &self,
        handle: u64,
        kind: ConnectionKind,
        payload: &[u8],
        send: &(dyn Fn(&[u8]) + Send + Sync),
    ) -> Result<(), CoreError> {
        if payload.is_empty() {
            return Ok(());
        }
        if !self.is_ready(handle) {
            // A write that races a not-yet-ready or already-closed handle is
            // not itself a write-timeout; the caller's buffering (if any)
            // owns retry semantics. Treat it as a no-op success.
            return Ok(());
        }
        match kind {
            ConnectionKind::Tcp => self.write_tcp(handle, payload, send).await,
            ConnectionKind::Udp => self.write_udp(handle, payload, send).await,
        }
    }

    async fn write_tcp(
        &self,
        handle: u64,
        payload: &[u8],
        send: &(dyn Fn(&[u8]) + Send + Sync),
    ) -> Result<(), CoreError> {
        for chunk in payload.chunks(self.chunk_bytes) {
            let Some(_permit) = self.send_window.acquire(self.write_timeout).await else {
                return Err(CoreError::SendWindowExhausted(handle));
            };
            send(chunk);
        }
        Ok(())
    }

    async fn write_udp(
        &self,
        handle: u64,
        payload: &[u8],
        send: &(dyn Fn(&[u8]) + Send + Sync),
    ) -> Result<(), CoreError> {
        let data = if payload.len() > self.per_flow_bytes {
            logger::breadcrumb(
                BreadcrumbFlags::FLOW,
                format!(
                    "udp payload truncated from {} to {} bytes for handle {handle}",
                    payload.len(),
                    self.per_flow_bytes
                ),
            );
            &payload[..self.per_flow_bytes]
        } else {
            payload
        };
        let Some(_permit) = self.send_window.acquire(self.write_timeout).await else {
            return Err(CoreError::SendWindowExhausted(handle));
        };
        send(data);
        Ok(())
    }

    pub fn tracked_handle_count(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::noop::NoOpEngine;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn table(per_flow_bytes: usize) -> Arc<ConnectionTable> {
        ConnectionTable::with_timeouts(
            tokio::runtime::Handle::current(),
            Arc::new(SendWindow::new(4)),
            1500,
            per_flow_bytes,
            Duration::from_millis(50),
            Duration::from_millis(50),
        )
    }

    fn engine_handle() -> Arc<StdMutex<Box<dyn Engine>>> {
        Arc::new(StdMutex::new(Box::new(NoOpEngine::new()) as Box<dyn Engine>))
    }

    #[tokio::test]
    async fn dial_result_transitions_dialing_to_ready() {
        let table = table(1500);
        table.begin_dial(1, ConnectionKind::Tcp, engine_handle());
        assert!(table.on_dial_result(1, true));
        assert!(table.is_ready(1));
    }

    #[tokio::test]
    async fn dial_timeout_closes_handle_without_a_result() {
        let table = table(1500);
        table.begin_dial(7, ConnectionKind::Tcp, engine_handle());
        tokio::time::sleep(Duration::from_millis(120)).await;
        // The timeout already resolved the handle; a late result is dropped.
        assert!(!table.on_dial_result(7, true));
    }

    #[tokio::test]
    async fn close_is_exactly_once() {
        let table = table(1500);
        table.begin_dial(2, ConnectionKind::Tcp, engine_handle());
        table.on_dial_result(2, true);
        assert!(table.close(2));
        assert!(!table.close(2));
    }

    #[tokio::test]
    async fn tcp_write_splits_into_chunk_sized_sends() {
        let table = table(10);
        table.begin_dial(3, ConnectionKind::Tcp, engine_handle());
        table.on_dial_result(3, true);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let send = move |chunk: &[u8]| {
            assert!(chunk.len() <= 10);
            calls_clone.fetch_add(1, Ordering::SeqCst);
        };
        table.write(3, ConnectionKind::Tcp, &[0u8; 25], &send).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn udp_write_truncates_oversize_payload_to_one_datagram() {
        let table = table(10);
        table.begin_dial(4, ConnectionKind::Udp, engine_handle());
        table.on_dial_result(4, true);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let send = move |chunk: &[u8]| {
            assert_eq!(chunk.len(), 10);
            calls_clone.fetch_add(1, Ordering::SeqCst);
        };
        table.write(4, ConnectionKind::Udp, &[0u8; 25], &send).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn write_to_unready_handle_is_a_silent_no_op() {
        let table = table(1500);
        table.begin_dial(5, ConnectionKind::Tcp, engine_handle());
        let send = |_: &[u8]| panic!("must not be called before ready");
        table.write(5, ConnectionKind::Tcp, b"hello", &send).await.unwrap();
    }

    #[tokio::test]
    async fn send_window_exhaustion_surfaces_as_an_error() {
        let table = ConnectionTable::with_timeouts(
            tokio::runtime::Handle::current(),
            Arc::new(SendWindow::new(1)),
            1500,
            1500,
            Duration::from_millis(50),
            Duration::from_millis(10),
        );
        table.begin_dial(6, ConnectionKind::Tcp, engine_handle());
        table.on_dial_result(6, true);
        let _held = table.send_window.acquire(Duration::from_millis(50)).await.unwrap();
        let err = table.write(6, ConnectionKind::Tcp, b"hello", &|_| {}).await.unwrap_err();
        assert_eq!(err.kind(), "send-window-exhausted");
    }
}
