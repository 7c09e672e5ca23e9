//! Fallback engine that reflects every outbound packet straight back through
//! `emit_packets`, exactly as a terminator that immediately loops traffic
//! back to the client would. Useful when no real terminator is configured
//! and as a lightweight engine for orchestrator tests — the design notes
//! treat it as a terminator like any other, so the inbound shaper still
//! applies to what it reflects.

use std::os::raw::c_void;

use super::Engine;
use crate::error::CoreError;
use crate::ffi::{BridgeCallbacks, FlowCounters, FlowStats};

pub struct NoOpEngine {
    callbacks: Option<BridgeCallbacks>,
    stats: FlowStats,
}

impl NoOpEngine {
    pub fn new() -> Self {
        Self {
            callbacks: None,
            stats: FlowStats::default(),
        }
    }
}

impl Default for NoOpEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for NoOpEngine {
    fn start(&mut self, callbacks: BridgeCallbacks) -> Result<(), CoreError> {
        self.callbacks = Some(callbacks);
        Ok(())
    }

    fn stop(&mut self) {
        self.callbacks = None;
    }

    fn handle_packet(&mut self, packet: &[u8], protocol: u32) -> bool {
        let Some(callbacks) = self.callbacks else {
            return false;
        };
        let ptrs = [packet.as_ptr()];
        let sizes = [packet.len()];
        let protocols = [protocol];
        unsafe {
            (callbacks.emit_packets)(
                ptrs.as_ptr(),
                sizes.as_ptr(),
                protocols.as_ptr(),
                1,
                callbacks.context as *mut c_void,
            );
        }
        self.stats.frames_emitted = self.stats.frames_emitted.saturating_add(1);
        self.stats.bytes_emitted = self.stats.bytes_emitted.saturating_add(packet.len() as u64);
        true
    }

    fn on_tcp_receive(&mut self, _handle: u64, _payload: &[u8]) -> bool {
        false
    }

    fn on_udp_receive(&mut self, _handle: u64, _payload: &[u8]) -> bool {
        false
    }

    fn on_dial_result(&mut self, _handle: u64, _success: bool, _reason: Option<&str>) {}

    fn on_tcp_close(&mut self, _handle: u64) {}

    fn on_udp_close(&mut self, _handle: u64) {}

    fn counters(&self) -> FlowCounters {
        FlowCounters::default()
    }

    fn stats(&self) -> FlowStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Capture {
        count: AtomicUsize,
    }

    unsafe extern "C" fn capture_emit(
        _packets: *const *const u8,
        _sizes: *const usize,
        _protocols: *const u32,
        count: usize,
        context: *mut c_void,
    ) {
        let capture = unsafe { &*(context as *const Capture) };
        capture.count.fetch_add(count, Ordering::SeqCst);
    }

    unsafe extern "C" fn noop_dial(_host: *const i8, _port: u16, _handle: u64, _context: *mut c_void) {}
    unsafe extern "C" fn noop_send(_handle: u64, _payload: *const u8, _length: usize, _context: *mut c_void) {}
    unsafe extern "C" fn noop_close(_handle: u64, _message: *const i8, _context: *mut c_void) {}
    unsafe extern "C" fn noop_dns(
        _host: *const i8,
        _addresses: *const *const i8,
        _count: usize,
        _ttl: u32,
        _context: *mut c_void,
    ) {
    }

    #[test]
    fn reflects_packet_back_through_emit() {
        let capture = Arc::new(Capture {
            count: AtomicUsize::new(0),
        });
        let callbacks = BridgeCallbacks {
            emit_packets: capture_emit,
            request_tcp_dial: noop_dial,
            request_udp_dial: noop_dial,
            tcp_send: noop_send,
            udp_send: noop_send,
            tcp_close: noop_close,
            udp_close: noop_close,
            record_dns: noop_dns,
            context: Arc::as_ptr(&capture) as *mut c_void,
        };
        let mut engine = NoOpEngine::new();
        engine.start(callbacks).unwrap();
        assert!(engine.handle_packet(&[0x45, 0, 0, 20], 4));
        assert_eq!(capture.count.load(Ordering::SeqCst), 1);
        assert_eq!(engine.stats().frames_emitted, 1);
    }

    #[test]
    fn drops_packets_before_start() {
        let mut engine = NoOpEngine::new();
        assert!(!engine.handle_packet(&[0x45, 0, 0, 20], 4));
    }
}
