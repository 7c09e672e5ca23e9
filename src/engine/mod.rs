//! Abstract TCP/UDP terminator contract consumed by the orchestrator.
//!
//! The core never assumes a particular terminator: it only needs something
//! that can take a raw IP datagram, eventually emit IP datagrams back, and
//! report the lifecycle of whatever outbound connections it opens. Two
//! implementations ship here: [`noop::NoOpEngine`], a reflector used as a
//! fallback and in tests, and [`ffi::FfiEngine`], which adapts the existing
//! `BridgeCallbacks`/`FlowManager` pair (a tun2socks-style terminator driven
//! from the host side) behind the same trait.

pub mod ffi;
pub mod noop;

use crate::error::CoreError;
use crate::ffi::{BridgeCallbacks, FlowCounters, FlowStats};

/// A TCP/UDP terminator. All methods are synchronous from the caller's
/// point of view; implementations that need background work (a poll loop,
/// a receive thread) own that internally and must be safe to call from the
/// orchestrator's single-threaded consumer tasks.
pub trait Engine: Send {
    /// Wires the host-provided callback table in. Called exactly once,
    /// before the first `handle_packet`.
    fn start(&mut self, callbacks: BridgeCallbacks) -> Result<(), CoreError>;

    /// Idempotent teardown; safe to call more than once.
    fn stop(&mut self);

    /// Feeds one raw IP datagram read from the virtual interface. Returns
    /// `false` when the datagram could not be parsed or admitted.
    fn handle_packet(&mut self, packet: &[u8], protocol: u32) -> bool;

    /// Inbound bytes arriving on an established TCP handle.
    fn on_tcp_receive(&mut self, handle: u64, payload: &[u8]) -> bool;

    /// Inbound bytes arriving on an established UDP handle.
    fn on_udp_receive(&mut self, handle: u64, payload: &[u8]) -> bool;

    /// Reports the outcome of a previously requested dial. Success XOR
    /// failure, at most once per handle.
    fn on_dial_result(&mut self, handle: u64, success: bool, reason: Option<&str>);

    fn on_tcp_close(&mut self, handle: u64);
    fn on_udp_close(&mut self, handle: u64);

    /// Snapshot of lifetime flow counters, for diagnostics/RPC.
    fn counters(&self) -> FlowCounters;
    fn stats(&self) -> FlowStats;
}
