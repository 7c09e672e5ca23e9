#![deny(unsafe_op_in_unsafe_fn)]

mod byte_budget;
mod config;
mod connection_table;
mod controller;
mod device;
mod dns;
mod engine;
mod error;
pub mod ffi;
mod flow_manager;
mod flow_tracker;
mod host_tracker;
mod logger;
mod metrics;
mod orchestrator;
mod parser;
mod policy;
mod send_window;
mod telemetry;
mod time_ids;

use std::ffi::CStr;
use std::os::raw::{c_char, c_void};
use std::ptr::NonNull;
use std::slice;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};
use tokio::runtime::{Builder, Runtime};

use crate::config::ProviderConfig;
use crate::controller::{EngineFactory, NetworkSettingsApplier, ProviderController};
use crate::dns::{ResolveError, Resolver, SystemResolver};
use crate::engine::ffi::FfiEngine;
use crate::ffi::{
    BridgeCallbacks, BridgeLogSink, BridgeResolveResult, FlowCounters, FlowStats, SetNetworkFn,
    WritePacketsFn,
};
use crate::orchestrator::TunnelHost;

const INBOUND_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_MTU: usize = 1280;
const DEFAULT_RING_CAPACITY: usize = 512;

/// Push/pull conduit for raw IP datagrams between Swift's packet-tunnel flow
/// and the orchestrator: `BridgeEngineHandlePacket` pushes into the bounded
/// channel, `try_read_packets` drains it, and `write_packets` forwards
/// straight back out through the host-registered write callback — the same
/// shape `device::TunHandle` uses for the engine's own smoltcp-facing ring,
/// generalized to the orchestrator's pull-based [`TunnelHost`] contract.
struct PacketConduit {
    inbound_tx: Sender<(Vec<u8>, u32)>,
    inbound_rx: Mutex<Receiver<(Vec<u8>, u32)>>,
    write: Mutex<Option<(WritePacketsFn, *mut c_void)>>,
}

unsafe impl Send for PacketConduit {}
unsafe impl Sync for PacketConduit {}

impl PacketConduit {
    fn new() -> Self {
        let (inbound_tx, inbound_rx) = crossbeam_channel::bounded(INBOUND_QUEUE_CAPACITY);
        Self {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            write: Mutex::new(None),
        }
    }

    fn set_write_callback(&self, write: WritePacketsFn, context: *mut c_void) {
        *self.write.lock().unwrap() = Some((write, context));
    }

    fn push(&self, packet: &[u8], protocol: u32) -> bool {
        if self.inbound_tx.try_send((packet.to_vec(), protocol)).is_err() {
            logger::breadcrumb(
                logger::BreadcrumbFlags::DEVICE,
                "host packet queue full, dropping inbound frame".to_string(),
            );
            return false;
        }
        true
    }
}

impl TunnelHost for PacketConduit {
    fn try_read_packets(&self) -> Option<(Vec<Vec<u8>>, Vec<u32>)> {
        let rx = self.inbound_rx.lock().unwrap();
        let mut payloads = Vec::new();
        let mut families = Vec::new();
        while let Ok((payload, family)) = rx.try_recv() {
            payloads.push(payload);
            families.push(family);
            if payloads.len() >= 64 {
                break;
            }
        }
        if payloads.is_empty() {
            None
        } else {
            Some((payloads, families))
        }
    }

    fn write_packets(&self, payloads: &[Vec<u8>], families: &[u32]) {
        let Some((write, context)) = *self.write.lock().unwrap() else {
            return;
        };
        let ptrs: Vec<*const u8> = payloads.iter().map(|p| p.as_ptr()).collect();
        let sizes: Vec<usize> = payloads.iter().map(Vec::len).collect();
        unsafe {
            write(ptrs.as_ptr(), sizes.as_ptr(), families.as_ptr(), payloads.len(), context);
        }
    }
}

/// Forwards the validated configuration to Swift's
/// `setTunnelNetworkSettings` equivalent as a JSON document, matching how
/// the controller already exchanges configuration with the host.
struct NetworkSettingsBridge {
    apply: SetNetworkFn,
    context: *mut c_void,
}

unsafe impl Send for NetworkSettingsBridge {}
unsafe impl Sync for NetworkSettingsBridge {}

impl NetworkSettingsApplier for NetworkSettingsBridge {
    fn apply_network_settings(&self, config: &ProviderConfig) -> Result<(), String> {
        let document = serde_json::to_string(config).map_err(|e| e.to_string())?;
        let c_document = std::ffi::CString::new(document).map_err(|e| e.to_string())?;
        let accepted = unsafe { (self.apply)(c_document.as_ptr(), self.context) };
        if accepted {
            Ok(())
        } else {
            Err("host rejected tunnel network settings".to_string())
        }
    }
}

fn engine_factory() -> EngineFactory {
    Box::new(move |metrics, policy, host_tracker| {
        let wake = Arc::new(tokio::sync::Notify::new());
        let device = device::TunDevice::new(DEFAULT_MTU, wake.clone(), DEFAULT_RING_CAPACITY);
        Box::new(FfiEngine::new(
            device,
            wake,
            metrics,
            policy,
            host_tracker,
            tokio::runtime::Handle::current(),
        ))
    })
}

/// Opaque handle shared with Swift/ObjC: owns the dedicated tokio runtime
/// the controller and its orchestrator run on, the packet conduit, and the
/// resolver used for `BridgeEngineResolveHost`.
pub struct BridgeEngine {
    runtime: Runtime,
    controller: Arc<ProviderController>,
    conduit: Arc<PacketConduit>,
    resolver: SystemResolver,
}

impl BridgeEngine {
    fn new(config_json: &str, set_network: SetNetworkFn, network_context: *mut c_void) -> anyhow::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .enable_io()
            .build()?;
        let config = ProviderConfig::from_json(config_json).map_err(|e| anyhow::anyhow!(e))?;
        let conduit = Arc::new(PacketConduit::new());
        let network_bridge = Arc::new(NetworkSettingsBridge { apply: set_network, context: network_context });

        let controller = runtime.block_on(async {
            ProviderController::new(
                config,
                Arc::clone(&conduit) as Arc<dyn TunnelHost>,
                network_bridge,
                engine_factory(),
                "ffi-terminator",
                tokio::runtime::Handle::current(),
            )
        })?;

        Ok(Self { runtime, controller, conduit, resolver: SystemResolver::default() })
    }

    fn start(&self, callbacks: BridgeCallbacks) -> anyhow::Result<()> {
        self.runtime
            .block_on(async { self.controller.start(callbacks) })
            .map_err(|e| anyhow::anyhow!(e))
    }

    fn stop(&self) {
        self.controller.stop();
    }

    fn handle_rpc_json(&self, command: &str) -> String {
        let response = self.controller.handle_rpc(command);
        serde_json::to_string(&response).unwrap_or_else(|_| "{\"ok\":false}".to_string())
    }

    fn resolve_host(&self, host: &str) -> Result<dns::ResolveOutcome, ResolveError> {
        self.resolver.resolve(host)
    }
}

#[no_mangle]
pub unsafe extern "C" fn BridgeNewEngine(
    config_json: *const c_char,
    set_network: SetNetworkFn,
    network_context: *mut c_void,
) -> *mut BridgeEngine {
    if config_json.is_null() {
        return std::ptr::null_mut();
    }
    let config_str = match unsafe { CStr::from_ptr(config_json) }.to_str() {
        Ok(value) => value,
        Err(_) => return std::ptr::null_mut(),
    };
    match BridgeEngine::new(config_str, set_network, network_context) {
        Ok(engine) => Box::into_raw(Box::new(engine)),
        Err(error) => {
            logger::error(format!("BridgeNewEngine failed: {error:?}"));
            std::ptr::null_mut()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn BridgeFreeEngine(engine: *mut BridgeEngine) {
    if let Some(engine) = NonNull::new(engine) {
        unsafe {
            drop(Box::from_raw(engine.as_ptr()));
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn BridgeEngineStart(
    engine: *mut BridgeEngine,
    write_packets: WritePacketsFn,
    write_context: *mut c_void,
    callbacks: *const BridgeCallbacks,
) -> i32 {
    let Some(engine) = NonNull::new(engine) else {
        return -1;
    };
    let Some(callbacks) = NonNull::new(callbacks as *mut BridgeCallbacks) else {
        return -2;
    };
    let engine_ref = unsafe { engine.as_ref() };
    engine_ref.conduit.set_write_callback(write_packets, write_context);
    match engine_ref.start(unsafe { *callbacks.as_ref() }) {
        Ok(()) => 0,
        Err(error) => {
            logger::error(format!("BridgeEngineStart error: {error:?}"));
            -3
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn BridgeEngineStop(engine: *mut BridgeEngine) {
    if let Some(engine) = NonNull::new(engine) {
        unsafe { engine.as_ref() }.stop();
    }
}

#[no_mangle]
pub unsafe extern "C" fn BridgeSetLogSink(
    sink: *const BridgeLogSink,
    level: *const c_char,
    _error: *mut *mut c_void,
) -> bool {
    let sink_ref = unsafe { sink.as_ref() };
    let level_str = if level.is_null() {
        None
    } else {
        match unsafe { CStr::from_ptr(level) }.to_str() {
            Ok(value) => Some(value),
            Err(_) => None,
        }
    };
    logger::install_sink(sink_ref, level_str).is_ok()
}

#[no_mangle]
pub extern "C" fn BridgeSetBreadcrumbMask(mask: u32) {
    logger::set_breadcrumb_mask(mask);
}

/// Pushes one raw IP datagram read by Swift's `NEPacketTunnelFlow` into the
/// host conduit. Returns `false` if the bounded queue is full and the frame
/// was dropped — the caller is expected to keep reading regardless.
#[no_mangle]
pub unsafe extern "C" fn BridgeEngineHandlePacket(
    engine: *mut BridgeEngine,
    packet: *const u8,
    length: usize,
    protocol: u32,
) -> bool {
    let Some(engine) = NonNull::new(engine) else {
        return false;
    };
    if packet.is_null() || length == 0 {
        return false;
    }
    let slice = unsafe { slice::from_raw_parts(packet, length) };
    unsafe { engine.as_ref() }.conduit.push(slice, protocol)
}

#[no_mangle]
pub unsafe extern "C" fn BridgeEngineOnTcpReceive(
    engine: *mut BridgeEngine,
    handle: u64,
    payload: *const u8,
    length: usize,
) -> bool {
    let Some(engine) = NonNull::new(engine) else {
        return false;
    };
    if payload.is_null() {
        return false;
    }
    let slice = unsafe { slice::from_raw_parts(payload, length) };
    unsafe { engine.as_ref() }.controller.report_tcp_receive(handle, slice)
}

#[no_mangle]
pub unsafe extern "C" fn BridgeEngineOnUdpReceive(
    engine: *mut BridgeEngine,
    handle: u64,
    payload: *const u8,
    length: usize,
) -> bool {
    let Some(engine) = NonNull::new(engine) else {
        return false;
    };
    if payload.is_null() {
        return false;
    }
    let slice = unsafe { slice::from_raw_parts(payload, length) };
    unsafe { engine.as_ref() }.controller.report_udp_receive(handle, slice)
}

#[no_mangle]
pub unsafe extern "C" fn BridgeEngineOnDialResult(
    engine: *mut BridgeEngine,
    handle: u64,
    success: bool,
    reason: *const c_char,
) {
    let Some(engine) = NonNull::new(engine) else {
        return;
    };
    let reason_str = if reason.is_null() {
        None
    } else {
        unsafe { CStr::from_ptr(reason) }.to_str().ok()
    };
    unsafe { engine.as_ref() }.controller.report_dial_result(handle, success, reason_str);
}

#[no_mangle]
pub unsafe extern "C" fn BridgeEngineOnTcpClose(engine: *mut BridgeEngine, handle: u64) {
    if let Some(engine) = NonNull::new(engine) {
        unsafe { engine.as_ref() }.controller.report_tcp_close(handle);
    }
}

#[no_mangle]
pub unsafe extern "C" fn BridgeEngineOnUdpClose(engine: *mut BridgeEngine, handle: u64) {
    if let Some(engine) = NonNull::new(engine) {
        unsafe { engine.as_ref() }.controller.report_udp_close(handle);
    }
}

#[no_mangle]
pub unsafe extern "C" fn BridgeEngineRpc(
    engine: *mut BridgeEngine,
    command: *const c_char,
) -> *mut c_char {
    let Some(engine) = NonNull::new(engine) else {
        return std::ptr::null_mut();
    };
    let Ok(command) = (unsafe { CStr::from_ptr(command) }.to_str()) else {
        return std::ptr::null_mut();
    };
    let response = unsafe { engine.as_ref() }.handle_rpc_json(command);
    std::ffi::CString::new(response)
        .map(std::ffi::CString::into_raw)
        .unwrap_or(std::ptr::null_mut())
}

#[no_mangle]
pub unsafe extern "C" fn BridgeFreeRpcResponse(response: *mut c_char) {
    if !response.is_null() {
        unsafe {
            drop(std::ffi::CString::from_raw(response));
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn BridgeEngineGetCounters(
    engine: *mut BridgeEngine,
    out: *mut FlowCounters,
) -> bool {
    let Some(engine) = NonNull::new(engine) else {
        return false;
    };
    let Some(out) = (unsafe { out.as_mut() }) else {
        return false;
    };
    *out = unsafe { engine.as_ref() }.controller.engine_counters();
    true
}

#[no_mangle]
pub unsafe extern "C" fn BridgeEngineGetStats(engine: *mut BridgeEngine, out: *mut FlowStats) -> bool {
    let Some(engine) = NonNull::new(engine) else {
        return false;
    };
    let Some(out) = (unsafe { out.as_mut() }) else {
        return false;
    };
    *out = unsafe { engine.as_ref() }.controller.engine_stats();
    true
}

#[no_mangle]
pub unsafe extern "C" fn BridgeEngineResolveHost(
    engine: *mut BridgeEngine,
    host: *const c_char,
    result: *mut BridgeResolveResult,
) -> i32 {
    let Some(engine) = NonNull::new(engine) else {
        return -1;
    };
    let Some(result) = (unsafe { result.as_mut() }) else {
        return -2;
    };
    result.reset();
    if host.is_null() {
        return -3;
    }
    let host = match unsafe { CStr::from_ptr(host) }.to_str() {
        Ok(value) => value,
        Err(_) => return -4,
    };
    match unsafe { engine.as_ref() }.resolve_host(host) {
        Ok(outcome) => {
            if outcome.addresses.is_empty() {
                return -5;
            }
            let ttl = outcome.ttl.as_secs().min(u64::from(u32::MAX)) as u32;
            if result.populate(&outcome.addresses, ttl).is_err() {
                return -6;
            }
            0
        }
        Err(ResolveError::Unsupported) => -7,
        Err(ResolveError::LookupFailed(_)) => -8,
    }
}

#[no_mangle]
pub unsafe extern "C" fn BridgeResolveResultFree(result: *mut BridgeResolveResult) {
    if let Some(result) = unsafe { result.as_mut() } {
        result.reset();
    }
}

#[no_mangle]
pub extern "C" fn BridgeEnsureLinked() -> bool {
    true
}
