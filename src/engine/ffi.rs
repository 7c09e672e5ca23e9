//! Adapts the existing `FlowManager`/`BridgeCallbacks` pair — a
//! tun2socks-style terminator driven from the host side through extern "C"
//! trampolines — behind the [`Engine`] trait, so the orchestrator is
//! agnostic to whether it drives this or [`super::noop::NoOpEngine`].
//!
//! `FlowManager` needs periodic polling to drive smoltcp's interface and
//! flush pending dials/shaping queues; this wrapper owns that poll task the
//! same way `BridgeEngine::start_poll_loop` already does in the engine
//! bridge, just spawned onto whatever runtime the orchestrator is running
//! in rather than a dedicated single-purpose one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant as StdInstant;

use smoltcp::time::Instant as SmoltInstant;
use tokio::runtime::Handle as RuntimeHandle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

use super::Engine;
use crate::device::{self, TunDevice};
use crate::error::CoreError;
use crate::ffi::{BridgeCallbacks, FlowCounters, FlowStats};
use crate::flow_manager::FlowManager;
use crate::host_tracker::HostTracker;
use crate::logger::{self, BreadcrumbFlags};
use crate::metrics::Collector;
use crate::policy::PolicyManager;

pub struct FfiEngine {
    flows: Arc<Mutex<FlowManager>>,
    wake: Arc<Notify>,
    running: Arc<AtomicBool>,
    poll_task: Option<JoinHandle<()>>,
    runtime: RuntimeHandle,
}

impl FfiEngine {
    pub fn new(
        device: TunDevice,
        wake: Arc<Notify>,
        metrics: Arc<Collector>,
        policy: Arc<PolicyManager>,
        host_tracker: Arc<HostTracker>,
        runtime: RuntimeHandle,
    ) -> Self {
        let flows = FlowManager::new(device, Arc::clone(&wake), metrics, policy, host_tracker);
        Self {
            flows: Arc::new(Mutex::new(flows)),
            wake,
            running: Arc::new(AtomicBool::new(false)),
            poll_task: None,
            runtime,
        }
    }

    fn spawn_poll_loop(&mut self) {
        let flows = Arc::clone(&self.flows);
        let wake = Arc::clone(&self.wake);
        let running = Arc::clone(&self.running);
        let handle = self.runtime.spawn(async move {
            let epoch = StdInstant::now();
            let mut ticker = time::interval(Duration::from_millis(5));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = wake.notified() => {}
                }
                if !running.load(Ordering::Acquire) {
                    break;
                }
                let millis = epoch.elapsed().as_millis().min(i64::MAX as u128) as i64;
                if let Ok(mut flows) = flows.lock() {
                    flows.poll(SmoltInstant::from_millis(millis));
                }
            }
        });
        self.poll_task = Some(handle);
    }
}

impl Engine for FfiEngine {
    fn start(&mut self, callbacks: BridgeCallbacks) -> Result<(), CoreError> {
        {
            let mut flows = self
                .flows
                .lock()
                .map_err(|_| CoreError::EngineStartFailed("flow manager lock poisoned".into()))?;
            flows.install_callbacks(callbacks);
        }
        self.running.store(true, Ordering::Release);
        self.spawn_poll_loop();
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.wake.notify_waiters();
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
    }

    fn handle_packet(&mut self, packet: &[u8], protocol: u32) -> bool {
        let Ok(parsed) = device::parse_packet_validated(packet) else {
            logger::breadcrumb(
                BreadcrumbFlags::DEVICE,
                format!(
                    "dropped packet (len={}, proto=0x{:x}) - unsupported L3 header",
                    packet.len(),
                    protocol
                ),
            );
            return false;
        };
        if let Ok(mut flows) = self.flows.lock() {
            flows.process_packet(&parsed);
        }
        true
    }

    fn on_tcp_receive(&mut self, handle: u64, payload: &[u8]) -> bool {
        self.flows
            .lock()
            .map(|mut flows| flows.on_tcp_receive(handle, payload))
            .unwrap_or(false)
    }

    fn on_udp_receive(&mut self, handle: u64, payload: &[u8]) -> bool {
        self.flows
            .lock()
            .map(|mut flows| flows.on_udp_receive(handle, payload))
            .unwrap_or(false)
    }

    fn on_dial_result(&mut self, handle: u64, success: bool, reason: Option<&str>) {
        if let Ok(mut flows) = self.flows.lock() {
            flows.on_dial_result(handle, success, reason);
        }
    }

    fn on_tcp_close(&mut self, handle: u64) {
        if let Ok(mut flows) = self.flows.lock() {
            flows.on_tcp_close(handle);
        }
    }

    fn on_udp_close(&mut self, handle: u64) {
        if let Ok(mut flows) = self.flows.lock() {
            flows.on_udp_close(handle);
        }
    }

    fn counters(&self) -> FlowCounters {
        self.flows
            .lock()
            .map(|flows| flows.counters())
            .unwrap_or_default()
    }

    fn stats(&self) -> FlowStats {
        self.flows
            .lock()
            .map(|flows| flows.stats())
            .unwrap_or_default()
    }
}
