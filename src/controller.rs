//! Provider controller: the top-level façade a host embeds — validate
//! configuration, apply network settings, start/stop the tunnel adapter,
//! and answer the app-message RPC grammar.
//!
//! Grounded in the engine bridge's `BridgeEngine` (`lib.rs`'s FFI entry
//! surface already plays this role via `BridgeNewEngine`/`BridgeEngineStart`/
//! `BridgeEngineStop`, but exposes no RPC grammar and takes configuration as
//! flat FFI scalars). This keeps the same `Arc<Mutex<...>>`-owned-state shape
//! and the same start/stop entry points, adding `ProviderConfig` validation
//! ahead of start, `handle_rpc`, and a bounded `restart_relay`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::runtime::Handle as RuntimeHandle;

use crate::byte_budget::ByteBudget;
use crate::config::ProviderConfig;
use crate::connection_table::ConnectionTable;
use crate::engine::Engine;
use crate::error::CoreError;
use crate::ffi::{BridgeCallbacks, FlowCounters, FlowStats};
use crate::flow_tracker::FlowTracker;
use crate::host_tracker::HostTracker;
use crate::metrics::Collector;
use crate::orchestrator::{Direction, Orchestrator, TunnelHost};
use crate::policy::shaper::Shaper;
use crate::policy::{PolicyManager, RuleAction, ShapingConfig};
use crate::send_window::SendWindow;
use crate::telemetry::TelemetryBus;
use crate::time_ids::wall_clock_seconds_f64;

const BACKPRESSURE_RELIEF_THRESHOLD: f64 = 0.85;

/// Applies host interface settings once a configuration validates, the
/// `NEPacketTunnelProvider.setTunnelNetworkSettings` analog.
pub trait NetworkSettingsApplier: Send + Sync {
    fn apply_network_settings(&self, config: &ProviderConfig) -> Result<(), String>;
}

/// Builds a fresh [`Engine`] against the controller's shared metrics/policy/
/// attribution state. Takes those as arguments rather than closing over them
/// so the same factory works whether it is wired up before or after the
/// controller that owns those `Arc`s exists.
pub type EngineFactory = Box<
    dyn Fn(Arc<Collector>, Arc<PolicyManager>, Arc<HostTracker>) -> Box<dyn Engine> + Send + Sync,
>;

/// Response shape for every `handle_rpc` call, matching the app-message
/// grammar's full status payload regardless of which command was issued.
#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub ok: bool,
    pub command: String,
    pub error: Option<String>,
    pub timestamp: f64,
    #[serde(rename = "isStopping")]
    pub is_stopping: bool,
    #[serde(rename = "waitingForBackpressureRelief")]
    pub waiting_for_backpressure_relief: bool,
    #[serde(rename = "relayRestartInProgress")]
    pub relay_restart_in_progress: bool,
    pub reasserting: bool,
    #[serde(rename = "relayMode")]
    pub relay_mode: String,
    #[serde(rename = "defaultPathSignature")]
    pub default_path_signature: String,
    #[serde(rename = "outboundPacketCount")]
    pub outbound_packet_count: u64,
    #[serde(rename = "inboundPacketCount")]
    pub inbound_packet_count: u64,
}

fn install_policy_rules(policy: &Arc<PolicyManager>, config: &ProviderConfig) {
    let policies = &config.provider.policies;
    if let Some(default) = &policies.traffic_shaping.default_policy {
        policy.install_rule("*", None, RuleAction::Shape(ShapingConfig::from(default)));
    }
    for rule in &policies.traffic_shaping.rules {
        let action = RuleAction::Shape(ShapingConfig::from(&rule.policy));
        for host in &rule.hosts {
            policy.install_rule(host, rule.ports.clone(), action.clone());
        }
    }
    // Installed last so an overlapping block always outranks a shaping rule
    // on the same host, regardless of declaration order in the document.
    for host in &policies.blocked_hosts {
        policy.install_rule(host, None, RuleAction::Block);
    }
}

/// Owns the configuration, the shared policy/attribution/metrics state, and
/// the current [`Orchestrator`] instance (`None` while stopped). A restart
/// tears the orchestrator down and rebuilds it from the same configuration
/// and the callbacks captured at the last `start`, without the controller
/// itself ever going away.
pub struct ProviderController {
    config: Mutex<ProviderConfig>,
    policy: Arc<PolicyManager>,
    host_tracker: Arc<HostTracker>,
    metrics: Arc<Collector>,
    telemetry: Arc<TelemetryBus>,
    orchestrator: Mutex<Option<Orchestrator>>,
    tunnel_host: Arc<dyn TunnelHost>,
    network_host: Arc<dyn NetworkSettingsApplier>,
    engine_factory: EngineFactory,
    runtime: RuntimeHandle,
    relay_mode: String,
    last_callbacks: Mutex<Option<BridgeCallbacks>>,
    outbound_packets: Arc<AtomicU64>,
    inbound_packets: Arc<AtomicU64>,
    stopping: AtomicBool,
    relay_restart_in_progress: AtomicBool,
    reasserting: AtomicBool,
    default_path_signature: Mutex<String>,
}

impl ProviderController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ProviderConfig,
        tunnel_host: Arc<dyn TunnelHost>,
        network_host: Arc<dyn NetworkSettingsApplier>,
        engine_factory: EngineFactory,
        relay_mode: impl Into<String>,
        runtime: RuntimeHandle,
    ) -> Result<Arc<Self>, CoreError> {
        config.validate()?;
        let policy = PolicyManager::new();
        install_policy_rules(&policy, &config);
        let metrics = Arc::new(Collector::new());
        let telemetry = Arc::new(TelemetryBus::new(Arc::clone(&metrics)));
        Ok(Arc::new(Self {
            config: Mutex::new(config),
            policy,
            host_tracker: Arc::new(HostTracker::new(std::time::Duration::from_secs(300))),
            metrics,
            telemetry,
            orchestrator: Mutex::new(None),
            tunnel_host,
            network_host,
            engine_factory,
            runtime,
            relay_mode: relay_mode.into(),
            last_callbacks: Mutex::new(None),
            outbound_packets: Arc::new(AtomicU64::new(0)),
            inbound_packets: Arc::new(AtomicU64::new(0)),
            stopping: AtomicBool::new(false),
            relay_restart_in_progress: AtomicBool::new(false),
            reasserting: AtomicBool::new(false),
            default_path_signature: Mutex::new(String::new()),
        }))
    }

    pub fn telemetry(&self) -> &Arc<TelemetryBus> {
        &self.telemetry
    }

    pub fn metrics(&self) -> &Arc<Collector> {
        &self.metrics
    }

    pub fn set_default_path_signature(&self, signature: impl Into<String>) {
        *self.default_path_signature.lock().unwrap() = signature.into();
    }

    /// Validates and applies host network settings, builds a fresh
    /// orchestrator wired to the current configuration, and starts it.
    /// Idempotent against a stale running instance: an existing orchestrator
    /// is stopped first.
    pub fn start(&self, callbacks: BridgeCallbacks) -> Result<(), CoreError> {
        let config = self.config.lock().unwrap().clone();
        config.validate()?;
        self.network_host
            .apply_network_settings(&config)
            .map_err(CoreError::NetworkSettingsFailed)?;

        if let Some(mut existing) = self.orchestrator.lock().unwrap().take() {
            existing.stop();
        }

        let mtu = config.normalized_mtu() as usize;
        let memory = &config.provider.memory;
        let send_window = Arc::new(SendWindow::new(memory.max_concurrent_network_sends));
        let connection_table =
            ConnectionTable::new(self.runtime.clone(), send_window, mtu, memory.per_flow_bytes as usize);
        let byte_budget = Arc::new(ByteBudget::new(memory.packet_pool_bytes));
        let flow_tracker = Arc::new(FlowTracker::new());

        let engine = (self.engine_factory)(
            Arc::clone(&self.metrics),
            Arc::clone(&self.policy),
            Arc::clone(&self.host_tracker),
        );
        let mut orchestrator = Orchestrator::new(
            engine,
            Arc::clone(&self.tunnel_host),
            Arc::clone(&self.policy),
            Arc::clone(&self.host_tracker),
            Arc::new(Shaper::new()),
            Arc::new(Shaper::new()),
            byte_budget,
            flow_tracker,
            connection_table,
            Arc::clone(&self.metrics),
            self.runtime.clone(),
            memory.packet_batch_limit,
        );

        let outbound_counter = Arc::clone(&self.outbound_packets);
        let inbound_counter = Arc::clone(&self.inbound_packets);
        orchestrator.set_packet_tap(Box::new(move |direction, _payload, _family| match direction {
            Direction::Outbound => {
                outbound_counter.fetch_add(1, Ordering::Relaxed);
            }
            Direction::Inbound => {
                inbound_counter.fetch_add(1, Ordering::Relaxed);
            }
        }));

        orchestrator.start(callbacks)?;
        *self.orchestrator.lock().unwrap() = Some(orchestrator);
        *self.last_callbacks.lock().unwrap() = Some(callbacks);
        self.stopping.store(false, Ordering::Release);
        Ok(())
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        if let Some(mut orchestrator) = self.orchestrator.lock().unwrap().take() {
            orchestrator.stop();
        }
        self.stopping.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.orchestrator
            .lock()
            .unwrap()
            .as_ref()
            .map(Orchestrator::is_running)
            .unwrap_or(false)
    }

    pub fn engine_counters(&self) -> FlowCounters {
        self.orchestrator
            .lock()
            .unwrap()
            .as_ref()
            .map(Orchestrator::engine_counters)
            .unwrap_or_default()
    }

    pub fn engine_stats(&self) -> FlowStats {
        self.orchestrator
            .lock()
            .unwrap()
            .as_ref()
            .map(Orchestrator::engine_stats)
            .unwrap_or_default()
    }

    pub fn report_tcp_receive(&self, handle: u64, payload: &[u8]) -> bool {
        self.orchestrator
            .lock()
            .unwrap()
            .as_ref()
            .map(|orchestrator| orchestrator.report_tcp_receive(handle, payload))
            .unwrap_or(false)
    }

    pub fn report_udp_receive(&self, handle: u64, payload: &[u8]) -> bool {
        self.orchestrator
            .lock()
            .unwrap()
            .as_ref()
            .map(|orchestrator| orchestrator.report_udp_receive(handle, payload))
            .unwrap_or(false)
    }

    pub fn report_dial_result(&self, handle: u64, success: bool, reason: Option<&str>) {
        if let Some(orchestrator) = self.orchestrator.lock().unwrap().as_ref() {
            orchestrator.report_dial_result(handle, success, reason);
        }
    }

    pub fn report_tcp_close(&self, handle: u64) {
        if let Some(orchestrator) = self.orchestrator.lock().unwrap().as_ref() {
            orchestrator.report_tcp_close(handle);
        }
    }

    pub fn report_udp_close(&self, handle: u64) {
        if let Some(orchestrator) = self.orchestrator.lock().unwrap().as_ref() {
            orchestrator.report_udp_close(handle);
        }
    }

    /// Bounded tear-down/re-establish of the relay without dropping the
    /// controller: reuses the callbacks captured at the last `start`.
    /// A restart already in progress is a no-op, not a queued second one.
    pub fn restart_relay(&self) -> Result<(), CoreError> {
        if self.relay_restart_in_progress.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let callbacks = *self.last_callbacks.lock().unwrap();
        self.stop();
        let result = match callbacks {
            Some(callbacks) => self.start(callbacks),
            None => Err(CoreError::EngineStartFailed(
                "restart requested before the relay ever started".into(),
            )),
        };
        self.relay_restart_in_progress.store(false, Ordering::Release);
        result
    }

    /// Called on a path-monitor reassertion (default route flap): marks
    /// `reasserting`, records the new path signature, then performs the
    /// same bounded restart `restart_relay` does.
    pub fn reassert_path(&self, new_signature: impl Into<String>) -> Result<(), CoreError> {
        self.reasserting.store(true, Ordering::Release);
        self.set_default_path_signature(new_signature);
        let result = self.restart_relay();
        self.reasserting.store(false, Ordering::Release);
        result
    }

    /// Replaces the stored configuration and re-derives policy rules from
    /// it. Does not itself restart the relay; callers that need the new
    /// memory/MTU settings applied should follow with `restart_relay`.
    pub fn reload_configuration(&self, document: &str) -> Result<(), CoreError> {
        let new_config = ProviderConfig::from_json(document)?;
        self.policy.clear();
        install_policy_rules(&self.policy, &new_config);
        *self.config.lock().unwrap() = new_config;
        Ok(())
    }

    /// Dispatches one app-message command per the bridge's RPC grammar.
    /// An unrecognized command still returns the full status payload, with
    /// `ok: false` and `error: "unsupported-command"`.
    pub fn handle_rpc(&self, command: &str) -> RpcResponse {
        match command.trim().to_ascii_lowercase().as_str() {
            "status" | "diagnostics" => self.status_response(command, None),
            "flushmetrics" => {
                self.metrics.drain_snapshot_frame();
                self.telemetry.tick();
                self.status_response(command, None)
            }
            "restartrelay" => match self.restart_relay() {
                Ok(()) => self.status_response(command, None),
                Err(err) => self.status_response(command, Some(err.to_string())),
            },
            "reloadconfiguration" => {
                let current = self.config.lock().unwrap().clone();
                match current.validate() {
                    Ok(()) => self.status_response(command, None),
                    Err(err) => self.status_response(command, Some(err.to_string())),
                }
            }
            _ => self.status_response(command, Some("unsupported-command".to_string())),
        }
    }

    fn status_response(&self, command: &str, error: Option<String>) -> RpcResponse {
        let utilization = self
            .orchestrator
            .lock()
            .unwrap()
            .as_ref()
            .map(Orchestrator::byte_budget_utilization)
            .unwrap_or(0.0);
        RpcResponse {
            ok: error.is_none(),
            command: command.to_string(),
            error,
            timestamp: wall_clock_seconds_f64(),
            is_stopping: self.stopping.load(Ordering::Acquire),
            waiting_for_backpressure_relief: utilization >= BACKPRESSURE_RELIEF_THRESHOLD,
            relay_restart_in_progress: self.relay_restart_in_progress.load(Ordering::Acquire),
            reasserting: self.reasserting.load(Ordering::Acquire),
            relay_mode: self.relay_mode.clone(),
            default_path_signature: self.default_path_signature.lock().unwrap().clone(),
            outbound_packet_count: self.outbound_packets.load(Ordering::Relaxed),
            inbound_packet_count: self.inbound_packets.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::noop::NoOpEngine;
    use std::collections::VecDeque;

    struct MockHost {
        queue: Mutex<VecDeque<(Vec<Vec<u8>>, Vec<u32>)>>,
    }

    impl TunnelHost for MockHost {
        fn try_read_packets(&self) -> Option<(Vec<Vec<u8>>, Vec<u32>)> {
            self.queue.lock().unwrap().pop_front()
        }
        fn write_packets(&self, _payloads: &[Vec<u8>], _families: &[u32]) {}
    }

    struct AlwaysAppliesSettings;
    impl NetworkSettingsApplier for AlwaysAppliesSettings {
        fn apply_network_settings(&self, _config: &ProviderConfig) -> Result<(), String> {
            Ok(())
        }
    }

    struct RejectsSettings;
    impl NetworkSettingsApplier for RejectsSettings {
        fn apply_network_settings(&self, _config: &ProviderConfig) -> Result<(), String> {
            Err("tun device busy".to_string())
        }
    }

    fn sample_config() -> ProviderConfig {
        ProviderConfig::from_json(
            r#"{
                "provider": {
                    "mtu": 1400,
                    "ipv4": {"address": "10.0.0.2", "subnet_mask": "255.255.255.0", "remote_address": "10.0.0.1"},
                    "dns": {"servers": ["1.1.1.1"], "match_domains": [], "search_domains": []}
                }
            }"#,
        )
        .unwrap()
    }

    fn stub_callbacks() -> BridgeCallbacks {
        use std::os::raw::{c_char, c_void};
        unsafe extern "C" fn emit(
            _p: *const *const u8,
            _s: *const usize,
            _pr: *const u32,
            _c: usize,
            _ctx: *mut c_void,
        ) {
        }
        unsafe extern "C" fn dial(_h: *const c_char, _p: u16, _handle: u64, _c: *mut c_void) {}
        unsafe extern "C" fn send(_h: u64, _p: *const u8, _l: usize, _c: *mut c_void) {}
        unsafe extern "C" fn close(_h: u64, _m: *const c_char, _c: *mut c_void) {}
        unsafe extern "C" fn dns(
            _h: *const c_char,
            _a: *const *const c_char,
            _c: usize,
            _t: u32,
            _ctx: *mut c_void,
        ) {
        }
        BridgeCallbacks {
            emit_packets: emit,
            request_tcp_dial: dial,
            request_udp_dial: dial,
            tcp_send: send,
            udp_send: send,
            tcp_close: close,
            udp_close: close,
            record_dns: dns,
            context: std::ptr::null_mut(),
        }
    }

    fn build_controller() -> Arc<ProviderController> {
        ProviderController::new(
            sample_config(),
            Arc::new(MockHost { queue: Mutex::new(VecDeque::new()) }),
            Arc::new(AlwaysAppliesSettings),
            Box::new(|_metrics, _policy, _host_tracker| Box::new(NoOpEngine::new()) as Box<dyn Engine>),
            "noop",
            tokio::runtime::Handle::current(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn unsupported_command_reports_the_standard_error() {
        let controller = build_controller();
        let response = controller.handle_rpc("not-a-real-command");
        assert!(!response.ok);
        assert_eq!(response.error.as_deref(), Some("unsupported-command"));
        assert_eq!(response.command, "not-a-real-command");
    }

    #[tokio::test]
    async fn status_reports_running_state_after_start() {
        let controller = build_controller();
        controller.start(stub_callbacks()).unwrap();
        assert!(controller.is_running());
        let response = controller.handle_rpc("status");
        assert!(response.ok);
        assert_eq!(response.relay_mode, "noop");
        controller.stop();
        assert!(!controller.is_running());
    }

    #[tokio::test]
    async fn start_fails_when_host_rejects_network_settings() {
        let controller = ProviderController::new(
            sample_config(),
            Arc::new(MockHost { queue: Mutex::new(VecDeque::new()) }),
            Arc::new(RejectsSettings),
            Box::new(|_metrics, _policy, _host_tracker| Box::new(NoOpEngine::new()) as Box<dyn Engine>),
            "noop",
            tokio::runtime::Handle::current(),
        )
        .unwrap();
        let err = controller.start(stub_callbacks()).unwrap_err();
        assert_eq!(err.kind(), "network-settings-failed");
    }

    #[tokio::test]
    async fn restart_relay_reuses_the_last_callbacks() {
        let controller = build_controller();
        controller.start(stub_callbacks()).unwrap();
        controller.restart_relay().unwrap();
        assert!(controller.is_running());
        controller.stop();
    }

    #[tokio::test]
    async fn restart_relay_without_a_prior_start_reports_engine_start_failed() {
        let controller = build_controller();
        let err = controller.restart_relay().unwrap_err();
        assert_eq!(err.kind(), "engine-start-failed");
    }

    #[tokio::test]
    async fn reload_configuration_replaces_policy_rules() {
        let controller = build_controller();
        let document = r#"{
            "provider": {
                "mtu": 1400,
                "ipv4": {"address": "10.0.0.2", "subnet_mask": "255.255.255.0", "remote_address": "10.0.0.1"},
                "dns": {"servers": ["1.1.1.1"], "match_domains": [], "search_domains": []},
                "policies": {"blocked_hosts": ["ads.example.com"]}
            }
        }"#;
        controller.reload_configuration(document).unwrap();
        assert!(controller
            .policy
            .decide(&"93.184.216.34".parse().unwrap(), Some("ads.example.com"), None)
            .is_some());
    }
}
