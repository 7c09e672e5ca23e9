//! Typed error taxonomy for the tunnel core.
//!
//! Subsystems keep their own small `thiserror` types (see `dns::ResolveError`,
//! `parser::ParseError`, `metrics::store::StoreError`) and convert into
//! [`CoreError`] at the provider/orchestrator boundary. The FFI surface in
//! turn collapses `CoreError` into a status code, the same way the bridge's
//! extern "C" entry points already downgrade `anyhow::Error` today.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration invalid: {0}")]
    ConfigurationInvalid(String),

    #[error("host rejected network settings: {0}")]
    NetworkSettingsFailed(String),

    #[error("engine failed to start: {0}")]
    EngineStartFailed(String),

    #[error("packet budget exhausted")]
    PacketBudgetExhausted,

    #[error("dial {0} for handle {1}: {2}")]
    DialFailed(&'static str, u64, String),

    #[error("write timeout for handle {0}")]
    WriteTimeout(u64),

    #[error("send window exhausted for handle {0}")]
    SendWindowExhausted(u64),

    #[error("policy blocked {proto} host {host}")]
    PolicyBlock { proto: &'static str, host: String },
}

impl CoreError {
    /// Short machine-readable kind, matching the taxonomy's `kind` column.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::ConfigurationInvalid(_) => "configuration-invalid",
            CoreError::NetworkSettingsFailed(_) => "network-settings-failed",
            CoreError::EngineStartFailed(_) => "engine-start-failed",
            CoreError::PacketBudgetExhausted => "packet-budget-exhausted",
            CoreError::DialFailed(kind, _, _) if *kind == "timeout" => "dial-timeout",
            CoreError::DialFailed(..) => "dial-failed",
            CoreError::WriteTimeout(_) => "write-timeout",
            CoreError::SendWindowExhausted(_) => "send-window-exhausted",
            CoreError::PolicyBlock { .. } => "policy-block",
        }
    }
}

/// Lifecycle / diagnostic events published on the telemetry bus, replacing
/// the closure-heavy `didFail`/`didStop`/`willStart` callback graph with a
/// sum type per the design notes.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    WillStart,
    DidStart,
    DidFail { error: String },
    DidStop,
    Reasserting,
}
