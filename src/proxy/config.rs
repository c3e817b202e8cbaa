use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How streaming client requests are answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamingMode {
    /// Upstream fragments are forwarded to the client as they arrive
    Real,
    /// The peer makes a non-streaming call; the result is replayed as one SSE event
    Fake,
}

impl Default for StreamingMode {
    fn default() -> Self {
        Self::Real
    }
}

impl StreamingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Real => "real",
            Self::Fake => "fake",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "real" => Some(Self::Real),
            "fake" => Some(Self::Fake),
            _ => None,
        }
    }
}

/// Relay service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Allow access from the local network
    /// - false: listen on 127.0.0.1 only (default)
    /// - true: listen on 0.0.0.0
    #[serde(default)]
    pub allow_lan_access: bool,

    /// HTTP API port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bridging channel (WebSocket) port
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,

    /// Accepted API keys. Empty disables authentication.
    #[serde(default)]
    pub api_keys: Vec<String>,

    /// Default response mode for streaming requests
    #[serde(default)]
    pub streaming_mode: StreamingMode,

    /// Consecutive generative failures before rotating (0 disables)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Generative requests served by one identity before rotating (0 disables)
    #[serde(default = "default_switch_on_uses")]
    pub switch_on_uses: u32,

    /// Total attempts for pseudo-stream and buffered requests
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between attempts (milliseconds)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Upstream status codes that rotate the identity immediately
    #[serde(default = "default_immediate_switch_status_codes")]
    pub immediate_switch_status_codes: Vec<u16>,

    /// Identity activated at startup. Defaults to the lowest available index.
    #[serde(default)]
    pub initial_auth_index: Option<u32>,

    /// Directory holding `auth-<n>.json` files. Defaults to `<data_dir>/auth`.
    #[serde(default)]
    pub auth_dir: Option<PathBuf>,

    /// Browser automation driver
    #[serde(default)]
    pub automation: AutomationConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// Browser automation driver endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    /// Base URL of the automation driver's control API
    pub url: String,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:9222".to_string(),
        }
    }
}

/// Timing knobs for the relay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Ceiling for one pseudo-stream/buffered attempt and for awaiting response headers (seconds)
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,
    /// Silence between real-stream fragments treated as end of stream (seconds)
    #[serde(default = "default_stream_stall_secs")]
    pub stream_stall_secs: u64,
    /// How long a dropped peer may take to reconnect before requests fail (milliseconds)
    #[serde(default = "default_reconnect_grace_ms")]
    pub reconnect_grace_ms: u64,
    /// Interval of `: keep-alive` comments in pseudo-stream mode (seconds)
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// How long admission waits for the peer after reactivating the identity (seconds)
    #[serde(default = "default_recovery_wait_secs")]
    pub recovery_wait_secs: u64,
    /// Timeout of one identity activation call (seconds)
    #[serde(default = "default_activation_secs")]
    pub activation_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            idle_secs: default_idle_secs(),
            stream_stall_secs: default_stream_stall_secs(),
            reconnect_grace_ms: default_reconnect_grace_ms(),
            keepalive_secs: default_keepalive_secs(),
            recovery_wait_secs: default_recovery_wait_secs(),
            activation_secs: default_activation_secs(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            allow_lan_access: false,
            port: default_port(),
            ws_port: default_ws_port(),
            api_keys: Vec::new(),
            streaming_mode: StreamingMode::default(),
            failure_threshold: default_failure_threshold(),
            switch_on_uses: default_switch_on_uses(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            immediate_switch_status_codes: default_immediate_switch_status_codes(),
            initial_auth_index: None,
            auth_dir: None,
            automation: AutomationConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

fn default_port() -> u16 {
    7860
}

fn default_ws_port() -> u16 {
    9998
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_switch_on_uses() -> u32 {
    40
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_immediate_switch_status_codes() -> Vec<u16> {
    vec![429, 503]
}

fn default_idle_secs() -> u64 {
    300
}

fn default_stream_stall_secs() -> u64 {
    30
}

fn default_reconnect_grace_ms() -> u64 {
    5000
}

fn default_keepalive_secs() -> u64 {
    3
}

fn default_recovery_wait_secs() -> u64 {
    15
}

fn default_activation_secs() -> u64 {
    120
}

impl RelayConfig {
    /// Actual listen address
    /// - allow_lan_access = false: "127.0.0.1"
    /// - allow_lan_access = true: "0.0.0.0"
    pub fn get_bind_address(&self) -> &str {
        if self.allow_lan_access {
            "0.0.0.0"
        } else {
            "127.0.0.1"
        }
    }
}
