use std::fs;
use std::path::{Path, PathBuf};

use super::account::get_data_dir;
use crate::proxy::config::{RelayConfig, StreamingMode};

const CONFIG_FILE: &str = "web_config.json";

pub fn config_path() -> Result<PathBuf, String> {
    Ok(get_data_dir()?.join(CONFIG_FILE))
}

/// Load relay configuration, creating the file with defaults when missing
pub fn load_relay_config_from(config_path: &Path) -> Result<RelayConfig, String> {
    if !config_path.exists() {
        let config = RelayConfig::default();
        if let Err(e) = save_relay_config_to(config_path, &config) {
            tracing::warn!("Could not write default config to {:?}: {}", config_path, e);
        }
        return Ok(config);
    }

    let content = fs::read_to_string(config_path)
        .map_err(|e| format!("Failed to read config file: {}", e))?;

    serde_json::from_str(&content).map_err(|e| format!("Failed to parse config file: {}", e))
}

/// Save relay configuration
pub fn save_relay_config_to(config_path: &Path, config: &RelayConfig) -> Result<(), String> {
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;

    fs::write(config_path, content).map_err(|e| format!("Failed to save config: {}", e))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_list<T: std::str::FromStr>(value: &str) -> Vec<T> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}

fn parse_or_warn<T: std::str::FromStr>(name: &str, value: &str) -> Option<T> {
    let parsed = value.trim().parse().ok();
    if parsed.is_none() {
        tracing::warn!("Ignoring invalid value for {}: {:?}", name, value);
    }
    parsed
}

/// Applies environment overrides on top of the file configuration.
///
/// `lookup` is `std::env::var` in production.
pub fn apply_env_overrides<F>(config: &mut RelayConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("RELAY_PORT").and_then(|v| parse_or_warn("RELAY_PORT", &v)) {
        config.port = v;
    }
    if let Some(v) = lookup("RELAY_WS_PORT").and_then(|v| parse_or_warn("RELAY_WS_PORT", &v)) {
        config.ws_port = v;
    }
    if let Some(v) = lookup("RELAY_ALLOW_LAN").and_then(|v| parse_bool(&v)) {
        config.allow_lan_access = v;
    }
    if let Some(v) = lookup("RELAY_BIND") {
        config.allow_lan_access = v.trim() == "0.0.0.0";
    }
    if let Some(v) = lookup("API_KEYS") {
        config.api_keys = parse_list(&v);
    }
    if let Some(v) = lookup("STREAMING_MODE") {
        match StreamingMode::parse(&v) {
            Some(mode) => config.streaming_mode = mode,
            None => tracing::warn!("Ignoring invalid STREAMING_MODE: {:?}", v),
        }
    }
    if let Some(v) = lookup("FAILURE_THRESHOLD").and_then(|v| parse_or_warn("FAILURE_THRESHOLD", &v)) {
        config.failure_threshold = v;
    }
    if let Some(v) = lookup("SWITCH_ON_USES").and_then(|v| parse_or_warn("SWITCH_ON_USES", &v)) {
        config.switch_on_uses = v;
    }
    if let Some(v) = lookup("MAX_RETRIES").and_then(|v| parse_or_warn("MAX_RETRIES", &v)) {
        config.max_retries = v;
    }
    if let Some(v) = lookup("RETRY_DELAY").and_then(|v| parse_or_warn("RETRY_DELAY", &v)) {
        config.retry_delay_ms = v;
    }
    if let Some(v) = lookup("IMMEDIATE_SWITCH_STATUS_CODES") {
        config.immediate_switch_status_codes = parse_list(&v);
    }
    if let Some(v) =
        lookup("INITIAL_AUTH_INDEX").and_then(|v| parse_or_warn("INITIAL_AUTH_INDEX", &v))
    {
        config.initial_auth_index = Some(v);
    }
    if let Some(v) = lookup("AUTH_DIR").filter(|v| !v.trim().is_empty()) {
        config.auth_dir = Some(PathBuf::from(v));
    }
    if let Some(v) = lookup("AUTOMATION_URL").filter(|v| !v.trim().is_empty()) {
        config.automation.url = v;
    }
}
