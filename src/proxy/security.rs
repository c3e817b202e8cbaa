use crate::proxy::config::RelayConfig;

/// API-key settings enforced by the auth middleware.
#[derive(Debug, Clone, Default)]
pub struct ProxySecurityConfig {
    pub api_keys: Vec<String>,
}

impl ProxySecurityConfig {
    pub fn from_relay_config(config: &RelayConfig) -> Self {
        Self {
            api_keys: config
                .api_keys
                .iter()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    /// No keys configured means the relay is open.
    pub fn auth_enabled(&self) -> bool {
        !self.api_keys.is_empty()
    }

    pub fn accepts(&self, key: &str) -> bool {
        !self.auth_enabled() || self.api_keys.iter().any(|k| k == key)
    }
}
