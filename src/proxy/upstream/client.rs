// Automation driver client
// Thin HTTP wrapper around the browser driver's control API

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde_json::{json, Value};
use tokio::time::Duration;

use super::IdentityActivator;

const ACTIVATE_PATH: &str = "activate";

pub struct AutomationClient {
    http_client: Client,
    base_url: String,
}

impl AutomationClient {
    pub fn new(base_url: &str, activation_timeout: Duration) -> Result<Self, String> {
        let http_client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(2)
            .timeout(activation_timeout)
            .no_proxy()
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Build control API URL
    fn build_url(base_url: &str, path: &str) -> String {
        format!("{}/{}", base_url, path)
    }

    fn describe_failure(status: StatusCode, body: &str) -> String {
        let body = body.trim();
        if body.is_empty() {
            format!("automation driver returned {}", status)
        } else {
            format!("automation driver returned {}: {}", status, body)
        }
    }
}

#[async_trait]
impl IdentityActivator for AutomationClient {
    async fn activate(&self, index: u32, content: Value) -> Result<(), String> {
        let url = Self::build_url(&self.base_url, ACTIVATE_PATH);
        tracing::info!("Requesting identity activation #{} via {}", index, url);

        let response = self
            .http_client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&json!({
                "index": index,
                "storage_state": content,
            }))
            .send()
            .await
            .map_err(|e| format!("HTTP request failed at {}: {}", url, e))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!("✓ Identity #{} activated | Status: {}", index, status);
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(Self::describe_failure(status, &body))
    }
}
