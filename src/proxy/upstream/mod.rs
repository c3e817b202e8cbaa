// Upstream module - browser automation collaborator

pub mod client;

use async_trait::async_trait;

/// Switches the browser session to another identity.
///
/// After a successful activation the automation peer is expected to (re)open
/// the bridging channel on its own.
#[async_trait]
pub trait IdentityActivator: Send + Sync {
    async fn activate(&self, index: u32, content: serde_json::Value) -> Result<(), String>;
}

pub use client::AutomationClient;
