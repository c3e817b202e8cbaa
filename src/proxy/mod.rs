// proxy module - relay service

pub mod channel_registry;
pub mod config;
pub mod error;
pub mod message_queue;
pub mod orchestrator;
pub mod protocol;
pub mod rotation;
pub mod security;
pub mod server;

pub mod handlers; // API endpoint handlers
pub mod mappers; // SSE framing
pub mod middleware; // Axum middleware
pub mod upstream; // Browser automation client

pub use channel_registry::ChannelRegistry;
pub use config::RelayConfig;
pub use orchestrator::{OrchestratorSettings, RequestOrchestrator};
pub use rotation::{RotationController, RotationPolicy};
pub use security::ProxySecurityConfig;
pub use server::{AppState, AxumServer};
