// Handlers module - API endpoint handlers

pub mod bridge;
pub mod manage;
pub mod relay;
