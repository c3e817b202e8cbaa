// Mappers module - response framing

pub mod sse;
