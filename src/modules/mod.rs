pub mod account;
pub mod config;
pub mod logger;

pub use account::*;
