#![forbid(unsafe_code)]

pub mod agent;
pub mod config;
pub mod errors;
pub mod events;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod server;
pub mod transport;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
