//! WebSocket front end for the proxy: config loading, RPC framing and the Axum server.

pub mod config;
pub mod handlers;
pub mod rpc;
pub mod server;
pub mod stream;

pub use config::{load_config, ConfigError, ProxyConfig};
pub use server::{start, ServerHandle};
