//! Core proxy logic: account pool, protocol translation, per-provider
//! dispatch, and the Anthropic-compatible HTTP server.

pub mod config;
pub mod mappers;
pub mod pool;
pub mod providers;
pub mod server;
pub mod signature_cache;
pub mod store;
pub mod upstream;

pub use config::ProxyConfig;
pub use pool::AccountPool;
pub use signature_cache::SignatureCache;
