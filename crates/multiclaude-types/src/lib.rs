//! Shared types for multiclaude: account data model, wire protocol
//! structures, and error definitions.

pub mod error;
pub mod models;
pub mod protocol;

pub use error::{AccountError, ConfigError, ProxyError};
pub use models::{
    Account, AccountSource, ConfigDocument, LimitState, Provider, Settings, MAX_ACCOUNTS,
};
