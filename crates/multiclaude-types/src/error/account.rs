//! Account management errors.

use thiserror::Error;

/// Errors from account CRUD and persistence.
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("Account not found: {email}")]
    NotFound { email: String },

    #[error("Account already exists: {email}")]
    Duplicate { email: String },

    #[error("Maximum account count reached ({limit})")]
    MaxAccounts { limit: usize },

    #[error("Failed to write account store: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize account store: {0}")]
    Serialize(#[from] serde_json::Error),
}
