//! Shared error type for Bailiff

use thiserror::Error;

/// Errors surfaced by the ledger, recovery and integration layers
#[derive(Debug, Error)]
pub enum BailiffError {
    /// Storage unavailable or rejected the operation
    #[error("Database error: {0}")]
    Database(String),

    /// Chat platform bridge failure
    #[error("Chat platform error: {0}")]
    Chat(String),

    /// External game statistics API failure
    #[error("Game API error: {0}")]
    GameApi(String),

    /// A batch operation of this type is already in progress for the community
    #[error("Operation {operation} already in progress for community {community_id}")]
    OperationActive {
        community_id: String,
        operation: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BailiffError>;
