//! Common Error Types for the Bridge Client
//!
//! Provides unified error handling across all modules.

use thiserror::Error;

/// Root error type for the bridge client
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Logging errors
    #[error("logging error: {0}")]
    Logging(#[from] crate::logging::LoggingError),

    /// Solana RPC errors
    #[error("rpc error: {0}")]
    Rpc(#[from] crate::chain::rpc::RpcError),

    /// Bitcoin RPC errors
    #[error("bitcoin rpc error: {0}")]
    Bitcoin(#[from] crate::bitcoin::BtcRpcError),

    /// Fee estimation errors
    #[error("fee error: {0}")]
    Fee(#[from] crate::chain::fees::FeeError),

    /// Header chain errors
    #[error("header error: {0}")]
    Header(#[from] crate::relay::header::HeaderError),

    /// Relay client errors
    #[error("relay error: {0}")]
    Relay(#[from] crate::relay::client::RelayError),

    /// Relay synchronizer errors
    #[error("sync error: {0}")]
    Sync(#[from] crate::relay::sync::SyncError),

    /// Authorization errors
    #[error("authorization error: {0}")]
    Authorization(#[from] crate::escrow::authorization::AuthorizationError),

    /// Escrow protocol errors
    #[error("protocol error: {0}")]
    Protocol(#[from] crate::escrow::protocol::ProtocolError),

    /// Storage errors
    #[error("storage error: {0}")]
    Storage(#[from] crate::store::traits::StorageError),

    /// Validation errors
    #[error("validation error: {0}")]
    Validation(String),

    /// Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a retryable error
    ///
    /// Transport-level failures are worth retrying; validation and
    /// authorization failures never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::Rpc(e) => e.is_retryable(),
            BridgeError::Bitcoin(_) | BridgeError::Storage(_) | BridgeError::Io(_) => true,
            BridgeError::Relay(e) => e.is_retryable(),
            BridgeError::Sync(e) => e.is_retryable(),
            BridgeError::Protocol(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Result type alias using BridgeError
pub type Result<T> = std::result::Result<T, BridgeError>;
