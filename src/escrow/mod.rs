//! Swap Escrow Module
//!
//! Client side of the on-chain swap escrow:
//! - Swap value model with the dual timestamp/blockheight expiry rule
//! - Program wire formats (accounts, instructions, events)
//! - Counterparty authorization signing and verification
//! - The init/claim/refund protocol driver

pub mod authorization;
pub mod program;
pub mod protocol;
pub mod swap;

// Re-exports for convenience
pub use authorization::{
    AuthPrefetch, AuthorizationCodec, AuthorizationError, InitAuthorization, RefundAuthorization,
    AUTH_GRACE_PERIOD, TX_SLOT_VALIDITY,
};
pub use program::{EscrowEvent, EscrowProgram, DATA_CHUNK_SIZE, WSOL_MINT};
pub use protocol::{DataSweep, EscrowProtocol, ProtocolError, SwapParams, TxClaimEvidence};
pub use swap::{
    derive_nonce, CommitStatus, ExpiryKind, Party, SwapEscrow, SwapKind,
    BLOCKHEIGHT_EXPIRY_THRESHOLD, CLAIM_GRACE_PERIOD, REFUND_GRACE_PERIOD,
};

/// Current UNIX time in seconds
pub(crate) fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
