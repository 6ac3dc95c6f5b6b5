//! Bitcoin-Solana Swap Bridge Client
//!
//! Off-chain client for a trust-minimized atomic swap bridge between
//! Bitcoin and Solana. Two on-chain programs carry the trust: a header
//! relay that tracks Bitcoin's chain of most work, and a swap escrow that
//! releases funds against either a revealed secret or a relay-verified
//! Bitcoin transaction.
//!
//! ## What lives here
//!
//! 1. **Relay client** - reads on-chain relay state, plans header
//!    submissions, builds transaction-verification instructions
//! 2. **Relay synchronizer** - walks Esplora for new headers and produces
//!    catch-up submission plans, including fork overtakes after reorgs
//! 3. **Escrow protocol** - swap construction, counterparty authorizations,
//!    init/claim/refund transaction building, and lifecycle status queries
//! 4. **Cleanup ledger** - tracks scratch data accounts so their rent is
//!    reclaimed even when a claim is abandoned halfway
//!
//! The `btcbridge` binary wraps the maintenance pieces (header sync and
//! account sweeping); everything else is meant to be driven by an
//! integrating application.

pub mod bitcoin;
pub mod chain;
pub mod common;
pub mod config;
pub mod escrow;
pub mod logging;
pub mod relay;
pub mod store;

// Re-exports: errors and configuration
pub use common::{BridgeError, Result};
pub use config::{BridgeConfig, ConfigError, Network};
pub use logging::{init_from_config, init_logging, LogLevel, LoggingError};

// Re-exports: Bitcoin data source
pub use bitcoin::{BitcoinRpc, BlockHeaderInfo, BtcRpcError, EsploraRpc, MerkleProofInfo};

// Re-exports: Solana chain plumbing
pub use chain::{
    send_chained, ChainRpc, Commitment, FeeEstimator, FeeRate, PreparedTransaction, RpcError,
    SolanaRpc, StaticFeeEstimator, TxOutcome,
};

// Re-exports: header relay
pub use relay::{
    ForkSweep, MainChainState, RelayClient, RelayError, RelaySynchronizer, StoredHeader,
    SyncError, SyncPlan, SyncStatus,
};

// Re-exports: swap escrow
pub use escrow::{
    AuthorizationCodec, CommitStatus, DataSweep, EscrowProgram, EscrowProtocol,
    InitAuthorization, Party, ProtocolError, RefundAuthorization, SwapEscrow, SwapKind,
    SwapParams, TxClaimEvidence,
};

// Re-exports: cleanup ledger
pub use store::{
    CleanupStore, DataAccountRecord, DataAccountStatus, MemoryCleanupStore, SqliteCleanupStore,
    StorageError,
};
