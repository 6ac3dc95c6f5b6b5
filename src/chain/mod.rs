//! Solana Chain Collaborators
//!
//! Everything that talks to (or models) the Solana side of the bridge:
//! the RPC boundary, transaction preparation and submission, program event
//! scanning, and fee estimation.

pub mod events;
pub mod fees;
pub mod rpc;
pub mod tx;

pub use events::{EventScanner, RawEvent};
pub use fees::{FeeEstimator, FeeRate, StaticFeeEstimator};
pub use rpc::{BlockRef, ChainRpc, Commitment, RpcError, SignatureInfo, SolanaRpc, TxStatus};
pub use tx::{classify_outcome, send_chained, PreparedTransaction, SentTransaction, TxOutcome};
