//! Bitcoin Chain Collaborators
//!
//! Read-only view of the Bitcoin chain used to source headers for the relay
//! and inclusion proofs for on-chain claims. Hashes cross this boundary in
//! internal (consensus) byte order; Esplora's display-order hex is reversed
//! at the edge.

pub mod esplora;

use async_trait::async_trait;
use bitcoin::block::Header;
use thiserror::Error;

pub use esplora::EsploraRpc;

/// Bitcoin RPC errors
#[derive(Debug, Error)]
pub enum BtcRpcError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// A Bitcoin header together with its chain position
#[derive(Debug, Clone)]
pub struct BlockHeaderInfo {
    pub height: u64,
    /// Display-order hex of the block hash
    pub hash: String,
    pub header: Header,
}

/// Merkle inclusion proof for one transaction, in internal byte order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProofInfo {
    /// Txid in internal byte order (reversed display hex)
    pub reversed_txid: [u8; 32],
    /// Sibling hashes bottom-up, internal byte order
    pub siblings: Vec<[u8; 32]>,
    pub block_height: u32,
    /// Index of the transaction within its block
    pub position: u32,
}

/// Async interface to a Bitcoin chain source
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BitcoinRpc: Send + Sync {
    /// Height of the current chain tip
    async fn tip_height(&self) -> Result<u64, BtcRpcError>;

    /// Display-order hash of the main-chain block at `height`
    async fn block_hash_at(&self, height: u64) -> Result<String, BtcRpcError>;

    /// Header of the block with the given display-order hash
    async fn block_header(&self, block_hash: &str) -> Result<Header, BtcRpcError>;

    /// Consecutive main-chain headers starting at `start_height`
    async fn headers_from(
        &self,
        start_height: u64,
        count: usize,
    ) -> Result<Vec<BlockHeaderInfo>, BtcRpcError>;

    /// Merkle inclusion proof for a confirmed transaction
    async fn merkle_proof(&self, txid: &str) -> Result<MerkleProofInfo, BtcRpcError>;

    /// Whether the block is still part of the best chain at that height
    async fn is_in_main_chain(&self, block_hash: &str, height: u64) -> Result<bool, BtcRpcError>;

    /// Raw bytes of a transaction
    async fn raw_transaction(&self, txid: &str) -> Result<Vec<u8>, BtcRpcError>;

    /// Confirmation height of a transaction, `None` while unconfirmed
    async fn transaction_height(&self, txid: &str) -> Result<Option<u64>, BtcRpcError>;
}

/// Decode display-order hex into internal byte order
pub fn display_hex_to_internal(hash_hex: &str) -> Result<[u8; 32], BtcRpcError> {
    let bytes = hex::decode(hash_hex)
        .map_err(|e| BtcRpcError::Malformed(format!("hash hex: {}", e)))?;
    let mut out: [u8; 32] = bytes
        .try_into()
        .map_err(|_| BtcRpcError::Malformed(format!("hash length: {}", hash_hex)))?;
    out.reverse();
    Ok(out)
}

/// Encode an internal-order hash as the display hex Esplora expects
pub fn internal_to_display_hex(hash: &[u8; 32]) -> String {
    let mut bytes = *hash;
    bytes.reverse();
    hex::encode(bytes)
}
