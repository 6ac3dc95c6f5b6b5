//! Solana RPC Boundary
//!
//! The `ChainRpc` trait is the only place the client touches a Solana node.
//! Everything above it is pure decision logic, which keeps the interesting
//! code unit-testable with a mocked RPC.

use async_trait::async_trait;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_client::GetConfirmedSignaturesForAddress2Config;
use solana_client::rpc_config::{RpcBlockConfig, RpcTransactionConfig};
use solana_sdk::account::Account;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::Transaction;
use solana_transaction_status::{TransactionDetails, UiTransactionEncoding};
use std::str::FromStr;
use thiserror::Error;

/// RPC boundary errors
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc transport error: {0}")]
    Transport(String),

    #[error("malformed rpc response: {0}")]
    MalformedResponse(String),

    #[error("block {0} not available")]
    BlockNotAvailable(u64),

    #[error("transaction simulation failed: {0}")]
    SimulationFailed(String),

    #[error("transaction signing failed: {0}")]
    Signing(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl RpcError {
    /// Transport-level failures are retryable; the rest are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcError::Transport(_) | RpcError::BlockNotAvailable(_))
    }
}

impl From<solana_client::client_error::ClientError> for RpcError {
    fn from(e: solana_client::client_error::ClientError) -> Self {
        RpcError::Transport(e.to_string())
    }
}

/// Commitment level for reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commitment {
    Processed,
    Confirmed,
    Finalized,
}

impl Commitment {
    pub fn to_config(self) -> CommitmentConfig {
        match self {
            Commitment::Processed => CommitmentConfig::processed(),
            Commitment::Confirmed => CommitmentConfig::confirmed(),
            Commitment::Finalized => CommitmentConfig::finalized(),
        }
    }
}

/// A slot together with the blockhash and timestamp of its block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub slot: u64,
    pub blockhash: Hash,
    pub block_time: i64,
}

/// Outcome probe for a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxStatus {
    pub slot: u64,
    /// Present when the transaction executed and failed
    pub err: Option<String>,
}

/// One entry from a signatures-for-address page (newest first)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureInfo {
    pub signature: Signature,
    pub slot: u64,
    pub err: bool,
    pub block_time: Option<i64>,
}

/// Async RPC interface consumed by the relay client and escrow protocol
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Fetch an account, `None` when it does not exist
    async fn fetch_account(
        &self,
        address: &Pubkey,
        commitment: Commitment,
    ) -> Result<Option<Account>, RpcError>;

    /// Current slot at the given commitment
    async fn current_slot(&self, commitment: Commitment) -> Result<u64, RpcError>;

    /// Blockhash and timestamp of the block at `slot`
    async fn block_ref(&self, slot: u64) -> Result<BlockRef, RpcError>;

    /// Latest blockhash for transaction assembly
    async fn latest_blockhash(&self) -> Result<Hash, RpcError>;

    /// Whether a blockhash is still accepted by the cluster
    async fn is_blockhash_valid(&self, blockhash: &Hash) -> Result<bool, RpcError>;

    /// Broadcast a signed transaction
    async fn send_transaction(&self, transaction: &Transaction) -> Result<Signature, RpcError>;

    /// Execution status of a transaction, `None` when unknown to the cluster
    async fn transaction_status(&self, signature: &Signature)
        -> Result<Option<TxStatus>, RpcError>;

    /// Simulate a transaction, failing on execution errors
    async fn simulate_transaction(&self, transaction: &Transaction) -> Result<(), RpcError>;

    /// Rent-exempt minimum balance for an account of `data_len` bytes
    async fn minimum_rent(&self, data_len: usize) -> Result<u64, RpcError>;

    /// One page of transaction signatures for an address, newest first
    async fn signatures_for_address(
        &self,
        address: &Pubkey,
        before: Option<Signature>,
        limit: usize,
    ) -> Result<Vec<SignatureInfo>, RpcError>;

    /// Log messages of a confirmed transaction
    async fn transaction_logs(&self, signature: &Signature) -> Result<Vec<String>, RpcError>;
}

/// Production `ChainRpc` over the nonblocking Solana RPC client
pub struct SolanaRpc {
    client: RpcClient,
    commitment: CommitmentConfig,
}

impl SolanaRpc {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_commitment(url, Commitment::Confirmed)
    }

    pub fn with_commitment(url: impl Into<String>, commitment: Commitment) -> Self {
        let commitment = commitment.to_config();
        Self {
            client: RpcClient::new_with_commitment(url.into(), commitment),
            commitment,
        }
    }
}

#[async_trait]
impl ChainRpc for SolanaRpc {
    async fn fetch_account(
        &self,
        address: &Pubkey,
        commitment: Commitment,
    ) -> Result<Option<Account>, RpcError> {
        let response = self
            .client
            .get_account_with_commitment(address, commitment.to_config())
            .await?;
        Ok(response.value)
    }

    async fn current_slot(&self, commitment: Commitment) -> Result<u64, RpcError> {
        Ok(self
            .client
            .get_slot_with_commitment(commitment.to_config())
            .await?)
    }

    async fn block_ref(&self, slot: u64) -> Result<BlockRef, RpcError> {
        let config = RpcBlockConfig {
            encoding: None,
            transaction_details: Some(TransactionDetails::None),
            rewards: Some(false),
            commitment: Some(self.commitment),
            max_supported_transaction_version: Some(0),
        };
        let block = self
            .client
            .get_block_with_config(slot, config)
            .await
            .map_err(|_| RpcError::BlockNotAvailable(slot))?;

        let blockhash = Hash::from_str(&block.blockhash)
            .map_err(|e| RpcError::MalformedResponse(format!("blockhash: {}", e)))?;

        Ok(BlockRef {
            slot,
            blockhash,
            block_time: block.block_time.unwrap_or(0),
        })
    }

    async fn latest_blockhash(&self) -> Result<Hash, RpcError> {
        Ok(self.client.get_latest_blockhash().await?)
    }

    async fn is_blockhash_valid(&self, blockhash: &Hash) -> Result<bool, RpcError> {
        Ok(self
            .client
            .is_blockhash_valid(blockhash, self.commitment)
            .await?)
    }

    async fn send_transaction(&self, transaction: &Transaction) -> Result<Signature, RpcError> {
        Ok(self.client.send_transaction(transaction).await?)
    }

    async fn transaction_status(
        &self,
        signature: &Signature,
    ) -> Result<Option<TxStatus>, RpcError> {
        let response = self.client.get_signature_statuses(&[*signature]).await?;
        let status = response
            .value
            .into_iter()
            .next()
            .ok_or_else(|| RpcError::MalformedResponse("empty status list".to_string()))?;

        Ok(status.map(|s| TxStatus {
            slot: s.slot,
            err: s.err.map(|e| e.to_string()),
        }))
    }

    async fn simulate_transaction(&self, transaction: &Transaction) -> Result<(), RpcError> {
        let response = self.client.simulate_transaction(transaction).await?;
        if let Some(err) = response.value.err {
            let logs = response.value.logs.unwrap_or_default().join("\n");
            return Err(RpcError::SimulationFailed(format!("{}: {}", err, logs)));
        }
        Ok(())
    }

    async fn minimum_rent(&self, data_len: usize) -> Result<u64, RpcError> {
        Ok(self
            .client
            .get_minimum_balance_for_rent_exemption(data_len)
            .await?)
    }

    async fn signatures_for_address(
        &self,
        address: &Pubkey,
        before: Option<Signature>,
        limit: usize,
    ) -> Result<Vec<SignatureInfo>, RpcError> {
        let config = GetConfirmedSignaturesForAddress2Config {
            before,
            until: None,
            limit: Some(limit),
            commitment: Some(self.commitment),
        };
        let entries = self
            .client
            .get_signatures_for_address_with_config(address, config)
            .await?;

        let mut infos = Vec::with_capacity(entries.len());
        for entry in entries {
            let signature = Signature::from_str(&entry.signature)
                .map_err(|e| RpcError::MalformedResponse(format!("signature: {}", e)))?;
            infos.push(SignatureInfo {
                signature,
                slot: entry.slot,
                err: entry.err.is_some(),
                block_time: entry.block_time,
            });
        }
        Ok(infos)
    }

    async fn transaction_logs(&self, signature: &Signature) -> Result<Vec<String>, RpcError> {
        let config = RpcTransactionConfig {
            encoding: Some(UiTransactionEncoding::Base64),
            commitment: Some(self.commitment),
            max_supported_transaction_version: Some(0),
        };
        let tx = self
            .client
            .get_transaction_with_config(signature, config)
            .await?;

        let logs: Option<Vec<String>> = match tx.transaction.meta {
            Some(meta) => meta.log_messages.into(),
            None => None,
        };
        Ok(logs.unwrap_or_default())
    }
}
