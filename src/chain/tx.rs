//! Transaction Preparation and Submission
//!
//! Builders all over the crate return `PreparedTransaction`s instead of
//! sending anything themselves. A prepared transaction can carry a pinned
//! blockhash (authorization-signed transactions must be reproduced byte for
//! byte) and extra signers beyond the fee payer.

use solana_sdk::hash::Hash;
use solana_sdk::instruction::Instruction;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature, Signer};
use solana_sdk::transaction::Transaction;
use std::sync::Arc;
use std::time::Duration;

use super::rpc::{ChainRpc, RpcError, TxStatus};

/// Final outcome of a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    /// Executed successfully
    Success,
    /// Executed and failed; the state machine very likely rejected it
    Reverted(String),
    /// Not yet landed but its blockhash is still valid
    Pending,
    /// Never landed and its blockhash has lapsed; safe to rebuild and retry
    Expired,
}

/// A built, unsigned (or partially signed) transaction ready for submission
#[derive(Debug)]
pub struct PreparedTransaction {
    pub transaction: Transaction,
    /// Set when counterparty signatures bind the transaction to one blockhash
    pub pinned_blockhash: Option<Hash>,
    /// Signers required beyond the fee payer
    pub extra_signers: Vec<Arc<Keypair>>,
    /// Short name used in logs
    pub label: &'static str,
}

impl PreparedTransaction {
    pub fn new(instructions: Vec<Instruction>, payer: &Pubkey, label: &'static str) -> Self {
        Self {
            transaction: Transaction::new_with_payer(&instructions, Some(payer)),
            pinned_blockhash: None,
            extra_signers: Vec::new(),
            label,
        }
    }

    /// Wrap a transaction that was assembled elsewhere (e.g. rebuilt from an
    /// init authorization, with the counterparty signature already placed)
    pub fn from_transaction(transaction: Transaction, label: &'static str) -> Self {
        let pinned = if transaction.message.recent_blockhash == Hash::default() {
            None
        } else {
            Some(transaction.message.recent_blockhash)
        };
        Self {
            transaction,
            pinned_blockhash: pinned,
            extra_signers: Vec::new(),
            label,
        }
    }

    pub fn with_signer(mut self, signer: Arc<Keypair>) -> Self {
        self.extra_signers.push(signer);
        self
    }

    /// Sign with the payer (and any extra signers) and broadcast.
    ///
    /// Unpinned transactions pick up a fresh blockhash here. Pinned ones are
    /// partially signed against the pinned hash so embedded counterparty
    /// signatures survive.
    pub async fn sign_and_send(
        self,
        rpc: &dyn ChainRpc,
        payer: &Keypair,
    ) -> Result<SentTransaction, RpcError> {
        let mut tx = self.transaction;
        let blockhash = match self.pinned_blockhash {
            Some(hash) => hash,
            None => rpc.latest_blockhash().await?,
        };

        let mut signers: Vec<&dyn Signer> = vec![payer];
        for extra in &self.extra_signers {
            signers.push(extra.as_ref());
        }
        tx.try_partial_sign(&signers, blockhash)
            .map_err(|e| RpcError::Signing(e.to_string()))?;

        let signature = rpc.send_transaction(&tx).await?;
        tracing::debug!(target: "bridge::tx", label = self.label, %signature, "sent");

        Ok(SentTransaction {
            signature,
            blockhash,
            label: self.label,
        })
    }
}

/// Handle for confirming a broadcast transaction
#[derive(Debug, Clone)]
pub struct SentTransaction {
    pub signature: Signature,
    pub blockhash: Hash,
    pub label: &'static str,
}

impl SentTransaction {
    /// Single status probe, disambiguating reverted from still-in-flight.
    pub async fn probe(&self, rpc: &dyn ChainRpc) -> Result<TxOutcome, RpcError> {
        let status = rpc.transaction_status(&self.signature).await?;
        match status {
            Some(_) => Ok(classify_outcome(status.as_ref(), true)),
            None => {
                let valid = rpc.is_blockhash_valid(&self.blockhash).await?;
                Ok(classify_outcome(None, valid))
            }
        }
    }

    /// Poll until the transaction settles, reverts, or expires.
    pub async fn await_outcome(
        &self,
        rpc: &dyn ChainRpc,
        max_wait: Duration,
    ) -> Result<TxOutcome, RpcError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let outcome = self.probe(rpc).await?;
            if outcome != TxOutcome::Pending {
                return Ok(outcome);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(TxOutcome::Pending);
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }
}

/// Map a status probe plus blockhash validity to an outcome.
///
/// Solana has no queryable mempool: an unknown signature with a live
/// blockhash may still land, while an unknown signature with a lapsed
/// blockhash never will.
pub fn classify_outcome(status: Option<&TxStatus>, blockhash_still_valid: bool) -> TxOutcome {
    match status {
        Some(TxStatus { err: Some(e), .. }) => TxOutcome::Reverted(e.clone()),
        Some(TxStatus { err: None, .. }) => TxOutcome::Success,
        None if blockhash_still_valid => TxOutcome::Pending,
        None => TxOutcome::Expired,
    }
}

/// Send a dependent sequence of transactions, confirming each before the
/// next goes out. Relay header batches chain on-chain state and land in
/// order or not at all.
pub async fn send_chained(
    rpc: &dyn ChainRpc,
    payer: &Keypair,
    transactions: Vec<PreparedTransaction>,
    max_wait_each: Duration,
) -> Result<Vec<Signature>, RpcError> {
    let mut signatures = Vec::with_capacity(transactions.len());
    for prepared in transactions {
        let label = prepared.label;
        let sent = prepared.sign_and_send(rpc, payer).await?;
        match sent.await_outcome(rpc, max_wait_each).await? {
            TxOutcome::Success => signatures.push(sent.signature),
            TxOutcome::Reverted(reason) => {
                return Err(RpcError::SimulationFailed(format!(
                    "{} reverted: {}",
                    label, reason
                )))
            }
            TxOutcome::Pending | TxOutcome::Expired => {
                return Err(RpcError::Transport(format!(
                    "{} did not confirm in time",
                    label
                )))
            }
        }
    }
    Ok(signatures)
}
