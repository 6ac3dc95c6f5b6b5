//! Escrow Protocol Driver
//!
//! Drives a `SwapEscrow` through its lifecycle: status queries against the
//! on-chain account, init with a counterparty authorization, the two claim
//! paths (secret reveal and relay-verified Bitcoin transaction), refunds, and
//! the scratch data-account cleanup ledger.
//!
//! The on-chain account is never trusted as-is: a stored escrow only counts
//! as committed when it compares equal to the locally constructed value, so a
//! counterparty cannot substitute different terms under the same payment hash.

use std::str::FromStr;
use std::sync::Arc;

use bitcoin::block::Header;
use sha2::{Digest, Sha256};
use solana_sdk::instruction::Instruction;
use solana_sdk::pubkey::Pubkey;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bitcoin::MerkleProofInfo;
use crate::chain::events::EventScanner;
use crate::chain::fees::FeeRate;
use crate::chain::rpc::{ChainRpc, Commitment, RpcError};
use crate::chain::tx::PreparedTransaction;
use crate::relay::client::{RelayClient, RelayError};
use crate::relay::sync::{RelaySynchronizer, SyncError};
use crate::store::traits::{CleanupStore, DataAccountRecord, StorageError};

use super::authorization::{
    AuthorizationCodec, AuthorizationError, InitAuthorization, RefundAuthorization,
};
use super::program::{
    create_ata_idempotent, decode_escrow_account, ed25519_verify_instruction, get_ata, ClaimEvent,
    EscrowEvent, EscrowProgram, DATA_CHUNK_SIZE,
};
use super::swap::{derive_nonce, CommitStatus, ExpiryKind, Party, SwapEscrow, SwapKind};
use super::unix_now;

/// Close instructions batched per sweep transaction
pub const DATA_CLOSES_PER_TX: usize = 10;

/// Page budget when searching history for a claim event
const CLAIM_EVENT_MAX_PAGES: usize = 50;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("rpc: {0}")]
    Rpc(#[from] RpcError),

    #[error("relay: {0}")]
    Relay(#[from] RelayError),

    #[error("sync: {0}")]
    Sync(#[from] SyncError),

    #[error("authorization: {0}")]
    Authorization(#[from] AuthorizationError),

    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    #[error("malformed escrow account: {0}")]
    MalformedAccount(String),

    #[error("address derivation failed: {0}")]
    Derivation(String),

    #[error("operation requires a {expected} swap")]
    WrongKind { expected: &'static str },

    #[error("secret does not hash to the payment hash")]
    SecretMismatch,

    #[error("escrow already live for this payment hash ({0:?})")]
    AlreadyCommitted(CommitStatus),

    #[error("swap already expired for the claimer")]
    AlreadyExpired,

    #[error("swap not yet refundable")]
    NotExpired,

    #[error("associated token account {0} does not exist")]
    AtaNotInitialized(Pubkey),

    #[error("relay has not reached height {required_height}")]
    NotSynchronized { required_height: u32 },
}

impl ProtocolError {
    /// Transport-level failures are retryable; protocol rejections (wrong
    /// secret, live escrow, expired swap) never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProtocolError::Rpc(e) => e.is_retryable(),
            ProtocolError::Relay(e) => e.is_retryable(),
            ProtocolError::Sync(e) => e.is_retryable(),
            ProtocolError::Authorization(e) => e.is_retryable(),
            ProtocolError::Storage(_) => true,
            _ => false,
        }
    }
}

/// Inputs for constructing a new swap agreement
#[derive(Debug, Clone)]
pub struct SwapParams {
    pub kind: SwapKind,
    pub offerer: Pubkey,
    pub claimer: Pubkey,
    /// Token mint
    pub token: Pubkey,
    pub amount: u64,
    pub payment_hash: [u8; 32],
    /// Blockheight or UNIX seconds, per the expiry threshold rule
    pub expiry: u64,
    pub confirmations: u16,
    pub pay_in: bool,
    pub pay_out: bool,
    pub security_deposit: u64,
    pub claimer_bounty: u64,
    /// Output commitment for on-chain payment kinds
    pub txo_hash: Option<[u8; 32]>,
}

/// Bitcoin-side evidence for a tx-data claim
#[derive(Debug, Clone)]
pub struct TxClaimEvidence<'a> {
    /// Consensus-serialized transaction, staged on chain for the program
    pub raw_tx: &'a [u8],
    /// Header of the block that mined the transaction
    pub header: Header,
    pub proof: &'a MerkleProofInfo,
}

/// Outcome of a data-account sweep pass
pub struct DataSweep {
    pub txs: Vec<PreparedTransaction>,
    /// Addresses the transactions close; mark swept once they confirm
    pub closing: Vec<String>,
    /// Records settled immediately because the chain no longer has them
    pub reconciled: u64,
}

pub struct EscrowProtocol {
    rpc: Arc<dyn ChainRpc>,
    program: EscrowProgram,
    codec: AuthorizationCodec,
    relay: Arc<RelayClient>,
    store: Arc<dyn CleanupStore>,
    commitment: Commitment,
}

impl EscrowProtocol {
    pub fn new(
        rpc: Arc<dyn ChainRpc>,
        program_id: Pubkey,
        relay: Arc<RelayClient>,
        store: Arc<dyn CleanupStore>,
    ) -> Self {
        let program = EscrowProgram::new(program_id);
        let codec = AuthorizationCodec::new(Arc::clone(&rpc), program.clone());
        Self {
            rpc,
            program,
            codec,
            relay,
            store,
            commitment: Commitment::Confirmed,
        }
    }

    pub fn with_commitment(mut self, commitment: Commitment) -> Self {
        self.commitment = commitment;
        self
    }

    pub fn program(&self) -> &EscrowProgram {
        &self.program
    }

    /// Authorization signing and verification for this program
    pub fn codec(&self) -> &AuthorizationCodec {
        &self.codec
    }

    // ------------------------------------------------------------------
    // Swap construction
    // ------------------------------------------------------------------

    /// Build the swap agreement both parties will derive addresses from.
    ///
    /// `ChainNonced` swaps get a fresh replay nonce; every swap gets a random
    /// sequence so re-attempts of the same payment stay distinguishable.
    pub fn create_swap_data(&self, params: SwapParams) -> SwapEscrow {
        let nonce = match params.kind {
            SwapKind::ChainNonced => derive_nonce(unix_now()),
            _ => 0,
        };
        SwapEscrow {
            kind: params.kind,
            confirmations: params.confirmations,
            nonce,
            payment_hash: params.payment_hash,
            sequence: rand::random(),
            pay_in: params.pay_in,
            pay_out: params.pay_out,
            offerer: params.offerer,
            offerer_ata: get_ata(&params.offerer, &params.token),
            claimer: params.claimer,
            claimer_ata: get_ata(&params.claimer, &params.token),
            token: params.token,
            amount: params.amount,
            expiry: params.expiry,
            security_deposit: params.security_deposit,
            claimer_bounty: params.claimer_bounty,
            txo_hash: params.txo_hash.unwrap_or([0; 32]),
        }
    }

    // ------------------------------------------------------------------
    // Status queries
    // ------------------------------------------------------------------

    /// The escrow account's stored swap, `None` when no account exists
    pub async fn get_committed_data(
        &self,
        payment_hash: &[u8; 32],
    ) -> Result<Option<SwapEscrow>, ProtocolError> {
        let address = self.program.escrow_address(payment_hash);
        match self.rpc.fetch_account(&address, self.commitment).await? {
            Some(account) => {
                let swap = decode_escrow_account(&account.data)
                    .map_err(|e| ProtocolError::MalformedAccount(e.to_string()))?;
                Ok(Some(swap))
            }
            None => Ok(None),
        }
    }

    /// Lifecycle status of `swap` from one party's perspective.
    ///
    /// A stored account only counts when it equals the local swap exactly.
    /// Once the account is gone, claim events distinguish `Paid` from
    /// never-committed (a refund also closes the account, but emits no claim).
    pub async fn get_commit_status(
        &self,
        party: Party,
        swap: &SwapEscrow,
    ) -> Result<CommitStatus, ProtocolError> {
        match self.get_committed_data(&swap.payment_hash).await? {
            Some(stored) if stored == *swap => {
                let now = unix_now();
                let relay_height = self.relay_height_for(swap).await?;
                let status = match party {
                    Party::Claimer if swap.expired_for_claimer(now, relay_height) => {
                        CommitStatus::Expired
                    }
                    Party::Offerer if swap.refundable_by_offerer(now, relay_height) => {
                        CommitStatus::Refundable
                    }
                    _ => CommitStatus::Committed,
                };
                debug!(
                    target: "bridge::escrow",
                    payment_hash = %hex::encode(swap.payment_hash),
                    ?party,
                    ?status,
                    "commit status"
                );
                Ok(status)
            }
            Some(_) => Ok(CommitStatus::NotCommitted),
            None => {
                if self.find_claim_event(swap.payment_hash).await?.is_some() {
                    Ok(CommitStatus::Paid)
                } else {
                    Ok(CommitStatus::NotCommitted)
                }
            }
        }
    }

    /// Coarse status keyed by payment hash alone, used to guard init
    pub async fn get_claim_hash_status(
        &self,
        payment_hash: &[u8; 32],
    ) -> Result<CommitStatus, ProtocolError> {
        let address = self.program.escrow_address(payment_hash);
        if self
            .rpc
            .fetch_account(&address, self.commitment)
            .await?
            .is_some()
        {
            return Ok(CommitStatus::Committed);
        }
        if self.find_claim_event(*payment_hash).await?.is_some() {
            return Ok(CommitStatus::Paid);
        }
        Ok(CommitStatus::NotCommitted)
    }

    /// Search program history backward for a claim of `payment_hash`
    pub async fn find_claim_event(
        &self,
        payment_hash: [u8; 32],
    ) -> Result<Option<ClaimEvent>, ProtocolError> {
        let scanner = EventScanner::new(self.rpc.as_ref(), self.program.program_id);
        let found = scanner
            .find_map(
                |raw| match EscrowEvent::parse(raw) {
                    Some(EscrowEvent::Claim(event)) if event.payment_hash == payment_hash => {
                        Some(event)
                    }
                    _ => None,
                },
                None,
                Some(CLAIM_EVENT_MAX_PAGES),
            )
            .await?;
        Ok(found)
    }

    /// Relay tip height, fetched only when the swap expires by blockheight
    async fn relay_height_for(&self, swap: &SwapEscrow) -> Result<Option<u32>, ProtocolError> {
        match swap.expiry_kind() {
            ExpiryKind::Timestamp(_) => Ok(None),
            ExpiryKind::BlockHeight(_) => {
                let state = self.relay.get_tip_data().await?;
                Ok(state.map(|s| s.block_height))
            }
        }
    }

    // ------------------------------------------------------------------
    // Init
    // ------------------------------------------------------------------

    /// Open the escrow using the counterparty's init authorization.
    ///
    /// The submitter differs by funding direction: pay-in is submitted by the
    /// offerer against a claimer-signed authorization, pay-out the reverse.
    /// Unless `skip_checks`, refuses while an escrow for this payment hash is
    /// already live or paid.
    pub async fn txs_init(
        &self,
        swap: &SwapEscrow,
        auth: &InitAuthorization,
        skip_checks: bool,
        fee_rate: &FeeRate,
    ) -> Result<Vec<PreparedTransaction>, ProtocolError> {
        if !skip_checks {
            let status = self.get_claim_hash_status(&swap.payment_hash).await?;
            if status != CommitStatus::NotCommitted {
                return Err(ProtocolError::AlreadyCommitted(status));
            }
        }

        let tx = self.codec.verify_init(swap, fee_rate, auth, None).await?;
        info!(
            target: "bridge::escrow",
            payment_hash = %hex::encode(swap.payment_hash),
            sequence = swap.sequence,
            pay_in = swap.pay_in,
            "init authorized"
        );
        Ok(vec![PreparedTransaction::from_transaction(tx, "init_swap")])
    }

    // ------------------------------------------------------------------
    // Claims
    // ------------------------------------------------------------------

    /// Claim an HTLC swap by revealing its preimage.
    ///
    /// With `check_expiry`, refuses outright once the swap is expired for the
    /// claimer: a transaction that can no longer win the race would still
    /// leak the secret to the counterparty.
    pub async fn txs_claim_with_secret(
        &self,
        swap: &SwapEscrow,
        secret: &[u8; 32],
        check_expiry: bool,
        init_ata: bool,
        fee_rate: &FeeRate,
    ) -> Result<Vec<PreparedTransaction>, ProtocolError> {
        if swap.kind != SwapKind::Htlc {
            return Err(ProtocolError::WrongKind { expected: "HTLC" });
        }
        let hashed: [u8; 32] = Sha256::digest(secret).into();
        if hashed != swap.payment_hash {
            return Err(ProtocolError::SecretMismatch);
        }
        if check_expiry
            && swap.expired_for_claimer(unix_now(), self.relay_height_for(swap).await?)
        {
            return Err(ProtocolError::AlreadyExpired);
        }

        let submitter = swap.claimer;
        let mut instructions = fee_rate.priority_instructions();
        if swap.pay_out {
            self.ensure_ata(
                &swap.claimer_ata,
                &swap.claimer,
                &swap.token,
                &submitter,
                init_ata,
                &mut instructions,
            )
            .await?;
        }
        instructions.push(self.program.claim_with_secret(&submitter, swap, secret));
        Ok(vec![PreparedTransaction::new(
            instructions,
            &submitter,
            "claim_secret",
        )])
    }

    /// Claim an on-chain payment swap against a relay-verified Bitcoin
    /// transaction.
    ///
    /// Resolves the committed relay entry for the transaction's block at the
    /// swap's confirmation depth; when the relay trails and a synchronizer is
    /// supplied, its catch-up submissions are prepended and the projected
    /// entry is used. The raw transaction is staged into a scratch data
    /// account chunk by chunk (recorded in the cleanup ledger), then the
    /// final transaction carries the relay verify instruction at position 0
    /// followed by the claim.
    pub async fn txs_claim_with_tx_data(
        &self,
        swap: &SwapEscrow,
        evidence: TxClaimEvidence<'_>,
        synchronizer: Option<&RelaySynchronizer>,
        init_ata: bool,
        fee_rate: &FeeRate,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<PreparedTransaction>, ProtocolError> {
        if !swap.kind.uses_tx_proof() {
            return Err(ProtocolError::WrongKind {
                expected: "on-chain payment",
            });
        }

        let block_hash = {
            use bitcoin::hashes::Hash;
            evidence.header.block_hash().to_byte_array()
        };
        let required_height =
            evidence.proof.block_height + u32::from(swap.confirmations).saturating_sub(1);

        let mut txs: Vec<PreparedTransaction> = Vec::new();
        let committed = match self
            .relay
            .retrieve_log_and_blockheight(&block_hash, Some(required_height))
            .await?
        {
            Some(log) => log.header,
            None => {
                let Some(sync) = synchronizer else {
                    return Err(ProtocolError::NotSynchronized { required_height });
                };
                let Some((plan, computed)) = sync
                    .plan_for_height(required_height, fee_rate, cancel)
                    .await?
                else {
                    return Err(ProtocolError::NotSynchronized { required_height });
                };
                let entry = computed
                    .iter()
                    .find(|h| h.block_hash_internal() == block_hash)
                    .copied()
                    .ok_or(ProtocolError::NotSynchronized { required_height })?;
                info!(
                    target: "bridge::escrow",
                    start = plan.start_height,
                    target = plan.target_height,
                    "prepending relay catch-up to claim"
                );
                txs.extend(plan.submission.txs);
                entry
            }
        };

        let submitter = swap.claimer;
        let data_account = self
            .program
            .data_account_address(&submitter, &swap.payment_hash)
            .map_err(|e| ProtocolError::Derivation(e.to_string()))?;
        let rent = self.rpc.minimum_rent(evidence.raw_tx.len()).await?;
        let create = self
            .program
            .create_data_account(
                &submitter,
                &swap.payment_hash,
                rent,
                evidence.raw_tx.len() as u64,
            )
            .map_err(|e| ProtocolError::Derivation(e.to_string()))?;
        let mut create_ixs = fee_rate.priority_instructions();
        create_ixs.push(create);
        txs.push(PreparedTransaction::new(
            create_ixs,
            &submitter,
            "create_data_account",
        ));

        for (i, chunk) in evidence.raw_tx.chunks(DATA_CHUNK_SIZE).enumerate() {
            let mut ixs = fee_rate.priority_instructions();
            ixs.push(self.program.write_data(
                &submitter,
                &data_account,
                (i * DATA_CHUNK_SIZE) as u32,
                chunk,
            ));
            txs.push(PreparedTransaction::new(ixs, &submitter, "write_tx_data"));
        }
        debug!(
            target: "bridge::escrow",
            bytes = evidence.raw_tx.len(),
            chunks = evidence.raw_tx.len().div_ceil(DATA_CHUNK_SIZE),
            "staging transaction data"
        );

        // Ledger entry first, so the rent is reclaimable even if this claim
        // is abandoned halfway. A re-attempt hits the same seeded address.
        let record = DataAccountRecord::new(
            data_account.to_string(),
            hex::encode(swap.payment_hash),
        );
        match self.store.insert_data_account(&record).await {
            Ok(()) | Err(StorageError::Duplicate(_)) => {}
            Err(e) => return Err(e.into()),
        }

        // The program requires the verify instruction at position 0, so no
        // priority fee rides in the final transaction.
        let mut claim_ixs = vec![self.relay.verify_instruction(
            evidence.proof.reversed_txid,
            u32::from(swap.confirmations),
            evidence.proof.position,
            evidence.proof.siblings.clone(),
            &committed,
        )];
        if swap.pay_out {
            self.ensure_ata(
                &swap.claimer_ata,
                &swap.claimer,
                &swap.token,
                &submitter,
                init_ata,
                &mut claim_ixs,
            )
            .await?;
        }
        claim_ixs.push(self.program.claim_with_tx_data(&submitter, swap, &data_account));
        txs.push(PreparedTransaction::new(
            claim_ixs,
            &submitter,
            "claim_tx_data",
        ));

        Ok(txs)
    }

    // ------------------------------------------------------------------
    // Refunds
    // ------------------------------------------------------------------

    /// Timeout refund, valid once the swap is refundable from the offerer's
    /// grace-adjusted perspective
    pub async fn txs_refund(
        &self,
        swap: &SwapEscrow,
        check_expiry: bool,
        init_ata: bool,
        fee_rate: &FeeRate,
    ) -> Result<Vec<PreparedTransaction>, ProtocolError> {
        if check_expiry
            && !swap.refundable_by_offerer(unix_now(), self.relay_height_for(swap).await?)
        {
            return Err(ProtocolError::NotExpired);
        }

        let submitter = swap.offerer;
        let mut instructions = fee_rate.priority_instructions();
        if swap.pay_in {
            self.ensure_ata(
                &swap.offerer_ata,
                &swap.offerer,
                &swap.token,
                &submitter,
                init_ata,
                &mut instructions,
            )
            .await?;
        }
        instructions.push(self.program.refund(swap));
        Ok(vec![PreparedTransaction::new(
            instructions,
            &submitter,
            "refund",
        )])
    }

    /// Early refund under a claimer-signed authorization.
    ///
    /// The ed25519 verify must sit at transaction position 0, so no priority
    /// fee instruction rides here.
    pub async fn txs_refund_with_authorization(
        &self,
        swap: &SwapEscrow,
        auth: &RefundAuthorization,
        init_ata: bool,
    ) -> Result<Vec<PreparedTransaction>, ProtocolError> {
        AuthorizationCodec::verify_refund(swap, auth)?;

        let submitter = swap.offerer;
        let digest = AuthorizationCodec::refund_digest(swap, auth.timeout);
        let mut instructions = vec![ed25519_verify_instruction(
            &swap.claimer,
            &auth.signature,
            &digest,
        )];
        if swap.pay_in {
            self.ensure_ata(
                &swap.offerer_ata,
                &swap.offerer,
                &swap.token,
                &submitter,
                init_ata,
                &mut instructions,
            )
            .await?;
        }
        instructions.push(self.program.refund_signed(swap, auth.timeout));
        Ok(vec![PreparedTransaction::new(
            instructions,
            &submitter,
            "refund_signed",
        )])
    }

    // ------------------------------------------------------------------
    // Data-account sweeping
    // ------------------------------------------------------------------

    /// Plan rent reclamation for open scratch data accounts.
    ///
    /// The chain is authoritative: records whose account is already gone are
    /// settled on the spot, the rest get close instructions batched
    /// [`DATA_CLOSES_PER_TX`] per transaction. Callers confirm the closes
    /// with [`Self::confirm_data_sweep`] once the transactions land.
    pub async fn sweep_data_accounts(
        &self,
        submitter: &Pubkey,
        fee_rate: &FeeRate,
    ) -> Result<DataSweep, ProtocolError> {
        let records = self.store.open_data_accounts().await?;

        let mut vanished: Vec<String> = Vec::new();
        let mut closable: Vec<(String, Pubkey)> = Vec::new();
        for record in records {
            match Pubkey::from_str(&record.address) {
                Ok(address) => {
                    if self
                        .rpc
                        .fetch_account(&address, self.commitment)
                        .await?
                        .is_some()
                    {
                        closable.push((record.address, address));
                    } else {
                        vanished.push(record.address);
                    }
                }
                Err(_) => {
                    warn!(
                        target: "bridge::escrow",
                        address = %record.address,
                        "dropping unparseable ledger address"
                    );
                    vanished.push(record.address);
                }
            }
        }

        let reconciled = if vanished.is_empty() {
            0
        } else {
            self.store.mark_swept(&vanished).await?
        };

        let mut closing = Vec::new();
        let txs = closable
            .chunks(DATA_CLOSES_PER_TX)
            .map(|batch| {
                let mut instructions = fee_rate.priority_instructions();
                instructions.extend(
                    batch
                        .iter()
                        .map(|(_, address)| self.program.close_data(submitter, address)),
                );
                closing.extend(batch.iter().map(|(address, _)| address.clone()));
                PreparedTransaction::new(instructions, submitter, "close_data_accounts")
            })
            .collect::<Vec<_>>();

        info!(
            target: "bridge::escrow",
            closing = closing.len(),
            reconciled,
            "data account sweep planned"
        );
        Ok(DataSweep {
            txs,
            closing,
            reconciled,
        })
    }

    /// Settle ledger records once their close transactions confirmed
    pub async fn confirm_data_sweep(&self, addresses: &[String]) -> Result<u64, ProtocolError> {
        if addresses.is_empty() {
            return Ok(0);
        }
        Ok(self.store.mark_swept(addresses).await?)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Check an ATA exists, folding in a create when the caller opted in
    async fn ensure_ata(
        &self,
        ata: &Pubkey,
        owner: &Pubkey,
        token: &Pubkey,
        payer: &Pubkey,
        init_ata: bool,
        instructions: &mut Vec<Instruction>,
    ) -> Result<(), ProtocolError> {
        if self
            .rpc
            .fetch_account(ata, self.commitment)
            .await?
            .is_some()
        {
            return Ok(());
        }
        if !init_ata {
            return Err(ProtocolError::AtaNotInitialized(*ata));
        }
        instructions.push(create_ata_idempotent(payer, owner, token));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::events::PROGRAM_DATA_PREFIX;
    use crate::chain::rpc::{MockChainRpc, SignatureInfo};
    use crate::escrow::program::{encode_escrow_account, event_tag, tag};
    use crate::escrow::swap::testutil::htlc_swap;
    use crate::escrow::swap::REFUND_GRACE_PERIOD;
    use crate::relay::header::testutil::linked_header;
    use crate::relay::header::StoredHeader;
    use crate::relay::program as relay_program;
    use crate::store::MemoryCleanupStore;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use bitcoin::hashes::Hash;
    use bitcoin::BlockHash;
    use solana_sdk::account::Account;
    use solana_sdk::signature::{Keypair, Signature};
    use solana_sdk::signer::Signer;

    const BITS: u32 = 0x1d00_ffff;
    const T0: u32 = 1_600_000_000;

    fn protocol_at(
        rpc: MockChainRpc,
        escrow_program: Pubkey,
        relay_program_id: Pubkey,
        store: Arc<MemoryCleanupStore>,
    ) -> EscrowProtocol {
        let rpc: Arc<dyn ChainRpc> = Arc::new(rpc);
        let relay = Arc::new(RelayClient::new(
            Arc::clone(&rpc),
            relay_program_id,
            Pubkey::new_unique(),
        ));
        EscrowProtocol::new(rpc, escrow_program, relay, store)
    }

    fn protocol(rpc: MockChainRpc) -> EscrowProtocol {
        protocol_at(
            rpc,
            Pubkey::new_unique(),
            Pubkey::new_unique(),
            Arc::new(MemoryCleanupStore::new()),
        )
    }

    fn account_with(data: Vec<u8>) -> Account {
        Account {
            lamports: 1_000_000,
            data,
            owner: Pubkey::new_unique(),
            executable: false,
            rent_epoch: 0,
        }
    }

    fn one_signature_page(rpc: &mut MockChainRpc, logs: Vec<String>) {
        rpc.expect_signatures_for_address().returning(|_, _, _| {
            Ok(vec![SignatureInfo {
                signature: Signature::from([9u8; 64]),
                slot: 50,
                err: false,
                block_time: None,
            }])
        });
        rpc.expect_transaction_logs()
            .returning(move |_| Ok(logs.clone()));
    }

    fn claim_log_line(payment_hash: [u8; 32]) -> String {
        let event = ClaimEvent {
            payment_hash,
            witness: vec![1, 2, 3],
        };
        let mut payload = vec![event_tag::CLAIM];
        payload.extend(borsh::to_vec(&event).unwrap());
        format!("{}{}", PROGRAM_DATA_PREFIX, BASE64.encode(payload))
    }

    #[test]
    fn test_create_swap_data_derives_accounts_and_nonce() {
        let proto = protocol(MockChainRpc::new());
        let params = SwapParams {
            kind: SwapKind::ChainNonced,
            offerer: Pubkey::new_unique(),
            claimer: Pubkey::new_unique(),
            token: Pubkey::new_unique(),
            amount: 5_000_000,
            payment_hash: [7; 32],
            expiry: 1_800_000_000,
            confirmations: 3,
            pay_in: true,
            pay_out: false,
            security_deposit: 0,
            claimer_bounty: 0,
            txo_hash: None,
        };

        let swap = proto.create_swap_data(params.clone());
        assert_eq!(swap.offerer_ata, get_ata(&params.offerer, &params.token));
        assert_eq!(swap.claimer_ata, get_ata(&params.claimer, &params.token));
        assert_eq!(swap.txo_hash, [0; 32]);
        // Nonced kind: top bits carry offset seconds, so the nonce is large.
        assert!(swap.nonce >> 24 > 0);

        let htlc = proto.create_swap_data(SwapParams {
            kind: SwapKind::Htlc,
            ..params
        });
        assert_eq!(htlc.nonce, 0);
        assert_ne!(htlc.sequence, swap.sequence);
    }

    #[tokio::test]
    async fn test_commit_status_requires_exact_match() {
        let swap = htlc_swap([3; 32], unix_now() + 86_400);
        let mut stored = swap.clone();
        stored.amount += 1;

        let mut rpc = MockChainRpc::new();
        let account = account_with(encode_escrow_account(&stored));
        rpc.expect_fetch_account()
            .returning(move |_, _| Ok(Some(account.clone())));

        let proto = protocol(rpc);
        let status = proto.get_commit_status(Party::Claimer, &swap).await.unwrap();
        assert_eq!(status, CommitStatus::NotCommitted);
    }

    #[tokio::test]
    async fn test_commit_status_offerer_grace_window() {
        // Just past expiry: inside the offerer's grace, still committed.
        for (expiry_offset, expected) in [
            (-1i64, CommitStatus::Committed),
            (-(REFUND_GRACE_PERIOD as i64 + 60), CommitStatus::Refundable),
        ] {
            let expiry = (unix_now() as i64 + expiry_offset) as u64;
            let swap = htlc_swap([3; 32], expiry);
            let mut rpc = MockChainRpc::new();
            let account = account_with(encode_escrow_account(&swap));
            rpc.expect_fetch_account()
                .returning(move |_, _| Ok(Some(account.clone())));

            let proto = protocol(rpc);
            let status = proto.get_commit_status(Party::Offerer, &swap).await.unwrap();
            assert_eq!(status, expected);
        }
    }

    #[tokio::test]
    async fn test_commit_status_claimer_grace_window() {
        // Expiry within the claimer's grace reads as expired well before the
        // nominal timeout.
        for (expiry_offset, expected) in [
            (300u64, CommitStatus::Expired),
            (7_200, CommitStatus::Committed),
        ] {
            let swap = htlc_swap([3; 32], unix_now() + expiry_offset);
            let mut rpc = MockChainRpc::new();
            let account = account_with(encode_escrow_account(&swap));
            rpc.expect_fetch_account()
                .returning(move |_, _| Ok(Some(account.clone())));

            let proto = protocol(rpc);
            let status = proto.get_commit_status(Party::Claimer, &swap).await.unwrap();
            assert_eq!(status, expected);
        }
    }

    #[tokio::test]
    async fn test_commit_status_paid_after_claim() {
        let swap = htlc_swap([8; 32], unix_now() + 86_400);

        let mut rpc = MockChainRpc::new();
        rpc.expect_fetch_account().returning(|_, _| Ok(None));
        one_signature_page(&mut rpc, vec![claim_log_line([8; 32])]);
        let proto = protocol(rpc);
        let status = proto.get_commit_status(Party::Offerer, &swap).await.unwrap();
        assert_eq!(status, CommitStatus::Paid);

        // No account and no claim event: never committed.
        let mut rpc = MockChainRpc::new();
        rpc.expect_fetch_account().returning(|_, _| Ok(None));
        one_signature_page(&mut rpc, vec!["Program log: noise".to_string()]);
        let proto = protocol(rpc);
        let status = proto.get_commit_status(Party::Offerer, &swap).await.unwrap();
        assert_eq!(status, CommitStatus::NotCommitted);
    }

    #[tokio::test]
    async fn test_init_refuses_live_escrow() {
        let claimer = Keypair::new();
        let mut swap = htlc_swap([5; 32], unix_now() + 86_400);
        swap.pay_in = true;
        swap.claimer = claimer.pubkey();

        let mut rpc = MockChainRpc::new();
        let account = account_with(encode_escrow_account(&swap));
        rpc.expect_fetch_account()
            .returning(move |_, _| Ok(Some(account.clone())));

        let proto = protocol(rpc);
        let auth = InitAuthorization {
            prefix: "claim_initialize".to_string(),
            timeout: unix_now() + 3_600,
            slot: 1_000,
            signature: Signature::default(),
        };
        let err = proto
            .txs_init(&swap, &auth, false, &FeeRate::new(0, 0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::AlreadyCommitted(CommitStatus::Committed)
        ));
    }

    #[tokio::test]
    async fn test_claim_secret_validates_kind_and_preimage() {
        let secret = [0x11u8; 32];
        let payment_hash: [u8; 32] = Sha256::digest(secret).into();
        let mut swap = htlc_swap(payment_hash, unix_now() + 86_400);

        let proto = protocol(MockChainRpc::new());

        swap.kind = SwapKind::Chain;
        let err = proto
            .txs_claim_with_secret(&swap, &secret, false, false, &FeeRate::new(0, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::WrongKind { .. }));

        swap.kind = SwapKind::Htlc;
        let err = proto
            .txs_claim_with_secret(&swap, &[0x22; 32], false, false, &FeeRate::new(0, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::SecretMismatch));
    }

    #[tokio::test]
    async fn test_claim_secret_refuses_expired_before_building() {
        let secret = [0x11u8; 32];
        let payment_hash: [u8; 32] = Sha256::digest(secret).into();
        // Nominally one minute of life left, but inside the claimer's grace.
        let swap = htlc_swap(payment_hash, unix_now() + 60);

        let mut rpc = MockChainRpc::new();
        rpc.expect_fetch_account().never();
        let proto = protocol(rpc);
        let err = proto
            .txs_claim_with_secret(&swap, &secret, true, false, &FeeRate::new(1_000, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::AlreadyExpired));

        // Same swap with the check skipped builds normally.
        let mut rpc = MockChainRpc::new();
        rpc.expect_fetch_account()
            .returning(|_, _| Ok(Some(account_with(vec![0; 165]))));
        let proto = protocol(rpc);
        let txs = proto
            .txs_claim_with_secret(&swap, &secret, false, false, &FeeRate::new(1_000, 0))
            .await
            .unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].label, "claim_secret");

        let message = &txs[0].transaction.message;
        assert_eq!(message.instructions.len(), 2);
        let claim = message.instructions.last().unwrap();
        assert_eq!(claim.data[0], tag::CLAIM_SECRET);
    }

    #[tokio::test]
    async fn test_claim_secret_ata_handling() {
        let secret = [0x11u8; 32];
        let payment_hash: [u8; 32] = Sha256::digest(secret).into();
        let swap = htlc_swap(payment_hash, unix_now() + 86_400);

        // Missing ATA without opt-in is a distinguished error.
        let mut rpc = MockChainRpc::new();
        rpc.expect_fetch_account().returning(|_, _| Ok(None));
        let proto = protocol(rpc);
        let err = proto
            .txs_claim_with_secret(&swap, &secret, false, false, &FeeRate::new(0, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::AtaNotInitialized(a) if a == swap.claimer_ata));

        // With opt-in the create rides in the same transaction.
        let mut rpc = MockChainRpc::new();
        rpc.expect_fetch_account().returning(|_, _| Ok(None));
        let proto = protocol(rpc);
        let txs = proto
            .txs_claim_with_secret(&swap, &secret, false, true, &FeeRate::new(0, 0))
            .await
            .unwrap();
        let message = &txs[0].transaction.message;
        assert_eq!(message.instructions.len(), 2);
        let create = &message.instructions[0];
        assert_eq!(
            *create.program_id(&message.account_keys),
            crate::escrow::program::ATA_PROGRAM_ID
        );
    }

    #[tokio::test]
    async fn test_claim_tx_data_stages_chunks_and_orders_verify_first() {
        let seed_header = linked_header(BlockHash::all_zeros(), T0, BITS, 1);
        let seed = StoredHeader::seed(seed_header, 100_000, T0, &[T0; 10]).unwrap();

        let mut state_commitments = [[0u8; 32]; relay_program::COMMITMENT_WINDOW];
        state_commitments[100_000 % relay_program::COMMITMENT_WINDOW] = seed.commit_hash();
        let state = relay_program::MainChainState {
            start_height: 100_000,
            last_diff_adjustment: T0,
            block_height: 100_010,
            total_blocks: 11,
            fork_counter: 0,
            tip_commit_hash: [1; 32],
            tip_block_hash: [2; 32],
            chain_work: seed.chain_work,
            block_commitments: state_commitments,
        };
        let store_line = {
            let event = relay_program::StoreHeaderEvent {
                commit_hash: seed.commit_hash(),
                block_hash: seed.block_hash_internal(),
                header: seed,
            };
            let mut payload = vec![relay_program::event_tag::STORE_HEADER];
            payload.extend(borsh::to_vec(&event).unwrap());
            format!("{}{}", PROGRAM_DATA_PREFIX, BASE64.encode(payload))
        };

        let mut rpc = MockChainRpc::new();
        let account = account_with(state.to_account_bytes());
        rpc.expect_fetch_account()
            .returning(move |_, _| Ok(Some(account.clone())));
        one_signature_page(&mut rpc, vec![store_line]);
        rpc.expect_minimum_rent()
            .withf(|len| *len == 1_800)
            .returning(|_| Ok(2_000_000));

        let mut swap = htlc_swap([6; 32], unix_now() + 86_400);
        swap.kind = SwapKind::Chain;
        swap.pay_out = false;
        swap.txo_hash = [9; 32];

        let escrow_program = Pubkey::new_unique();
        let relay_program_id = Pubkey::new_unique();
        let store = Arc::new(MemoryCleanupStore::new());
        let proto = protocol_at(rpc, escrow_program, relay_program_id, store.clone());

        let raw_tx = vec![0xabu8; 1_800];
        let proof = MerkleProofInfo {
            reversed_txid: [4; 32],
            siblings: vec![[5; 32]],
            block_height: 100_000,
            position: 2,
        };
        let txs = proto
            .txs_claim_with_tx_data(
                &swap,
                TxClaimEvidence {
                    raw_tx: &raw_tx,
                    header: seed.header,
                    proof: &proof,
                },
                None,
                false,
                &FeeRate::new(1_000, 0),
                None,
            )
            .await
            .unwrap();

        // create + three 800-byte chunks + claim
        assert_eq!(txs.len(), 5);
        assert_eq!(txs[0].label, "create_data_account");
        for (i, tx) in txs[1..4].iter().enumerate() {
            assert_eq!(tx.label, "write_tx_data");
            let write = tx.transaction.message.instructions.last().unwrap();
            assert_eq!(write.data[0], tag::WRITE_DATA);
            assert_eq!(write.data[1..5], ((i * 800) as u32).to_le_bytes());
        }

        // Relay verify first, claim last, no priority fee in between.
        let message = &txs[4].transaction.message;
        assert_eq!(message.instructions.len(), 2);
        assert_eq!(
            *message.instructions[0].program_id(&message.account_keys),
            relay_program_id
        );
        assert_eq!(
            message.instructions[0].data[0],
            relay_program::tag::VERIFY_TRANSACTION
        );
        assert_eq!(
            *message.instructions[1].program_id(&message.account_keys),
            escrow_program
        );
        assert_eq!(message.instructions[1].data, vec![tag::CLAIM_TX_DATA]);

        // The scratch account landed in the cleanup ledger.
        let open = store.open_data_accounts().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].payment_hash, hex::encode([6u8; 32]));
    }

    #[tokio::test]
    async fn test_claim_tx_data_requires_synchronized_relay() {
        let mut rpc = MockChainRpc::new();
        rpc.expect_fetch_account().returning(|_, _| Ok(None));

        let mut swap = htlc_swap([6; 32], unix_now() + 86_400);
        swap.kind = SwapKind::ChainTxid;
        swap.confirmations = 3;

        let proto = protocol(rpc);
        let proof = MerkleProofInfo {
            reversed_txid: [4; 32],
            siblings: vec![],
            block_height: 100_000,
            position: 0,
        };
        let err = proto
            .txs_claim_with_tx_data(
                &swap,
                TxClaimEvidence {
                    raw_tx: &[0u8; 10],
                    header: linked_header(BlockHash::all_zeros(), T0, BITS, 1),
                    proof: &proof,
                },
                None,
                false,
                &FeeRate::new(0, 0),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::NotSynchronized {
                required_height: 100_002
            }
        ));
    }

    #[tokio::test]
    async fn test_refund_respects_offerer_grace() {
        let swap = htlc_swap([2; 32], unix_now() + 60);
        let proto = protocol(MockChainRpc::new());
        let err = proto
            .txs_refund(&swap, true, false, &FeeRate::new(0, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NotExpired));

        let swap = htlc_swap([2; 32], unix_now() - REFUND_GRACE_PERIOD - 60);
        let proto = protocol(MockChainRpc::new());
        let txs = proto
            .txs_refund(&swap, true, false, &FeeRate::new(0, 0))
            .await
            .unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].label, "refund");
        let message = &txs[0].transaction.message;
        assert_eq!(message.instructions.last().unwrap().data, vec![tag::REFUND]);
        assert_eq!(message.account_keys[0], swap.offerer);
    }

    #[tokio::test]
    async fn test_refund_with_authorization_orders_ed25519_first() {
        let claimer = Keypair::new();
        let mut swap = htlc_swap([2; 32], unix_now() + 86_400);
        swap.claimer = claimer.pubkey();

        let timeout = unix_now() + 3_600;
        let auth = AuthorizationCodec::sign_refund(&swap, timeout, &claimer);

        let proto = protocol(MockChainRpc::new());
        let txs = proto
            .txs_refund_with_authorization(&swap, &auth, false)
            .await
            .unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].label, "refund_signed");

        let message = &txs[0].transaction.message;
        assert_eq!(message.instructions.len(), 2);
        assert_eq!(
            *message.instructions[0].program_id(&message.account_keys),
            solana_sdk::ed25519_program::ID
        );
        let refund = &message.instructions[1];
        assert_eq!(refund.data[0], tag::REFUND_SIGNED);
        assert_eq!(refund.data[1..9], timeout.to_le_bytes());
    }

    #[tokio::test]
    async fn test_sweep_reconciles_vanished_accounts() {
        let alive = Pubkey::new_unique();
        let gone = Pubkey::new_unique();

        let mut rpc = MockChainRpc::new();
        rpc.expect_fetch_account()
            .withf(move |address, _| *address == alive)
            .returning(|_, _| Ok(Some(account_with(vec![1, 2, 3]))));
        rpc.expect_fetch_account()
            .withf(move |address, _| *address == gone)
            .returning(|_, _| Ok(None));

        let store = Arc::new(MemoryCleanupStore::new());
        store
            .insert_data_account(&DataAccountRecord::new(
                alive.to_string(),
                hex::encode([1u8; 32]),
            ))
            .await
            .unwrap();
        store
            .insert_data_account(&DataAccountRecord::new(
                gone.to_string(),
                hex::encode([2u8; 32]),
            ))
            .await
            .unwrap();

        let submitter = Pubkey::new_unique();
        let proto = protocol_at(
            rpc,
            Pubkey::new_unique(),
            Pubkey::new_unique(),
            store.clone(),
        );
        let sweep = proto
            .sweep_data_accounts(&submitter, &FeeRate::new(0, 0))
            .await
            .unwrap();

        assert_eq!(sweep.reconciled, 1);
        assert_eq!(sweep.closing, vec![alive.to_string()]);
        assert_eq!(sweep.txs.len(), 1);
        let message = &sweep.txs[0].transaction.message;
        assert_eq!(message.instructions.len(), 1);
        assert_eq!(message.instructions[0].data, vec![tag::CLOSE_DATA]);

        // The vanished record settled immediately; the live one waits for
        // its close to confirm.
        let open = store.open_data_accounts().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].address, alive.to_string());

        assert_eq!(proto.confirm_data_sweep(&sweep.closing).await.unwrap(), 1);
        assert!(store.open_data_accounts().await.unwrap().is_empty());
    }

    // The sweeper binary keeps one dyn handle and clones it into the
    // protocol; both sides must see the same ledger.
    #[tokio::test]
    async fn test_dyn_store_handle_shared_with_protocol() {
        let store: Arc<dyn CleanupStore> = Arc::new(MemoryCleanupStore::new());
        let rpc: Arc<dyn ChainRpc> = Arc::new(MockChainRpc::new());
        let relay = Arc::new(RelayClient::new(
            Arc::clone(&rpc),
            Pubkey::new_unique(),
            Pubkey::new_unique(),
        ));
        let proto = EscrowProtocol::new(rpc, Pubkey::new_unique(), relay, Arc::clone(&store));

        let address = Pubkey::new_unique().to_string();
        store
            .insert_data_account(&DataAccountRecord::new(
                address.clone(),
                hex::encode([3u8; 32]),
            ))
            .await
            .unwrap();

        assert_eq!(proto.confirm_data_sweep(&[address]).await.unwrap(), 1);
        assert!(store.open_data_accounts().await.unwrap().is_empty());
    }
}
