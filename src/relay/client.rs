//! Relay Client
//!
//! High-level operations against the header relay: seeding, batched header
//! submission, commitment lookups over the event history, fork-state
//! sweeping, and fee estimates. Every operation returns prepared
//! transactions; nothing here signs or broadcasts.

use std::sync::Arc;

use bitcoin::block::Header;
use bitcoin::pow::Work;
use solana_sdk::instruction::Instruction;
use solana_sdk::pubkey::Pubkey;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bitcoin::{internal_to_display_hex, BitcoinRpc, BtcRpcError};
use crate::chain::events::EventScanner;
use crate::chain::fees::{FeeError, FeeEstimator, FeeRate};
use crate::chain::rpc::{ChainRpc, Commitment, RpcError};
use crate::chain::tx::PreparedTransaction;

use super::header::StoredHeader;
use super::planner::{
    plan_submission, ForkTarget, PlanRejection, PlanVerdict, SubmissionPlan, MAIN_HEADERS_PER_TX,
};
use super::program::{CommittedLog, MainChainState, RelayEvent, RelayProgram, VerifyData};

/// Fork close instructions batched per sweep transaction
pub const CLOSE_FORKS_PER_TX: usize = 10;

/// Pages of event history walked by commitment lookups before giving up
const RETRIEVE_MAX_PAGES: usize = 50;

/// Compute budget assumed for one header submission transaction
const SUBMIT_COMPUTE_UNITS: u64 = 200_000;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    #[error("bitcoin rpc error: {0}")]
    Bitcoin(#[from] BtcRpcError),

    #[error("fee error: {0}")]
    Fee(#[from] FeeError),

    #[error("submission rejected: {0}")]
    Plan(PlanRejection),

    #[error("relay already initialized")]
    AlreadyInitialized,

    #[error("relay not initialized")]
    NotInitialized,

    #[error("malformed relay account: {0}")]
    MalformedAccount(String),

    #[error("validation error: {0}")]
    Validation(String),
}

impl RelayError {
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::Rpc(e) => e.is_retryable(),
            RelayError::Bitcoin(_) => true,
            _ => false,
        }
    }
}

/// A planned header submission: one transaction per batch plus the locally
/// projected entries, so a claim can be built against `computed_headers`
/// before anything confirms.
#[derive(Debug)]
pub struct HeaderSubmission {
    pub txs: Vec<PreparedTransaction>,
    pub computed_headers: Vec<StoredHeader>,
    /// Projected stored tip after the last batch
    pub tip: StoredHeader,
}

/// Outcome of a fork sweep pass
pub struct ForkSweep {
    pub txs: Vec<PreparedTransaction>,
    /// Fork ids with live state accounts, in close order
    pub closed_fork_ids: Vec<u64>,
    /// Highest fork id examined; feed back as the next sweep cursor
    pub highest_checked: u64,
}

pub struct RelayClient {
    rpc: Arc<dyn ChainRpc>,
    program: RelayProgram,
    submitter: Pubkey,
    commitment: Commitment,
}

impl RelayClient {
    pub fn new(rpc: Arc<dyn ChainRpc>, program_id: Pubkey, submitter: Pubkey) -> Self {
        Self {
            rpc,
            program: RelayProgram::new(program_id),
            submitter,
            commitment: Commitment::Confirmed,
        }
    }

    pub fn with_commitment(mut self, commitment: Commitment) -> Self {
        self.commitment = commitment;
        self
    }

    pub fn program(&self) -> &RelayProgram {
        &self.program
    }

    pub fn submitter(&self) -> Pubkey {
        self.submitter
    }

    // ------------------------------------------------------------------
    // State reads
    // ------------------------------------------------------------------

    /// Current main-chain state, `None` while the relay is uninitialized
    pub async fn get_tip_data(&self) -> Result<Option<MainChainState>, RelayError> {
        let account = self
            .rpc
            .fetch_account(&self.program.state_address(), self.commitment)
            .await?;
        match account {
            Some(account) => {
                let state = MainChainState::decode(&account.data)
                    .map_err(|e| RelayError::MalformedAccount(e.to_string()))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn require_state(&self) -> Result<MainChainState, RelayError> {
        self.get_tip_data().await?.ok_or(RelayError::NotInitialized)
    }

    // ------------------------------------------------------------------
    // Header submission
    // ------------------------------------------------------------------

    /// Seed the relay with its first header.
    ///
    /// `past_timestamps` must hold exactly the 10 timestamps preceding
    /// `header`; that is validated before any RPC traffic. Fails when the
    /// relay already has state.
    pub async fn save_initial_header(
        &self,
        header: Header,
        block_height: u32,
        epoch_start: u32,
        past_timestamps: &[u32],
        fee_rate: &FeeRate,
    ) -> Result<(PreparedTransaction, StoredHeader), RelayError> {
        let seed = StoredHeader::seed(header, block_height, epoch_start, past_timestamps)
            .map_err(|e| RelayError::Validation(e.to_string()))?;

        if self.get_tip_data().await?.is_some() {
            return Err(RelayError::AlreadyInitialized);
        }

        let mut instructions = fee_rate.priority_instructions();
        instructions.push(self.program.initialize(&self.submitter, &seed));
        let tx = PreparedTransaction::new(instructions, &self.submitter, "initialize_relay");
        info!(target: "bridge::relay", height = block_height, "relay initialization prepared");
        Ok((tx, seed))
    }

    /// Extend the main chain on top of `tip` (the stored entry the first
    /// header connects to, typically a local projection).
    pub fn save_main_headers(
        &self,
        tip: &StoredHeader,
        headers: &[Header],
        fee_rate: &FeeRate,
    ) -> Result<HeaderSubmission, RelayError> {
        let verdict = plan_submission(ForkTarget::Main, tip, headers, None);
        self.submission_from_verdict(verdict, fee_rate)
    }

    /// Extend tracked fork `fork_id`; `main_tip_work` feeds the overtake rule
    pub fn save_fork_headers(
        &self,
        fork_id: u64,
        tip: &StoredHeader,
        headers: &[Header],
        main_tip_work: Work,
        fee_rate: &FeeRate,
    ) -> Result<HeaderSubmission, RelayError> {
        let verdict = plan_submission(ForkTarget::Fork(fork_id), tip, headers, Some(main_tip_work));
        self.submission_from_verdict(verdict, fee_rate)
    }

    /// Open a fresh tracked fork at `fork_counter + 1` and submit onto it
    pub async fn save_new_fork_headers(
        &self,
        tip: &StoredHeader,
        headers: &[Header],
        fee_rate: &FeeRate,
    ) -> Result<HeaderSubmission, RelayError> {
        let state = self.require_state().await?;
        let fork_id = state.fork_counter + 1;
        debug!(target: "bridge::relay", fork_id, "opening new fork");
        self.save_fork_headers(fork_id, tip, headers, state.tip_work(), fee_rate)
    }

    /// Submit onto an ephemeral short fork (no persistent fork account)
    pub fn save_short_fork_headers(
        &self,
        tip: &StoredHeader,
        headers: &[Header],
        main_tip_work: Work,
        fee_rate: &FeeRate,
    ) -> Result<HeaderSubmission, RelayError> {
        let verdict = plan_submission(ForkTarget::Short, tip, headers, Some(main_tip_work));
        self.submission_from_verdict(verdict, fee_rate)
    }

    fn submission_from_verdict(
        &self,
        verdict: PlanVerdict,
        fee_rate: &FeeRate,
    ) -> Result<HeaderSubmission, RelayError> {
        let plan = match verdict {
            PlanVerdict::Planned(plan) => plan,
            PlanVerdict::Rejected(rejection) => return Err(RelayError::Plan(rejection)),
        };
        Ok(self.submission_from_plan(&plan, fee_rate))
    }

    /// Turn a submission plan into one prepared transaction per batch
    pub fn submission_from_plan(
        &self,
        plan: &SubmissionPlan,
        fee_rate: &FeeRate,
    ) -> HeaderSubmission {
        let txs = plan
            .batches
            .iter()
            .map(|batch| {
                let mut instructions = fee_rate.priority_instructions();
                instructions.push(self.program.submit_batch(&self.submitter, batch));
                PreparedTransaction::new(instructions, &self.submitter, batch_label(batch.target))
            })
            .collect::<Vec<_>>();

        debug!(
            target: "bridge::relay",
            batches = txs.len(),
            tip_height = plan.tip.block_height,
            "header submission planned"
        );
        HeaderSubmission {
            txs,
            computed_headers: plan.computed_headers(),
            tip: plan.tip,
        }
    }

    // ------------------------------------------------------------------
    // Commitment lookups
    // ------------------------------------------------------------------

    /// Find the committed entry for `block_hash` (internal byte order).
    ///
    /// `Ok(None)` when the relay has not reached `required_blockheight` yet
    /// or when no matching commitment sits in the current window; both are
    /// expected synchronization states, not errors.
    pub async fn retrieve_log_and_blockheight(
        &self,
        block_hash: &[u8; 32],
        required_blockheight: Option<u32>,
    ) -> Result<Option<CommittedLog>, RelayError> {
        let Some(state) = self.get_tip_data().await? else {
            return Ok(None);
        };
        if let Some(required) = required_blockheight {
            if state.block_height < required {
                debug!(
                    target: "bridge::relay",
                    tip = state.block_height,
                    required,
                    "relay behind required height"
                );
                return Ok(None);
            }
        }

        let scanner = EventScanner::new(self.rpc.as_ref(), self.program.program_id);
        let found = scanner
            .find_map(
                |raw| {
                    RelayEvent::parse(raw)
                        .and_then(|event| event.committed_log())
                        .filter(|log| log.block_hash == *block_hash)
                },
                None,
                Some(RETRIEVE_MAX_PAGES),
            )
            .await?;

        Ok(found.filter(|log| state.has_commitment(log.header.block_height, &log.commit_hash)))
    }

    /// Same lookup keyed by commitment hash
    pub async fn retrieve_log_by_commit_hash(
        &self,
        commit_hash: &[u8; 32],
    ) -> Result<Option<CommittedLog>, RelayError> {
        let Some(state) = self.get_tip_data().await? else {
            return Ok(None);
        };

        let scanner = EventScanner::new(self.rpc.as_ref(), self.program.program_id);
        let found = scanner
            .find_map(
                |raw| {
                    RelayEvent::parse(raw)
                        .and_then(|event| event.committed_log())
                        .filter(|log| log.commit_hash == *commit_hash)
                },
                None,
                Some(RETRIEVE_MAX_PAGES),
            )
            .await?;

        Ok(found.filter(|log| state.has_commitment(log.header.block_height, &log.commit_hash)))
    }

    /// Newest committed entry that is still in the relay window and still on
    /// Bitcoin's best chain. This is the shared ancestor a synchronizer
    /// resumes from after either chain moves.
    pub async fn retrieve_latest_known_block_log(
        &self,
        bitcoin_rpc: &dyn BitcoinRpc,
        cancel: Option<&CancellationToken>,
        max_pages: Option<usize>,
    ) -> Result<Option<CommittedLog>, RelayError> {
        let Some(state) = self.get_tip_data().await? else {
            return Ok(None);
        };

        let scanner = EventScanner::new(self.rpc.as_ref(), self.program.program_id);
        let mut before = None;
        let mut pages = 0usize;

        loop {
            if let Some(token) = cancel {
                if token.is_cancelled() {
                    return Err(RelayError::Rpc(RpcError::Cancelled));
                }
            }

            let page = scanner.fetch_page(before).await?;
            for raw in &page.events {
                let Some(log) = RelayEvent::parse(raw).and_then(|e| e.committed_log()) else {
                    continue;
                };
                if !state.has_commitment(log.header.block_height, &log.commit_hash) {
                    continue;
                }
                let hash_hex = internal_to_display_hex(&log.block_hash);
                if bitcoin_rpc
                    .is_in_main_chain(&hash_hex, log.header.block_height as u64)
                    .await?
                {
                    return Ok(Some(log));
                }
            }

            pages += 1;
            if let Some(limit) = max_pages {
                if pages >= limit {
                    return Ok(None);
                }
            }
            match page.next_cursor {
                Some(cursor) => before = Some(cursor),
                None => return Ok(None),
            }
        }
    }

    // ------------------------------------------------------------------
    // Verification and sweeping
    // ------------------------------------------------------------------

    /// Build the merkle-verify instruction for a claim transaction.
    ///
    /// Purely an encoder; the program performs the actual proof check, and
    /// requires this instruction at transaction position 0.
    pub fn verify_instruction(
        &self,
        reversed_txid: [u8; 32],
        confirmations: u32,
        tx_index: u32,
        reversed_merkle_proof: Vec<[u8; 32]>,
        committed_header: &StoredHeader,
    ) -> Instruction {
        self.program.verify_transaction(&VerifyData {
            reversed_txid,
            confirmations,
            tx_index,
            reversed_merkle_proof,
            committed_header: *committed_header,
        })
    }

    /// Close this submitter's spent fork accounts, reclaiming rent.
    ///
    /// Checks fork ids after `last_sweep_id` up to the current fork counter;
    /// the returned cursor makes repeated sweeps resumable.
    pub async fn sweep_fork_data(
        &self,
        last_sweep_id: Option<u64>,
        fee_rate: &FeeRate,
    ) -> Result<ForkSweep, RelayError> {
        let state = self.require_state().await?;
        let start = last_sweep_id.map_or(1, |id| id + 1);

        let mut open = Vec::new();
        for fork_id in start..=state.fork_counter {
            let address = self.program.fork_address(fork_id, &self.submitter);
            if self
                .rpc
                .fetch_account(&address, self.commitment)
                .await?
                .is_some()
            {
                open.push(fork_id);
            }
        }

        let txs = open
            .chunks(CLOSE_FORKS_PER_TX)
            .map(|chunk| {
                let mut instructions = fee_rate.priority_instructions();
                instructions.extend(
                    chunk
                        .iter()
                        .map(|id| self.program.close_fork(&self.submitter, *id)),
                );
                PreparedTransaction::new(instructions, &self.submitter, "close_forks")
            })
            .collect::<Vec<_>>();

        info!(
            target: "bridge::relay",
            open = open.len(),
            highest = state.fork_counter,
            "fork sweep planned"
        );
        Ok(ForkSweep {
            txs,
            closed_fork_ids: open,
            highest_checked: state.fork_counter,
        })
    }

    // ------------------------------------------------------------------
    // Fee estimates
    // ------------------------------------------------------------------

    /// Lamports per Bitcoin block at the main-chain batch size
    pub async fn get_fee_per_block(
        &self,
        estimator: &dyn FeeEstimator,
    ) -> Result<u64, RelayError> {
        let rate = estimator.fee_rate(&[self.program.state_address()]).await?;
        Ok(rate.tx_fee_lamports(SUBMIT_COMPUTE_UNITS) / MAIN_HEADERS_PER_TX as u64)
    }

    /// Cost of advancing the relay tip to `required_height`
    pub async fn estimate_synchronize_fee(
        &self,
        required_height: u32,
        estimator: &dyn FeeEstimator,
    ) -> Result<u64, RelayError> {
        let state = self.require_state().await?;
        let behind = u64::from(required_height.saturating_sub(state.block_height));
        if behind == 0 {
            return Ok(0);
        }
        let rate = estimator.fee_rate(&[self.program.state_address()]).await?;
        let txs = behind.div_ceil(MAIN_HEADERS_PER_TX as u64);
        Ok(txs * rate.tx_fee_lamports(SUBMIT_COMPUTE_UNITS))
    }
}

fn batch_label(target: ForkTarget) -> &'static str {
    match target {
        ForkTarget::Main => "submit_main_headers",
        ForkTarget::Short => "submit_short_fork_headers",
        ForkTarget::Fork(_) => "submit_fork_headers",
    }
}
