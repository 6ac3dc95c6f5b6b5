//! Relay Synchronizer
//!
//! Brings the on-chain relay up to Bitcoin's tip. Finds the newest block
//! known to both chains, pulls the missing headers from the Bitcoin API, and
//! plans either a main-chain extension (relay tip still canonical) or a fresh
//! fork submission that overtakes it (relay tip reorged away).

use std::sync::Arc;

use bitcoin::block::Header;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bitcoin::{BitcoinRpc, BtcRpcError};
use crate::chain::fees::FeeRate;

use super::client::{HeaderSubmission, RelayClient, RelayError};
use super::header::StoredHeader;

/// Ceiling on headers pulled in one planning pass
pub const MAX_SYNC_HEADERS: usize = 1000;

/// Event-history pages searched for the shared ancestor
const ANCHOR_MAX_PAGES: usize = 30;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("bitcoin rpc error: {0}")]
    Bitcoin(#[from] BtcRpcError),

    #[error("relay not initialized; seed it with an initial header first")]
    RelayUninitialized,

    #[error("no relay commitment found on bitcoin's best chain")]
    NoSharedHeader,
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Relay(e) => e.is_retryable(),
            SyncError::Bitcoin(_) => true,
            _ => false,
        }
    }
}

/// One planned catch-up pass
#[derive(Debug)]
pub struct SyncPlan {
    pub submission: HeaderSubmission,
    /// First Bitcoin height being submitted
    pub start_height: u32,
    /// Last Bitcoin height covered by this pass (may still trail the tip)
    pub target_height: u32,
    /// Set when the pass goes through a fresh tracked fork
    pub fork_id: Option<u64>,
}

/// Relay-vs-Bitcoin height snapshot
#[derive(Debug, Clone, Copy)]
pub struct SyncStatus {
    pub relay_height: u32,
    pub bitcoin_height: u64,
    pub blocks_behind: u64,
}

pub struct RelaySynchronizer {
    relay: Arc<RelayClient>,
    bitcoin_rpc: Arc<dyn BitcoinRpc>,
}

impl RelaySynchronizer {
    pub fn new(relay: Arc<RelayClient>, bitcoin_rpc: Arc<dyn BitcoinRpc>) -> Self {
        Self { relay, bitcoin_rpc }
    }

    pub fn relay(&self) -> &RelayClient {
        &self.relay
    }

    /// How far the relay trails Bitcoin
    pub async fn status(&self) -> Result<SyncStatus, SyncError> {
        let state = self
            .relay
            .get_tip_data()
            .await?
            .ok_or(SyncError::RelayUninitialized)?;
        let bitcoin_height = self.bitcoin_rpc.tip_height().await?;
        Ok(SyncStatus {
            relay_height: state.block_height,
            bitcoin_height,
            blocks_behind: bitcoin_height.saturating_sub(u64::from(state.block_height)),
        })
    }

    /// Plan one catch-up pass toward Bitcoin's tip.
    ///
    /// `Ok(None)` means there is nothing to submit: the relay already covers
    /// the Bitcoin tip from the shared ancestor onward. A pass is capped at
    /// `max_headers`, so repeated calls may be needed after deep lag; each
    /// pass plans from fresh on-chain state.
    pub async fn plan_to_tip(
        &self,
        fee_rate: &FeeRate,
        cancel: Option<&CancellationToken>,
        max_headers: usize,
    ) -> Result<Option<SyncPlan>, SyncError> {
        let state = self
            .relay
            .get_tip_data()
            .await?
            .ok_or(SyncError::RelayUninitialized)?;
        let bitcoin_tip = self.bitcoin_rpc.tip_height().await?;

        let anchor = self
            .relay
            .retrieve_latest_known_block_log(
                self.bitcoin_rpc.as_ref(),
                cancel,
                Some(ANCHOR_MAX_PAGES),
            )
            .await?
            .ok_or(SyncError::NoSharedHeader)?;

        let start_height = anchor.header.block_height + 1;
        if u64::from(start_height) > bitcoin_tip {
            if anchor.commit_hash != state.tip_commit_hash {
                // The relay tip sits on a dead branch, but Bitcoin has not
                // produced the blocks needed to overtake it yet.
                warn!(
                    target: "bridge::sync",
                    relay_tip = state.block_height,
                    shared = anchor.header.block_height,
                    "relay tip not on bitcoin's best chain; waiting for new blocks"
                );
            }
            return Ok(None);
        }

        let wanted = usize::try_from(bitcoin_tip - u64::from(start_height) + 1)
            .unwrap_or(usize::MAX)
            .min(max_headers.max(1));
        let infos = self
            .bitcoin_rpc
            .headers_from(u64::from(start_height), wanted)
            .await?;
        if infos.is_empty() {
            return Ok(None);
        }
        let headers: Vec<Header> = infos.iter().map(|info| info.header).collect();
        let target_height = anchor.header.block_height + headers.len() as u32;

        let (submission, fork_id) = if anchor.commit_hash == state.tip_commit_hash {
            debug!(
                target: "bridge::sync",
                start = start_height,
                count = headers.len(),
                "extending main chain"
            );
            (
                self.relay
                    .save_main_headers(&anchor.header, &headers, fee_rate)?,
                None,
            )
        } else {
            let fork_id = state.fork_counter + 1;
            info!(
                target: "bridge::sync",
                fork_id,
                shared = anchor.header.block_height,
                relay_tip = state.block_height,
                "relay tip reorged away; submitting through a fork"
            );
            (
                self.relay.save_fork_headers(
                    fork_id,
                    &anchor.header,
                    &headers,
                    state.tip_work(),
                    fee_rate,
                )?,
                Some(fork_id),
            )
        };

        Ok(Some(SyncPlan {
            submission,
            start_height,
            target_height,
            fork_id,
        }))
    }

    /// Plan whatever is needed so `required_height` becomes provable, then
    /// hand back the projected entries the caller will claim against.
    pub async fn plan_for_height(
        &self,
        required_height: u32,
        fee_rate: &FeeRate,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<(SyncPlan, Vec<StoredHeader>)>, SyncError> {
        let plan = self.plan_to_tip(fee_rate, cancel, MAX_SYNC_HEADERS).await?;
        match plan {
            Some(plan) if plan.target_height >= required_height => {
                let computed = plan.submission.computed_headers.clone();
                Ok(Some((plan, computed)))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitcoin::{BlockHeaderInfo, MockBitcoinRpc};
    use crate::chain::events::PROGRAM_DATA_PREFIX;
    use crate::chain::rpc::{MockChainRpc, SignatureInfo};
    use crate::relay::header::testutil::{linked_chain, linked_header};
    use crate::relay::program::{event_tag, MainChainState, StoreHeaderEvent, COMMITMENT_WINDOW};
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use bitcoin::hashes::Hash;
    use bitcoin::BlockHash;
    use solana_sdk::account::Account;
    use solana_sdk::pubkey::Pubkey;
    use solana_sdk::signature::Signature;

    const BITS: u32 = 0x1d00_ffff;
    const T0: u32 = 1_600_000_000;

    fn seed_at(height: u32) -> StoredHeader {
        let header = linked_header(BlockHash::all_zeros(), T0, BITS, 1);
        StoredHeader::seed(header, height, T0, &[T0; 10]).unwrap()
    }

    fn state_for(seed: &StoredHeader, tip_commit: [u8; 32], fork_counter: u64) -> MainChainState {
        let mut commitments = [[0u8; 32]; COMMITMENT_WINDOW];
        commitments[seed.block_height as usize % COMMITMENT_WINDOW] = seed.commit_hash();
        MainChainState {
            start_height: seed.block_height,
            last_diff_adjustment: T0,
            block_height: seed.block_height,
            total_blocks: 1,
            fork_counter,
            tip_commit_hash: tip_commit,
            tip_block_hash: [2; 32],
            chain_work: seed.chain_work,
            block_commitments: commitments,
        }
    }

    fn chain_rpc_with(state: &MainChainState, seed: &StoredHeader) -> MockChainRpc {
        let account = Account {
            lamports: 1,
            data: state.to_account_bytes(),
            owner: Pubkey::new_unique(),
            executable: false,
            rent_epoch: 0,
        };
        let event = StoreHeaderEvent {
            commit_hash: seed.commit_hash(),
            block_hash: seed.block_hash_internal(),
            header: *seed,
        };
        let mut payload = vec![event_tag::STORE_HEADER];
        payload.extend(borsh::to_vec(&event).unwrap());
        let line = format!("{}{}", PROGRAM_DATA_PREFIX, BASE64.encode(payload));

        let mut rpc = MockChainRpc::new();
        rpc.expect_fetch_account()
            .returning(move |_, _| Ok(Some(account.clone())));
        rpc.expect_signatures_for_address().returning(|_, _, _| {
            Ok(vec![SignatureInfo {
                signature: Signature::from([3u8; 64]),
                slot: 10,
                err: false,
                block_time: None,
            }])
        });
        rpc.expect_transaction_logs()
            .returning(move |_| Ok(vec![line.clone()]));
        rpc
    }

    fn header_infos(seed: &StoredHeader, count: usize) -> Vec<BlockHeaderInfo> {
        linked_chain(&seed.header, count, BITS, T0)
            .into_iter()
            .enumerate()
            .map(|(i, header)| BlockHeaderInfo {
                height: u64::from(seed.block_height) + 1 + i as u64,
                hash: header.block_hash().to_string(),
                header,
            })
            .collect()
    }

    fn synchronizer(rpc: MockChainRpc, btc: MockBitcoinRpc) -> RelaySynchronizer {
        let relay = RelayClient::new(Arc::new(rpc), Pubkey::new_unique(), Pubkey::new_unique());
        RelaySynchronizer::new(Arc::new(relay), Arc::new(btc))
    }

    #[tokio::test]
    async fn test_plan_requires_initialized_relay() {
        let mut rpc = MockChainRpc::new();
        rpc.expect_fetch_account().returning(|_, _| Ok(None));
        let mut btc = MockBitcoinRpc::new();
        btc.expect_tip_height().never();

        let sync = synchronizer(rpc, btc);
        let err = sync
            .plan_to_tip(&FeeRate::new(0, 0), None, MAX_SYNC_HEADERS)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RelayUninitialized));
    }

    #[tokio::test]
    async fn test_up_to_date_plans_nothing() {
        let seed = seed_at(100_000);
        let state = state_for(&seed, seed.commit_hash(), 0);
        let rpc = chain_rpc_with(&state, &seed);

        let mut btc = MockBitcoinRpc::new();
        btc.expect_tip_height().returning(|| Ok(100_000));
        btc.expect_is_in_main_chain().returning(|_, _| Ok(true));
        btc.expect_headers_from().never();

        let sync = synchronizer(rpc, btc);
        let plan = sync
            .plan_to_tip(&FeeRate::new(0, 0), None, MAX_SYNC_HEADERS)
            .await
            .unwrap();
        assert!(plan.is_none());
    }

    #[tokio::test]
    async fn test_extends_main_chain_from_shared_tip() {
        let seed = seed_at(100_000);
        let state = state_for(&seed, seed.commit_hash(), 0);
        let rpc = chain_rpc_with(&state, &seed);
        let infos = header_infos(&seed, 3);

        let mut btc = MockBitcoinRpc::new();
        btc.expect_tip_height().returning(|| Ok(100_003));
        btc.expect_is_in_main_chain().returning(|_, _| Ok(true));
        btc.expect_headers_from()
            .withf(|start, count| *start == 100_001 && *count == 3)
            .returning(move |_, _| Ok(infos.clone()));

        let sync = synchronizer(rpc, btc);
        let plan = sync
            .plan_to_tip(&FeeRate::new(0, 0), None, MAX_SYNC_HEADERS)
            .await
            .unwrap()
            .expect("plan");

        assert_eq!(plan.start_height, 100_001);
        assert_eq!(plan.target_height, 100_003);
        assert!(plan.fork_id.is_none());
        assert_eq!(plan.submission.txs.len(), 1);
        assert_eq!(plan.submission.tip.block_height, 100_003);
    }

    // Plans ride inside Results that callers debug-format on failure
    #[test]
    fn test_sync_plan_debug_shows_height_range() {
        let seed = seed_at(100_000);
        let headers = linked_chain(&seed.header, 2, BITS, T0);
        let client = RelayClient::new(
            Arc::new(MockChainRpc::new()),
            Pubkey::new_unique(),
            Pubkey::new_unique(),
        );
        let submission = client
            .save_main_headers(&seed, &headers, &FeeRate::new(0, 0))
            .unwrap();

        let plan = SyncPlan {
            submission,
            start_height: 100_001,
            target_height: 100_002,
            fork_id: None,
        };
        let rendered = format!("{:?}", plan);
        assert!(rendered.contains("100001"));
        assert!(rendered.contains("100002"));
    }

    #[tokio::test]
    async fn test_reorged_tip_goes_through_new_fork() {
        let seed = seed_at(100_000);
        // Relay tip commitment differs from the shared ancestor: the chain
        // the relay followed was reorged away.
        let state = state_for(&seed, [7; 32], 3);
        let rpc = chain_rpc_with(&state, &seed);
        let infos = header_infos(&seed, 2);

        let mut btc = MockBitcoinRpc::new();
        btc.expect_tip_height().returning(|| Ok(100_002));
        btc.expect_is_in_main_chain().returning(|_, _| Ok(true));
        btc.expect_headers_from()
            .returning(move |_, _| Ok(infos.clone()));

        let sync = synchronizer(rpc, btc);
        let plan = sync
            .plan_to_tip(&FeeRate::new(0, 0), None, MAX_SYNC_HEADERS)
            .await
            .unwrap()
            .expect("plan");

        assert_eq!(plan.fork_id, Some(4));
        let data = &plan.submission.txs[0].transaction.message.instructions[0].data;
        assert_eq!(data[0], crate::relay::program::tag::SUBMIT_FORK);
        assert_eq!(data[1..9], 4u64.to_le_bytes());
    }

    #[tokio::test]
    async fn test_no_shared_header_is_an_error() {
        let seed = seed_at(100_000);
        let state = state_for(&seed, seed.commit_hash(), 0);
        let rpc = chain_rpc_with(&state, &seed);

        let mut btc = MockBitcoinRpc::new();
        btc.expect_tip_height().returning(|| Ok(100_010));
        // Every committed block has fallen off bitcoin's best chain.
        btc.expect_is_in_main_chain().returning(|_, _| Ok(false));

        let sync = synchronizer(rpc, btc);
        let err = sync
            .plan_to_tip(&FeeRate::new(0, 0), None, MAX_SYNC_HEADERS)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NoSharedHeader));
    }

    #[tokio::test]
    async fn test_pass_is_capped_by_max_headers() {
        let seed = seed_at(100_000);
        let state = state_for(&seed, seed.commit_hash(), 0);
        let rpc = chain_rpc_with(&state, &seed);
        let infos = header_infos(&seed, 5);

        let mut btc = MockBitcoinRpc::new();
        btc.expect_tip_height().returning(|| Ok(100_500));
        btc.expect_is_in_main_chain().returning(|_, _| Ok(true));
        btc.expect_headers_from()
            .withf(|start, count| *start == 100_001 && *count == 5)
            .returning(move |_, _| Ok(infos.clone()));

        let sync = synchronizer(rpc, btc);
        let plan = sync
            .plan_to_tip(&FeeRate::new(0, 0), None, 5)
            .await
            .unwrap()
            .expect("plan");
        assert_eq!(plan.target_height, 100_005);
    }

    #[tokio::test]
    async fn test_status_reports_lag() {
        let seed = seed_at(100_000);
        let state = state_for(&seed, seed.commit_hash(), 0);
        let rpc = chain_rpc_with(&state, &seed);

        let mut btc = MockBitcoinRpc::new();
        btc.expect_tip_height().returning(|| Ok(100_042));

        let sync = synchronizer(rpc, btc);
        let status = sync.status().await.unwrap();
        assert_eq!(status.relay_height, 100_000);
        assert_eq!(status.blocks_behind, 42);
    }

    #[tokio::test]
    async fn test_plan_for_height_requires_coverage() {
        let seed = seed_at(100_000);
        let state = state_for(&seed, seed.commit_hash(), 0);
        let rpc = chain_rpc_with(&state, &seed);
        let infos = header_infos(&seed, 3);

        let mut btc = MockBitcoinRpc::new();
        btc.expect_tip_height().returning(|| Ok(100_003));
        btc.expect_is_in_main_chain().returning(|_, _| Ok(true));
        btc.expect_headers_from()
            .returning(move |_, _| Ok(infos.clone()));

        let sync = synchronizer(rpc, btc);
        // Covered by the pass.
        let hit = sync
            .plan_for_height(100_002, &FeeRate::new(0, 0), None)
            .await
            .unwrap();
        assert!(hit.is_some());
    }
}
