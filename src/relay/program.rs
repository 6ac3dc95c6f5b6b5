//! Relay Program Interface
//!
//! Wire formats for the on-chain Bitcoin header relay: account layouts,
//! PDA derivations, instruction data, and the events the relay emits through
//! `Program data:` logs. Everything here is pure encoding; submission and
//! state reads live in the client.

use bitcoin::pow::Work;
use borsh::{BorshDeserialize, BorshSerialize};
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::system_program;

use crate::chain::events::RawEvent;

use super::header::{header_bytes, StoredHeader, RAW_HEADER_LEN};
use super::planner::{ForkTarget, HeaderBatch};

// ============================================================================
// Seeds, tags and sizes
// ============================================================================

/// Seed of the singleton main-chain state PDA
pub const RELAY_SEED: &[u8] = b"state";

/// Seed prefix of per-submitter fork state PDAs
pub const FORK_SEED: &[u8] = b"fork";

/// Discriminator prefix of the main-chain state account
pub const MAIN_STATE_TAG: [u8; 8] = *b"mainstat";

/// Discriminator prefix of fork state accounts
pub const FORK_STATE_TAG: [u8; 8] = *b"forkstat";

/// Recent block commitments kept on chain, keyed by `height % 250`
pub const COMMITMENT_WINDOW: usize = 250;

/// Instruction tags (first data byte)
pub mod tag {
    pub const INITIALIZE: u8 = 0;
    pub const SUBMIT_MAIN: u8 = 1;
    pub const SUBMIT_SHORT_FORK: u8 = 2;
    pub const SUBMIT_FORK: u8 = 3;
    pub const CLOSE_FORK: u8 = 4;
    pub const VERIFY_TRANSACTION: u8 = 5;
}

/// Event tags (first byte of `Program data:` payloads)
pub mod event_tag {
    pub const STORE_HEADER: u8 = 0;
    pub const STORE_FORK_HEADER: u8 = 1;
    pub const CHAIN_REORG: u8 = 2;
}

// ============================================================================
// Account layouts
// ============================================================================

/// Main-chain state account, borsh after [`MAIN_STATE_TAG`].
///
/// Read-only from this client; while assembling a batch the client advances
/// a local [`StoredHeader`] projection instead of re-reading this account.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct MainChainState {
    pub start_height: u32,
    pub last_diff_adjustment: u32,
    pub block_height: u32,
    pub total_blocks: u32,
    pub fork_counter: u64,
    pub tip_commit_hash: [u8; 32],
    pub tip_block_hash: [u8; 32],
    /// Accumulated work at the tip, big-endian 256-bit
    pub chain_work: [u8; 32],
    /// Ring of recent commitments, slot `height % 250`
    pub block_commitments: [[u8; 32]; COMMITMENT_WINDOW],
}

impl MainChainState {
    pub fn tip_work(&self) -> Work {
        Work::from_be_bytes(self.chain_work)
    }

    /// Lowest height still covered by the commitment ring
    pub fn window_floor(&self) -> u32 {
        self.block_height
            .saturating_sub(COMMITMENT_WINDOW as u32 - 1)
            .max(self.start_height)
    }

    /// Commitment stored for `height`, if the ring still covers it
    pub fn commitment_at(&self, height: u32) -> Option<[u8; 32]> {
        if height > self.block_height || height < self.window_floor() {
            return None;
        }
        Some(self.block_commitments[height as usize % COMMITMENT_WINDOW])
    }

    /// Whether `commit_hash` is the stored commitment for `height`
    pub fn has_commitment(&self, height: u32, commit_hash: &[u8; 32]) -> bool {
        self.commitment_at(height) == Some(*commit_hash)
    }

    /// Search the whole window for `commit_hash`, returning its height
    pub fn find_commitment(&self, commit_hash: &[u8; 32]) -> Option<u32> {
        (self.window_floor()..=self.block_height)
            .find(|h| self.block_commitments[*h as usize % COMMITMENT_WINDOW] == *commit_hash)
    }

    /// Decode from raw account data, checking the discriminator
    pub fn decode(data: &[u8]) -> Result<Self, borsh::io::Error> {
        decode_tagged(data, &MAIN_STATE_TAG)
    }

    /// Account bytes as the program writes them (discriminator + borsh)
    pub fn to_account_bytes(&self) -> Vec<u8> {
        encode_tagged(&MAIN_STATE_TAG, self)
    }
}

/// Per-submitter fork state account, borsh after [`FORK_STATE_TAG`]
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ForkState {
    pub fork_id: u64,
    pub start_height: u32,
    pub length: u32,
    pub tip_commit_hash: [u8; 32],
    pub tip_block_hash: [u8; 32],
    pub chain_work: [u8; 32],
}

impl ForkState {
    pub fn tip_work(&self) -> Work {
        Work::from_be_bytes(self.chain_work)
    }

    pub fn decode(data: &[u8]) -> Result<Self, borsh::io::Error> {
        decode_tagged(data, &FORK_STATE_TAG)
    }

    pub fn to_account_bytes(&self) -> Vec<u8> {
        encode_tagged(&FORK_STATE_TAG, self)
    }
}

fn decode_tagged<T: BorshDeserialize>(
    data: &[u8],
    expected_tag: &[u8; 8],
) -> Result<T, borsh::io::Error> {
    if data.len() < 8 || &data[..8] != expected_tag {
        return Err(borsh::io::Error::new(
            borsh::io::ErrorKind::InvalidData,
            "account discriminator mismatch",
        ));
    }
    T::try_from_slice(&data[8..])
}

fn encode_tagged<T: BorshSerialize>(tag: &[u8; 8], value: &T) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(tag);
    out.extend_from_slice(&borsh::to_vec(value).unwrap_or_default());
    out
}

// ============================================================================
// Instruction data
// ============================================================================

/// Header submission payload: the projected entry the first header builds on
/// (the program checks its commitment against the ring before applying) plus
/// the raw 80-byte headers.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SubmitHeadersData {
    pub parent: StoredHeader,
    pub raw_headers: Vec<[u8; RAW_HEADER_LEN]>,
}

impl SubmitHeadersData {
    pub fn from_batch(batch: &HeaderBatch) -> Self {
        Self {
            parent: batch.parent,
            raw_headers: batch.headers.iter().map(header_bytes).collect(),
        }
    }
}

/// Merkle verification payload, consumed at transaction position 0
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct VerifyData {
    /// Txid in internal (reversed display) byte order
    pub reversed_txid: [u8; 32],
    pub confirmations: u32,
    /// Index of the transaction within its block
    pub tx_index: u32,
    /// Sibling hashes leaf-to-root, internal byte order
    pub reversed_merkle_proof: Vec<[u8; 32]>,
    pub committed_header: StoredHeader,
}

fn instruction_data<T: BorshSerialize>(tag: u8, payload: &T) -> Vec<u8> {
    let mut data = vec![tag];
    data.extend_from_slice(&borsh::to_vec(payload).unwrap_or_default());
    data
}

// ============================================================================
// Instruction builders
// ============================================================================

/// Address book and instruction factory for one deployed relay program
#[derive(Debug, Clone)]
pub struct RelayProgram {
    pub program_id: Pubkey,
}

impl RelayProgram {
    pub fn new(program_id: Pubkey) -> Self {
        Self { program_id }
    }

    /// Singleton main-chain state PDA
    pub fn state_address(&self) -> Pubkey {
        Pubkey::find_program_address(&[RELAY_SEED], &self.program_id).0
    }

    /// Fork state PDA for `(fork_id, submitter)`
    pub fn fork_address(&self, fork_id: u64, submitter: &Pubkey) -> Pubkey {
        Pubkey::find_program_address(
            &[FORK_SEED, &fork_id.to_le_bytes(), submitter.as_ref()],
            &self.program_id,
        )
        .0
    }

    /// Seed the relay with its first committed header
    pub fn initialize(&self, submitter: &Pubkey, seed: &StoredHeader) -> Instruction {
        Instruction {
            program_id: self.program_id,
            accounts: vec![
                AccountMeta::new(self.state_address(), false),
                AccountMeta::new(*submitter, true),
                AccountMeta::new_readonly(system_program::ID, false),
            ],
            data: instruction_data(tag::INITIALIZE, seed),
        }
    }

    /// Submission instruction for one planned batch, dispatched on its target
    pub fn submit_batch(&self, submitter: &Pubkey, batch: &HeaderBatch) -> Instruction {
        let payload = SubmitHeadersData::from_batch(batch);
        match batch.target {
            ForkTarget::Main => Instruction {
                program_id: self.program_id,
                accounts: vec![
                    AccountMeta::new(self.state_address(), false),
                    AccountMeta::new(*submitter, true),
                ],
                data: instruction_data(tag::SUBMIT_MAIN, &payload),
            },
            ForkTarget::Short => Instruction {
                program_id: self.program_id,
                accounts: vec![
                    AccountMeta::new(self.state_address(), false),
                    AccountMeta::new(*submitter, true),
                ],
                data: instruction_data(tag::SUBMIT_SHORT_FORK, &payload),
            },
            ForkTarget::Fork(fork_id) => {
                let mut data = vec![tag::SUBMIT_FORK];
                data.extend_from_slice(&fork_id.to_le_bytes());
                data.extend_from_slice(&borsh::to_vec(&payload).unwrap_or_default());
                Instruction {
                    program_id: self.program_id,
                    accounts: vec![
                        AccountMeta::new(self.state_address(), false),
                        AccountMeta::new(self.fork_address(fork_id, submitter), false),
                        AccountMeta::new(*submitter, true),
                        AccountMeta::new_readonly(system_program::ID, false),
                    ],
                    data,
                }
            }
        }
    }

    /// Close one fork state account, returning rent to the submitter
    pub fn close_fork(&self, submitter: &Pubkey, fork_id: u64) -> Instruction {
        let mut data = vec![tag::CLOSE_FORK];
        data.extend_from_slice(&fork_id.to_le_bytes());
        Instruction {
            program_id: self.program_id,
            accounts: vec![
                AccountMeta::new(self.fork_address(fork_id, submitter), false),
                AccountMeta::new(*submitter, true),
            ],
            data,
        }
    }

    /// Merkle inclusion verification against a committed header.
    ///
    /// The program requires this instruction at position 0 of its
    /// transaction; the claim builder enforces that.
    pub fn verify_transaction(&self, data: &VerifyData) -> Instruction {
        Instruction {
            program_id: self.program_id,
            accounts: vec![AccountMeta::new_readonly(self.state_address(), false)],
            data: instruction_data(tag::VERIFY_TRANSACTION, data),
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Emitted for every header appended to the main chain
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct StoreHeaderEvent {
    pub commit_hash: [u8; 32],
    pub block_hash: [u8; 32],
    pub header: StoredHeader,
}

/// Emitted for every header appended to a tracked fork
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct StoreForkHeaderEvent {
    pub fork_id: u64,
    pub commit_hash: [u8; 32],
    pub block_hash: [u8; 32],
    pub header: StoredHeader,
}

/// Emitted when a fork overtakes and replaces the main chain
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ChainReorgEvent {
    pub fork_id: u64,
    /// First height rewritten by the reorg
    pub start_height: u32,
    pub tip_commit_hash: [u8; 32],
    pub tip_block_hash: [u8; 32],
}

/// A header commitment recovered from the event history
#[derive(Debug, Clone, Copy)]
pub struct CommittedLog {
    pub commit_hash: [u8; 32],
    pub block_hash: [u8; 32],
    pub header: StoredHeader,
}

#[derive(Debug, Clone)]
pub enum RelayEvent {
    StoreHeader(StoreHeaderEvent),
    StoreForkHeader(StoreForkHeaderEvent),
    ChainReorg(ChainReorgEvent),
}

impl RelayEvent {
    /// Decode a raw scanner event; unknown tags belong to other programs
    /// and are skipped.
    pub fn parse(raw: &RawEvent) -> Option<Self> {
        match raw.tag {
            event_tag::STORE_HEADER => StoreHeaderEvent::try_from_slice(&raw.data)
                .ok()
                .map(Self::StoreHeader),
            event_tag::STORE_FORK_HEADER => StoreForkHeaderEvent::try_from_slice(&raw.data)
                .ok()
                .map(Self::StoreForkHeader),
            event_tag::CHAIN_REORG => ChainReorgEvent::try_from_slice(&raw.data)
                .ok()
                .map(Self::ChainReorg),
            _ => None,
        }
    }

    /// The commitment carried by store-header events (either chain; fork
    /// entries can become canonical after a reorg, callers re-check the
    /// window).
    pub fn committed_log(&self) -> Option<CommittedLog> {
        match self {
            RelayEvent::StoreHeader(e) => Some(CommittedLog {
                commit_hash: e.commit_hash,
                block_hash: e.block_hash,
                header: e.header,
            }),
            RelayEvent::StoreForkHeader(e) => Some(CommittedLog {
                commit_hash: e.commit_hash,
                block_hash: e.block_hash,
                header: e.header,
            }),
            RelayEvent::ChainReorg(_) => None,
        }
    }
}
