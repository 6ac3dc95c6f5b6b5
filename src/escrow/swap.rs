//! Swap Escrow Model
//!
//! Value types for the escrow contract: the swap agreement itself, its
//! derived identifiers, and the expiry arithmetic both parties run locally.
//! Everything here is pure; account reads and transaction building live in
//! the protocol module.

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest, Sha256};
use solana_sdk::pubkey::Pubkey;

/// Expiry values below this are legacy blockheights; at or above, UNIX seconds
pub const BLOCKHEIGHT_EXPIRY_THRESHOLD: u64 = 500_000_000;

/// Claimer treats a swap as expired this many seconds early
pub const CLAIM_GRACE_PERIOD: u64 = 600;

/// Offerer treats a swap as refundable only this many seconds after expiry
pub const REFUND_GRACE_PERIOD: u64 = 600;

/// Offset subtracted from wall-clock seconds in replay-nonce derivation
const NONCE_TIME_OFFSET: u64 = 700_000_000;

/// How a claim is proven
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum SwapKind {
    /// Secret preimage reveal
    Htlc,
    /// Bitcoin transaction paying an expected output
    Chain,
    /// Chain payment bound to a client-derived replay nonce
    ChainNonced,
    /// Chain payment identified by an exact txid
    ChainTxid,
}

impl SwapKind {
    /// Whether claiming requires a relay-verified Bitcoin transaction
    pub fn uses_tx_proof(self) -> bool {
        !matches!(self, SwapKind::Htlc)
    }
}

/// Which side of the swap is asking a question
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Offerer,
    Claimer,
}

/// Lifecycle answer for a swap, as seen by one party
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    /// No live escrow for this swap
    NotCommitted,
    /// Escrow live and not yet expired from the asking party's perspective
    Committed,
    /// Live but expired for the claimer; claiming now risks racing a refund
    Expired,
    /// Claim succeeded; terminal
    Paid,
    /// Live and past expiry plus the offerer's grace; refund is safe
    Refundable,
}

/// Expiry encoding, disambiguated by [`BLOCKHEIGHT_EXPIRY_THRESHOLD`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryKind {
    /// Compared against the relay's main-chain height
    BlockHeight(u32),
    /// UNIX seconds
    Timestamp(u64),
}

/// The swap agreement, in the escrow account's wire layout.
///
/// `claim_hash` and `escrow_hash` are derived, never stored; the on-chain
/// account is trusted only after it compares equal to the locally
/// constructed value.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SwapEscrow {
    pub kind: SwapKind,
    /// Bitcoin confirmation depth required for tx-proof claims
    pub confirmations: u16,
    /// Claim-hash derivation input; replay nonce for `ChainNonced`
    pub nonce: u64,
    pub payment_hash: [u8; 32],
    /// Distinguishes re-attempts of the same logical payment
    pub sequence: u64,
    /// Offerer funds the escrow from their wallet at init
    pub pay_in: bool,
    /// Claim pays out to the claimer's wallet ATA rather than their vault
    pub pay_out: bool,
    pub offerer: Pubkey,
    pub offerer_ata: Pubkey,
    pub claimer: Pubkey,
    pub claimer_ata: Pubkey,
    /// Token mint
    pub token: Pubkey,
    pub amount: u64,
    /// Absolute timeout; see [`ExpiryKind`]
    pub expiry: u64,
    pub security_deposit: u64,
    pub claimer_bounty: u64,
    /// Output-binding commitment for on-chain payment kinds, zero otherwise
    pub txo_hash: [u8; 32],
}

impl SwapEscrow {
    /// `SHA-256(payment_hash ‖ nonce ‖ confirmations)`, the identifier a
    /// claim transaction must satisfy
    pub fn claim_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.payment_hash);
        hasher.update(self.nonce.to_le_bytes());
        hasher.update(self.confirmations.to_le_bytes());
        hasher.finalize().into()
    }

    /// `SHA-256(payment_hash ‖ sequence)`, distinguishing escrow attempts
    pub fn escrow_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.payment_hash);
        hasher.update(self.sequence.to_le_bytes());
        hasher.finalize().into()
    }

    pub fn expiry_kind(&self) -> ExpiryKind {
        if self.expiry < BLOCKHEIGHT_EXPIRY_THRESHOLD {
            ExpiryKind::BlockHeight(self.expiry as u32)
        } else {
            ExpiryKind::Timestamp(self.expiry)
        }
    }

    /// Party that submits and fee-pays the init transaction
    pub fn init_submitter(&self) -> Pubkey {
        if self.pay_in {
            self.offerer
        } else {
            self.claimer
        }
    }

    /// Counterparty whose detached signature authorizes the init
    pub fn init_authorizer(&self) -> Pubkey {
        if self.pay_in {
            self.claimer
        } else {
            self.offerer
        }
    }

    /// Whether the claimer should treat the swap as expired.
    ///
    /// The claimer's clock runs `CLAIM_GRACE_PERIOD` early: once the margin
    /// is gone, a revealed secret could race the refund window. An unknown
    /// relay height counts as expired for blockheight swaps, since the
    /// claimer cannot prove otherwise.
    pub fn expired_for_claimer(&self, now: u64, relay_height: Option<u32>) -> bool {
        match self.expiry_kind() {
            ExpiryKind::Timestamp(expiry) => now + CLAIM_GRACE_PERIOD >= expiry,
            ExpiryKind::BlockHeight(height) => match relay_height {
                Some(tip) => tip >= height,
                None => true,
            },
        }
    }

    /// Whether the offerer may refund.
    ///
    /// The offerer's clock runs `REFUND_GRACE_PERIOD` late so a refund never
    /// races a still-valid claim. An unknown relay height counts as not yet
    /// refundable.
    pub fn refundable_by_offerer(&self, now: u64, relay_height: Option<u32>) -> bool {
        match self.expiry_kind() {
            ExpiryKind::Timestamp(expiry) => now >= expiry + REFUND_GRACE_PERIOD,
            ExpiryKind::BlockHeight(height) => match relay_height {
                Some(tip) => tip >= height,
                None => false,
            },
        }
    }
}

/// Replay nonce for `ChainNonced` swaps: offset seconds in the top 40 bits,
/// 24 random bits below, so nonces are unique and roughly time-ordered.
pub fn derive_nonce(now: u64) -> u64 {
    let seconds = now.saturating_sub(NONCE_TIME_OFFSET);
    let random = u64::from(rand::random::<u32>()) & 0x00ff_ffff;
    (seconds << 24) | random
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// A timestamp-expiring HTLC swap with fixed keys
    pub fn htlc_swap(payment_hash: [u8; 32], expiry: u64) -> SwapEscrow {
        SwapEscrow {
            kind: SwapKind::Htlc,
            confirmations: 1,
            nonce: 0,
            payment_hash,
            sequence: 42,
            pay_in: false,
            pay_out: true,
            offerer: Pubkey::new_unique(),
            offerer_ata: Pubkey::new_unique(),
            claimer: Pubkey::new_unique(),
            claimer_ata: Pubkey::new_unique(),
            token: Pubkey::new_unique(),
            amount: 1_000_000,
            expiry,
            security_deposit: 10_000,
            claimer_bounty: 5_000,
            txo_hash: [0; 32],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::htlc_swap;
    use super::*;

    const T: u64 = 1_700_000_000;

    #[test]
    fn test_claim_hash_is_deterministic_and_input_sensitive() {
        let swap = htlc_swap([7; 32], T);
        assert_eq!(swap.claim_hash(), swap.claim_hash());

        let mut other = swap.clone();
        other.nonce += 1;
        assert_ne!(other.claim_hash(), swap.claim_hash());

        let mut other = swap.clone();
        other.confirmations += 1;
        assert_ne!(other.claim_hash(), swap.claim_hash());
    }

    #[test]
    fn test_escrow_hash_depends_on_sequence() {
        let swap = htlc_swap([7; 32], T);
        let mut other = swap.clone();
        other.sequence += 1;
        assert_ne!(other.escrow_hash(), swap.escrow_hash());
        // Claim hash ignores the sequence.
        assert_eq!(other.claim_hash(), swap.claim_hash());
    }

    #[test]
    fn test_wire_round_trip_preserves_hashes() {
        let swap = htlc_swap([9; 32], T);
        let bytes = borsh::to_vec(&swap).unwrap();
        let back = SwapEscrow::try_from_slice(&bytes).unwrap();
        assert_eq!(back, swap);
        assert_eq!(back.claim_hash(), swap.claim_hash());
        assert_eq!(back.escrow_hash(), swap.escrow_hash());
    }

    #[test]
    fn test_kind_wire_tags() {
        assert_eq!(borsh::to_vec(&SwapKind::Htlc).unwrap(), vec![0]);
        assert_eq!(borsh::to_vec(&SwapKind::Chain).unwrap(), vec![1]);
        assert_eq!(borsh::to_vec(&SwapKind::ChainNonced).unwrap(), vec![2]);
        assert_eq!(borsh::to_vec(&SwapKind::ChainTxid).unwrap(), vec![3]);
        assert!(!SwapKind::Htlc.uses_tx_proof());
        assert!(SwapKind::ChainTxid.uses_tx_proof());
    }

    #[test]
    fn test_expiry_threshold_disambiguation() {
        let swap = htlc_swap([1; 32], BLOCKHEIGHT_EXPIRY_THRESHOLD - 1);
        assert_eq!(
            swap.expiry_kind(),
            ExpiryKind::BlockHeight((BLOCKHEIGHT_EXPIRY_THRESHOLD - 1) as u32)
        );

        let swap = htlc_swap([1; 32], BLOCKHEIGHT_EXPIRY_THRESHOLD);
        assert_eq!(
            swap.expiry_kind(),
            ExpiryKind::Timestamp(BLOCKHEIGHT_EXPIRY_THRESHOLD)
        );
    }

    #[test]
    fn test_claimer_clock_runs_early() {
        let swap = htlc_swap([1; 32], T);
        assert!(!swap.expired_for_claimer(T - CLAIM_GRACE_PERIOD - 1, None));
        assert!(swap.expired_for_claimer(T - CLAIM_GRACE_PERIOD, None));
        assert!(swap.expired_for_claimer(T + 1, None));
    }

    #[test]
    fn test_offerer_clock_runs_late() {
        let swap = htlc_swap([1; 32], T);
        assert!(!swap.refundable_by_offerer(T - 1, None));
        assert!(!swap.refundable_by_offerer(T + REFUND_GRACE_PERIOD - 1, None));
        assert!(swap.refundable_by_offerer(T + REFUND_GRACE_PERIOD, None));
    }

    #[test]
    fn test_blockheight_expiry_compares_relay_tip() {
        let swap = htlc_swap([1; 32], 100_000);
        assert!(!swap.expired_for_claimer(T, Some(99_999)));
        assert!(swap.expired_for_claimer(T, Some(100_000)));
        assert!(!swap.refundable_by_offerer(T, Some(99_999)));
        assert!(swap.refundable_by_offerer(T, Some(100_000)));
    }

    #[test]
    fn test_unknown_relay_height_favors_safety() {
        let swap = htlc_swap([1; 32], 100_000);
        // Claimer refuses to risk the secret; offerer refuses to race a claim.
        assert!(swap.expired_for_claimer(T, None));
        assert!(!swap.refundable_by_offerer(T, None));
    }

    #[test]
    fn test_nonce_encodes_offset_seconds() {
        let now = 1_700_000_123;
        let nonce = derive_nonce(now);
        assert_eq!(nonce >> 24, now - 700_000_000);
    }
}
