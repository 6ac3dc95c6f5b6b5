//! Authorization Codec
//!
//! Detached counterparty authorizations for swap transitions. A refund is
//! authorized by a prefixed, SHA-256 hashed message under a detached Ed25519
//! signature. An init is authorized by signing the exact transaction the
//! submitter will send, bound to a recent slot's blockhash for replay
//! protection and transported as `<slot>;<hex signature>`.

use std::sync::Arc;
use std::time::Instant;

use sha2::{Digest, Sha256};
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature};
use solana_sdk::signer::Signer;
use solana_sdk::system_instruction;
use solana_sdk::transaction::Transaction;
use thiserror::Error;

use crate::chain::fees::FeeRate;
use crate::chain::rpc::{BlockRef, ChainRpc, Commitment, RpcError};

use super::program::{wrap_instructions, EscrowProgram};
use super::swap::SwapEscrow;
use super::unix_now;

/// Minimum seconds an authorization's timeout must still have at verify time
pub const AUTH_GRACE_PERIOD: u64 = 300;

/// Slots a blockhash stays valid for transaction inclusion
pub const TX_SLOT_VALIDITY: u64 = 151;

/// Safety margin subtracted from the slot window at verification
pub const SIGNATURE_SLOT_BUFFER: u64 = 20;

/// Assumed slot duration when converting slots to wall-clock time
pub const SLOT_TIME_MS: u64 = 400;

/// Refund messages are domain-separated by this prefix
pub const REFUND_PREFIX: &str = "refund";

/// Init domain markers; the two variants build different transactions, so
/// the prefix only routes which one gets rebuilt at verification
pub const INIT_PAY_IN_PREFIX: &str = "claim_initialize";
pub const INIT_PAY_OUT_PREFIX: &str = "initialize";

/// How long a prefetched slot/block snapshot may be reused
const PREFETCH_VALIDITY_MS: u128 = 5_000;

/// Skipped slots have no block; walk back at most this far
const BLOCK_WALK_BACK: u64 = 5;

#[derive(Debug, Error)]
pub enum AuthorizationError {
    #[error("rpc: {0}")]
    Rpc(#[from] RpcError),

    #[error("wrong authorization prefix {got:?}, expected {expected:?}")]
    WrongPrefix { got: String, expected: &'static str },

    #[error("authorization timeout {timeout} leaves less than the grace period")]
    GraceExpired { timeout: u64 },

    #[error("signature slot window closed: signed at {signed_slot}, chain at {current_slot}")]
    SlotWindowExpired { signed_slot: u64, current_slot: u64 },

    #[error("no block available at or shortly before slot {0}")]
    BlockUnavailable(u64),

    #[error("signature does not verify against {signer}")]
    SignatureMismatch { signer: Pubkey },

    #[error("malformed authorization: {0}")]
    Malformed(String),
}

impl AuthorizationError {
    pub fn is_retryable(&self) -> bool {
        match self {
            AuthorizationError::Rpc(e) => e.is_retryable(),
            AuthorizationError::BlockUnavailable(_) => true,
            _ => false,
        }
    }
}

/// Claimer-signed permission for an early refund
#[derive(Debug, Clone)]
pub struct RefundAuthorization {
    /// Domain marker; must be [`REFUND_PREFIX`]
    pub prefix: String,
    /// Wall-clock expiry of the authorization itself
    pub timeout: u64,
    pub signature: Signature,
}

/// Counterparty transaction signature for init, bound to a recent slot
#[derive(Debug, Clone)]
pub struct InitAuthorization {
    /// Domain marker; one of the init prefixes
    pub prefix: String,
    /// Wall-clock expiry of the authorization itself
    pub timeout: u64,
    /// Slot whose blockhash the signed transaction pins
    pub slot: u64,
    pub signature: Signature,
}

impl InitAuthorization {
    /// Wire form of the slot/signature pair
    pub fn encode_signature(&self) -> String {
        format!("{};{}", self.slot, hex::encode(self.signature.as_ref()))
    }

    /// Parse the `<slot>;<hex signature>` wire form
    pub fn decode(
        prefix: impl Into<String>,
        timeout: u64,
        wire: &str,
    ) -> Result<Self, AuthorizationError> {
        let (slot, sig_hex) = wire
            .split_once(';')
            .ok_or_else(|| AuthorizationError::Malformed("expected <slot>;<hex>".to_string()))?;
        let slot = slot
            .parse::<u64>()
            .map_err(|e| AuthorizationError::Malformed(format!("slot: {}", e)))?;
        let bytes = hex::decode(sig_hex)
            .map_err(|e| AuthorizationError::Malformed(format!("signature hex: {}", e)))?;
        let signature = Signature::try_from(bytes.as_slice())
            .map_err(|_| AuthorizationError::Malformed("signature must be 64 bytes".to_string()))?;
        Ok(Self {
            prefix: prefix.into(),
            timeout,
            slot,
            signature,
        })
    }
}

/// Init prefix for the given swap's funding direction
pub fn init_prefix(swap: &SwapEscrow) -> &'static str {
    if swap.pay_in {
        INIT_PAY_IN_PREFIX
    } else {
        INIT_PAY_OUT_PREFIX
    }
}

/// Cached slot/block snapshot, reusable across one quote/verify exchange.
///
/// Staleness forces a refetch; the cache can shave round-trips but never
/// extend an authorization past its real window.
#[derive(Debug, Clone)]
pub struct AuthPrefetch {
    pub slot: u64,
    pub block: BlockRef,
    fetched_at: Instant,
}

impl AuthPrefetch {
    pub fn is_fresh(&self) -> bool {
        self.fetched_at.elapsed().as_millis() < PREFETCH_VALIDITY_MS
    }
}

/// Builds and validates swap authorizations
pub struct AuthorizationCodec {
    rpc: Arc<dyn ChainRpc>,
    program: EscrowProgram,
}

impl AuthorizationCodec {
    pub fn new(rpc: Arc<dyn ChainRpc>, program: EscrowProgram) -> Self {
        Self { rpc, program }
    }

    // ========================================================================
    // Refund authorization
    // ========================================================================

    /// Canonical refund message bytes
    pub fn refund_message(swap: &SwapEscrow, timeout: u64) -> Vec<u8> {
        let mut msg = Vec::with_capacity(REFUND_PREFIX.len() + 64);
        msg.extend_from_slice(REFUND_PREFIX.as_bytes());
        msg.extend_from_slice(&swap.amount.to_le_bytes());
        msg.extend_from_slice(&swap.expiry.to_le_bytes());
        msg.extend_from_slice(&swap.sequence.to_le_bytes());
        msg.extend_from_slice(&swap.payment_hash);
        msg.extend_from_slice(&timeout.to_le_bytes());
        msg
    }

    /// SHA-256 digest the refund signature actually covers
    pub fn refund_digest(swap: &SwapEscrow, timeout: u64) -> [u8; 32] {
        Sha256::digest(Self::refund_message(swap, timeout)).into()
    }

    /// Sign an early-refund permission as the claimer
    pub fn sign_refund(swap: &SwapEscrow, timeout: u64, claimer: &Keypair) -> RefundAuthorization {
        let digest = Self::refund_digest(swap, timeout);
        RefundAuthorization {
            prefix: REFUND_PREFIX.to_string(),
            timeout,
            signature: claimer.sign_message(&digest),
        }
    }

    /// Validate a refund authorization against the swap's claimer key.
    ///
    /// Rejects when the timeout leaves less than [`AUTH_GRACE_PERIOD`]; a
    /// nearly expired authorization is not worth submitting.
    pub fn verify_refund(
        swap: &SwapEscrow,
        auth: &RefundAuthorization,
    ) -> Result<(), AuthorizationError> {
        if auth.prefix != REFUND_PREFIX {
            return Err(AuthorizationError::WrongPrefix {
                got: auth.prefix.clone(),
                expected: REFUND_PREFIX,
            });
        }
        if auth.timeout.saturating_sub(unix_now()) < AUTH_GRACE_PERIOD {
            return Err(AuthorizationError::GraceExpired {
                timeout: auth.timeout,
            });
        }
        let digest = Self::refund_digest(swap, auth.timeout);
        if !auth.signature.verify(swap.claimer.as_ref(), &digest) {
            return Err(AuthorizationError::SignatureMismatch {
                signer: swap.claimer,
            });
        }
        Ok(())
    }

    // ========================================================================
    // Init authorization
    // ========================================================================

    /// The exact init transaction both parties must derive.
    ///
    /// Instruction order is fixed: priority fee, optional wrap, init,
    /// optional bribe. Wrap and bribe presence come from the fee rate alone,
    /// so signer and verifier stay byte-identical.
    pub fn build_init_transaction(
        &self,
        swap: &SwapEscrow,
        fee_rate: &FeeRate,
        blockhash: Hash,
    ) -> Transaction {
        let payer = swap.init_submitter();
        let mut instructions = fee_rate.priority_instructions();
        if let Some(wrap) = fee_rate.wrap {
            instructions.extend(wrap_instructions(&payer, wrap.amount));
        }
        instructions.push(self.program.initialize(swap));
        if let Some(bribe) = fee_rate.bribe {
            instructions.push(system_instruction::transfer(
                &payer,
                &bribe.address,
                bribe.amount,
            ));
        }
        let mut tx = Transaction::new_with_payer(&instructions, Some(&payer));
        tx.message.recent_blockhash = blockhash;
        tx
    }

    /// Fetch a fresh slot/block snapshot for init signing
    pub async fn prefetch(&self) -> Result<AuthPrefetch, AuthorizationError> {
        let slot = self.rpc.current_slot(Commitment::Processed).await?;
        let (slot, block) = self.block_near(slot).await?;
        Ok(AuthPrefetch {
            slot,
            block,
            fetched_at: Instant::now(),
        })
    }

    /// Authorize an init as the counterparty, pinning the current slot
    pub async fn sign_init(
        &self,
        swap: &SwapEscrow,
        fee_rate: &FeeRate,
        timeout: u64,
        authorizer: &Keypair,
        prefetch: Option<&AuthPrefetch>,
    ) -> Result<InitAuthorization, AuthorizationError> {
        let snapshot = match prefetch {
            Some(p) if p.is_fresh() => p.clone(),
            _ => self.prefetch().await?,
        };
        let tx = self.build_init_transaction(swap, fee_rate, snapshot.block.blockhash);
        let signature = authorizer.sign_message(&tx.message_data());
        Ok(InitAuthorization {
            prefix: init_prefix(swap).to_string(),
            timeout,
            slot: snapshot.slot,
            signature,
        })
    }

    /// Validate an init authorization and return the rebuilt transaction
    /// with the counterparty signature installed.
    ///
    /// The caller still signs as fee payer at submission. Rejected when the
    /// prefix is wrong, the timeout leaves less than the grace period, the
    /// slot window (minus [`SIGNATURE_SLOT_BUFFER`]) has closed, or the
    /// signature does not cover the rebuilt message.
    pub async fn verify_init(
        &self,
        swap: &SwapEscrow,
        fee_rate: &FeeRate,
        auth: &InitAuthorization,
        prefetch: Option<&AuthPrefetch>,
    ) -> Result<Transaction, AuthorizationError> {
        let expected = init_prefix(swap);
        if auth.prefix != expected {
            return Err(AuthorizationError::WrongPrefix {
                got: auth.prefix.clone(),
                expected,
            });
        }
        if auth.timeout.saturating_sub(unix_now()) < AUTH_GRACE_PERIOD {
            return Err(AuthorizationError::GraceExpired {
                timeout: auth.timeout,
            });
        }

        let current_slot = match prefetch {
            Some(p) if p.is_fresh() => p.slot,
            _ => self.rpc.current_slot(Commitment::Processed).await?,
        };
        // auth.slot comes off the wire; saturate instead of trusting it
        if auth.slot.saturating_add(TX_SLOT_VALIDITY) < current_slot + SIGNATURE_SLOT_BUFFER {
            return Err(AuthorizationError::SlotWindowExpired {
                signed_slot: auth.slot,
                current_slot,
            });
        }

        let block = match prefetch {
            Some(p) if p.is_fresh() && p.slot == auth.slot => p.block,
            _ => self.rpc.block_ref(auth.slot).await.map_err(|e| match e {
                RpcError::BlockNotAvailable(s) => AuthorizationError::BlockUnavailable(s),
                other => AuthorizationError::Rpc(other),
            })?,
        };

        let mut tx = self.build_init_transaction(swap, fee_rate, block.blockhash);
        let message = tx.message_data();
        let authorizer = swap.init_authorizer();
        if !auth.signature.verify(authorizer.as_ref(), &message) {
            return Err(AuthorizationError::SignatureMismatch { signer: authorizer });
        }

        let required = tx.message.header.num_required_signatures as usize;
        let position = tx.message.account_keys[..required]
            .iter()
            .position(|key| *key == authorizer)
            .ok_or_else(|| {
                AuthorizationError::Malformed(
                    "counterparty is not a required signer of the init transaction".to_string(),
                )
            })?;
        tx.signatures[position] = auth.signature;
        Ok(tx)
    }

    /// Binding expiry of an init authorization in UNIX seconds: whichever
    /// of the slot window and the stated timeout closes first
    pub async fn init_authorization_expiry(
        &self,
        auth: &InitAuthorization,
    ) -> Result<u64, AuthorizationError> {
        let current_slot = self.rpc.current_slot(Commitment::Processed).await?;
        let slots_left = auth
            .slot
            .saturating_add(TX_SLOT_VALIDITY)
            .saturating_sub(current_slot + SIGNATURE_SLOT_BUFFER);
        let slot_expiry = unix_now().saturating_add(slots_left.saturating_mul(SLOT_TIME_MS) / 1_000);
        Ok(slot_expiry.min(auth.timeout))
    }

    /// Hard expiry check against the finalized slot, immune to transient
    /// reorg wobble at lower commitments
    pub async fn is_init_authorization_expired(
        &self,
        auth: &InitAuthorization,
    ) -> Result<bool, AuthorizationError> {
        if unix_now() >= auth.timeout {
            return Ok(true);
        }
        let finalized = self.rpc.current_slot(Commitment::Finalized).await?;
        Ok(auth.slot.saturating_add(TX_SLOT_VALIDITY) < finalized)
    }

    async fn block_near(&self, start: u64) -> Result<(u64, BlockRef), AuthorizationError> {
        let mut slot = start;
        for _ in 0..=BLOCK_WALK_BACK {
            match self.rpc.block_ref(slot).await {
                Ok(block) => return Ok((slot, block)),
                Err(RpcError::BlockNotAvailable(_)) if slot > 0 => slot -= 1,
                Err(e) => return Err(e.into()),
            }
        }
        Err(AuthorizationError::BlockUnavailable(start))
    }
}
