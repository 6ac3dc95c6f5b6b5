//! Fee Estimation Boundary
//!
//! A `FeeRate` captures everything that changes the byte content of a
//! transaction: the compute unit price, a flat fee, an optional wrap-SOL
//! step, and an optional bribe transfer. Both sides of an init
//! authorization must derive the identical transaction from the same fee
//! rate, so the string encoding is canonical and order-fixed.

use async_trait::async_trait;
use solana_sdk::compute_budget::ComputeBudgetInstruction;
use solana_sdk::instruction::Instruction;
use solana_sdk::pubkey::Pubkey;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Base network fee per signature in lamports
pub const LAMPORTS_PER_SIGNATURE: u64 = 5_000;

#[derive(Debug, Error)]
pub enum FeeError {
    #[error("malformed fee rate: {0}")]
    Malformed(String),

    #[error("fee estimation failed: {0}")]
    Estimation(String),
}

/// Wrap native SOL into the token account before the main instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrapInfo {
    /// Lamports to wrap
    pub amount: u64,
}

/// Out-of-band payment appended after the main instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BribeInfo {
    pub address: Pubkey,
    pub amount: u64,
}

/// Canonical fee description for one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeRate {
    /// Compute unit price in micro-lamports (0 disables the priority fee)
    pub base_fee: u64,
    /// Flat lamport fee folded into estimates
    pub static_fee: u64,
    pub wrap: Option<WrapInfo>,
    pub bribe: Option<BribeInfo>,
}

impl FeeRate {
    pub fn new(base_fee: u64, static_fee: u64) -> Self {
        Self {
            base_fee,
            static_fee,
            wrap: None,
            bribe: None,
        }
    }

    pub fn with_wrap(mut self, amount: u64) -> Self {
        self.wrap = Some(WrapInfo { amount });
        self
    }

    pub fn with_bribe(mut self, address: Pubkey, amount: u64) -> Self {
        self.bribe = Some(BribeInfo { address, amount });
        self
    }

    /// Compute budget instructions derived from this rate.
    ///
    /// Presence depends only on the rate, never on the caller, so signer and
    /// verifier stay in byte agreement.
    pub fn priority_instructions(&self) -> Vec<Instruction> {
        if self.base_fee == 0 {
            return Vec::new();
        }
        vec![ComputeBudgetInstruction::set_compute_unit_price(
            self.base_fee,
        )]
    }

    /// Estimated total lamport cost of one transaction at this rate
    pub fn tx_fee_lamports(&self, compute_units: u64) -> u64 {
        let priority = self.base_fee.saturating_mul(compute_units) / 1_000_000;
        LAMPORTS_PER_SIGNATURE + self.static_fee + priority
    }
}

impl fmt::Display for FeeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{}", self.base_fee, self.static_fee)?;
        if let Some(wrap) = &self.wrap {
            write!(f, ";W{}", wrap.amount)?;
        }
        if let Some(bribe) = &self.bribe {
            write!(f, ";B{}:{}", bribe.address, bribe.amount)?;
        }
        Ok(())
    }
}

impl FromStr for FeeRate {
    type Err = FeeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(';');
        let base_fee = parts
            .next()
            .ok_or_else(|| FeeError::Malformed("empty".to_string()))?
            .parse::<u64>()
            .map_err(|e| FeeError::Malformed(format!("base fee: {}", e)))?;
        let static_fee = parts
            .next()
            .ok_or_else(|| FeeError::Malformed("missing static fee".to_string()))?
            .parse::<u64>()
            .map_err(|e| FeeError::Malformed(format!("static fee: {}", e)))?;

        // The tail components come off the wire; reject rather than index
        // into arbitrary bytes.
        let mut rate = FeeRate::new(base_fee, static_fee);
        for part in parts {
            if let Some(amount) = part.strip_prefix('W') {
                let amount = amount
                    .parse::<u64>()
                    .map_err(|e| FeeError::Malformed(format!("wrap amount: {}", e)))?;
                rate.wrap = Some(WrapInfo { amount });
            } else if let Some(rest) = part.strip_prefix('B') {
                let (address, amount) = rest
                    .split_once(':')
                    .ok_or_else(|| FeeError::Malformed("bribe missing amount".to_string()))?;
                let address = Pubkey::from_str(address)
                    .map_err(|e| FeeError::Malformed(format!("bribe address: {}", e)))?;
                let amount = amount
                    .parse::<u64>()
                    .map_err(|e| FeeError::Malformed(format!("bribe amount: {}", e)))?;
                rate.bribe = Some(BribeInfo { address, amount });
            } else {
                return Err(FeeError::Malformed(format!("unknown component: {}", part)));
            }
        }
        Ok(rate)
    }
}

/// Fee estimation interface
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeeEstimator: Send + Sync {
    /// Fee rate for a transaction touching the given writable accounts
    async fn fee_rate(&self, writable_accounts: &[Pubkey]) -> Result<FeeRate, FeeError>;
}

/// Fixed-rate estimator configured at startup
pub struct StaticFeeEstimator {
    rate: FeeRate,
}

impl StaticFeeEstimator {
    pub fn new(base_fee: u64, static_fee: u64) -> Self {
        Self {
            rate: FeeRate::new(base_fee, static_fee),
        }
    }
}

#[async_trait]
impl FeeEstimator for StaticFeeEstimator {
    async fn fee_rate(&self, _writable_accounts: &[Pubkey]) -> Result<FeeRate, FeeError> {
        Ok(self.rate)
    }
}
