//! Escrow Program Interface
//!
//! Wire formats for the on-chain swap escrow: account layout, PDA and
//! seeded-account derivations, instruction data, SPL token plumbing, and the
//! events the program emits through `Program data:` logs.

use borsh::{BorshDeserialize, BorshSerialize};
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey;
use solana_sdk::pubkey::{Pubkey, PubkeyError};
use solana_sdk::signature::Signature;
use solana_sdk::system_instruction;
use solana_sdk::system_program;

use crate::chain::events::RawEvent;

use super::swap::SwapEscrow;

// ============================================================================
// Programs, seeds, tags and sizes
// ============================================================================

pub const TOKEN_PROGRAM_ID: Pubkey = pubkey!("TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA");

pub const ATA_PROGRAM_ID: Pubkey = pubkey!("ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL");

/// Wrapped SOL mint; swaps in native SOL wrap into this
pub const WSOL_MINT: Pubkey = pubkey!("So11111111111111111111111111111111111111112");

/// Seed prefix of per-payment-hash escrow state PDAs
pub const ESCROW_SEED: &[u8] = b"state";

/// Seed prefix of the program's per-mint token vault PDAs
pub const VAULT_SEED: &[u8] = b"vault";

/// Seed prefix of per-user internal balance PDAs
pub const USER_VAULT_SEED: &[u8] = b"uservault";

/// Discriminator prefix of escrow state accounts
pub const ESCROW_ACCOUNT_TAG: [u8; 8] = *b"swapescr";

/// Max bytes per `write_data` instruction, bounded by the transaction size
pub const DATA_CHUNK_SIZE: usize = 800;

/// Instruction tags (first data byte)
pub mod tag {
    pub const INITIALIZE_PAY_IN: u8 = 0;
    pub const INITIALIZE: u8 = 1;
    pub const CLAIM_SECRET: u8 = 2;
    pub const CLAIM_TX_DATA: u8 = 3;
    pub const REFUND: u8 = 4;
    pub const REFUND_SIGNED: u8 = 5;
    pub const WRITE_DATA: u8 = 6;
    pub const CLOSE_DATA: u8 = 7;
}

/// Event tags (first byte of `Program data:` payloads)
pub mod event_tag {
    pub const INITIALIZE: u8 = 0;
    pub const CLAIM: u8 = 1;
    pub const REFUND: u8 = 2;
}

// ============================================================================
// Account layout
// ============================================================================

/// Decode an escrow state account, checking the discriminator
pub fn decode_escrow_account(data: &[u8]) -> Result<SwapEscrow, borsh::io::Error> {
    if data.len() < 8 || data[..8] != ESCROW_ACCOUNT_TAG {
        return Err(borsh::io::Error::new(
            borsh::io::ErrorKind::InvalidData,
            "account discriminator mismatch",
        ));
    }
    SwapEscrow::try_from_slice(&data[8..])
}

/// Account bytes as the program writes them (discriminator + borsh)
pub fn encode_escrow_account(swap: &SwapEscrow) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&ESCROW_ACCOUNT_TAG);
    out.extend_from_slice(&borsh::to_vec(swap).unwrap_or_default());
    out
}

// ============================================================================
// SPL token plumbing
// ============================================================================

/// Associated token account of `owner` for `mint`
pub fn get_ata(owner: &Pubkey, mint: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(
        &[owner.as_ref(), TOKEN_PROGRAM_ID.as_ref(), mint.as_ref()],
        &ATA_PROGRAM_ID,
    )
    .0
}

/// ATA `CreateIdempotent`; a no-op when the account already exists
pub fn create_ata_idempotent(payer: &Pubkey, owner: &Pubkey, mint: &Pubkey) -> Instruction {
    Instruction {
        program_id: ATA_PROGRAM_ID,
        accounts: vec![
            AccountMeta::new(*payer, true),
            AccountMeta::new(get_ata(owner, mint), false),
            AccountMeta::new_readonly(*owner, false),
            AccountMeta::new_readonly(*mint, false),
            AccountMeta::new_readonly(system_program::ID, false),
            AccountMeta::new_readonly(TOKEN_PROGRAM_ID, false),
        ],
        data: vec![1],
    }
}

/// SPL `SyncNative`, folding transferred lamports into a WSOL balance
pub fn sync_native(ata: &Pubkey) -> Instruction {
    Instruction {
        program_id: TOKEN_PROGRAM_ID,
        accounts: vec![AccountMeta::new(*ata, false)],
        data: vec![17],
    }
}

/// Wrap `lamports` of native SOL into the payer's WSOL ATA
pub fn wrap_instructions(payer: &Pubkey, lamports: u64) -> Vec<Instruction> {
    let ata = get_ata(payer, &WSOL_MINT);
    vec![
        create_ata_idempotent(payer, payer, &WSOL_MINT),
        system_instruction::transfer(payer, &ata, lamports),
        sync_native(&ata),
    ]
}

// ============================================================================
// Ed25519 precompile
// ============================================================================

// Offsets into the instruction data: 2-byte header, seven u16 fields, then
// pubkey, signature, message back to back.
const ED25519_DATA_START: u16 = 16;
const ED25519_PUBKEY_OFFSET: u16 = ED25519_DATA_START;
const ED25519_SIGNATURE_OFFSET: u16 = ED25519_PUBKEY_OFFSET + 32;
const ED25519_MESSAGE_OFFSET: u16 = ED25519_SIGNATURE_OFFSET + 64;

/// Native ed25519 verification over `message`, self-contained in one
/// instruction (all offsets point into its own data).
///
/// The escrow program introspects this instruction at transaction position 0
/// when handling a co-signed refund.
pub fn ed25519_verify_instruction(
    signer: &Pubkey,
    signature: &Signature,
    message: &[u8],
) -> Instruction {
    let mut data = Vec::with_capacity(ED25519_MESSAGE_OFFSET as usize + message.len());
    data.push(1u8);
    data.push(0u8);
    data.extend_from_slice(&ED25519_SIGNATURE_OFFSET.to_le_bytes());
    data.extend_from_slice(&u16::MAX.to_le_bytes());
    data.extend_from_slice(&ED25519_PUBKEY_OFFSET.to_le_bytes());
    data.extend_from_slice(&u16::MAX.to_le_bytes());
    data.extend_from_slice(&ED25519_MESSAGE_OFFSET.to_le_bytes());
    data.extend_from_slice(&(message.len() as u16).to_le_bytes());
    data.extend_from_slice(&u16::MAX.to_le_bytes());
    data.extend_from_slice(signer.as_ref());
    data.extend_from_slice(signature.as_ref());
    data.extend_from_slice(message);
    Instruction {
        program_id: solana_sdk::ed25519_program::ID,
        accounts: vec![],
        data,
    }
}

// ============================================================================
// Instruction builders
// ============================================================================

/// Address book and instruction factory for one deployed escrow program
#[derive(Debug, Clone)]
pub struct EscrowProgram {
    pub program_id: Pubkey,
}

impl EscrowProgram {
    pub fn new(program_id: Pubkey) -> Self {
        Self { program_id }
    }

    /// Escrow state PDA for `payment_hash`
    pub fn escrow_address(&self, payment_hash: &[u8; 32]) -> Pubkey {
        Pubkey::find_program_address(&[ESCROW_SEED, payment_hash], &self.program_id).0
    }

    /// Program token vault PDA for `mint`
    pub fn vault_address(&self, mint: &Pubkey) -> Pubkey {
        Pubkey::find_program_address(&[VAULT_SEED, mint.as_ref()], &self.program_id).0
    }

    /// Internal balance PDA for `(owner, mint)`
    pub fn user_vault_address(&self, owner: &Pubkey, mint: &Pubkey) -> Pubkey {
        Pubkey::find_program_address(
            &[USER_VAULT_SEED, owner.as_ref(), mint.as_ref()],
            &self.program_id,
        )
        .0
    }

    /// Seed string of the scratch data account (32 hex chars, within the
    /// system program's seed limit)
    pub fn data_account_seed(payment_hash: &[u8; 32]) -> String {
        hex::encode(&payment_hash[..16])
    }

    /// Scratch data account for a tx-proof claim, seeded so it can be
    /// recreated and swept without extra bookkeeping
    pub fn data_account_address(
        &self,
        base: &Pubkey,
        payment_hash: &[u8; 32],
    ) -> Result<Pubkey, PubkeyError> {
        Pubkey::create_with_seed(base, &Self::data_account_seed(payment_hash), &self.program_id)
    }

    /// System create for the scratch data account
    pub fn create_data_account(
        &self,
        submitter: &Pubkey,
        payment_hash: &[u8; 32],
        lamports: u64,
        space: u64,
    ) -> Result<Instruction, PubkeyError> {
        let address = self.data_account_address(submitter, payment_hash)?;
        Ok(system_instruction::create_account_with_seed(
            submitter,
            &address,
            submitter,
            &Self::data_account_seed(payment_hash),
            lamports,
            space,
            &self.program_id,
        ))
    }

    /// Append a chunk of the raw Bitcoin transaction at `offset`
    pub fn write_data(
        &self,
        submitter: &Pubkey,
        data_account: &Pubkey,
        offset: u32,
        chunk: &[u8],
    ) -> Instruction {
        let mut data = vec![tag::WRITE_DATA];
        data.extend_from_slice(&offset.to_le_bytes());
        data.extend_from_slice(chunk);
        Instruction {
            program_id: self.program_id,
            accounts: vec![
                AccountMeta::new(*data_account, false),
                AccountMeta::new_readonly(*submitter, true),
            ],
            data,
        }
    }

    /// Close a scratch data account, returning rent to the submitter
    pub fn close_data(&self, submitter: &Pubkey, data_account: &Pubkey) -> Instruction {
        Instruction {
            program_id: self.program_id,
            accounts: vec![
                AccountMeta::new(*data_account, false),
                AccountMeta::new(*submitter, true),
            ],
            data: vec![tag::CLOSE_DATA],
        }
    }

    /// Where a successful claim pays out
    pub fn claim_recipient(&self, swap: &SwapEscrow) -> Pubkey {
        if swap.pay_out {
            swap.claimer_ata
        } else {
            self.user_vault_address(&swap.claimer, &swap.token)
        }
    }

    /// Where a refund returns the funds
    pub fn refund_target(&self, swap: &SwapEscrow) -> Pubkey {
        if swap.pay_in {
            swap.offerer_ata
        } else {
            self.user_vault_address(&swap.offerer, &swap.token)
        }
    }

    /// Open the escrow.
    ///
    /// The submitting party pays fees and rent; the counterparty is a
    /// required transaction signer, which is what the off-chain init
    /// authorization supplies. Pay-in funds the vault from the offerer's
    /// wallet, pay-out from their internal balance.
    pub fn initialize(&self, swap: &SwapEscrow) -> Instruction {
        let escrow = self.escrow_address(&swap.payment_hash);
        let vault = self.vault_address(&swap.token);
        let (ix_tag, accounts) = if swap.pay_in {
            (
                tag::INITIALIZE_PAY_IN,
                vec![
                    AccountMeta::new(swap.offerer, true),
                    AccountMeta::new_readonly(swap.claimer, true),
                    AccountMeta::new(escrow, false),
                    AccountMeta::new(swap.offerer_ata, false),
                    AccountMeta::new(vault, false),
                    AccountMeta::new_readonly(swap.token, false),
                    AccountMeta::new_readonly(TOKEN_PROGRAM_ID, false),
                    AccountMeta::new_readonly(system_program::ID, false),
                ],
            )
        } else {
            (
                tag::INITIALIZE,
                vec![
                    AccountMeta::new(swap.claimer, true),
                    AccountMeta::new_readonly(swap.offerer, true),
                    AccountMeta::new(escrow, false),
                    AccountMeta::new(self.user_vault_address(&swap.offerer, &swap.token), false),
                    AccountMeta::new(vault, false),
                    AccountMeta::new_readonly(swap.token, false),
                    AccountMeta::new_readonly(TOKEN_PROGRAM_ID, false),
                    AccountMeta::new_readonly(system_program::ID, false),
                ],
            )
        };
        let mut data = vec![ix_tag];
        data.extend_from_slice(&borsh::to_vec(swap).unwrap_or_default());
        Instruction {
            program_id: self.program_id,
            accounts,
            data,
        }
    }

    /// Claim by revealing the HTLC secret
    pub fn claim_with_secret(
        &self,
        submitter: &Pubkey,
        swap: &SwapEscrow,
        secret: &[u8],
    ) -> Instruction {
        let mut data = vec![tag::CLAIM_SECRET];
        data.extend_from_slice(&borsh::to_vec(&secret.to_vec()).unwrap_or_default());
        Instruction {
            program_id: self.program_id,
            accounts: vec![
                AccountMeta::new(*submitter, true),
                AccountMeta::new(self.escrow_address(&swap.payment_hash), false),
                AccountMeta::new(self.claim_recipient(swap), false),
                AccountMeta::new(self.vault_address(&swap.token), false),
                AccountMeta::new_readonly(TOKEN_PROGRAM_ID, false),
            ],
            data,
        }
    }

    /// Claim against a relay-verified Bitcoin transaction.
    ///
    /// The transaction bytes live in the scratch data account; the relay's
    /// verify instruction must sit at transaction position 0.
    pub fn claim_with_tx_data(
        &self,
        submitter: &Pubkey,
        swap: &SwapEscrow,
        data_account: &Pubkey,
    ) -> Instruction {
        Instruction {
            program_id: self.program_id,
            accounts: vec![
                AccountMeta::new(*submitter, true),
                AccountMeta::new(self.escrow_address(&swap.payment_hash), false),
                AccountMeta::new(self.claim_recipient(swap), false),
                AccountMeta::new(self.vault_address(&swap.token), false),
                AccountMeta::new_readonly(*data_account, false),
                AccountMeta::new_readonly(TOKEN_PROGRAM_ID, false),
                AccountMeta::new_readonly(solana_sdk::sysvar::instructions::ID, false),
            ],
            data: vec![tag::CLAIM_TX_DATA],
        }
    }

    /// Timeout refund, valid once the escrow's own expiry has passed
    pub fn refund(&self, swap: &SwapEscrow) -> Instruction {
        Instruction {
            program_id: self.program_id,
            accounts: vec![
                AccountMeta::new(swap.offerer, true),
                AccountMeta::new(swap.claimer, false),
                AccountMeta::new(self.escrow_address(&swap.payment_hash), false),
                AccountMeta::new(self.refund_target(swap), false),
                AccountMeta::new(self.vault_address(&swap.token), false),
                AccountMeta::new_readonly(TOKEN_PROGRAM_ID, false),
            ],
            data: vec![tag::REFUND],
        }
    }

    /// Early refund co-signed by the claimer.
    ///
    /// Pairs with [`ed25519_verify_instruction`] at transaction position 0;
    /// `timeout` is echoed so the program can rebuild the signed message.
    pub fn refund_signed(&self, swap: &SwapEscrow, timeout: u64) -> Instruction {
        let mut data = vec![tag::REFUND_SIGNED];
        data.extend_from_slice(&timeout.to_le_bytes());
        Instruction {
            program_id: self.program_id,
            accounts: vec![
                AccountMeta::new(swap.offerer, true),
                AccountMeta::new(swap.claimer, false),
                AccountMeta::new(self.escrow_address(&swap.payment_hash), false),
                AccountMeta::new(self.refund_target(swap), false),
                AccountMeta::new(self.vault_address(&swap.token), false),
                AccountMeta::new_readonly(TOKEN_PROGRAM_ID, false),
                AccountMeta::new_readonly(solana_sdk::sysvar::instructions::ID, false),
            ],
            data,
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Emitted when an escrow opens
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct InitializeEvent {
    pub payment_hash: [u8; 32],
    pub sequence: u64,
    pub txo_hash: [u8; 32],
}

/// Emitted when a claim succeeds; `witness` is the revealed secret for HTLC
/// swaps and the proven txid for on-chain kinds
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ClaimEvent {
    pub payment_hash: [u8; 32],
    pub witness: Vec<u8>,
}

/// Emitted when an escrow is refunded
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RefundEvent {
    pub payment_hash: [u8; 32],
    pub sequence: u64,
}

#[derive(Debug, Clone)]
pub enum EscrowEvent {
    Initialize(InitializeEvent),
    Claim(ClaimEvent),
    Refund(RefundEvent),
}

impl EscrowEvent {
    /// Decode a raw scanner event; unknown tags belong to other programs
    /// and are skipped.
    pub fn parse(raw: &RawEvent) -> Option<Self> {
        match raw.tag {
            event_tag::INITIALIZE => InitializeEvent::try_from_slice(&raw.data)
                .ok()
                .map(Self::Initialize),
            event_tag::CLAIM => ClaimEvent::try_from_slice(&raw.data).ok().map(Self::Claim),
            event_tag::REFUND => RefundEvent::try_from_slice(&raw.data)
                .ok()
                .map(Self::Refund),
            _ => None,
        }
    }

    pub fn payment_hash(&self) -> &[u8; 32] {
        match self {
            EscrowEvent::Initialize(e) => &e.payment_hash,
            EscrowEvent::Claim(e) => &e.payment_hash,
            EscrowEvent::Refund(e) => &e.payment_hash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escrow::swap::testutil::htlc_swap;
    use solana_sdk::signature::Signature;

    #[test]
    fn test_escrow_account_round_trip() {
        let swap = htlc_swap([5; 32], 1_700_000_000);
        let bytes = encode_escrow_account(&swap);
        assert_eq!(&bytes[..8], &ESCROW_ACCOUNT_TAG);
        assert_eq!(decode_escrow_account(&bytes).unwrap(), swap);
        assert!(decode_escrow_account(&bytes[2..]).is_err());
        assert!(decode_escrow_account(&bytes[..6]).is_err());
    }

    #[test]
    fn test_initialize_dispatches_on_pay_in() {
        let program = EscrowProgram::new(Pubkey::new_unique());
        let mut swap = htlc_swap([5; 32], 1_700_000_000);

        swap.pay_in = true;
        let ix = program.initialize(&swap);
        assert_eq!(ix.data[0], tag::INITIALIZE_PAY_IN);
        assert_eq!(ix.accounts[0].pubkey, swap.offerer);
        assert!(ix.accounts[0].is_signer && ix.accounts[0].is_writable);
        assert_eq!(ix.accounts[1].pubkey, swap.claimer);
        assert!(ix.accounts[1].is_signer && !ix.accounts[1].is_writable);
        assert_eq!(
            SwapEscrow::try_from_slice(&ix.data[1..]).unwrap().sequence,
            swap.sequence
        );

        swap.pay_in = false;
        let ix = program.initialize(&swap);
        assert_eq!(ix.data[0], tag::INITIALIZE);
        assert_eq!(ix.accounts[0].pubkey, swap.claimer);
        assert_eq!(ix.accounts[1].pubkey, swap.offerer);
        assert!(ix.accounts[1].is_signer);
        assert!(ix
            .accounts
            .iter()
            .any(|m| m.pubkey == program.user_vault_address(&swap.offerer, &swap.token)));
    }

    #[test]
    fn test_claim_recipient_dispatches_on_pay_out() {
        let program = EscrowProgram::new(Pubkey::new_unique());
        let mut swap = htlc_swap([5; 32], 1_700_000_000);

        swap.pay_out = true;
        assert_eq!(program.claim_recipient(&swap), swap.claimer_ata);

        swap.pay_out = false;
        assert_eq!(
            program.claim_recipient(&swap),
            program.user_vault_address(&swap.claimer, &swap.token)
        );
    }

    #[test]
    fn test_claim_with_secret_carries_preimage() {
        let program = EscrowProgram::new(Pubkey::new_unique());
        let swap = htlc_swap([5; 32], 1_700_000_000);
        let submitter = Pubkey::new_unique();
        let secret = [0xabu8; 32];

        let ix = program.claim_with_secret(&submitter, &swap, &secret);
        assert_eq!(ix.data[0], tag::CLAIM_SECRET);
        let carried: Vec<u8> = BorshDeserialize::try_from_slice(&ix.data[1..]).unwrap();
        assert_eq!(carried, secret.to_vec());
        assert_eq!(ix.accounts[0].pubkey, submitter);
        assert!(ix.accounts[0].is_signer);
    }

    #[test]
    fn test_data_account_seed_and_address() {
        let program = EscrowProgram::new(Pubkey::new_unique());
        let base = Pubkey::new_unique();
        let payment_hash = [0x1fu8; 32];

        let seed = EscrowProgram::data_account_seed(&payment_hash);
        assert_eq!(seed.len(), 32);

        let a = program.data_account_address(&base, &payment_hash).unwrap();
        let b = program.data_account_address(&base, &payment_hash).unwrap();
        assert_eq!(a, b);
        assert_ne!(
            a,
            program.data_account_address(&base, &[0x2f; 32]).unwrap()
        );

        let ix = program
            .create_data_account(&base, &payment_hash, 1_000_000, 512)
            .unwrap();
        assert!(ix.accounts.iter().any(|m| m.pubkey == a));
    }

    #[test]
    fn test_ed25519_instruction_layout() {
        let signer = Pubkey::new_unique();
        let signature = Signature::from([7u8; 64]);
        let message = b"refund digest".to_vec();

        let ix = ed25519_verify_instruction(&signer, &signature, &message);
        assert_eq!(ix.program_id, solana_sdk::ed25519_program::ID);
        assert!(ix.accounts.is_empty());
        assert_eq!(ix.data[0], 1);

        let pk_start = ED25519_PUBKEY_OFFSET as usize;
        let sig_start = ED25519_SIGNATURE_OFFSET as usize;
        let msg_start = ED25519_MESSAGE_OFFSET as usize;
        assert_eq!(&ix.data[pk_start..pk_start + 32], signer.as_ref());
        assert_eq!(&ix.data[sig_start..sig_start + 64], signature.as_ref());
        assert_eq!(&ix.data[msg_start..], &message[..]);

        // Message length field sits after the message offset field.
        let len = u16::from_le_bytes([ix.data[12], ix.data[13]]);
        assert_eq!(len as usize, message.len());
    }

    #[test]
    fn test_wrap_instructions_fold_lamports() {
        let payer = Pubkey::new_unique();
        let ixs = wrap_instructions(&payer, 42_000_000);
        assert_eq!(ixs.len(), 3);
        assert_eq!(ixs[0].program_id, ATA_PROGRAM_ID);
        assert_eq!(ixs[1].program_id, system_program::ID);
        assert_eq!(ixs[2].program_id, TOKEN_PROGRAM_ID);
        assert_eq!(ixs[2].data, vec![17]);
        assert_eq!(
            ixs[2].accounts[0].pubkey,
            get_ata(&payer, &WSOL_MINT)
        );
    }

    #[test]
    fn test_event_parse_and_unknown_tag() {
        let event = ClaimEvent {
            payment_hash: [9; 32],
            witness: vec![1, 2, 3],
        };
        let raw = RawEvent {
            tag: event_tag::CLAIM,
            data: borsh::to_vec(&event).unwrap(),
            signature: Signature::default(),
            slot: 4,
        };
        match EscrowEvent::parse(&raw) {
            Some(EscrowEvent::Claim(e)) => assert_eq!(e, event),
            other => panic!("unexpected parse result: {:?}", other),
        }
        assert_eq!(EscrowEvent::parse(&raw).unwrap().payment_hash(), &[9; 32]);

        let unknown = RawEvent {
            tag: 0x66,
            data: vec![],
            signature: Signature::default(),
            slot: 4,
        };
        assert!(EscrowEvent::parse(&unknown).is_none());
    }
}
