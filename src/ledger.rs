//! Capability traits for the two external collaborators: the ledger node
//! and the signing wallet.

use crate::error::Result;
use async_trait::async_trait;
use solana_sdk::{
    account::Account, hash::Hash, pubkey::Pubkey, signature::Signature,
    transaction::Transaction,
};

/// A blockhash together with the last block height at which it is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecentBlockhash {
    pub blockhash: Hash,
    pub last_valid_block_height: u64,
}

/// Result of a single confirmation poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed,
    /// Landed, but the runtime reported an error for it.
    Failed(String),
    /// Not yet visible at the requested commitment.
    Pending,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn latest_blockhash(&self) -> Result<RecentBlockhash>;

    async fn get_account(&self, address: &Pubkey) -> Result<Option<Account>>;

    /// Looks up all addresses in one call; the result is index-aligned with the input.
    async fn get_multiple_accounts(&self, addresses: &[Pubkey]) -> Result<Vec<Option<Account>>>;

    async fn confirm(&self, signature: &Signature, blockhash: &RecentBlockhash)
        -> Result<Confirmation>;
}

#[async_trait]
pub trait Wallet: Send + Sync {
    fn pubkey(&self) -> Pubkey;

    /// Signs as fee payer and broadcasts. Never waits for confirmation.
    async fn sign_and_submit(&self, transaction: Transaction) -> Result<Signature>;
}

/// True when the account exists and is owned by the SPL token program.
pub fn is_token_account(account: Option<&Account>) -> bool {
    account.is_some_and(|account| account.owner == spl_token::id())
}
