//! In-memory ledger and wallet for exercising the pipeline without a node.

use crate::{
    config::Settings,
    error::{MultisendError, Result},
    ledger::{Confirmation, Ledger, RecentBlockhash, Wallet},
    recipient::Recipient,
    session::Session,
    transaction::receiving_account,
};
use async_trait::async_trait;
use solana_sdk::{
    account::Account, hash::Hash, program_pack::Pack, pubkey::Pubkey, signature::Signature,
    transaction::Transaction,
};
use spl_token::state::{Account as TokenAccount, AccountState};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub enum SubmitStep {
    Accept,
    Reject(String),
    /// Broadcast errors out, but the account creations for these owners land anyway.
    RejectAfterLanding(Vec<Pubkey>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStep {
    Answer,
    Fail,
    /// Answers with the last entry missing.
    Short,
}

#[derive(Debug, Clone)]
pub enum ConfirmStep {
    Confirmed,
    Fail(String),
    Pending,
    Error,
    /// Signature never found and the blockhash is past its last valid height.
    Expired,
}

#[derive(Default)]
struct Chain {
    accounts: HashMap<Pubkey, Account>,
    lookup_script: VecDeque<LookupStep>,
    lookup_sizes: Vec<usize>,
    submit_script: VecDeque<SubmitStep>,
    confirm_script: VecDeque<ConfirmStep>,
    confirm_calls: usize,
    pending: HashMap<Signature, Transaction>,
    submitted: Vec<Transaction>,
    transfers: Vec<(Pubkey, u64)>,
    cancel_after_lookups: Option<(usize, CancellationToken)>,
    cancel_after_submits: Option<(usize, CancellationToken)>,
}

impl Chain {
    /// Applies a landed transaction atomically: creations first in order,
    /// transfers fail the whole transaction when the destination is missing.
    fn land(&mut self, tx: &Transaction) -> Confirmation {
        let keys = &tx.message.account_keys;
        let mut created = Vec::new();
        let mut transfers = Vec::new();

        for ix in &tx.message.instructions {
            let program = keys[ix.program_id_index as usize];
            if program == spl_associated_token_account::id() {
                created.push(keys[ix.accounts[1] as usize]);
            } else if program == spl_token::id() && ix.data.first() == Some(&3) {
                let dest = keys[ix.accounts[1] as usize];
                if !self.accounts.contains_key(&dest) && !created.contains(&dest) {
                    return Confirmation::Failed("invalid account data for instruction".into());
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&ix.data[1..9]);
                transfers.push((dest, u64::from_le_bytes(raw)));
            }
        }

        for address in created {
            self.accounts.entry(address).or_insert_with(token_account);
        }
        self.transfers.extend(transfers);
        Confirmation::Confirmed
    }
}

fn token_account() -> Account {
    Account::new(2_039_280, 165, &spl_token::id())
}

/// Shared handle to a fake chain; ledger and wallet views see the same state.
#[derive(Clone)]
pub struct FakeChain {
    inner: Arc<Mutex<Chain>>,
    payer: Pubkey,
    mint: Pubkey,
}

impl FakeChain {
    pub fn new() -> Self {
        let chain = Self {
            inner: Arc::new(Mutex::new(Chain::default())),
            payer: Pubkey::new_unique(),
            mint: Pubkey::new_unique(),
        };
        // The sender always starts with a funded token account.
        chain.seed_token_account(&chain.payer);
        chain
    }

    fn lock(&self) -> MutexGuard<'_, Chain> {
        self.inner.lock().unwrap()
    }

    pub fn payer(&self) -> Pubkey {
        self.payer
    }

    pub fn mint(&self) -> Pubkey {
        self.mint
    }

    pub fn ledger(&self) -> Arc<dyn Ledger> {
        Arc::new(FakeLedger(self.clone()))
    }

    pub fn wallet(&self) -> Arc<dyn Wallet> {
        Arc::new(FakeWallet(self.clone()))
    }

    pub fn settings(&self) -> Settings {
        Settings::new(self.mint, 6)
    }

    pub fn session(&self, cancel: CancellationToken) -> Session {
        self.session_with(self.settings(), cancel)
    }

    pub fn session_with(&self, settings: Settings, cancel: CancellationToken) -> Session {
        Session::new(self.ledger(), self.wallet(), settings, cancel)
    }

    pub fn recipients(&self, n: usize) -> Vec<Recipient> {
        (0..n)
            .map(|i| Recipient::new(Pubkey::new_unique(), i as u64 + 1))
            .collect()
    }

    pub fn ata(&self, owner: &Pubkey) -> Pubkey {
        receiving_account(owner, &self.mint)
    }

    pub fn seed_token_account(&self, owner: &Pubkey) {
        let ata = self.ata(owner);
        self.lock().accounts.insert(ata, token_account());
    }

    /// Replaces the sender's token account with an initialized one holding `amount`.
    pub fn fund_sender(&self, amount: u64) {
        let state = TokenAccount {
            mint: self.mint,
            owner: self.payer,
            amount,
            state: AccountState::Initialized,
            ..TokenAccount::default()
        };
        let mut account = token_account();
        TokenAccount::pack(state, &mut account.data).unwrap();
        let ata = self.ata(&self.payer);
        self.lock().accounts.insert(ata, account);
    }

    /// An account at the receiving address owned by some other program.
    pub fn seed_foreign_account(&self, owner: &Pubkey) {
        let ata = self.ata(owner);
        self.lock()
            .accounts
            .insert(ata, Account::new(1, 0, &solana_sdk::system_program::id()));
    }

    pub fn remove_account(&self, owner: &Pubkey) {
        let ata = self.ata(owner);
        self.lock().accounts.remove(&ata);
    }

    pub fn has_token_account(&self, owner: &Pubkey) -> bool {
        let ata = self.ata(owner);
        self.lock()
            .accounts
            .get(&ata)
            .is_some_and(|a| a.owner == spl_token::id())
    }

    pub fn script_lookups(&self, steps: impl IntoIterator<Item = LookupStep>) {
        self.lock().lookup_script.extend(steps);
    }

    pub fn script_submits(&self, steps: impl IntoIterator<Item = SubmitStep>) {
        self.lock().submit_script.extend(steps);
    }

    pub fn script_confirms(&self, steps: impl IntoIterator<Item = ConfirmStep>) {
        self.lock().confirm_script.extend(steps);
    }

    /// Cancels `token` while the n-th multi-account lookup is in flight.
    pub fn cancel_after_lookups(&self, n: usize, token: CancellationToken) {
        self.lock().cancel_after_lookups = Some((n, token));
    }

    /// Cancels `token` while the n-th submission is in flight.
    pub fn cancel_after_submits(&self, n: usize, token: CancellationToken) {
        self.lock().cancel_after_submits = Some((n, token));
    }

    pub fn lookup_sizes(&self) -> Vec<usize> {
        self.lock().lookup_sizes.clone()
    }

    pub fn confirm_calls(&self) -> usize {
        self.lock().confirm_calls
    }

    pub fn submitted(&self) -> Vec<Transaction> {
        self.lock().submitted.clone()
    }

    /// Landed transfers as (destination account, base units).
    pub fn transfers(&self) -> Vec<(Pubkey, u64)> {
        self.lock().transfers.clone()
    }
}

struct FakeLedger(FakeChain);

#[async_trait]
impl Ledger for FakeLedger {
    async fn latest_blockhash(&self) -> Result<RecentBlockhash> {
        Ok(RecentBlockhash {
            blockhash: Hash::new_unique(),
            last_valid_block_height: 150,
        })
    }

    async fn get_account(&self, address: &Pubkey) -> Result<Option<Account>> {
        Ok(self.0.lock().accounts.get(address).cloned())
    }

    async fn get_multiple_accounts(&self, addresses: &[Pubkey]) -> Result<Vec<Option<Account>>> {
        let mut chain = self.0.lock();
        chain.lookup_sizes.push(addresses.len());
        let calls = chain.lookup_sizes.len();
        if let Some((n, token)) = &chain.cancel_after_lookups {
            if *n == calls {
                token.cancel();
            }
        }
        let step = chain.lookup_script.pop_front().unwrap_or(LookupStep::Answer);
        if step == LookupStep::Fail {
            return Err(MultisendError::Unavailable("429 Too Many Requests".into()));
        }
        let mut infos: Vec<Option<Account>> = addresses
            .iter()
            .map(|address| chain.accounts.get(address).cloned())
            .collect();
        if step == LookupStep::Short {
            infos.pop();
        }
        Ok(infos)
    }

    async fn confirm(
        &self,
        signature: &Signature,
        _blockhash: &RecentBlockhash,
    ) -> Result<Confirmation> {
        let mut chain = self.0.lock();
        chain.confirm_calls += 1;
        match chain.confirm_script.pop_front().unwrap_or(ConfirmStep::Confirmed) {
            ConfirmStep::Confirmed => match chain.pending.remove(signature) {
                Some(tx) => Ok(chain.land(&tx)),
                None => Ok(Confirmation::Confirmed),
            },
            ConfirmStep::Fail(reason) => {
                chain.pending.remove(signature);
                Ok(Confirmation::Failed(reason))
            }
            ConfirmStep::Pending => Ok(Confirmation::Pending),
            ConfirmStep::Error => Err(MultisendError::Unavailable("connection reset".into())),
            ConfirmStep::Expired => {
                chain.pending.remove(signature);
                Err(MultisendError::Expired(*signature))
            }
        }
    }
}

struct FakeWallet(FakeChain);

#[async_trait]
impl Wallet for FakeWallet {
    fn pubkey(&self) -> Pubkey {
        self.0.payer
    }

    async fn sign_and_submit(&self, transaction: Transaction) -> Result<Signature> {
        let mint = self.0.mint;
        let mut chain = self.0.lock();
        chain.submitted.push(transaction.clone());
        let calls = chain.submitted.len();
        if let Some((n, token)) = &chain.cancel_after_submits {
            if *n == calls {
                token.cancel();
            }
        }

        match chain.submit_script.pop_front().unwrap_or(SubmitStep::Accept) {
            SubmitStep::Accept => {
                let signature = Signature::new_unique();
                chain.pending.insert(signature, transaction);
                Ok(signature)
            }
            SubmitStep::Reject(reason) => Err(MultisendError::SigningRejected(reason)),
            SubmitStep::RejectAfterLanding(owners) => {
                for owner in owners {
                    chain
                        .accounts
                        .insert(receiving_account(&owner, &mint), token_account());
                }
                Err(MultisendError::Unavailable("network error".into()))
            }
        }
    }
}
