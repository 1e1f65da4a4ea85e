use crate::{
    config::Settings,
    error::{MultisendError, Result},
    ledger::{is_token_account, Ledger, Wallet},
    policy::RetryPolicy,
    recipient::{ParsedInput, Recipient},
    state::RunState,
    transaction::{build_transaction, provision_instruction, receiving_account},
};
use solana_sdk::{program_pack::Pack, pubkey::Pubkey};
use spl_token::state::{Account as TokenAccount, Mint};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Collaborators shared by every stage: the ledger connection, the signing
/// wallet, run settings and the operator's cancellation token.
pub struct Session {
    ledger: Arc<dyn Ledger>,
    wallet: Arc<dyn Wallet>,
    settings: Settings,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceCheck {
    pub available: u64,
    pub required: u64,
}

impl BalanceCheck {
    pub fn sufficient(&self) -> bool {
        self.available >= self.required
    }

    pub fn shortfall(&self) -> u64 {
        self.required.saturating_sub(self.available)
    }
}

impl Session {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        wallet: Arc<dyn Wallet>,
        settings: Settings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ledger,
            wallet,
            settings,
            cancel,
        }
    }

    pub fn ledger(&self) -> &dyn Ledger {
        self.ledger.as_ref()
    }

    pub fn wallet(&self) -> &dyn Wallet {
        self.wallet.as_ref()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn run_state(&self) -> RunState {
        RunState::new(self.cancel.clone())
    }

    pub fn payer(&self) -> Pubkey {
        self.wallet.pubkey()
    }

    /// The sender's own token account, source of every transfer.
    pub fn sender_account(&self) -> Pubkey {
        receiving_account(&self.payer(), &self.settings.mint)
    }

    pub fn receiving_account(&self, owner: &Pubkey) -> Pubkey {
        receiving_account(owner, &self.settings.mint)
    }

    /// Reads the token decimals from the mint account.
    pub async fn mint_decimals(&self) -> Result<u8> {
        let mint = self.settings.mint;
        let account = self
            .ledger
            .get_account(&mint)
            .await?
            .ok_or_else(|| MultisendError::InvalidMint {
                mint,
                reason: "account not found".into(),
            })?;
        let state = Mint::unpack(&account.data).map_err(|e| MultisendError::InvalidMint {
            mint,
            reason: e.to_string(),
        })?;
        Ok(state.decimals)
    }

    /// Fails unless the sender's token account exists.
    pub async fn require_sender_account(&self) -> Result<Pubkey> {
        let sender = self.sender_account();
        let account = self.ledger.get_account(&sender).await?;
        if is_token_account(account.as_ref()) {
            Ok(sender)
        } else {
            Err(MultisendError::MissingSenderAccount(sender))
        }
    }

    /// Creates the sender's token account when it is missing.
    pub async fn ensure_sender_account(&self, run: &mut RunState) -> Result<Pubkey> {
        let sender = self.sender_account();
        if is_token_account(self.ledger.get_account(&sender).await?.as_ref()) {
            run.status(format!("Sender token account {sender} already exists."));
            return Ok(sender);
        }
        if run.cancelled() {
            return Err(MultisendError::Cancelled);
        }

        let payer = self.payer();
        let blockhash = self.ledger.latest_blockhash().await?;
        let tx = build_transaction(
            &[provision_instruction(&payer, &payer, &self.settings.mint)],
            &payer,
            self.settings.fees.provision,
            self.settings.fees.compute_unit_limit,
            blockhash.blockhash,
        );
        let signature = self.wallet.sign_and_submit(tx).await?;
        RetryPolicy::new(3, self.settings.transfer_confirm.backoff)
            .confirm(self.ledger(), &signature, &blockhash, &self.cancel)
            .await?;
        run.status(format!("Sender token account {sender} created: {signature}"));
        Ok(sender)
    }

    /// Compares the sender's balance with the scaled total of `recipients`.
    pub async fn check_balance(&self, recipients: &[Recipient]) -> Result<BalanceCheck> {
        let required = recipients.iter().try_fold(0u64, |total, r| {
            self.settings
                .scale(r.amount())
                .and_then(|units| total.checked_add(units))
                .ok_or(MultisendError::AmountOverflow {
                    amount: r.amount(),
                    decimals: self.settings.decimals,
                })
        })?;

        let sender = self.require_sender_account().await?;
        let available = match self.ledger.get_account(&sender).await? {
            Some(account) => TokenAccount::unpack(&account.data)
                .map(|state| state.amount)
                .unwrap_or_else(|e| {
                    warn!(%sender, error = %e, "unreadable sender token account");
                    0
                }),
            None => 0,
        };
        Ok(BalanceCheck {
            available,
            required,
        })
    }

    /// Runs every stage in order on freshly parsed input. Stops after the
    /// stage in which cancellation was observed.
    pub async fn run_pipeline(&self, run: &mut RunState, input: ParsedInput) -> Result<()> {
        if input.recipients.is_empty() {
            return Err(MultisendError::NoRecipients);
        }
        run.buckets.rejected = input.rejects;

        self.check_accounts(run, input.recipients).await?;
        if run.cancelled() {
            return Ok(());
        }
        self.finish_pipeline(run).await
    }

    /// Provisioning, transfers and retries, picking up from a completed
    /// account check.
    pub async fn finish_pipeline(&self, run: &mut RunState) -> Result<()> {
        // Runs even with nothing to create; it also prepares the sender account.
        let needs = std::mem::take(&mut run.buckets.needs_account);
        self.provision_accounts(run, needs).await?;
        if run.cancelled() {
            return Ok(());
        }

        let ready = run.buckets.has_account.clone();
        if !ready.is_empty() {
            self.dispatch_transfers(run, ready).await?;
            if run.cancelled() {
                return Ok(());
            }
        }

        let failed = self.retry_candidates(run);
        if !failed.is_empty() {
            self.retry_failed(run, failed).await?;
            if run.cancelled() {
                return Ok(());
            }
        }

        info!(
            sent = run.buckets.sent.len(),
            retried = run.buckets.retry_succeeded.len(),
            failed = run.buckets.retry_failed.len(),
            "pipeline finished"
        );
        run.finish();
        Ok(())
    }
}
