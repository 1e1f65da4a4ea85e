//! Per-recipient retries for everyone the bulk stages could not serve.

use crate::{
    error::{MultisendError, Result},
    ledger::is_token_account,
    policy::{pause, RetryPolicy},
    recipient::{dedup_by_address, Recipient},
    session::Session,
    state::{Bucket, RunState, Stage},
    transaction::{build_transaction, ensure_fits, provision_instruction, transfer_instruction},
};
use solana_sdk::{instruction::Instruction, pubkey::Pubkey, signature::Signature};
use std::fmt;
use tracing::{debug, warn};

/// How a single recipient's transfer is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Account creation (when missing) and transfer in one transaction.
    Combined,
    /// Account creation confirmed on its own, then the transfer.
    Split,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Combined => f.write_str("combined"),
            Strategy::Split => f.write_str("split"),
        }
    }
}

/// One step of the fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAttempt {
    pub strategy: Strategy,
    pub priority_fee: u64,
    pub confirm: RetryPolicy,
}

pub fn retry_progress(done: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    done as f64 / total as f64 * 100.0
}

impl Session {
    /// Combined first, split at a higher fee second.
    pub fn retry_plan(&self) -> [RetryAttempt; 2] {
        let settings = self.settings();
        [
            RetryAttempt {
                strategy: Strategy::Combined,
                priority_fee: settings.fees.retry_combined,
                confirm: settings.retry_confirm,
            },
            RetryAttempt {
                strategy: Strategy::Split,
                priority_fee: settings.fees.retry_split,
                confirm: settings.retry_confirm,
            },
        ]
    }

    /// Recipients eligible for retry: failed transfers, plus unprovisioned
    /// recipients when enabled. One entry per address.
    pub fn retry_candidates(&self, run: &RunState) -> Vec<Recipient> {
        let mut candidates = run.buckets.transfer_failed.clone();
        if self.settings().retry_unprovisioned {
            candidates.extend(run.buckets.needs_account.iter().cloned());
            candidates.extend(run.buckets.provision_failed.iter().cloned());
        }
        dedup_by_address(&candidates)
    }

    /// Retries each recipient on its own, walking the fallback chain.
    pub async fn retry_failed(&self, run: &mut RunState, recipients: Vec<Recipient>) -> Result<()> {
        run.begin(Stage::Retrying);
        if recipients.is_empty() {
            run.status("Nothing to retry.");
            run.set_progress(100.0);
            return Ok(());
        }
        let source = self.require_sender_account().await?;

        let total = recipients.len();
        run.status(format!("Retrying {total} recipients one at a time..."));
        let mut remaining = recipients.into_iter().enumerate();

        while let Some((idx, recipient)) = remaining.next() {
            if run.cancelled() {
                let rest = std::iter::once(recipient).chain(remaining.by_ref().map(|(_, r)| r));
                run.settle_all(Bucket::RetryFailed, rest);
                break;
            }

            let address = *recipient.address();
            match self.retry_one(run, &source, recipient.clone()).await {
                Ok(done) => {
                    if run.settle(Bucket::RetrySucceeded, done) == Bucket::RetrySucceeded {
                        run.status(format!("Retry succeeded for {address}."));
                    }
                }
                Err(e) => {
                    run.status(format!("Retry failed for {address}: {e}"));
                    run.settle(Bucket::RetryFailed, recipient);
                }
            }
            run.set_progress(retry_progress(idx + 1, total));

            if idx + 1 < total {
                pause(self.settings().pacing.retry_recipient_delay, run.token()).await;
            }
        }

        if run.cancelled() {
            run.set_progress(100.0);
        }
        run.status(format!(
            "Retry completed: {} succeeded, {} failed.",
            run.buckets.retry_succeeded.len(),
            run.buckets.retry_failed.len()
        ));
        Ok(())
    }

    async fn retry_one(
        &self,
        run: &mut RunState,
        source: &Pubkey,
        mut recipient: Recipient,
    ) -> Result<Recipient> {
        let account = self.receiving_account(recipient.address());
        let units = self
            .settings()
            .scale(recipient.amount())
            .ok_or(MultisendError::AmountOverflow {
                amount: recipient.amount(),
                decimals: self.settings().decimals,
            })?;
        let transfer = transfer_instruction(source, &account, &self.payer(), units)?;

        let mut last_error = None;
        for attempt in self.retry_plan() {
            let result = match attempt.strategy {
                Strategy::Combined => {
                    self.retry_combined(run, &recipient, &account, transfer.clone(), &attempt)
                        .await
                }
                Strategy::Split => {
                    self.retry_split(run, &recipient, &account, transfer.clone(), &attempt)
                        .await
                }
            };
            match result {
                Ok(signature) => {
                    debug!(%signature, strategy = %attempt.strategy, "retry confirmed");
                    recipient.set_account(account);
                    return Ok(recipient);
                }
                Err(MultisendError::Cancelled) => return Err(MultisendError::Cancelled),
                Err(e) => {
                    warn!(recipient = %recipient.address(), strategy = %attempt.strategy, error = %e, "retry attempt failed");
                    run.status(format!(
                        "{}: {} attempt failed: {e}",
                        recipient.address(),
                        attempt.strategy
                    ));
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(MultisendError::AccountNotProvisioned(*recipient.address())))
    }

    async fn retry_combined(
        &self,
        run: &mut RunState,
        recipient: &Recipient,
        account: &Pubkey,
        transfer: Instruction,
        attempt: &RetryAttempt,
    ) -> Result<Signature> {
        let mut instructions = Vec::with_capacity(2);
        if !self.account_exists(account).await {
            instructions.push(provision_instruction(
                &self.payer(),
                recipient.address(),
                &self.settings().mint,
            ));
        }
        instructions.push(transfer);
        self.submit_confirmed(run, &instructions, attempt).await
    }

    async fn retry_split(
        &self,
        run: &mut RunState,
        recipient: &Recipient,
        account: &Pubkey,
        transfer: Instruction,
        attempt: &RetryAttempt,
    ) -> Result<Signature> {
        if !self.account_exists(account).await {
            let create = provision_instruction(&self.payer(), recipient.address(), &self.settings().mint);
            match self.submit_confirmed(run, &[create], attempt).await {
                Ok(signature) => {
                    run.status(format!("Created account for {}: {signature}", recipient.address()));
                }
                Err(MultisendError::Cancelled) => return Err(MultisendError::Cancelled),
                Err(e) => {
                    // The creation may have landed even though it was not confirmed.
                    if !self.account_exists(account).await {
                        return Err(e);
                    }
                    debug!(%account, error = %e, "account exists despite failed creation");
                }
            }
        }
        self.submit_confirmed(run, &[transfer], attempt).await
    }

    async fn submit_confirmed(
        &self,
        run: &mut RunState,
        instructions: &[Instruction],
        attempt: &RetryAttempt,
    ) -> Result<Signature> {
        let payer = self.payer();
        let blockhash = self.ledger().latest_blockhash().await?;
        let tx = build_transaction(
            instructions,
            &payer,
            attempt.priority_fee,
            self.settings().fees.compute_unit_limit,
            blockhash.blockhash,
        );
        ensure_fits(&tx)?;

        if run.cancelled() {
            return Err(MultisendError::Cancelled);
        }
        let signature = self.wallet().sign_and_submit(tx).await?;
        attempt
            .confirm
            .confirm(self.ledger(), &signature, &blockhash, run.token())
            .await?;
        Ok(signature)
    }

    /// Lookup errors count as missing; the idempotent create covers both cases.
    async fn account_exists(&self, account: &Pubkey) -> bool {
        match self.ledger().get_account(account).await {
            Ok(info) => is_token_account(info.as_ref()),
            Err(e) => {
                warn!(%account, error = %e, "account lookup failed");
                false
            }
        }
    }
}
