//! Account existence check: which recipients already have a receiving
//! account for the mint.

use crate::{
    error::{MultisendError, Result},
    ledger::is_token_account,
    policy::pause,
    recipient::Recipient,
    session::Session,
    state::{Bucket, RunState, Stage},
};
use solana_sdk::{account::Account, pubkey::Pubkey};
use tracing::warn;

/// Share of the overall progress bar taken by the check stage.
const CHECK_PROGRESS_SPAN: f64 = 50.0;

pub fn check_progress(checked: usize, total: usize) -> f64 {
    if total == 0 {
        return CHECK_PROGRESS_SPAN;
    }
    checked as f64 / total as f64 * CHECK_PROGRESS_SPAN
}

/// Rejects a lookup answer that does not line up with the request.
pub(crate) fn aligned(
    infos: Vec<Option<Account>>,
    requested: usize,
) -> Result<Vec<Option<Account>>> {
    if infos.len() != requested {
        return Err(MultisendError::Unavailable(format!(
            "lookup returned {} entries for {requested} addresses",
            infos.len()
        )));
    }
    Ok(infos)
}

impl Session {
    /// Classifies every recipient as `has-account` or `needs-account`.
    ///
    /// Lookup failures and cancellation never drop a recipient: anything not
    /// positively confirmed ends up in `needs-account`.
    pub async fn check_accounts(&self, run: &mut RunState, recipients: Vec<Recipient>) -> Result<()> {
        run.begin(Stage::Checking);
        if recipients.is_empty() {
            return Err(MultisendError::NoRecipients);
        }

        let total = recipients.len();
        let batch_size = self.settings().effective_check_batch();
        let batches = total.div_ceil(batch_size);
        run.status(format!(
            "Checking receiving accounts for {total} recipients in {batches} batches..."
        ));

        let mut remaining = recipients.into_iter();
        let mut checked = 0;
        let mut batch_no = 0;

        loop {
            let batch: Vec<Recipient> = remaining.by_ref().take(batch_size).collect();
            if batch.is_empty() {
                break;
            }
            batch_no += 1;

            if run.cancelled() {
                run.status("Account check stopped by operator.");
                run.settle_all(Bucket::NeedsAccount, batch.into_iter().chain(remaining.by_ref()));
                break;
            }

            let accounts: Vec<Pubkey> = batch
                .iter()
                .map(|r| self.receiving_account(r.address()))
                .collect();

            let lookup = self
                .ledger()
                .get_multiple_accounts(&accounts)
                .await
                .and_then(|infos| aligned(infos, accounts.len()));
            match lookup {
                Ok(_) if run.cancelled() => {
                    // Results that arrive after the stop request are discarded.
                    run.status("Account check stopped by operator.");
                    run.settle_all(
                        Bucket::NeedsAccount,
                        batch.into_iter().chain(remaining.by_ref()),
                    );
                    break;
                }
                Ok(infos) => {
                    for ((mut recipient, account), info) in
                        batch.into_iter().zip(accounts).zip(infos)
                    {
                        if is_token_account(info.as_ref()) {
                            recipient.set_account(account);
                            run.settle(Bucket::HasAccount, recipient);
                        } else {
                            recipient.clear_account();
                            run.settle(Bucket::NeedsAccount, recipient);
                        }
                    }
                }
                Err(e) => {
                    warn!(batch = batch_no, error = %e, "account lookup failed");
                    run.status(format!("Failed to check accounts for batch {batch_no}: {e}"));
                    run.settle_all(Bucket::NeedsAccount, batch);
                }
            }

            checked = (checked + batch_size).min(total);
            run.set_progress(check_progress(checked, total));

            // A cancelled pause is picked up at the top of the next iteration.
            pause(self.settings().pacing.check_batch_delay, run.token()).await;
        }

        if run.cancelled() {
            run.set_progress(100.0);
            run.status(format!(
                "Stopped: {} recipients already have accounts, {} left unresolved.",
                run.buckets.has_account.len(),
                run.buckets.needs_account.len()
            ));
            return Ok(());
        }

        run.status(format!(
            "Account check completed: {} recipients already have accounts, {} need accounts.",
            run.buckets.has_account.len(),
            run.buckets.needs_account.len()
        ));
        if run.buckets.needs_account.is_empty() {
            run.set_progress(100.0);
        }
        Ok(())
    }
}
