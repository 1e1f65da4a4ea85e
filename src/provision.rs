//! Creates missing receiving accounts in small chunks.

use crate::{
    check::aligned,
    error::{MultisendError, Result},
    ledger::is_token_account,
    policy::pause,
    recipient::{chunks, Recipient},
    session::Session,
    state::{Bucket, RunState, Stage},
    transaction::{build_transaction, provision_instruction, transaction_fits},
};
use solana_sdk::{hash::Hash, instruction::Instruction, pubkey::Pubkey};
use std::collections::VecDeque;
use tracing::{debug, warn};

pub fn provision_progress(done: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    50.0 + done as f64 / total as f64 * 50.0
}

impl Session {
    /// Provisions receiving accounts for `recipients`, after making sure the
    /// sender's own token account exists.
    ///
    /// Confirmed recipients join `has-account`; failures are re-verified
    /// against the ledger before being demoted to `provision-failed`. After
    /// cancellation the current chunk and everything queued behind it stay in
    /// `needs-account`.
    pub async fn provision_accounts(
        &self,
        run: &mut RunState,
        recipients: Vec<Recipient>,
    ) -> Result<()> {
        run.begin(Stage::Provisioning);
        match self.ensure_sender_account(run).await {
            Ok(_) | Err(MultisendError::Cancelled) => {}
            Err(e) => return Err(e),
        }
        if recipients.is_empty() {
            run.status("No recipients need accounts.");
            run.set_progress(100.0);
            return Ok(());
        }

        let chunk_size = self.settings().effective_provision_chunk();
        let mut queue: VecDeque<Vec<Recipient>> =
            chunks(&recipients, chunk_size).map(<[Recipient]>::to_vec).collect();
        let mut total = queue.len();
        let mut done = 0;
        run.status(format!(
            "Creating accounts for {} recipients in {total} chunks of up to {chunk_size}...",
            recipients.len()
        ));

        while let Some(chunk) = queue.pop_front() {
            run.set_progress(provision_progress(done, total));
            if run.cancelled() {
                run.settle_all(Bucket::NeedsAccount, chunk);
                break;
            }

            if let Some(overflow) = self.provision_chunk(run, chunk, done + 1).await? {
                // Split off what did not fit; it becomes the next chunk.
                queue.push_front(overflow);
                total += 1;
            }
            done += 1;

            if run.cancelled() {
                break;
            }
        }

        if run.cancelled() {
            let unprocessed: Vec<Recipient> = queue.into_iter().flatten().collect();
            run.settle_all(Bucket::NeedsAccount, unprocessed);
            run.status(format!(
                "Provisioning stopped by operator: {} recipients left without accounts.",
                run.buckets.needs_account.len()
            ));
            run.set_progress(100.0);
            return Ok(());
        }

        run.set_progress(100.0);
        run.status(format!(
            "Provisioning completed: {} recipients ready, {} failed.",
            run.buckets.has_account.len(),
            run.buckets.provision_failed.len()
        ));
        Ok(())
    }

    /// Handles one chunk. Returns the recipients that did not fit into the
    /// transaction, if any.
    async fn provision_chunk(
        &self,
        run: &mut RunState,
        chunk: Vec<Recipient>,
        number: usize,
    ) -> Result<Option<Vec<Recipient>>> {
        let payer = self.payer();
        let mint = self.settings().mint;
        let fee = self.settings().fees.provision;
        let cu_limit = self.settings().fees.compute_unit_limit;

        let accounts: Vec<Pubkey> = chunk
            .iter()
            .map(|r| self.receiving_account(r.address()))
            .collect();
        // Accounts created since the check need no instruction.
        let lookup = self
            .ledger()
            .get_multiple_accounts(&accounts)
            .await
            .and_then(|infos| aligned(infos, accounts.len()));
        let existing: Vec<bool> = match lookup {
            Ok(infos) => infos.iter().map(|info| is_token_account(info.as_ref())).collect(),
            Err(e) => {
                warn!(chunk = number, error = %e, "pre-build lookup failed");
                vec![false; chunk.len()]
            }
        };

        let mut present = Vec::new();
        let mut pending = Vec::new();
        let mut instructions: Vec<Instruction> = Vec::new();
        let mut overflow = Vec::new();
        let mut entries = chunk.into_iter().zip(accounts).zip(existing);

        while let Some(((mut recipient, account), exists)) = entries.next() {
            if run.cancelled() {
                let rest = std::iter::once(recipient).chain(entries.map(|((r, _), _)| r));
                self.abandon(run, present, pending, rest);
                return Ok(None);
            }

            recipient.set_account(account);
            if exists {
                present.push(recipient);
                continue;
            }

            instructions.push(provision_instruction(&payer, recipient.address(), &mint));
            let candidate = build_transaction(&instructions, &payer, fee, cu_limit, Hash::default());
            let (fits, size) = transaction_fits(&candidate);
            if !fits && instructions.len() > 1 {
                debug!(chunk = number, size, "transaction full, splitting chunk");
                instructions.pop();
                recipient.clear_account();
                overflow.push(recipient);
                overflow.extend(entries.by_ref().map(|((r, _), _)| r));
                break;
            }
            pending.push(recipient);

            pause(self.settings().pacing.instruction_delay, run.token()).await;
        }

        if run.cancelled() {
            self.abandon(run, present, pending, overflow);
            return Ok(None);
        }

        run.settle_all(Bucket::HasAccount, present);
        let overflow = (!overflow.is_empty()).then_some(overflow);
        if pending.is_empty() {
            run.status(format!("Chunk {number}: all accounts already exist."));
            return Ok(overflow);
        }

        let blockhash = match self.ledger().latest_blockhash().await {
            Ok(blockhash) => blockhash,
            Err(e) => {
                run.status(format!("Chunk {number}: failed to fetch blockhash: {e}"));
                for mut recipient in pending {
                    recipient.clear_account();
                    run.settle(Bucket::ProvisionFailed, recipient);
                }
                return Ok(overflow);
            }
        };
        let tx = build_transaction(&instructions, &payer, fee, cu_limit, blockhash.blockhash);

        if run.cancelled() {
            self.abandon(run, Vec::new(), pending, Vec::new());
            return Ok(overflow);
        }
        let submitted = self.wallet().sign_and_submit(tx).await;

        let outcome = match submitted {
            Ok(signature) => {
                if run.cancelled() {
                    // Sent, but nothing is marked until it is seen on chain.
                    self.abandon(run, Vec::new(), pending, Vec::new());
                    return Ok(overflow);
                }
                self.settings()
                    .provision_confirm
                    .confirm(self.ledger(), &signature, &blockhash, run.token())
                    .await
                    .map(|()| signature)
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(signature) => {
                let created = pending.len();
                let bucket = run.settle_all(Bucket::HasAccount, pending);
                if bucket == Bucket::HasAccount {
                    run.status(format!(
                        "Chunk {number}: created {created} accounts: {signature}"
                    ));
                }
            }
            Err(MultisendError::Cancelled) => {
                self.abandon(run, Vec::new(), pending, Vec::new());
            }
            Err(e) => {
                run.status(format!("Chunk {number}: account creation failed: {e}"));
                self.reverify(run, pending, number).await;
            }
        }
        Ok(overflow)
    }

    /// Keeps only the recipients whose accounts actually landed.
    async fn reverify(&self, run: &mut RunState, recipients: Vec<Recipient>, number: usize) {
        let mut kept = 0;
        let mut lost = 0;
        let mut remaining = recipients.into_iter();

        while let Some(mut recipient) = remaining.next() {
            if run.cancelled() {
                self.abandon(run, Vec::new(), vec![recipient], remaining.by_ref());
                break;
            }
            let Some(account) = recipient.account().copied() else {
                run.settle(Bucket::ProvisionFailed, recipient);
                lost += 1;
                continue;
            };
            match self.ledger().get_account(&account).await {
                Ok(info) if is_token_account(info.as_ref()) => {
                    if run.settle(Bucket::HasAccount, recipient) == Bucket::HasAccount {
                        kept += 1;
                    }
                }
                Ok(_) => {
                    recipient.clear_account();
                    run.settle(Bucket::ProvisionFailed, recipient);
                    lost += 1;
                }
                Err(e) => {
                    warn!(%account, error = %e, "re-verification lookup failed");
                    recipient.clear_account();
                    run.settle(Bucket::ProvisionFailed, recipient);
                    lost += 1;
                }
            }
        }

        run.status(format!(
            "Chunk {number}: re-verified, {kept} accounts exist, {lost} failed."
        ));
    }

    /// Returns a chunk to `needs-account` without marking anything.
    fn abandon(
        &self,
        run: &mut RunState,
        present: Vec<Recipient>,
        pending: Vec<Recipient>,
        rest: impl IntoIterator<Item = Recipient>,
    ) {
        let recipients = present.into_iter().chain(pending).chain(rest).map(|mut r| {
            r.clear_account();
            r
        });
        run.settle_all(Bucket::NeedsAccount, recipients);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ConfirmStep, FakeChain, LookupStep, SubmitStep};
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_provision_progress_scale() {
        assert_eq!(provision_progress(0, 4), 50.0);
        assert_eq!(provision_progress(2, 4), 75.0);
        assert_eq!(provision_progress(4, 4), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_of_ten() {
        let chain = FakeChain::new();
        let recipients = chain.recipients(25);
        let session = chain.session(CancellationToken::new());
        let mut run = session.run_state();
        let started = Instant::now();

        session.provision_accounts(&mut run, recipients.clone()).await.unwrap();

        // 200 ms after every instruction built.
        assert_eq!(started.elapsed().as_millis(), 5_000);
        // Compute price plus one create per recipient.
        let sizes: Vec<usize> = chain
            .submitted()
            .iter()
            .map(|tx| tx.message.instructions.len() - 1)
            .collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        assert_eq!(run.buckets.has_account.len(), 25);
        assert!(run.buckets.provision_failed.is_empty());
        assert!(recipients.iter().all(|r| chain.has_token_account(r.address())));
        assert_eq!(run.progress(), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sender_account_prepared_first() {
        let chain = FakeChain::new();
        chain.remove_account(&chain.payer());
        let session = chain.session(CancellationToken::new());
        let mut run = session.run_state();

        session.provision_accounts(&mut run, chain.recipients(2)).await.unwrap();

        let submitted = chain.submitted();
        assert_eq!(submitted.len(), 2);
        assert_eq!(submitted[0].message.instructions.len(), 2);
        assert!(chain.has_token_account(&chain.payer()));
        assert!(run.log()[0].starts_with("Sender token account"));
        assert_eq!(run.buckets.has_account.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_mode_one_per_transaction() {
        let chain = FakeChain::new();
        let mut settings = chain.settings();
        settings.single_mode = true;
        let session = chain.session_with(settings, CancellationToken::new());
        let mut run = session.run_state();

        session.provision_accounts(&mut run, chain.recipients(3)).await.unwrap();

        assert_eq!(chain.submitted().len(), 3);
        assert!(chain
            .submitted()
            .iter()
            .all(|tx| tx.message.instructions.len() == 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_error_reverified() {
        let chain = FakeChain::new();
        let recipients = chain.recipients(10);
        let landed: Vec<Pubkey> = recipients.iter().take(6).map(|r| *r.address()).collect();
        chain.script_submits([SubmitStep::RejectAfterLanding(landed.clone())]);

        let session = chain.session(CancellationToken::new());
        let mut run = session.run_state();
        session.provision_accounts(&mut run, recipients).await.unwrap();

        let kept: Vec<Pubkey> = run.buckets.has_account.iter().map(|r| *r.address()).collect();
        assert_eq!(kept, landed);
        assert_eq!(run.buckets.provision_failed.len(), 4);
        assert!(run
            .buckets
            .provision_failed
            .iter()
            .all(|r| r.account().is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_confirmation_still_lands() {
        let chain = FakeChain::new();
        let recipients = chain.recipients(10);
        chain.script_confirms([ConfirmStep::Pending]);
        let session = chain.session(CancellationToken::new());
        let mut run = session.run_state();
        let started = Instant::now();

        session.provision_accounts(&mut run, recipients.clone()).await.unwrap();

        assert_eq!(chain.confirm_calls(), 2);
        assert_eq!(run.buckets.has_account.len(), 10);
        assert!(run.buckets.provision_failed.is_empty());
        assert!(recipients.iter().all(|r| chain.has_token_account(r.address())));
        // Ten instruction gaps, then one poll interval.
        assert_eq!(started.elapsed().as_millis(), 4_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_onchain_failure_demotes_chunk() {
        let chain = FakeChain::new();
        chain.script_confirms([ConfirmStep::Fail("insufficient funds for rent".into())]);
        let session = chain.session(CancellationToken::new());
        let mut run = session.run_state();

        session.provision_accounts(&mut run, chain.recipients(4)).await.unwrap();

        assert_eq!(run.buckets.provision_failed.len(), 4);
        assert!(run.log().iter().any(|l| l.contains("insufficient funds")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_account_skipped() {
        let chain = FakeChain::new();
        let recipients = chain.recipients(3);
        chain.seed_token_account(recipients[1].address());
        let session = chain.session(CancellationToken::new());
        let mut run = session.run_state();

        session.provision_accounts(&mut run, recipients).await.unwrap();

        let submitted = chain.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].message.instructions.len(), 3);
        assert_eq!(run.buckets.has_account.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_lookup_creates_whole_chunk() {
        let chain = FakeChain::new();
        let recipients = chain.recipients(4);
        chain.seed_token_account(recipients[0].address());
        chain.script_lookups([LookupStep::Short]);
        let session = chain.session(CancellationToken::new());
        let mut run = session.run_state();

        session.provision_accounts(&mut run, recipients.clone()).await.unwrap();

        // Nothing is dropped; the idempotent create covers the existing one.
        assert_eq!(chain.submitted()[0].message.instructions.len(), 5);
        assert_eq!(run.buckets.has_account.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_chunk_split() {
        let chain = FakeChain::new();
        let mut settings = chain.settings();
        settings.provision_chunk_size = 20;
        let recipients = chain.recipients(20);
        let session = chain.session_with(settings, CancellationToken::new());
        let mut run = session.run_state();

        session.provision_accounts(&mut run, recipients.clone()).await.unwrap();

        let submitted = chain.submitted();
        assert_eq!(submitted.len(), 2);
        assert!(submitted.iter().all(|tx| transaction_fits(tx).0));
        assert_eq!(run.buckets.has_account.len(), 20);
        assert!(recipients.iter().all(|r| chain.has_token_account(r.address())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_submit_marks_nothing() {
        let chain = FakeChain::new();
        let cancel = CancellationToken::new();
        chain.cancel_after_submits(1, cancel.clone());
        let session = chain.session(cancel);
        let mut run = session.run_state();

        session.provision_accounts(&mut run, chain.recipients(15)).await.unwrap();

        assert_eq!(chain.submitted().len(), 1);
        assert_eq!(chain.confirm_calls(), 0);
        assert!(run.buckets.has_account.is_empty());
        assert_eq!(run.buckets.needs_account.len(), 15);
        assert!(run.buckets.needs_account.iter().all(|r| r.account().is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_start() {
        let chain = FakeChain::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let session = chain.session(cancel);
        let mut run = session.run_state();

        session.provision_accounts(&mut run, chain.recipients(5)).await.unwrap();

        assert!(chain.submitted().is_empty());
        assert_eq!(run.buckets.needs_account.len(), 5);
    }
}
