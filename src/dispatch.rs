//! Token transfers to recipients whose receiving accounts exist.

use crate::{
    error::{MultisendError, Result},
    recipient::{chunks, Recipient},
    session::Session,
    state::{Bucket, RunState, Stage},
    transaction::{build_transaction, ensure_fits, transfer_instruction},
};
use solana_sdk::{instruction::Instruction, pubkey::Pubkey, signature::Signature};
use tracing::warn;

pub fn transfer_progress(done: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    done as f64 / total as f64 * 100.0
}

impl Session {
    /// Sends every recipient its amount, one transaction per chunk.
    ///
    /// A chunk lands entirely in `sent` or entirely in `transfer-failed`.
    /// Fails before building anything when the sender has no token account.
    pub async fn dispatch_transfers(
        &self,
        run: &mut RunState,
        recipients: Vec<Recipient>,
    ) -> Result<()> {
        run.begin(Stage::Transferring);
        let source = self.require_sender_account().await?;

        let chunk_size = self.settings().effective_transfer_chunk();
        let total = recipients.len().div_ceil(chunk_size);
        run.status(format!(
            "Sending tokens to {} recipients in {total} transactions...",
            recipients.len()
        ));

        let mut done = 0;
        for chunk in chunks(&recipients, chunk_size) {
            if run.cancelled() {
                break;
            }
            self.transfer_chunk(run, &source, chunk.to_vec(), done + 1).await;
            done += 1;
            run.set_progress(transfer_progress(done, total));
        }

        if run.cancelled() {
            let unsent = recipients.iter().skip(done * chunk_size).cloned();
            run.settle_all(Bucket::TransferFailed, unsent);
            run.set_progress(100.0);
            run.status(format!(
                "Transfers stopped by operator: {} sent, {} not sent.",
                run.buckets.sent.len(),
                run.buckets.transfer_failed.len()
            ));
            return Ok(());
        }

        run.set_progress(100.0);
        run.status(format!(
            "Transfers completed: {} sent, {} failed.",
            run.buckets.sent.len(),
            run.buckets.transfer_failed.len()
        ));
        Ok(())
    }

    async fn transfer_chunk(
        &self,
        run: &mut RunState,
        source: &Pubkey,
        chunk: Vec<Recipient>,
        number: usize,
    ) {
        let payer = self.payer();
        let mut included = Vec::with_capacity(chunk.len());
        let mut instructions: Vec<Instruction> = Vec::with_capacity(chunk.len());

        for recipient in chunk {
            match self.transfer_for(source, &payer, &recipient) {
                Ok(ix) => {
                    instructions.push(ix);
                    included.push(recipient);
                }
                Err(e) => {
                    run.status(format!("Skipping {}: {e}", recipient.address()));
                    run.settle(Bucket::TransferFailed, recipient);
                }
            }
        }
        if included.is_empty() {
            return;
        }

        match self.send_transfers(run, &payer, &instructions).await {
            Ok(signature) => {
                let count = included.len();
                if run.settle_all(Bucket::Sent, included) == Bucket::Sent {
                    run.status(format!("Chunk {number}: sent to {count} recipients: {signature}"));
                }
            }
            Err(MultisendError::Cancelled) => {
                run.settle_all(Bucket::TransferFailed, included);
            }
            Err(e) => {
                warn!(chunk = number, error = %e, "transfer chunk failed");
                run.status(format!("Chunk {number}: transfer failed: {e}"));
                run.settle_all(Bucket::TransferFailed, included);
            }
        }
    }

    fn transfer_for(
        &self,
        source: &Pubkey,
        payer: &Pubkey,
        recipient: &Recipient,
    ) -> Result<Instruction> {
        let destination = recipient
            .account()
            .ok_or(MultisendError::AccountNotProvisioned(*recipient.address()))?;
        let units = self
            .settings()
            .scale(recipient.amount())
            .ok_or(MultisendError::AmountOverflow {
                amount: recipient.amount(),
                decimals: self.settings().decimals,
            })?;
        transfer_instruction(source, destination, payer, units)
    }

    async fn send_transfers(
        &self,
        run: &mut RunState,
        payer: &Pubkey,
        instructions: &[Instruction],
    ) -> Result<Signature> {
        let fees = &self.settings().fees;
        let blockhash = self.ledger().latest_blockhash().await?;
        let tx = build_transaction(
            instructions,
            payer,
            fees.transfer,
            fees.compute_unit_limit,
            blockhash.blockhash,
        );
        ensure_fits(&tx)?;

        if run.cancelled() {
            return Err(MultisendError::Cancelled);
        }
        let signature = self.wallet().sign_and_submit(tx).await?;
        self.settings()
            .transfer_confirm
            .confirm(self.ledger(), &signature, &blockhash, run.token())
            .await?;
        Ok(signature)
    }
}
