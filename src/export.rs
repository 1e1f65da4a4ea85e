//! CSV exports of every bucket, a JSON run summary, and input loading.

use crate::{
    error::Result,
    recipient::{dedup_by_address, read_recipients, ParsedInput, Recipient, Reject, RejectReason},
    state::{Bucket, RunState, Stage},
};
use chrono::Utc;
use serde::Serialize;
use solana_sdk::{hash::hash, pubkey::Pubkey};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub const HAS_ACCOUNT_FILE: &str = "ata_success_recipients.csv";
pub const NEEDS_ACCOUNT_FILE: &str = "ata_missing_recipients.csv";
pub const PROVISION_FAILED_FILE: &str = "ata_failed_recipients.csv";
pub const SENT_FILE: &str = "token_sent_recipients.csv";
pub const TRANSFER_FAILED_FILE: &str = "token_failed_recipients.csv";
pub const RETRY_SUCCEEDED_FILE: &str = "retry_success_recipients.csv";
pub const RETRY_FAILED_FILE: &str = "retry_failed_recipients.csv";
pub const REJECTED_FILE: &str = "filtered_addresses.csv";
pub const SUMMARY_FILE: &str = "summary.json";

pub fn file_name(bucket: Bucket) -> &'static str {
    match bucket {
        Bucket::HasAccount => HAS_ACCOUNT_FILE,
        Bucket::NeedsAccount => NEEDS_ACCOUNT_FILE,
        Bucket::ProvisionFailed => PROVISION_FAILED_FILE,
        Bucket::Sent => SENT_FILE,
        Bucket::TransferFailed => TRANSFER_FAILED_FILE,
        Bucket::RetrySucceeded => RETRY_SUCCEEDED_FILE,
        Bucket::RetryFailed => RETRY_FAILED_FILE,
    }
}

const ALL_BUCKETS: [Bucket; 7] = [
    Bucket::HasAccount,
    Bucket::NeedsAccount,
    Bucket::ProvisionFailed,
    Bucket::Sent,
    Bucket::TransferFailed,
    Bucket::RetrySucceeded,
    Bucket::RetryFailed,
];

#[derive(Serialize)]
struct RecipientRow {
    address: String,
    amount: u64,
}

#[derive(Serialize)]
struct RejectRow<'a> {
    address: &'a str,
    reason: RejectReason,
}

pub fn write_recipients(path: &Path, recipients: &[Recipient]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    if recipients.is_empty() {
        writer.write_record(["address", "amount"])?;
    }
    for recipient in recipients {
        writer.serialize(RecipientRow {
            address: recipient.address().to_string(),
            amount: recipient.amount(),
        })?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_rejects(path: &Path, rejects: &[Reject]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    if rejects.is_empty() {
        writer.write_record(["address", "reason"])?;
    }
    for reject in rejects {
        writer.serialize(RejectRow {
            address: &reject.address,
            reason: reject.reason,
        })?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct Counts {
    pub has_account: usize,
    pub needs_account: usize,
    pub provision_failed: usize,
    pub sent: usize,
    pub transfer_failed: usize,
    pub retry_succeeded: usize,
    pub retry_failed: usize,
    pub rejected: usize,
}

#[derive(Debug, Serialize)]
pub struct Summary<'a> {
    pub generated_at: String,
    pub stage: Stage,
    pub progress: f64,
    pub counts: Counts,
    pub log: &'a [String],
}

impl<'a> Summary<'a> {
    pub fn of(run: &'a RunState) -> Self {
        let b = &run.buckets;
        Self {
            generated_at: Utc::now().to_rfc3339(),
            stage: run.stage(),
            progress: run.progress(),
            counts: Counts {
                has_account: b.has_account.len(),
                needs_account: b.needs_account.len(),
                provision_failed: b.provision_failed.len(),
                sent: b.sent.len(),
                transfer_failed: b.transfer_failed.len(),
                retry_succeeded: b.retry_succeeded.len(),
                retry_failed: b.retry_failed.len(),
                rejected: b.rejected.len(),
            },
            log: run.log(),
        }
    }
}

/// Writes every non-empty bucket plus `summary.json` into `dir`.
/// Returns the files written.
pub fn export_run(dir: &Path, run: &RunState) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    let mut written = Vec::new();

    for bucket in ALL_BUCKETS {
        let recipients = run.buckets.get(bucket);
        if recipients.is_empty() {
            continue;
        }
        let path = dir.join(file_name(bucket));
        if bucket == Bucket::NeedsAccount {
            write_recipients(&path, &dedup_by_address(recipients))?;
        } else {
            write_recipients(&path, recipients)?;
        }
        written.push(path);
    }

    if !run.buckets.rejected.is_empty() {
        let path = dir.join(REJECTED_FILE);
        write_rejects(&path, &run.buckets.rejected)?;
        written.push(path);
    }

    let path = dir.join(SUMMARY_FILE);
    fs::write(&path, serde_json::to_string_pretty(&Summary::of(run))?)?;
    written.push(path);
    Ok(written)
}

/// Reads an input file, including the exports of an earlier run.
pub fn load_recipients(path: &Path) -> Result<ParsedInput> {
    read_recipients(fs::File::open(path)?)
}

/// Writes `count` random recipients without a header, each receiving `amount`.
pub fn generate_recipients(path: &Path, count: usize, amount: u64) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    let stamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    for i in 0..count {
        let seed = format!("recipient_{stamp}_{i}");
        let address = Pubkey::new_from_array(hash(seed.as_bytes()).to_bytes());
        writer.write_record([address.to_string(), amount.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}
