//! Run state for one operator-triggered stage: stage tag, status log,
//! progress and the result buckets.

use crate::recipient::{Recipient, Reject};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Checking,
    Provisioning,
    Transferring,
    Retrying,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Idle => "idle",
            Stage::Checking => "checking",
            Stage::Provisioning => "provisioning",
            Stage::Transferring => "transferring",
            Stage::Retrying => "retrying",
            Stage::Done => "done",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    HasAccount,
    NeedsAccount,
    ProvisionFailed,
    Sent,
    TransferFailed,
    RetrySucceeded,
    RetryFailed,
}

impl Bucket {
    pub fn is_success(self) -> bool {
        matches!(self, Bucket::HasAccount | Bucket::Sent | Bucket::RetrySucceeded)
    }

    /// Where a success lands instead once cancellation has been observed.
    pub fn on_cancel(self) -> Bucket {
        match self {
            Bucket::HasAccount => Bucket::NeedsAccount,
            Bucket::Sent => Bucket::TransferFailed,
            Bucket::RetrySucceeded => Bucket::RetryFailed,
            other => other,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Buckets {
    pub has_account: Vec<Recipient>,
    pub needs_account: Vec<Recipient>,
    pub provision_failed: Vec<Recipient>,
    pub sent: Vec<Recipient>,
    pub transfer_failed: Vec<Recipient>,
    pub retry_succeeded: Vec<Recipient>,
    pub retry_failed: Vec<Recipient>,
    pub rejected: Vec<Reject>,
}

impl Buckets {
    pub fn get(&self, bucket: Bucket) -> &[Recipient] {
        match bucket {
            Bucket::HasAccount => &self.has_account,
            Bucket::NeedsAccount => &self.needs_account,
            Bucket::ProvisionFailed => &self.provision_failed,
            Bucket::Sent => &self.sent,
            Bucket::TransferFailed => &self.transfer_failed,
            Bucket::RetrySucceeded => &self.retry_succeeded,
            Bucket::RetryFailed => &self.retry_failed,
        }
    }

    fn get_mut(&mut self, bucket: Bucket) -> &mut Vec<Recipient> {
        match bucket {
            Bucket::HasAccount => &mut self.has_account,
            Bucket::NeedsAccount => &mut self.needs_account,
            Bucket::ProvisionFailed => &mut self.provision_failed,
            Bucket::Sent => &mut self.sent,
            Bucket::TransferFailed => &mut self.transfer_failed,
            Bucket::RetrySucceeded => &mut self.retry_succeeded,
            Bucket::RetryFailed => &mut self.retry_failed,
        }
    }

    /// Buckets a stage writes to; they are emptied when the stage starts.
    fn outputs(stage: Stage) -> &'static [Bucket] {
        match stage {
            Stage::Checking => &[Bucket::HasAccount, Bucket::NeedsAccount],
            Stage::Provisioning => &[Bucket::ProvisionFailed],
            Stage::Transferring => &[Bucket::Sent, Bucket::TransferFailed],
            Stage::Retrying => &[Bucket::RetrySucceeded, Bucket::RetryFailed],
            Stage::Idle | Stage::Done => &[],
        }
    }
}

/// Ordered status lines plus a 0..=100 progress estimate, mirrored to the
/// log and to an optional terminal progress bar.
#[derive(Default)]
pub struct Reporter {
    lines: Vec<String>,
    progress: f64,
    bar: Option<ProgressBar>,
}

impl fmt::Debug for Reporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reporter")
            .field("lines", &self.lines.len())
            .field("progress", &self.progress)
            .field("bar", &self.bar.is_some())
            .finish()
    }
}

impl Reporter {
    pub fn with_bar() -> Self {
        let bar = ProgressBar::new(100);
        let style = ProgressStyle::with_template(
            "[{elapsed_precise}] {bar:40.cyan/blue} {pos:>3}% {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");
        bar.set_style(style);
        Self {
            bar: Some(bar),
            ..Self::default()
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    fn push(&mut self, stage: Stage, line: String) {
        info!(%stage, "{line}");
        if let Some(bar) = &self.bar {
            bar.set_message(line.clone());
        }
        self.lines.push(line);
    }

    fn set_progress(&mut self, pct: f64) {
        self.progress = pct.clamp(0.0, 100.0);
        if let Some(bar) = &self.bar {
            bar.set_position(self.progress.round() as u64);
        }
    }

    fn reset(&mut self) {
        self.lines.clear();
        self.set_progress(0.0);
    }

    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish();
        }
    }
}

/// Single state object for the pipeline. Success settlements are refused
/// once cancellation has been observed.
#[derive(Debug)]
pub struct RunState {
    stage: Stage,
    cancel: CancellationToken,
    cancel_observed: bool,
    pub buckets: Buckets,
    pub reporter: Reporter,
}

impl RunState {
    pub fn new(cancel: CancellationToken) -> Self {
        Self::with_reporter(cancel, Reporter::default())
    }

    pub fn with_reporter(cancel: CancellationToken, reporter: Reporter) -> Self {
        Self {
            stage: Stage::Idle,
            cancel,
            cancel_observed: false,
            buckets: Buckets::default(),
            reporter,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Enters `stage`: clears the log, progress, the cancellation latch and
    /// the buckets the stage produces.
    pub fn begin(&mut self, stage: Stage) {
        self.stage = stage;
        self.cancel_observed = false;
        self.reporter.reset();
        for bucket in Buckets::outputs(stage) {
            self.buckets.get_mut(*bucket).clear();
        }
    }

    pub fn finish(&mut self) {
        self.stage = Stage::Done;
    }

    /// Polls the cancellation token and latches the result.
    pub fn cancelled(&mut self) -> bool {
        if !self.cancel_observed && self.cancel.is_cancelled() {
            self.cancel_observed = true;
            let stage = self.stage;
            warn!(%stage, "cancellation observed");
        }
        self.cancel_observed
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn status(&mut self, line: impl Into<String>) {
        let stage = self.stage;
        self.reporter.push(stage, line.into());
    }

    pub fn set_progress(&mut self, pct: f64) {
        self.reporter.set_progress(pct);
    }

    pub fn progress(&self) -> f64 {
        self.reporter.progress()
    }

    pub fn log(&self) -> &[String] {
        self.reporter.lines()
    }

    /// Records `recipient` in `bucket`. A success after cancellation is
    /// redirected to the bucket's failure counterpart. Returns the bucket used.
    pub fn settle(&mut self, bucket: Bucket, recipient: Recipient) -> Bucket {
        let target = if bucket.is_success() && self.cancelled() {
            bucket.on_cancel()
        } else {
            bucket
        };
        self.buckets.get_mut(target).push(recipient);
        target
    }

    pub fn settle_all<I>(&mut self, bucket: Bucket, recipients: I) -> Bucket
    where
        I: IntoIterator<Item = Recipient>,
    {
        // Decide once so a whole group lands in the same bucket.
        let target = if bucket.is_success() && self.cancelled() {
            bucket.on_cancel()
        } else {
            bucket
        };
        self.buckets.get_mut(target).extend(recipients);
        target
    }
}
