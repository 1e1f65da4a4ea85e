use crate::{
    error::{MultisendError, Result},
    ledger::{Confirmation, Ledger, RecentBlockhash},
};
use solana_sdk::signature::Signature;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Interval between status polls while a transaction is still in flight.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Longest a single attempt keeps polling a pending transaction. A blockhash
/// stays valid for about 150 blocks, so expiry normally ends the wait first.
pub const MAX_WAIT: Duration = Duration::from_secs(90);

/// How many times to wait for confirmation and how long to back off in between.
///
/// Each attempt polls every `poll_interval` while the transaction is pending,
/// until it is confirmed, fails, expires, or `max_wait` passes. Transport
/// errors end the attempt early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
            poll_interval: POLL_INTERVAL,
            max_wait: MAX_WAIT,
        }
    }

    pub const fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub const fn with_wait(mut self, poll_interval: Duration, max_wait: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.max_wait = max_wait;
        self
    }

    /// Waits for the transaction until it is confirmed, reported failed,
    /// expired, or the attempt budget is spent. Runtime errors and expiry are
    /// final; transport errors and attempts that time out while pending are
    /// retried after `backoff`.
    pub async fn confirm(
        &self,
        ledger: &dyn Ledger,
        signature: &Signature,
        blockhash: &RecentBlockhash,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let attempts = self.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(MultisendError::Cancelled);
            }

            match self.wait(ledger, signature, blockhash, cancel).await {
                Ok(Confirmation::Confirmed) => return Ok(()),
                Ok(Confirmation::Failed(reason)) => {
                    return Err(MultisendError::TransactionFailed {
                        signature: *signature,
                        reason,
                    })
                }
                Err(e @ (MultisendError::Expired(_) | MultisendError::Cancelled)) => return Err(e),
                Ok(Confirmation::Pending) => {
                    debug!(%signature, attempt, "transaction still pending");
                    last_error = None;
                }
                Err(e) => {
                    warn!(%signature, attempt, error = %e, "confirmation attempt failed");
                    last_error = Some(e);
                }
            }

            if attempt < attempts && !pause(self.backoff, cancel).await {
                return Err(MultisendError::Cancelled);
            }
        }

        Err(last_error.unwrap_or(MultisendError::NotConfirmed {
            signature: *signature,
            attempts,
        }))
    }

    /// One attempt: polls while pending. Returns `Pending` only once
    /// `max_wait` has passed.
    async fn wait(
        &self,
        ledger: &dyn Ledger,
        signature: &Signature,
        blockhash: &RecentBlockhash,
        cancel: &CancellationToken,
    ) -> Result<Confirmation> {
        let started = Instant::now();
        loop {
            let status = ledger.confirm(signature, blockhash).await?;
            if status != Confirmation::Pending || started.elapsed() >= self.max_wait {
                return Ok(status);
            }
            if !pause(self.poll_interval, cancel).await {
                return Err(MultisendError::Cancelled);
            }
        }
    }
}

/// Sleeps for `duration` unless cancelled first. Returns false on cancellation.
pub(crate) async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(duration) => true,
    }
}
