use crate::policy::RetryPolicy;
use solana_sdk::pubkey::Pubkey;
use std::time::Duration;

/// Largest chunk a single transaction may carry.
pub const MAX_CHUNK_SIZE: usize = 20;
/// Multi-account lookups are capped at 100 addresses per RPC call.
pub const CHECK_BATCH_SIZE: usize = 100;
pub const PROVISION_CHUNK_SIZE: usize = 10;
pub const TRANSFER_CHUNK_SIZE: usize = 20;

/// Compute-unit prices in micro-lamports, escalating per stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSchedule {
    pub provision: u64,
    pub transfer: u64,
    pub retry_combined: u64,
    pub retry_split: u64,
    /// Explicit compute-unit limit; the runtime default applies when unset.
    pub compute_unit_limit: Option<u32>,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            provision: 0,
            transfer: 100_000,
            retry_combined: 500_000,
            retry_split: 1_000_000,
            compute_unit_limit: None,
        }
    }
}

/// Fixed waits that keep the pipeline under public RPC rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub check_batch_delay: Duration,
    pub instruction_delay: Duration,
    pub retry_recipient_delay: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            check_batch_delay: Duration::from_millis(200),
            instruction_delay: Duration::from_millis(200),
            retry_recipient_delay: Duration::from_millis(200),
        }
    }
}

impl Pacing {
    pub fn none() -> Self {
        Self {
            check_batch_delay: Duration::ZERO,
            instruction_delay: Duration::ZERO,
            retry_recipient_delay: Duration::ZERO,
        }
    }
}

/// Everything a pipeline run needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct Settings {
    pub mint: Pubkey,
    pub decimals: u8,
    pub check_batch_size: usize,
    pub provision_chunk_size: usize,
    /// Forces provisioning to one recipient per transaction.
    pub single_mode: bool,
    pub transfer_chunk_size: usize,
    /// Feed unprovisioned recipients into the retry stage as well.
    pub retry_unprovisioned: bool,
    pub fees: FeeSchedule,
    pub pacing: Pacing,
    pub provision_confirm: RetryPolicy,
    pub transfer_confirm: RetryPolicy,
    pub retry_confirm: RetryPolicy,
}

impl Settings {
    pub fn new(mint: Pubkey, decimals: u8) -> Self {
        Self {
            mint,
            decimals,
            check_batch_size: CHECK_BATCH_SIZE,
            provision_chunk_size: PROVISION_CHUNK_SIZE,
            single_mode: false,
            transfer_chunk_size: TRANSFER_CHUNK_SIZE,
            retry_unprovisioned: true,
            fees: FeeSchedule::default(),
            pacing: Pacing::default(),
            provision_confirm: RetryPolicy::once(),
            transfer_confirm: RetryPolicy::new(3, Duration::from_secs(5)),
            retry_confirm: RetryPolicy::new(3, Duration::from_secs(2)),
        }
    }

    pub fn effective_provision_chunk(&self) -> usize {
        if self.single_mode {
            1
        } else {
            self.provision_chunk_size.clamp(1, MAX_CHUNK_SIZE)
        }
    }

    pub fn effective_check_batch(&self) -> usize {
        self.check_batch_size.clamp(1, CHECK_BATCH_SIZE)
    }

    pub fn effective_transfer_chunk(&self) -> usize {
        self.transfer_chunk_size.clamp(1, MAX_CHUNK_SIZE)
    }

    /// Converts a whole-token amount into base units.
    pub fn scale(&self, amount: u64) -> Option<u64> {
        10u64
            .checked_pow(self.decimals as u32)
            .and_then(|factor| amount.checked_mul(factor))
    }
}
