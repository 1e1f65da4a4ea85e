use crate::{config::Settings, recipient::Recipient};
use solana_sdk::native_token::lamports_to_sol;
use std::fmt;

/// Rent-exempt minimum of a 165-byte token account.
pub const ACCOUNT_RENT_LAMPORTS: u64 = 2_039_280;
/// Signature fee for a single-signer transaction.
pub const BASE_FEE_LAMPORTS: u64 = 5_000;
/// Compute units assumed per transaction when pricing the priority fee.
pub const ESTIMATED_COMPUTE_UNITS: u64 = 200_000;

/// Up-front SOL cost of an airdrop, computed from the account check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CostEstimate {
    pub recipients: usize,
    pub accounts_to_create: usize,
    pub total_units: u128,
    pub decimals: u8,
    pub provision_txs: u64,
    pub transfer_txs: u64,
    pub rent_lamports: u64,
    pub provision_fee_lamports: u64,
    pub transfer_fee_lamports: u64,
}

/// Base fee plus priority fee for one transaction, in lamports.
pub fn transaction_fee(micro_lamports_per_cu: u64) -> u64 {
    let priority = (micro_lamports_per_cu as u128 * ESTIMATED_COMPUTE_UNITS as u128)
        .div_ceil(1_000_000);
    BASE_FEE_LAMPORTS.saturating_add(u64::try_from(priority).unwrap_or(u64::MAX))
}

impl CostEstimate {
    pub fn new(recipients: &[Recipient], accounts_to_create: usize, settings: &Settings) -> Self {
        let provision_txs = accounts_to_create.div_ceil(settings.effective_provision_chunk()) as u64;
        let transfer_txs = recipients.len().div_ceil(settings.effective_transfer_chunk()) as u64;
        let factor = 10u128.checked_pow(settings.decimals as u32).unwrap_or(u128::MAX);
        let total_units = recipients
            .iter()
            .fold(0u128, |total, r| total.saturating_add((r.amount() as u128).saturating_mul(factor)));

        Self {
            recipients: recipients.len(),
            accounts_to_create,
            total_units,
            decimals: settings.decimals,
            provision_txs,
            transfer_txs,
            rent_lamports: ACCOUNT_RENT_LAMPORTS.saturating_mul(accounts_to_create as u64),
            provision_fee_lamports: provision_txs
                .saturating_mul(transaction_fee(settings.fees.provision)),
            transfer_fee_lamports: transfer_txs
                .saturating_mul(transaction_fee(settings.fees.transfer)),
        }
    }

    pub fn total_lamports(&self) -> u64 {
        self.rent_lamports
            .saturating_add(self.provision_fee_lamports)
            .saturating_add(self.transfer_fee_lamports)
    }

    fn total_tokens(&self) -> String {
        let factor = 10u128.checked_pow(self.decimals as u32).unwrap_or(u128::MAX);
        let whole = self.total_units / factor;
        let frac = self.total_units % factor;
        if frac == 0 {
            whole.to_string()
        } else {
            format!("{whole}.{frac:0width$}", width = self.decimals as usize)
        }
    }
}

impl fmt::Display for CostEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Recipients: {}", self.recipients)?;
        writeln!(f, "Accounts to create: {}", self.accounts_to_create)?;
        writeln!(f, "Total tokens: {}", self.total_tokens())?;
        writeln!(f, "Estimated SOL costs:")?;
        if self.accounts_to_create > 0 {
            writeln!(
                f,
                "  Account rent: {} x {} = {:.6} SOL",
                self.accounts_to_create,
                lamports_to_sol(ACCOUNT_RENT_LAMPORTS),
                lamports_to_sol(self.rent_lamports)
            )?;
            writeln!(
                f,
                "  Account transactions: {} = {:.6} SOL",
                self.provision_txs,
                lamports_to_sol(self.provision_fee_lamports)
            )?;
        }
        writeln!(
            f,
            "  Transfer transactions: {} = {:.6} SOL",
            self.transfer_txs,
            lamports_to_sol(self.transfer_fee_lamports)
        )?;
        write!(
            f,
            "  Total: {:.6} SOL (add 10-20% for retries)",
            lamports_to_sol(self.total_lamports())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::pubkey::Pubkey;

    fn recipients(n: usize) -> Vec<Recipient> {
        (0..n).map(|_| Recipient::new(Pubkey::new_unique(), 3)).collect()
    }

    #[test]
    fn test_transaction_fee() {
        assert_eq!(transaction_fee(0), 5_000);
        // 100k micro-lamports over 200k CU is 20k lamports.
        assert_eq!(transaction_fee(100_000), 25_000);
    }

    #[test]
    fn test_estimate_counts() {
        let settings = Settings::new(Pubkey::new_unique(), 6);
        let estimate = CostEstimate::new(&recipients(45), 12, &settings);

        assert_eq!(estimate.provision_txs, 2);
        assert_eq!(estimate.transfer_txs, 3);
        assert_eq!(estimate.rent_lamports, 12 * 2_039_280);
        assert_eq!(estimate.provision_fee_lamports, 10_000);
        assert_eq!(estimate.transfer_fee_lamports, 75_000);
        assert_eq!(estimate.total_lamports(), 24_471_360 + 85_000);
        assert_eq!(estimate.total_tokens(), "135");
    }

    #[test]
    fn test_display_skips_rent_when_nothing_to_create() {
        let settings = Settings::new(Pubkey::new_unique(), 2);
        let text = CostEstimate::new(&recipients(1), 0, &settings).to_string();
        assert!(!text.contains("Account rent"));
        assert!(text.contains("Total tokens: 3"));
        assert!(text.contains("Transfer transactions: 1"));
    }
}
