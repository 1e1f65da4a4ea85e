//! JSON-RPC backed implementations of the ledger and wallet capabilities.

use crate::{
    error::{MultisendError, Result},
    ledger::{Confirmation, Ledger, RecentBlockhash, Wallet},
};
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::{
    account::Account,
    commitment_config::CommitmentConfig,
    pubkey::Pubkey,
    signature::{Keypair, Signature, Signer},
    transaction::Transaction,
};
use solana_transaction_status::TransactionConfirmationStatus;
use std::{fs, num::NonZeroU32, path::Path, sync::Arc};
use tracing::{debug, instrument};

/// Requests per second used when the caller passes zero.
const DEFAULT_RATE_LIMIT: u32 = 10;

/// Shared RPC client throttled by a process-wide rate limiter.
#[derive(Clone)]
pub struct RpcLedger {
    client: Arc<RpcClient>,
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl RpcLedger {
    pub fn new(url: &str, requests_per_second: u32) -> Self {
        let client = RpcClient::new_with_commitment(url.to_string(), CommitmentConfig::confirmed());
        let rate = NonZeroU32::new(requests_per_second)
            .or(NonZeroU32::new(DEFAULT_RATE_LIMIT))
            .unwrap_or(NonZeroU32::MIN);
        Self {
            client: Arc::new(client),
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(rate))),
        }
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    async fn throttle(&self) {
        self.limiter.until_ready().await;
    }

    /// SOL balance of `address` in lamports.
    pub async fn balance(&self, address: &Pubkey) -> Result<u64> {
        self.throttle().await;
        Ok(self.client.get_balance(address).await?)
    }
}

#[async_trait]
impl Ledger for RpcLedger {
    async fn latest_blockhash(&self) -> Result<RecentBlockhash> {
        self.throttle().await;
        let (blockhash, last_valid_block_height) = self
            .client
            .get_latest_blockhash_with_commitment(self.client.commitment())
            .await?;
        Ok(RecentBlockhash {
            blockhash,
            last_valid_block_height,
        })
    }

    async fn get_account(&self, address: &Pubkey) -> Result<Option<Account>> {
        self.throttle().await;
        let response = self
            .client
            .get_account_with_commitment(address, self.client.commitment())
            .await?;
        Ok(response.value)
    }

    #[instrument(skip_all, fields(count = addresses.len()))]
    async fn get_multiple_accounts(&self, addresses: &[Pubkey]) -> Result<Vec<Option<Account>>> {
        self.throttle().await;
        Ok(self.client.get_multiple_accounts(addresses).await?)
    }

    async fn confirm(
        &self,
        signature: &Signature,
        blockhash: &RecentBlockhash,
    ) -> Result<Confirmation> {
        self.throttle().await;
        let statuses = self.client.get_signature_statuses(&[*signature]).await?.value;

        match statuses.into_iter().next().flatten() {
            Some(status) => {
                if let Some(err) = status.err {
                    return Ok(Confirmation::Failed(err.to_string()));
                }
                match status.confirmation_status {
                    Some(TransactionConfirmationStatus::Confirmed)
                    | Some(TransactionConfirmationStatus::Finalized) => Ok(Confirmation::Confirmed),
                    _ => Ok(Confirmation::Pending),
                }
            }
            None => {
                self.throttle().await;
                let height = self.client.get_block_height().await?;
                if height > blockhash.last_valid_block_height {
                    return Err(MultisendError::Expired(*signature));
                }
                debug!(%signature, height, "signature not found yet");
                Ok(Confirmation::Pending)
            }
        }
    }
}

/// Local signer that broadcasts through the same throttled client.
pub struct KeypairWallet {
    keypair: Keypair,
    ledger: RpcLedger,
}

impl KeypairWallet {
    pub fn new(keypair: Keypair, ledger: RpcLedger) -> Self {
        Self { keypair, ledger }
    }
}

#[async_trait]
impl Wallet for KeypairWallet {
    fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    async fn sign_and_submit(&self, mut transaction: Transaction) -> Result<Signature> {
        let blockhash = transaction.message.recent_blockhash;
        transaction
            .try_sign(&[&self.keypair], blockhash)
            .map_err(|e| MultisendError::SigningRejected(e.to_string()))?;

        self.ledger.throttle().await;
        let signature = self.ledger.client.send_transaction(&transaction).await?;
        debug!(%signature, "transaction sent");
        Ok(signature)
    }
}

/// Reads a keypair stored as a JSON byte array.
pub fn load_keypair(path: &Path) -> anyhow::Result<Keypair> {
    use anyhow::Context;

    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read keypair from {}", path.display()))?;
    let bytes: Vec<u8> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse keypair JSON from {}", path.display()))?;
    Keypair::from_bytes(&bytes)
        .with_context(|| format!("Invalid keypair format in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_keypair_roundtrip() {
        let keypair = Keypair::new();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let json = serde_json::to_string(&keypair.to_bytes().to_vec()).unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let loaded = load_keypair(file.path()).unwrap();
        assert_eq!(loaded.pubkey(), keypair.pubkey());
    }

    #[test]
    fn test_load_keypair_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[1, 2, 3]").unwrap();
        let err = load_keypair(file.path()).unwrap_err();
        assert!(err.to_string().contains("Invalid keypair format"));

        assert!(load_keypair(Path::new("/nonexistent/id.json")).is_err());
    }

    #[test]
    fn test_zero_rate_limit_falls_back() {
        // Constructing the client does not touch the network.
        let ledger = RpcLedger::new("http://127.0.0.1:8899", 0);
        assert_eq!(ledger.client().url(), "http://127.0.0.1:8899");
    }
}
