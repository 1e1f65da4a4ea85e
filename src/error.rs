use solana_client::client_error::ClientError;
use solana_sdk::{pubkey::Pubkey, signature::Signature};
use thiserror::Error;

pub type Result<T, E = MultisendError> = std::result::Result<T, E>;

/// Errors raised by the airdrop pipeline and its collaborators.
#[derive(Debug, Error)]
pub enum MultisendError {
    /// RPC client error from the ledger node.
    #[error("RPC error: {0}")]
    Rpc(#[from] Box<ClientError>),

    /// The ledger could not be reached or answered with a transient failure.
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    #[error("Wallet rejected the transaction: {0}")]
    SigningRejected(String),

    #[error("Transaction {signature} failed on chain: {reason}")]
    TransactionFailed { signature: Signature, reason: String },

    #[error("Transaction {signature} not confirmed after {attempts} attempts")]
    NotConfirmed { signature: Signature, attempts: u32 },

    /// The blockhash the transaction was built against is no longer valid.
    #[error("Transaction {0} expired before confirmation")]
    Expired(Signature),

    #[error("Failed to build instruction: {0}")]
    Instruction(String),

    #[error("Transaction would be {0} bytes, over the packet limit")]
    TransactionTooLarge(usize),

    #[error("Amount {amount} overflows when scaled by 10^{decimals}")]
    AmountOverflow { amount: u64, decimals: u8 },

    #[error("Receiving account for {0} is not provisioned")]
    AccountNotProvisioned(Pubkey),

    #[error("Sender token account {0} does not exist")]
    MissingSenderAccount(Pubkey),

    #[error("Invalid mint account {mint}: {reason}")]
    InvalidMint { mint: Pubkey, reason: String },

    #[error("No valid recipients to process")]
    NoRecipients,

    #[error("Processing stopped by operator")]
    Cancelled,

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize data to JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ClientError> for MultisendError {
    fn from(err: ClientError) -> Self {
        MultisendError::Rpc(Box::new(err))
    }
}
