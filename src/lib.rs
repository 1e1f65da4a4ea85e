//! Batch SPL token airdrop: parse a recipient list, make sure every
//! recipient has a receiving account, send the tokens in chunks and retry
//! the stragglers one by one.

pub mod check;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod estimate;
pub mod export;
pub mod ledger;
pub mod policy;
pub mod provision;
pub mod recipient;
pub mod retry;
pub mod rpc;
pub mod session;
pub mod shutdown;
pub mod state;
pub mod transaction;

#[cfg(test)]
mod testing;

pub use config::Settings;
pub use error::{MultisendError, Result};
pub use ledger::{Ledger, Wallet};
pub use recipient::{parse_recipients, ParsedInput, Recipient};
pub use session::Session;
pub use state::{Bucket, RunState, Stage};
