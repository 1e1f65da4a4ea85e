//! Recipient records and the CSV input parser.

use crate::error::Result;
use csv::{Position, StringRecord, Trim};
use serde::Serialize;
use solana_sdk::pubkey::Pubkey;
use std::{fmt, io, str::FromStr};

/// One target of the airdrop.
///
/// The amount is fixed at parse time; only the receiving-account handle
/// changes as the recipient moves through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    address: Pubkey,
    amount: u64,
    account: Option<Pubkey>,
}

impl Recipient {
    pub fn new(address: Pubkey, amount: u64) -> Self {
        Self {
            address,
            amount,
            account: None,
        }
    }

    pub fn address(&self) -> &Pubkey {
        &self.address
    }

    /// Whole-token amount, before decimal scaling.
    pub fn amount(&self) -> u64 {
        self.amount
    }

    pub fn account(&self) -> Option<&Pubkey> {
        self.account.as_ref()
    }

    pub fn set_account(&mut self, account: Pubkey) {
        self.account = Some(account);
    }

    pub fn clear_account(&mut self) {
        self.account = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RejectReason {
    #[serde(rename = "missing field")]
    MissingField,
    #[serde(rename = "invalid address")]
    InvalidAddress,
    #[serde(rename = "invalid amount")]
    InvalidAmount,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::MissingField => "missing field",
            RejectReason::InvalidAddress => "invalid address",
            RejectReason::InvalidAmount => "invalid amount",
        };
        f.write_str(s)
    }
}

/// An input line that did not produce a recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reject {
    /// 1-based line number, counted from the first non-blank line.
    pub line: usize,
    /// Address column as written, or the raw line when the address is absent.
    pub address: String,
    pub reason: RejectReason,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParsedInput {
    pub recipients: Vec<Recipient>,
    pub rejects: Vec<Reject>,
}

/// Parses `address,amount` records. Malformed records are collected, never fatal.
pub fn parse_recipients(text: &str) -> Result<ParsedInput> {
    read_recipients(text.as_bytes())
}

/// Reads `address,amount` records from any CSV source.
///
/// Quoted fields and surrounding whitespace are accepted. A leading
/// `address,amount` header, as written by the exports, is skipped but still
/// counts as line 1. Blank lines between records are rejected as
/// `missing field`; leading and trailing blank lines are ignored.
pub fn read_recipients<R: io::Read>(input: R) -> Result<ParsedInput> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(input);

    let mut parsed = ParsedInput::default();
    // Line numbers count from the first non-blank line.
    let mut first_line: Option<u64> = None;
    let mut last_line = 0;
    let mut blanks: Vec<u64> = Vec::new();

    for result in reader.byte_records() {
        let record = result?;
        let line = record.position().map_or(last_line + 1, Position::line);
        let record = StringRecord::from_byte_record_lossy(record);

        // Empty lines never reach us as records; recover them from the gap.
        if first_line.is_some() {
            blanks.extend(last_line + 1..line);
        }
        last_line = line;

        if record.iter().all(str::is_empty) {
            if first_line.is_some() {
                blanks.push(line);
            }
            continue;
        }

        let first = *first_line.get_or_insert(line);
        for blank in blanks.drain(..) {
            parsed.rejects.push(Reject {
                line: relative_line(blank, first),
                address: String::new(),
                reason: RejectReason::MissingField,
            });
        }
        if line == first && is_header(&record) {
            continue;
        }

        match parse_record(&record) {
            Ok(recipient) => parsed.recipients.push(recipient),
            Err((address, reason)) => parsed.rejects.push(Reject {
                line: relative_line(line, first),
                address,
                reason,
            }),
        }
    }
    Ok(parsed)
}

fn relative_line(line: u64, first: u64) -> usize {
    (line - first + 1) as usize
}

fn is_header(record: &StringRecord) -> bool {
    matches!(
        (record.get(0), record.get(1)),
        (Some(address), Some(amount))
            if address.eq_ignore_ascii_case("address") && amount.eq_ignore_ascii_case("amount")
    )
}

/// Validates a single record. On rejection returns the address column (or
/// the whole record) together with the first failing check.
pub fn parse_record(record: &StringRecord) -> Result<Recipient, (String, RejectReason)> {
    let address = record.get(0).map(str::trim).unwrap_or_default();
    let amount = record.get(1).map(str::trim).unwrap_or_default();

    if address.is_empty() || amount.is_empty() {
        let shown = if address.is_empty() {
            record.iter().collect::<Vec<_>>().join(",")
        } else {
            address.to_string()
        };
        return Err((shown, RejectReason::MissingField));
    }

    let pubkey = match Pubkey::from_str(address) {
        Ok(pubkey) => pubkey,
        Err(_) => return Err((address.to_string(), RejectReason::InvalidAddress)),
    };

    match parse_amount(amount) {
        Some(amount) => Ok(Recipient::new(pubkey, amount)),
        None => Err((address.to_string(), RejectReason::InvalidAmount)),
    }
}

/// Positive base-10 integer, surrounding whitespace ignored.
pub fn parse_amount(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse::<u64>().ok().filter(|amount| *amount > 0)
}

/// Splits recipients into consecutive groups of at most `size` (minimum 1).
pub fn chunks(recipients: &[Recipient], size: usize) -> impl Iterator<Item = &[Recipient]> {
    recipients.chunks(size.max(1))
}

/// Keeps the last record per address, preserving first-seen order.
pub fn dedup_by_address(recipients: &[Recipient]) -> Vec<Recipient> {
    let mut out: Vec<Recipient> = Vec::with_capacity(recipients.len());
    for recipient in recipients {
        match out.iter_mut().find(|r| r.address == recipient.address) {
            Some(existing) => *existing = recipient.clone(),
            None => out.push(recipient.clone()),
        }
    }
    out
}
