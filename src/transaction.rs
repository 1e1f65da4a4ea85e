use crate::error::{MultisendError, Result};
use solana_sdk::{
    compute_budget::ComputeBudgetInstruction, hash::Hash, instruction::Instruction,
    message::Message, packet::PACKET_DATA_SIZE, pubkey::Pubkey, transaction::Transaction,
};
use spl_associated_token_account::{
    get_associated_token_address, instruction::create_associated_token_account_idempotent,
};

/// Receiving account for `owner` of `mint`.
pub fn receiving_account(owner: &Pubkey, mint: &Pubkey) -> Pubkey {
    get_associated_token_address(owner, mint)
}

pub fn provision_instruction(payer: &Pubkey, owner: &Pubkey, mint: &Pubkey) -> Instruction {
    create_associated_token_account_idempotent(payer, owner, mint, &spl_token::id())
}

/// Plain `Transfer`: three accounts per instruction keeps twenty of them
/// inside a single packet.
pub fn transfer_instruction(
    source: &Pubkey,
    destination: &Pubkey,
    authority: &Pubkey,
    base_units: u64,
) -> Result<Instruction> {
    spl_token::instruction::transfer(
        &spl_token::id(),
        source,
        destination,
        authority,
        &[],
        base_units,
    )
    .map_err(|e| MultisendError::Instruction(e.to_string()))
}

/// Unsigned legacy transaction with the priority-fee prefix.
pub fn build_transaction(
    instructions: &[Instruction],
    payer: &Pubkey,
    priority_fee: u64,
    cu_limit: Option<u32>,
    blockhash: Hash,
) -> Transaction {
    let mut all_instructions = Vec::with_capacity(instructions.len() + 2);
    if let Some(limit) = cu_limit {
        all_instructions.push(ComputeBudgetInstruction::set_compute_unit_limit(limit));
    }
    all_instructions.push(ComputeBudgetInstruction::set_compute_unit_price(priority_fee));
    all_instructions.extend_from_slice(instructions);

    let message = Message::new_with_blockhash(&all_instructions, Some(payer), &blockhash);
    Transaction::new_unsigned(message)
}

/// Serialized size check against the packet limit (which already excludes
/// IP and UDP headers). Unsigned transactions carry placeholder signatures,
/// so the size matches the signed form.
pub fn transaction_fits(tx: &Transaction) -> (bool, usize) {
    let mut buf = Vec::with_capacity(PACKET_DATA_SIZE);
    if bincode::serialize_into(&mut buf, tx).is_err() {
        return (false, 0);
    }
    let size = buf.len();
    (size <= PACKET_DATA_SIZE, size)
}

pub fn ensure_fits(tx: &Transaction) -> Result<()> {
    match transaction_fits(tx) {
        (true, _) => Ok(()),
        (false, size) => Err(MultisendError::TransactionTooLarge(size)),
    }
}
