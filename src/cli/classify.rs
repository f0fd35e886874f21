use colored::Colorize;

use super::open_ledger;
use crate::error::{ReconError, Result};
use crate::models::TransactionType;

pub fn run(bank_tx: i64, raw_type: &str) -> Result<()> {
    let transaction_type: TransactionType = raw_type.parse()?;
    if transaction_type == TransactionType::Unknown {
        return Err(ReconError::Other("classify needs a concrete transaction type".into()));
    }
    let (_, ledger) = open_ledger()?;
    ledger.set_bank_transaction_type(bank_tx, transaction_type)?;
    println!("{}", format!("Bank transaction {bank_tx} is now {transaction_type}").green());
    Ok(())
}
