//! Hand-made matches and their reversal. Both go through the recorder so the
//! result log stays complete.

use colored::Colorize;

use super::open_ledger;
use crate::error::{ReconError, Result};
use crate::ledger::Ledger;
use crate::models::BankTransaction;
use crate::recorder::{Participants, Recorder};

fn bank_transaction(ledger: &Ledger, id: i64) -> Result<BankTransaction> {
    ledger
        .bank_transaction(id)?
        .ok_or(ReconError::NotFound { kind: "Bank transaction", id })
}

pub fn link(bank_tx: i64, acc: i64, pos: Option<i64>, note: Option<&str>) -> Result<()> {
    let (_, ledger) = open_ledger()?;
    let txn = bank_transaction(&ledger, bank_tx)?;
    if txn.is_reconciled {
        return Err(ReconError::Other(format!("bank transaction {bank_tx} is already reconciled")));
    }
    let entry = ledger
        .accounting_transaction(acc)?
        .ok_or(ReconError::NotFound { kind: "Accounting transaction", id: acc })?;
    if entry.is_reconciled {
        return Err(ReconError::Other(format!("accounting transaction {acc} is already reconciled")));
    }

    let description = match note {
        Some(note) => format!("Manual match ({note})"),
        None => "Manual match".to_string(),
    };
    Recorder::new(&ledger).commit_match(
        Participants {
            bank_record_id: Some(bank_tx),
            acc_id: Some(acc),
            pos_id: pos,
        },
        &description,
        txn.transaction_type.as_str(),
    )?;
    println!("{}", format!("Matched bank transaction {bank_tx} with accounting {acc}").green());
    Ok(())
}

pub fn unlink(bank_tx: i64, acc: Option<i64>, pos: Option<i64>, note: Option<&str>) -> Result<()> {
    let (_, ledger) = open_ledger()?;
    let txn = bank_transaction(&ledger, bank_tx)?;

    let description = match note {
        Some(note) => format!("Match reversed ({note})"),
        None => "Match reversed".to_string(),
    };
    Recorder::new(&ledger).reopen(
        Participants {
            bank_record_id: Some(bank_tx),
            acc_id: acc,
            pos_id: pos,
        },
        &description,
        txn.transaction_type.as_str(),
    )?;
    println!("{}", format!("Reopened bank transaction {bank_tx}").yellow());
    Ok(())
}
