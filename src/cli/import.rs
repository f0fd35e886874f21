use std::path::PathBuf;

use colored::Colorize;

use super::open_ledger;
use crate::error::{ReconError, Result};
use crate::importer::{import_file, LedgerKind};

pub fn run(ledger_key: &str, file: &str, bank: &str) -> Result<()> {
    let kind = LedgerKind::from_key(ledger_key).ok_or_else(|| {
        ReconError::Other(format!("unknown ledger '{ledger_key}'; expected bank, pos or accounting"))
    })?;
    let (_, ledger) = open_ledger()?;

    let result = import_file(&ledger, &PathBuf::from(file), kind, bank)?;

    if result.duplicate_file {
        println!("{}", "This file has already been imported (duplicate checksum).".yellow());
        return Ok(());
    }

    println!(
        "{} imported, {} skipped (duplicates), {} unreadable",
        result.imported, result.skipped, result.invalid
    );
    if kind == LedgerKind::Bank {
        let bank = ledger.bank_by_code(bank)?;
        let unknown = ledger.counts(bank.id)?.bank_unknown;
        if unknown > 0 {
            println!(
                "{}",
                format!("{unknown} bank transactions have no type yet; use `tatbigh classify` before running.").yellow()
            );
        }
    }
    Ok(())
}
