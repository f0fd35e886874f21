use comfy_table::{Cell, Table};

use super::open_ledger;
use crate::error::Result;

pub fn list() -> Result<()> {
    let (_, ledger) = open_ledger()?;
    let mut table = Table::new();
    table.set_header(vec!["ID", "Code", "Name", "POS mode"]);
    for bank in ledger.banks()? {
        table.add_row(vec![
            Cell::new(bank.id),
            Cell::new(bank.code),
            Cell::new(bank.name),
            Cell::new(bank.pos_mode.key()),
        ]);
    }
    println!("Banks\n{table}");
    Ok(())
}

pub fn add_terminal(terminal_number: &str, bank: &str) -> Result<()> {
    let (_, ledger) = open_ledger()?;
    let bank = ledger.bank_by_code(bank)?;
    let id = ledger.register_terminal(terminal_number, bank.id)?;
    println!("Registered terminal {} for {} (id {id})", terminal_number.trim(), bank.name);
    Ok(())
}

pub fn list_terminals(bank: Option<&str>) -> Result<()> {
    let (_, ledger) = open_ledger()?;
    let bank_id = match bank {
        Some(code) => Some(ledger.bank_by_code(code)?.id),
        None => None,
    };
    let banks = ledger.banks()?;
    let mut table = Table::new();
    table.set_header(vec!["ID", "Terminal", "Bank"]);
    for terminal in ledger.terminals(bank_id)? {
        let bank_name = banks
            .iter()
            .find(|b| b.id == terminal.bank_id)
            .map(|b| b.name.as_str())
            .unwrap_or("?");
        table.add_row(vec![
            Cell::new(terminal.id),
            Cell::new(terminal.terminal_number),
            Cell::new(bank_name),
        ]);
    }
    println!("Terminals\n{table}");
    Ok(())
}
