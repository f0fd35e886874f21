use colored::Colorize;
use comfy_table::{Cell, Table};

use super::open_ledger;
use crate::error::Result;

fn id_cell(id: Option<i64>) -> Cell {
    Cell::new(id.map(|v| v.to_string()).unwrap_or_default())
}

pub fn run(bank: Option<&str>, limit: usize) -> Result<()> {
    let (_, ledger) = open_ledger()?;
    let bank_id = match bank {
        Some(code) => Some(ledger.bank_by_code(code)?.id),
        None => None,
    };
    let rows = ledger.list_results(bank_id, limit)?;
    if rows.is_empty() {
        println!("No reconciliation results yet.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["ID", "When", "Bank Tx", "Acc", "POS", "Type", "Description"]);
    for r in rows {
        let reopened = r.description.starts_with("Match reversed");
        let description = if reopened {
            r.description.yellow().to_string()
        } else {
            r.description
        };
        table.add_row(vec![
            Cell::new(r.id),
            Cell::new(r.timestamp.format("%Y-%m-%d %H:%M")),
            id_cell(r.bank_record_id),
            id_cell(r.acc_id),
            id_cell(r.pos_id),
            Cell::new(r.type_matched),
            Cell::new(description),
        ]);
    }
    println!("Reconciliation log\n{table}");
    Ok(())
}
