use comfy_table::{Cell, Table};

use crate::db::get_connection;
use crate::error::Result;
use crate::ledger::Ledger;
use crate::settings::load_settings;

pub fn run() -> Result<()> {
    let settings = load_settings();
    let db_path = settings.db_path();

    println!("Data dir:   {}", settings.data_dir);
    println!("Database:   {}", db_path.display());
    println!("Escalation: {:?}", settings.reconciliation.escalation);

    if !db_path.exists() {
        println!();
        println!("Database not found. Run `tatbigh init` to set up.");
        return Ok(());
    }

    let ledger = Ledger::new(get_connection(&db_path)?);
    let mut table = Table::new();
    table.set_header(vec!["Bank", "POS mode", "Open bank", "Untyped", "Open POS", "Open accounting", "Results"]);
    for bank in ledger.banks()? {
        let counts = ledger.counts(bank.id)?;
        table.add_row(vec![
            Cell::new(&bank.name),
            Cell::new(bank.pos_mode.key()),
            Cell::new(counts.bank_open),
            Cell::new(counts.bank_unknown),
            Cell::new(counts.pos_open),
            Cell::new(counts.accounting_open),
            Cell::new(counts.results),
        ]);
    }
    println!();
    println!("{table}");
    Ok(())
}
