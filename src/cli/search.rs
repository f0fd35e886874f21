use chrono::NaiveDate;
use comfy_table::{Cell, Table};

use super::open_ledger;
use crate::error::{ReconError, Result};
use crate::fmt::rial;
use crate::ledger::{AmountFilter, CandidateQuery, DateField};

pub fn run(bank: &str, amount: f64, date: Option<&str>) -> Result<()> {
    let (settings, ledger) = open_ledger()?;
    let bank = ledger.bank_by_code(bank)?;
    let date = date
        .map(|d| {
            NaiveDate::parse_from_str(d, "%Y-%m-%d")
                .map_err(|_| ReconError::Other(format!("invalid date '{d}', expected YYYY-MM-DD")))
        })
        .transpose()?;
    let tolerance = settings.reconciliation.search_tolerance;

    let rows = ledger.find_accounting_candidates(&CandidateQuery {
        bank_id: bank.id,
        date_field: DateField::DueDate,
        date,
        amount: AmountFilter::Within { amount, tolerance },
        types: vec![],
        require_ai_unprocessed: false,
    })?;

    if rows.is_empty() {
        println!("No open accounting entries within {} of {}.", rial(tolerance), rial(amount));
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["ID", "Type", "Number", "Amount", "Due", "Customer", "Description"]);
    for acc in rows {
        table.add_row(vec![
            Cell::new(acc.id),
            Cell::new(acc.transaction_type),
            Cell::new(acc.transaction_number.unwrap_or_default()),
            Cell::new(rial(acc.transaction_amount)),
            Cell::new(acc.due_date),
            Cell::new(acc.customer_name.unwrap_or_default()),
            Cell::new(acc.description.unwrap_or_default()),
        ]);
    }
    println!("Open accounting entries for {} (± {})\n{table}", bank.name, rial(tolerance));
    Ok(())
}
