use std::io::Write;

use colored::Colorize;
use comfy_table::{Cell, Table};
use dialoguer::Input;
use tracing::warn;

use super::{open_ledger, outcome_label};
use crate::error::{ReconError, Result};
use crate::escalation::manual::{ManualAnswer, ManualRequest};
use crate::escalation::EscalationRequest;
use crate::fmt::rial;
use crate::orchestrator::{spawn_run, CancelToken, RunEvent, Summary};
use crate::settings::EscalationBackend;

pub fn run(bank: &str, escalation: Option<&str>, json: bool) -> Result<()> {
    let (settings, ledger) = open_ledger()?;
    let bank = ledger.bank_by_code(bank)?;
    // the worker opens its own connection
    drop(ledger);

    let mut config = settings.reconciliation.clone();
    if let Some(key) = escalation {
        config.escalation = EscalationBackend::from_key(key).ok_or_else(|| {
            ReconError::Configuration(format!("unknown escalation '{key}'; expected none, manual or ai"))
        })?;
    }

    let cancel = CancelToken::new();
    let handle = spawn_run(settings.db_path(), bank.id, config, cancel.clone())?;

    for event in handle.events.iter() {
        match event {
            RunEvent::Started { total, .. } => {
                if !json {
                    println!("Reconciling {total} open transactions for {}", bank.name.bold());
                }
            }
            RunEvent::Progress { processed, total } => {
                if !json {
                    eprint!("\r  {processed}/{total}");
                    let _ = std::io::stderr().flush();
                }
            }
            RunEvent::ManualReview(request) => {
                eprintln!();
                review(request, &cancel);
            }
            RunEvent::Failed(message) => {
                eprintln!();
                eprintln!("{}", format!("Run failed: {message}").red());
            }
            RunEvent::RecordFinished(_) | RunEvent::Finished(_) => {}
        }
    }
    if !json {
        eprintln!();
    }

    let summary = handle
        .join
        .join()
        .map_err(|_| ReconError::Other("reconciliation worker panicked".into()))??;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

/// Ask the operator to pick one candidate. Typing `q` also stops the run after
/// the current record.
fn review(request: ManualRequest, cancel: &CancelToken) {
    let case = &request.case;
    // stdout belongs to the summary (and `--json`)
    if let Err(e) = render_case(&mut std::io::stderr(), case) {
        warn!(error = %e, "could not print review case");
    }

    let choice: String = Input::new()
        .with_prompt("Candidate # (s=skip, q=stop run)")
        .interact_text()
        .unwrap_or_else(|_| "s".to_string());
    let choice = choice.trim().to_lowercase();

    if choice == "q" {
        cancel.cancel();
        eprintln!("{}", "Stopping after this record.".yellow());
        request.respond(ManualAnswer::Cancel);
        return;
    }
    let picked = match choice.parse::<usize>() {
        Ok(n) if n >= 1 && n <= case.candidates.len() => case.candidates[n - 1].id,
        _ => {
            if choice != "s" {
                eprintln!("{}", "Invalid choice, skipping.".red());
            }
            request.respond(ManualAnswer::Cancel);
            return;
        }
    };

    let notes: String = Input::new()
        .with_prompt("Notes (Enter to skip)")
        .default(String::new())
        .interact_text()
        .unwrap_or_default();
    request.respond(ManualAnswer::Select {
        accounting_id: picked,
        notes: Some(notes),
    });
}

fn render_case(out: &mut impl Write, case: &EscalationRequest) -> std::io::Result<()> {
    let bank = &case.bank;
    writeln!(out, "{}", "\u{2500}".repeat(60))?;
    writeln!(out, "  Bank tx:     {} ({})", bank.id, case.transaction_type)?;
    writeln!(out, "  Date:        {}", bank.transaction_date)?;
    let amount = if bank.amount < 0.0 {
        rial(bank.amount).red().to_string()
    } else {
        rial(bank.amount).green().to_string()
    };
    writeln!(out, "  Amount:      {amount}")?;
    writeln!(out, "  Description: {}", bank.description.as_deref().unwrap_or(""))?;
    writeln!(out, "  Reference:   {}", bank.tracking_reference().unwrap_or(""))?;
    if let Some(context) = &case.context {
        writeln!(out, "  Note:        {context}")?;
    }
    writeln!(out)?;

    let mut table = Table::new();
    table.set_header(vec![
        "#",
        "Acc ID",
        "Type",
        "Number",
        "Amount",
        "Due",
        "Collected",
        "Customer",
        "Description",
    ]);
    for (i, c) in case.candidates.iter().enumerate() {
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(c.id),
            Cell::new(&c.transaction_type),
            Cell::new(c.transaction_number.as_deref().unwrap_or("")),
            Cell::new(rial(c.transaction_amount)),
            Cell::new(c.due_date),
            Cell::new(c.collection_date.map(|d| d.to_string()).unwrap_or_default()),
            Cell::new(c.customer_name.as_deref().unwrap_or("")),
            Cell::new(c.description.as_deref().unwrap_or("")),
        ]);
    }
    writeln!(out, "Candidates\n{table}\n")
}

fn print_summary(summary: &Summary) {
    if !summary.records.is_empty() {
        let mut table = Table::new();
        table.set_header(vec!["Bank Tx", "Date", "Type", "Amount", "Outcome", "Acc", "Reason"]);
        for r in &summary.records {
            table.add_row(vec![
                Cell::new(r.bank_tx_id),
                Cell::new(r.transaction_date),
                Cell::new(r.transaction_type),
                Cell::new(rial(r.amount)),
                Cell::new(outcome_label(r.outcome)),
                Cell::new(r.acc_id.map(|id| id.to_string()).unwrap_or_default()),
                Cell::new(&r.reason),
            ]);
        }
        println!("{table}");
    }

    let mut totals = Table::new();
    totals.set_header(vec!["Outcome", "Count"]);
    totals.add_row(vec![Cell::new("Auto-matched"), Cell::new(summary.auto_matched)]);
    totals.add_row(vec![Cell::new("Matched after review"), Cell::new(summary.resolved)]);
    totals.add_row(vec![Cell::new("Needs review"), Cell::new(summary.needs_review)]);
    totals.add_row(vec![Cell::new("No match"), Cell::new(summary.no_match)]);
    totals.add_row(vec![Cell::new("Errors"), Cell::new(summary.errors)]);
    if summary.skipped > 0 {
        totals.add_row(vec![Cell::new("Closed earlier in run"), Cell::new(summary.skipped)]);
    }
    totals.add_row(vec![
        Cell::new("Processed"),
        Cell::new(format!("{} / {}", summary.processed, summary.total)),
    ]);
    println!("Summary\n{totals}");

    if summary.cancelled {
        println!("{}", "Run stopped early; remaining transactions are still open.".yellow());
    } else if summary.errors > 0 {
        println!("{}", format!("{} transactions failed; see the log above.", summary.errors).red());
    } else {
        println!("{}", "Run complete.".green());
    }
}
