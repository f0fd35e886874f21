//! Received and paid transfers, including the fee-deduction path.

use tracing::debug;

use super::{commit_pair, escalate, record_open, with_note, Attempt, MatchState, Outcome, StrategyContext};
use crate::error::Result;
use crate::ledger::{AmountCompare, AmountFilter, CandidateQuery, DateField};
use crate::matching::{find_candidates, select_best_match, types_for, MatchOutcome, MatchSource};
use crate::models::{accounting_types, AccountingTransaction, BankTransaction, NewAccountingTransaction, TransactionType};
use crate::recorder::MatchExtras;

pub fn reconcile(ctx: &StrategyContext<'_>, txn: &BankTransaction) -> Result<Outcome> {
    let attempt = Attempt::start(txn.id)?;
    let compare = match txn.transaction_type {
        TransactionType::ReceivedTransfer => AmountCompare::Exact,
        _ => AmountCompare::Absolute,
    };
    let candidates = find_candidates(
        ctx.ledger,
        txn.bank_id,
        DateField::DueDate,
        txn.transaction_date,
        txn.amount,
        txn.transaction_type,
        compare,
        false,
    )?;

    match select_best_match(&MatchSource::from_bank(txn), candidates) {
        MatchOutcome::Matched { candidate, basis } => {
            let description = format!("Matched by {}", basis.describe());
            commit_pair(ctx, attempt, MatchState::AutoMatched, txn, &candidate, description, MatchExtras::default())
        }
        MatchOutcome::Unresolved(candidates) => escalate(ctx, attempt, txn, candidates, None, |attempt, acc, note, ai_reviewed| {
            let extras = MatchExtras {
                ai_reviewed,
                ..Default::default()
            };
            let description = with_note("Matched after review".to_string(), note);
            commit_pair(ctx, attempt, MatchState::Resolved, txn, acc, description, extras)
        }),
        MatchOutcome::NoMatch => fee_path(ctx, attempt, txn),
    }
}

/// Amount the bank kept when `acc` settled through `txn`.
fn implied_fee(txn: &BankTransaction, acc: &AccountingTransaction) -> f64 {
    txn.amount.abs() - acc.transaction_amount.abs()
}

fn fee_record(txn: &BankTransaction, acc: &AccountingTransaction, fee: f64) -> NewAccountingTransaction {
    NewAccountingTransaction {
        bank_id: txn.bank_id,
        transaction_type: accounting_types::FEE.to_string(),
        transaction_number: txn.tracking_reference().map(str::to_string),
        transaction_amount: fee,
        due_date: txn.transaction_date,
        collection_date: None,
        customer_name: None,
        description: Some(format!(
            "Bank fee on bank transaction {} against accounting {}",
            txn.id, acc.id
        )),
        is_reconciled: true,
        is_new_system: acc.is_new_system,
    }
}

/// Match `acc` and book the difference as a reconciled fee row.
fn commit_with_fee(
    ctx: &StrategyContext<'_>,
    attempt: Attempt,
    state: MatchState,
    txn: &BankTransaction,
    acc: &AccountingTransaction,
    description: String,
    ai_reviewed: Vec<i64>,
) -> Result<Outcome> {
    let fee = implied_fee(txn, acc);
    let extras = MatchExtras {
        fee: (fee > 0.0).then(|| fee_record(txn, acc, fee)),
        ai_reviewed,
        ..Default::default()
    };
    commit_pair(ctx, attempt, state, txn, acc, description, extras)
}

/// No same-amount entry exists, so look for one the bank shaved a fee off.
fn fee_path(ctx: &StrategyContext<'_>, attempt: Attempt, txn: &BankTransaction) -> Result<Outcome> {
    let below = ctx.ledger.find_accounting_candidates(&CandidateQuery {
        bank_id: txn.bank_id,
        date_field: DateField::DueDate,
        date: Some(txn.transaction_date),
        amount: AmountFilter::Below(txn.amount),
        types: types_for(txn.transaction_type),
        require_ai_unprocessed: false,
    })?;

    // an exact tracking hit narrows the pool to that one row
    let pool = match txn.tracking_reference() {
        Some(reference) => {
            let exact: Vec<AccountingTransaction> = below
                .iter()
                .filter(|c| c.transaction_number.as_deref().map(str::trim) == Some(reference))
                .cloned()
                .collect();
            if exact.len() == 1 {
                exact
            } else {
                below
            }
        }
        None => below,
    };

    let mut pairs: Vec<(AccountingTransaction, f64)> = pool
        .into_iter()
        .map(|c| {
            let fee = implied_fee(txn, &c);
            (c, fee)
        })
        .filter(|(_, fee)| *fee > 0.0)
        .collect();
    debug!(bank_tx = txn.id, pairs = pairs.len(), "fee candidates");

    let threshold = ctx.config.fee_threshold;
    match pairs.len() {
        0 => {
            let reason = format!(
                "No open accounting record for {} on due date {}",
                txn.amount.abs(),
                txn.transaction_date
            );
            record_open(ctx, attempt, MatchState::NoMatch, txn, reason)
        }
        1 if pairs[0].1 <= threshold => {
            let (acc, fee) = pairs.remove(0);
            let description = format!("Matched with bank fee of {fee}");
            commit_with_fee(ctx, attempt, MatchState::AutoMatched, txn, &acc, description, Vec::new())
        }
        _ => {
            let context = pairs
                .iter()
                .map(|(c, fee)| {
                    let flag = if *fee > threshold { " (above threshold)" } else { "" };
                    format!("accounting {}: implied fee {fee}{flag}", c.id)
                })
                .collect::<Vec<_>>()
                .join("; ");
            let context = format!("fee threshold {threshold}; {context}");
            let candidates = pairs.into_iter().map(|(c, _)| c).collect();
            escalate(ctx, attempt, txn, candidates, Some(context), |attempt, acc, note, ai_reviewed| {
                let description = with_note(
                    format!("Matched with bank fee of {} after review", implied_fee(txn, acc)),
                    note,
                );
                commit_with_fee(ctx, attempt, MatchState::Resolved, txn, acc, description, ai_reviewed)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::Resolution;
    use crate::ledger::fixtures::*;
    use crate::strategies::testing::*;
    use crate::strategies::OutcomeKind;

    fn fee_rows(h: &Harness) -> Vec<(f64, bool)> {
        let mut stmt = h
            .ledger
            .conn()
            .prepare("SELECT transaction_amount, is_reconciled FROM accounting_transactions WHERE transaction_type = 'Fee'")
            .unwrap();
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        rows
    }

    #[test]
    fn test_exact_single_match() {
        let h = Harness::new();
        let bank = h.bank("keshavarzi").id;
        let b = add_bank_txn(&h.ledger, bank, "2024-05-01", 1_000_000.0, TransactionType::ReceivedTransfer);
        let a = add_acc(&h.ledger, bank, "Received Transfer", "2024-05-01", 1_000_000.0);

        let outcome = h.run_plain("keshavarzi", b);
        assert_eq!(outcome.kind, OutcomeKind::AutoMatched);
        assert!(is_reconciled(&h.ledger, "bank_transactions", b));
        assert!(is_reconciled(&h.ledger, "accounting_transactions", a));
        let (acc_id, type_matched): (Option<i64>, String) = h
            .ledger
            .conn()
            .query_row(
                "SELECT acc_id, type_matched FROM reconciliation_results WHERE bank_record_id = ?1",
                [b],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(acc_id, Some(a));
        assert_eq!(type_matched, "ReceivedTransfer");
    }

    #[test]
    fn test_received_transfer_compares_sign() {
        let h = Harness::new();
        let bank = h.bank("keshavarzi").id;
        let b = add_bank_txn(&h.ledger, bank, "2024-05-01", 500_000.0, TransactionType::ReceivedTransfer);
        add_acc(&h.ledger, bank, "Received Transfer", "2024-05-01", -500_000.0);
        let outcome = h.run_plain("keshavarzi", b);
        assert_eq!(outcome.kind, OutcomeKind::NoMatch);
        assert!(!is_reconciled(&h.ledger, "bank_transactions", b));
    }

    #[test]
    fn test_paid_transfer_matches_absolute_amount() {
        let h = Harness::new();
        let bank = h.bank("saderat").id;
        let b = add_bank_txn(&h.ledger, bank, "2024-05-02", -250_000.0, TransactionType::PaidTransfer);
        let a = add_acc(&h.ledger, bank, "Pos / Paid Transfer", "2024-05-02", 250_000.0);
        let outcome = h.run_plain("saderat", b);
        assert_eq!(outcome.kind, OutcomeKind::AutoMatched);
        assert_eq!(outcome.acc_id, Some(a));
    }

    #[test]
    fn test_fee_at_threshold_auto_matches() {
        let h = Harness::new();
        let bank = h.bank("keshavarzi").id;
        let b = add_bank_txn(&h.ledger, bank, "2024-05-01", 1_100_000.0, TransactionType::ReceivedTransfer);
        let a = add_acc(&h.ledger, bank, "Received Transfer", "2024-05-01", 1_000_000.0);

        let outcome = h.run_plain("keshavarzi", b);
        assert_eq!(outcome.kind, OutcomeKind::AutoMatched);
        assert!(is_reconciled(&h.ledger, "accounting_transactions", a));
        assert_eq!(fee_rows(&h), vec![(100_000.0, true)]);
    }

    #[test]
    fn test_fee_above_threshold_escalates() {
        let h = Harness::new();
        let bank = h.bank("keshavarzi").id;
        let b = add_bank_txn(&h.ledger, bank, "2024-05-01", 1_100_001.0, TransactionType::ReceivedTransfer);
        let a = add_acc(&h.ledger, bank, "Received Transfer", "2024-05-01", 1_000_000.0);
        let escalator = ScriptedEscalator::new(vec![]);

        let outcome = h.run("keshavarzi", b, &escalator);
        assert_eq!(escalator.calls(), 1);
        assert_eq!(outcome.kind, OutcomeKind::NeedsReview);
        assert!(!is_reconciled(&h.ledger, "accounting_transactions", a));
        assert!(fee_rows(&h).is_empty());
    }

    #[test]
    fn test_fee_above_threshold_accepted_by_reviewer() {
        let h = Harness::new();
        let bank = h.bank("keshavarzi").id;
        let b = add_bank_txn(&h.ledger, bank, "2024-05-01", 1_250_000.0, TransactionType::ReceivedTransfer);
        let a = add_acc(&h.ledger, bank, "Received Transfer", "2024-05-01", 1_000_000.0);
        let escalator = ScriptedEscalator::new(vec![Resolution::Chosen {
            accounting_id: a,
            note: Some("confirmed by reviewer".into()),
            automated: false,
        }]);

        let outcome = h.run("keshavarzi", b, &escalator);
        assert_eq!(outcome.kind, OutcomeKind::Resolved);
        assert_eq!(fee_rows(&h), vec![(250_000.0, true)]);
    }

    #[test]
    fn test_several_fee_pairs_escalate() {
        let h = Harness::new();
        let bank = h.bank("keshavarzi").id;
        let b = add_bank_txn(&h.ledger, bank, "2024-05-01", 1_000_000.0, TransactionType::ReceivedTransfer);
        let a1 = add_acc(&h.ledger, bank, "Received Transfer", "2024-05-01", 990_000.0);
        let a2 = add_acc(&h.ledger, bank, "Received Transfer", "2024-05-01", 995_000.0);
        let escalator = ScriptedEscalator::new(vec![]);

        h.run("keshavarzi", b, &escalator);
        assert_eq!(escalator.seen.lock().unwrap()[0], vec![a1, a2]);
    }

    #[test]
    fn test_tracking_number_narrows_fee_pairs() {
        let h = Harness::new();
        let bank = h.bank("keshavarzi").id;
        let b = h
            .ledger
            .insert_bank(&crate::models::NewBankTransaction {
                bank_id: bank,
                transaction_date: date("2024-05-01"),
                transaction_time: None,
                amount: 1_000_000.0,
                description: None,
                reference_number: Some("884512".into()),
                extracted_terminal_id: None,
                extracted_tracking_number: None,
                source_card_number: None,
                transaction_type: TransactionType::ReceivedTransfer,
            })
            .unwrap();
        add_acc(&h.ledger, bank, "Received Transfer", "2024-05-01", 990_000.0);
        let mut tracked = new_acc(bank, "Received Transfer", "2024-05-01", 995_000.0);
        tracked.transaction_number = Some("884512".into());
        let tracked = h.ledger.insert_accounting(&tracked).unwrap();

        let outcome = h.run_plain("keshavarzi", b);
        assert_eq!(outcome.kind, OutcomeKind::AutoMatched);
        assert_eq!(outcome.acc_id, Some(tracked));
        assert_eq!(fee_rows(&h), vec![(5_000.0, true)]);
    }
}
