use tracing::debug;

use crate::error::{ReconError, Result};
use crate::ledger::{CommitReceipt, Ledger, LedgerCommit};
use crate::models::NewAccountingTransaction;

/// Ledger rows taking part in one result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Participants {
    pub bank_record_id: Option<i64>,
    pub acc_id: Option<i64>,
    pub pos_id: Option<i64>,
}

impl Participants {
    pub fn bank(id: i64) -> Self {
        Self {
            bank_record_id: Some(id),
            ..Default::default()
        }
    }

    pub fn bank_and_accounting(bank_id: i64, acc_id: i64) -> Self {
        Self {
            bank_record_id: Some(bank_id),
            acc_id: Some(acc_id),
            pos_id: None,
        }
    }

    pub fn pos_and_accounting(pos_id: i64, acc_id: i64) -> Self {
        Self {
            bank_record_id: None,
            acc_id: Some(acc_id),
            pos_id: Some(pos_id),
        }
    }

    fn is_empty(&self) -> bool {
        self.bank_record_id.is_none() && self.acc_id.is_none() && self.pos_id.is_none()
    }
}

/// Side effects that ride along with a successful match.
#[derive(Debug, Clone, Default)]
pub struct MatchExtras {
    pub fee: Option<NewAccountingTransaction>,
    pub terminal_settlement: Option<(i64, chrono::NaiveDate)>,
    pub ai_reviewed: Vec<i64>,
}

/// One result row of a multi-row commit.
#[derive(Debug, Clone)]
pub struct Entry {
    pub who: Participants,
    pub reconciled: bool,
    pub description: String,
    pub type_matched: String,
}

impl Entry {
    pub fn matched(who: Participants, description: impl Into<String>, type_matched: &str) -> Self {
        Self {
            who,
            reconciled: true,
            description: description.into(),
            type_matched: type_matched.to_string(),
        }
    }

    pub fn failed(who: Participants, description: impl Into<String>, type_matched: &str) -> Self {
        Self {
            reconciled: false,
            ..Self::matched(who, description, type_matched)
        }
    }
}

/// The only writer of reconciliation flags and result rows. It persists the
/// outcome it is told; deciding that outcome is the strategies' job.
pub struct Recorder<'a> {
    ledger: &'a Ledger,
}

impl<'a> Recorder<'a> {
    pub fn new(ledger: &'a Ledger) -> Self {
        Self { ledger }
    }

    pub fn commit_match(&self, who: Participants, description: &str, type_matched: &str) -> Result<CommitReceipt> {
        self.commit_match_with(who, description, type_matched, MatchExtras::default())
    }

    pub fn commit_match_with(
        &self,
        who: Participants,
        description: &str,
        type_matched: &str,
        extras: MatchExtras,
    ) -> Result<CommitReceipt> {
        self.commit(who, true, description, type_matched, extras)
    }

    /// Log an attempted-and-rejected match, leaving every participant open.
    pub fn commit_failure(&self, who: Participants, description: &str, type_matched: &str) -> Result<CommitReceipt> {
        self.commit(who, false, description, type_matched, MatchExtras::default())
    }

    pub fn commit_failure_with(
        &self,
        who: Participants,
        description: &str,
        type_matched: &str,
        extras: MatchExtras,
    ) -> Result<CommitReceipt> {
        self.commit(who, false, description, type_matched, extras)
    }

    /// Undo an earlier match: every participant goes back to open and the
    /// reversal is logged like any other result.
    pub fn reopen(&self, who: Participants, description: &str, type_matched: &str) -> Result<CommitReceipt> {
        self.commit(who, false, description, type_matched, MatchExtras::default())
    }

    /// Write several result rows in one transaction.
    pub fn commit_all(&self, entries: &[Entry]) -> Result<Vec<CommitReceipt>> {
        let commits = entries
            .iter()
            .map(|e| ledger_commit(e.who, e.reconciled, &e.description, &e.type_matched, MatchExtras::default()))
            .collect::<Result<Vec<_>>>()?;
        let receipts = self.ledger.apply_batch(&commits)?;
        debug!(rows = receipts.len(), "batch recorded");
        Ok(receipts)
    }

    fn commit(
        &self,
        who: Participants,
        reconciled: bool,
        description: &str,
        type_matched: &str,
        extras: MatchExtras,
    ) -> Result<CommitReceipt> {
        let receipt = self
            .ledger
            .apply_commit(&ledger_commit(who, reconciled, description, type_matched, extras)?)?;
        debug!(
            result_id = receipt.result_id,
            bank_tx = ?who.bank_record_id,
            acc = ?who.acc_id,
            pos = ?who.pos_id,
            reconciled,
            "result recorded"
        );
        Ok(receipt)
    }
}

fn ledger_commit(
    who: Participants,
    reconciled: bool,
    description: &str,
    type_matched: &str,
    extras: MatchExtras,
) -> Result<LedgerCommit> {
    if who.is_empty() {
        return Err(ReconError::Other("a result row needs at least one participant".into()));
    }
    Ok(LedgerCommit {
        bank_record_id: who.bank_record_id,
        acc_id: who.acc_id,
        pos_id: who.pos_id,
        reconciled,
        description: description.to_string(),
        type_matched: type_matched.to_string(),
        fee: extras.fee,
        terminal_settlement: extras.terminal_settlement,
        ai_reviewed: extras.ai_reviewed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::fixtures::*;
    use crate::models::TransactionType;

    #[test]
    fn test_commit_match_twice_is_idempotent_on_flags() {
        let (_dir, ledger) = test_ledger();
        let bank = bank_id(&ledger, "keshavarzi");
        let b = add_bank_txn(&ledger, bank, "2024-05-01", 200_000.0, TransactionType::ReceivedTransfer);
        let a = add_acc(&ledger, bank, "Received Transfer", "2024-05-01", 200_000.0);
        let recorder = Recorder::new(&ledger);

        recorder.commit_match(Participants::bank_and_accounting(b, a), "exact", "ReceivedTransfer").unwrap();
        recorder.commit_match(Participants::bank_and_accounting(b, a), "exact", "ReceivedTransfer").unwrap();

        assert!(is_reconciled(&ledger, "bank_transactions", b));
        assert!(is_reconciled(&ledger, "accounting_transactions", a));
        assert_eq!(result_count(&ledger), 2);
    }

    #[test]
    fn test_commit_failure_keeps_rows_open() {
        let (_dir, ledger) = test_ledger();
        let bank = bank_id(&ledger, "keshavarzi");
        let b = add_bank_txn(&ledger, bank, "2024-05-01", 10.0, TransactionType::PaidTransfer);
        Recorder::new(&ledger)
            .commit_failure(Participants::bank(b), "no candidates", "PaidTransfer")
            .unwrap();
        assert!(!is_reconciled(&ledger, "bank_transactions", b));
        let description: String = ledger
            .conn()
            .query_row("SELECT description FROM reconciliation_results", [], |r| r.get(0))
            .unwrap();
        assert_eq!(description, "no candidates");
    }

    #[test]
    fn test_reopen_clears_flags_and_logs() {
        let (_dir, ledger) = test_ledger();
        let bank = bank_id(&ledger, "keshavarzi");
        let b = add_bank_txn(&ledger, bank, "2024-05-01", 200_000.0, TransactionType::ReceivedTransfer);
        let a = add_acc(&ledger, bank, "Received Transfer", "2024-05-01", 200_000.0);
        let recorder = Recorder::new(&ledger);
        recorder.commit_match(Participants::bank_and_accounting(b, a), "exact", "ReceivedTransfer").unwrap();

        recorder
            .reopen(Participants::bank_and_accounting(b, a), "reopened by operator", "ReceivedTransfer")
            .unwrap();
        assert!(!is_reconciled(&ledger, "bank_transactions", b));
        assert!(!is_reconciled(&ledger, "accounting_transactions", a));
        assert_eq!(result_count(&ledger), 2);
    }

    #[test]
    fn test_commit_without_participants_rejected() {
        let (_dir, ledger) = test_ledger();
        let err = Recorder::new(&ledger).commit_failure(Participants::default(), "x", "y");
        assert!(err.is_err());
        assert_eq!(result_count(&ledger), 0);
    }

    #[test]
    fn test_fee_row_written_with_match() {
        let (_dir, ledger) = test_ledger();
        let bank = bank_id(&ledger, "saderat");
        let b = add_bank_txn(&ledger, bank, "2024-05-01", 1_050_000.0, TransactionType::ReceivedTransfer);
        let a = add_acc(&ledger, bank, "Received Transfer", "2024-05-01", 1_000_000.0);
        let mut fee = new_acc(bank, "Fee", "2024-05-01", 50_000.0);
        fee.is_reconciled = true;
        let receipt = Recorder::new(&ledger)
            .commit_match_with(
                Participants::bank_and_accounting(b, a),
                "fee",
                "ReceivedTransfer",
                MatchExtras {
                    fee: Some(fee),
                    ..Default::default()
                },
            )
            .unwrap();
        let fee_row = ledger.accounting_transaction(receipt.fee_id.unwrap()).unwrap().unwrap();
        assert_eq!(fee_row.transaction_type, "Fee");
        assert!(fee_row.is_reconciled);
    }

    #[test]
    fn test_failure_can_mark_ai_reviewed_candidates() {
        let (_dir, ledger) = test_ledger();
        let bank = bank_id(&ledger, "keshavarzi");
        let b = add_bank_txn(&ledger, bank, "2024-05-01", 80.0, TransactionType::ReceivedTransfer);
        let a1 = add_acc(&ledger, bank, "Received Transfer", "2024-05-01", 80.0);
        let a2 = add_acc(&ledger, bank, "Received Transfer", "2024-05-01", 80.0);
        Recorder::new(&ledger)
            .commit_failure_with(
                Participants::bank(b),
                "needs review: AI found no match",
                "ReceivedTransfer",
                MatchExtras {
                    ai_reviewed: vec![a1, a2],
                    ..Default::default()
                },
            )
            .unwrap();
        for id in [a1, a2] {
            let acc = ledger.accounting_transaction(id).unwrap().unwrap();
            assert!(acc.ai_processed && !acc.is_reconciled);
        }
    }
}
