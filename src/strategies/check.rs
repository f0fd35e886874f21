//! Cheques clear on their collection date, not the date they were written.

use super::{direct_flow, Outcome, StrategyContext};
use crate::error::Result;
use crate::ledger::{AmountCompare, DateField};
use crate::models::BankTransaction;

pub fn reconcile(ctx: &StrategyContext<'_>, txn: &BankTransaction) -> Result<Outcome> {
    direct_flow(ctx, txn, DateField::CollectionDate, AmountCompare::Absolute)
}

#[cfg(test)]
mod tests {
    use crate::ledger::fixtures::*;
    use crate::models::TransactionType;
    use crate::strategies::testing::*;
    use crate::strategies::OutcomeKind;

    #[test]
    fn test_check_matches_on_collection_date() {
        let h = Harness::new();
        let bank = h.bank("saderat").id;
        let b = add_bank_txn(&h.ledger, bank, "2024-06-12", -300_000.0, TransactionType::PaidCheck);
        let mut check = new_acc(bank, "Paid Check", "2024-06-12", 300_000.0);
        check.collection_date = Some(date("2024-06-15"));
        h.ledger.insert_accounting(&check).unwrap();

        let outcome = h.run_plain("saderat", b);
        assert_eq!(outcome.kind, OutcomeKind::NoMatch);
        assert!(outcome.reason.contains("collection date"));
    }

    #[test]
    fn test_received_check_matches_collected_entry() {
        let h = Harness::new();
        let bank = h.bank("saderat").id;
        let b = add_bank_txn(&h.ledger, bank, "2024-06-15", 300_000.0, TransactionType::ReceivedCheck);
        let mut check = new_acc(bank, "Received Check", "2024-06-01", 300_000.0);
        check.collection_date = Some(date("2024-06-15"));
        let a = h.ledger.insert_accounting(&check).unwrap();

        let outcome = h.run_plain("saderat", b);
        assert_eq!(outcome.kind, OutcomeKind::AutoMatched);
        assert_eq!(outcome.acc_id, Some(a));
        assert!(is_reconciled(&h.ledger, "accounting_transactions", a));
    }
}
