//! Per-category reconciliation of one bank line against the accounting ledger.
//!
//! Every strategy walks the same state machine and leaves exactly one result
//! row behind for the bank line it was given.

pub mod check;
pub mod pos;
pub mod transfer;

use std::fmt;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{ReconError, Result};
use crate::escalation::{EscalationRequest, Escalator, Resolution};
use crate::ledger::{AmountCompare, DateField, Ledger};
use crate::matching::{find_candidates, select_best_match, MatchOutcome, MatchSource};
use crate::models::{AccountingTransaction, Bank, BankTransaction, TransactionType};
use crate::recorder::{MatchExtras, Participants, Recorder};
use crate::settings::ReconciliationConfig;

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MatchState {
    Pending,
    Searching,
    AutoMatched,
    Escalated,
    NoMatch,
    Error,
    Resolved,
    Cancelled,
    Skipped,
}

impl MatchState {
    pub fn can_move_to(self, next: MatchState) -> bool {
        use MatchState::*;
        matches!(
            (self, next),
            (Pending, Searching)
                | (Searching, AutoMatched | Escalated | NoMatch | Error)
                | (Escalated, Resolved | Cancelled | Skipped | Error)
        )
    }

    pub fn is_terminal(self) -> bool {
        use MatchState::*;
        matches!(self, AutoMatched | NoMatch | Error | Resolved | Cancelled | Skipped)
    }
}

/// What the operator sees for a processed bank line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OutcomeKind {
    AutoMatched,
    /// Matched after a human or the AI picked the candidate.
    Resolved,
    NeedsReview,
    NoMatch,
    Error,
}

impl OutcomeKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::AutoMatched => "auto-matched",
            Self::Resolved => "matched after review",
            Self::NeedsReview => "needs manual review",
            Self::NoMatch => "no match found",
            Self::Error => "error",
        }
    }

    fn from_state(state: MatchState) -> Self {
        match state {
            MatchState::AutoMatched => Self::AutoMatched,
            MatchState::Resolved => Self::Resolved,
            MatchState::NoMatch => Self::NoMatch,
            MatchState::Cancelled | MatchState::Skipped | MatchState::Escalated => Self::NeedsReview,
            MatchState::Pending | MatchState::Searching | MatchState::Error => Self::Error,
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub kind: OutcomeKind,
    pub state: MatchState,
    pub reason: String,
    pub acc_id: Option<i64>,
}

/// Tracks one bank line through the state machine.
#[derive(Debug)]
pub struct Attempt {
    bank_tx: i64,
    state: MatchState,
}

impl Attempt {
    pub fn start(bank_tx: i64) -> Result<Self> {
        let mut attempt = Self {
            bank_tx,
            state: MatchState::Pending,
        };
        attempt.advance(MatchState::Searching)?;
        Ok(attempt)
    }

    pub fn state(&self) -> MatchState {
        self.state
    }

    pub fn advance(&mut self, next: MatchState) -> Result<()> {
        if !self.state.can_move_to(next) {
            return Err(ReconError::Other(format!(
                "bank transaction {}: illegal transition {:?} -> {:?}",
                self.bank_tx, self.state, next
            )));
        }
        debug!(bank_tx = self.bank_tx, from = ?self.state, to = ?next, "state change");
        self.state = next;
        Ok(())
    }

    fn finish(self, reason: impl Into<String>, acc_id: Option<i64>) -> Outcome {
        Outcome {
            kind: OutcomeKind::from_state(self.state),
            state: self.state,
            reason: reason.into(),
            acc_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Context & dispatch
// ---------------------------------------------------------------------------

pub struct StrategyContext<'a> {
    pub ledger: &'a Ledger,
    pub config: &'a ReconciliationConfig,
    pub escalator: &'a dyn Escalator,
    pub bank: &'a Bank,
}

impl<'a> StrategyContext<'a> {
    pub fn recorder(&self) -> Recorder<'a> {
        Recorder::new(self.ledger)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Transfer,
    Pos,
    Check,
    BankFee,
}

impl StrategyKind {
    pub fn for_type(kind: TransactionType) -> Option<Self> {
        match kind {
            TransactionType::ReceivedTransfer | TransactionType::PaidTransfer => Some(Self::Transfer),
            TransactionType::ReceivedPos => Some(Self::Pos),
            TransactionType::ReceivedCheck | TransactionType::PaidCheck => Some(Self::Check),
            TransactionType::BankFee => Some(Self::BankFee),
            TransactionType::Unknown => None,
        }
    }

    pub fn reconcile(&self, ctx: &StrategyContext<'_>, txn: &BankTransaction) -> Result<Outcome> {
        match self {
            Self::Transfer => transfer::reconcile(ctx, txn),
            Self::Pos => pos::reconcile(ctx, txn),
            Self::Check => check::reconcile(ctx, txn),
            Self::BankFee => reconcile_bank_fee(ctx, txn),
        }
    }
}

/// Dispatch one bank line to the strategy for its category.
pub fn reconcile_one(ctx: &StrategyContext<'_>, txn: &BankTransaction) -> Result<Outcome> {
    let strategy = StrategyKind::for_type(txn.transaction_type).ok_or_else(|| {
        ReconError::Configuration(format!("bank transaction {} has no resolved type", txn.id))
    })?;
    strategy.reconcile(ctx, txn)
}

// ---------------------------------------------------------------------------
// Shared flow
// ---------------------------------------------------------------------------

pub(crate) fn type_matched(txn: &BankTransaction) -> &'static str {
    txn.transaction_type.as_str()
}

/// Commit a bank/accounting pair and close the attempt as `state`.
pub(crate) fn commit_pair(
    ctx: &StrategyContext<'_>,
    mut attempt: Attempt,
    state: MatchState,
    txn: &BankTransaction,
    acc: &AccountingTransaction,
    description: String,
    extras: MatchExtras,
) -> Result<Outcome> {
    ctx.recorder().commit_match_with(
        Participants::bank_and_accounting(txn.id, acc.id),
        &description,
        type_matched(txn),
        extras,
    )?;
    if attempt.state() != state {
        attempt.advance(state)?;
    }
    info!(bank_tx = txn.id, acc = acc.id, state = ?state, "reconciled");
    Ok(attempt.finish(description, Some(acc.id)))
}

/// Log why a bank line stays open and close the attempt as `state`.
pub(crate) fn record_open(
    ctx: &StrategyContext<'_>,
    attempt: Attempt,
    state: MatchState,
    txn: &BankTransaction,
    reason: String,
) -> Result<Outcome> {
    record_open_with(ctx, attempt, state, txn, reason, Vec::new())
}

fn record_open_with(
    ctx: &StrategyContext<'_>,
    mut attempt: Attempt,
    state: MatchState,
    txn: &BankTransaction,
    reason: String,
    ai_reviewed: Vec<i64>,
) -> Result<Outcome> {
    ctx.recorder().commit_failure_with(
        Participants::bank(txn.id),
        &reason,
        type_matched(txn),
        MatchExtras {
            ai_reviewed,
            ..Default::default()
        },
    )?;
    if attempt.state() != state {
        attempt.advance(state)?;
    }
    info!(bank_tx = txn.id, state = ?state, %reason, "left open");
    Ok(attempt.finish(reason, None))
}

/// Ask the configured escalator to break a tie, validate its pick against
/// fresh ledger state and hand the survivor to `commit`.
///
/// With an AI backend every offered candidate is marked `ai_processed` once
/// a verdict comes back, in the same commit as the result row. `commit`
/// receives those ids to carry along.
pub(crate) fn escalate<F>(
    ctx: &StrategyContext<'_>,
    mut attempt: Attempt,
    txn: &BankTransaction,
    mut candidates: Vec<AccountingTransaction>,
    context: Option<String>,
    commit: F,
) -> Result<Outcome>
where
    F: FnOnce(Attempt, &AccountingTransaction, Option<String>, Vec<i64>) -> Result<Outcome>,
{
    attempt.advance(MatchState::Escalated)?;

    let ai_backend = ctx.escalator.requires_ai_unprocessed();
    if ai_backend {
        candidates.retain(|c| !c.ai_processed);
        if candidates.is_empty() {
            let reason = "needs review: every candidate was already handled by the AI matcher".to_string();
            return record_open(ctx, attempt, MatchState::Skipped, txn, reason);
        }
    }

    let request = EscalationRequest {
        bank: txn.clone(),
        candidates,
        transaction_type: txn.transaction_type,
        context,
    };
    info!(
        bank_tx = txn.id,
        candidates = request.candidates.len(),
        backend = ctx.escalator.name(),
        "escalating ambiguous match"
    );

    let resolution = ctx.escalator.resolve_ambiguous(&request)?;
    let ai_reviewed: Vec<i64> = if ai_backend {
        request.candidates.iter().map(|c| c.id).collect()
    } else {
        Vec::new()
    };

    match resolution {
        Resolution::Chosen {
            accounting_id,
            note,
            automated,
        } => {
            if !request.offers(accounting_id) {
                let reason = format!(
                    "validation failed: accounting {accounting_id} was not among the {} offered candidates",
                    request.candidates.len()
                );
                return record_open_with(ctx, attempt, MatchState::Skipped, txn, reason, ai_reviewed);
            }
            let fresh = ctx.ledger.accounting_transaction(accounting_id)?;
            let Some(fresh) = fresh.filter(|acc| !acc.is_reconciled) else {
                let reason = format!("validation failed: accounting {accounting_id} is no longer open");
                return record_open_with(ctx, attempt, MatchState::Skipped, txn, reason, ai_reviewed);
            };
            attempt.advance(MatchState::Resolved)?;
            let mut ai_reviewed = ai_reviewed;
            if automated && !ai_reviewed.contains(&accounting_id) {
                ai_reviewed.push(accounting_id);
            }
            commit(attempt, &fresh, note, ai_reviewed)
        }
        Resolution::Cancelled { reason } => {
            record_open(ctx, attempt, MatchState::Cancelled, txn, format!("needs review: {reason}"))
        }
        Resolution::Declined { reason } => record_open_with(
            ctx,
            attempt,
            MatchState::Skipped,
            txn,
            format!("needs review: {reason}"),
            ai_reviewed,
        ),
        Resolution::Skipped { reason } => {
            record_open(ctx, attempt, MatchState::Skipped, txn, format!("needs review: {reason}"))
        }
    }
}

pub(crate) fn with_note(description: String, note: Option<String>) -> String {
    match note {
        Some(note) => format!("{description} ({note})"),
        None => description,
    }
}

/// Search, tie-break, escalate: the whole flow for categories with no
/// special handling beyond which date and amount rule to search with.
pub(crate) fn direct_flow(
    ctx: &StrategyContext<'_>,
    txn: &BankTransaction,
    date_field: DateField,
    compare: AmountCompare,
) -> Result<Outcome> {
    let attempt = Attempt::start(txn.id)?;
    let candidates = find_candidates(
        ctx.ledger,
        txn.bank_id,
        date_field,
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
            let description = with_note("Matched after review".to_string(), note);
            let extras = MatchExtras {
                ai_reviewed,
                ..Default::default()
            };
            commit_pair(ctx, attempt, MatchState::Resolved, txn, acc, description, extras)
        }),
        MatchOutcome::NoMatch => {
            let column = match date_field {
                DateField::DueDate => "due date",
                DateField::CollectionDate => "collection date",
            };
            let reason = format!(
                "No open accounting record for {} on {column} {}",
                txn.amount.abs(),
                txn.transaction_date
            );
            record_open(ctx, attempt, MatchState::NoMatch, txn, reason)
        }
    }
}

fn reconcile_bank_fee(ctx: &StrategyContext<'_>, txn: &BankTransaction) -> Result<Outcome> {
    direct_flow(ctx, txn, DateField::DueDate, AmountCompare::Absolute)
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::ledger::fixtures::*;

    #[test]
    fn test_state_machine_transitions() {
        assert!(MatchState::Pending.can_move_to(MatchState::Searching));
        assert!(MatchState::Searching.can_move_to(MatchState::Escalated));
        assert!(MatchState::Escalated.can_move_to(MatchState::Cancelled));
        assert!(!MatchState::Searching.can_move_to(MatchState::Resolved));
        assert!(!MatchState::AutoMatched.can_move_to(MatchState::Escalated));
        assert!(MatchState::Skipped.is_terminal());
        assert!(!MatchState::Escalated.is_terminal());
    }

    #[test]
    fn test_illegal_transition_is_error() {
        let mut attempt = Attempt::start(1).unwrap();
        assert!(attempt.advance(MatchState::Resolved).is_err());
        assert_eq!(attempt.state(), MatchState::Searching);
    }

    #[test]
    fn test_unknown_type_has_no_strategy() {
        assert_eq!(StrategyKind::for_type(TransactionType::Unknown), None);
        assert_eq!(StrategyKind::for_type(TransactionType::PaidCheck), Some(StrategyKind::Check));
    }

    #[test]
    fn test_bank_fee_matches_fee_entry() {
        let h = Harness::new();
        let bank = h.bank("saderat").id;
        let b = add_bank_txn(&h.ledger, bank, "2024-05-03", -12_000.0, TransactionType::BankFee);
        let a = add_acc(&h.ledger, bank, "Fee", "2024-05-03", 12_000.0);
        let outcome = h.run_plain("saderat", b);
        assert_eq!(outcome.kind, OutcomeKind::AutoMatched);
        assert_eq!(outcome.acc_id, Some(a));
    }

    #[test]
    fn test_escalation_cancel_leaves_rows_open() {
        let h = Harness::new();
        let bank = h.bank("keshavarzi").id;
        let b = add_bank_txn(&h.ledger, bank, "2024-05-01", 200_000.0, TransactionType::ReceivedTransfer);
        let a1 = add_acc(&h.ledger, bank, "Received Transfer", "2024-05-01", 200_000.0);
        let a2 = add_acc(&h.ledger, bank, "Received Transfer", "2024-05-01", 200_000.0);
        let escalator = ScriptedEscalator::new(vec![Resolution::Cancelled {
            reason: "reviewer cancelled the selection".into(),
        }]);

        let outcome = h.run("keshavarzi", b, &escalator);
        assert_eq!(outcome.kind, OutcomeKind::NeedsReview);
        assert_eq!(outcome.state, MatchState::Cancelled);
        assert!(!is_reconciled(&h.ledger, "accounting_transactions", a1));
        assert!(!is_reconciled(&h.ledger, "accounting_transactions", a2));
        assert!(!is_reconciled(&h.ledger, "bank_transactions", b));
        let description: String = h
            .ledger
            .conn()
            .query_row("SELECT description FROM reconciliation_results WHERE bank_record_id = ?1", [b], |r| r.get(0))
            .unwrap();
        assert!(description.contains("cancelled"), "{description}");
    }

    #[test]
    fn test_invented_id_needs_review_regardless_of_confidence() {
        let h = Harness::new();
        let bank = h.bank("keshavarzi").id;
        let b = add_bank_txn(&h.ledger, bank, "2024-05-01", 200_000.0, TransactionType::ReceivedTransfer);
        add_acc(&h.ledger, bank, "Received Transfer", "2024-05-01", 200_000.0);
        add_acc(&h.ledger, bank, "Received Transfer", "2024-05-01", 200_000.0);
        let outsider = add_acc(&h.ledger, bank, "Received Transfer", "2024-04-01", 200_000.0);
        let escalator = ScriptedEscalator::new(vec![Resolution::Chosen {
            accounting_id: outsider,
            note: Some("AI confidence 1.00: certain".into()),
            automated: true,
        }]);

        let outcome = h.run("keshavarzi", b, &escalator);
        assert_eq!(outcome.kind, OutcomeKind::NeedsReview);
        assert!(outcome.reason.starts_with("validation failed"));
        assert!(!is_reconciled(&h.ledger, "accounting_transactions", outsider));
    }

    #[test]
    fn test_choice_claimed_meanwhile_needs_review() {
        let h = Harness::new();
        let bank = h.bank("keshavarzi").id;
        let b = add_bank_txn(&h.ledger, bank, "2024-05-01", 200_000.0, TransactionType::ReceivedTransfer);
        let a1 = add_acc(&h.ledger, bank, "Received Transfer", "2024-05-01", 200_000.0);
        add_acc(&h.ledger, bank, "Received Transfer", "2024-05-01", 200_000.0);

        struct ClaimingEscalator(std::path::PathBuf, i64);
        impl Escalator for ClaimingEscalator {
            fn name(&self) -> &'static str {
                "claiming"
            }
            fn resolve_ambiguous(&self, _request: &EscalationRequest) -> Result<Resolution> {
                // another session reconciles it while the decision is pending
                let other = Ledger::new(crate::db::get_connection(&self.0)?);
                other.set_accounting_reconciled(self.1, true)?;
                Ok(Resolution::Chosen {
                    accounting_id: self.1,
                    note: None,
                    automated: true,
                })
            }
        }
        let escalator = ClaimingEscalator(h._dir.path().join("test.db"), a1);
        let bank_row = h.bank("keshavarzi");
        let txn = h.ledger.bank_transaction(b).unwrap().unwrap();
        let ctx = StrategyContext {
            ledger: &h.ledger,
            config: &h.config,
            escalator: &escalator,
            bank: &bank_row,
        };
        let outcome = reconcile_one(&ctx, &txn).unwrap();
        assert_eq!(outcome.kind, OutcomeKind::NeedsReview);
        assert!(outcome.reason.contains("no longer open"));
        assert!(!is_reconciled(&h.ledger, "bank_transactions", b));
    }

    #[test]
    fn test_ai_resolution_marks_ai_processed() {
        let h = Harness::new();
        let bank = h.bank("keshavarzi").id;
        let b = add_bank_txn(&h.ledger, bank, "2024-05-01", 200_000.0, TransactionType::ReceivedTransfer);
        add_acc(&h.ledger, bank, "Received Transfer", "2024-05-01", 200_000.0);
        let a2 = add_acc(&h.ledger, bank, "Received Transfer", "2024-05-01", 200_000.0);
        let mut escalator = ScriptedEscalator::new(vec![Resolution::Chosen {
            accounting_id: a2,
            note: Some("AI confidence 0.91: customer name".into()),
            automated: true,
        }]);
        escalator.ai = true;

        let outcome = h.run("keshavarzi", b, &escalator);
        assert_eq!(outcome.kind, OutcomeKind::Resolved);
        let acc = h.ledger.accounting_transaction(a2).unwrap().unwrap();
        assert!(acc.is_reconciled && acc.ai_processed);
        assert!(outcome.reason.contains("customer name"));
    }

    #[test]
    fn test_ai_verdict_is_not_asked_twice() {
        let h = Harness::new();
        let bank = h.bank("keshavarzi").id;
        let b = add_bank_txn(&h.ledger, bank, "2024-05-01", 200_000.0, TransactionType::ReceivedTransfer);
        let a1 = add_acc(&h.ledger, bank, "Received Transfer", "2024-05-01", 200_000.0);
        let a2 = add_acc(&h.ledger, bank, "Received Transfer", "2024-05-01", 200_000.0);
        let declined = || Resolution::Declined {
            reason: "AI found no match: amounts only".into(),
        };
        let mut escalator = ScriptedEscalator::new(vec![declined(), declined()]);
        escalator.ai = true;

        let first = h.run("keshavarzi", b, &escalator);
        assert_eq!(first.kind, OutcomeKind::NeedsReview);
        for id in [a1, a2] {
            let acc = h.ledger.accounting_transaction(id).unwrap().unwrap();
            assert!(acc.ai_processed && !acc.is_reconciled);
        }

        let second = h.run("keshavarzi", b, &escalator);
        assert_eq!(second.kind, OutcomeKind::NeedsReview);
        assert!(second.reason.contains("already handled"));
        assert_eq!(*escalator.seen.lock().unwrap(), vec![vec![a1, a2]]);
    }

    #[test]
    fn test_manual_decline_leaves_ai_flag_alone() {
        let h = Harness::new();
        let bank = h.bank("keshavarzi").id;
        let b = add_bank_txn(&h.ledger, bank, "2024-05-01", 200_000.0, TransactionType::ReceivedTransfer);
        let a1 = add_acc(&h.ledger, bank, "Received Transfer", "2024-05-01", 200_000.0);
        add_acc(&h.ledger, bank, "Received Transfer", "2024-05-01", 200_000.0);
        let escalator = ScriptedEscalator::new(vec![Resolution::Skipped {
            reason: "operator skipped".into(),
        }]);

        h.run("keshavarzi", b, &escalator);
        assert!(!h.ledger.accounting_transaction(a1).unwrap().unwrap().ai_processed);
    }
}
