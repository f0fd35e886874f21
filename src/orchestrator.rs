//! Drives one reconciliation run for a bank and reports back to the UI.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info, info_span, warn};

use crate::db::get_connection;
use crate::error::{ReconError, Result};
use crate::escalation::manual::{ManualEscalator, ManualRequest};
use crate::escalation::{self, Escalator};
use crate::ledger::Ledger;
use crate::models::{BankTransaction, TransactionType};
use crate::recorder::{Participants, Recorder};
use crate::settings::{EscalationBackend, ReconciliationConfig};
use crate::strategies::{reconcile_one, MatchState, Outcome, OutcomeKind, StrategyContext};

/// Shared stop flag, checked between records.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordReport {
    pub bank_tx_id: i64,
    pub transaction_type: TransactionType,
    pub transaction_date: NaiveDate,
    pub amount: f64,
    pub outcome: OutcomeKind,
    pub state: MatchState,
    pub reason: String,
    pub acc_id: Option<i64>,
}

impl RecordReport {
    fn new(txn: &BankTransaction, outcome: Outcome) -> Self {
        Self {
            bank_tx_id: txn.id,
            transaction_type: txn.transaction_type,
            transaction_date: txn.transaction_date,
            amount: txn.amount,
            outcome: outcome.kind,
            state: outcome.state,
            reason: outcome.reason,
            acc_id: outcome.acc_id,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Summary {
    pub bank_id: i64,
    pub total: usize,
    pub processed: usize,
    pub auto_matched: usize,
    pub resolved: usize,
    pub needs_review: usize,
    pub no_match: usize,
    pub errors: usize,
    /// Lines an earlier record of the same run already closed.
    pub skipped: usize,
    pub cancelled: bool,
    pub records: Vec<RecordReport>,
}

impl Summary {
    fn tally(&mut self, report: RecordReport) {
        self.processed += 1;
        match report.outcome {
            OutcomeKind::AutoMatched => self.auto_matched += 1,
            OutcomeKind::Resolved => self.resolved += 1,
            OutcomeKind::NeedsReview => self.needs_review += 1,
            OutcomeKind::NoMatch => self.no_match += 1,
            OutcomeKind::Error => self.errors += 1,
        }
        self.records.push(report);
    }

    fn skip(&mut self) {
        self.processed += 1;
        self.skipped += 1;
    }

    pub fn matched(&self) -> usize {
        self.auto_matched + self.resolved
    }
}

/// Everything the UI thread hears from a run.
#[derive(Debug)]
pub enum RunEvent {
    Started { bank_id: i64, total: usize },
    Progress { processed: usize, total: usize },
    RecordFinished(RecordReport),
    /// Answer it (or drop it to cancel); the worker is blocked until then.
    ManualReview(ManualRequest),
    Finished(Summary),
    Failed(String),
}

pub struct Reconciler<'a> {
    ledger: &'a Ledger,
    config: &'a ReconciliationConfig,
    escalator: &'a dyn Escalator,
    cancel: CancelToken,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        ledger: &'a Ledger,
        config: &'a ReconciliationConfig,
        escalator: &'a dyn Escalator,
        cancel: CancelToken,
    ) -> Self {
        Self {
            ledger,
            config,
            escalator,
            cancel,
        }
    }

    /// Reconcile every open bank line of `bank_id`, category by category.
    pub fn run(&self, bank_id: i64, events: &mut dyn FnMut(RunEvent)) -> Result<Summary> {
        let bank = self.ledger.bank(bank_id)?;
        let _span = info_span!("run", bank = %bank.code).entered();

        let pending = self.ledger.find_unreconciled_bank_transactions(bank_id)?;
        if pending.is_empty() {
            return Err(ReconError::NothingToDo(bank_id));
        }
        let unknown = pending
            .iter()
            .filter(|t| t.transaction_type == TransactionType::Unknown)
            .count();
        if unknown > 0 {
            return Err(ReconError::Configuration(format!(
                "{unknown} open transactions of bank {} have no resolved type; classify them first",
                bank.code
            )));
        }

        let total = pending.len();
        info!(total, escalation = self.escalator.name(), "reconciliation started");
        events(RunEvent::Started { bank_id, total });

        let ctx = StrategyContext {
            ledger: self.ledger,
            config: self.config,
            escalator: self.escalator,
            bank: &bank,
        };
        let mut summary = Summary {
            bank_id,
            total,
            ..Default::default()
        };

        'partitions: for kind in TransactionType::MATCHABLE {
            for txn in pending.iter().filter(|t| t.transaction_type == kind) {
                if self.cancel.is_cancelled() {
                    info!(processed = summary.processed, "run cancelled");
                    summary.cancelled = true;
                    break 'partitions;
                }
                match self.reconcile_isolated(&ctx, txn) {
                    Some(outcome) => {
                        let report = RecordReport::new(txn, outcome);
                        events(RunEvent::RecordFinished(report.clone()));
                        summary.tally(report);
                    }
                    None => summary.skip(),
                }
                events(RunEvent::Progress {
                    processed: summary.processed,
                    total,
                });
            }
        }

        info!(
            processed = summary.processed,
            matched = summary.matched(),
            needs_review = summary.needs_review,
            no_match = summary.no_match,
            errors = summary.errors,
            skipped = summary.skipped,
            "reconciliation finished"
        );
        Ok(summary)
    }

    /// A failing record never takes the run down with it. `None` means an
    /// earlier record's side effects already closed this line.
    fn reconcile_isolated(&self, ctx: &StrategyContext<'_>, txn: &BankTransaction) -> Option<Outcome> {
        let result = self.ledger.bank_transaction(txn.id).and_then(|fresh| {
            if fresh.is_some_and(|f| !f.is_reconciled) {
                reconcile_one(ctx, txn).map(Some)
            } else {
                debug!(bank_tx = txn.id, "already reconciled during this run");
                Ok(None)
            }
        });
        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(bank_tx = txn.id, storage = e.is_storage(), error = %e, "record failed");
                let reason = format!("error: {e}");
                if let Err(log_err) = Recorder::new(self.ledger).commit_failure(
                    Participants::bank(txn.id),
                    &reason,
                    txn.transaction_type.as_str(),
                ) {
                    warn!(bank_tx = txn.id, error = %log_err, "could not record failure");
                }
                Some(Outcome {
                    kind: OutcomeKind::Error,
                    state: MatchState::Error,
                    reason,
                    acc_id: None,
                })
            }
        }
    }
}

pub struct RunHandle {
    pub events: Receiver<RunEvent>,
    pub join: JoinHandle<Result<Summary>>,
}

/// Start a run on a worker thread with its own connection. The caller drains
/// `events` on its thread and answers any manual reviews that arrive.
pub fn spawn_run(
    db_path: PathBuf,
    bank_id: i64,
    config: ReconciliationConfig,
    cancel: CancelToken,
) -> Result<RunHandle> {
    config.validate()?;
    let (tx, rx) = mpsc::channel();

    let escalator: Arc<dyn Escalator> = match config.escalation {
        EscalationBackend::Manual => {
            let outbox = tx.clone();
            Arc::new(ManualEscalator::new(move |request| {
                outbox.send(RunEvent::ManualReview(request)).is_ok()
            }))
        }
        _ => escalation::from_config(&config)?,
    };

    let join = thread::Builder::new()
        .name("reconcile".into())
        .spawn(move || {
            let result = get_connection(&db_path).and_then(|conn| {
                let ledger = Ledger::new(conn);
                let reconciler = Reconciler::new(&ledger, &config, escalator.as_ref(), cancel);
                reconciler.run(bank_id, &mut |event| {
                    let _ = tx.send(event);
                })
            });
            let _ = match &result {
                Ok(summary) => tx.send(RunEvent::Finished(summary.clone())),
                Err(e) => tx.send(RunEvent::Failed(e.to_string())),
            };
            result
        })?;

    Ok(RunHandle { events: rx, join })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::escalation::manual::ManualAnswer;
    use crate::escalation::{EscalationRequest, NoEscalation, Resolution};
    use crate::ledger::fixtures::*;

    fn plain_run(ledger: &Ledger, bank: i64, cancel: CancelToken) -> Result<Summary> {
        let config = ReconciliationConfig::default();
        Reconciler::new(ledger, &config, &NoEscalation, cancel).run(bank, &mut |_| {})
    }

    #[test]
    fn test_nothing_to_do() {
        let (_dir, ledger) = test_ledger();
        let bank = bank_id(&ledger, "keshavarzi");
        let err = plain_run(&ledger, bank, CancelToken::new()).unwrap_err();
        assert!(matches!(err, ReconError::NothingToDo(id) if id == bank));
    }

    #[test]
    fn test_unknown_rows_abort_before_any_write() {
        let (_dir, ledger) = test_ledger();
        let bank = bank_id(&ledger, "keshavarzi");
        add_bank_txn(&ledger, bank, "2024-05-01", 100.0, TransactionType::ReceivedTransfer);
        add_acc(&ledger, bank, "Received Transfer", "2024-05-01", 100.0);
        add_bank_txn(&ledger, bank, "2024-05-01", 5.0, TransactionType::Unknown);

        let err = plain_run(&ledger, bank, CancelToken::new()).unwrap_err();
        assert!(matches!(err, ReconError::Configuration(_)));
        assert_eq!(result_count(&ledger), 0);
    }

    #[test]
    fn test_partitions_run_in_category_order() {
        let (_dir, ledger) = test_ledger();
        let bank = bank_id(&ledger, "keshavarzi");
        let paid = add_bank_txn(&ledger, bank, "2024-05-01", -40.0, TransactionType::PaidTransfer);
        let fee = add_bank_txn(&ledger, bank, "2024-05-01", -3.0, TransactionType::BankFee);
        let received = add_bank_txn(&ledger, bank, "2024-05-02", 90.0, TransactionType::ReceivedTransfer);

        let summary = plain_run(&ledger, bank, CancelToken::new()).unwrap();
        let order: Vec<i64> = summary.records.iter().map(|r| r.bank_tx_id).collect();
        assert_eq!(order, vec![received, paid, fee]);
        assert_eq!(summary.no_match, 3);
        assert_eq!(result_count(&ledger), 3);
    }

    #[test]
    fn test_cancel_stops_between_records() {
        let (_dir, ledger) = test_ledger();
        let bank = bank_id(&ledger, "keshavarzi");
        for day in ["2024-05-01", "2024-05-02", "2024-05-03"] {
            add_bank_txn(&ledger, bank, day, 100.0, TransactionType::ReceivedTransfer);
            add_acc(&ledger, bank, "Received Transfer", day, 100.0);
        }
        let cancel = CancelToken::new();
        let config = ReconciliationConfig::default();
        let reconciler = Reconciler::new(&ledger, &config, &NoEscalation, cancel.clone());

        let summary = reconciler
            .run(bank, &mut |event| {
                if matches!(event, RunEvent::RecordFinished(_)) {
                    cancel.cancel();
                }
            })
            .unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.processed, 1);
        assert_eq!(result_count(&ledger), 1);
        assert_eq!(ledger.counts(bank).unwrap().bank_open, 2);
    }

    #[test]
    fn test_failing_record_is_isolated() {
        struct Broken;
        impl Escalator for Broken {
            fn name(&self) -> &'static str {
                "broken"
            }
            fn resolve_ambiguous(&self, _request: &EscalationRequest) -> Result<Resolution> {
                Err(ReconError::Transport("webhook unreachable after 3 attempts".into()))
            }
        }

        let (_dir, ledger) = test_ledger();
        let bank = bank_id(&ledger, "keshavarzi");
        let ambiguous = add_bank_txn(&ledger, bank, "2024-05-01", 100.0, TransactionType::ReceivedTransfer);
        add_acc(&ledger, bank, "Received Transfer", "2024-05-01", 100.0);
        add_acc(&ledger, bank, "Received Transfer", "2024-05-01", 100.0);
        let clean = add_bank_txn(&ledger, bank, "2024-05-02", 70.0, TransactionType::ReceivedTransfer);
        add_acc(&ledger, bank, "Received Transfer", "2024-05-02", 70.0);

        let config = ReconciliationConfig::default();
        let summary = Reconciler::new(&ledger, &config, &Broken, CancelToken::new())
            .run(bank, &mut |_| {})
            .unwrap();
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.auto_matched, 1);
        assert!(!is_reconciled(&ledger, "bank_transactions", ambiguous));
        assert!(is_reconciled(&ledger, "bank_transactions", clean));
        let reason: String = ledger
            .conn()
            .query_row(
                "SELECT description FROM reconciliation_results WHERE bank_record_id = ?1",
                [ambiguous],
                |r| r.get(0),
            )
            .unwrap();
        assert!(reason.contains("webhook unreachable"));
    }

    /// Runs `action` on a second connection while the escalation is pending.
    struct Meddler<F>(PathBuf, F);

    impl<F: Fn(&Ledger) -> Result<Resolution> + Send + Sync> Escalator for Meddler<F> {
        fn name(&self) -> &'static str {
            "meddler"
        }
        fn resolve_ambiguous(&self, _request: &EscalationRequest) -> Result<Resolution> {
            let other = Ledger::new(get_connection(&self.0)?);
            (self.1)(&other)
        }
    }

    #[test]
    fn test_storage_failure_is_a_per_record_error() {
        let (dir, ledger) = test_ledger();
        let bank = bank_id(&ledger, "keshavarzi");
        add_bank_txn(&ledger, bank, "2024-05-01", 100.0, TransactionType::ReceivedTransfer);
        add_acc(&ledger, bank, "Received Transfer", "2024-05-01", 100.0);
        add_acc(&ledger, bank, "Received Transfer", "2024-05-01", 100.0);
        add_bank_txn(&ledger, bank, "2024-05-02", 70.0, TransactionType::ReceivedTransfer);
        let escalator = Meddler(dir.path().join("test.db"), |other: &Ledger| -> Result<Resolution> {
            other
                .conn()
                .execute_batch("ALTER TABLE bank_transactions RENAME TO bank_transactions_moved")?;
            Err(ReconError::Transport("webhook unreachable".into()))
        });

        let config = ReconciliationConfig::default();
        let summary = Reconciler::new(&ledger, &config, &escalator, CancelToken::new())
            .run(bank, &mut |_| {})
            .unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.errors, 2);
        assert!(summary.records.iter().all(|r| r.outcome == OutcomeKind::Error));
    }

    #[test]
    fn test_line_closed_earlier_in_run_is_skipped() {
        let (dir, ledger) = test_ledger();
        let bank = bank_id(&ledger, "keshavarzi");
        let first = add_bank_txn(&ledger, bank, "2024-05-01", 100.0, TransactionType::ReceivedTransfer);
        add_acc(&ledger, bank, "Received Transfer", "2024-05-01", 100.0);
        add_acc(&ledger, bank, "Received Transfer", "2024-05-01", 100.0);
        let second = add_bank_txn(&ledger, bank, "2024-05-02", 70.0, TransactionType::ReceivedTransfer);
        let escalator = Meddler(dir.path().join("test.db"), move |other: &Ledger| -> Result<Resolution> {
            other.set_bank_reconciled(second, true)?;
            Ok(Resolution::Skipped {
                reason: "operator skipped".into(),
            })
        });

        let config = ReconciliationConfig::default();
        let summary = Reconciler::new(&ledger, &config, &escalator, CancelToken::new())
            .run(bank, &mut |_| {})
            .unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.auto_matched, 0);
        assert_eq!(summary.needs_review, 1);
        let reported: Vec<i64> = summary.records.iter().map(|r| r.bank_tx_id).collect();
        assert_eq!(reported, vec![first]);
    }

    #[test]
    fn test_events_report_progress() {
        let (_dir, ledger) = test_ledger();
        let bank = bank_id(&ledger, "saderat");
        add_bank_txn(&ledger, bank, "2024-05-01", 100.0, TransactionType::ReceivedTransfer);
        add_bank_txn(&ledger, bank, "2024-05-02", 100.0, TransactionType::ReceivedTransfer);
        let seen = Mutex::new(vec![]);
        let config = ReconciliationConfig::default();
        Reconciler::new(&ledger, &config, &NoEscalation, CancelToken::new())
            .run(bank, &mut |event| {
                if let RunEvent::Progress { processed, total } = event {
                    seen.lock().unwrap().push((processed, total));
                }
            })
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(1, 2), (2, 2)]);
    }

    fn seeded_db() -> (tempfile::TempDir, PathBuf, i64, i64, i64) {
        let (dir, ledger) = test_ledger();
        let bank = bank_id(&ledger, "keshavarzi");
        let b = add_bank_txn(&ledger, bank, "2024-05-01", 500.0, TransactionType::ReceivedTransfer);
        let a1 = add_acc(&ledger, bank, "Received Transfer", "2024-05-01", 500.0);
        add_acc(&ledger, bank, "Received Transfer", "2024-05-01", 500.0);
        let path = dir.path().join("test.db");
        (dir, path, bank, b, a1)
    }

    fn manual_config() -> ReconciliationConfig {
        ReconciliationConfig {
            escalation: EscalationBackend::Manual,
            ..Default::default()
        }
    }

    #[test]
    fn test_spawned_run_with_manual_review() {
        let (_dir, path, bank, b, a1) = seeded_db();
        let handle = spawn_run(path.clone(), bank, manual_config(), CancelToken::new()).unwrap();

        let mut finished = None;
        for event in handle.events.iter() {
            match event {
                RunEvent::ManualReview(request) => {
                    assert_eq!(request.case.bank.id, b);
                    assert_eq!(request.case.candidates.len(), 2);
                    request.respond(ManualAnswer::Select {
                        accounting_id: a1,
                        notes: Some("same customer".into()),
                    });
                }
                RunEvent::Finished(summary) => finished = Some(summary),
                RunEvent::Failed(e) => panic!("run failed: {e}"),
                _ => {}
            }
        }
        let summary = finished.expect("run should finish");
        assert_eq!(summary.resolved, 1);
        assert!(handle.join.join().unwrap().is_ok());

        let ledger = Ledger::new(get_connection(&path).unwrap());
        assert!(is_reconciled(&ledger, "accounting_transactions", a1));
        assert!(is_reconciled(&ledger, "bank_transactions", b));
    }

    #[test]
    fn test_dropped_review_counts_as_cancel() {
        let (_dir, path, bank, b, _a1) = seeded_db();
        let handle = spawn_run(path.clone(), bank, manual_config(), CancelToken::new()).unwrap();

        let mut summary = None;
        for event in handle.events.iter() {
            match event {
                RunEvent::ManualReview(request) => drop(request),
                RunEvent::Finished(s) => summary = Some(s),
                _ => {}
            }
        }
        let summary = summary.expect("run should finish");
        assert_eq!(summary.needs_review, 1);
        assert_eq!(summary.records[0].state, MatchState::Cancelled);
        handle.join.join().unwrap().unwrap();

        let ledger = Ledger::new(get_connection(&path).unwrap());
        assert!(!is_reconciled(&ledger, "bank_transactions", b));
    }

    #[test]
    fn test_spawn_rejects_ai_without_url() {
        let config = ReconciliationConfig {
            escalation: EscalationBackend::Ai,
            ..Default::default()
        };
        let err = spawn_run(PathBuf::from("/nonexistent.db"), 1, config, CancelToken::new()).err();
        assert!(matches!(err, Some(ReconError::Configuration(_))));
    }

    #[test]
    fn test_spawned_run_reports_failure() {
        let (_dir, path, _bank, _b, _a1) = seeded_db();
        let handle = spawn_run(path, 999, ReconciliationConfig::default(), CancelToken::new()).unwrap();
        let failed = handle.events.iter().any(|e| matches!(e, RunEvent::Failed(_)));
        assert!(failed);
        assert!(handle.join.join().unwrap().is_err());
    }
}
