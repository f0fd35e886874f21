//! Shaparak settlement lines against accounting POS entries.
//!
//! Simple banks match the settlement amount directly. Terminal-routed banks
//! key the match on the internal terminal id and sweep that terminal's swipes
//! for the day; when the terminal is not registered each swipe is matched on
//! its own.

use chrono::{Duration, NaiveDate};
use tracing::{debug, info};

use super::{
    commit_pair, escalate, record_open, type_matched, with_note, Attempt, MatchState, Outcome, StrategyContext,
};
use crate::error::Result;
use crate::ledger::{AmountCompare, DateField, PosLookup};
use crate::matching::{card_fragment, find_candidates, select_best_match, MatchBasis, MatchOutcome, MatchSource};
use crate::models::{AccountingTransaction, BankTransaction, PosMode, PosTransaction, TransactionType};
use crate::recorder::{Entry, MatchExtras, Participants};

pub fn reconcile(ctx: &StrategyContext<'_>, txn: &BankTransaction) -> Result<Outcome> {
    let attempt = Attempt::start(txn.id)?;
    let swipe_date = txn.transaction_date - Duration::days(ctx.config.pos_settlement_lag_days);
    let terminal_number = txn
        .extracted_terminal_id
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty());

    match (ctx.bank.pos_mode, terminal_number) {
        (PosMode::TerminalRouted, Some(number)) => match ctx.ledger.resolve_terminal_id(number)? {
            Some(terminal_id) => routed(ctx, attempt, txn, swipe_date, terminal_id),
            None => per_swipe(ctx, attempt, txn, swipe_date, number),
        },
        (_, number) => {
            let terminal_id = match number {
                Some(n) => ctx.ledger.resolve_terminal_id(n)?,
                None => None,
            };
            simple(ctx, attempt, txn, swipe_date, terminal_id)
        }
    }
}

fn pos_candidates(
    ctx: &StrategyContext<'_>,
    bank_id: i64,
    date: NaiveDate,
    amount: f64,
    compare: AmountCompare,
) -> Result<Vec<AccountingTransaction>> {
    find_candidates(
        ctx.ledger,
        bank_id,
        DateField::DueDate,
        date,
        amount,
        TransactionType::ReceivedPos,
        compare,
        false,
    )
}

fn simple(
    ctx: &StrategyContext<'_>,
    attempt: Attempt,
    txn: &BankTransaction,
    swipe_date: NaiveDate,
    terminal_id: Option<i64>,
) -> Result<Outcome> {
    let candidates = pos_candidates(ctx, txn.bank_id, swipe_date, txn.amount, AmountCompare::Absolute)?;
    let source = MatchSource::from_bank(txn).with_terminal(terminal_id);
    settle(ctx, attempt, txn, swipe_date, &source, candidates, None)
}

fn routed(
    ctx: &StrategyContext<'_>,
    attempt: Attempt,
    txn: &BankTransaction,
    swipe_date: NaiveDate,
    terminal_id: i64,
) -> Result<Outcome> {
    let key = terminal_id.to_string();
    let candidates: Vec<AccountingTransaction> =
        pos_candidates(ctx, txn.bank_id, swipe_date, txn.amount, AmountCompare::Absolute)?
            .into_iter()
            .filter(|c| c.transaction_number.as_deref().map(str::trim) == Some(key.as_str()))
            .collect();
    debug!(bank_tx = txn.id, terminal_id, candidates = candidates.len(), "terminal-routed search");
    let source = MatchSource::from_bank(txn).with_terminal(Some(terminal_id));
    settle(ctx, attempt, txn, swipe_date, &source, candidates, Some(terminal_id))
}

/// Shared tail of the simple and routed paths. With a routed terminal every
/// swipe on it for the day is closed along with the match.
fn settle(
    ctx: &StrategyContext<'_>,
    attempt: Attempt,
    txn: &BankTransaction,
    swipe_date: NaiveDate,
    source: &MatchSource<'_>,
    candidates: Vec<AccountingTransaction>,
    sweep: Option<i64>,
) -> Result<Outcome> {
    let extras = |ai_reviewed: Vec<i64>| MatchExtras {
        terminal_settlement: sweep.map(|terminal_id| (terminal_id, swipe_date)),
        ai_reviewed,
        ..Default::default()
    };

    match select_best_match(source, candidates) {
        MatchOutcome::Matched { candidate, basis } => {
            let description = format!("POS settlement matched by {}", basis.describe());
            commit_pair(ctx, attempt, MatchState::AutoMatched, txn, &candidate, description, extras(Vec::new()))
        }
        MatchOutcome::Unresolved(candidates) => {
            let context = format!("settlement of swipes dated {swipe_date}");
            escalate(ctx, attempt, txn, candidates, Some(context), |attempt, acc, note, ai_reviewed| {
                let description = with_note("POS settlement matched after review".to_string(), note);
                commit_pair(ctx, attempt, MatchState::Resolved, txn, acc, description, extras(ai_reviewed))
            })
        }
        MatchOutcome::NoMatch => {
            let reason = match sweep {
                Some(terminal_id) => format!(
                    "No accounting POS entry for terminal {terminal_id} with amount {} on {swipe_date}",
                    txn.amount.abs()
                ),
                None => format!("No accounting POS entry with amount {} on {swipe_date}", txn.amount.abs()),
            };
            record_open(ctx, attempt, MatchState::NoMatch, txn, reason)
        }
    }
}

/// Pick the accounting entry for one swipe: a lone candidate, else the one
/// naming the card, else the one carrying the swipe's tracking number.
fn pick_for_swipe(
    pos: &PosTransaction,
    mut candidates: Vec<AccountingTransaction>,
) -> std::result::Result<(AccountingTransaction, MatchBasis), usize> {
    if candidates.len() == 1 {
        return Ok((candidates.remove(0), MatchBasis::SingleCandidate));
    }
    let unique = |hits: Vec<usize>| (hits.len() == 1).then(|| hits[0]);

    if let Some(fragment) = pos.card_number.as_deref().and_then(card_fragment) {
        let hits = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.description.as_deref().is_some_and(|d| d.contains(&fragment)))
            .map(|(i, _)| i)
            .collect();
        if let Some(idx) = unique(hits) {
            return Ok((candidates.swap_remove(idx), MatchBasis::CardFragment));
        }
    }
    if let Some(tracking) = pos.tracking_number.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        let hits = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.transaction_number.as_deref().map(str::trim) == Some(tracking))
            .map(|(i, _)| i)
            .collect();
        if let Some(idx) = unique(hits) {
            return Ok((candidates.swap_remove(idx), MatchBasis::TrackingNumber));
        }
    }
    Err(candidates.len())
}

/// Unregistered terminal: reconcile the day's swipes one by one and close the
/// settlement line if any of them matched. Swipe results and the settlement
/// line are written in one transaction.
fn per_swipe(
    ctx: &StrategyContext<'_>,
    mut attempt: Attempt,
    txn: &BankTransaction,
    swipe_date: NaiveDate,
    terminal_number: &str,
) -> Result<Outcome> {
    let swipes = ctx
        .ledger
        .find_pos_transactions(PosLookup::TerminalNumber(terminal_number), swipe_date, true)?;
    if swipes.is_empty() {
        let reason = format!("Terminal {terminal_number} is not registered and has no open swipes on {swipe_date}");
        return record_open(ctx, attempt, MatchState::NoMatch, txn, reason);
    }

    let mut entries = Vec::with_capacity(swipes.len() + 1);
    let mut claimed: Vec<i64> = Vec::new();
    let (mut matched, mut ambiguous) = (0usize, 0usize);
    for pos in &swipes {
        let candidates: Vec<AccountingTransaction> =
            pos_candidates(ctx, pos.bank_id, pos.transaction_date, pos.transaction_amount, AmountCompare::Exact)?
                .into_iter()
                .filter(|c| !claimed.contains(&c.id))
                .collect();
        if candidates.is_empty() {
            debug!(pos = pos.id, "no accounting entry for swipe");
            continue;
        }
        match pick_for_swipe(pos, candidates) {
            Ok((acc, basis)) => {
                claimed.push(acc.id);
                entries.push(Entry::matched(
                    Participants::pos_and_accounting(pos.id, acc.id),
                    format!("POS swipe matched by {}", basis.describe()),
                    "Pos",
                ));
                matched += 1;
            }
            Err(count) => {
                entries.push(Entry::failed(
                    Participants {
                        pos_id: Some(pos.id),
                        ..Default::default()
                    },
                    format!("needs review: {count} accounting entries fit this swipe"),
                    "Pos",
                ));
                ambiguous += 1;
            }
        }
    }
    info!(bank_tx = txn.id, terminal_number, swipes = swipes.len(), matched, ambiguous, "per-swipe settlement");

    let settlement = Participants::bank(txn.id);
    let (state, reason) = if matched > 0 {
        let reason = format!(
            "POS settlement closed through {matched} of {} swipes on unregistered terminal {terminal_number}",
            swipes.len()
        );
        entries.push(Entry::matched(settlement, reason.clone(), type_matched(txn)));
        (MatchState::AutoMatched, reason)
    } else if ambiguous > 0 {
        // ambiguous swipes are left for review rather than escalated one by one
        attempt.advance(MatchState::Escalated)?;
        let reason = format!("needs review: {ambiguous} swipes on terminal {terminal_number} have several candidates");
        entries.push(Entry::failed(settlement, reason.clone(), type_matched(txn)));
        (MatchState::Skipped, reason)
    } else {
        let reason = format!("None of the {} swipes on terminal {terminal_number} matched an accounting entry", swipes.len());
        entries.push(Entry::failed(settlement, reason.clone(), type_matched(txn)));
        (MatchState::NoMatch, reason)
    };

    ctx.recorder().commit_all(&entries)?;
    attempt.advance(state)?;
    Ok(attempt.finish(reason, None))
}
