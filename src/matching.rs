//! Candidate search and tie-breaking shared by every reconciliation strategy.

use chrono::NaiveDate;

use crate::error::Result;
use crate::ledger::{AmountCompare, AmountFilter, CandidateQuery, DateField, Ledger};
use crate::models::{accounting_types, AccountingTransaction, BankTransaction, TransactionType};

// ---------------------------------------------------------------------------
// Type mapping
// ---------------------------------------------------------------------------

// legacy label -> additional new-system label
const TYPE_MAPPING: &[(&str, &str)] = &[
    (accounting_types::POS, accounting_types::POS_RECEIVED_TRANSFER),
    (accounting_types::RECEIVED_TRANSFER, accounting_types::POS_RECEIVED_TRANSFER),
    (accounting_types::PAID_TRANSFER, accounting_types::POS_PAID_TRANSFER),
];

/// Every stored label a search for `label` must accept. Directional: a
/// new-system label does not pull legacy rows back in.
pub fn search_types(label: &str) -> Vec<String> {
    let mut types = vec![label.to_string()];
    types.extend(
        TYPE_MAPPING
            .iter()
            .filter(|(legacy, _)| *legacy == label)
            .map(|(_, mapped)| mapped.to_string()),
    );
    types
}

pub fn types_for(kind: TransactionType) -> Vec<String> {
    kind.accounting_label().map(search_types).unwrap_or_default()
}

/// Accounting candidates for one bank-side amount on one date.
#[allow(clippy::too_many_arguments)]
pub fn find_candidates(
    ledger: &Ledger,
    bank_id: i64,
    date_field: DateField,
    date: NaiveDate,
    amount: f64,
    kind: TransactionType,
    compare: AmountCompare,
    require_ai_unprocessed: bool,
) -> Result<Vec<AccountingTransaction>> {
    ledger.find_accounting_candidates(&CandidateQuery {
        bank_id,
        date_field,
        date: Some(date),
        amount: AmountFilter::Equal(amount, compare),
        types: types_for(kind),
        require_ai_unprocessed,
    })
}

// ---------------------------------------------------------------------------
// Tie-breaks
// ---------------------------------------------------------------------------

/// The shorter value must be the trailing part of the longer one.
pub fn suffix_match(a: &str, b: &str) -> bool {
    let (a, b) = (a.trim(), b.trim());
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a.len() <= b.len() {
        b.ends_with(a)
    } else {
        a.ends_with(b)
    }
}

/// Last four digits of a (possibly masked) card number.
pub fn card_fragment(card_number: &str) -> Option<String> {
    let digits: Vec<char> = card_number.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 4 {
        return None;
    }
    Some(digits[digits.len() - 4..].iter().collect())
}

#[derive(Debug, Clone, Default)]
pub struct MatchSource<'a> {
    pub tracking: Option<&'a str>,
    pub card_number: Option<&'a str>,
    /// Internal terminal id; only set for POS settlements.
    pub terminal_id: Option<i64>,
}

impl<'a> MatchSource<'a> {
    pub fn from_bank(txn: &'a BankTransaction) -> Self {
        Self {
            tracking: txn.tracking_reference(),
            card_number: txn.source_card_number.as_deref(),
            terminal_id: None,
        }
    }

    pub fn with_terminal(mut self, terminal_id: Option<i64>) -> Self {
        self.terminal_id = terminal_id;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchBasis {
    SingleCandidate,
    TrackingNumber,
    CardFragment,
    TerminalId,
}

impl MatchBasis {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::SingleCandidate => "single candidate on amount and date",
            Self::TrackingNumber => "tracking number",
            Self::CardFragment => "card number fragment in description",
            Self::TerminalId => "terminal id as reference",
        }
    }
}

#[derive(Debug, Clone)]
pub enum MatchOutcome {
    NoMatch,
    Matched {
        candidate: AccountingTransaction,
        basis: MatchBasis,
    },
    /// Two or more survivors and no tie-break picked exactly one.
    Unresolved(Vec<AccountingTransaction>),
}

fn single_survivor<F>(candidates: &[AccountingTransaction], pred: F) -> Option<usize>
where
    F: Fn(&AccountingTransaction) -> bool,
{
    let mut hits = candidates.iter().enumerate().filter(|(_, c)| pred(c));
    match (hits.next(), hits.next()) {
        (Some((idx, _)), None) => Some(idx),
        _ => None,
    }
}

/// Pick one candidate or report why not. Tie-breaks run in strict order,
/// each over the full candidate list, and stop at the first unique hit.
pub fn select_best_match(source: &MatchSource<'_>, mut candidates: Vec<AccountingTransaction>) -> MatchOutcome {
    match candidates.len() {
        0 => return MatchOutcome::NoMatch,
        1 => {
            return MatchOutcome::Matched {
                candidate: candidates.remove(0),
                basis: MatchBasis::SingleCandidate,
            }
        }
        _ => {}
    }

    if let Some(tracking) = source.tracking {
        let hit = single_survivor(&candidates, |c| {
            c.transaction_number
                .as_deref()
                .is_some_and(|number| suffix_match(tracking, number))
        });
        if let Some(idx) = hit {
            return MatchOutcome::Matched {
                candidate: candidates.swap_remove(idx),
                basis: MatchBasis::TrackingNumber,
            };
        }
    }

    if let Some(fragment) = source.card_number.and_then(card_fragment) {
        let hit = single_survivor(&candidates, |c| {
            c.description.as_deref().is_some_and(|d| d.contains(&fragment))
        });
        if let Some(idx) = hit {
            return MatchOutcome::Matched {
                candidate: candidates.swap_remove(idx),
                basis: MatchBasis::CardFragment,
            };
        }
    }

    if let Some(terminal_id) = source.terminal_id {
        let expected = terminal_id.to_string();
        let hit = single_survivor(&candidates, |c| {
            c.transaction_number.as_deref().map(str::trim) == Some(expected.as_str())
        });
        if let Some(idx) = hit {
            return MatchOutcome::Matched {
                candidate: candidates.swap_remove(idx),
                basis: MatchBasis::TerminalId,
            };
        }
    }

    MatchOutcome::Unresolved(candidates)
}
