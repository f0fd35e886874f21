//! Deciding ambiguous matches: nobody, a human at the UI, or an AI webhook.

pub mod ai;
pub mod manual;
pub mod retry;

use std::sync::Arc;

use crate::error::Result;
use crate::models::{AccountingTransaction, BankTransaction, TransactionType};
use crate::settings::{EscalationBackend, ReconciliationConfig};

#[derive(Debug, Clone)]
pub struct EscalationRequest {
    pub bank: BankTransaction,
    pub candidates: Vec<AccountingTransaction>,
    pub transaction_type: TransactionType,
    /// Extra detail for whoever decides, e.g. the fee each candidate implies.
    pub context: Option<String>,
}

impl EscalationRequest {
    pub fn offers(&self, accounting_id: i64) -> bool {
        self.candidates.iter().any(|c| c.id == accounting_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Chosen {
        accounting_id: i64,
        note: Option<String>,
        /// Set when the decision came from the AI service.
        automated: bool,
    },
    /// The decider looked and found no acceptable candidate.
    Declined { reason: String },
    Cancelled { reason: String },
    /// Nobody was asked.
    Skipped { reason: String },
}

pub trait Escalator: Send + Sync {
    fn name(&self) -> &'static str;

    fn resolve_ambiguous(&self, request: &EscalationRequest) -> Result<Resolution>;

    /// Candidate searches feeding this backend skip rows an automated
    /// attempt already handled.
    fn requires_ai_unprocessed(&self) -> bool {
        false
    }
}

pub struct NoEscalation;

impl Escalator for NoEscalation {
    fn name(&self) -> &'static str {
        "none"
    }

    fn resolve_ambiguous(&self, request: &EscalationRequest) -> Result<Resolution> {
        Ok(Resolution::Skipped {
            reason: format!(
                "{} candidates need review; escalation is off",
                request.candidates.len()
            ),
        })
    }
}

/// Build the non-interactive backend the config asks for. Manual escalation
/// needs a UI on the other end, so callers wire it up through
/// [`manual::ManualEscalator`] instead.
pub fn from_config(config: &ReconciliationConfig) -> Result<Arc<dyn Escalator>> {
    config.validate()?;
    match config.escalation {
        EscalationBackend::Ai => Ok(Arc::new(ai::AiEscalator::from_config(config)?)),
        EscalationBackend::None | EscalationBackend::Manual => Ok(Arc::new(NoEscalation)),
    }
}
