use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Mutex;

use tracing::{debug, info};

use super::{EscalationRequest, Escalator, Resolution};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManualAnswer {
    Select { accounting_id: i64, notes: Option<String> },
    Cancel,
}

/// One ambiguous case waiting on a human. Answering consumes it; dropping it
/// unanswered counts as a cancellation.
#[derive(Debug)]
pub struct ManualRequest {
    pub case: EscalationRequest,
    reply: SyncSender<ManualAnswer>,
}

impl ManualRequest {
    pub fn respond(self, answer: ManualAnswer) {
        // The worker may have been torn down already; nothing left to tell.
        let _ = self.reply.send(answer);
    }
}

type Outbox = Box<dyn FnMut(ManualRequest) -> bool + Send>;

/// Hands ambiguous cases to the UI thread and blocks until it answers.
///
/// Requests go out strictly one at a time in arrival order: the outbox lock is
/// held for the whole round-trip, so a second caller waits until the first
/// case has its answer.
pub struct ManualEscalator {
    outbox: Mutex<Outbox>,
}

impl ManualEscalator {
    pub fn new<F>(outbox: F) -> Self
    where
        F: FnMut(ManualRequest) -> bool + Send + 'static,
    {
        Self {
            outbox: Mutex::new(Box::new(outbox)),
        }
    }
}

#[cfg(test)]
/// Escalator plus the receiving end a UI loop reads requests from.
pub fn manual_channel() -> (ManualEscalator, Receiver<ManualRequest>) {
    let (tx, rx) = mpsc::channel();
    let escalator = ManualEscalator::new(move |request| tx.send(request).is_ok());
    (escalator, rx)
}

impl Escalator for ManualEscalator {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn resolve_ambiguous(&self, request: &EscalationRequest) -> Result<Resolution> {
        let mut outbox = self.outbox.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let delivered = (*outbox)(ManualRequest {
            case: request.clone(),
            reply: reply_tx,
        });
        if !delivered {
            return Ok(Resolution::Cancelled {
                reason: "no review dialog is listening".into(),
            });
        }
        debug!(bank_tx = request.bank.id, candidates = request.candidates.len(), "waiting for manual review");

        match reply_rx.recv() {
            Ok(ManualAnswer::Select { accounting_id, notes }) => {
                info!(bank_tx = request.bank.id, accounting_id, "reviewer selected a candidate");
                Ok(Resolution::Chosen {
                    accounting_id,
                    note: notes.filter(|n| !n.trim().is_empty()),
                    automated: false,
                })
            }
            Ok(ManualAnswer::Cancel) => Ok(Resolution::Cancelled {
                reason: "reviewer cancelled the selection".into(),
            }),
            Err(_) => Ok(Resolution::Cancelled {
                reason: "review dialog closed without an answer".into(),
            }),
        }
    }
}
