use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::retry::{AttemptError, RetryPolicy, Sleeper, ThreadSleeper};
use super::{EscalationRequest, Escalator, Resolution};
use crate::error::{ReconError, Result};
use crate::models::TransactionType;
use crate::settings::ReconciliationConfig;

#[derive(Debug, Clone)]
pub struct WebhookReply {
    pub status: u16,
    pub body: String,
}

/// The one thing we need from HTTP: POST a JSON body, get status + body.
pub trait WebhookTransport: Send + Sync {
    fn post_json(&self, url: &str, body: &Value, timeout: Duration) -> std::result::Result<WebhookReply, AttemptError>;
}

pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .build()
            .map_err(|e| ReconError::Configuration(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl WebhookTransport for ReqwestTransport {
    fn post_json(&self, url: &str, body: &Value, timeout: Duration) -> std::result::Result<WebhookReply, AttemptError> {
        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .map_err(|e| AttemptError::Http(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|e| AttemptError::Http(format!("reading response body: {e}")))?;
        Ok(WebhookReply { status, body })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AiMatchResponse {
    pub matched: bool,
    #[serde(default)]
    pub matched_accounting_id: Option<i64>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub suggestions: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct AiErrorBody {
    error: String,
    #[serde(default)]
    detail: Option<String>,
}

fn matching_rules(kind: TransactionType, fee_threshold: f64) -> Value {
    match kind {
        TransactionType::ReceivedTransfer | TransactionType::PaidTransfer => json!({
            "amount": "accounting transaction_amount equals the absolute bank amount, or is lower by a bank fee",
            "max_fee": fee_threshold,
            "date": "accounting due_date equals the bank transaction_date",
            "tracking": "the shorter of bank reference and transaction_number is a suffix of the longer",
            "card": "last four digits of source_card_number appear in the accounting description",
        }),
        TransactionType::ReceivedPos => json!({
            "amount": "absolute amounts are equal",
            "date": "accounting due_date is one day before the bank settlement date",
            "terminal": "transaction_number may hold the internal terminal id",
            "card": "last four digits of the card appear in the accounting description",
        }),
        TransactionType::ReceivedCheck | TransactionType::PaidCheck => json!({
            "amount": "absolute amounts are equal",
            "date": "accounting collection_date equals the bank transaction_date",
            "tracking": "check number is a suffix match against transaction_number",
        }),
        TransactionType::BankFee | TransactionType::Unknown => json!({
            "amount": "absolute amounts are equal",
            "date": "accounting due_date equals the bank transaction_date",
        }),
    }
}

fn confidence_guidelines() -> Value {
    json!({
        "high": "0.9 or above only when a tracking number or card fragment agrees",
        "medium": "0.6 to 0.9 when customer name or description supports the pick",
        "low": "below 0.6 when only amount and date agree; prefer matched=false",
    })
}

pub struct AiEscalator {
    url: String,
    timeout: Duration,
    min_confidence: f64,
    fee_threshold: f64,
    policy: RetryPolicy,
    transport: Box<dyn WebhookTransport>,
    sleeper: Box<dyn Sleeper>,
    // one round-trip in flight per client
    in_flight: Mutex<()>,
}

impl AiEscalator {
    pub fn from_config(config: &ReconciliationConfig) -> Result<Self> {
        let url = config
            .ai
            .webhook_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| ReconError::Configuration("AI webhook URL is not configured".into()))?;
        Ok(Self::with_transport(
            url,
            config,
            Box::new(ReqwestTransport::new()?),
            Box::new(ThreadSleeper),
        ))
    }

    pub fn with_transport(
        url: String,
        config: &ReconciliationConfig,
        transport: Box<dyn WebhookTransport>,
        sleeper: Box<dyn Sleeper>,
    ) -> Self {
        Self {
            url,
            timeout: config.ai.timeout(),
            min_confidence: config.ai.min_confidence,
            fee_threshold: config.fee_threshold,
            policy: RetryPolicy::from_config(&config.ai),
            transport,
            sleeper,
            in_flight: Mutex::new(()),
        }
    }

    pub fn payload(&self, request: &EscalationRequest) -> Result<Value> {
        let mut body = serde_json::to_value(&request.bank)?;
        let Value::Object(fields) = &mut body else {
            return Err(ReconError::Other("bank transaction did not serialize to an object".into()));
        };
        fields.insert("transaction_type".into(), json!(request.transaction_type.as_str()));
        fields.insert("accounting_candidates".into(), serde_json::to_value(&request.candidates)?);
        fields.insert(
            "matching_rules".into(),
            matching_rules(request.transaction_type, self.fee_threshold),
        );
        fields.insert("confidence_guidelines".into(), confidence_guidelines());
        if let Some(context) = &request.context {
            fields.insert("context".into(), json!(context));
        }
        Ok(body)
    }

    fn attempt(&self, body: &Value) -> std::result::Result<AiMatchResponse, AttemptError> {
        let reply = self.transport.post_json(&self.url, body, self.timeout)?;
        if !(200..300).contains(&reply.status) {
            let detail = match serde_json::from_str::<AiErrorBody>(&reply.body) {
                Ok(err) => match err.detail {
                    Some(detail) => format!("{}: {detail}", err.error),
                    None => err.error,
                },
                Err(_) => reply.body.chars().take(200).collect(),
            };
            return Err(AttemptError::Http(format!("status {}: {detail}", reply.status)));
        }
        serde_json::from_str(&reply.body).map_err(|e| AttemptError::Other(format!("undecodable response: {e}")))
    }

    fn interpret(&self, response: AiMatchResponse) -> Resolution {
        if !response.matched {
            return Resolution::Declined {
                reason: format!("AI found no match: {}", response.reason),
            };
        }
        let Some(accounting_id) = response.matched_accounting_id else {
            return Resolution::Declined {
                reason: "AI reported a match without an accounting id".into(),
            };
        };
        if !(0.0..=1.0).contains(&response.confidence) {
            return Resolution::Declined {
                reason: format!("AI confidence {} is outside 0..1", response.confidence),
            };
        }
        if response.confidence < self.min_confidence {
            return Resolution::Declined {
                reason: format!(
                    "AI confidence {:.2} below minimum {:.2}: {}",
                    response.confidence, self.min_confidence, response.reason
                ),
            };
        }
        Resolution::Chosen {
            accounting_id,
            note: Some(format!("AI confidence {:.2}: {}", response.confidence, response.reason)),
            automated: true,
        }
    }
}

impl Escalator for AiEscalator {
    fn name(&self) -> &'static str {
        "ai"
    }

    fn requires_ai_unprocessed(&self) -> bool {
        true
    }

    fn resolve_ambiguous(&self, request: &EscalationRequest) -> Result<Resolution> {
        let body = self.payload(request)?;
        let _guard = self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        info!(bank_tx = request.bank.id, candidates = request.candidates.len(), "asking AI matcher");
        let response = self
            .policy
            .run(self.sleeper.as_ref(), "ai_match", |_| self.attempt(&body))
            .map_err(|e| ReconError::Transport(format!("AI matcher unavailable: {e}")))?;

        if !response.suggestions.is_empty() {
            info!(bank_tx = request.bank.id, suggestions = response.suggestions.len(), "AI returned suggestions");
        }
        let resolution = self.interpret(response);
        if let Resolution::Declined { reason } = &resolution {
            warn!(bank_tx = request.bank.id, %reason, "AI declined");
        }
        Ok(resolution)
    }
}
