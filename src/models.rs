use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::ReconError;

/// Category of a bank ledger line. Accounting rows use the string labels
/// returned by [`TransactionType::accounting_label`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransactionType {
    ReceivedTransfer,
    PaidTransfer,
    ReceivedPos,
    ReceivedCheck,
    PaidCheck,
    BankFee,
    Unknown,
}

impl TransactionType {
    /// Order in which the orchestrator works through partitions.
    pub const MATCHABLE: [TransactionType; 6] = [
        Self::ReceivedTransfer,
        Self::PaidTransfer,
        Self::ReceivedPos,
        Self::ReceivedCheck,
        Self::PaidCheck,
        Self::BankFee,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReceivedTransfer => "ReceivedTransfer",
            Self::PaidTransfer => "PaidTransfer",
            Self::ReceivedPos => "ReceivedPos",
            Self::ReceivedCheck => "ReceivedCheck",
            Self::PaidCheck => "PaidCheck",
            Self::BankFee => "BankFee",
            Self::Unknown => "Unknown",
        }
    }

    /// Label this category carries in the accounting ledger.
    pub fn accounting_label(&self) -> Option<&'static str> {
        match self {
            Self::ReceivedTransfer => Some(accounting_types::RECEIVED_TRANSFER),
            Self::PaidTransfer => Some(accounting_types::PAID_TRANSFER),
            Self::ReceivedPos => Some(accounting_types::POS),
            Self::ReceivedCheck => Some(accounting_types::RECEIVED_CHECK),
            Self::PaidCheck => Some(accounting_types::PAID_CHECK),
            Self::BankFee => Some(accounting_types::FEE),
            Self::Unknown => None,
        }
    }

    pub fn is_check(&self) -> bool {
        matches!(self, Self::ReceivedCheck | Self::PaidCheck)
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = ReconError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "receivedtransfer" => Ok(Self::ReceivedTransfer),
            "paidtransfer" => Ok(Self::PaidTransfer),
            "receivedpos" | "pos" | "shaparak" => Ok(Self::ReceivedPos),
            "receivedcheck" => Ok(Self::ReceivedCheck),
            "paidcheck" => Ok(Self::PaidCheck),
            "bankfee" | "fee" => Ok(Self::BankFee),
            "unknown" | "" => Ok(Self::Unknown),
            _ => Err(ReconError::Other(format!("Unknown transaction type: {s}"))),
        }
    }
}

/// Type labels stored in `accounting_transactions.transaction_type`.
pub mod accounting_types {
    pub const RECEIVED_TRANSFER: &str = "Received Transfer";
    pub const PAID_TRANSFER: &str = "Paid Transfer";
    pub const POS: &str = "Pos";
    pub const RECEIVED_CHECK: &str = "Received Check";
    pub const PAID_CHECK: &str = "Paid Check";
    pub const FEE: &str = "Fee";
    pub const POS_RECEIVED_TRANSFER: &str = "Pos / Received Transfer";
    pub const POS_PAID_TRANSFER: &str = "Pos / Paid Transfer";
}

/// How a bank reports its Shaparak settlements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PosMode {
    /// Settlement lines are matched straight against accounting POS entries.
    Simple,
    /// Settlement lines carry a terminal number that routes the match.
    TerminalRouted,
}

impl PosMode {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::TerminalRouted => "terminal_routed",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "simple" => Some(Self::Simple),
            "terminal_routed" => Some(Self::TerminalRouted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Bank {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub pos_mode: PosMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct Terminal {
    pub id: i64,
    pub terminal_number: String,
    pub bank_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BankTransaction {
    pub id: i64,
    pub bank_id: i64,
    pub transaction_date: NaiveDate,
    pub transaction_time: Option<String>,
    /// Signed: credits positive, debits negative.
    pub amount: f64,
    pub description: Option<String>,
    pub reference_number: Option<String>,
    pub extracted_terminal_id: Option<String>,
    pub extracted_tracking_number: Option<String>,
    pub source_card_number: Option<String>,
    pub transaction_type: TransactionType,
    pub is_reconciled: bool,
}

impl BankTransaction {
    /// Best tracking reference the bank gave us for this line.
    pub fn tracking_reference(&self) -> Option<&str> {
        [
            self.extracted_tracking_number.as_deref(),
            self.reference_number.as_deref(),
        ]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PosTransaction {
    pub id: i64,
    pub bank_id: i64,
    pub terminal_number: String,
    pub terminal_id: Option<i64>,
    pub card_number: Option<String>,
    pub transaction_date: NaiveDate,
    pub transaction_amount: f64,
    pub tracking_number: Option<String>,
    pub is_reconciled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountingTransaction {
    pub id: i64,
    pub bank_id: i64,
    pub transaction_type: String,
    pub transaction_number: Option<String>,
    pub transaction_amount: f64,
    pub due_date: NaiveDate,
    pub collection_date: Option<NaiveDate>,
    pub customer_name: Option<String>,
    pub description: Option<String>,
    pub is_reconciled: bool,
    pub is_new_system: bool,
    pub ai_processed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationResult {
    pub id: i64,
    pub pos_id: Option<i64>,
    pub acc_id: Option<i64>,
    pub bank_record_id: Option<i64>,
    pub description: String,
    pub type_matched: String,
    pub timestamp: NaiveDateTime,
}

/// Insert shape for an accounting row; ids are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewAccountingTransaction {
    pub bank_id: i64,
    pub transaction_type: String,
    pub transaction_number: Option<String>,
    pub transaction_amount: f64,
    pub due_date: NaiveDate,
    pub collection_date: Option<NaiveDate>,
    pub customer_name: Option<String>,
    pub description: Option<String>,
    pub is_reconciled: bool,
    pub is_new_system: bool,
}

#[derive(Debug, Clone)]
pub struct NewBankTransaction {
    pub bank_id: i64,
    pub transaction_date: NaiveDate,
    pub transaction_time: Option<String>,
    pub amount: f64,
    pub description: Option<String>,
    pub reference_number: Option<String>,
    pub extracted_terminal_id: Option<String>,
    pub extracted_tracking_number: Option<String>,
    pub source_card_number: Option<String>,
    pub transaction_type: TransactionType,
}

#[derive(Debug, Clone)]
pub struct NewPosTransaction {
    pub bank_id: i64,
    pub terminal_number: String,
    pub card_number: Option<String>,
    pub transaction_date: NaiveDate,
    pub transaction_amount: f64,
    pub tracking_number: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_type_parses_loose_spellings() {
        assert_eq!("Received Transfer".parse::<TransactionType>().unwrap(), TransactionType::ReceivedTransfer);
        assert_eq!("paid_check".parse::<TransactionType>().unwrap(), TransactionType::PaidCheck);
        assert_eq!("Shaparak".parse::<TransactionType>().unwrap(), TransactionType::ReceivedPos);
        assert!("Wire".parse::<TransactionType>().is_err());
    }

    #[test]
    fn test_unknown_has_no_accounting_label() {
        assert_eq!(TransactionType::Unknown.accounting_label(), None);
        assert_eq!(TransactionType::ReceivedPos.accounting_label(), Some("Pos"));
    }

    #[test]
    fn test_tracking_reference_skips_blank_values() {
        let txn = BankTransaction {
            id: 1,
            bank_id: 1,
            transaction_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            transaction_time: None,
            amount: 10.0,
            description: None,
            reference_number: Some("REF".into()),
            extracted_tracking_number: Some("  ".into()),
            extracted_terminal_id: None,
            source_card_number: None,
            transaction_type: TransactionType::ReceivedTransfer,
            is_reconciled: false,
        };
        assert_eq!(txn.tracking_reference(), Some("REF"));
        let txn = BankTransaction { extracted_tracking_number: Some("998877".into()), ..txn };
        assert_eq!(txn.tracking_reference(), Some("998877"));
    }
}
