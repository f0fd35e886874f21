use std::path::Path;

use chrono::NaiveDate;
use rusqlite::Connection;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{ReconError, Result};
use crate::ledger::Ledger;
use crate::models::{NewAccountingTransaction, NewBankTransaction, NewPosTransaction, TransactionType};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map Persian and Arabic-Indic digits to ASCII.
pub fn normalize_digits(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '۰'..='۹' => char::from(b'0' + (c as u32 - '۰' as u32) as u8),
            '٠'..='٩' => char::from(b'0' + (c as u32 - '٠' as u32) as u8),
            '٫' => '.',
            '٬' => ',',
            _ => c,
        })
        .collect()
}

/// Rial amount with optional thousands separators; `(x)` and a trailing
/// minus both mean negative.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let s = normalize_digits(raw).replace([',', '"', ' '], "");
    let s = s.trim();
    if let Some(inner) = s.strip_prefix('(').and_then(|v| v.strip_suffix(')')) {
        return inner.parse::<f64>().ok().map(|v| -v);
    }
    if let Some(inner) = s.strip_suffix('-') {
        return inner.parse::<f64>().ok().map(|v| -v);
    }
    s.parse().ok()
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = normalize_digits(raw);
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%Y/%m/%d"))
        .ok()
}

fn compute_checksum(file_path: &Path) -> Result<String> {
    let data = std::fs::read(file_path)?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(hex::encode(hasher.finalize()))
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| normalize_digits(v.trim()))
        .filter(|v| !v.is_empty())
}

fn truthy(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_lowercase()).as_deref(),
        Some("1" | "true" | "yes" | "y")
    )
}

// ---------------------------------------------------------------------------
// Ledger kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerKind {
    Bank,
    Pos,
    Accounting,
}

impl LedgerKind {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Bank => "bank",
            Self::Pos => "pos",
            Self::Accounting => "accounting",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key.trim().to_lowercase().as_str() {
            "bank" => Some(Self::Bank),
            "pos" => Some(Self::Pos),
            "accounting" | "acc" => Some(Self::Accounting),
            _ => None,
        }
    }

    /// Header row an import file for this ledger must carry (order is free,
    /// optional columns may be left out).
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            Self::Bank => &[
                "transaction_date",
                "transaction_time",
                "amount",
                "description",
                "reference_number",
                "extracted_terminal_id",
                "extracted_tracking_number",
                "source_card_number",
                "transaction_type",
            ],
            Self::Pos => &[
                "terminal_number",
                "card_number",
                "transaction_date",
                "transaction_amount",
                "tracking_number",
            ],
            Self::Accounting => &[
                "transaction_type",
                "transaction_number",
                "transaction_amount",
                "due_date",
                "collection_date",
                "customer_name",
                "description",
                "is_new_system",
            ],
        }
    }
}

#[derive(Debug, Deserialize)]
struct BankRow {
    transaction_date: String,
    #[serde(default)]
    transaction_time: Option<String>,
    amount: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    reference_number: Option<String>,
    #[serde(default)]
    extracted_terminal_id: Option<String>,
    #[serde(default)]
    extracted_tracking_number: Option<String>,
    #[serde(default)]
    source_card_number: Option<String>,
    #[serde(default)]
    transaction_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PosRow {
    terminal_number: String,
    #[serde(default)]
    card_number: Option<String>,
    transaction_date: String,
    transaction_amount: String,
    #[serde(default)]
    tracking_number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountingRow {
    transaction_type: String,
    #[serde(default)]
    transaction_number: Option<String>,
    transaction_amount: String,
    due_date: String,
    #[serde(default)]
    collection_date: Option<String>,
    #[serde(default)]
    customer_name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    is_new_system: Option<String>,
}

fn bank_row(bank_id: i64, row: BankRow) -> Option<NewBankTransaction> {
    let transaction_type = row
        .transaction_type
        .as_deref()
        .map(|t| t.parse::<TransactionType>().unwrap_or(TransactionType::Unknown))
        .unwrap_or(TransactionType::Unknown);
    Some(NewBankTransaction {
        bank_id,
        transaction_date: parse_date(&row.transaction_date)?,
        transaction_time: clean(row.transaction_time),
        amount: parse_amount(&row.amount)?,
        description: clean(row.description),
        reference_number: clean(row.reference_number),
        extracted_terminal_id: clean(row.extracted_terminal_id),
        extracted_tracking_number: clean(row.extracted_tracking_number),
        source_card_number: clean(row.source_card_number),
        transaction_type,
    })
}

fn pos_row(bank_id: i64, row: PosRow) -> Option<NewPosTransaction> {
    let terminal_number = normalize_digits(row.terminal_number.trim());
    if terminal_number.is_empty() {
        return None;
    }
    Some(NewPosTransaction {
        bank_id,
        terminal_number,
        card_number: clean(row.card_number),
        transaction_date: parse_date(&row.transaction_date)?,
        transaction_amount: parse_amount(&row.transaction_amount)?.abs(),
        tracking_number: clean(row.tracking_number),
    })
}

fn accounting_row(bank_id: i64, row: AccountingRow) -> Option<NewAccountingTransaction> {
    let transaction_type = row.transaction_type.trim().to_string();
    if transaction_type.is_empty() {
        return None;
    }
    let collection_date = match clean(row.collection_date) {
        Some(raw) => Some(parse_date(&raw)?),
        None => None,
    };
    Some(NewAccountingTransaction {
        bank_id,
        transaction_type,
        transaction_number: clean(row.transaction_number),
        transaction_amount: parse_amount(&row.transaction_amount)?.abs(),
        due_date: parse_date(&row.due_date)?,
        collection_date,
        customer_name: clean(row.customer_name),
        description: clean(row.description),
        is_reconciled: false,
        is_new_system: truthy(row.is_new_system.as_deref()),
    })
}

fn is_duplicate_bank(conn: &Connection, row: &NewBankTransaction) -> Result<bool> {
    let mut stmt = conn.prepare_cached(
        "SELECT 1 FROM bank_transactions WHERE bank_id = ?1 AND transaction_date = ?2 AND amount = ?3 \
         AND description IS ?4 AND reference_number IS ?5 AND transaction_time IS ?6",
    )?;
    Ok(stmt.exists(rusqlite::params![
        row.bank_id,
        row.transaction_date,
        row.amount,
        row.description,
        row.reference_number,
        row.transaction_time
    ])?)
}

fn is_duplicate_pos(conn: &Connection, row: &NewPosTransaction) -> Result<bool> {
    let mut stmt = conn.prepare_cached(
        "SELECT 1 FROM pos_transactions WHERE bank_id = ?1 AND terminal_number = ?2 AND transaction_date = ?3 \
         AND transaction_amount = ?4 AND tracking_number IS ?5 AND card_number IS ?6",
    )?;
    Ok(stmt.exists(rusqlite::params![
        row.bank_id,
        row.terminal_number,
        row.transaction_date,
        row.transaction_amount,
        row.tracking_number,
        row.card_number
    ])?)
}

fn is_duplicate_accounting(conn: &Connection, row: &NewAccountingTransaction) -> Result<bool> {
    let mut stmt = conn.prepare_cached(
        "SELECT 1 FROM accounting_transactions WHERE bank_id = ?1 AND transaction_type = ?2 \
         AND transaction_number IS ?3 AND transaction_amount = ?4 AND due_date = ?5 AND customer_name IS ?6",
    )?;
    Ok(stmt.exists(rusqlite::params![
        row.bank_id,
        row.transaction_type,
        row.transaction_number,
        row.transaction_amount,
        row.due_date,
        row.customer_name
    ])?)
}

// ---------------------------------------------------------------------------
// import_file
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ImportResult {
    pub imported: usize,
    pub skipped: usize,
    pub invalid: usize,
    pub duplicate_file: bool,
}

#[derive(Default)]
struct Tally {
    imported: usize,
    skipped: usize,
    invalid: usize,
}

impl Tally {
    fn take<T>(
        &mut self,
        parsed: std::result::Result<T, csv::Error>,
        line: usize,
        build: impl FnOnce(T) -> Option<bool>,
    ) {
        match parsed.ok().and_then(build) {
            Some(true) => self.imported += 1,
            Some(false) => self.skipped += 1,
            None => {
                debug!(line, "unparseable row");
                self.invalid += 1;
            }
        }
    }
}

/// Load a normalized CSV into one ledger. The whole file goes in inside one
/// transaction; a file already imported for this bank is refused by checksum.
pub fn import_file(ledger: &Ledger, file_path: &Path, kind: LedgerKind, bank_code: &str) -> Result<ImportResult> {
    let bank = ledger.bank_by_code(bank_code)?;
    let conn = ledger.conn();

    let checksum = compute_checksum(file_path)?;
    {
        let mut stmt = conn.prepare("SELECT 1 FROM imports WHERE checksum = ?1 AND bank_id = ?2")?;
        if stmt.exists(rusqlite::params![checksum, bank.id])? {
            info!(file = %file_path.display(), "file already imported");
            return Ok(ImportResult {
                duplicate_file: true,
                ..Default::default()
            });
        }
    }

    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(file_path)?;
    let headers = rdr.headers()?.clone();
    let required = kind.columns().iter().filter(|c| match kind {
        LedgerKind::Bank => matches!(**c, "transaction_date" | "amount"),
        LedgerKind::Pos => matches!(**c, "terminal_number" | "transaction_date" | "transaction_amount"),
        LedgerKind::Accounting => matches!(**c, "transaction_type" | "transaction_amount" | "due_date"),
    });
    for column in required {
        if !headers.iter().any(|h| h == *column) {
            return Err(ReconError::Other(format!(
                "{} is missing the '{column}' column for a {} import",
                file_path.display(),
                kind.key()
            )));
        }
    }

    let tx = conn.unchecked_transaction()?;
    let mut tally = Tally::default();
    let mut storage_error: Option<ReconError> = None;
    let mut insert = |result: Result<bool>| -> Option<bool> {
        match result {
            Ok(inserted) => Some(inserted),
            Err(e) => {
                storage_error.get_or_insert(e);
                Some(false)
            }
        }
    };

    match kind {
        LedgerKind::Bank => {
            for (line, parsed) in rdr.deserialize::<BankRow>().enumerate() {
                tally.take(parsed, line + 2, |row| {
                    let row = bank_row(bank.id, row)?;
                    insert(is_duplicate_bank(conn, &row).and_then(|dup| {
                        if dup {
                            return Ok(false);
                        }
                        ledger.insert_bank(&row).map(|_| true)
                    }))
                });
            }
        }
        LedgerKind::Pos => {
            for (line, parsed) in rdr.deserialize::<PosRow>().enumerate() {
                tally.take(parsed, line + 2, |row| {
                    let row = pos_row(bank.id, row)?;
                    insert(is_duplicate_pos(conn, &row).and_then(|dup| {
                        if dup {
                            return Ok(false);
                        }
                        ledger.insert_pos(&row).map(|_| true)
                    }))
                });
            }
        }
        LedgerKind::Accounting => {
            for (line, parsed) in rdr.deserialize::<AccountingRow>().enumerate() {
                tally.take(parsed, line + 2, |row| {
                    let row = accounting_row(bank.id, row)?;
                    insert(is_duplicate_accounting(conn, &row).and_then(|dup| {
                        if dup {
                            return Ok(false);
                        }
                        ledger.insert_accounting(&row).map(|_| true)
                    }))
                });
            }
        }
    }

    if let Some(e) = storage_error {
        // dropping `tx` rolls the partial file back
        return Err(e);
    }

    tx.execute(
        "INSERT INTO imports (filename, ledger, bank_id, record_count, checksum) VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            file_path.file_name().and_then(|n| n.to_str()).unwrap_or(""),
            kind.key(),
            bank.id,
            tally.imported as i64,
            checksum,
        ],
    )?;
    tx.commit()?;

    if tally.invalid > 0 {
        warn!(file = %file_path.display(), invalid = tally.invalid, "rows could not be parsed");
    }
    info!(
        file = %file_path.display(),
        ledger = kind.key(),
        bank = %bank.code,
        imported = tally.imported,
        skipped = tally.skipped,
        "import finished"
    );
    Ok(ImportResult {
        imported: tally.imported,
        skipped: tally.skipped,
        invalid: tally.invalid,
        duplicate_file: false,
    })
}
