use chrono::NaiveDate;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row};

use crate::error::{ReconError, Result};
use crate::models::{
    AccountingTransaction, Bank, BankTransaction, NewAccountingTransaction, NewBankTransaction,
    NewPosTransaction, PosMode, PosTransaction, ReconciliationResult, Terminal, TransactionType,
};

// ---------------------------------------------------------------------------
// Query shapes
// ---------------------------------------------------------------------------

/// Which accounting date a candidate search compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateField {
    DueDate,
    CollectionDate,
}

impl DateField {
    fn column(&self) -> &'static str {
        match self {
            Self::DueDate => "due_date",
            Self::CollectionDate => "collection_date",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmountCompare {
    Exact,
    /// Normalize sign on both sides before comparing.
    Absolute,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AmountFilter {
    Equal(f64, AmountCompare),
    /// Strictly below the absolute value of the given amount.
    Below(f64),
    /// Within `± tolerance` of the absolute amount (user-facing search only).
    Within { amount: f64, tolerance: f64 },
}

#[derive(Debug, Clone)]
pub struct CandidateQuery {
    pub bank_id: i64,
    pub date_field: DateField,
    pub date: Option<NaiveDate>,
    pub amount: AmountFilter,
    /// Empty means any type.
    pub types: Vec<String>,
    pub require_ai_unprocessed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PosLookup<'a> {
    TerminalNumber(&'a str),
    TerminalId(i64),
}

/// One atomic write: flag flips, optional fee row and settlement sweep, and
/// the audit row that explains them.
#[derive(Debug, Clone, Default)]
pub struct LedgerCommit {
    pub bank_record_id: Option<i64>,
    pub acc_id: Option<i64>,
    pub pos_id: Option<i64>,
    pub reconciled: bool,
    pub description: String,
    pub type_matched: String,
    pub fee: Option<NewAccountingTransaction>,
    pub terminal_settlement: Option<(i64, NaiveDate)>,
    /// Candidates the AI matcher gave a verdict on; never offered to it again.
    pub ai_reviewed: Vec<i64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CommitReceipt {
    pub result_id: i64,
    pub fee_id: Option<i64>,
    pub settled_pos: usize,
}

#[derive(Debug, Clone, Default)]
pub struct LedgerCounts {
    pub bank_open: i64,
    pub bank_unknown: i64,
    pub pos_open: i64,
    pub accounting_open: i64,
    pub results: i64,
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const BANK_COLUMNS: &str = "id, bank_id, transaction_date, transaction_time, amount, description, \
     reference_number, extracted_terminal_id, extracted_tracking_number, source_card_number, \
     transaction_type, is_reconciled";

const POS_COLUMNS: &str = "id, bank_id, terminal_number, terminal_id, card_number, transaction_date, \
     transaction_amount, tracking_number, is_reconciled";

const ACC_COLUMNS: &str = "id, bank_id, transaction_type, transaction_number, transaction_amount, \
     due_date, collection_date, customer_name, description, is_reconciled, is_new_system, ai_processed";

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(ReconError::Other(msg)),
    )
}

fn bank_txn_from_row(row: &Row) -> rusqlite::Result<BankTransaction> {
    let raw_type: String = row.get(10)?;
    let transaction_type = raw_type
        .parse::<TransactionType>()
        .map_err(|e| conversion_error(10, e.to_string()))?;
    Ok(BankTransaction {
        id: row.get(0)?,
        bank_id: row.get(1)?,
        transaction_date: row.get(2)?,
        transaction_time: row.get(3)?,
        amount: row.get(4)?,
        description: row.get(5)?,
        reference_number: row.get(6)?,
        extracted_terminal_id: row.get(7)?,
        extracted_tracking_number: row.get(8)?,
        source_card_number: row.get(9)?,
        transaction_type,
        is_reconciled: row.get(11)?,
    })
}

fn pos_txn_from_row(row: &Row) -> rusqlite::Result<PosTransaction> {
    Ok(PosTransaction {
        id: row.get(0)?,
        bank_id: row.get(1)?,
        terminal_number: row.get(2)?,
        terminal_id: row.get(3)?,
        card_number: row.get(4)?,
        transaction_date: row.get(5)?,
        transaction_amount: row.get(6)?,
        tracking_number: row.get(7)?,
        is_reconciled: row.get(8)?,
    })
}

fn acc_txn_from_row(row: &Row) -> rusqlite::Result<AccountingTransaction> {
    Ok(AccountingTransaction {
        id: row.get(0)?,
        bank_id: row.get(1)?,
        transaction_type: row.get(2)?,
        transaction_number: row.get(3)?,
        transaction_amount: row.get(4)?,
        due_date: row.get(5)?,
        collection_date: row.get(6)?,
        customer_name: row.get(7)?,
        description: row.get(8)?,
        is_reconciled: row.get(9)?,
        is_new_system: row.get(10)?,
        ai_processed: row.get(11)?,
    })
}

fn bank_from_row(row: &Row) -> rusqlite::Result<Bank> {
    let raw_mode: String = row.get(3)?;
    let pos_mode = PosMode::from_key(&raw_mode)
        .ok_or_else(|| conversion_error(3, format!("unknown pos_mode {raw_mode}")))?;
    Ok(Bank {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        pos_mode,
    })
}

fn insert_accounting_row(conn: &Connection, txn: &NewAccountingTransaction) -> Result<i64> {
    conn.execute(
        "INSERT INTO accounting_transactions (bank_id, transaction_type, transaction_number, \
         transaction_amount, due_date, collection_date, customer_name, description, is_reconciled, is_new_system) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            txn.bank_id,
            txn.transaction_type,
            txn.transaction_number,
            txn.transaction_amount,
            txn.due_date,
            txn.collection_date,
            txn.customer_name,
            txn.description,
            txn.is_reconciled,
            txn.is_new_system,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn set_flag(conn: &Connection, table: &'static str, kind: &'static str, id: i64, reconciled: bool) -> Result<()> {
    let changed = conn.execute(
        &format!("UPDATE {table} SET is_reconciled = ?1 WHERE id = ?2"),
        rusqlite::params![reconciled, id],
    )?;
    if changed == 0 {
        return Err(ReconError::NotFound { kind, id });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Typed access to the three ledgers and the result log.
pub struct Ledger {
    conn: Connection,
}

impl Ledger {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // -- banks & terminals --------------------------------------------------

    pub fn banks(&self) -> Result<Vec<Bank>> {
        let mut stmt = self.conn.prepare("SELECT id, code, name, pos_mode FROM banks ORDER BY id")?;
        let rows = stmt
            .query_map([], bank_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn bank(&self, bank_id: i64) -> Result<Bank> {
        self.conn
            .query_row(
                "SELECT id, code, name, pos_mode FROM banks WHERE id = ?1",
                [bank_id],
                bank_from_row,
            )
            .optional()?
            .ok_or(ReconError::NotFound { kind: "Bank", id: bank_id })
    }

    pub fn bank_by_code(&self, code: &str) -> Result<Bank> {
        self.conn
            .query_row(
                "SELECT id, code, name, pos_mode FROM banks WHERE code = ?1",
                [code.to_lowercase()],
                bank_from_row,
            )
            .optional()?
            .ok_or_else(|| ReconError::UnknownBank(code.to_string()))
    }

    pub fn register_terminal(&self, terminal_number: &str, bank_id: i64) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO terminals (terminal_number, bank_id) VALUES (?1, ?2) \
             ON CONFLICT(terminal_number) DO UPDATE SET bank_id = excluded.bank_id",
            rusqlite::params![terminal_number.trim(), bank_id],
        )?;
        let id = self.conn.query_row(
            "SELECT id FROM terminals WHERE terminal_number = ?1",
            [terminal_number.trim()],
            |r| r.get(0),
        )?;
        self.conn.execute(
            "UPDATE pos_transactions SET terminal_id = ?1 WHERE terminal_number = ?2 AND terminal_id IS NULL",
            rusqlite::params![id, terminal_number.trim()],
        )?;
        Ok(id)
    }

    pub fn terminals(&self, bank_id: Option<i64>) -> Result<Vec<Terminal>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, terminal_number, bank_id FROM terminals \
             WHERE ?1 IS NULL OR bank_id = ?1 ORDER BY terminal_number",
        )?;
        let rows = stmt
            .query_map([bank_id], |row| {
                Ok(Terminal {
                    id: row.get(0)?,
                    terminal_number: row.get(1)?,
                    bank_id: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn resolve_terminal_id(&self, terminal_number: &str) -> Result<Option<i64>> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM terminals WHERE terminal_number = ?1",
                [terminal_number.trim()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(id)
    }

    // -- reads --------------------------------------------------------------

    pub fn find_unreconciled_bank_transactions(&self, bank_id: i64) -> Result<Vec<BankTransaction>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {BANK_COLUMNS} FROM bank_transactions \
             WHERE bank_id = ?1 AND is_reconciled = 0 ORDER BY transaction_date, id"
        ))?;
        let rows = stmt
            .query_map([bank_id], bank_txn_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn bank_transaction(&self, id: i64) -> Result<Option<BankTransaction>> {
        let txn = self
            .conn
            .query_row(
                &format!("SELECT {BANK_COLUMNS} FROM bank_transactions WHERE id = ?1"),
                [id],
                bank_txn_from_row,
            )
            .optional()?;
        Ok(txn)
    }

    /// Fresh read of one accounting row, bypassing anything cached by callers.
    pub fn accounting_transaction(&self, id: i64) -> Result<Option<AccountingTransaction>> {
        let txn = self
            .conn
            .query_row(
                &format!("SELECT {ACC_COLUMNS} FROM accounting_transactions WHERE id = ?1"),
                [id],
                acc_txn_from_row,
            )
            .optional()?;
        Ok(txn)
    }

    pub fn find_accounting_candidates(&self, query: &CandidateQuery) -> Result<Vec<AccountingTransaction>> {
        let mut sql = format!(
            "SELECT {ACC_COLUMNS} FROM accounting_transactions WHERE bank_id = ? AND is_reconciled = 0"
        );
        let mut params: Vec<Value> = vec![Value::Integer(query.bank_id)];

        if let Some(date) = query.date {
            sql.push_str(&format!(" AND {} = ?", query.date_field.column()));
            params.push(Value::Text(date.format("%Y-%m-%d").to_string()));
        }

        match query.amount {
            AmountFilter::Equal(amount, AmountCompare::Exact) => {
                sql.push_str(" AND transaction_amount = ?");
                params.push(Value::Real(amount));
            }
            AmountFilter::Equal(amount, AmountCompare::Absolute) => {
                sql.push_str(" AND ABS(transaction_amount) = ?");
                params.push(Value::Real(amount.abs()));
            }
            AmountFilter::Below(amount) => {
                sql.push_str(" AND ABS(transaction_amount) < ?");
                params.push(Value::Real(amount.abs()));
            }
            AmountFilter::Within { amount, tolerance } => {
                sql.push_str(" AND ABS(transaction_amount) BETWEEN ? AND ?");
                params.push(Value::Real(amount.abs() - tolerance));
                params.push(Value::Real(amount.abs() + tolerance));
            }
        }

        if !query.types.is_empty() {
            let placeholders = vec!["?"; query.types.len()].join(", ");
            sql.push_str(&format!(" AND transaction_type IN ({placeholders})"));
            params.extend(query.types.iter().cloned().map(Value::Text));
        }

        if query.require_ai_unprocessed {
            sql.push_str(" AND ai_processed = 0");
        }
        sql.push_str(" ORDER BY id");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params), acc_txn_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn find_pos_transactions(
        &self,
        lookup: PosLookup<'_>,
        date: NaiveDate,
        unreconciled_only: bool,
    ) -> Result<Vec<PosTransaction>> {
        let (column, key) = match lookup {
            PosLookup::TerminalNumber(number) => ("terminal_number", Value::Text(number.trim().to_string())),
            PosLookup::TerminalId(id) => ("terminal_id", Value::Integer(id)),
        };
        let mut sql = format!(
            "SELECT {POS_COLUMNS} FROM pos_transactions WHERE {column} = ?1 AND transaction_date = ?2"
        );
        if unreconciled_only {
            sql.push_str(" AND is_reconciled = 0");
        }
        sql.push_str(" ORDER BY id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params![key, date], pos_txn_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_results(&self, bank_id: Option<i64>, limit: usize) -> Result<Vec<ReconciliationResult>> {
        let mut stmt = self.conn.prepare(
            "SELECT r.id, r.pos_id, r.acc_id, r.bank_record_id, r.description, r.type_matched, r.timestamp \
             FROM reconciliation_results r \
             LEFT JOIN bank_transactions b ON b.id = r.bank_record_id \
             LEFT JOIN accounting_transactions a ON a.id = r.acc_id \
             LEFT JOIN pos_transactions p ON p.id = r.pos_id \
             WHERE ?1 IS NULL OR COALESCE(b.bank_id, a.bank_id, p.bank_id) = ?1 \
             ORDER BY r.id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![bank_id, limit as i64], |row| {
                Ok(ReconciliationResult {
                    id: row.get(0)?,
                    pos_id: row.get(1)?,
                    acc_id: row.get(2)?,
                    bank_record_id: row.get(3)?,
                    description: row.get(4)?,
                    type_matched: row.get(5)?,
                    timestamp: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn counts(&self, bank_id: i64) -> Result<LedgerCounts> {
        let count = |sql: &str| -> Result<i64> {
            Ok(self.conn.query_row(sql, [bank_id], |r| r.get(0))?)
        };
        Ok(LedgerCounts {
            bank_open: count("SELECT count(*) FROM bank_transactions WHERE bank_id = ?1 AND is_reconciled = 0")?,
            bank_unknown: count(
                "SELECT count(*) FROM bank_transactions WHERE bank_id = ?1 AND is_reconciled = 0 AND transaction_type = 'Unknown'",
            )?,
            pos_open: count("SELECT count(*) FROM pos_transactions WHERE bank_id = ?1 AND is_reconciled = 0")?,
            accounting_open: count(
                "SELECT count(*) FROM accounting_transactions WHERE bank_id = ?1 AND is_reconciled = 0",
            )?,
            results: count(
                "SELECT count(*) FROM reconciliation_results r \
                 LEFT JOIN bank_transactions b ON b.id = r.bank_record_id \
                 LEFT JOIN accounting_transactions a ON a.id = r.acc_id \
                 LEFT JOIN pos_transactions p ON p.id = r.pos_id \
                 WHERE COALESCE(b.bank_id, a.bank_id, p.bank_id) = ?1",
            )?,
        })
    }

    // -- writes -------------------------------------------------------------

    pub fn set_bank_reconciled(&self, id: i64, reconciled: bool) -> Result<()> {
        set_flag(&self.conn, "bank_transactions", "Bank transaction", id, reconciled)
    }

    pub fn set_accounting_reconciled(&self, id: i64, reconciled: bool) -> Result<()> {
        set_flag(&self.conn, "accounting_transactions", "Accounting transaction", id, reconciled)
    }

    pub fn set_pos_reconciled(&self, id: i64, reconciled: bool) -> Result<()> {
        set_flag(&self.conn, "pos_transactions", "POS transaction", id, reconciled)
    }

    pub fn set_bank_transaction_type(&self, id: i64, transaction_type: TransactionType) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE bank_transactions SET transaction_type = ?1 WHERE id = ?2",
            rusqlite::params![transaction_type.as_str(), id],
        )?;
        if changed == 0 {
            return Err(ReconError::NotFound { kind: "Bank transaction", id });
        }
        Ok(())
    }

    pub fn append_result(
        &self,
        pos_id: Option<i64>,
        acc_id: Option<i64>,
        bank_record_id: Option<i64>,
        description: &str,
        type_matched: &str,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO reconciliation_results (pos_id, acc_id, bank_record_id, description, type_matched) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![pos_id, acc_id, bank_record_id, description, type_matched],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn insert_accounting(&self, txn: &NewAccountingTransaction) -> Result<i64> {
        insert_accounting_row(&self.conn, txn)
    }

    pub fn insert_bank(&self, txn: &NewBankTransaction) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO bank_transactions (bank_id, transaction_date, transaction_time, amount, description, \
             reference_number, extracted_terminal_id, extracted_tracking_number, source_card_number, transaction_type) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                txn.bank_id,
                txn.transaction_date,
                txn.transaction_time,
                txn.amount,
                txn.description,
                txn.reference_number,
                txn.extracted_terminal_id,
                txn.extracted_tracking_number,
                txn.source_card_number,
                txn.transaction_type.as_str(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn insert_pos(&self, txn: &NewPosTransaction) -> Result<i64> {
        let terminal_id = self.resolve_terminal_id(&txn.terminal_number)?;
        self.conn.execute(
            "INSERT INTO pos_transactions (bank_id, terminal_number, terminal_id, card_number, transaction_date, \
             transaction_amount, tracking_number) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                txn.bank_id,
                txn.terminal_number.trim(),
                terminal_id,
                txn.card_number,
                txn.transaction_date,
                txn.transaction_amount,
                txn.tracking_number,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Apply every part of `commit` inside one SQLite transaction. A missing
    /// participant row rolls the whole thing back.
    pub fn apply_commit(&self, commit: &LedgerCommit) -> Result<CommitReceipt> {
        let tx = self.conn.unchecked_transaction()?;
        let receipt = apply_in(&tx, commit)?;
        tx.commit()?;
        Ok(receipt)
    }

    /// Like [`Ledger::apply_commit`] for several result rows at once: either
    /// all of them land or none do.
    pub fn apply_batch(&self, commits: &[LedgerCommit]) -> Result<Vec<CommitReceipt>> {
        let tx = self.conn.unchecked_transaction()?;
        let receipts = commits
            .iter()
            .map(|commit| apply_in(&tx, commit))
            .collect::<Result<Vec<_>>>()?;
        tx.commit()?;
        Ok(receipts)
    }
}

fn apply_in(tx: &rusqlite::Transaction<'_>, commit: &LedgerCommit) -> Result<CommitReceipt> {
    if let Some(id) = commit.bank_record_id {
        set_flag(tx, "bank_transactions", "Bank transaction", id, commit.reconciled)?;
    }
    if let Some(id) = commit.acc_id {
        set_flag(tx, "accounting_transactions", "Accounting transaction", id, commit.reconciled)?;
    }
    if let Some(id) = commit.pos_id {
        set_flag(tx, "pos_transactions", "POS transaction", id, commit.reconciled)?;
    }

    for id in &commit.ai_reviewed {
        tx.execute("UPDATE accounting_transactions SET ai_processed = 1 WHERE id = ?1", [id])?;
    }

    let fee_id = match &commit.fee {
        Some(fee) => Some(insert_accounting_row(tx, fee)?),
        None => None,
    };

    let settled_pos = match commit.terminal_settlement {
        Some((terminal_id, date)) => tx.execute(
            "UPDATE pos_transactions SET is_reconciled = ?1 WHERE terminal_id = ?2 AND transaction_date = ?3",
            rusqlite::params![commit.reconciled, terminal_id, date],
        )?,
        None => 0,
    };

    tx.execute(
        "INSERT INTO reconciliation_results (pos_id, acc_id, bank_record_id, description, type_matched) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            commit.pos_id,
            commit.acc_id,
            commit.bank_record_id,
            commit.description,
            commit.type_matched
        ],
    )?;
    let result_id = tx.last_insert_rowid();

    Ok(CommitReceipt {
        result_id,
        fee_id,
        settled_pos,
    })
}
