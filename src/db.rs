use std::path::Path;

use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS banks (
    id INTEGER PRIMARY KEY,
    code TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    pos_mode TEXT NOT NULL DEFAULT 'simple'
);

CREATE TABLE IF NOT EXISTS terminals (
    id INTEGER PRIMARY KEY,
    terminal_number TEXT NOT NULL UNIQUE,
    bank_id INTEGER NOT NULL,
    FOREIGN KEY (bank_id) REFERENCES banks(id)
);

CREATE TABLE IF NOT EXISTS imports (
    id INTEGER PRIMARY KEY,
    filename TEXT NOT NULL,
    ledger TEXT NOT NULL,
    bank_id INTEGER NOT NULL,
    import_date TEXT DEFAULT (datetime('now')),
    record_count INTEGER,
    checksum TEXT,
    FOREIGN KEY (bank_id) REFERENCES banks(id)
);

CREATE TABLE IF NOT EXISTS bank_transactions (
    id INTEGER PRIMARY KEY,
    bank_id INTEGER NOT NULL,
    transaction_date TEXT NOT NULL,
    transaction_time TEXT,
    amount REAL NOT NULL,
    description TEXT,
    reference_number TEXT,
    extracted_terminal_id TEXT,
    extracted_tracking_number TEXT,
    source_card_number TEXT,
    transaction_type TEXT NOT NULL DEFAULT 'Unknown',
    is_reconciled INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (bank_id) REFERENCES banks(id)
);

CREATE TABLE IF NOT EXISTS pos_transactions (
    id INTEGER PRIMARY KEY,
    bank_id INTEGER NOT NULL,
    terminal_number TEXT NOT NULL,
    terminal_id INTEGER,
    card_number TEXT,
    transaction_date TEXT NOT NULL,
    transaction_amount REAL NOT NULL,
    tracking_number TEXT,
    is_reconciled INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (bank_id) REFERENCES banks(id),
    FOREIGN KEY (terminal_id) REFERENCES terminals(id)
);

CREATE TABLE IF NOT EXISTS accounting_transactions (
    id INTEGER PRIMARY KEY,
    bank_id INTEGER NOT NULL,
    transaction_type TEXT NOT NULL,
    transaction_number TEXT,
    transaction_amount REAL NOT NULL,
    due_date TEXT NOT NULL,
    collection_date TEXT,
    customer_name TEXT,
    description TEXT,
    is_reconciled INTEGER NOT NULL DEFAULT 0,
    is_new_system INTEGER NOT NULL DEFAULT 0,
    ai_processed INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (bank_id) REFERENCES banks(id)
);

-- Audit log: references are plain ids, not foreign keys.
CREATE TABLE IF NOT EXISTS reconciliation_results (
    id INTEGER PRIMARY KEY,
    pos_id INTEGER,
    acc_id INTEGER,
    bank_record_id INTEGER,
    description TEXT NOT NULL,
    type_matched TEXT NOT NULL,
    timestamp TEXT NOT NULL DEFAULT (datetime('now')),
    CHECK (pos_id IS NOT NULL OR acc_id IS NOT NULL OR bank_record_id IS NOT NULL)
);

CREATE INDEX IF NOT EXISTS idx_bank_unreconciled ON bank_transactions (bank_id, is_reconciled);
CREATE INDEX IF NOT EXISTS idx_acc_due ON accounting_transactions (bank_id, due_date, is_reconciled);
CREATE INDEX IF NOT EXISTS idx_acc_collection ON accounting_transactions (bank_id, collection_date, is_reconciled);
CREATE INDEX IF NOT EXISTS idx_pos_terminal ON pos_transactions (terminal_number, transaction_date);
";

// (code, name, pos_mode)
const DEFAULT_BANKS: &[(&str, &str, &str)] = &[
    ("mellat", "Bank Mellat", "terminal_routed"),
    ("keshavarzi", "Bank Keshavarzi", "simple"),
    ("saderat", "Bank Saderat Iran", "simple"),
    ("sepah", "Bank Sepah", "terminal_routed"),
];

pub fn get_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;

    let count: i64 = conn.query_row("SELECT count(*) FROM banks", [], |row| row.get(0))?;
    if count == 0 {
        for (code, name, pos_mode) in DEFAULT_BANKS {
            conn.execute(
                "INSERT INTO banks (code, name, pos_mode) VALUES (?1, ?2, ?3)",
                rusqlite::params![code, name, pos_mode],
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_db() -> (tempfile::TempDir, Connection) {
    let dir = tempfile::tempdir().unwrap();
    let conn = get_connection(&dir.path().join("test.db")).unwrap();
    init_db(&conn).unwrap();
    (dir, conn)
}
