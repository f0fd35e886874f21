pub mod banks;
pub mod classify;
pub mod import;
pub mod init;
pub mod link;
pub mod results;
pub mod run;
pub mod search;
pub mod status;

use clap::{Parser, Subcommand};
use colored::{ColoredString, Colorize};

use crate::db::get_connection;
use crate::error::{ReconError, Result};
use crate::ledger::Ledger;
use crate::settings::{load_settings, Settings};
use crate::strategies::OutcomeKind;

/// Open the configured database, refusing to create one implicitly.
pub(crate) fn open_ledger() -> Result<(Settings, Ledger)> {
    let settings = load_settings();
    let db_path = settings.db_path();
    if !db_path.exists() {
        return Err(ReconError::Settings(format!(
            "database not found at {}; run `tatbigh init` first",
            db_path.display()
        )));
    }
    let conn = get_connection(&db_path)?;
    Ok((settings, Ledger::new(conn)))
}

pub(crate) fn outcome_label(kind: OutcomeKind) -> ColoredString {
    match kind {
        OutcomeKind::AutoMatched => kind.label().green(),
        OutcomeKind::Resolved => kind.label().cyan(),
        OutcomeKind::NeedsReview => kind.label().yellow(),
        OutcomeKind::NoMatch => kind.label().normal(),
        OutcomeKind::Error => kind.label().red(),
    }
}

#[derive(Parser)]
#[command(name = "tatbigh", about = "Three-way bank, POS and accounting reconciliation.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Choose a data directory and initialize the database.
    Init {
        /// Path for tatbigh data (default: ~/Documents/tatbigh)
        #[arg(long = "data-dir")]
        data_dir: Option<String>,
    },
    /// Import a normalized CSV into one of the three ledgers.
    Import {
        /// Ledger to load: bank, pos or accounting
        ledger: String,
        /// Path to the CSV file
        file: String,
        /// Bank code, e.g. mellat
        #[arg(long)]
        bank: String,
    },
    /// Set the type of a bank transaction so it can be reconciled.
    Classify {
        /// Bank transaction id
        bank_tx: i64,
        /// ReceivedTransfer, PaidTransfer, ReceivedPos, ReceivedCheck, PaidCheck or BankFee
        transaction_type: String,
    },
    /// Reconcile all open bank transactions of a bank.
    Run {
        /// Bank code
        #[arg(long)]
        bank: String,
        /// Override the configured escalation: none, manual or ai
        #[arg(long)]
        escalation: Option<String>,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Find open accounting entries near an amount.
    Search {
        #[arg(long)]
        bank: String,
        #[arg(long)]
        amount: f64,
        /// Due date: YYYY-MM-DD
        #[arg(long)]
        date: Option<String>,
    },
    /// Record a match chosen by hand.
    Match {
        bank_tx: i64,
        acc: i64,
        /// POS transaction taking part in the match
        #[arg(long)]
        pos: Option<i64>,
        #[arg(long)]
        note: Option<String>,
    },
    /// Reopen a bank transaction and the rows it was matched with.
    Unmatch {
        bank_tx: i64,
        #[arg(long)]
        acc: Option<i64>,
        #[arg(long)]
        pos: Option<i64>,
        #[arg(long)]
        note: Option<String>,
    },
    /// Show the reconciliation log.
    Results {
        #[arg(long)]
        bank: Option<String>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Show open counts per ledger and bank.
    Status,
    /// List supported banks.
    Banks,
    /// Manage POS terminals.
    Terminals {
        #[command(subcommand)]
        command: TerminalsCommands,
    },
}

#[derive(Subcommand)]
pub enum TerminalsCommands {
    /// Register a terminal number with a bank.
    Add {
        terminal_number: String,
        #[arg(long)]
        bank: String,
    },
    /// List registered terminals.
    List {
        #[arg(long)]
        bank: Option<String>,
    },
}
