mod cli;
mod db;
mod error;
mod escalation;
mod fmt;
mod importer;
mod ledger;
mod logging;
mod matching;
mod models;
mod orchestrator;
mod recorder;
mod settings;
mod strategies;

use clap::Parser;

use cli::{Cli, Commands, TerminalsCommands};

fn main() {
    let cli = Cli::parse();
    logging::init_logging(&settings::load_settings());

    let result = match cli.command {
        Commands::Init { data_dir } => cli::init::run(data_dir),
        Commands::Import { ledger, file, bank } => cli::import::run(&ledger, &file, &bank),
        Commands::Classify {
            bank_tx,
            transaction_type,
        } => cli::classify::run(bank_tx, &transaction_type),
        Commands::Run {
            bank,
            escalation,
            json,
        } => cli::run::run(&bank, escalation.as_deref(), json),
        Commands::Search { bank, amount, date } => cli::search::run(&bank, amount, date.as_deref()),
        Commands::Match {
            bank_tx,
            acc,
            pos,
            note,
        } => cli::link::link(bank_tx, acc, pos, note.as_deref()),
        Commands::Unmatch {
            bank_tx,
            acc,
            pos,
            note,
        } => cli::link::unlink(bank_tx, acc, pos, note.as_deref()),
        Commands::Results { bank, limit } => cli::results::run(bank.as_deref(), limit),
        Commands::Status => cli::status::run(),
        Commands::Banks => cli::banks::list(),
        Commands::Terminals { command } => match command {
            TerminalsCommands::Add { terminal_number, bank } => cli::banks::add_terminal(&terminal_number, &bank),
            TerminalsCommands::List { bank } => cli::banks::list_terminals(bank.as_deref()),
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
