use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconError {
    #[error("Storage error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Nothing to do: bank {0} has no unreconciled transactions")]
    NothingToDo(i64),

    #[error("Unknown bank: {0}")]
    UnknownBank(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("{0}")]
    Other(String),
}

impl ReconError {
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Db(_))
    }
}

pub type Result<T> = std::result::Result<T, ReconError>;
