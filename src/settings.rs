use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ReconError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EscalationBackend {
    /// Ambiguous cases are left for review without asking anyone.
    #[default]
    None,
    Manual,
    Ai,
}

impl EscalationBackend {
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "none" => Some(Self::None),
            "manual" => Some(Self::Manual),
            "ai" => Some(Self::Ai),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub http_retry_delay_secs: u64,
    pub other_retry_delay_secs: u64,
    /// Decisions below this confidence are left for review.
    pub min_confidence: f64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: 300,
            max_attempts: 3,
            http_retry_delay_secs: 10,
            other_retry_delay_secs: 5,
            min_confidence: 0.0,
        }
    }
}

impl AiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Everything a reconciliation run needs to know, passed in explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub escalation: EscalationBackend,
    pub ai: AiConfig,
    /// Largest bank fee we accept as silently deducted from a transfer.
    pub fee_threshold: f64,
    /// Half-width of the amount window for interactive search.
    pub search_tolerance: f64,
    /// Days between a card swipe and its Shaparak settlement line.
    pub pos_settlement_lag_days: i64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            escalation: EscalationBackend::None,
            ai: AiConfig::default(),
            fee_threshold: 100_000.0,
            search_tolerance: 1_000.0,
            pos_settlement_lag_days: 1,
        }
    }
}

impl ReconciliationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.escalation == EscalationBackend::Ai
            && self.ai.webhook_url.as_deref().map_or(true, |u| u.trim().is_empty())
        {
            return Err(ReconError::Configuration(
                "AI escalation selected but no webhook URL is configured".into(),
            ));
        }
        if self.ai.max_attempts == 0 {
            return Err(ReconError::Configuration("ai.max_attempts must be at least 1".into()));
        }
        if self.fee_threshold < 0.0 {
            return Err(ReconError::Configuration("fee_threshold cannot be negative".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub data_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir().to_string_lossy().to_string(),
            log_level: default_log_level(),
            log_json: false,
            reconciliation: ReconciliationConfig::default(),
        }
    }
}

impl Settings {
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("tatbigh.db")
    }
}

fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("tatbigh")
}

fn settings_path() -> PathBuf {
    config_dir().join("settings.json")
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Documents")
        .join("tatbigh")
}

pub fn load_settings() -> Settings {
    let path = settings_path();
    if path.exists() {
        let content = std::fs::read_to_string(&path).unwrap_or_default();
        serde_json::from_str(&content).unwrap_or_default()
    } else {
        Settings::default()
    }
}

pub fn save_settings(settings: &Settings) -> Result<()> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir)?;
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| ReconError::Settings(e.to_string()))?;
    std::fs::write(settings_path(), format!("{json}\n"))?;
    Ok(())
}

pub fn shellexpand_path(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| PathBuf::from(path))
        .to_string_lossy()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_business_constants() {
        let cfg = ReconciliationConfig::default();
        assert_eq!(cfg.fee_threshold, 100_000.0);
        assert_eq!(cfg.search_tolerance, 1_000.0);
        assert_eq!(cfg.ai.timeout_secs, 300);
        assert_eq!(cfg.ai.max_attempts, 3);
        assert_eq!(cfg.ai.http_retry_delay_secs, 10);
        assert_eq!(cfg.ai.other_retry_delay_secs, 5);
    }

    #[test]
    fn test_partial_json_merges_with_defaults() {
        let json = r#"{"data_dir": "/tmp/t", "reconciliation": {"escalation": "ai", "ai": {"webhook_url": "http://x"}}}"#;
        let s: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(s.log_level, "info");
        assert_eq!(s.reconciliation.escalation, EscalationBackend::Ai);
        assert_eq!(s.reconciliation.ai.max_attempts, 3);
        assert_eq!(s.reconciliation.fee_threshold, 100_000.0);
        assert!(s.reconciliation.validate().is_ok());
    }

    #[test]
    fn test_ai_without_url_is_configuration_error() {
        let cfg = ReconciliationConfig {
            escalation: EscalationBackend::Ai,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ReconError::Configuration(_))));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut settings = Settings::default();
        settings.data_dir = "/tmp/test".to_string();
        settings.reconciliation.escalation = EscalationBackend::Manual;
        std::fs::write(&path, serde_json::to_string_pretty(&settings).unwrap()).unwrap();
        let loaded: Settings = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.data_dir, "/tmp/test");
        assert_eq!(loaded.reconciliation.escalation, EscalationBackend::Manual);
    }
}
