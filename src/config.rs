use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::retry::RetryPolicy;
use crate::triage::TriageSettings;

pub const DEFAULT_CONFIG_PATH: &str = "settings.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub auth: AuthSettings,
    pub scan: ScanSettings,
    pub model: ModelSettings,
    pub retry: RetrySettings,
    pub sensitivity: Sensitivity,
    pub history: HistorySettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenStoreKind {
    File,
    Keyring,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub client_secret_path: PathBuf,
    pub token_store: TokenStoreKind,
    pub token_path: PathBuf,
    /// Allow opening a browser for consent when no usable token is stored.
    pub interactive: bool,
    pub consent_timeout_secs: u64,
    pub expiry_skew_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            client_secret_path: PathBuf::from("credentials.json"),
            token_store: TokenStoreKind::File,
            token_path: PathBuf::from("token.json"),
            interactive: true,
            consent_timeout_secs: 300,
            expiry_skew_secs: 60,
        }
    }
}

impl AuthSettings {
    pub fn consent_timeout(&self) -> Duration {
        Duration::from_secs(self.consent_timeout_secs)
    }

    pub fn expiry_skew(&self) -> Duration {
        Duration::from_secs(self.expiry_skew_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    pub limit: u32,
    /// Label the batch is listed from. Empty lists the whole mailbox.
    pub source_label: String,
    pub spam_label: String,
    pub scam_label: String,
    pub pause_ms: u64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        let triage = TriageSettings::default();
        Self {
            limit: triage.limit.get(),
            source_label: crate::models::INBOX_LABEL.to_string(),
            spam_label: triage.spam_label,
            scam_label: triage.scam_label,
            pause_ms: triage.pause.as_millis() as u64,
        }
    }
}

impl ScanSettings {
    pub fn source_label(&self) -> Option<String> {
        let label = self.source_label.trim();
        (!label.is_empty()).then(|| label.to_string())
    }

    /// Pipeline settings, with `limit` and `dry_run` taken from the command
    /// line when given.
    pub fn triage_settings(&self, limit: Option<u32>, dry_run: bool) -> TriageSettings {
        let limit = limit.unwrap_or(self.limit);
        TriageSettings {
            limit: NonZeroU32::new(limit).unwrap_or(NonZeroU32::MIN),
            scam_label: self.scam_label.clone(),
            spam_label: self.spam_label.clone(),
            pause: Duration::from_millis(self.pause_ms),
            dry_run,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub vectorizer_path: PathBuf,
    pub classifier_path: PathBuf,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            vectorizer_path: PathBuf::from("vectorizer.json"),
            classifier_path: PathBuf::from("spam_classifier.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        RetryPolicy {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }
}

pub const SENSITIVITY_RANGE: std::ops::RangeInclusive<f64> = 0.1..=1.0;

/// Detector sensitivity knobs. Accepted and range-checked, but neither
/// detector reads them yet.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sensitivity {
    pub spam: f64,
    pub scam: f64,
}

impl Default for Sensitivity {
    fn default() -> Self {
        Self {
            spam: 0.5,
            scam: 0.5,
        }
    }
}

impl Sensitivity {
    /// Out-of-range values fall back to the default, with a warning.
    fn validated(self) -> Self {
        let defaults = Self::default();
        let check = |name: &str, value: f64, default: f64| {
            if SENSITIVITY_RANGE.contains(&value) {
                value
            } else {
                warn!(
                    setting = name,
                    value,
                    "Sensitivity must be between 0.1 and 1.0, using {}",
                    default
                );
                default
            }
        };
        Self {
            spam: check("spam", self.spam, defaults.spam),
            scam: check("scam", self.scam, defaults.scam),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorySettings {
    pub database_url: String,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            database_url: "sqlite:gmail-triage.db?mode=rwc".to_string(),
        }
    }
}

impl Config {
    /// Reads `path`, falling back to defaults when it is missing or unreadable.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        let config = match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Ignoring malformed settings");
                Self::default()
            }),
            Err(_) => Self::default(),
        };
        Self {
            sensitivity: config.sensitivity.validated(),
            ..config
        }
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}
