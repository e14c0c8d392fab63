use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Subject reported for messages without a Subject header.
pub const NO_SUBJECT: &str = "No Subject";

/// System label removed when a message is filed away.
pub const INBOX_LABEL: &str = "INBOX";

/// Verdict of the classification chain for one subject.
///
/// Scam wins over spam: the chain stops at the first detector that fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    Scam,
    Spam,
    Benign,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scam => "scam",
            Self::Spam => "spam",
            Self::Benign => "benign",
        }
    }
}

/// What happened to one message of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Classified(Classification),
    /// The message could not be fetched or filed. `classification` is set when
    /// the verdict was reached but filing failed.
    Failed {
        classification: Option<Classification>,
        reason: String,
    },
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Classified(c) => c.as_str(),
            Outcome::Failed { .. } => "error",
        }
    }

    pub fn classification(&self) -> Option<Classification> {
        match self {
            Outcome::Classified(c) => Some(*c),
            Outcome::Failed { classification, .. } => *classification,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReport {
    /// Zero-based position in fetch order.
    pub position: usize,
    pub message_id: String,
    pub subject: Option<String>,
    pub outcome: Outcome,
    /// Label the message was filed under, if any.
    pub filed_under: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub scam: usize,
    pub spam: usize,
    pub benign: usize,
    pub error: usize,
}

/// Lifecycle of a scan run.
///
/// `Idle -> Authenticated -> Scanning -> MessageClassified* -> Complete`, with
/// `Failed` reachable from anywhere and `Cancelled` from the scanning states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Idle,
    Authenticated,
    Scanning,
    MessageClassified,
    Complete,
    Cancelled,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Authenticated => "authenticated",
            Self::Scanning => "scanning",
            Self::MessageClassified => "message_classified",
            Self::Complete => "complete",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::Failed)
    }

    pub fn can_advance_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Idle, Authenticated) => true,
            (Authenticated, Scanning) => true,
            (Scanning | MessageClassified, MessageClassified) => true,
            (Scanning | MessageClassified, Complete) => true,
            (Scanning | MessageClassified, Cancelled) => true,
            _ => false,
        }
    }
}

/// Result of one scan run, in fetch order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub state: PipelineState,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<MessageReport>,
}

impl ScanReport {
    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for report in &self.outcomes {
            match report.outcome {
                Outcome::Classified(Classification::Scam) => counts.scam += 1,
                Outcome::Classified(Classification::Spam) => counts.spam += 1,
                Outcome::Classified(Classification::Benign) => counts.benign += 1,
                Outcome::Failed { .. } => counts.error += 1,
            }
        }
        counts
    }
}

/// A scan row as stored in the history database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScanSummary {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: String,
    pub dry_run: bool,
    pub error: Option<String>,
    #[sqlx(default)]
    pub total: i64,
    #[sqlx(default)]
    pub flagged: i64,
    #[sqlx(default)]
    pub errors: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoredOutcome {
    pub position: i64,
    pub message_id: String,
    pub subject: Option<String>,
    pub outcome: String,
    /// Verdict reached before a filing failure, or the outcome itself.
    pub classification: Option<String>,
    pub filed_under: Option<String>,
    pub detail: Option<String>,
}
