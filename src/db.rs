use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;

use crate::models::{Outcome, PipelineState, ScanReport, ScanSummary, StoredOutcome};

/// Scan history kept in SQLite.
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        use sqlx::sqlite::SqliteConnectOptions;
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid database url {}", database_url))?
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options)
            .await
            .with_context(|| format!("failed to open {}", database_url))?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        let schema = include_str!("../schema.sql");
        sqlx::query(schema)
            .execute(&self.pool)
            .await
            .context("failed to apply history schema")?;
        Ok(())
    }

    /// Stores a finished scan and its outcomes, returning the scan id.
    pub async fn record_scan(&self, report: &ScanReport) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let scan_id = sqlx::query(
            "INSERT INTO scans (started_at, finished_at, state, dry_run, error)
             VALUES (?, ?, ?, ?, NULL)",
        )
        .bind(report.started_at)
        .bind(report.finished_at)
        .bind(report.state.as_str())
        .bind(report.dry_run)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for message in &report.outcomes {
            let detail = match &message.outcome {
                Outcome::Failed { reason, .. } => Some(reason.as_str()),
                Outcome::Classified(_) => None,
            };
            sqlx::query(
                "INSERT INTO scan_outcomes (scan_id, position, message_id, subject, outcome, classification, filed_under, detail)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(scan_id)
            .bind(message.position as i64)
            .bind(&message.message_id)
            .bind(&message.subject)
            .bind(message.outcome.as_str())
            .bind(message.outcome.classification().map(|c| c.as_str()))
            .bind(&message.filed_under)
            .bind(detail)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(scan_id)
    }

    /// Stores a run that ended with a terminal error and no report.
    pub async fn record_failure(
        &self,
        started_at: DateTime<Utc>,
        dry_run: bool,
        error: &str,
    ) -> Result<i64> {
        let scan_id = sqlx::query(
            "INSERT INTO scans (started_at, finished_at, state, dry_run, error)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(started_at)
        .bind(Utc::now())
        .bind(PipelineState::Failed.as_str())
        .bind(dry_run)
        .bind(error)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(scan_id)
    }

    /// Most recent scans first, with outcome counts.
    pub async fn recent_scans(&self, limit: u32) -> Result<Vec<ScanSummary>> {
        let scans = sqlx::query_as::<_, ScanSummary>(
            "SELECT s.id, s.started_at, s.finished_at, s.state, s.dry_run, s.error,
                    COUNT(o.position) AS total,
                    COALESCE(SUM(CASE WHEN o.outcome IN ('scam', 'spam') THEN 1 ELSE 0 END), 0) AS flagged,
                    COALESCE(SUM(CASE WHEN o.outcome = 'error' THEN 1 ELSE 0 END), 0) AS errors
             FROM scans s
             LEFT JOIN scan_outcomes o ON o.scan_id = s.id
             GROUP BY s.id
             ORDER BY s.started_at DESC, s.id DESC
             LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(scans)
    }

    pub async fn scan_outcomes(&self, scan_id: i64) -> Result<Vec<StoredOutcome>> {
        let outcomes = sqlx::query_as::<_, StoredOutcome>(
            "SELECT position, message_id, subject, outcome, classification, filed_under, detail
             FROM scan_outcomes
             WHERE scan_id = ?
             ORDER BY position",
        )
        .bind(scan_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Classification, MessageReport};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_db() -> Database {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let db = Database { pool };
        db.run_migrations().await.unwrap();
        db
    }

    fn report(outcomes: Vec<MessageReport>) -> ScanReport {
        let now = Utc::now();
        ScanReport {
            state: PipelineState::Complete,
            dry_run: false,
            started_at: now,
            finished_at: now,
            outcomes,
        }
    }

    fn message(position: usize, subject: &str, outcome: Outcome, filed_under: Option<&str>) -> MessageReport {
        MessageReport {
            position,
            message_id: format!("m{}", position + 1),
            subject: Some(subject.to_string()),
            outcome,
            filed_under: filed_under.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_scan_history_round_trip() {
        let db = memory_db().await;
        let scan = report(vec![
            message(0, "WIN the lottery now!", Outcome::Classified(Classification::Scam), Some("ScamEmails")),
            message(1, "Meeting notes", Outcome::Classified(Classification::Benign), None),
            message(
                2,
                "urgent: password reset required",
                Outcome::Failed {
                    classification: Some(Classification::Scam),
                    reason: "not found: message m3".into(),
                },
                None,
            ),
        ]);

        let id = db.record_scan(&scan).await.unwrap();

        let scans = db.recent_scans(10).await.unwrap();
        assert_eq!(scans.len(), 1);
        let summary = &scans[0];
        assert_eq!(summary.id, id);
        assert_eq!(summary.state, "complete");
        assert!(!summary.dry_run);
        assert_eq!(summary.error, None);
        assert_eq!((summary.total, summary.flagged, summary.errors), (3, 1, 1));

        let stored = db.scan_outcomes(id).await.unwrap();
        let outcomes: Vec<&str> = stored.iter().map(|o| o.outcome.as_str()).collect();
        assert_eq!(outcomes, vec!["scam", "benign", "error"]);
        assert_eq!(stored[0].filed_under.as_deref(), Some("ScamEmails"));
        assert_eq!(stored[2].detail.as_deref(), Some("not found: message m3"));
        assert_eq!(stored[2].classification.as_deref(), Some("scam"));
        assert_eq!(stored[1].classification.as_deref(), Some("benign"));
        assert_eq!(stored[1].subject.as_deref(), Some("Meeting notes"));
    }

    #[tokio::test]
    async fn test_failed_run_has_no_outcomes() {
        let db = memory_db().await;
        let id = db
            .record_failure(Utc::now(), true, "authentication failed: invalid_grant")
            .await
            .unwrap();

        let scans = db.recent_scans(10).await.unwrap();
        assert_eq!(scans[0].id, id);
        assert_eq!(scans[0].state, "failed");
        assert_eq!((scans[0].total, scans[0].flagged, scans[0].errors), (0, 0, 0));
        assert_eq!(
            scans[0].error.as_deref(),
            Some("authentication failed: invalid_grant")
        );
        assert!(db.scan_outcomes(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recent_scans_newest_first_and_limited() {
        let db = memory_db().await;
        let first = db.record_scan(&report(vec![])).await.unwrap();
        let second = db.record_scan(&report(vec![])).await.unwrap();
        let third = db.record_scan(&report(vec![])).await.unwrap();

        let ids: Vec<i64> = db
            .recent_scans(2)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert!(first < second);
        assert_eq!(ids, vec![third, second]);
    }

    #[tokio::test]
    async fn test_migrations_are_repeatable() {
        let db = memory_db().await;
        db.run_migrations().await.unwrap();
        assert!(db.recent_scans(5).await.unwrap().is_empty());
    }
}
