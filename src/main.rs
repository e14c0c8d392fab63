mod auth;
mod config;
mod db;
mod error;
mod gmail;
mod mail;
mod models;
mod retry;
mod scam;
mod spam;
mod storage;
#[cfg(test)]
mod testing;
mod triage;

use std::path::PathBuf;

use anyhow::Context;
use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, info, warn};

use crate::auth::{CredentialStore, InstalledAppFlow};
use crate::config::{Config, DEFAULT_CONFIG_PATH, TokenStoreKind};
use crate::gmail::GmailClient;
use crate::models::{NO_SUBJECT, Outcome, PipelineState};
use crate::retry::RetryPolicy;
use crate::scam::ScamDetector;
use crate::spam::SpamClassifier;
use crate::storage::{FileTokenStore, RingStorage, TokenStore};
use crate::triage::{ScanEvent, TriagePipeline};

#[derive(Parser)]
#[command(name = "gmail-triage", version, about = "Files scam and spam mail out of the inbox")]
struct Cli {
    /// Log remote calls and retries.
    #[arg(long, global = true)]
    debug: bool,

    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Obtain and store a credential.
    Auth,
    /// Classify the most recent messages of `[scan] source_label` (INBOX
    /// unless configured otherwise) and file flagged ones.
    Scan {
        /// Number of messages to examine.
        #[arg(long)]
        limit: Option<u32>,
        /// Classify and report without changing any labels.
        #[arg(long)]
        dry_run: bool,
    },
    /// Forget the stored credential.
    ResetToken,
    /// Show recent scans, or the messages of one scan.
    History {
        #[arg(long, default_value_t = 10)]
        limit: u32,
        /// Scan id whose per-message outcomes to print.
        #[arg(long)]
        scan: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.debug { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(&cli.config);

    match cli.command {
        Command::Auth => authenticate(&config).await,
        Command::Scan { limit, dry_run } => scan(&config, limit, dry_run).await,
        Command::ResetToken => {
            credential_store(&config).await?.reset().await?;
            println!("Token cleared. Run `gmail-triage auth` to sign in again.");
            Ok(())
        }
        Command::History { limit, scan: None } => history(&config, limit).await,
        Command::History { scan: Some(id), .. } => scan_details(&config, id).await,
    }
}

fn token_store(config: &Config) -> TokenStore {
    match config.auth.token_store {
        TokenStoreKind::File => TokenStore::File(FileTokenStore::new(&config.auth.token_path)),
        TokenStoreKind::Keyring => TokenStore::Keyring(RingStorage),
    }
}

async fn credential_store(config: &Config) -> anyhow::Result<CredentialStore<TokenStore, InstalledAppFlow>> {
    let secret = InstalledAppFlow::load_secret(&config.auth.client_secret_path).await?;
    let flow = InstalledAppFlow::new(
        secret,
        config.auth.interactive,
        config.auth.consent_timeout(),
    );
    Ok(CredentialStore::new(token_store(config), flow).with_expiry_skew(config.auth.expiry_skew()))
}

async fn open_history(config: &Config) -> anyhow::Result<db::Database> {
    let db = db::Database::new(&config.history.database_url).await?;
    db.run_migrations().await?;
    Ok(db)
}

async fn authenticate(config: &Config) -> anyhow::Result<()> {
    let credentials = credential_store(config).await?;
    let credential = credentials.acquire().await.context("authentication failed")?;
    println!(
        "Authenticated. Access token valid until {}.",
        credential.expires_at.with_timezone(&Local).format("%Y-%m-%d %H:%M")
    );
    Ok(())
}

async fn scan(config: &Config, limit: Option<u32>, dry_run: bool) -> anyhow::Result<()> {
    let sensitivity = config.sensitivity;
    warn!(
        spam = sensitivity.spam,
        scam = sensitivity.scam,
        "Sensitivity settings are not applied to the detectors"
    );

    let spam = SpamClassifier::load(&config.model.vectorizer_path, &config.model.classifier_path)
        .context("spam model is unavailable")?;
    let scam = ScamDetector::new();
    let credentials = credential_store(config).await?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping before the next message");
            interrupt.cancel();
        }
    });

    let (tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_progress(rx));

    let settings = config.scan.triage_settings(limit, dry_run);
    let pipeline = TriagePipeline::new(&scam, &spam, settings)
        .with_cancellation(cancel)
        .with_progress(tx);

    let retry = RetryPolicy::from(&config.retry);
    let source_label = config.scan.source_label();
    let started_at = Utc::now();
    let result = pipeline
        .run(&credentials, |credential| {
            GmailClient::connect(credential, retry.clone(), source_label.clone())
        })
        .await;

    // Closes the progress channel so the printer drains and exits.
    drop(pipeline);
    if let Err(e) = printer.await {
        warn!(error = %e, "Progress printer stopped abnormally");
    }

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            let recorded = match open_history(config).await {
                Ok(db) => db.record_failure(started_at, dry_run, &e.to_string()).await,
                Err(db_err) => Err(db_err),
            };
            if let Err(db_err) = recorded {
                warn!(error = %db_err, "Failed to record scan history");
            }
            return Err(e).context("scan failed");
        }
    };

    let recorded = match open_history(config).await {
        Ok(db) => db.record_scan(&report).await,
        Err(e) => Err(e),
    };
    let scan_label = match recorded {
        Ok(scan_id) => {
            info!(scan_id, state = report.state.as_str(), "Scan recorded");
            format!("Scan #{}", scan_id)
        }
        Err(e) => {
            warn!(error = %e, "Failed to record scan history");
            "Scan".to_string()
        }
    };

    let counts = report.counts();
    println!(
        "{} {}: {} scam, {} spam, {} benign, {} errors{}",
        scan_label,
        report.state.as_str(),
        counts.scam,
        counts.spam,
        counts.benign,
        counts.error,
        if report.dry_run { " (dry run, no labels changed)" } else { "" }
    );
    for failed in report.outcomes.iter().filter(|r| r.outcome.is_error()) {
        let verdict = failed
            .outcome
            .classification()
            .map(|c| format!(" after classifying as {}", c.as_str()))
            .unwrap_or_default();
        warn!(message = %failed.message_id, "Message was not triaged{}", verdict);
    }

    if report.state == PipelineState::Cancelled {
        println!(
            "Stopped after {} messages; the rest were left untouched.",
            report.outcomes.len()
        );
    }
    Ok(())
}

async fn print_progress(mut rx: mpsc::UnboundedReceiver<ScanEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            ScanEvent::State(state) => debug!(state = state.as_str(), "Pipeline state"),
            ScanEvent::Listed { total } => println!("Scanning {} messages", total),
            ScanEvent::Message { report, total } => {
                let subject = report.subject.as_deref().unwrap_or(NO_SUBJECT);
                let note = match (&report.outcome, &report.filed_under) {
                    (Outcome::Failed { reason, .. }, _) => format!(" ({})", reason),
                    (_, Some(label)) => format!(" -> {}", label),
                    _ => String::new(),
                };
                println!(
                    "[{}/{}] {:<6} {}{}",
                    report.position + 1,
                    total,
                    report.outcome.as_str(),
                    subject,
                    note
                );
            }
        }
    }
}

async fn history(config: &Config, limit: u32) -> anyhow::Result<()> {
    let db = open_history(config).await?;
    let scans = db.recent_scans(limit).await?;
    if scans.is_empty() {
        println!("No scans recorded yet.");
        return Ok(());
    }

    for scan in scans {
        let mode = if scan.dry_run { " dry-run" } else { "" };
        println!(
            "#{:<4} {}  {:<9}{}  {} messages, {} flagged, {} errors",
            scan.id,
            scan.started_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
            scan.state,
            mode,
            scan.total,
            scan.flagged,
            scan.errors
        );
        if let Some(error) = scan.error {
            println!("      {}", error);
        }
    }
    Ok(())
}

async fn scan_details(config: &Config, scan_id: i64) -> anyhow::Result<()> {
    let db = open_history(config).await?;
    let outcomes = db.scan_outcomes(scan_id).await?;
    if outcomes.is_empty() {
        println!("Scan #{} has no recorded messages.", scan_id);
        return Ok(());
    }

    for outcome in outcomes {
        println!(
            "{:>3}. {:<6} {} {}",
            outcome.position + 1,
            outcome.outcome,
            outcome.message_id,
            outcome.subject.as_deref().unwrap_or(NO_SUBJECT)
        );
        if let Some(label) = outcome.filed_under {
            println!("     filed under {}", label);
        }
        if let Some(detail) = outcome.detail {
            match outcome.classification {
                Some(verdict) => println!("     {} (classified as {})", detail, verdict),
                None => println!("     {}", detail),
            }
        }
    }
    Ok(())
}
