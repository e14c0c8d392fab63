use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroU32;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{Credential, CredentialPersistence, CredentialStore, OAuthFlow};
use crate::error::{MailError, PipelineError};
use crate::mail::{MailClient, MessageOrdering};
use crate::models::{
    Classification, INBOX_LABEL, MessageReport, Outcome, PipelineState, ScanReport,
};
use crate::scam::ScamDetector;
use crate::spam::SpamClassifier;

#[derive(Debug, Clone)]
pub struct TriageSettings {
    pub limit: NonZeroU32,
    pub scam_label: String,
    pub spam_label: String,
    /// Pause between messages to stay under the service's rate limits.
    pub pause: Duration,
    /// Classify and report without touching labels.
    pub dry_run: bool,
}

impl Default for TriageSettings {
    fn default() -> Self {
        Self {
            limit: NonZeroU32::new(10).unwrap_or(NonZeroU32::MIN),
            scam_label: "ScamEmails".to_string(),
            spam_label: "DetectedSpam".to_string(),
            pause: Duration::from_millis(200),
            dry_run: false,
        }
    }
}

/// Progress published while a scan runs.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    State(PipelineState),
    Listed { total: usize },
    Message { report: MessageReport, total: usize },
}

/// Scam check first, spam model second; the first detector that fires wins.
pub fn classify(scam: &ScamDetector, spam: &SpamClassifier, subject: &str) -> Classification {
    if scam.is_scam(subject) {
        Classification::Scam
    } else if spam.predict(subject) {
        Classification::Spam
    } else {
        Classification::Benign
    }
}

/// Authenticates, lists one batch and files every flagged message.
///
/// Messages are handled one at a time in listing order. A failure on one
/// message is reported and the batch moves on; only authentication and the
/// initial listing can fail the run.
pub struct TriagePipeline<'a> {
    scam: &'a ScamDetector,
    spam: &'a SpamClassifier,
    settings: TriageSettings,
    cancel: CancellationToken,
    progress: Option<mpsc::UnboundedSender<ScanEvent>>,
}

impl<'a> TriagePipeline<'a> {
    pub fn new(scam: &'a ScamDetector, spam: &'a SpamClassifier, settings: TriageSettings) -> Self {
        Self {
            scam,
            spam,
            settings,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    /// Stops the scan before the next message once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<ScanEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Authenticates and runs the batch. The credential is re-acquired
    /// before every message, and `connect` is called again whenever that
    /// yields a different access token.
    pub async fn run<P, F, M, C>(
        &self,
        credentials: &CredentialStore<P, F>,
        connect: C,
    ) -> Result<ScanReport, PipelineError>
    where
        P: CredentialPersistence,
        F: OAuthFlow,
        M: MailClient,
        C: FnMut(&Credential) -> Result<M, MailError>,
    {
        let mut state = PipelineState::Idle;
        self.emit(ScanEvent::State(state));

        let mut session = match Session::open(credentials, connect).await {
            Ok(session) => session,
            Err(e) => {
                self.advance(&mut state, PipelineState::Failed);
                return Err(e);
            }
        };
        self.advance(&mut state, PipelineState::Authenticated);

        self.scan_from(&mut session, state).await
    }

    /// Runs the batch against an already authenticated client.
    #[cfg(test)]
    pub async fn scan<M: MailClient>(&self, mail: &M) -> Result<ScanReport, PipelineError> {
        let state = PipelineState::Authenticated;
        self.emit(ScanEvent::State(state));
        self.scan_from(&mut FixedClient(mail), state).await
    }

    async fn scan_from<S: MailSource>(
        &self,
        source: &mut S,
        mut state: PipelineState,
    ) -> Result<ScanReport, PipelineError> {
        let started_at = Utc::now();

        let listed = match source.client().await {
            Ok(mail) => mail
                .list_message_ids(self.settings.limit, MessageOrdering::MostRecentFirst)
                .await
                .map_err(PipelineError::Listing),
            Err(e) => Err(e),
        };
        let ids = match listed {
            Ok(ids) => ids,
            Err(e) => {
                self.advance(&mut state, PipelineState::Failed);
                return Err(e);
            }
        };
        self.advance(&mut state, PipelineState::Scanning);

        let total = ids.len();
        info!(total, dry_run = self.settings.dry_run, "Scanning messages");
        self.emit(ScanEvent::Listed { total });

        let mut labels = LabelCache::default();
        let mut outcomes = Vec::with_capacity(total);

        for (position, id) in ids.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!(processed = position, total, "Scan cancelled");
                break;
            }
            if position > 0 && !self.settings.pause.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.pause) => {}
                    _ = self.cancel.cancelled() => {
                        info!(processed = position, total, "Scan cancelled");
                        break;
                    }
                }
            }

            let mail = match source.client().await {
                Ok(mail) => mail,
                Err(e) => {
                    warn!(processed = position, total, error = %e, "Lost authorization mid-scan");
                    self.advance(&mut state, PipelineState::Failed);
                    return Err(e);
                }
            };
            let report = self.triage_message(mail, &mut labels, position, id).await;
            self.advance(&mut state, PipelineState::MessageClassified);
            self.emit(ScanEvent::Message {
                report: report.clone(),
                total,
            });
            outcomes.push(report);
        }

        let terminal = if outcomes.len() < total {
            PipelineState::Cancelled
        } else {
            PipelineState::Complete
        };
        self.advance(&mut state, terminal);

        Ok(ScanReport {
            state,
            dry_run: self.settings.dry_run,
            started_at,
            finished_at: Utc::now(),
            outcomes,
        })
    }

    async fn triage_message<M: MailClient>(
        &self,
        mail: &M,
        labels: &mut LabelCache,
        position: usize,
        message_id: String,
    ) -> MessageReport {
        let subject = match mail.get_subject(&message_id).await {
            Ok(subject) => subject,
            Err(e) => {
                warn!(message = %message_id, error = %e, "Failed to fetch message");
                return MessageReport {
                    position,
                    message_id,
                    subject: None,
                    outcome: Outcome::Failed {
                        classification: None,
                        reason: e.to_string(),
                    },
                    filed_under: None,
                };
            }
        };

        let classification = classify(self.scam, self.spam, &subject);
        let target = match classification {
            Classification::Scam => Some(self.settings.scam_label.as_str()),
            Classification::Spam => Some(self.settings.spam_label.as_str()),
            Classification::Benign => None,
        };

        let (outcome, filed_under) = match target {
            Some(label) if !self.settings.dry_run => {
                match self.file(mail, labels, &message_id, label).await {
                    Ok(()) => (Outcome::Classified(classification), Some(label.to_string())),
                    Err(e) => {
                        warn!(message = %message_id, label, error = %e, "Failed to file message");
                        (
                            Outcome::Failed {
                                classification: Some(classification),
                                reason: e.to_string(),
                            },
                            None,
                        )
                    }
                }
            }
            _ => (Outcome::Classified(classification), None),
        };

        info!(
            message = %message_id,
            subject = %subject,
            outcome = outcome.as_str(),
            filed_under = filed_under.as_deref().unwrap_or("-"),
            "Triaged message"
        );

        MessageReport {
            position,
            message_id,
            subject: Some(subject),
            outcome,
            filed_under,
        }
    }

    /// Adds `label_name` and removes the inbox label in one request.
    async fn file<M: MailClient>(
        &self,
        mail: &M,
        labels: &mut LabelCache,
        message_id: &str,
        label_name: &str,
    ) -> Result<(), MailError> {
        let label_id = labels.resolve(mail, label_name).await?;
        let add: BTreeSet<String> = [label_id].into_iter().collect();
        let remove: BTreeSet<String> = [INBOX_LABEL.to_string()].into_iter().collect();
        mail.relabel(message_id, &add, &remove).await
    }

    fn advance(&self, state: &mut PipelineState, next: PipelineState) {
        if !state.can_advance_to(next) {
            warn!(from = state.as_str(), to = next.as_str(), "Unexpected pipeline transition");
        }
        // Per-message transitions are too chatty to publish.
        if next != PipelineState::MessageClassified || *state != next {
            debug!(from = state.as_str(), to = next.as_str(), "Pipeline transition");
            self.emit(ScanEvent::State(next));
        }
        *state = next;
    }

    fn emit(&self, event: ScanEvent) {
        if let Some(progress) = &self.progress {
            let _ = progress.send(event);
        }
    }
}

/// Where the pipeline gets a client for its next request.
trait MailSource {
    type Client: MailClient;

    async fn client(&mut self) -> Result<&Self::Client, PipelineError>;
}

/// A client built from the store's current credential, rebuilt whenever the
/// store hands out a different access token.
struct Session<'c, P, F, M, C> {
    credentials: &'c CredentialStore<P, F>,
    connect: C,
    access_token: String,
    mail: M,
}

impl<'c, P, F, M, C> Session<'c, P, F, M, C>
where
    P: CredentialPersistence,
    F: OAuthFlow,
    M: MailClient,
    C: FnMut(&Credential) -> Result<M, MailError>,
{
    async fn open(
        credentials: &'c CredentialStore<P, F>,
        mut connect: C,
    ) -> Result<Self, PipelineError> {
        let credential = credentials.acquire().await?;
        let mail = connect(&credential).map_err(PipelineError::Connection)?;
        Ok(Self {
            credentials,
            connect,
            access_token: credential.access_token,
            mail,
        })
    }
}

impl<P, F, M, C> MailSource for Session<'_, P, F, M, C>
where
    P: CredentialPersistence,
    F: OAuthFlow,
    M: MailClient,
    C: FnMut(&Credential) -> Result<M, MailError>,
{
    type Client = M;

    async fn client(&mut self) -> Result<&M, PipelineError> {
        let credential = self.credentials.acquire().await?;
        if credential.access_token != self.access_token {
            debug!("Access token changed, reconnecting");
            self.mail = (self.connect)(&credential).map_err(PipelineError::Connection)?;
            self.access_token = credential.access_token;
        }
        Ok(&self.mail)
    }
}

#[cfg(test)]
struct FixedClient<'m, M>(&'m M);

#[cfg(test)]
impl<M: MailClient> MailSource for FixedClient<'_, M> {
    type Client = M;

    async fn client(&mut self) -> Result<&M, PipelineError> {
        Ok(self.0)
    }
}

/// Label ids resolved during one run.
#[derive(Debug, Default)]
struct LabelCache {
    ids: HashMap<String, String>,
}

impl LabelCache {
    async fn resolve<M: MailClient>(&mut self, mail: &M, name: &str) -> Result<String, MailError> {
        if let Some(id) = self.ids.get(name) {
            return Ok(id.clone());
        }
        let id = mail.get_or_create_label(name).await?;
        self.ids.insert(name.to_string(), id.clone());
        Ok(id)
    }
}
