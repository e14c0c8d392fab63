//! In-memory doubles for the mail service, credential storage and OAuth flow.

use std::collections::{BTreeSet, HashSet};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use crate::auth::{Credential, CredentialPersistence, OAuthFlow};
use crate::error::{AuthError, MailError};
use crate::mail::{MailClient, MessageOrdering};
use crate::models::{INBOX_LABEL, NO_SUBJECT};

pub fn credential_expiring_in(token: &str, seconds: i64) -> Credential {
    Credential {
        access_token: token.to_string(),
        refresh_token: Some(format!("refresh-{}", token)),
        expires_at: Utc::now() + chrono::Duration::seconds(seconds),
    }
}

#[derive(Debug, Clone)]
struct Label {
    id: String,
    name: String,
}

#[derive(Debug, Clone)]
pub struct FakeMessage {
    pub id: String,
    pub subject: Option<String>,
    pub labels: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelabelCall {
    pub id: String,
    pub add: BTreeSet<String>,
    pub remove: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct MailboxState {
    messages: Vec<FakeMessage>,
    labels: Vec<Label>,
    label_creates: usize,
    subject_fetches: Vec<String>,
    relabels: Vec<RelabelCall>,
    vanished: HashSet<String>,
    unmovable: HashSet<String>,
    flaky: HashSet<String>,
    list_error: Option<MailError>,
}

/// Mailbox whose messages are listed in insertion order, newest first.
/// Clones share the same mailbox.
#[derive(Debug, Clone, Default)]
pub struct FakeMailbox {
    state: Arc<Mutex<MailboxState>>,
}

impl FakeMailbox {
    /// One inbox message per subject, with ids `m1`, `m2`, ...
    pub fn with_subjects(subjects: &[&str]) -> Self {
        let mailbox = Self::default();
        for (i, subject) in subjects.iter().enumerate() {
            mailbox.push(&format!("m{}", i + 1), Some(subject));
        }
        mailbox
    }

    pub fn push(&self, id: &str, subject: Option<&str>) {
        let mut state = self.state.lock().unwrap();
        state.messages.push(FakeMessage {
            id: id.to_string(),
            subject: subject.map(str::to_string),
            labels: [INBOX_LABEL.to_string()].into_iter().collect(),
        });
    }

    pub fn add_label(&self, id: &str, name: &str) {
        self.state.lock().unwrap().labels.push(Label {
            id: id.to_string(),
            name: name.to_string(),
        });
    }

    /// The message disappears after listing: fetches and relabels fail.
    pub fn vanish(&self, id: &str) {
        self.state.lock().unwrap().vanished.insert(id.to_string());
    }

    /// The message can be read but disappears before it is relabeled.
    pub fn vanish_before_relabel(&self, id: &str) {
        self.state.lock().unwrap().unmovable.insert(id.to_string());
    }

    /// Subject fetches for `id` keep failing with a transient error.
    pub fn make_flaky(&self, id: &str) {
        self.state.lock().unwrap().flaky.insert(id.to_string());
    }

    pub fn fail_listing(&self, err: MailError) {
        self.state.lock().unwrap().list_error = Some(err);
    }

    pub fn labels_of(&self, id: &str) -> BTreeSet<String> {
        let state = self.state.lock().unwrap();
        state
            .messages
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.labels.clone())
            .unwrap_or_default()
    }

    pub fn label_id(&self, name: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .labels
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.id.clone())
    }

    pub fn label_creates(&self) -> usize {
        self.state.lock().unwrap().label_creates
    }

    pub fn relabels(&self) -> Vec<RelabelCall> {
        self.state.lock().unwrap().relabels.clone()
    }

    pub fn subject_fetches(&self) -> Vec<String> {
        self.state.lock().unwrap().subject_fetches.clone()
    }
}

#[async_trait]
impl MailClient for FakeMailbox {
    async fn list_message_ids(
        &self,
        limit: NonZeroU32,
        _ordering: MessageOrdering,
    ) -> Result<Vec<String>, MailError> {
        let state = self.state.lock().unwrap();
        if let Some(err) = &state.list_error {
            return Err(err.clone());
        }
        Ok(state
            .messages
            .iter()
            .take(limit.get() as usize)
            .map(|m| m.id.clone())
            .collect())
    }

    async fn get_subject(&self, id: &str) -> Result<String, MailError> {
        let mut state = self.state.lock().unwrap();
        state.subject_fetches.push(id.to_string());
        if state.flaky.contains(id) {
            return Err(MailError::Transient(format!("get message {}: 503", id)));
        }
        if state.vanished.contains(id) {
            return Err(MailError::NotFound(format!("message {}", id)));
        }
        state
            .messages
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.subject.clone().unwrap_or_else(|| NO_SUBJECT.to_string()))
            .ok_or_else(|| MailError::NotFound(format!("message {}", id)))
    }

    async fn get_or_create_label(&self, name: &str) -> Result<String, MailError> {
        let mut state = self.state.lock().unwrap();
        if let Some(label) = state.labels.iter().find(|l| l.name == name) {
            return Ok(label.id.clone());
        }
        state.label_creates += 1;
        let id = format!("Label_{}", state.labels.len() + 1);
        state.labels.push(Label {
            id: id.clone(),
            name: name.to_string(),
        });
        Ok(id)
    }

    async fn relabel(
        &self,
        id: &str,
        add: &BTreeSet<String>,
        remove: &BTreeSet<String>,
    ) -> Result<(), MailError> {
        let mut state = self.state.lock().unwrap();
        state.relabels.push(RelabelCall {
            id: id.to_string(),
            add: add.clone(),
            remove: remove.clone(),
        });
        if state.vanished.contains(id) || state.unmovable.contains(id) {
            return Err(MailError::NotFound(format!("message {}", id)));
        }
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| MailError::NotFound(format!("message {}", id)))?;
        message.labels.extend(add.iter().cloned());
        message.labels.retain(|l| !remove.contains(l));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PersistenceState {
    stored: Option<Credential>,
    saves: usize,
    corrupt: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryPersistence {
    state: Arc<Mutex<PersistenceState>>,
}

impl MemoryPersistence {
    pub fn with(credential: Credential) -> Self {
        let persistence = Self::default();
        persistence.state.lock().unwrap().stored = Some(credential);
        persistence
    }

    pub fn corrupt() -> Self {
        let persistence = Self::default();
        persistence.state.lock().unwrap().corrupt = true;
        persistence
    }

    pub fn stored(&self) -> Option<Credential> {
        self.state.lock().unwrap().stored.clone()
    }

    pub fn saves(&self) -> usize {
        self.state.lock().unwrap().saves
    }
}

#[async_trait]
impl CredentialPersistence for MemoryPersistence {
    async fn load(&self) -> Result<Option<Credential>, AuthError> {
        let state = self.state.lock().unwrap();
        if state.corrupt {
            return Err(AuthError::CorruptCredential("unreadable test blob".into()));
        }
        Ok(state.stored.clone())
    }

    async fn save(&self, credential: &Credential) -> Result<(), AuthError> {
        let mut state = self.state.lock().unwrap();
        state.stored = Some(credential.clone());
        state.saves += 1;
        state.corrupt = false;
        Ok(())
    }

    async fn clear(&self) -> Result<(), AuthError> {
        let mut state = self.state.lock().unwrap();
        state.stored = None;
        state.corrupt = false;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FlowState {
    consent: Option<Credential>,
    refresh: Option<Credential>,
    consents: usize,
    refreshes: usize,
}

/// OAuth flow with canned answers. Refresh fails unless configured.
#[derive(Debug, Clone, Default)]
pub struct ScriptedFlow {
    state: Arc<Mutex<FlowState>>,
}

impl ScriptedFlow {
    pub fn granting(credential: Credential) -> Self {
        let flow = Self::default();
        flow.state.lock().unwrap().consent = Some(credential);
        flow
    }

    /// Consent is never possible.
    pub fn denying() -> Self {
        Self::default()
    }

    pub fn refreshing_to(self, credential: Credential) -> Self {
        self.state.lock().unwrap().refresh = Some(credential);
        self
    }

    pub fn consents(&self) -> usize {
        self.state.lock().unwrap().consents
    }

    pub fn refreshes(&self) -> usize {
        self.state.lock().unwrap().refreshes
    }
}

#[async_trait]
impl OAuthFlow for ScriptedFlow {
    async fn consent(&self) -> Result<Credential, AuthError> {
        let mut state = self.state.lock().unwrap();
        state.consents += 1;
        state
            .consent
            .clone()
            .ok_or_else(|| AuthError::ConsentUnavailable("no terminal in tests".into()))
    }

    async fn refresh(&self, _credential: &Credential) -> Result<Credential, AuthError> {
        let mut state = self.state.lock().unwrap();
        state.refreshes += 1;
        state
            .refresh
            .clone()
            .ok_or_else(|| AuthError::Refresh("invalid_grant".into()))
    }
}
