use std::collections::BTreeSet;
use std::num::NonZeroU32;

use async_trait::async_trait;
use google_gmail1::Gmail;
use google_gmail1::api::{Label, ModifyMessageRequest};
use hyper::client::HttpConnector;
use hyper_rustls::HttpsConnector;
use tracing::debug;

use crate::auth::Credential;
use crate::error::MailError;
use crate::mail::{MailClient, MessageOrdering, find_or_create_label};
use crate::models::NO_SUBJECT;
use crate::retry::RetryPolicy;

const USER_ID: &str = "me";

/// Largest page `messages.list` accepts.
const MAX_PAGE_SIZE: usize = 500;

#[derive(Clone)]
pub struct GmailClient {
    hub: Gmail<HttpsConnector<HttpConnector>>,
    retry: RetryPolicy,
    source_label: Option<String>,
}

impl GmailClient {
    pub fn new(
        hub: Gmail<HttpsConnector<HttpConnector>>,
        retry: RetryPolicy,
        source_label: Option<String>,
    ) -> Self {
        Self {
            hub,
            retry,
            source_label,
        }
    }

    /// Builds a hub that authorizes every request with the credential's
    /// access token.
    pub fn connect(
        credential: &Credential,
        retry: RetryPolicy,
        source_label: Option<String>,
    ) -> Result<Self, MailError> {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| MailError::Service(format!("failed to load native roots: {}", e)))?
            .https_only()
            .enable_http1()
            .build();
        let hub = Gmail::new(
            hyper::Client::builder().build(connector),
            credential.access_token.clone(),
        );
        Ok(Self::new(hub, retry, source_label))
    }

    async fn list_page(
        &self,
        max_results: u32,
        page_token: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>), MailError> {
        let mut req = self
            .hub
            .users()
            .messages_list(USER_ID)
            .max_results(max_results);

        if let Some(label_id) = &self.source_label {
            req = req.add_label_ids(label_id);
        }

        if let Some(token) = page_token {
            req = req.page_token(token);
        }

        let (_, message_list) = req
            .doit()
            .await
            .map_err(|e| map_api_error(e, "list messages"))?;

        let ids = message_list
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| m.id)
            .collect();

        Ok((ids, message_list.next_page_token))
    }

    async fn fetch_subject(&self, id: &str) -> Result<String, MailError> {
        let (_, msg) = self
            .hub
            .users()
            .messages_get(USER_ID, id)
            .format("metadata")
            .add_metadata_headers("Subject")
            .doit()
            .await
            .map_err(|e| map_api_error(e, &format!("get message {}", id)))?;

        let subject = msg
            .payload
            .and_then(|payload| payload.headers)
            .unwrap_or_default()
            .into_iter()
            .find(|h| h.name.as_deref() == Some("Subject"))
            .and_then(|h| h.value);

        Ok(subject.unwrap_or_else(|| NO_SUBJECT.to_string()))
    }

    async fn find_label(&self, name: &str) -> Result<Option<String>, MailError> {
        let labels = self
            .retry
            .run("labels.list", || self.list_labels())
            .await?;
        Ok(labels
            .into_iter()
            .find(|l| l.name.as_deref() == Some(name))
            .and_then(|l| l.id))
    }

    async fn list_labels(&self) -> Result<Vec<Label>, MailError> {
        let (_, label_list) = self
            .hub
            .users()
            .labels_list(USER_ID)
            .doit()
            .await
            .map_err(|e| map_api_error(e, "list labels"))?;
        Ok(label_list.labels.unwrap_or_default())
    }

    async fn create_label(&self, name: &str) -> Result<String, MailError> {
        let label = Label {
            name: Some(name.to_string()),
            label_list_visibility: Some("labelShow".to_string()),
            message_list_visibility: Some("show".to_string()),
            ..Default::default()
        };
        let (_, created) = self
            .hub
            .users()
            .labels_create(label, USER_ID)
            .doit()
            .await
            .map_err(|e| map_api_error(e, &format!("create label {}", name)))?;
        created
            .id
            .ok_or_else(|| MailError::Service(format!("label {} was created without an id", name)))
    }

    async fn modify_labels(
        &self,
        id: &str,
        add: &BTreeSet<String>,
        remove: &BTreeSet<String>,
    ) -> Result<(), MailError> {
        let req = ModifyMessageRequest {
            add_label_ids: non_empty(add),
            remove_label_ids: non_empty(remove),
        };
        self.hub
            .users()
            .messages_modify(req, USER_ID, id)
            .doit()
            .await
            .map_err(|e| map_api_error(e, &format!("modify message {}", id)))?;
        Ok(())
    }
}

#[async_trait]
impl MailClient for GmailClient {
    async fn list_message_ids(
        &self,
        limit: NonZeroU32,
        ordering: MessageOrdering,
    ) -> Result<Vec<String>, MailError> {
        // Gmail only lists newest first.
        let MessageOrdering::MostRecentFirst = ordering;

        let limit = limit.get() as usize;
        let mut ids = Vec::with_capacity(limit.min(MAX_PAGE_SIZE));
        let mut page_token: Option<String> = None;

        loop {
            let remaining = (limit - ids.len()).min(MAX_PAGE_SIZE) as u32;
            let token = page_token.take();
            let token = token.as_deref();
            let (page, next_page_token) = self
                .retry
                .run("messages.list", || self.list_page(remaining, token))
                .await?;

            debug!(
                fetched = page.len(),
                more = next_page_token.is_some(),
                "Listed message page"
            );
            ids.extend(page);

            match next_page_token {
                Some(next) if ids.len() < limit => page_token = Some(next),
                _ => break,
            }
        }

        ids.truncate(limit);
        Ok(ids)
    }

    async fn get_subject(&self, id: &str) -> Result<String, MailError> {
        self.retry
            .run("messages.get", || self.fetch_subject(id))
            .await
    }

    async fn get_or_create_label(&self, name: &str) -> Result<String, MailError> {
        find_or_create_label(
            name,
            || self.find_label(name),
            || {
                debug!(label = name, "Creating label");
                self.retry
                    .run("labels.create", || self.create_label(name))
            },
        )
        .await
    }

    async fn relabel(
        &self,
        id: &str,
        add: &BTreeSet<String>,
        remove: &BTreeSet<String>,
    ) -> Result<(), MailError> {
        debug!(message = id, ?add, ?remove, "Modifying labels");
        self.retry
            .run("messages.modify", || self.modify_labels(id, add, remove))
            .await
    }
}

fn non_empty(ids: &BTreeSet<String>) -> Option<Vec<String>> {
    if ids.is_empty() {
        None
    } else {
        Some(ids.iter().cloned().collect())
    }
}

/// Maps a Gmail API failure onto the mail error taxonomy.
fn map_api_error(err: google_gmail1::Error, action: &str) -> MailError {
    match err {
        google_gmail1::Error::HttpError(e) => MailError::Transient(format!("{}: {}", action, e)),
        google_gmail1::Error::MissingToken(e) => {
            MailError::Unauthorized(format!("{}: {}", action, e))
        }
        google_gmail1::Error::BadRequest(value) => {
            let error = &value["error"];
            let code = error["code"].as_u64().and_then(|c| u16::try_from(c).ok());
            let reason = error["errors"][0]["reason"].as_str();
            let message = error["message"].as_str().unwrap_or("bad request");
            match code {
                Some(code) => classify_status(code, reason, format!("{}: {}", action, message)),
                None => MailError::Service(format!("{}: {}", action, value)),
            }
        }
        google_gmail1::Error::Failure(response) => {
            let status = response.status();
            classify_status(status.as_u16(), None, format!("{}: HTTP {}", action, status))
        }
        other => MailError::Service(format!("{}: {}", action, other)),
    }
}

fn classify_status(code: u16, reason: Option<&str>, detail: String) -> MailError {
    match code {
        401 => MailError::Unauthorized(detail),
        404 => MailError::NotFound(detail),
        409 => MailError::Conflict(detail),
        429 => MailError::Transient(detail),
        403 if matches!(
            reason,
            Some("rateLimitExceeded") | Some("userRateLimitExceeded")
        ) =>
        {
            MailError::Transient(detail)
        }
        500..=599 => MailError::Transient(detail),
        _ => MailError::Service(detail),
    }
}
