use std::collections::BTreeSet;
use std::future::Future;
use std::num::NonZeroU32;

use async_trait::async_trait;

use crate::error::MailError;

/// Order in which message ids are listed.
///
/// Made explicit so callers never rely on a service default by accident.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MessageOrdering {
    #[default]
    MostRecentFirst,
}

/// Operations the triage pipeline needs from a mailbox, scoped to the
/// authenticated account.
#[async_trait]
pub trait MailClient: Send + Sync {
    /// Up to `limit` message ids. An empty mailbox yields an empty list.
    async fn list_message_ids(
        &self,
        limit: NonZeroU32,
        ordering: MessageOrdering,
    ) -> Result<Vec<String>, MailError>;

    /// Subject of a message, or [`crate::models::NO_SUBJECT`] when absent.
    async fn get_subject(&self, id: &str) -> Result<String, MailError>;

    /// Id of the label named `name`, creating it if it does not exist yet.
    async fn get_or_create_label(&self, name: &str) -> Result<String, MailError>;

    /// Adds and removes labels on one message in a single request.
    async fn relabel(
        &self,
        id: &str,
        add: &BTreeSet<String>,
        remove: &BTreeSet<String>,
    ) -> Result<(), MailError>;
}

/// Looks `name` up and creates it only when missing. A create that loses a
/// race with another client surfaces as a conflict and resolves to the label
/// that won.
pub async fn find_or_create_label<F, FindFut, C, CreateFut>(
    name: &str,
    mut find: F,
    create: C,
) -> Result<String, MailError>
where
    F: FnMut() -> FindFut,
    FindFut: Future<Output = Result<Option<String>, MailError>>,
    C: FnOnce() -> CreateFut,
    CreateFut: Future<Output = Result<String, MailError>>,
{
    if let Some(id) = find().await? {
        return Ok(id);
    }
    match create().await {
        Ok(id) => Ok(id),
        Err(MailError::Conflict(_)) => find()
            .await?
            .ok_or_else(|| MailError::NotFound(format!("label {}", name))),
        Err(e) => Err(e),
    }
}
