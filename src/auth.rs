use std::io::IsTerminal;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use yup_oauth2::authenticator_delegate::InstalledFlowDelegate;
use yup_oauth2::authorized_user::AuthorizedUserSecret;
use yup_oauth2::storage::{TokenInfo, TokenStorage};
use yup_oauth2::{
    ApplicationSecret, AuthorizedUserAuthenticator, InstalledFlowAuthenticator,
    InstalledFlowReturnMethod, read_application_secret,
};

use crate::error::AuthError;

pub const SCOPES: &[&str] = &["https://www.googleapis.com/auth/gmail.modify"];

/// Lifetime assumed when the token endpoint does not report one.
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// True once `now + skew` has reached the expiry.
    pub fn is_expired(&self, skew: chrono::Duration) -> bool {
        Utc::now() + skew >= self.expires_at
    }

    pub fn is_refreshable(&self) -> bool {
        self.refresh_token.is_some()
    }
}

/// Where the store is in the credential lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialState {
    NoCredential,
    Valid(Credential),
    Expired(Credential),
    Refreshing,
}

/// Durable home of the credential between runs.
#[async_trait]
pub trait CredentialPersistence: Send + Sync {
    /// `Ok(None)` when nothing has been stored yet.
    async fn load(&self) -> Result<Option<Credential>, AuthError>;
    async fn save(&self, credential: &Credential) -> Result<(), AuthError>;
    async fn clear(&self) -> Result<(), AuthError>;
}

/// Obtains credentials from the authorization server.
#[async_trait]
pub trait OAuthFlow: Send + Sync {
    /// Full interactive consent. May block until the user approves.
    async fn consent(&self) -> Result<Credential, AuthError>;

    /// Exchanges the refresh token of `credential` for a new access token.
    async fn refresh(&self, credential: &Credential) -> Result<Credential, AuthError>;
}

/// Hands out a non-expired credential, refreshing or re-consenting as needed.
///
/// Every successful grant or refresh is persisted before it is returned.
/// Acquisition is serialized so at most one refresh is in flight.
pub struct CredentialStore<P, F> {
    persistence: P,
    flow: F,
    expiry_skew: chrono::Duration,
    state: tokio::sync::Mutex<CredentialState>,
}

impl<P: CredentialPersistence, F: OAuthFlow> CredentialStore<P, F> {
    pub fn new(persistence: P, flow: F) -> Self {
        Self {
            persistence,
            flow,
            expiry_skew: chrono::Duration::seconds(60),
            state: tokio::sync::Mutex::new(CredentialState::NoCredential),
        }
    }

    pub fn with_expiry_skew(mut self, skew: Duration) -> Self {
        self.expiry_skew = chrono::Duration::from_std(skew).unwrap_or(self.expiry_skew);
        self
    }

    #[cfg(test)]
    pub async fn state(&self) -> CredentialState {
        self.state.lock().await.clone()
    }

    pub async fn acquire(&self) -> Result<Credential, AuthError> {
        let mut state = self.state.lock().await;

        if *state == CredentialState::NoCredential {
            if let Some(stored) = self.persistence.load().await? {
                debug!("Loaded stored credential");
                *state = self.classify(stored);
            }
        }

        match std::mem::replace(&mut *state, CredentialState::NoCredential) {
            CredentialState::Valid(credential) if !credential.is_expired(self.expiry_skew) => {
                *state = CredentialState::Valid(credential.clone());
                Ok(credential)
            }
            CredentialState::Valid(expired) | CredentialState::Expired(expired) => {
                if expired.is_refreshable() {
                    *state = CredentialState::Refreshing;
                    match self.flow.refresh(&expired).await {
                        Ok(fresh) => {
                            info!("Refreshed access token");
                            let fresh = Credential {
                                refresh_token: fresh.refresh_token.or(expired.refresh_token),
                                ..fresh
                            };
                            return self.commit(&mut state, fresh).await;
                        }
                        Err(e) => warn!(error = %e, "Token refresh failed, falling back to consent"),
                    }
                }
                *state = CredentialState::Expired(expired);
                self.consent(&mut state).await
            }
            CredentialState::NoCredential | CredentialState::Refreshing => {
                self.consent(&mut state).await
            }
        }
    }

    /// Forgets the credential in memory and in durable storage.
    pub async fn reset(&self) -> Result<(), AuthError> {
        let mut state = self.state.lock().await;
        self.persistence.clear().await?;
        *state = CredentialState::NoCredential;
        Ok(())
    }

    fn classify(&self, credential: Credential) -> CredentialState {
        if credential.is_expired(self.expiry_skew) {
            CredentialState::Expired(credential)
        } else {
            CredentialState::Valid(credential)
        }
    }

    async fn consent(&self, state: &mut CredentialState) -> Result<Credential, AuthError> {
        info!("Starting interactive consent");
        let granted = self.flow.consent().await?;
        self.commit(state, granted).await
    }

    async fn commit(
        &self,
        state: &mut CredentialState,
        credential: Credential,
    ) -> Result<Credential, AuthError> {
        if let Err(e) = self.persistence.save(&credential).await {
            *state = CredentialState::NoCredential;
            return Err(e);
        }
        *state = CredentialState::Valid(credential.clone());
        Ok(credential)
    }
}

/// Google's installed-application flow: browser consent with a local
/// redirect listener, refresh through the authorized-user grant.
pub struct InstalledAppFlow {
    secret: ApplicationSecret,
    interactive: bool,
    consent_timeout: Duration,
}

impl InstalledAppFlow {
    pub fn new(secret: ApplicationSecret, interactive: bool, consent_timeout: Duration) -> Self {
        Self {
            secret,
            interactive,
            consent_timeout,
        }
    }

    pub async fn load_secret<P: AsRef<Path>>(path: P) -> Result<ApplicationSecret, AuthError> {
        read_application_secret(path.as_ref()).await.map_err(|e| {
            AuthError::Consent(format!(
                "failed to read client secret {}: {}",
                path.as_ref().display(),
                e
            ))
        })
    }
}

#[async_trait]
impl OAuthFlow for InstalledAppFlow {
    async fn consent(&self) -> Result<Credential, AuthError> {
        if !self.interactive {
            return Err(AuthError::ConsentUnavailable(
                "interactive consent is disabled".to_string(),
            ));
        }
        if !std::io::stderr().is_terminal() {
            return Err(AuthError::ConsentUnavailable(
                "no terminal to present the consent URL on".to_string(),
            ));
        }

        let captured = Arc::new(Mutex::new(None));
        let auth = InstalledFlowAuthenticator::builder(
            self.secret.clone(),
            InstalledFlowReturnMethod::HTTPRedirect,
        )
        .with_storage(Box::new(CaptureStorage {
            slot: captured.clone(),
        }))
        .flow_delegate(Box::new(BrowserDelegate))
        .build()
        .await
        .map_err(|e| AuthError::Consent(format!("failed to build authenticator: {}", e)))?;

        let token = tokio::time::timeout(self.consent_timeout, auth.token(SCOPES))
            .await
            .map_err(|_| AuthError::ConsentTimedOut(self.consent_timeout))?
            .map_err(|e| AuthError::Consent(e.to_string()))?;

        let info = captured.lock().ok().and_then(|mut slot| slot.take());
        let access_token = token
            .token()
            .ok_or_else(|| AuthError::Consent("no access token was granted".to_string()))?
            .to_string();
        let expires_at = token
            .expiration_time()
            .map(|t| t.unix_timestamp())
            .or_else(|| {
                info.as_ref()
                    .and_then(|i| i.expires_at.map(|t| t.unix_timestamp()))
            });

        Ok(Credential {
            access_token,
            refresh_token: info.and_then(|i| i.refresh_token),
            expires_at: expiry_from_unix(expires_at),
        })
    }

    async fn refresh(&self, credential: &Credential) -> Result<Credential, AuthError> {
        let refresh_token = credential
            .refresh_token
            .clone()
            .ok_or_else(|| AuthError::Refresh("credential has no refresh token".to_string()))?;

        let secret = AuthorizedUserSecret {
            client_id: self.secret.client_id.clone(),
            client_secret: self.secret.client_secret.clone(),
            refresh_token,
            key_type: "authorized_user".to_string(),
        };
        let auth = AuthorizedUserAuthenticator::builder(secret)
            .build()
            .await
            .map_err(|e| AuthError::Refresh(format!("failed to build authenticator: {}", e)))?;
        let token = auth
            .token(SCOPES)
            .await
            .map_err(|e| AuthError::Refresh(e.to_string()))?;

        let access_token = token
            .token()
            .ok_or_else(|| AuthError::Refresh("no access token was returned".to_string()))?
            .to_string();

        Ok(Credential {
            access_token,
            refresh_token: None,
            expires_at: expiry_from_unix(token.expiration_time().map(|t| t.unix_timestamp())),
        })
    }
}

fn expiry_from_unix(seconds: Option<i64>) -> DateTime<Utc> {
    seconds
        .and_then(|s| DateTime::from_timestamp(s, 0))
        .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS))
}

/// Keeps the token info the installed flow hands to its storage so the
/// refresh token can be moved into our own persistence.
struct CaptureStorage {
    slot: Arc<Mutex<Option<TokenInfo>>>,
}

#[async_trait]
impl TokenStorage for CaptureStorage {
    async fn set(&self, _scopes: &[&str], token: TokenInfo) -> anyhow::Result<()> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| anyhow::anyhow!("token slot poisoned"))?;
        *slot = Some(token);
        Ok(())
    }

    async fn get(&self, _scopes: &[&str]) -> Option<TokenInfo> {
        None
    }
}

struct BrowserDelegate;

impl InstalledFlowDelegate for BrowserDelegate {
    fn present_user_url<'a>(
        &'a self,
        url: &'a str,
        need_code: bool,
    ) -> BoxFuture<'a, Result<String, String>> {
        Box::pin(async move {
            eprintln!("Authorize gmail-triage by visiting:\n\n  {}\n", url);
            if let Err(e) = open::that(url) {
                warn!(error = %e, "Could not launch a browser");
            }
            if need_code {
                Err("manual code entry is not supported".to_string())
            } else {
                Ok(String::new())
            }
        })
    }
}
