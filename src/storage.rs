use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use keyring::Entry;
use tokio::io::AsyncWriteExt;

use crate::auth::{Credential, CredentialPersistence};
use crate::error::AuthError;

const APP_NAME: &str = "gmail-triage";
const TOKEN_KEY: &str = "gmail_token";

/// JSON token file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl CredentialPersistence for FileTokenStore {
    async fn load(&self) -> Result<Option<Credential>, AuthError> {
        let serialized = match tokio::fs::read_to_string(&self.path).await {
            Ok(s) => s,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(AuthError::CorruptCredential(format!(
                    "{}: {}",
                    self.path.display(),
                    e
                )));
            }
        };
        serde_json::from_str(&serialized)
            .map(Some)
            .map_err(|e| AuthError::CorruptCredential(format!("{}: {}", self.path.display(), e)))
    }

    async fn save(&self, credential: &Credential) -> Result<(), AuthError> {
        let serialized = serde_json::to_vec_pretty(credential)
            .map_err(|e| AuthError::Persist(format!("failed to serialize credential: {}", e)))?;
        let temp = self.temp_path();
        let persist_err = |e: std::io::Error| AuthError::Persist(format!("{}: {}", temp.display(), e));

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&temp).await.map_err(persist_err)?;
        file.write_all(&serialized).await.map_err(persist_err)?;
        file.sync_all().await.map_err(persist_err)?;
        drop(file);

        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| AuthError::Persist(format!("{}: {}", self.path.display(), e)))
    }

    async fn clear(&self) -> Result<(), AuthError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AuthError::Persist(format!("{}: {}", self.path.display(), e))),
        }
    }
}

/// Credential kept in the OS keyring.
pub struct RingStorage;

impl RingStorage {
    fn entry() -> Result<Entry, AuthError> {
        Entry::new(APP_NAME, TOKEN_KEY)
            .map_err(|e| AuthError::Persist(format!("Keyring error: {}", e)))
    }
}

#[async_trait]
impl CredentialPersistence for RingStorage {
    async fn load(&self) -> Result<Option<Credential>, AuthError> {
        let entry = Self::entry()?;
        match entry.get_password() {
            Ok(serialized) => serde_json::from_str(&serialized)
                .map(Some)
                .map_err(|e| AuthError::CorruptCredential(format!("keyring entry: {}", e))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(AuthError::CorruptCredential(format!("Keyring error: {}", e))),
        }
    }

    async fn save(&self, credential: &Credential) -> Result<(), AuthError> {
        let entry = Self::entry()?;
        let serialized = serde_json::to_string(credential)
            .map_err(|e| AuthError::Persist(format!("failed to serialize credential: {}", e)))?;
        entry
            .set_password(&serialized)
            .map_err(|e| AuthError::Persist(format!("Keyring error: {}", e)))
    }

    async fn clear(&self) -> Result<(), AuthError> {
        let entry = Self::entry()?;
        match entry.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(AuthError::Persist(format!("Keyring error: {}", e))),
        }
    }
}

/// The persistence backend chosen in settings.
pub enum TokenStore {
    File(FileTokenStore),
    Keyring(RingStorage),
}

#[async_trait]
impl CredentialPersistence for TokenStore {
    async fn load(&self) -> Result<Option<Credential>, AuthError> {
        match self {
            TokenStore::File(store) => store.load().await,
            TokenStore::Keyring(store) => store.load().await,
        }
    }

    async fn save(&self, credential: &Credential) -> Result<(), AuthError> {
        match self {
            TokenStore::File(store) => store.save(credential).await,
            TokenStore::Keyring(store) => store.save(credential).await,
        }
    }

    async fn clear(&self) -> Result<(), AuthError> {
        match self {
            TokenStore::File(store) => store.clear().await,
            TokenStore::Keyring(store) => store.clear().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::credential_expiring_in;

    #[tokio::test]
    async fn test_missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("token.json"));
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_round_trip_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        let store = FileTokenStore::new(&path);
        let credential = credential_expiring_in("abc", 3600);

        store.save(&credential).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(credential.clone()));
        assert!(!dir.path().join("token.json.tmp").exists());

        let replaced = credential_expiring_in("def", 7200);
        store.save(&replaced).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(replaced));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = FileTokenStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, AuthError::CorruptCredential(_)));
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("token.json"));
        store.save(&credential_expiring_in("abc", 60)).await.unwrap();

        store.clear().await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_token_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        FileTokenStore::new(&path)
            .save(&credential_expiring_in("abc", 60))
            .await
            .unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
