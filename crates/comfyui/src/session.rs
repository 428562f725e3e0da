//! Client session identity.
//!
//! The backend addresses realtime messages by a client id. The id is
//! assigned by the server on the first `status` frame (or returned by the
//! authentication endpoint), kept in-process, and persisted to a durable
//! per-window [`IdentityStore`] so a restarted client for the same window
//! reuses it. A different window key starts without an identity.
//!
//! [`SessionIdentity`] also holds the credentials attached to every
//! request and to the socket URL.

use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Errors from reading or writing a persisted identity.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Identity store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Identity record is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Durable storage for the client id of one window.
pub trait IdentityStore: Send + Sync {
    /// Load the persisted client id, if any.
    fn load(&self) -> Result<Option<String>, IdentityError>;

    /// Persist the client id, replacing any previous value.
    fn save(&self, client_id: &str) -> Result<(), IdentityError>;
}

/// Process-local store; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    value: RwLock<Option<String>>,
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self) -> Result<Option<String>, IdentityError> {
        Ok(self
            .value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, client_id: &str) -> Result<(), IdentityError> {
        *self.value.write().unwrap_or_else(PoisonError::into_inner) = Some(client_id.to_string());
        Ok(())
    }
}

/// On-disk record written by [`FileIdentityStore`].
#[derive(Debug, Serialize, Deserialize)]
struct IdentityRecord {
    client_id: String,
    updated_at: DateTime<Utc>,
}

/// Stores one JSON file per window key inside a directory.
#[derive(Debug, Clone)]
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    /// * `dir`        - directory holding identity files (created on save).
    /// * `window_key` - names the window whose identity this store holds.
    pub fn new(dir: impl AsRef<Path>, window_key: &str) -> Self {
        let file_name: String = window_key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        Self {
            path: dir.as_ref().join(format!("{file_name}.json")),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IdentityStore for FileIdentityStore {
    fn load(&self) -> Result<Option<String>, IdentityError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: IdentityRecord = serde_json::from_str(&raw)?;
        Ok(Some(record.client_id))
    }

    fn save(&self, client_id: &str) -> Result<(), IdentityError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let record = IdentityRecord {
            client_id: client_id.to_string(),
            updated_at: Utc::now(),
        };
        std::fs::write(&self.path, serde_json::to_vec_pretty(&record)?)?;
        Ok(())
    }
}

/// Authentication material attached to outgoing requests.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub user_token: Option<String>,
    pub user_id: Option<String>,
}

/// The client's identity as seen by the backend.
pub struct SessionIdentity {
    /// Id assigned during this process, if any.
    assigned: RwLock<Option<String>>,
    /// Id restored from the store at construction.
    restored: Option<String>,
    credentials: RwLock<Credentials>,
    store: Box<dyn IdentityStore>,
}

impl SessionIdentity {
    /// Create an identity backed by `store`, restoring any persisted id.
    ///
    /// A store that cannot be read is treated as empty.
    pub fn new(store: Box<dyn IdentityStore>) -> Self {
        let restored = match store.load() {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to restore client identity");
                None
            }
        };
        if let Some(ref id) = restored {
            tracing::debug!(client_id = %id, "Restored client identity");
        }
        Self {
            assigned: RwLock::new(None),
            restored,
            credentials: RwLock::new(Credentials::default()),
            store,
        }
    }

    /// Identity kept only in memory.
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryIdentityStore::default()))
    }

    /// The current client id: the one assigned in this process, else the
    /// restored one.
    pub fn client_id(&self) -> Option<String> {
        self.assigned
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .or_else(|| self.restored.clone())
    }

    /// Adopt a server-assigned client id and persist it.
    ///
    /// The in-process id is updated even when persisting fails.
    pub fn adopt(&self, client_id: &str) -> Result<(), IdentityError> {
        {
            let mut assigned = self.assigned.write().unwrap_or_else(PoisonError::into_inner);
            if assigned.as_deref() == Some(client_id) {
                return Ok(());
            }
            *assigned = Some(client_id.to_string());
        }
        tracing::info!(client_id = %client_id, "Adopted client identity");
        self.store.save(client_id)
    }

    /// Adopt `client_id` only when no identity is known yet.
    ///
    /// Returns whether the id was adopted.
    pub fn adopt_if_absent(&self, client_id: &str) -> Result<bool, IdentityError> {
        if self.client_id().is_some() {
            return Ok(false);
        }
        self.adopt(client_id)?;
        Ok(true)
    }

    /// Snapshot of the current credentials.
    pub fn credentials(&self) -> Credentials {
        self.credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Set the user token sent with requests and the socket handshake.
    pub fn set_user_token(&self, token: Option<String>) {
        self.credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .user_token = token;
    }

    /// Set the user id returned by authentication.
    pub fn set_user_id(&self, user_id: Option<String>) {
        self.credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .user_id = user_id;
    }
}

impl std::fmt::Debug for SessionIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionIdentity")
            .field("client_id", &self.client_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_identity_is_unknown() {
        let identity = SessionIdentity::in_memory();
        assert!(identity.client_id().is_none());
    }

    #[test]
    fn adopted_id_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let identity = SessionIdentity::new(Box::new(FileIdentityStore::new(dir.path(), "tab-1")));
        identity.adopt("sid-1").unwrap();
        assert_eq!(identity.client_id().as_deref(), Some("sid-1"));

        // A restarted client for the same window picks it up.
        let restored = SessionIdentity::new(Box::new(FileIdentityStore::new(dir.path(), "tab-1")));
        assert_eq!(restored.client_id().as_deref(), Some("sid-1"));
    }

    #[test]
    fn other_window_starts_without_identity() {
        let dir = tempfile::tempdir().unwrap();
        let identity = SessionIdentity::new(Box::new(FileIdentityStore::new(dir.path(), "tab-1")));
        identity.adopt("sid-1").unwrap();

        let other = SessionIdentity::new(Box::new(FileIdentityStore::new(dir.path(), "tab-2")));
        assert!(other.client_id().is_none());
    }

    #[test]
    fn assigned_id_overrides_restored_id() {
        let store = MemoryIdentityStore::default();
        store.save("old").unwrap();
        let identity = SessionIdentity::new(Box::new(store));
        assert_eq!(identity.client_id().as_deref(), Some("old"));

        identity.adopt("new").unwrap();
        assert_eq!(identity.client_id().as_deref(), Some("new"));
    }

    #[test]
    fn adopt_if_absent_keeps_existing_identity() {
        let identity = SessionIdentity::in_memory();
        assert!(identity.adopt_if_absent("first").unwrap());
        assert!(!identity.adopt_if_absent("second").unwrap());
        assert_eq!(identity.client_id().as_deref(), Some("first"));
    }

    #[test]
    fn corrupt_record_is_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileIdentityStore::new(dir.path(), "tab");
        std::fs::write(store.path(), "not json").unwrap();
        assert!(store.load().is_err());

        let identity = SessionIdentity::new(Box::new(store));
        assert!(identity.client_id().is_none());
    }

    #[test]
    fn window_key_is_sanitised_into_file_name() {
        let store = FileIdentityStore::new("/tmp/ids", "../evil tab");
        assert_eq!(store.path(), Path::new("/tmp/ids/___evil_tab.json"));
    }

    #[test]
    fn credentials_round_trip() {
        let identity = SessionIdentity::in_memory();
        identity.set_user_token(Some("tok".into()));
        identity.set_user_id(Some("u1".into()));
        let creds = identity.credentials();
        assert_eq!(creds.user_token.as_deref(), Some("tok"));
        assert_eq!(creds.user_id.as_deref(), Some("u1"));
    }
}
