//! Local file-based state storage backend.
//!
//! State lives in `<dir>/state.json` with the lock beside it in
//! `<dir>/state.lock`. The lock file is created with `create_new`, so two
//! processes racing for it cannot both succeed.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{Result, StateError, TopoformError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, LockToken};
use super::store::{LockAttempt, StateScope, StateStore, encode_next, lock_lost};
use super::types::StateSnapshot;

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Directory holding the state and lock files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// Project and environment this store serves.
    scope: StateScope,
}

fn backend_err(what: &str, e: &std::io::Error) -> TopoformError {
    TopoformError::State(StateError::backend(format!("{what}: {e}")))
}

impl LocalStateStore {
    /// Creates a local state store rooted at the given directory.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>, scope: StateScope) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
            scope,
        }
    }

    /// Returns the state file path.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir)
                .await
                .map_err(|e| backend_err("Failed to create state directory", &e))?;
        }
        Ok(())
    }

    async fn read_state(&self) -> Result<Option<StateSnapshot>> {
        match fs::read_to_string(&self.state_path).await {
            Ok(content) => self.scope.decode(&content).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TopoformError::State(StateError::Corrupted {
                message: format!("Failed to read state file: {e}"),
            })),
        }
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(&self.lock_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(backend_err("Failed to read lock file", &e)),
        };

        match serde_json::from_str(&content) {
            Ok(info) => Ok(Some(info)),
            Err(e) => {
                // Another process may be between create and write.
                debug!("Unreadable lock file: {e}");
                Ok(Some(LockInfo::new("unknown", "unknown")))
            }
        }
    }

    /// Creates the lock file, failing if it already exists.
    async fn create_lock_file(&self, info: &LockInfo) -> Result<bool> {
        let content = serde_json::to_string_pretty(info).map_err(|e| {
            TopoformError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;

        let opened = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await;

        let mut file = match opened {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                return Err(TopoformError::State(StateError::LockFailed {
                    message: format!("Failed to create lock file: {e}"),
                }));
            }
        };

        file.write_all(content.as_bytes()).await.map_err(|e| {
            TopoformError::State(StateError::LockFailed {
                message: format!("Failed to write lock file: {e}"),
            })
        })?;
        file.sync_all().await.map_err(|e| {
            TopoformError::State(StateError::LockFailed {
                message: format!("Failed to sync lock file: {e}"),
            })
        })?;

        Ok(true)
    }

    /// Replaces the lock file contents through a temp file and rename.
    async fn rewrite_lock_file(&self, info: &LockInfo) -> Result<()> {
        let content = serde_json::to_string_pretty(info).map_err(|e| {
            TopoformError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;
        let temp_path = self.lock_path.with_extension("lock.tmp");
        fs::write(&temp_path, content)
            .await
            .map_err(|e| backend_err("Failed to write lock file", &e))?;
        fs::rename(&temp_path, &self.lock_path)
            .await
            .map_err(|e| backend_err("Failed to replace lock file", &e))
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TopoformError::State(StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            })),
        }
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn init(&self) -> Result<()> {
        self.ensure_dir().await
    }

    async fn load(&self) -> Result<StateSnapshot> {
        if let Some(snapshot) = self.read_state().await? {
            debug!(
                "Loaded state serial {} from {}",
                snapshot.serial,
                self.state_path.display()
            );
            return Ok(snapshot);
        }
        debug!("State file does not exist: {}", self.state_path.display());
        Ok(self.scope.empty_snapshot())
    }

    async fn commit(&self, snapshot: &StateSnapshot, token: &LockToken) -> Result<u64> {
        match self.read_lock_file().await? {
            Some(lock) if lock.matches(token) => {}
            _ => return Err(lock_lost(token)),
        }

        let stored = self.read_state().await?;
        StateScope::check_commit(stored.as_ref(), snapshot)?;

        self.ensure_dir().await?;
        let (serial, content) = encode_next(snapshot)?;

        // Write to a temporary file first, then rename for atomicity
        let temp_path = self.state_path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| backend_err("Failed to create temp state file", &e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| backend_err("Failed to write state file", &e))?;
        file.sync_all()
            .await
            .map_err(|e| backend_err("Failed to sync state file", &e))?;

        fs::rename(&temp_path, &self.state_path)
            .await
            .map_err(|e| backend_err("Failed to rename state file", &e))?;

        debug!("Committed state serial {serial}");
        Ok(serial)
    }

    async fn try_lock(&self, holder: &str, operation: &str) -> Result<LockAttempt> {
        self.ensure_dir().await?;
        let info = LockInfo::new(holder, operation);

        if self.create_lock_file(&info).await? {
            info!(
                "Acquired state lock: {} (expires in {}s)",
                info.lock_id, LOCK_EXPIRY_SECS
            );
            return Ok(LockAttempt::Acquired(info));
        }

        let Some(existing) = self.read_lock_file().await? else {
            // Released between our attempt and the read.
            return Ok(LockAttempt::Held(LockInfo::new("unknown", "unknown")));
        };

        if !existing.is_expired() {
            return Ok(LockAttempt::Held(existing));
        }

        warn!(
            "Taking over expired lock held by {} since {}",
            existing.holder, existing.acquired_at
        );
        self.delete_lock_file().await?;

        if self.create_lock_file(&info).await? {
            info!("Acquired state lock: {}", info.lock_id);
            Ok(LockAttempt::Acquired(info))
        } else {
            let current = self.read_lock_file().await?.unwrap_or(existing);
            Ok(LockAttempt::Held(current))
        }
    }

    async fn renew_lock(&self, token: &LockToken) -> Result<LockInfo> {
        let Some(mut current) = self.read_lock_file().await? else {
            return Err(lock_lost(token));
        };
        if !current.matches(token) {
            return Err(lock_lost(token));
        }

        current.refresh();
        self.rewrite_lock_file(&current).await?;
        debug!("Renewed state lock {} until {}", current.lock_id, current.expires_at);
        Ok(current)
    }

    async fn release_lock(&self, token: &LockToken) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.matches(token) {
                self.delete_lock_file().await?;
                info!("Released state lock: {}", token.lock_id());
            } else {
                debug!(
                    "Lock ID mismatch: expected {}, found {}",
                    token.lock_id(),
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<Option<LockInfo>> {
        let existing = self.read_lock_file().await?;
        self.delete_lock_file().await?;
        if let Some(info) = &existing {
            warn!("Force-removed lock held by {}", info.holder);
        }
        Ok(existing)
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::new(
            temp_dir.path().join("dev"),
            StateScope::new("shop", "dev"),
        );
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_load_empty() {
        let (store, _temp) = create_test_store();

        let state = store.load().await.expect("Load should not fail");
        assert_eq!(state.serial, 0);
        assert!(state.is_empty());
        assert_eq!(state.project, "shop");
    }

    #[tokio::test]
    async fn test_commit_increments_serial() {
        let (store, _temp) = create_test_store();
        store.init().await.expect("init");

        let token = store
            .acquire_lock("test", "apply", Duration::from_secs(1))
            .await
            .expect("Failed to acquire lock");

        let mut state = store.load().await.expect("load");
        state.serial = store.commit(&state, &token).await.expect("first commit");
        assert_eq!(state.serial, 1);
        state.serial = store.commit(&state, &token).await.expect("second commit");
        assert_eq!(state.serial, 2);

        let loaded = store.load().await.expect("load");
        assert_eq!(loaded.serial, 2);
        assert_eq!(loaded.lineage, state.lineage);
    }

    #[tokio::test]
    async fn test_stale_commit_conflicts() {
        let (store, _temp) = create_test_store();
        let token = store
            .acquire_lock("test", "apply", Duration::from_secs(1))
            .await
            .expect("lock");

        let stale = store.load().await.expect("load");
        store.commit(&stale, &token).await.expect("commit");

        let err = store.commit(&stale, &token).await.expect_err("stale");
        assert!(matches!(err, TopoformError::State(StateError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_commit_requires_lock() {
        let (store, _temp) = create_test_store();
        let token = store
            .acquire_lock("test", "apply", Duration::from_secs(1))
            .await
            .expect("lock");
        store.release_lock(&token).await.expect("release");

        let state = store.load().await.expect("load");
        let err = store.commit(&state, &token).await.expect_err("unlocked");
        assert!(matches!(err, TopoformError::State(StateError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let token = store
            .acquire_lock("test-holder", "apply", Duration::from_secs(1))
            .await
            .expect("Failed to acquire lock");

        let info = store.lock_info().await.expect("lock info").expect("locked");
        assert_eq!(info.holder, "test-holder");

        store.release_lock(&token).await.expect("Failed to release lock");
        assert!(store.lock_info().await.expect("lock info").is_none());
    }

    #[tokio::test]
    async fn test_lock_timeout() {
        let (store, _temp) = create_test_store();

        let _held = store
            .acquire_lock("holder-1", "apply", Duration::from_secs(1))
            .await
            .expect("Failed to acquire first lock");

        let err = store
            .acquire_lock("holder-2", "apply", Duration::from_millis(250))
            .await
            .expect_err("second lock");
        match err {
            TopoformError::State(StateError::LockTimeout { holder, .. }) => {
                assert_eq!(holder, "holder-1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let (store, _temp) = create_test_store();
        store.init().await.expect("init");

        let mut stale = LockInfo::new("crashed", "apply");
        stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(5);
        assert!(store.create_lock_file(&stale).await.expect("write lock"));

        let token = store
            .acquire_lock("fresh", "apply", Duration::from_millis(100))
            .await
            .expect("takeover");
        assert_eq!(token.holder(), "fresh");
    }

    #[tokio::test]
    async fn test_force_unlock() {
        let (store, _temp) = create_test_store();
        let _token = store
            .acquire_lock("stuck", "apply", Duration::from_secs(1))
            .await
            .expect("lock");

        let removed = store.force_unlock().await.expect("force unlock");
        assert_eq!(removed.map(|l| l.holder), Some(String::from("stuck")));
        assert!(store.lock_info().await.expect("info").is_none());
    }

    #[tokio::test]
    async fn test_renew_lock_extends_expiry() {
        let (store, _temp) = create_test_store();
        let token = store
            .acquire_lock("holder-1", "apply", Duration::from_secs(1))
            .await
            .expect("lock");

        // Age the lock on disk so that only a renewal keeps it alive.
        let mut aged = store.lock_info().await.expect("info").expect("held");
        aged.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        store.rewrite_lock_file(&aged).await.expect("rewrite");
        assert!(store.lock_info().await.expect("info").expect("held").is_expired());

        let renewed = store.renew_lock(&token).await.expect("renew");
        assert!(!renewed.is_expired());
        assert_eq!(renewed.lock_id, token.lock_id());

        let competing = store
            .acquire_lock("holder-2", "apply", Duration::from_millis(200))
            .await;
        assert!(competing.is_err());
    }

    #[tokio::test]
    async fn test_renew_lock_after_takeover_fails() {
        let (store, _temp) = create_test_store();
        let token = store
            .acquire_lock("holder-1", "apply", Duration::from_secs(1))
            .await
            .expect("lock");
        store.force_unlock().await.expect("force unlock");
        let _other = store
            .acquire_lock("holder-2", "apply", Duration::from_secs(1))
            .await
            .expect("lock");

        let err = store.renew_lock(&token).await.expect_err("lost");
        assert_eq!(err.class(), crate::error::ErrorClass::Conflict);
    }
}
