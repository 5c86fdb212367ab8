//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::debug;

use super::lock::{LockInfo, LockPoller, LockToken};
use super::types::{STATE_VERSION, StateSnapshot};
use crate::error::{Result, StateError, TopoformError};

/// Project and environment a store is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateScope {
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
}

/// Outcome of a single lock attempt.
#[derive(Debug, Clone)]
pub enum LockAttempt {
    /// The lock was taken.
    Acquired(LockInfo),
    /// Someone else holds a live lock.
    Held(LockInfo),
}

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Prepares the backend (directories, bucket reachability).
    async fn init(&self) -> Result<()>;

    /// Loads the snapshot, or an empty one with serial 0 if nothing is stored.
    async fn load(&self) -> Result<StateSnapshot>;

    /// Writes the snapshot with `serial + 1` and returns the new serial.
    ///
    /// Fails with `StateError::Conflict` if the stored serial differs from
    /// the snapshot's or the token no longer holds the lock.
    async fn commit(&self, snapshot: &StateSnapshot, token: &LockToken) -> Result<u64>;

    /// Makes one attempt to take the lock, taking over an expired one.
    async fn try_lock(&self, holder: &str, operation: &str) -> Result<LockAttempt>;

    /// Pushes the expiry of a held lock forward and returns the renewed lock.
    ///
    /// Fails with `StateError::Conflict` if the token no longer holds the lock.
    async fn renew_lock(&self, token: &LockToken) -> Result<LockInfo>;

    /// Releases the lock if the token still holds it.
    async fn release_lock(&self, token: &LockToken) -> Result<()>;

    /// Removes any lock regardless of holder, returning what was removed.
    async fn force_unlock(&self) -> Result<Option<LockInfo>>;

    /// Gets current lock information if locked.
    async fn lock_info(&self) -> Result<Option<LockInfo>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;

    /// Polls for the lock with backoff until it is taken or the timeout elapses.
    async fn acquire_lock(
        &self,
        holder: &str,
        operation: &str,
        timeout: Duration,
    ) -> Result<LockToken> {
        let started = Instant::now();
        let mut poller = LockPoller::new();

        loop {
            match self.try_lock(holder, operation).await? {
                LockAttempt::Acquired(info) => return Ok(info.token()),
                LockAttempt::Held(current) => {
                    let elapsed = started.elapsed();
                    if elapsed >= timeout {
                        return Err(TopoformError::State(StateError::LockTimeout {
                            holder: current.holder,
                            waited_secs: elapsed.as_secs(),
                        }));
                    }
                    let delay = poller.next_delay(timeout - elapsed);
                    debug!("State locked by {}, retrying in {delay:?}", current.holder);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn init(&self) -> Result<()> {
        (**self).init().await
    }

    async fn load(&self) -> Result<StateSnapshot> {
        (**self).load().await
    }

    async fn commit(&self, snapshot: &StateSnapshot, token: &LockToken) -> Result<u64> {
        (**self).commit(snapshot, token).await
    }

    async fn try_lock(&self, holder: &str, operation: &str) -> Result<LockAttempt> {
        (**self).try_lock(holder, operation).await
    }

    async fn renew_lock(&self, token: &LockToken) -> Result<LockInfo> {
        (**self).renew_lock(token).await
    }

    async fn release_lock(&self, token: &LockToken) -> Result<()> {
        (**self).release_lock(token).await
    }

    async fn force_unlock(&self) -> Result<Option<LockInfo>> {
        (**self).force_unlock().await
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).lock_info().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}

impl StateScope {
    /// Creates a scope.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            project: project.to_string(),
            environment: environment.to_string(),
        }
    }

    /// Returns an empty snapshot for this scope.
    #[must_use]
    pub fn empty_snapshot(&self) -> StateSnapshot {
        StateSnapshot::new(&self.project, &self.environment)
    }

    /// Parses stored state and checks it belongs to this scope.
    pub(crate) fn decode(&self, content: &str) -> Result<StateSnapshot> {
        let snapshot: StateSnapshot = serde_json::from_str(content).map_err(|e| {
            TopoformError::State(StateError::Corrupted {
                message: format!("Failed to parse state: {e}"),
            })
        })?;

        if snapshot.version != STATE_VERSION {
            return Err(TopoformError::State(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: snapshot.version,
            }));
        }

        if snapshot.project != self.project || snapshot.environment != self.environment {
            return Err(TopoformError::State(StateError::EnvironmentMismatch {
                expected: format!("{}/{}", self.project, self.environment),
                found: snapshot.qualified_name(),
            }));
        }

        Ok(snapshot)
    }

    /// Checks a pending commit against the stored snapshot.
    pub(crate) fn check_commit(
        stored: Option<&StateSnapshot>,
        snapshot: &StateSnapshot,
    ) -> Result<()> {
        let (stored_serial, stored_lineage) =
            stored.map_or((0, None), |s| (s.serial, Some(s.lineage.as_str())));

        if stored_serial != snapshot.serial {
            return Err(TopoformError::State(StateError::conflict(format!(
                "stored serial is {stored_serial}, snapshot was loaded at {}",
                snapshot.serial
            ))));
        }
        if let Some(lineage) = stored_lineage {
            if lineage != snapshot.lineage {
                return Err(TopoformError::State(StateError::conflict(format!(
                    "stored lineage {lineage} differs from {}",
                    snapshot.lineage
                ))));
            }
        }
        Ok(())
    }
}

/// Error for a token whose lock was released or taken over.
pub(crate) fn lock_lost(token: &LockToken) -> TopoformError {
    TopoformError::State(StateError::conflict(format!(
        "lock {} is no longer held",
        token.lock_id()
    )))
}

/// Serializes a snapshot for storage, stamped with its next serial.
pub(crate) fn encode_next(snapshot: &StateSnapshot) -> Result<(u64, String)> {
    let mut next = snapshot.clone();
    next.serial = snapshot.serial + 1;
    next.last_updated = chrono::Utc::now();

    let content = serde_json::to_string_pretty(&next).map_err(|e| {
        TopoformError::State(StateError::serialization(format!(
            "Failed to serialize state: {e}"
        )))
    })?;
    Ok((next.serial, content))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rejects_other_environment() {
        let scope = StateScope::new("shop", "prod");
        let content = serde_json::to_string(&StateSnapshot::new("shop", "dev")).expect("json");
        let err = scope.decode(&content).expect_err("mismatch");
        assert!(matches!(
            err,
            TopoformError::State(StateError::EnvironmentMismatch { .. })
        ));
    }

    #[test]
    fn test_check_commit() {
        let snapshot = StateSnapshot::new("shop", "dev");
        assert!(StateScope::check_commit(None, &snapshot).is_ok());

        let stored = snapshot.clone();
        assert!(StateScope::check_commit(Some(&stored), &snapshot).is_ok());
        let mut advanced = stored.clone();
        advanced.serial = 3;
        assert!(StateScope::check_commit(Some(&advanced), &snapshot).is_err());

        let mut other = stored;
        other.lineage = String::from("other");
        assert!(StateScope::check_commit(Some(&other), &snapshot).is_err());
    }

    #[test]
    fn test_encode_next() {
        let snapshot = StateSnapshot::new("shop", "dev");
        let (serial, content) = encode_next(&snapshot).expect("encode");
        assert_eq!(serial, 1);
        let back: StateSnapshot = serde_json::from_str(&content).expect("decode");
        assert_eq!(back.serial, 1);
        assert_eq!(back.lineage, snapshot.lineage);
    }
}
