//! State locking for concurrent access protection.
//!
//! A lock is a small JSON record stored next to the state. Holding it is the
//! right to commit; an expired lock may be taken over by another writer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300; // 5 minutes

/// First delay between lock acquisition attempts.
const POLL_INITIAL: Duration = Duration::from_millis(100);

/// Longest delay between lock acquisition attempts.
const POLL_MAX: Duration = Duration::from_secs(2);

/// Information about a state lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// Operation being performed under the lock.
    #[serde(default)]
    pub operation: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

/// Proof of lock ownership, presented on commit and release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    lock_id: String,
    holder: String,
}

impl LockInfo {
    /// Creates a new lock info.
    #[must_use]
    pub fn new(holder: &str, operation: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            operation: operation.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Refreshes the lock expiry time.
    pub fn refresh(&mut self) {
        self.expires_at = Utc::now() + chrono::Duration::seconds(LOCK_EXPIRY_SECS);
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }

    /// Returns the token proving ownership of this lock.
    #[must_use]
    pub fn token(&self) -> LockToken {
        LockToken {
            lock_id: self.lock_id.clone(),
            holder: self.holder.clone(),
        }
    }

    /// Returns true if the token was issued for this lock.
    #[must_use]
    pub fn matches(&self, token: &LockToken) -> bool {
        self.lock_id == token.lock_id
    }
}

impl LockToken {
    /// Gets the lock ID.
    #[must_use]
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    /// Gets the lock holder.
    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }
}

/// Exponential backoff between lock acquisition attempts.
#[derive(Debug, Clone)]
pub(crate) struct LockPoller {
    delay: Duration,
}

impl LockPoller {
    pub(crate) const fn new() -> Self {
        Self {
            delay: POLL_INITIAL,
        }
    }

    /// Returns the next delay, never sleeping past the remaining budget.
    pub(crate) fn next_delay(&mut self, remaining: Duration) -> Duration {
        let delay = self.delay.min(remaining);
        self.delay = (self.delay * 2).min(POLL_MAX);
        delay
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_creation() {
        let info = LockInfo::new("test-holder", "apply");
        assert_eq!(info.holder, "test-holder");
        assert!(!info.is_expired());
        assert!(info.remaining_secs() > 0);

        let token = info.token();
        assert!(info.matches(&token));
        assert!(!LockInfo::new("test-holder", "apply").matches(&token));
    }

    #[test]
    fn test_expired_lock() {
        let mut info = LockInfo::new("old", "apply");
        info.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(info.is_expired());
        assert_eq!(info.remaining_secs(), 0);

        info.refresh();
        assert!(!info.is_expired());
        assert!(info.remaining_secs() > LOCK_EXPIRY_SECS - 5);
    }

    #[test]
    fn test_poller_backoff() {
        let mut poller = LockPoller::new();
        let budget = Duration::from_secs(10);
        assert_eq!(poller.next_delay(budget), Duration::from_millis(100));
        assert_eq!(poller.next_delay(budget), Duration::from_millis(200));
        for _ in 0..10 {
            poller.next_delay(budget);
        }
        assert_eq!(poller.next_delay(budget), POLL_MAX);
        assert_eq!(poller.next_delay(Duration::from_millis(5)), Duration::from_millis(5));
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();

        // IDs should be unique
        assert_ne!(id1, id2);

        // IDs should contain the process ID
        let pid = std::process::id().to_string();
        assert!(id1.contains(&pid));
    }
}
