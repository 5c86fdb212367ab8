//! S3-based state storage backend.
//!
//! This module provides a remote state storage using AWS S3 (or compatible services)
//! for team collaboration. The lock object is created with `If-None-Match: *`
//! and state writes are conditioned on the `ETag` read just before, so
//! concurrent writers cannot overwrite each other silently.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::ProvideErrorMetadata;
use tracing::{debug, info, warn};

use crate::error::{Result, StateError, TopoformError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, LockToken};
use super::store::{LockAttempt, StateScope, StateStore, encode_next, lock_lost};
use super::types::StateSnapshot;

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// State object key.
    key: String,
    /// Lock object key.
    lock_key: String,
    /// Project and environment this store serves.
    scope: StateScope,
}

/// A stored object with its entity tag.
struct Stored {
    content: String,
    etag: Option<String>,
}

/// Outcome of a conditional write.
enum Put {
    Written,
    PreconditionFailed,
}

fn s3_err(message: String) -> TopoformError {
    TopoformError::State(StateError::backend(message))
}

impl S3StateStore {
    /// Creates a new S3 state store.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, key: &str, region: Option<&str>, scope: StateScope) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, key, scope))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, key: &str, scope: StateScope) -> Self {
        let key = key.trim_matches('/').to_string();
        let lock_key = lock_key_for(&key);

        Self {
            client,
            bucket: bucket.to_string(),
            key,
            lock_key,
            scope,
        }
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<Stored>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let etag = response.e_tag().map(str::to_string);
                let bytes = response
                    .body
                    .collect()
                    .await
                    .map_err(|e| s3_err(format!("Failed to read S3 object: {e}")))?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    TopoformError::State(StateError::Corrupted {
                        message: format!("Invalid UTF-8 in S3 object: {e}"),
                    })
                })?;

                Ok(Some(Stored { content, etag }))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(s3_err(format!("S3 get error: {service_err}")))
                }
            }
        }
    }

    /// Puts an object, optionally only if it is absent or unchanged.
    async fn put_object(
        &self,
        key: &str,
        content: &str,
        if_none_match: bool,
        if_match: Option<&str>,
    ) -> Result<Put> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json");

        if if_none_match {
            request = request.if_none_match("*");
        }
        if let Some(etag) = if_match {
            request = request.if_match(etag);
        }

        match request.send().await {
            Ok(_) => Ok(Put::Written),
            Err(e) => match e.code() {
                Some("PreconditionFailed" | "ConditionalRequestConflict") => {
                    Ok(Put::PreconditionFailed)
                }
                _ => Err(s3_err(format!("S3 put error: {e}"))),
            },
        }
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| s3_err(format!("S3 delete error: {e}")))?;

        Ok(())
    }

    async fn read_lock(&self) -> Result<Option<LockInfo>> {
        let Some(stored) = self.get_object(&self.lock_key).await? else {
            return Ok(None);
        };

        serde_json::from_str(&stored.content).map(Some).map_err(|e| {
            TopoformError::State(StateError::Corrupted {
                message: format!("Failed to parse lock: {e}"),
            })
        })
    }

    async fn create_lock(&self, info: &LockInfo) -> Result<bool> {
        let content = serde_json::to_string_pretty(info).map_err(|e| {
            TopoformError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;

        match self.put_object(&self.lock_key, &content, true, None).await? {
            Put::Written => Ok(true),
            Put::PreconditionFailed => Ok(false),
        }
    }
}

/// Derives the lock key from the state key (`a/b/state.json` → `a/b/state.lock`).
fn lock_key_for(key: &str) -> String {
    key.strip_suffix(".json")
        .map_or_else(|| format!("{key}.lock"), |stem| format!("{stem}.lock"))
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn init(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| s3_err(format!("State bucket {} is not reachable: {e}", self.bucket)))?;
        Ok(())
    }

    async fn load(&self) -> Result<StateSnapshot> {
        debug!("Loading state from s3://{}/{}", self.bucket, self.key);

        match self.get_object(&self.key).await? {
            Some(stored) => {
                let snapshot = self.scope.decode(&stored.content)?;
                info!(
                    "Loaded state for {} at serial {}",
                    snapshot.qualified_name(),
                    snapshot.serial
                );
                Ok(snapshot)
            }
            None => {
                debug!("No state found in S3");
                Ok(self.scope.empty_snapshot())
            }
        }
    }

    async fn commit(&self, snapshot: &StateSnapshot, token: &LockToken) -> Result<u64> {
        match self.read_lock().await? {
            Some(lock) if lock.matches(token) => {}
            _ => return Err(lock_lost(token)),
        }

        let stored = self.get_object(&self.key).await?;
        let stored_snapshot = match &stored {
            Some(s) => Some(self.scope.decode(&s.content)?),
            None => None,
        };
        StateScope::check_commit(stored_snapshot.as_ref(), snapshot)?;

        let (serial, content) = encode_next(snapshot)?;
        let etag = stored.as_ref().and_then(|s| s.etag.as_deref());
        let outcome = self
            .put_object(&self.key, &content, stored.is_none(), etag)
            .await?;

        match outcome {
            Put::Written => {
                debug!("Committed state serial {serial} to s3://{}/{}", self.bucket, self.key);
                Ok(serial)
            }
            Put::PreconditionFailed => Err(TopoformError::State(StateError::conflict(
                "state object changed during commit",
            ))),
        }
    }

    async fn try_lock(&self, holder: &str, operation: &str) -> Result<LockAttempt> {
        let info = LockInfo::new(holder, operation);

        if self.create_lock(&info).await? {
            info!(
                "Acquired state lock: {} (expires in {}s)",
                info.lock_id, LOCK_EXPIRY_SECS
            );
            return Ok(LockAttempt::Acquired(info));
        }

        let Some(existing) = self.read_lock().await? else {
            return Ok(LockAttempt::Held(LockInfo::new("unknown", "unknown")));
        };

        if !existing.is_expired() {
            return Ok(LockAttempt::Held(existing));
        }

        warn!(
            "Taking over expired lock held by {} since {}",
            existing.holder, existing.acquired_at
        );
        self.delete_object(&self.lock_key).await?;

        if self.create_lock(&info).await? {
            Ok(LockAttempt::Acquired(info))
        } else {
            let current = self.read_lock().await?.unwrap_or(existing);
            Ok(LockAttempt::Held(current))
        }
    }

    async fn renew_lock(&self, token: &LockToken) -> Result<LockInfo> {
        let Some(stored) = self.get_object(&self.lock_key).await? else {
            return Err(lock_lost(token));
        };
        let mut current: LockInfo = serde_json::from_str(&stored.content).map_err(|e| {
            TopoformError::State(StateError::Corrupted {
                message: format!("Failed to parse lock: {e}"),
            })
        })?;
        if !current.matches(token) {
            return Err(lock_lost(token));
        }

        current.refresh();
        let content = serde_json::to_string_pretty(&current).map_err(|e| {
            TopoformError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;
        match self
            .put_object(&self.lock_key, &content, false, stored.etag.as_deref())
            .await?
        {
            Put::Written => {
                debug!("Renewed state lock {} until {}", current.lock_id, current.expires_at);
                Ok(current)
            }
            Put::PreconditionFailed => Err(lock_lost(token)),
        }
    }

    async fn release_lock(&self, token: &LockToken) -> Result<()> {
        if let Some(existing) = self.read_lock().await? {
            if existing.matches(token) {
                self.delete_object(&self.lock_key).await?;
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
        let existing = self.read_lock().await?;
        if existing.is_some() {
            self.delete_object(&self.lock_key).await?;
        }
        Ok(existing)
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock().await
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_for() {
        assert_eq!(lock_key_for("shop/prod/state.json"), "shop/prod/state.lock");
        assert_eq!(lock_key_for("custom"), "custom.lock");
    }
}
