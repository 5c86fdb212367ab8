//! State management module for topoform.
//!
//! This module provides persistent state storage for tracking provisioned
//! resources: bindings from logical ids to remote objects, serials, locking
//! and operation history.

mod local;
mod lock;
mod s3;
mod store;
mod types;

pub use local::LocalStateStore;
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, LockToken, generate_holder_id};
pub use s3::S3StateStore;
pub use store::{LockAttempt, StateScope, StateStore};
pub use types::{
    BindingStatus, HistoryEntry, MAX_HISTORY, Operation, ProviderBinding, RemoteComponent,
    STATE_VERSION, StateSnapshot,
};
