//! Storage backend client contract
//!
//! The backend is an asynchronous object/KV store. Every call returns
//! immediately and reports its result later through a boxed callback that the
//! backend invokes on one of its own threads. Callers must never assume which
//! thread that is; the join machinery in [`crate::core::join`] is the only
//! code that runs inside these callbacks.

mod memory;

pub use memory::{BackendOp, FaultPlan, InMemoryBackend};

use crate::core::layout::LayoutDescriptor;
use crate::core::oid::ObjectId;
use bytes::Bytes;
use thiserror::Error;

/// Index ids share the object id space
pub type IndexId = ObjectId;

/// Backend operation result type
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Completion for calls that only report status
pub type OpCallback = Box<dyn FnOnce(BackendResult<()>) + Send + 'static>;

/// Completion for a single-key read
pub type ValueCallback = Box<dyn FnOnce(BackendResult<String>) + Send + 'static>;

/// Completion for an ordered listing
pub type ListCallback = Box<dyn FnOnce(BackendResult<Vec<(String, String)>>) + Send + 'static>;

/// Errors reported by the storage backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("entity does not exist")]
    NotFound,

    #[error("entity already exists")]
    AlreadyExists,

    #[error("operation timed out")]
    Timeout,

    /// The call could not be started (resource exhaustion, shutdown)
    #[error("operation failed to launch: {0}")]
    LaunchFailed(String),

    /// The completion was dropped without being invoked
    #[error("operation cancelled")]
    Cancelled,

    #[error("operation failed with code {code}: {message}")]
    Failed { code: i32, message: String },
}

impl BackendError {
    /// Negative errno-style code, as the backend's C API would report it
    pub fn code(&self) -> i32 {
        match self {
            BackendError::NotFound => -2,
            BackendError::AlreadyExists => -17,
            BackendError::Timeout => -110,
            BackendError::LaunchFailed(_) => -12,
            BackendError::Cancelled => -125,
            BackendError::Failed { code, .. } => *code,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound)
    }
}

/// Non-blocking storage client
///
/// Implementations invoke each callback exactly once, on a thread they own.
/// A call that cannot even be launched still reports through its callback,
/// with [`BackendError::LaunchFailed`].
pub trait Backend: Send + Sync {
    /// Create an empty object with the given layout
    fn create_object(&self, oid: ObjectId, layout: LayoutDescriptor, done: OpCallback);

    /// Write `data` at byte `offset` of an existing object
    fn write_object(&self, oid: ObjectId, offset: u64, data: Bytes, done: OpCallback);

    /// Delete an object; `NotFound` if it is already gone
    fn delete_object(&self, oid: ObjectId, layout_id: u8, done: OpCallback);

    /// Upsert one key
    fn kv_put(&self, index: IndexId, key: String, value: String, done: OpCallback);

    /// Delete one key; `NotFound` if absent
    fn kv_delete(&self, index: IndexId, key: String, done: OpCallback);

    /// Read one key
    fn kv_get(&self, index: IndexId, key: String, done: ValueCallback);

    /// Up to `limit` entries with keys strictly greater than `after`, in key order
    fn kv_next(&self, index: IndexId, after: Option<String>, limit: usize, done: ListCallback);
}
