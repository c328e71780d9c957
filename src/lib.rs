//! # s3gw - Object Write/Replace Orchestration
//!
//! The engine behind an S3 gateway's PutObject, DeleteObject and
//! DeleteObjects requests, running over an asynchronous object/KV store.
//!
//! - **Tombstone ledger**: every object id that could become garbage is
//!   recorded before it is created or superseded, so a crash at any point
//!   leaves something the [`reaper`] can clean up
//! - **Join-based event loop**: backend calls are fanned out as joins whose
//!   continuations run on the request thread
//! - **Step pipelines**: each request is a chain of steps with a rollback
//!   chain and shutdown/disconnect checks between steps
//! - **Fault mode**: writes that keep failing split the object into
//!   fragments instead of failing the request
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use s3gw::{put_object, GatewayConfig, GatewayContext, InMemoryBackend, PutRequest, ShutdownSignal};
//! use std::sync::Arc;
//!
//! # fn main() -> s3gw::Result<()> {
//! let backend = Arc::new(InMemoryBackend::new(4));
//! let ctx = GatewayContext::new(GatewayConfig::default(), backend, ShutdownSignal::new())?;
//!
//! let outcome = put_object(&ctx, PutRequest::new("photos", "cat.jpg", &b"meow"[..]))?;
//! assert!(outcome.succeeded());
//! println!("etag {:?}", outcome.etag);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ flows: PutObject / DeleteObject / DeleteObjects
//! ├──────────────────────────────────────────────┤
//! │ core::pipeline        steps + rollback chain │
//! │ core::fragment        fault-mode writes      │
//! │ core::ledger          tombstone records      │
//! │ core::oid / layout    ids and size classes   │
//! ├──────────────────────────────────────────────┤
//! │ core::event_loop + core::join                │
//! ├──────────────────────────────────────────────┤
//! │ backend::Backend  (InMemoryBackend for tests)│
//! └──────────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod flows;
pub mod metadata;
pub mod reaper;

pub use crate::backend::{Backend, BackendError, FaultPlan, InMemoryBackend};
pub use crate::config::GatewayConfig;
pub use crate::context::GatewayContext;
pub use crate::core::event_loop::{EventLoop, ShutdownSignal};
pub use crate::core::oid::{IdAllocator, ObjectId};
pub use crate::core::pipeline::{ClientConnection, Phase};
pub use crate::error::{ErrorClass, GatewayError, Result};
pub use crate::flows::{
    delete_object, delete_objects_batch, put_object, DeleteObject, DeleteObjects, DeleteRequest, FlowOutcome,
    KeyOutcome, PutObject, PutRequest, PutStage,
};
pub use crate::metadata::{ExtendedMetadata, ObjectMetadata};
pub use crate::reaper::{ReapReport, Reaper};
