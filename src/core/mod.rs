//! Engine core
//!
//! Everything a request flow is built from: id allocation, layout
//! selection, the event loop and its joins, the step pipeline, the
//! tombstone ledger and the fault-mode write controller.

pub mod checksum;
pub mod event_loop;
pub mod fragment;
pub mod join;
pub mod layout;
pub mod ledger;
pub mod oid;
pub mod pipeline;
