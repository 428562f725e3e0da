//! Domain types shared by the execution-tracking client.
//!
//! Holds the status enums, lifecycle event names, error taxonomy, and the
//! pure progress aggregation used by the tracker. Nothing here performs
//! I/O.

pub mod error;
pub mod execution;
pub mod lifecycle_events;
pub mod progress;
pub mod types;
