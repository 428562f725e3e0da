//! Lifecycle event name constants.
//!
//! Used as the `type` tag when lifecycle events are serialized for UI
//! consumers. These must match the names the front end binds to.

/// Queue position of the active run changed.
pub const EVENT_QUEUE_CHANGED: &str = "queueChanged";

/// The active run started executing.
pub const EVENT_EXECUTE_START: &str = "executeStart";

/// Aggregate progress of the active run changed (0-100).
pub const EVENT_EXECUTE_PROGRESS: &str = "executeProgress";

/// The active run completed and its result was recorded.
pub const EVENT_EXECUTE_COMPLETE: &str = "executeComplete";

/// The active run ended with an error.
pub const EVENT_EXECUTE_ERROR: &str = "executeError";
