/// Server-assigned identifier of one submitted graph run.
pub type PromptId = String;

/// Identifier of a single node inside a submitted graph.
pub type NodeId = String;
