use thiserror::Error;

/// Failures surfaced by the optimistic send pipeline. Retrying any of
/// these is a user action, never automatic.
#[derive(Debug, Error)]
pub enum SendError {
    /// The attachment upload failed; the send was aborted before any
    /// message object was created.
    #[error("attachment upload failed: {source}")]
    Upload { source: anyhow::Error },
    /// The durable write failed; the provisional entry has been rolled
    /// back and the cache is in its pre-send state.
    #[error("message write failed: {source}")]
    Write { source: anyhow::Error },
    #[error("no conversation is currently open")]
    NoActiveConversation,
}

/// Directory failures are distinct from "legitimately zero connections";
/// callers must not render an unavailable directory as an empty one.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("connection graph unavailable: {source}")]
    Unavailable { source: anyhow::Error },
}
