/// Result alias used throughout the crate.
pub type ComposeResult<T> = Result<T, ComposeError>;

/// Errors raised by the composition core.
///
/// There is no local recovery: every variant is fatal to the compose that
/// raised it, and scratch buffers may alias between rounds, so partial
/// progress is not recoverable either.
#[derive(thiserror::Error, Debug)]
pub enum ComposeError {
    /// An internal invariant was violated.
    #[error("sanity check failed: {0}")]
    SanityCheck(String),

    /// The caller's rank or group shape does not match the session topology.
    #[error("topology error: {0}")]
    Topology(String),

    /// An image's format, dimensions, or pixel count disagrees with what the
    /// operation expects.
    #[error("format mismatch: {0}")]
    FormatMismatch(String),

    /// An error surfaced from the message-passing transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// Any other error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ComposeError {
    /// A violated internal invariant.
    pub fn sanity(msg: impl Into<String>) -> Self {
        Self::SanityCheck(msg.into())
    }

    /// A rank/group/topology mismatch.
    pub fn topology(msg: impl Into<String>) -> Self {
        Self::Topology(msg.into())
    }

    /// An image format or dimension mismatch.
    pub fn format(msg: impl Into<String>) -> Self {
        Self::FormatMismatch(msg.into())
    }

    /// A transport-level failure.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}
