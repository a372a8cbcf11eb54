//! Error types for framewatch

use thiserror::Error;

/// Result type for framewatch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for framewatch
///
/// Every variant is terminal for a single navigation watcher only; none of
/// them indicate corrupted frame-tree state. Variants are `Clone` because a
/// watcher's terminal outcome is latched into a watch channel that several
/// callers may be awaiting.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A newer navigation on the same frame preempted this wait
    #[error("navigation to {url} was canceled by another one")]
    Superseded { url: String },

    /// The navigation request itself failed in the browser process
    #[error("navigation to {url} failed: {reason}")]
    Aborted { url: String, reason: String },

    /// The watched frame was detached while the navigation was pending
    #[error("navigating frame was detached")]
    FrameDetached,

    /// The browser-process connection was lost
    #[error("browser connection was closed")]
    Disconnected,

    /// Caller-configured deadline elapsed
    #[error("timeout: {0}")]
    Timeout(String),

    /// The watcher API was used in a contradictory way
    #[error("invalid usage: {0}")]
    InvalidUsage(String),

    /// No frame with the given id is registered
    #[error("frame not found: {0}")]
    FrameNotFound(String),
}

impl Error {
    /// Create a superseded error for a navigation to `url`
    pub fn superseded(url: impl Into<String>) -> Self {
        Self::Superseded { url: url.into() }
    }

    /// Create an aborted error with the browser's failure text
    pub fn aborted(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Aborted {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error for a deadline given in milliseconds
    pub fn timeout_after(ms: u64) -> Self {
        Self::Timeout(format!("navigation did not complete within {}ms", ms))
    }

    /// Check whether this error means the wait was preempted rather than failed
    pub fn is_superseded(&self) -> bool {
        matches!(self, Error::Superseded { .. })
    }
}
