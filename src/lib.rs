//! # framewatch
//!
//! Frame-tree and navigation-lifecycle tracking for CDP-driven browser
//! automation.
//!
//! A browser page is a tree of frames. Navigations on those frames go
//! through a noisy, racy sequence of protocol notifications: provisional
//! requests, commits, same-document hops, lifecycle milestones, detaches.
//! This crate turns that stream into two clean primitives:
//!
//! - [`FrameManager`]: owns the frame tree for one page, consumes
//!   [`TransportEvent`]s in arrival order, and raises [`PageSignal`]s.
//! - [`WatcherHandle`]: an awaitable handle to a single navigation,
//!   resolving exactly once with a [`NavigationOutcome`] or an [`Error`].
//!
//! The manager also synthesizes the two network-idle milestones
//! (`networkidle0`, `networkidle2`) from in-flight request counts, using a
//! 500ms quiet period by default.
//!
//! ## Example
//!
//! ```no_run
//! use framewatch::{FrameManager, FrameId, Milestone, TransportEvent, WatchConfig};
//!
//! # async fn demo() -> framewatch::Result<()> {
//! let manager = FrameManager::new(WatchConfig::default());
//!
//! // The transport layer feeds protocol notifications in arrival order
//! manager
//!     .handle_event(TransportEvent::FrameAttached {
//!         frame_id: FrameId::new("main"),
//!         parent_id: None,
//!     })
//!     .await;
//!
//! // Await the next navigation on the main frame up to `load`
//! let handle = manager
//!     .attach_watcher(&FrameId::new("main"), vec![Milestone::Load], None, None)
//!     .await?;
//! let outcome = handle.wait().await?;
//! println!("navigated to {}", outcome.url());
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod events;
pub mod frame;
mod idle;
pub mod manager;
pub mod request;
pub mod watcher;

pub use error::{Error, Result};
pub use events::{Milestone, PageSignal, TransportEvent};
pub use frame::{DocumentId, Frame, FrameId, FrameSnapshot, FrameTree};
pub use manager::FrameManager;
pub use request::{RequestId, RequestRecord, RequestState};
pub use watcher::{Disposition, NavigationOutcome, UrlPredicate, WatcherHandle};

/// Tuning knobs for a [`FrameManager`]
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Quiet period for the synthesized network-idle milestones, in
    /// milliseconds
    pub idle_quiet_ms: u64,
    /// Capacity of the page-signal broadcast channel
    pub signal_buffer: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            idle_quiet_ms: 500,
            signal_buffer: 256,
        }
    }
}
