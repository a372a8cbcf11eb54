//! Transport Notifications and Page Signals
//!
//! The transport layer (CDP session, test harness, ...) reports everything
//! that happens to the frame tree as discrete [`TransportEvent`]s. The
//! manager consumes them in arrival order and raises [`PageSignal`]s on a
//! broadcast bus for the page layer.

use serde::{Deserialize, Serialize};

use crate::frame::{DocumentId, FrameId, FrameSnapshot};
use crate::request::{RequestId, RequestRecord};

/// A named point in page-load progress.
///
/// `Load` and `DomContentLoaded` are reported by the browser; the two idle
/// milestones are synthesized by the idle scheduler from in-flight request
/// counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Milestone {
    /// The `load` event fired
    Load,
    /// The `DOMContentLoaded` event fired
    DomContentLoaded,
    /// No in-flight requests for a full quiet period
    NetworkIdle0,
    /// At most two in-flight requests for a full quiet period
    NetworkIdle2,
}

/// The two synthesized idle milestones, checked together on every
/// request-count transition.
pub(crate) const IDLE_MILESTONES: [Milestone; 2] =
    [Milestone::NetworkIdle0, Milestone::NetworkIdle2];

impl Milestone {
    /// Protocol-level name of this milestone
    pub fn as_str(&self) -> &'static str {
        match self {
            Milestone::Load => "load",
            Milestone::DomContentLoaded => "DOMContentLoaded",
            Milestone::NetworkIdle0 => "networkidle0",
            Milestone::NetworkIdle2 => "networkidle2",
        }
    }

    /// Parse a protocol-level milestone name
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "load" => Some(Milestone::Load),
            "DOMContentLoaded" => Some(Milestone::DomContentLoaded),
            "networkidle0" => Some(Milestone::NetworkIdle0),
            "networkidle2" => Some(Milestone::NetworkIdle2),
            _ => None,
        }
    }

    /// The in-flight request count at or below which a frame is "idle" for
    /// this milestone, or `None` for browser-reported milestones
    pub fn idle_threshold(&self) -> Option<usize> {
        match self {
            Milestone::NetworkIdle0 => Some(0),
            Milestone::NetworkIdle2 => Some(2),
            _ => None,
        }
    }
}

impl std::fmt::Display for Milestone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A discrete notification from the browser-process transport.
///
/// Events must be delivered in the order the browser produced them; the
/// manager applies them through a single serialized path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransportEvent {
    /// A frame appeared in the tree. `parent_id` is `None` for main frames.
    FrameAttached {
        frame_id: FrameId,
        parent_id: Option<FrameId>,
    },
    /// A frame (and implicitly its subtree) was removed
    FrameDetached { frame_id: FrameId },
    /// A new document committed on a frame
    FrameCommittedNewDocument {
        frame_id: FrameId,
        url: String,
        name: String,
        document_id: DocumentId,
        /// True for the synthetic first commit of a fresh frame
        is_initial: bool,
    },
    /// A same-document navigation (hash change, history API) on a frame
    FrameCommittedSameDocument { frame_id: FrameId, url: String },
    /// A lifecycle milestone fired on a frame. Also the loopback path for
    /// timer-synthesized idle milestones.
    FrameLifecycle {
        frame_id: FrameId,
        milestone: Milestone,
    },
    /// A network request started (or a redirect hop of a known request)
    RequestStarted(RequestRecord),
    /// A network request completed successfully
    RequestFinished { request_id: RequestId },
    /// A network request failed
    RequestFailed {
        request_id: RequestId,
        error_text: String,
        /// True when the failure was caused by cancellation
        canceled: bool,
    },
    /// The browser-process connection was lost
    ClientDisconnected,
}

/// Page-level signal raised by the manager on its broadcast bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PageSignal {
    /// A child frame was attached
    FrameAttached { frame_id: FrameId },
    /// A frame was detached; carries its final snapshot
    FrameDetached { frame: FrameSnapshot },
    /// A frame committed a navigation (new document or same document)
    FrameNavigated { frame_id: FrameId, url: String },
    /// The main frame fired `DOMContentLoaded`
    DomContentLoaded,
    /// The main frame fired `load`
    Load,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_milestone_roundtrip() {
        for m in [
            Milestone::Load,
            Milestone::DomContentLoaded,
            Milestone::NetworkIdle0,
            Milestone::NetworkIdle2,
        ] {
            assert_eq!(Milestone::parse(m.as_str()), Some(m));
        }
        assert_eq!(Milestone::parse("networkidle1"), None);
    }

    #[test]
    fn test_transport_event_serializes() {
        let event = TransportEvent::FrameLifecycle {
            frame_id: FrameId::new("f1"),
            milestone: Milestone::Load,
        };
        let json = serde_json::to_string(&event).expect("serialize");
        let back: TransportEvent = serde_json::from_str(&json).expect("deserialize");
        match back {
            TransportEvent::FrameLifecycle {
                frame_id,
                milestone,
            } => {
                assert_eq!(frame_id, FrameId::new("f1"));
                assert_eq!(milestone, Milestone::Load);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_idle_thresholds() {
        assert_eq!(Milestone::NetworkIdle0.idle_threshold(), Some(0));
        assert_eq!(Milestone::NetworkIdle2.idle_threshold(), Some(2));
        assert_eq!(Milestone::Load.idle_threshold(), None);
    }
}
