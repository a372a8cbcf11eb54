//! Request Bookkeeping
//!
//! Minimal per-request records feeding navigation detection and the
//! network-idle accounting. A request belongs to exactly one frame for its
//! lifetime and counts toward idle thresholds only while it is pending.

use serde::{Deserialize, Serialize};

use crate::frame::{DocumentId, FrameId};

/// Opaque request identifier assigned by the browser process
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Completion state of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    Pending,
    Finished,
    Failed,
}

/// A tracked network request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Browser-assigned request id (stable across redirect hops)
    pub id: RequestId,
    /// Owning frame, if the request is attributable to one
    pub frame_id: Option<FrameId>,
    /// Document this request belongs to; set for navigation requests and
    /// subresources of a committed document
    pub document_id: Option<DocumentId>,
    /// Request URL (updated on redirect hops)
    pub url: String,
    /// Position in the redirect chain; 0 for the original request
    pub redirect_index: u32,
    /// Completion state
    pub state: RequestState,
}

impl RequestRecord {
    /// Create a fresh pending request record
    pub fn new(
        id: impl Into<String>,
        frame_id: Option<FrameId>,
        document_id: Option<DocumentId>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            id: RequestId::new(id),
            frame_id,
            document_id,
            url: url.into(),
            redirect_index: 0,
            state: RequestState::Pending,
        }
    }

    /// Set the redirect-chain position
    pub fn with_redirect_index(mut self, index: u32) -> Self {
        self.redirect_index = index;
        self
    }

    /// Favicon fetches are excluded from all idle and lifecycle accounting
    pub fn is_favicon(&self) -> bool {
        let path = self
            .url
            .split(['?', '#'])
            .next()
            .unwrap_or(self.url.as_str());
        path.ends_with("favicon.ico")
    }

    /// A navigation request carries a document id and sits at the head of
    /// its redirect chain
    pub fn is_navigation_request(&self) -> bool {
        self.document_id.is_some() && self.redirect_index == 0
    }

    /// Whether this request participates in network-idle accounting
    pub fn counts_toward_idle(&self) -> bool {
        self.state == RequestState::Pending && self.frame_id.is_some() && !self.is_favicon()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_favicon_detection() {
        let fav = RequestRecord::new("1", None, None, "https://example.com/favicon.ico");
        assert!(fav.is_favicon());

        let fav_query = RequestRecord::new("2", None, None, "https://example.com/favicon.ico?v=2");
        assert!(fav_query.is_favicon());

        let page = RequestRecord::new("3", None, None, "https://example.com/index.html");
        assert!(!page.is_favicon());
    }

    #[test]
    fn test_navigation_request() {
        let nav = RequestRecord::new(
            "1",
            Some(FrameId::new("f1")),
            Some(DocumentId::new("d1")),
            "https://example.com/",
        );
        assert!(nav.is_navigation_request());

        let redirect_hop = nav.clone().with_redirect_index(1);
        assert!(!redirect_hop.is_navigation_request());

        let subresource = RequestRecord::new(
            "2",
            Some(FrameId::new("f1")),
            None,
            "https://example.com/app.js",
        );
        assert!(!subresource.is_navigation_request());
    }

    #[test]
    fn test_idle_accounting_policy() {
        let mut req = RequestRecord::new(
            "1",
            Some(FrameId::new("f1")),
            None,
            "https://example.com/app.js",
        );
        assert!(req.counts_toward_idle());

        req.state = RequestState::Finished;
        assert!(!req.counts_toward_idle());

        let frameless = RequestRecord::new("2", None, None, "https://example.com/app.js");
        assert!(!frameless.counts_toward_idle());

        let fav = RequestRecord::new(
            "3",
            Some(FrameId::new("f1")),
            None,
            "https://example.com/favicon.ico",
        );
        assert!(!fav.counts_toward_idle());
    }
}
