//! Navigation Lifecycle Watcher
//!
//! One watcher per awaited navigation. The manager feeds it every tree
//! notification in arrival order; the watcher re-evaluates its completion
//! predicate and latches exactly one terminal outcome per signal into
//! watch channels that callers race via [`WatcherHandle`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::events::Milestone;
use crate::frame::{DocumentId, FrameId, FrameTree};
use crate::request::RequestRecord;

/// Optional URL filter for a watcher
pub type UrlPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Successful terminal outcome of an awaited navigation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationOutcome {
    /// A same-document navigation (hash change, history API) completed
    SameDocument { url: String },
    /// A new document committed and satisfied the required milestones
    NewDocument {
        url: String,
        document_id: DocumentId,
    },
}

impl NavigationOutcome {
    /// URL the navigation resolved at
    pub fn url(&self) -> &str {
        match self {
            NavigationOutcome::SameDocument { url } => url,
            NavigationOutcome::NewDocument { url, .. } => url,
        }
    }
}

/// Watcher state machine position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Pending,
    SameDocumentComplete,
    NewDocumentComplete,
    Terminated,
}

struct WatcherState {
    /// Target frame. Mutable because a cross-process navigation remaps the
    /// main frame's browser-assigned id while the logical frame survives.
    frame_id: FrameId,
    expected_document: Option<DocumentId>,
    expected_url: Option<String>,
    /// A navigation request for the expected document was observed
    navigation_request_seen: bool,
    /// A same-document navigation occurred on the target frame
    same_document_seen: bool,
    disposition: Disposition,
    terminated: bool,
    disposed: bool,
    deadline: Option<AbortHandle>,
}

/// Per-navigation lifecycle state machine.
///
/// All notification methods are invoked from the manager's serialized
/// dispatch path; the internal lock only guards against the deadline task
/// and caller-side `set_expected_document`.
pub struct LifecycleWatcher {
    milestones: Vec<Milestone>,
    url_filter: Option<UrlPredicate>,
    state: Mutex<WatcherState>,
    same_document_tx: watch::Sender<Option<NavigationOutcome>>,
    new_document_tx: watch::Sender<Option<NavigationOutcome>>,
    terminated_tx: watch::Sender<Option<Error>>,
}

impl LifecycleWatcher {
    pub(crate) fn new(
        frame_id: FrameId,
        milestones: Vec<Milestone>,
        url_filter: Option<UrlPredicate>,
    ) -> Self {
        let (same_document_tx, _) = watch::channel(None);
        let (new_document_tx, _) = watch::channel(None);
        let (terminated_tx, _) = watch::channel(None);
        Self {
            milestones,
            url_filter,
            state: Mutex::new(WatcherState {
                frame_id,
                expected_document: None,
                expected_url: None,
                navigation_request_seen: false,
                same_document_seen: false,
                disposition: Disposition::Pending,
                terminated: false,
                disposed: false,
                deadline: None,
            }),
            same_document_tx,
            new_document_tx,
            terminated_tx,
        }
    }

    /// Frame this watcher currently targets
    pub fn frame_id(&self) -> FrameId {
        self.lock().frame_id.clone()
    }

    /// Current state machine position
    pub fn disposition(&self) -> Disposition {
        self.lock().disposition
    }

    fn lock(&self) -> MutexGuard<'_, WatcherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn url_matches(&self, url: &str) -> bool {
        self.url_filter.as_ref().map(|f| f(url)).unwrap_or(true)
    }

    /// Whether the manager should keep dispatching to this watcher
    pub(crate) fn is_active(&self) -> bool {
        let st = self.lock();
        !st.terminated && !st.disposed
    }

    pub(crate) fn set_deadline(&self, handle: AbortHandle) {
        let mut st = self.lock();
        if st.terminated || st.disposed {
            handle.abort();
        } else {
            st.deadline = Some(handle);
        }
    }

    /// Follow a main-frame identity remap so a pending wait keeps tracking
    /// the same logical frame under its new browser-assigned id
    pub(crate) fn retarget(&self, old_id: &FrameId, new_id: &FrameId) {
        let mut st = self.lock();
        if st.terminated || st.disposed {
            return;
        }
        if st.frame_id == *old_id {
            trace!(old = %old_id, new = %new_id, "watcher retargeted after identity remap");
            st.frame_id = new_id.clone();
        }
    }

    /// Supply the expected document identity directly (programmatic
    /// navigations). One-shot, and mutually exclusive with a URL filter.
    pub fn set_expected_document(
        &self,
        document_id: DocumentId,
        url: impl Into<String>,
    ) -> Result<()> {
        if self.url_filter.is_some() {
            return Err(Error::InvalidUsage(
                "cannot set an expected document on a watcher with a URL filter".into(),
            ));
        }
        let mut st = self.lock();
        if st.expected_document.is_some() {
            return Err(Error::InvalidUsage(
                "expected document already set".into(),
            ));
        }
        st.expected_document = Some(document_id);
        st.expected_url = Some(url.into());
        Ok(())
    }

    /// A navigation request started on some frame
    pub(crate) fn on_navigation_request(&self, request: &RequestRecord) {
        let Some(document_id) = &request.document_id else {
            return;
        };
        let mut st = self.lock();
        if st.terminated || st.disposed {
            return;
        }
        if request.frame_id.as_ref() != Some(&st.frame_id) {
            return;
        }
        // First writer wins per distinct document id
        match &st.expected_document {
            None => {
                st.expected_document = Some(document_id.clone());
                st.expected_url = Some(request.url.clone());
                st.navigation_request_seen = true;
            }
            Some(expected) if expected == document_id => {
                st.expected_url = Some(request.url.clone());
                st.navigation_request_seen = true;
            }
            Some(_) => {}
        }
    }

    /// A new document committed on `committed`
    pub(crate) fn on_committed_new_document(&self, committed: &FrameId, tree: &FrameTree) {
        let mut superseded: Option<Error> = None;
        {
            let mut st = self.lock();
            if st.terminated || st.disposed {
                return;
            }
            if committed == &st.frame_id {
                let Some(frame) = tree.frame(committed) else {
                    return;
                };
                match &st.expected_document {
                    Some(expected)
                        if st.navigation_request_seen
                            && frame.document_id() != Some(expected) =>
                    {
                        // A second navigation on the frame won this wait
                        let url = st
                            .expected_url
                            .clone()
                            .unwrap_or_else(|| frame.url().to_string());
                        superseded = Some(Error::superseded(url));
                    }
                    None if self.url_matches(frame.url()) => {
                        st.expected_document = frame.document_id().cloned();
                        st.expected_url = Some(frame.url().to_string());
                    }
                    _ => {}
                }
            }
        }
        if let Some(err) = superseded {
            self.terminate(err);
            return;
        }
        self.recheck(tree);
    }

    /// A provisional navigation request failed before committing
    pub(crate) fn on_aborted_new_document(
        &self,
        frame_id: &FrameId,
        document_id: &DocumentId,
        reason: &str,
    ) {
        let url = {
            let st = self.lock();
            if st.terminated || st.disposed {
                return;
            }
            if frame_id != &st.frame_id {
                return;
            }
            if st.expected_document.as_ref() != Some(document_id) {
                return;
            }
            st.expected_url.clone().unwrap_or_default()
        };
        self.terminate(Error::aborted(url, reason));
    }

    /// A same-document navigation committed on `committed`
    pub(crate) fn on_navigated_within_document(&self, committed: &FrameId, tree: &FrameTree) {
        {
            let mut st = self.lock();
            if st.terminated || st.disposed {
                return;
            }
            if committed == &st.frame_id {
                st.same_document_seen = true;
            }
        }
        self.recheck(tree);
    }

    /// A lifecycle milestone fired somewhere in the tree
    pub(crate) fn on_lifecycle_event(&self, tree: &FrameTree) {
        self.recheck(tree);
    }

    /// A frame was detached from the tree
    pub(crate) fn on_frame_detached(&self, detached: &FrameId, tree: &FrameTree) {
        let own = {
            let st = self.lock();
            if st.terminated || st.disposed {
                return;
            }
            detached == &st.frame_id
        };
        if own {
            self.terminate(Error::FrameDetached);
        } else {
            // Losing an unloaded child can satisfy the subtree check
            self.recheck(tree);
        }
    }

    /// Re-run the completion predicate against the current tree
    pub(crate) fn recheck(&self, tree: &FrameTree) {
        let mut st = self.lock();
        if st.terminated || st.disposed {
            return;
        }
        let Some(frame) = tree.frame(&st.frame_id) else {
            return;
        };
        if !tree.subtree_has_fired(&st.frame_id, &self.milestones) {
            return;
        }
        if !self.url_matches(frame.url()) {
            return;
        }
        if st.same_document_seen {
            let resolved = Self::latch(
                &self.same_document_tx,
                NavigationOutcome::SameDocument {
                    url: frame.url().to_string(),
                },
            );
            if resolved && st.disposition == Disposition::Pending {
                st.disposition = Disposition::SameDocumentComplete;
                trace!(frame = %st.frame_id, "same-document navigation complete");
            }
        }
        if let (Some(document), Some(expected)) =
            (frame.document_id(), st.expected_document.as_ref())
        {
            if document == expected {
                let resolved = Self::latch(
                    &self.new_document_tx,
                    NavigationOutcome::NewDocument {
                        url: frame.url().to_string(),
                        document_id: document.clone(),
                    },
                );
                if resolved && st.disposition == Disposition::Pending {
                    st.disposition = Disposition::NewDocumentComplete;
                    trace!(frame = %st.frame_id, document = %document, "new-document navigation complete");
                }
            }
        }
    }

    /// Terminate with an error. Idempotent; later notifications are ignored.
    pub(crate) fn terminate(&self, error: Error) {
        let frame_id = {
            let mut st = self.lock();
            if st.terminated || st.disposed {
                return;
            }
            st.terminated = true;
            if st.disposition == Disposition::Pending {
                st.disposition = Disposition::Terminated;
            }
            if let Some(handle) = st.deadline.take() {
                handle.abort();
            }
            st.frame_id.clone()
        };
        debug!(frame = %frame_id, %error, "navigation watcher terminated");
        Self::latch(&self.terminated_tx, error);
    }

    /// Release resources; further notifications are ignored. Idempotent.
    pub(crate) fn dispose(&self) {
        let mut st = self.lock();
        st.disposed = true;
        if let Some(handle) = st.deadline.take() {
            handle.abort();
        }
    }

    /// Latch a value into a signal channel exactly once
    fn latch<T: Clone>(tx: &watch::Sender<Option<T>>, value: T) -> bool {
        tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(value);
                true
            } else {
                false
            }
        })
    }
}

/// Caller-side handle to a registered watcher.
///
/// Dropping the handle disposes the watcher; the manager prunes it from
/// the active set on the next dispatch.
pub struct WatcherHandle {
    watcher: Arc<LifecycleWatcher>,
}

impl std::fmt::Debug for WatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherHandle")
            .field("frame_id", &self.watcher.frame_id())
            .finish_non_exhaustive()
    }
}

impl WatcherHandle {
    pub(crate) fn new(watcher: Arc<LifecycleWatcher>) -> Self {
        Self { watcher }
    }

    /// Frame this watcher currently targets
    pub fn frame_id(&self) -> FrameId {
        self.watcher.frame_id()
    }

    /// Current state machine position
    pub fn disposition(&self) -> Disposition {
        self.watcher.disposition()
    }

    /// Supply the expected document identity directly. One-shot, mutually
    /// exclusive with a URL filter.
    pub fn set_expected_document(
        &self,
        document_id: DocumentId,
        url: impl Into<String>,
    ) -> Result<()> {
        self.watcher.set_expected_document(document_id, url)
    }

    /// Wait for the same-document branch to resolve
    pub async fn same_document(&self) -> Result<NavigationOutcome> {
        self.race(true, false).await
    }

    /// Wait for the new-document branch to resolve
    pub async fn new_document(&self) -> Result<NavigationOutcome> {
        self.race(false, true).await
    }

    /// Race both completion branches against termination; first wins.
    ///
    /// It is legitimate for neither branch to ever resolve (e.g. a
    /// hash-only navigation that fails the milestone check); callers
    /// apply their own timeout on top of this future.
    pub async fn wait(&self) -> Result<NavigationOutcome> {
        self.race(true, true).await
    }

    async fn race(&self, same: bool, new: bool) -> Result<NavigationOutcome> {
        let mut same_rx = self.watcher.same_document_tx.subscribe();
        let mut new_rx = self.watcher.new_document_tx.subscribe();
        let mut term_rx = self.watcher.terminated_tx.subscribe();
        loop {
            // Resolved outcomes take priority over a later termination
            if new {
                if let Some(outcome) = new_rx.borrow().clone() {
                    return Ok(outcome);
                }
            }
            if same {
                if let Some(outcome) = same_rx.borrow().clone() {
                    return Ok(outcome);
                }
            }
            if let Some(error) = term_rx.borrow().clone() {
                return Err(error);
            }
            // Senders live inside the watcher we hold, so changed() cannot
            // observe a dropped sender here.
            tokio::select! {
                _ = new_rx.changed(), if new => {}
                _ = same_rx.changed(), if same => {}
                _ = term_rx.changed() => {}
            }
        }
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.watcher.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameTree;

    fn tree_with_main(url: &str, document: &str) -> FrameTree {
        let mut tree = FrameTree::new();
        tree.insert_frame(FrameId::new("main"), None);
        tree.frame_mut(&FrameId::new("main"))
            .expect("main frame")
            .commit_new_document(url.into(), String::new(), DocumentId::new(document));
        tree
    }

    fn load_watcher() -> LifecycleWatcher {
        LifecycleWatcher::new(FrameId::new("main"), vec![Milestone::Load], None)
    }

    #[tokio::test]
    async fn test_resolves_after_required_milestone() {
        let mut tree = tree_with_main("https://a/", "d1");
        let watcher = load_watcher();
        let record = RequestRecord::new(
            "r1",
            Some(FrameId::new("main")),
            Some(DocumentId::new("d1")),
            "https://a/",
        );
        watcher.on_navigation_request(&record);
        watcher.on_committed_new_document(&FrameId::new("main"), &tree);
        assert_eq!(watcher.disposition(), Disposition::Pending);

        tree.frame_mut(&FrameId::new("main"))
            .expect("main")
            .fire(Milestone::Load);
        watcher.on_lifecycle_event(&tree);
        assert_eq!(watcher.disposition(), Disposition::NewDocumentComplete);
    }

    #[tokio::test]
    async fn test_superseded_by_second_navigation() {
        let tree = tree_with_main("https://b/", "d2");
        let watcher = load_watcher();
        // Watcher expects d1; d2 committed instead
        let record = RequestRecord::new(
            "r1",
            Some(FrameId::new("main")),
            Some(DocumentId::new("d1")),
            "https://a/",
        );
        watcher.on_navigation_request(&record);
        watcher.on_committed_new_document(&FrameId::new("main"), &tree);

        assert_eq!(watcher.disposition(), Disposition::Terminated);
        let err = watcher
            .terminated_tx
            .subscribe()
            .borrow()
            .clone()
            .expect("terminal error");
        assert!(err.is_superseded());
    }

    #[tokio::test]
    async fn test_retarget_follows_identity_remap() {
        let mut tree = tree_with_main("https://a/", "d1");
        let watcher = load_watcher();
        // Adopt the committed document, then lose the old id to a remap
        watcher.on_committed_new_document(&FrameId::new("main"), &tree);
        assert!(tree.remap_main_frame(FrameId::new("main2")));
        watcher.retarget(&FrameId::new("main"), &FrameId::new("main2"));
        assert_eq!(watcher.frame_id(), FrameId::new("main2"));

        tree.frame_mut(&FrameId::new("main2"))
            .expect("remapped frame")
            .fire(Milestone::Load);
        watcher.on_lifecycle_event(&tree);
        assert_eq!(watcher.disposition(), Disposition::NewDocumentComplete);
    }

    #[tokio::test]
    async fn test_retarget_ignores_other_frames() {
        let watcher = load_watcher();
        watcher.retarget(&FrameId::new("other"), &FrameId::new("other2"));
        assert_eq!(watcher.frame_id(), FrameId::new("main"));
    }

    #[tokio::test]
    async fn test_expected_document_conflicts_with_url_filter() {
        let filter: UrlPredicate = Arc::new(|url: &str| url.contains("example"));
        let watcher =
            LifecycleWatcher::new(FrameId::new("main"), vec![Milestone::Load], Some(filter));
        let err = watcher
            .set_expected_document(DocumentId::new("d1"), "https://a/")
            .expect_err("must reject");
        assert!(matches!(err, Error::InvalidUsage(_)));
    }

    #[tokio::test]
    async fn test_set_expected_document_is_one_shot() {
        let watcher = load_watcher();
        watcher
            .set_expected_document(DocumentId::new("d1"), "https://a/")
            .expect("first set");
        let err = watcher
            .set_expected_document(DocumentId::new("d2"), "https://b/")
            .expect_err("second set must fail");
        assert!(matches!(err, Error::InvalidUsage(_)));
    }

    #[tokio::test]
    async fn test_url_filter_blocks_adoption() {
        let filter: UrlPredicate = Arc::new(|url: &str| url.ends_with("/target"));
        let watcher =
            LifecycleWatcher::new(FrameId::new("main"), vec![Milestone::Load], Some(filter));
        let mut tree = tree_with_main("https://a/other", "d1");
        watcher.on_committed_new_document(&FrameId::new("main"), &tree);

        tree.frame_mut(&FrameId::new("main"))
            .expect("main")
            .fire(Milestone::Load);
        watcher.on_lifecycle_event(&tree);
        // The committed URL fails the filter, so nothing may resolve
        assert_eq!(watcher.disposition(), Disposition::Pending);
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let watcher = load_watcher();
        watcher.terminate(Error::FrameDetached);
        watcher.terminate(Error::Disconnected);

        let err = watcher
            .terminated_tx
            .subscribe()
            .borrow()
            .clone()
            .expect("terminal error");
        // First terminal outcome sticks
        assert!(matches!(err, Error::FrameDetached));
        assert!(!watcher.is_active());
    }

    #[tokio::test]
    async fn test_aborted_navigation() {
        let tree = tree_with_main("", "");
        let watcher = load_watcher();
        let record = RequestRecord::new(
            "r1",
            Some(FrameId::new("main")),
            Some(DocumentId::new("d1")),
            "https://a/",
        );
        watcher.on_navigation_request(&record);
        watcher.on_aborted_new_document(
            &FrameId::new("main"),
            &DocumentId::new("d1"),
            "net::ERR_ABORTED; maybe frame was detached?",
        );
        assert_eq!(watcher.disposition(), Disposition::Terminated);
        drop(tree);
    }

    #[tokio::test]
    async fn test_same_document_branch() {
        let mut tree = tree_with_main("https://a/#x", "d1");
        tree.frame_mut(&FrameId::new("main"))
            .expect("main")
            .fire(Milestone::Load);

        let watcher = load_watcher();
        watcher.on_navigated_within_document(&FrameId::new("main"), &tree);
        assert_eq!(watcher.disposition(), Disposition::SameDocumentComplete);

        let outcome = watcher
            .same_document_tx
            .subscribe()
            .borrow()
            .clone()
            .expect("same-document outcome");
        assert_eq!(outcome.url(), "https://a/#x");
    }
}
