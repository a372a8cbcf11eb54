//! Frame Tree Manager
//!
//! Single source of truth for the frame tree and single dispatch point for
//! every tree-affecting notification. All mutation funnels through one
//! serialized apply path (transport events and timer-synthesized idle
//! events alike), which keeps the watcher race resolution deterministic.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::events::{Milestone, PageSignal, TransportEvent, IDLE_MILESTONES};
use crate::frame::{FrameId, FrameSnapshot, FrameTree};
use crate::idle::IdleScheduler;
use crate::request::{RequestRecord, RequestState};
use crate::watcher::{LifecycleWatcher, UrlPredicate, WatcherHandle};
use crate::WatchConfig;

/// Frame tree registry and notification dispatcher for one browser session.
///
/// One instance per page/session; dropping it stops the loopback pump and
/// every idle timer.
pub struct FrameManager {
    shared: Arc<Shared>,
    pump: JoinHandle<()>,
}

struct Shared {
    /// The single logical writer: every event applies under this lock
    tree: Mutex<FrameTree>,
    /// Active watchers; dispatch iterates a snapshot so watchers may
    /// resolve (and unregister) mid-fan-out
    watchers: Mutex<Vec<Arc<LifecycleWatcher>>>,
    signals: broadcast::Sender<PageSignal>,
    idle: IdleScheduler,
    loopback: mpsc::UnboundedSender<TransportEvent>,
}

impl FrameManager {
    /// Create a manager with the given configuration
    pub fn new(config: WatchConfig) -> Self {
        let (loopback, rx) = mpsc::unbounded_channel();
        let (signals, _) = broadcast::channel(config.signal_buffer);
        let shared = Arc::new(Shared {
            tree: Mutex::new(FrameTree::new()),
            watchers: Mutex::new(Vec::new()),
            signals,
            idle: IdleScheduler::new(
                Duration::from_millis(config.idle_quiet_ms),
                loopback.clone(),
            ),
            loopback,
        });
        let pump = tokio::spawn(Self::pump_loop(Arc::clone(&shared), rx));
        Self { shared, pump }
    }

    /// Drain the loopback channel: timer firings (and any transport that
    /// feeds events through [`FrameManager::event_sender`]) re-enter the
    /// serialized apply path here instead of mutating state directly.
    async fn pump_loop(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = rx.recv().await {
            shared.apply(event).await;
        }
    }

    /// Apply one transport notification.
    ///
    /// Callers must deliver events in the order the browser produced them;
    /// application is serialized internally.
    pub async fn handle_event(&self, event: TransportEvent) {
        self.shared.apply(event).await;
    }

    /// A cloneable sender feeding the serialized apply loop, for transports
    /// that push events without holding the manager
    pub fn event_sender(&self) -> mpsc::UnboundedSender<TransportEvent> {
        self.shared.loopback.clone()
    }

    /// Subscribe to page-level signals
    pub fn subscribe(&self) -> broadcast::Receiver<PageSignal> {
        self.shared.signals.subscribe()
    }

    /// All live frames, pre-order from the main frame
    pub async fn frames(&self) -> Vec<FrameSnapshot> {
        self.shared.tree.lock().await.snapshot()
    }

    /// Read view of a single frame
    pub async fn frame(&self, id: &FrameId) -> Option<FrameSnapshot> {
        let tree = self.shared.tree.lock().await;
        let snapshot = tree.snapshot();
        snapshot.into_iter().find(|f| &f.id == id)
    }

    /// Read view of the main frame
    pub async fn main_frame(&self) -> Option<FrameSnapshot> {
        let tree = self.shared.tree.lock().await;
        let id = tree.main_frame_id()?.clone();
        drop(tree);
        self.frame(&id).await
    }

    /// Number of watchers still registered
    pub async fn active_watchers(&self) -> usize {
        let mut watchers = self.shared.watchers.lock().await;
        watchers.retain(|w| w.is_active());
        watchers.len()
    }

    /// Register a watcher for a navigation on `frame_id`.
    ///
    /// `milestones` defaults to `[load]` when empty. `url_filter` and the
    /// handle's `set_expected_document` are mutually exclusive. A timeout,
    /// if given, is a pure client-side deadline; it cancels nothing in the
    /// browser.
    pub async fn attach_watcher(
        &self,
        frame_id: &FrameId,
        milestones: Vec<Milestone>,
        url_filter: Option<UrlPredicate>,
        timeout: Option<Duration>,
    ) -> Result<WatcherHandle> {
        let tree = self.shared.tree.lock().await;
        if !tree.contains(frame_id) {
            return Err(Error::FrameNotFound(frame_id.to_string()));
        }
        let milestones = if milestones.is_empty() {
            vec![Milestone::Load]
        } else {
            milestones
        };
        let watcher = Arc::new(LifecycleWatcher::new(
            frame_id.clone(),
            milestones,
            url_filter,
        ));
        if let Some(deadline) = timeout {
            let target = Arc::clone(&watcher);
            let ms = deadline.as_millis() as u64;
            let task = tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                target.terminate(Error::timeout_after(ms));
            });
            watcher.set_deadline(task.abort_handle());
        }
        // The required milestones may already be satisfied (about:blank,
        // same-URL fragment navigations)
        watcher.recheck(&tree);
        drop(tree);

        self.shared
            .watchers
            .lock()
            .await
            .push(Arc::clone(&watcher));
        trace!(frame = %frame_id, "navigation watcher attached");
        Ok(WatcherHandle::new(watcher))
    }
}

impl Drop for FrameManager {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl Shared {
    /// Snapshot the active watcher set for one fan-out round, pruning
    /// watchers that terminated or were disposed
    async fn active_watchers(&self) -> Vec<Arc<LifecycleWatcher>> {
        let mut watchers = self.watchers.lock().await;
        watchers.retain(|w| w.is_active());
        watchers.clone()
    }

    fn signal(&self, signal: PageSignal) {
        // No subscribers is fine
        let _ = self.signals.send(signal);
    }

    async fn apply(&self, event: TransportEvent) {
        let mut tree = self.tree.lock().await;
        match event {
            TransportEvent::FrameAttached {
                frame_id,
                parent_id,
            } => {
                let parent_id = parent_id.filter(|p| !p.as_str().is_empty());
                self.on_frame_attached(&mut tree, frame_id, parent_id).await;
            }
            TransportEvent::FrameDetached { frame_id } => {
                self.on_frame_detached(&mut tree, &frame_id).await;
            }
            TransportEvent::FrameCommittedNewDocument {
                frame_id,
                url,
                name,
                document_id,
                is_initial,
            } => {
                self.on_committed_new_document(
                    &mut tree,
                    frame_id,
                    url,
                    name,
                    document_id,
                    is_initial,
                )
                .await;
            }
            TransportEvent::FrameCommittedSameDocument { frame_id, url } => {
                self.on_committed_same_document(&mut tree, frame_id, url)
                    .await;
            }
            TransportEvent::FrameLifecycle {
                frame_id,
                milestone,
            } => {
                self.on_lifecycle(&mut tree, frame_id, milestone).await;
            }
            TransportEvent::RequestStarted(record) => {
                self.on_request_started(&mut tree, record).await;
            }
            TransportEvent::RequestFinished { request_id } => {
                let Some(mut record) = tree.remove_request(&request_id) else {
                    trace!(request = %request_id, "finish for unknown request");
                    return;
                };
                record.state = RequestState::Finished;
                self.settle_request(&mut tree, &record);
            }
            TransportEvent::RequestFailed {
                request_id,
                error_text,
                canceled,
            } => {
                self.on_request_failed(&mut tree, request_id, error_text, canceled)
                    .await;
            }
            TransportEvent::ClientDisconnected => {
                drop(tree);
                self.on_disconnected().await;
            }
        }
    }

    async fn on_frame_attached(
        &self,
        tree: &mut FrameTree,
        frame_id: FrameId,
        parent_id: Option<FrameId>,
    ) {
        match parent_id {
            None => {
                if tree.contains(&frame_id) {
                    trace!(frame = %frame_id, "duplicate main-frame attach");
                    return;
                }
                if let Some(old_id) = tree.main_frame_id().cloned() {
                    // Cross-process navigation: the browser issued a new id
                    // for the same logical main frame. Remap the existing
                    // object so callers keep a stable handle, and point
                    // pending watchers at the new id so they keep tracking
                    // the same logical frame.
                    if tree.remap_main_frame(frame_id.clone()) {
                        self.idle.cancel_frame(&old_id);
                        let watchers = self.active_watchers().await;
                        for watcher in &watchers {
                            watcher.retarget(&old_id, &frame_id);
                        }
                        debug!(old = %old_id, new = %frame_id, "main frame identity remapped");
                    }
                } else {
                    tree.insert_frame(frame_id.clone(), None);
                    debug!(frame = %frame_id, "main frame attached");
                    self.signal(PageSignal::FrameAttached { frame_id });
                }
            }
            Some(parent) => {
                if tree.contains(&frame_id) {
                    trace!(frame = %frame_id, "duplicate frame attach");
                    return;
                }
                if !tree.contains(&parent) {
                    debug!(frame = %frame_id, parent = %parent, "attach under unknown parent dropped");
                    return;
                }
                tree.insert_frame(frame_id.clone(), Some(parent));
                self.signal(PageSignal::FrameAttached { frame_id });
            }
        }
    }

    /// Remove `root` and all descendants, children first. Collects a final
    /// snapshot of each removed frame in post-order.
    fn detach_subtree(
        &self,
        tree: &mut FrameTree,
        root: &FrameId,
        removed: &mut Vec<FrameSnapshot>,
    ) {
        let Some(frame) = tree.frame(root) else {
            return;
        };
        let children = frame.children().to_vec();
        for child in &children {
            self.detach_subtree(tree, child, removed);
        }
        if let Some(frame) = tree.remove_frame(root) {
            self.idle.cancel_frame(root);
            removed.push(FrameSnapshot::detached(&frame));
        }
    }

    async fn on_frame_detached(&self, tree: &mut FrameTree, frame_id: &FrameId) {
        let mut removed = Vec::new();
        self.detach_subtree(tree, frame_id, &mut removed);
        if removed.is_empty() {
            trace!(frame = %frame_id, "detach for unknown frame");
            return;
        }
        let watchers = self.active_watchers().await;
        for snapshot in &removed {
            for watcher in &watchers {
                watcher.on_frame_detached(&snapshot.id, tree);
            }
            self.signal(PageSignal::FrameDetached {
                frame: snapshot.clone(),
            });
        }
        debug!(frame = %frame_id, removed = removed.len(), "frame subtree detached");
    }

    async fn on_committed_new_document(
        &self,
        tree: &mut FrameTree,
        frame_id: FrameId,
        url: String,
        name: String,
        document_id: crate::frame::DocumentId,
        is_initial: bool,
    ) {
        if !tree.contains(&frame_id) {
            debug!(frame = %frame_id, "commit for unknown frame dropped");
            return;
        }

        // A new document has no children yet
        let children = tree
            .frame(&frame_id)
            .map(|f| f.children().to_vec())
            .unwrap_or_default();
        let mut removed = Vec::new();
        for child in &children {
            self.detach_subtree(tree, child, &mut removed);
        }
        if !removed.is_empty() {
            let watchers = self.active_watchers().await;
            for snapshot in &removed {
                for watcher in &watchers {
                    watcher.on_frame_detached(&snapshot.id, tree);
                }
                self.signal(PageSignal::FrameDetached {
                    frame: snapshot.clone(),
                });
            }
        }

        if let Some(frame) = tree.frame_mut(&frame_id) {
            frame.commit_new_document(url.clone(), name, document_id.clone());
        }
        tree.retain_inflight_for_document(&frame_id, &document_id);

        // Fresh document, fresh quiet periods
        let inflight = tree
            .frame(&frame_id)
            .map(|f| f.inflight_count())
            .unwrap_or(0);
        for milestone in IDLE_MILESTONES {
            self.idle.cancel(&frame_id, milestone);
            if let Some(threshold) = milestone.idle_threshold() {
                if inflight <= threshold {
                    self.idle.start(&frame_id, milestone);
                }
            }
        }

        trace!(frame = %frame_id, document = %document_id, %url, "new document committed");
        if !is_initial {
            let watchers = self.active_watchers().await;
            for watcher in &watchers {
                watcher.on_committed_new_document(&frame_id, tree);
            }
            self.signal(PageSignal::FrameNavigated { frame_id, url });
        }
    }

    async fn on_committed_same_document(&self, tree: &mut FrameTree, frame_id: FrameId, url: String) {
        let Some(frame) = tree.frame_mut(&frame_id) else {
            debug!(frame = %frame_id, "same-document commit for unknown frame dropped");
            return;
        };
        frame.set_url(url.clone());
        let watchers = self.active_watchers().await;
        for watcher in &watchers {
            watcher.on_navigated_within_document(&frame_id, tree);
        }
        self.signal(PageSignal::FrameNavigated { frame_id, url });
    }

    async fn on_lifecycle(&self, tree: &mut FrameTree, frame_id: FrameId, milestone: Milestone) {
        let Some(frame) = tree.frame_mut(&frame_id) else {
            trace!(frame = %frame_id, milestone = %milestone, "lifecycle for unknown frame");
            return;
        };
        if !frame.fire(milestone) {
            // Duplicate (or a timer that lost a cancellation race); the
            // fired set is idempotent so this stays a no-op
            return;
        }
        trace!(frame = %frame_id, milestone = %milestone, "lifecycle milestone fired");

        let watchers = self.active_watchers().await;
        for watcher in &watchers {
            watcher.on_lifecycle_event(tree);
        }
        if tree.is_main_frame(&frame_id) {
            match milestone {
                Milestone::Load => self.signal(PageSignal::Load),
                Milestone::DomContentLoaded => self.signal(PageSignal::DomContentLoaded),
                _ => {}
            }
        }
    }

    async fn on_request_started(&self, tree: &mut FrameTree, record: RequestRecord) {
        if tree.request(&record.id).is_some() || record.redirect_index > 0 {
            // Redirect hop: same request id, new URL. The idle slot is
            // unchanged and a hop is never a navigation request.
            if let Some(existing) = tree.request_mut(&record.id) {
                existing.url = record.url;
                existing.redirect_index = record.redirect_index;
                existing.document_id = record.document_id;
            } else {
                tree.insert_request(record);
            }
            return;
        }

        let counts = record.counts_toward_idle();
        let is_navigation = record.is_navigation_request();
        tree.insert_request(record.clone());

        let Some(frame_id) = record.frame_id.clone() else {
            return;
        };
        let Some(frame) = tree.frame_mut(&frame_id) else {
            trace!(frame = %frame_id, request = %record.id, "request for unknown frame");
            return;
        };

        if counts {
            frame.add_inflight(record.id.clone());
            let inflight = frame.inflight_count();
            for milestone in IDLE_MILESTONES {
                if let Some(threshold) = milestone.idle_threshold() {
                    // Crossing from idle to busy for this threshold
                    if inflight == threshold + 1 {
                        self.idle.cancel(&frame_id, milestone);
                    }
                }
            }
        }
        if is_navigation {
            let watchers = self.active_watchers().await;
            for watcher in &watchers {
                watcher.on_navigation_request(&record);
            }
        }
    }

    /// Drop a terminal request from its frame's in-flight list and start
    /// idle timers for any threshold the count just dropped to
    fn settle_request(&self, tree: &mut FrameTree, record: &RequestRecord) {
        let Some(frame_id) = &record.frame_id else {
            return;
        };
        let Some(frame) = tree.frame_mut(frame_id) else {
            return;
        };
        if !frame.remove_inflight(&record.id) {
            return;
        }
        let inflight = frame.inflight_count();
        for milestone in IDLE_MILESTONES {
            if let Some(threshold) = milestone.idle_threshold() {
                if inflight == threshold && !frame.has_fired(milestone) {
                    self.idle.start(frame_id, milestone);
                }
            }
        }
    }

    async fn on_request_failed(
        &self,
        tree: &mut FrameTree,
        request_id: crate::request::RequestId,
        error_text: String,
        canceled: bool,
    ) {
        let Some(mut record) = tree.remove_request(&request_id) else {
            trace!(request = %request_id, "failure for unknown request");
            return;
        };
        record.state = RequestState::Failed;
        self.settle_request(tree, &record);

        // A failed request for a document that never became current is an
        // aborted provisional navigation
        if let (Some(frame_id), Some(document_id)) =
            (record.frame_id.clone(), record.document_id.clone())
        {
            let is_current = tree
                .frame(&frame_id)
                .map(|f| f.document_id() == Some(&document_id))
                .unwrap_or(false);
            if tree.contains(&frame_id) && !is_current {
                let reason = if canceled {
                    format!("{}; maybe frame was detached?", error_text)
                } else {
                    error_text
                };
                let watchers = self.active_watchers().await;
                for watcher in &watchers {
                    watcher.on_aborted_new_document(&frame_id, &document_id, &reason);
                }
            }
        }
    }

    async fn on_disconnected(&self) {
        warn!("client disconnected; terminating all pending watchers");
        let watchers = {
            let mut guard = self.watchers.lock().await;
            std::mem::take(&mut *guard)
        };
        for watcher in watchers {
            watcher.terminate(Error::Disconnected);
        }
        self.idle.cancel_all();
    }
}
