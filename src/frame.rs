//! Frame Tree
//!
//! Frames form a tree per browser page. Each frame tracks its current
//! document, the lifecycle milestones that document has fired, and the
//! requests currently in flight against it. The [`FrameTree`] is the
//! registry the manager mutates and watchers read.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::events::Milestone;
use crate::request::{RequestId, RequestRecord};

/// Opaque frame identifier assigned by the browser process.
///
/// Stable across same-process navigations. On a cross-process main-frame
/// navigation the browser issues a new id; the tree remaps the existing
/// main-frame object to it so callers keep a stable handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameId(pub String);

impl FrameId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque token distinguishing successive documents loaded into one frame
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A node in the frame tree
#[derive(Debug)]
pub struct Frame {
    id: FrameId,
    url: String,
    name: String,
    document_id: Option<DocumentId>,
    parent: Option<FrameId>,
    children: Vec<FrameId>,
    fired: HashSet<Milestone>,
    inflight: SmallVec<[RequestId; 8]>,
}

impl Frame {
    fn new(id: FrameId, parent: Option<FrameId>) -> Self {
        Self {
            id,
            url: String::new(),
            name: String::new(),
            document_id: None,
            parent,
            children: Vec::new(),
            fired: HashSet::new(),
            inflight: SmallVec::new(),
        }
    }

    pub fn id(&self) -> &FrameId {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn document_id(&self) -> Option<&DocumentId> {
        self.document_id.as_ref()
    }

    pub fn parent(&self) -> Option<&FrameId> {
        self.parent.as_ref()
    }

    pub fn children(&self) -> &[FrameId] {
        &self.children
    }

    /// Whether `milestone` has fired for the current document
    pub fn has_fired(&self, milestone: Milestone) -> bool {
        self.fired.contains(&milestone)
    }

    /// Number of requests currently in flight against this frame
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    /// Record a fired milestone. Returns false if it had already fired for
    /// this document (duplicates and timer races are dropped here).
    pub(crate) fn fire(&mut self, milestone: Milestone) -> bool {
        self.fired.insert(milestone)
    }

    /// Replace the current document: new url/name/document id, milestones
    /// cleared. In-flight recomputation is done by the tree, which owns the
    /// request records.
    pub(crate) fn commit_new_document(&mut self, url: String, name: String, document: DocumentId) {
        self.url = url;
        self.name = name;
        self.document_id = Some(document);
        self.fired.clear();
    }

    pub(crate) fn set_url(&mut self, url: String) {
        self.url = url;
    }

    pub(crate) fn add_inflight(&mut self, id: RequestId) {
        if !self.inflight.contains(&id) {
            self.inflight.push(id);
        }
    }

    /// Remove a request from the in-flight list; returns whether it was present
    pub(crate) fn remove_inflight(&mut self, id: &RequestId) -> bool {
        if let Some(pos) = self.inflight.iter().position(|r| r == id) {
            self.inflight.remove(pos);
            true
        } else {
            false
        }
    }
}

/// Read-only view of a frame handed out to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameSnapshot {
    pub id: FrameId,
    pub parent: Option<FrameId>,
    pub children: Vec<FrameId>,
    pub url: String,
    pub name: String,
    pub document_id: Option<DocumentId>,
    /// True once the frame has been removed from the tree
    pub detached: bool,
}

impl FrameSnapshot {
    fn of(frame: &Frame) -> Self {
        Self {
            id: frame.id.clone(),
            parent: frame.parent.clone(),
            children: frame.children.clone(),
            url: frame.url.clone(),
            name: frame.name.clone(),
            document_id: frame.document_id.clone(),
            detached: false,
        }
    }

    /// Capture a final view of a frame leaving the tree
    pub(crate) fn detached(frame: &Frame) -> Self {
        let mut snap = Self::of(frame);
        snap.detached = true;
        snap
    }
}

/// Registry of all live frames plus the request table feeding them.
///
/// Owned by the manager and mutated only through its serialized event path.
#[derive(Debug, Default)]
pub struct FrameTree {
    frames: HashMap<FrameId, Frame>,
    main_frame: Option<FrameId>,
    requests: HashMap<RequestId, RequestRecord>,
}

impl FrameTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame(&self, id: &FrameId) -> Option<&Frame> {
        self.frames.get(id)
    }

    pub(crate) fn frame_mut(&mut self, id: &FrameId) -> Option<&mut Frame> {
        self.frames.get_mut(id)
    }

    pub fn main_frame_id(&self) -> Option<&FrameId> {
        self.main_frame.as_ref()
    }

    pub fn is_main_frame(&self, id: &FrameId) -> bool {
        self.main_frame.as_ref() == Some(id)
    }

    pub fn contains(&self, id: &FrameId) -> bool {
        self.frames.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Create a frame and link it under `parent` (or as the main frame)
    pub(crate) fn insert_frame(&mut self, id: FrameId, parent: Option<FrameId>) {
        let frame = Frame::new(id.clone(), parent.clone());
        self.frames.insert(id.clone(), frame);
        match parent {
            Some(parent_id) => {
                if let Some(parent) = self.frames.get_mut(&parent_id) {
                    parent.children.push(id);
                }
            }
            None => {
                self.main_frame = Some(id);
            }
        }
    }

    /// Remove a single frame, unlinking it from its parent. The caller is
    /// responsible for removing descendants first.
    pub(crate) fn remove_frame(&mut self, id: &FrameId) -> Option<Frame> {
        let frame = self.frames.remove(id)?;
        if let Some(parent_id) = &frame.parent {
            if let Some(parent) = self.frames.get_mut(parent_id) {
                parent.children.retain(|c| c != id);
            }
        }
        if self.main_frame.as_ref() == Some(id) {
            self.main_frame = None;
        }
        self.requests
            .retain(|_, r| r.frame_id.as_ref() != Some(id));
        Some(frame)
    }

    /// Remap the existing main frame to a new browser-assigned id,
    /// preserving the frame object across a cross-process navigation.
    pub(crate) fn remap_main_frame(&mut self, new_id: FrameId) -> bool {
        let Some(old_id) = self.main_frame.clone() else {
            return false;
        };
        if old_id == new_id {
            return false;
        }
        let Some(mut frame) = self.frames.remove(&old_id) else {
            return false;
        };
        frame.id = new_id.clone();
        let children = frame.children.clone();
        self.frames.insert(new_id.clone(), frame);
        for child in children {
            if let Some(child) = self.frames.get_mut(&child) {
                child.parent = Some(new_id.clone());
            }
        }
        for request in self.requests.values_mut() {
            if request.frame_id.as_ref() == Some(&old_id) {
                request.frame_id = Some(new_id.clone());
            }
        }
        self.main_frame = Some(new_id);
        true
    }

    /// Frame ids of the subtree rooted at `root`, pre-order
    pub fn subtree(&self, root: &FrameId) -> Vec<FrameId> {
        let mut out = Vec::new();
        let mut stack = vec![root.clone()];
        while let Some(id) = stack.pop() {
            let Some(frame) = self.frames.get(&id) else {
                continue;
            };
            for child in frame.children.iter().rev() {
                stack.push(child.clone());
            }
            out.push(id);
        }
        out
    }

    /// Whether every frame in the subtree rooted at `root` has fired all of
    /// `required` for its current document
    pub fn subtree_has_fired(&self, root: &FrameId, required: &[Milestone]) -> bool {
        if !self.frames.contains_key(root) {
            return false;
        }
        self.subtree(root).iter().all(|id| {
            self.frames
                .get(id)
                .map(|frame| required.iter().all(|m| frame.has_fired(*m)))
                .unwrap_or(false)
        })
    }

    /// All live frames, pre-order from the main frame. Frames that lost
    /// their link to the main frame (mid-remap states) are appended last.
    pub fn snapshot(&self) -> Vec<FrameSnapshot> {
        let mut out = Vec::with_capacity(self.frames.len());
        let mut seen = HashSet::new();
        if let Some(main) = &self.main_frame {
            for id in self.subtree(main) {
                if let Some(frame) = self.frames.get(&id) {
                    seen.insert(id);
                    out.push(FrameSnapshot::of(frame));
                }
            }
        }
        for (id, frame) in &self.frames {
            if !seen.contains(id) {
                out.push(FrameSnapshot::of(frame));
            }
        }
        out
    }

    pub fn request(&self, id: &RequestId) -> Option<&RequestRecord> {
        self.requests.get(id)
    }

    pub(crate) fn request_mut(&mut self, id: &RequestId) -> Option<&mut RequestRecord> {
        self.requests.get_mut(id)
    }

    pub(crate) fn insert_request(&mut self, record: RequestRecord) {
        self.requests.insert(record.id.clone(), record);
    }

    pub(crate) fn remove_request(&mut self, id: &RequestId) -> Option<RequestRecord> {
        self.requests.remove(id)
    }

    /// After a new document commits on `frame_id`, keep only in-flight
    /// requests that belong to the new document.
    pub(crate) fn retain_inflight_for_document(&mut self, frame_id: &FrameId, document: &DocumentId) {
        let keep: SmallVec<[RequestId; 8]> = {
            let Some(frame) = self.frames.get(frame_id) else {
                return;
            };
            frame
                .inflight
                .iter()
                .filter(|id| {
                    self.requests
                        .get(id)
                        .map(|r| r.document_id.as_ref() == Some(document))
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        };
        if let Some(frame) = self.frames.get_mut(frame_id) {
            frame.inflight = keep;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_with_main() -> FrameTree {
        let mut tree = FrameTree::new();
        tree.insert_frame(FrameId::new("main"), None);
        tree
    }

    #[test]
    fn test_insert_and_link() {
        let mut tree = tree_with_main();
        tree.insert_frame(FrameId::new("child"), Some(FrameId::new("main")));

        let main = tree.frame(&FrameId::new("main")).expect("main frame");
        assert_eq!(main.children(), &[FrameId::new("child")]);
        assert!(tree.is_main_frame(&FrameId::new("main")));
    }

    #[test]
    fn test_subtree_preorder() {
        let mut tree = tree_with_main();
        tree.insert_frame(FrameId::new("a"), Some(FrameId::new("main")));
        tree.insert_frame(FrameId::new("b"), Some(FrameId::new("main")));
        tree.insert_frame(FrameId::new("a1"), Some(FrameId::new("a")));

        let order = tree.subtree(&FrameId::new("main"));
        assert_eq!(
            order,
            vec![
                FrameId::new("main"),
                FrameId::new("a"),
                FrameId::new("a1"),
                FrameId::new("b"),
            ]
        );
    }

    #[test]
    fn test_commit_clears_milestones() {
        let mut tree = tree_with_main();
        let id = FrameId::new("main");
        let frame = tree.frame_mut(&id).expect("main frame");
        frame.fire(Milestone::Load);
        assert!(frame.has_fired(Milestone::Load));

        frame.commit_new_document(
            "https://example.com/".into(),
            String::new(),
            DocumentId::new("d1"),
        );
        assert!(!frame.has_fired(Milestone::Load));
        assert_eq!(frame.document_id(), Some(&DocumentId::new("d1")));
    }

    #[test]
    fn test_subtree_has_fired_requires_all_frames() {
        let mut tree = tree_with_main();
        tree.insert_frame(FrameId::new("child"), Some(FrameId::new("main")));

        let main_id = FrameId::new("main");
        tree.frame_mut(&main_id).expect("main").fire(Milestone::Load);
        assert!(!tree.subtree_has_fired(&main_id, &[Milestone::Load]));

        tree.frame_mut(&FrameId::new("child"))
            .expect("child")
            .fire(Milestone::Load);
        assert!(tree.subtree_has_fired(&main_id, &[Milestone::Load]));
    }

    #[test]
    fn test_remap_main_frame_preserves_state() {
        let mut tree = tree_with_main();
        let old = FrameId::new("main");
        tree.frame_mut(&old)
            .expect("main")
            .commit_new_document("https://a/".into(), String::new(), DocumentId::new("d1"));

        assert!(tree.remap_main_frame(FrameId::new("main2")));
        assert!(!tree.contains(&old));
        let remapped = tree.frame(&FrameId::new("main2")).expect("remapped");
        assert_eq!(remapped.url(), "https://a/");
        assert!(tree.is_main_frame(&FrameId::new("main2")));
    }

    #[test]
    fn test_remove_frame_drops_requests() {
        let mut tree = tree_with_main();
        let id = FrameId::new("main");
        let record = RequestRecord::new("r1", Some(id.clone()), None, "https://a/x.js");
        tree.insert_request(record.clone());
        tree.frame_mut(&id).expect("main").add_inflight(record.id.clone());

        tree.remove_frame(&id);
        assert!(tree.request(&RequestId::new("r1")).is_none());
        assert!(tree.is_empty());
    }
}
