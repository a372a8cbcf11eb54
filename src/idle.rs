//! Network-Idle Timers
//!
//! The browser process does not report "network idle" natively, so the
//! scheduler synthesizes the two idle milestones from in-flight request
//! counts: one quiet-period timer per frame per idle milestone. A firing
//! timer never touches the tree directly; it loops a `FrameLifecycle`
//! event back through the manager's serialized apply path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::events::{Milestone, TransportEvent};
use crate::frame::FrameId;

type TimerKey = (FrameId, Milestone);
type TimerMap = HashMap<TimerKey, JoinHandle<()>>;

/// Per-frame, per-milestone quiet-period timers
pub(crate) struct IdleScheduler {
    quiet_period: Duration,
    loopback: mpsc::UnboundedSender<TransportEvent>,
    timers: Arc<Mutex<TimerMap>>,
}

impl IdleScheduler {
    pub(crate) fn new(quiet_period: Duration, loopback: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            quiet_period,
            loopback,
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(timers: &Mutex<TimerMap>) -> std::sync::MutexGuard<'_, TimerMap> {
        timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the quiet-period timer for `(frame, milestone)`. No-op if one
    /// is already running.
    pub(crate) fn start(&self, frame_id: &FrameId, milestone: Milestone) {
        let key = (frame_id.clone(), milestone);
        let mut timers = Self::lock(&self.timers);
        if timers.contains_key(&key) {
            return;
        }
        trace!(frame = %frame_id, milestone = %milestone, "idle timer started");
        let quiet = self.quiet_period;
        let loopback = self.loopback.clone();
        let map = Arc::clone(&self.timers);
        let frame_id = frame_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(quiet).await;
            Self::lock(&map).remove(&(frame_id.clone(), milestone));
            // Receiver gone means the manager is shutting down
            let _ = loopback.send(TransportEvent::FrameLifecycle {
                frame_id,
                milestone,
            });
        });
        timers.insert(key, handle);
    }

    /// Cancel the timer for `(frame, milestone)`. No-op if none is running.
    pub(crate) fn cancel(&self, frame_id: &FrameId, milestone: Milestone) {
        let key = (frame_id.clone(), milestone);
        if let Some(handle) = Self::lock(&self.timers).remove(&key) {
            trace!(frame = %frame_id, milestone = %milestone, "idle timer canceled");
            handle.abort();
        }
    }

    /// Cancel every timer for a frame (detach, identity remap)
    pub(crate) fn cancel_frame(&self, frame_id: &FrameId) {
        let mut timers = Self::lock(&self.timers);
        timers.retain(|(id, _), handle| {
            if id == frame_id {
                handle.abort();
                false
            } else {
                true
            }
        });
    }

    /// Cancel all timers (disconnect, shutdown)
    pub(crate) fn cancel_all(&self) {
        let mut timers = Self::lock(&self.timers);
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self, frame_id: &FrameId, milestone: Milestone) -> bool {
        Self::lock(&self.timers).contains_key(&(frame_id.clone(), milestone))
    }
}

impl Drop for IdleScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_quiet_period() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = IdleScheduler::new(Duration::from_millis(500), tx);
        let frame = FrameId::new("f1");

        scheduler.start(&frame, Milestone::NetworkIdle0);
        assert!(scheduler.is_running(&frame, Milestone::NetworkIdle0));

        tokio::time::sleep(Duration::from_millis(501)).await;
        let event = rx.recv().await.expect("synthesized event");
        match event {
            TransportEvent::FrameLifecycle {
                frame_id,
                milestone,
            } => {
                assert_eq!(frame_id, frame);
                assert_eq!(milestone, Milestone::NetworkIdle0);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(!scheduler.is_running(&frame, Milestone::NetworkIdle0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = IdleScheduler::new(Duration::from_millis(500), tx);
        let frame = FrameId::new("f1");

        scheduler.start(&frame, Milestone::NetworkIdle0);
        tokio::time::sleep(Duration::from_millis(300)).await;
        scheduler.cancel(&frame, Milestone::NetworkIdle0);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = IdleScheduler::new(Duration::from_millis(500), tx);
        let frame = FrameId::new("f1");

        scheduler.start(&frame, Milestone::NetworkIdle0);
        tokio::time::sleep(Duration::from_millis(400)).await;
        // Second start must not reset the already-running timer
        scheduler.start(&frame, Milestone::NetworkIdle0);
        tokio::time::sleep(Duration::from_millis(101)).await;

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_milestone_timers_are_independent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = IdleScheduler::new(Duration::from_millis(500), tx);
        let frame = FrameId::new("f1");

        scheduler.start(&frame, Milestone::NetworkIdle0);
        scheduler.start(&frame, Milestone::NetworkIdle2);
        scheduler.cancel(&frame, Milestone::NetworkIdle0);

        tokio::time::sleep(Duration::from_millis(501)).await;
        let event = rx.recv().await.expect("idle2 event");
        match event {
            TransportEvent::FrameLifecycle { milestone, .. } => {
                assert_eq!(milestone, Milestone::NetworkIdle2);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_nonexistent_is_noop() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let scheduler = IdleScheduler::new(Duration::from_millis(500), tx);
        scheduler.cancel(&FrameId::new("ghost"), Milestone::NetworkIdle0);
        scheduler.cancel_frame(&FrameId::new("ghost"));
    }
}
