//! Which live source feeds a filter/mix stage

use crate::pipeline::types::{MediaKind, SourceKind};
use crate::queue::{FrameQueue, Wakeable};
use log::debug;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Selection {
    current: Option<(SourceKind, Arc<FrameQueue>)>,
    stopped: bool,
}

/// Current input of one filter stage
///
/// Source events swap the selection while the filter thread keeps running;
/// the filter re-reads it on every iteration.
pub struct SourceSelector {
    media: MediaKind,
    label: String,
    inner: Mutex<Selection>,
    changed: Condvar,
}

impl SourceSelector {
    pub fn new(media: MediaKind) -> Self {
        Self {
            media,
            label: format!("selector[{}]", media),
            inner: Mutex::new(Selection::default()),
            changed: Condvar::new(),
        }
    }

    pub fn media(&self) -> MediaKind {
        self.media
    }

    pub fn select(&self, kind: SourceKind, frames: Arc<FrameQueue>) {
        debug_assert_eq!(kind.media(), self.media);
        let mut inner = self.inner.lock();
        inner.current = Some((kind, frames));
        debug!("{}: selected {}", self.label, kind);
        self.changed.notify_all();
    }

    /// Drop the selection if it is `kind`; returns whether it was
    pub fn deselect(&self, kind: SourceKind) -> bool {
        let mut inner = self.inner.lock();
        if inner.current.as_ref().is_some_and(|(k, _)| *k == kind) {
            inner.current = None;
            self.changed.notify_all();
            return true;
        }
        false
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.current = None;
        self.changed.notify_all();
    }

    pub fn current(&self) -> Option<(SourceKind, Arc<FrameQueue>)> {
        self.inner.lock().current.clone()
    }

    pub fn selected(&self) -> Option<SourceKind> {
        self.inner.lock().current.as_ref().map(|(k, _)| *k)
    }

    /// Wait at most `timeout` for a selection; returns early on `wake`
    pub fn wait_for_input(&self, timeout: Duration) -> Option<(SourceKind, Arc<FrameQueue>)> {
        let mut inner = self.inner.lock();
        if inner.current.is_none() && !inner.stopped {
            let _ = self.changed.wait_for(&mut inner, timeout);
        }
        inner.current.clone()
    }
}

impl Wakeable for SourceSelector {
    fn wake(&self) {
        let mut inner = self.inner.lock();
        inner.stopped = true;
        self.changed.notify_all();
    }

    fn restart(&self) {
        self.inner.lock().stopped = false;
    }

    fn label(&self) -> &str {
        &self.label
    }
}
