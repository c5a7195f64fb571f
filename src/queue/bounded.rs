use super::Wakeable;
use log::trace;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Payload of one queue slot
#[derive(Debug)]
pub enum QueueItem<T> {
    /// A regular payload
    Item(T),
    /// Marks the start of a new serial; consumers reset codec state
    Flush,
    /// No further input on this logical stream
    Eof,
}

/// One slot of a [`BoundedQueue`]: payload plus the serial it was queued under
#[derive(Debug)]
pub struct Envelope<T> {
    pub serial: u64,
    pub item: QueueItem<T>,
}

impl<T> Envelope<T> {
    pub fn is_eof(&self) -> bool {
        matches!(self.item, QueueItem::Eof)
    }

    pub fn into_item(self) -> Option<T> {
        match self.item {
            QueueItem::Item(item) => Some(item),
            _ => None,
        }
    }
}

struct Inner<T> {
    items: VecDeque<Envelope<T>>,
    stopped: bool,
    serial: u64,
}

/// Capacity-limited, thread-safe FIFO
///
/// Ownership of an item moves into the queue on enqueue and out of it on
/// dequeue. Items discarded by [`clear`](Self::clear),
/// [`flush_stale`](Self::flush_stale) or a rejected enqueue are released through
/// their `Drop` impl.
pub struct BoundedQueue<T> {
    name: String,
    capacity: usize,
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.max(1)),
                stopped: false,
                serial: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn serial(&self) -> u64 {
        self.inner.lock().serial
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().stopped
    }

    /// Allow blocking operations again after a [`wake_all`](Self::wake_all)
    pub fn start(&self) {
        let mut inner = self.inner.lock();
        inner.stopped = false;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Wait at most `timeout` for [`start`](Self::start) on a stopped queue.
    ///
    /// Returns whether the queue is running. Any broadcast ends the wait early.
    pub fn wait_started(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        if inner.stopped {
            let _ = self.not_empty.wait_for(&mut inner, timeout);
        }
        !inner.stopped
    }

    /// Block while full, then queue `item`.
    ///
    /// Returns `false` when the queue is stopped; `item` is dropped in that case.
    pub fn enqueue(&self, item: T) -> bool {
        self.push(QueueItem::Item(item), false)
    }

    /// Queue `item` without blocking.
    ///
    /// `Err(item)` hands the item back when the queue is full; `Ok(false)` means
    /// the queue was stopped and the item released.
    pub fn try_enqueue(&self, item: T) -> Result<bool, T> {
        let mut inner = self.inner.lock();
        if inner.stopped {
            drop(inner);
            drop(item);
            return Ok(false);
        }
        if inner.items.len() >= self.capacity {
            return Err(item);
        }
        let serial = inner.serial;
        inner.items.push_back(Envelope {
            serial,
            item: QueueItem::Item(item),
        });
        self.not_empty.notify_one();
        Ok(true)
    }

    /// Queue the EOF sentinel
    pub fn enqueue_eof(&self) -> bool {
        self.push(QueueItem::Eof, false)
    }

    /// Start a new serial and queue a flush marker tagged with it
    pub fn enqueue_flush(&self) -> bool {
        self.push(QueueItem::Flush, true)
    }

    /// Start a new serial without queueing a marker
    pub fn advance_serial(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.serial += 1;
        inner.serial
    }

    fn push(&self, item: QueueItem<T>, bump_serial: bool) -> bool {
        let mut inner = self.inner.lock();
        while inner.items.len() >= self.capacity && !inner.stopped {
            self.not_full.wait(&mut inner);
        }
        if inner.stopped {
            trace!("Queue[{}]: rejected item after stop", self.name);
            return false;
        }
        if bump_serial {
            inner.serial += 1;
        }
        let serial = inner.serial;
        inner.items.push_back(Envelope { serial, item });
        self.not_empty.notify_one();
        true
    }

    /// Block until an item is available; `None` once the queue is stopped
    pub fn dequeue(&self) -> Option<Envelope<T>> {
        let mut inner = self.inner.lock();
        while inner.items.is_empty() && !inner.stopped {
            self.not_empty.wait(&mut inner);
        }
        self.pop(&mut inner)
    }

    /// As [`dequeue`](Self::dequeue), giving up after `timeout`
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<Envelope<T>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.items.is_empty() && !inner.stopped {
            if self.not_empty.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        self.pop(&mut inner)
    }

    pub fn try_dequeue(&self) -> Option<Envelope<T>> {
        let mut inner = self.inner.lock();
        self.pop(&mut inner)
    }

    fn pop(&self, inner: &mut Inner<T>) -> Option<Envelope<T>> {
        if inner.stopped {
            return None;
        }
        let envelope = inner.items.pop_front()?;
        self.not_full.notify_one();
        Some(envelope)
    }

    /// Inspect the head of the queue without removing it
    pub fn peek<R>(&self, f: impl FnOnce(&Envelope<T>) -> R) -> Option<R> {
        let inner = self.inner.lock();
        inner.items.front().map(f)
    }

    /// Stop the queue and release every blocked producer and consumer
    pub fn wake_all(&self) {
        let mut inner = self.inner.lock();
        inner.stopped = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Stop the queue and drop its contents
    pub fn close(&self) {
        self.wake_all();
        self.clear();
    }

    /// Drop every queued item, returning how many were discarded
    pub fn clear(&self) -> usize {
        let drained: Vec<Envelope<T>> = {
            let mut inner = self.inner.lock();
            let drained = inner.items.drain(..).collect();
            self.not_full.notify_all();
            drained
        };
        drained.len()
    }

    /// Drop items queued under an older serial, keeping the current epoch
    pub fn flush_stale(&self) -> usize {
        let stale: VecDeque<Envelope<T>> = {
            let mut inner = self.inner.lock();
            let serial = inner.serial;
            let (keep, stale): (VecDeque<_>, VecDeque<_>) =
                inner.items.drain(..).partition(|e| e.serial == serial);
            inner.items = keep;
            if !stale.is_empty() {
                self.not_full.notify_all();
            }
            stale
        };
        if !stale.is_empty() {
            trace!("Queue[{}]: flushed {} stale items", self.name, stale.len());
        }
        stale.len()
    }
}

impl<T: Send> Wakeable for BoundedQueue<T> {
    fn wake(&self) {
        self.wake_all();
    }

    fn restart(&self) {
        self.start();
    }

    fn label(&self) -> &str {
        &self.name
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BoundedQueue")
            .field("name", &self.name)
            .field("len", &inner.items.len())
            .field("capacity", &self.capacity)
            .field("serial", &inner.serial)
            .field("stopped", &inner.stopped)
            .finish()
    }
}
