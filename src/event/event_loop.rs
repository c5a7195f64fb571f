use super::{EventQueue, WorkerPool};
use crate::pipeline::stage::{Flow, StageThread, StageWorker};
use crate::pipeline::state::StageControl;
use crate::pipeline::INPUT_WAIT;
use crate::queue::Wakeable;
use log::{debug, warn};
use std::sync::Arc;

/// Dequeues events and hands their work to the pool
pub struct EventLoopWorker {
    queue: Arc<EventQueue>,
    pool: Arc<WorkerPool>,
}

impl EventLoopWorker {
    pub fn new(queue: Arc<EventQueue>, pool: Arc<WorkerPool>) -> Self {
        Self { queue, pool }
    }
}

impl StageWorker for EventLoopWorker {
    fn step(&mut self, control: &StageControl) -> Flow {
        let Some(envelope) = self.queue.dequeue() else {
            if control.is_active() {
                self.queue.wait_started(INPUT_WAIT);
            }
            return Flow::Continue;
        };
        let Some(event) = envelope.into_item() else {
            return Flow::Continue;
        };

        let category = event.category();
        let name = event.name();
        debug!("EventLoop: dispatching {} event '{}'", category, name);
        let submitted = self.pool.submit(move || {
            if let Err(e) = event.work() {
                warn!("EventLoop: {} event '{}' failed: {:#}", category, name, e);
            }
        });
        if let Err(e) = submitted {
            warn!("EventLoop: dropped '{}': {}", name, e);
        }
        Flow::Continue
    }
}

/// The event loop thread
pub type EventLoop = StageThread<EventLoopWorker>;

impl EventLoop {
    pub fn for_queue(queue: Arc<EventQueue>, pool: Arc<WorkerPool>) -> Self {
        let wakers = vec![Arc::clone(&queue) as Arc<dyn Wakeable>];
        StageThread::new("EventLoop", EventLoopWorker::new(queue, pool), wakers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventCategory};
    use crate::pipeline::stage::{shutdown, PipelineStage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Counting(Arc<AtomicUsize>);

    impl Event for Counting {
        fn category(&self) -> EventCategory {
            EventCategory::Process
        }

        fn name(&self) -> &'static str {
            "count"
        }

        fn work(self: Box<Self>) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_events_executed_once_on_pool() {
        let queue = Arc::new(EventQueue::new("events", 3));
        let pool = Arc::new(WorkerPool::new("event-pool"));
        pool.start(2).unwrap();
        let event_loop = EventLoop::for_queue(Arc::clone(&queue), Arc::clone(&pool));
        event_loop.start().unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            assert!(queue.enqueue(Box::new(Counting(Arc::clone(&count)))));
        }
        for _ in 0..200 {
            if count.load(Ordering::SeqCst) == 10 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        shutdown(&[&event_loop]).unwrap();
        pool.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }
}
