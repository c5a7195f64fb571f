//! Pipeline stage trait and thread wrapper
//!
//! A stage is one OS thread running one [`StageWorker`]. [`StageThread`] owns
//! the thread, the worker (parked inside it while the thread is not running)
//! and the list of [`Wakeable`]s the worker can block on.

use crate::error::StageError;
use crate::pipeline::state::{StageControl, StageState};
use crate::queue::Wakeable;
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Outcome of one worker iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Finished,
}

/// Role-specific body of a stage thread
pub trait StageWorker: Send + 'static {
    /// One iteration of the run loop: dequeue from the upstream queue and
    /// move results downstream. Called while the stage is running or draining.
    fn step(&mut self, control: &StageControl) -> Flow;

    /// Runs on the stage thread after the loop ends, whatever the reason
    fn on_exit(&mut self) {}

    /// Release codec/container resources and reset counters
    fn close(&mut self) {}
}

/// Lifecycle contract shared by every stage
///
/// Teardown must follow `stop → wake → wait → close`; calls out of that order
/// are rejected with [`StageError`].
pub trait PipelineStage: Send + Sync {
    /// Get the stage name
    fn name(&self) -> &str;

    fn state(&self) -> StageState;

    /// Spawn the worker thread
    fn start(&self) -> Result<(), StageError>;

    /// Ask the worker loop to exit
    fn stop(&self) -> Result<(), StageError>;

    /// Ask the worker to finish its input and emit EOF
    fn drain(&self) -> Result<(), StageError>;

    /// Release anything the worker is blocked on
    fn wake(&self) -> Result<(), StageError>;

    /// Join the worker thread
    fn wait(&self) -> Result<(), StageError>;

    /// Release resources held by the worker
    fn close(&self) -> Result<(), StageError>;

    /// Whether the worker thread has exited (or was never started)
    fn is_finished(&self) -> bool;
}

/// Thread wrapper implementing [`PipelineStage`] for a worker
pub struct StageThread<W: StageWorker> {
    name: String,
    control: Arc<StageControl>,
    worker: Mutex<Option<W>>,
    handle: Mutex<Option<JoinHandle<W>>>,
    wakers: Vec<Arc<dyn Wakeable>>,
}

impl<W: StageWorker> StageThread<W> {
    pub fn new(name: impl Into<String>, worker: W, wakers: Vec<Arc<dyn Wakeable>>) -> Self {
        Self {
            name: name.into(),
            control: Arc::new(StageControl::new()),
            worker: Mutex::new(Some(worker)),
            handle: Mutex::new(None),
            wakers,
        }
    }

    pub fn control(&self) -> &Arc<StageControl> {
        &self.control
    }

    fn invalid(&self, action: &'static str, state: StageState) -> StageError {
        StageError::InvalidTransition {
            stage: self.name.clone(),
            action,
            state,
        }
    }
}

fn run_worker<W: StageWorker>(name: &str, mut worker: W, control: &StageControl) -> W {
    debug!("{}: thread started", name);
    while control.is_active() {
        if worker.step(control) == Flow::Finished {
            break;
        }
    }
    worker.on_exit();
    let _ = control.transition_any(&[StageState::Running, StageState::Draining], StageState::Stopped);
    debug!("{}: thread exited", name);
    worker
}

impl<W: StageWorker> PipelineStage for StageThread<W> {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> StageState {
        self.control.state()
    }

    fn start(&self) -> Result<(), StageError> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            if self.control.is_active() {
                return Ok(());
            }
            return Err(StageError::NotJoined(self.name.clone()));
        }
        let worker = self
            .worker
            .lock()
            .take()
            .ok_or_else(|| StageError::Panicked(self.name.clone()))?;

        if let Err(state) = self
            .control
            .transition_any(&[StageState::Stopped, StageState::Closed], StageState::Running)
        {
            *self.worker.lock() = Some(worker);
            return Err(self.invalid("start", state));
        }

        for waker in &self.wakers {
            waker.restart();
        }

        let control = Arc::clone(&self.control);
        let name = self.name.clone();
        let spawned = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || run_worker(&name, worker, &control));

        match spawned {
            Ok(h) => {
                *handle = Some(h);
                Ok(())
            }
            Err(e) => {
                let _ = self.control.transition(StageState::Running, StageState::Stopped);
                error!("{}: failed to spawn thread: {}", self.name, e);
                Err(StageError::Spawn(self.name.clone(), e))
            }
        }
    }

    fn stop(&self) -> Result<(), StageError> {
        match self
            .control
            .transition_any(&[StageState::Running, StageState::Draining], StageState::Stopped)
        {
            Ok(_) | Err(StageState::Stopped) | Err(StageState::Closed) => Ok(()),
            Err(state) => Err(self.invalid("stop", state)),
        }
    }

    fn drain(&self) -> Result<(), StageError> {
        match self.control.transition(StageState::Running, StageState::Draining) {
            Ok(()) | Err(StageState::Draining) | Err(StageState::Stopped) => Ok(()),
            Err(state) => Err(self.invalid("drain", state)),
        }
    }

    fn wake(&self) -> Result<(), StageError> {
        let state = self.control.state();
        if state.is_active() {
            return Err(self.invalid("wake", state));
        }
        for waker in &self.wakers {
            waker.wake();
        }
        Ok(())
    }

    fn wait(&self) -> Result<(), StageError> {
        let state = self.control.state();
        if state.is_active() {
            return Err(self.invalid("wait", state));
        }
        let Some(handle) = self.handle.lock().take() else {
            return Ok(());
        };
        match handle.join() {
            Ok(worker) => {
                *self.worker.lock() = Some(worker);
                Ok(())
            }
            Err(_) => {
                error!("{}: worker thread panicked", self.name);
                Err(StageError::Panicked(self.name.clone()))
            }
        }
    }

    fn close(&self) -> Result<(), StageError> {
        let state = self.control.state();
        if state.is_active() {
            return Err(self.invalid("close", state));
        }
        if self.handle.lock().is_some() {
            return Err(StageError::NotJoined(self.name.clone()));
        }
        if state == StageState::Closed {
            return Ok(());
        }
        if let Some(worker) = self.worker.lock().as_mut() {
            worker.close();
        }
        self.control
            .transition(StageState::Stopped, StageState::Closed)
            .map_err(|state| self.invalid("close", state))
    }

    fn is_finished(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|h| h.is_finished())
            .unwrap_or(true)
    }
}

impl<W: StageWorker> Drop for StageThread<W> {
    fn drop(&mut self) {
        if self.handle.get_mut().is_some() {
            warn!("{}: dropped while running, tearing down", self.name);
            let stage: &dyn PipelineStage = &*self;
            let _ = shutdown(&[stage]);
        }
    }
}

/// Run the mandatory `stop → wake → wait → close` sequence over `stages`.
///
/// Each phase completes for every stage before the next begins. All stages are
/// attempted; the first error is returned.
pub fn shutdown(stages: &[&dyn PipelineStage]) -> Result<(), StageError> {
    let mut first_err = None;
    let mut record = |res: Result<(), StageError>| {
        if let Err(e) = res {
            warn!("Teardown: {}", e);
            first_err.get_or_insert(e);
        }
    };

    for stage in stages {
        record(stage.stop());
    }
    for stage in stages {
        record(stage.wake());
    }
    for stage in stages {
        record(stage.wait());
    }
    for stage in stages {
        record(stage.close());
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{BoundedQueue, QueueItem};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    /// Moves numbers from one queue to another, like a codec stage would
    struct Relay {
        input: Arc<BoundedQueue<u32>>,
        output: Arc<BoundedQueue<u32>>,
        closed: Arc<AtomicUsize>,
    }

    impl StageWorker for Relay {
        fn step(&mut self, _control: &StageControl) -> Flow {
            match self.input.dequeue() {
                Some(envelope) => match envelope.item {
                    QueueItem::Item(n) => {
                        self.output.enqueue(n * 2);
                        Flow::Continue
                    }
                    QueueItem::Eof => {
                        self.output.enqueue_eof();
                        Flow::Finished
                    }
                    QueueItem::Flush => Flow::Continue,
                },
                None => Flow::Continue,
            }
        }

        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn relay_stage() -> (StageThread<Relay>, Arc<BoundedQueue<u32>>, Arc<BoundedQueue<u32>>, Arc<AtomicUsize>) {
        let input = Arc::new(BoundedQueue::new("in", 2));
        let output = Arc::new(BoundedQueue::new("out", 2));
        let closed = Arc::new(AtomicUsize::new(0));
        let stage = StageThread::new(
            "RelayStage",
            Relay {
                input: Arc::clone(&input),
                output: Arc::clone(&output),
                closed: Arc::clone(&closed),
            },
            vec![
                Arc::clone(&input) as Arc<dyn Wakeable>,
                Arc::clone(&output) as Arc<dyn Wakeable>,
            ],
        );
        (stage, input, output, closed)
    }

    #[test]
    fn test_relay_processes_until_eof() {
        let (stage, input, output, _) = relay_stage();
        stage.start().unwrap();
        input.enqueue(1);
        input.enqueue(2);
        input.enqueue_eof();

        let mut seen = Vec::new();
        while let Some(envelope) = output.dequeue() {
            if envelope.is_eof() {
                break;
            }
            seen.extend(envelope.into_item());
        }
        assert_eq!(seen, vec![2, 4]);

        // The worker exits by itself after EOF
        for _ in 0..100 {
            if stage.is_finished() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(stage.state(), StageState::Stopped);
        shutdown(&[&stage]).unwrap();
        assert_eq!(stage.state(), StageState::Closed);
    }

    #[test]
    fn test_out_of_order_teardown_rejected() {
        let (stage, _input, _output, closed) = relay_stage();
        stage.start().unwrap();

        // The worker is blocked on an empty input queue
        assert!(matches!(stage.wake(), Err(StageError::InvalidTransition { .. })));
        assert!(matches!(stage.wait(), Err(StageError::InvalidTransition { .. })));
        assert!(matches!(stage.close(), Err(StageError::InvalidTransition { .. })));

        // Stopped but not joined: closing would race the worker
        stage.stop().unwrap();
        assert!(matches!(stage.close(), Err(StageError::NotJoined(_))));
        assert_eq!(closed.load(Ordering::SeqCst), 0);

        stage.wake().unwrap();
        stage.wait().unwrap();
        stage.close().unwrap();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_documented_teardown_terminates() {
        let (stage, input, output, closed) = relay_stage();
        stage.start().unwrap();

        // Fill the output so the worker blocks on enqueue as well
        for i in 0..6 {
            input.try_enqueue(i).ok();
        }

        let (tx, rx) = mpsc::channel();
        let teardown = thread::spawn(move || {
            let res = shutdown(&[&stage]);
            tx.send(res.is_ok()).ok();
            stage
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(true));
        let stage = teardown.join().unwrap();
        assert_eq!(stage.state(), StageState::Closed);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(output.len() <= output.capacity());
    }

    #[test]
    fn test_restart_after_close() {
        let (stage, input, output, _) = relay_stage();
        stage.start().unwrap();
        shutdown(&[&stage]).unwrap();

        stage.start().unwrap();
        assert_eq!(stage.state(), StageState::Running);
        input.enqueue(5);
        assert_eq!(output.dequeue().and_then(|e| e.into_item()), Some(10));
        shutdown(&[&stage]).unwrap();
    }

    #[test]
    fn test_drain_and_idempotent_stop() {
        let (stage, _input, _output, _) = relay_stage();
        assert!(stage.stop().is_ok());
        assert!(matches!(stage.drain(), Ok(())));
        stage.start().unwrap();
        stage.drain().unwrap();
        assert!(matches!(stage.state(), StageState::Draining | StageState::Stopped));
        shutdown(&[&stage]).unwrap();
        assert!(stage.stop().is_ok());
    }
}
