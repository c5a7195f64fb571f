//! Stage state management
//!
//! Every stage thread carries one [`StageControl`]: a single atomic holding a
//! [`StageState`], moved only through compare-and-swap transitions so that the
//! controlling thread and the worker thread never disagree about who owns the
//! next step of the lifecycle.

use std::sync::atomic::{AtomicU8, Ordering};

/// Stage state machine
///
/// ```text
/// Stopped|Closed --start--> Running --drain--> Draining
/// Running|Draining --stop--> Stopped
/// Stopped --close--> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StageState {
    /// Not running; resources may still be held (initial state)
    Stopped = 0,

    /// Worker loop is active
    Running = 1,

    /// Worker should finish its input, emit EOF and exit
    Draining = 2,

    /// Resources released, ready to be started again
    Closed = 3,
}

impl StageState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => StageState::Running,
            2 => StageState::Draining,
            3 => StageState::Closed,
            _ => StageState::Stopped,
        }
    }

    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &StageState) -> bool {
        use StageState::*;

        matches!(
            (self, target),
            (Stopped, Running)
                | (Closed, Running)
                | (Running, Draining)
                | (Running, Stopped)
                | (Draining, Stopped)
                | (Stopped, Closed)
        )
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            StageState::Stopped => "Stopped",
            StageState::Running => "Running",
            StageState::Draining => "Draining",
            StageState::Closed => "Closed",
        }
    }

    /// Running or draining: the worker thread is expected to be alive
    pub fn is_active(&self) -> bool {
        matches!(self, StageState::Running | StageState::Draining)
    }
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Shared, lock-free state cell for one stage
#[derive(Debug)]
pub struct StageControl {
    state: AtomicU8,
}

impl StageControl {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(StageState::Stopped as u8),
        }
    }

    pub fn state(&self) -> StageState {
        StageState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Attempt `from -> to`; returns the observed state on failure
    pub fn transition(&self, from: StageState, to: StageState) -> Result<(), StageState> {
        if !from.can_transition_to(&to) {
            return Err(self.state());
        }
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(StageState::from_u8)
    }

    /// Attempt the transition from whichever of `from` currently holds
    pub fn transition_any(&self, from: &[StageState], to: StageState) -> Result<StageState, StageState> {
        let mut observed = self.state();
        loop {
            if !from.contains(&observed) || !observed.can_transition_to(&to) {
                return Err(observed);
            }
            match self.transition(observed, to) {
                Ok(()) => return Ok(observed),
                Err(now) => observed = now,
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == StageState::Running
    }

    pub fn is_draining(&self) -> bool {
        self.state() == StageState::Draining
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }
}

impl Default for StageControl {
    fn default() -> Self {
        Self::new()
    }
}
