//! Task lifecycle state machine
//!
//! A task only ever moves forward. The transition table is the single place that
//! says which moves are legal; anything not listed is rejected and the stored
//! status is left as it is.

use std::fmt;

use crate::crd::TaskState;

/// Events that move a task forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskEvent {
    /// A worker picked the task up
    Started,
    /// The task's work is done
    Finished,
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskEvent::Started => write!(f, "Started"),
            TaskEvent::Finished => write!(f, "Finished"),
        }
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    pub from: TaskState,
    pub to: TaskState,
    pub event: TaskEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: TaskState,
        to: TaskState,
        event: TaskEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug, PartialEq, Eq)]
pub enum TransitionResult {
    Success {
        from: TaskState,
        to: TaskState,
        event: TaskEvent,
        description: &'static str,
    },
    InvalidTransition {
        current: TaskState,
        event: TaskEvent,
    },
}

impl TransitionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, TransitionResult::Success { .. })
    }

    /// Target state of a successful transition
    pub fn target(&self) -> Option<TaskState> {
        match self {
            TransitionResult::Success { to, .. } => Some(*to),
            TransitionResult::InvalidTransition { .. } => None,
        }
    }
}

/// Transition table for task status
pub struct TaskStateMachine {
    transitions: Vec<Transition>,
}

impl Default for TaskStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskStateMachine {
    pub fn new() -> Self {
        Self {
            transitions: vec![
                Transition::new(
                    TaskState::Pending,
                    TaskState::InProgress,
                    TaskEvent::Started,
                    "Task picked up by a worker",
                ),
                Transition::new(
                    TaskState::InProgress,
                    TaskState::Completed,
                    TaskEvent::Finished,
                    "Task finished",
                ),
                Transition::new(
                    TaskState::Pending,
                    TaskState::Completed,
                    TaskEvent::Finished,
                    "Task finished without being marked in progress",
                ),
            ],
        }
    }

    /// Attempt a transition from `current` on `event`
    pub fn transition(&self, current: TaskState, event: TaskEvent) -> TransitionResult {
        self.transitions
            .iter()
            .find(|t| t.from == current && t.event == event)
            .map(|t| TransitionResult::Success {
                from: t.from,
                to: t.to,
                event,
                description: t.description,
            })
            .unwrap_or(TransitionResult::InvalidTransition { current, event })
    }

    /// Events that are legal from `current`
    pub fn valid_events(&self, current: TaskState) -> Vec<TaskEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == current)
            .map(|t| t.event)
            .collect()
    }
}
