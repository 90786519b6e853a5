// src/process/instance.rs — Per-session instance state machine

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    #[default]
    Idle,
    Working,
    Error,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Idle => "idle",
            InstanceState::Working => "working",
            InstanceState::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceEvent {
    SendMessage,
    ProcessExit,
    ProcessError,
    AcknowledgeError,
}

/// The transition table. `None` means the pair is a no-op.
pub fn next_state(current: InstanceState, event: InstanceEvent) -> Option<InstanceState> {
    use InstanceEvent::*;
    use InstanceState::*;

    match (current, event) {
        (Idle, SendMessage) => Some(Working),
        (Working, ProcessExit) => Some(Idle),
        (Working, ProcessError) => Some(Error),
        (Error, AcknowledgeError) => Some(Idle),
        // Sending again clears an unacknowledged error.
        (Error, SendMessage) => Some(Working),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub session_id: String,
    pub state: InstanceState,
    pub previous_state: InstanceState,
}

/// Tracks `idle`/`working`/`error` per session. Untracked sessions are idle.
pub struct InstanceStateMachine {
    states: Mutex<HashMap<String, InstanceState>>,
    tx: broadcast::Sender<StateChange>,
}

impl Default for InstanceStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceStateMachine {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            states: Mutex::new(HashMap::new()),
            tx,
        }
    }

    fn states(&self) -> MutexGuard<'_, HashMap<String, InstanceState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.tx.subscribe()
    }

    pub fn get_state(&self, session_id: &str) -> InstanceState {
        self.states().get(session_id).copied().unwrap_or_default()
    }

    /// Apply `event` and return the resulting state. A change notification is
    /// sent only when the state actually changes.
    pub fn transition(&self, session_id: &str, event: InstanceEvent) -> InstanceState {
        let change = {
            let mut states = self.states();
            let current = states.get(session_id).copied().unwrap_or_default();
            match next_state(current, event) {
                Some(next) if next != current => {
                    states.insert(session_id.to_string(), next);
                    StateChange {
                        session_id: session_id.to_string(),
                        state: next,
                        previous_state: current,
                    }
                }
                _ => return current,
            }
        };

        tracing::debug!(
            "Session {}: {} -> {} ({:?})",
            session_id,
            change.previous_state,
            change.state,
            event
        );
        let state = change.state;
        let _ = self.tx.send(change);
        state
    }

    /// Move the entry for `from` to `to` without notifying. Used when a
    /// placeholder key is replaced by the real session id.
    pub fn transfer_state(&self, from: &str, to: &str) {
        let mut states = self.states();
        match states.remove(from) {
            Some(state) => {
                states.insert(to.to_string(), state);
            }
            None => {
                states.remove(to);
            }
        }
    }

    pub fn remove_session(&self, session_id: &str) {
        self.states().remove(session_id);
    }

    /// Whether `session_id` has an entry, as opposed to defaulting to idle.
    pub fn is_tracked(&self, session_id: &str) -> bool {
        self.states().contains_key(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    const ALL_STATES: [InstanceState; 3] = [
        InstanceState::Idle,
        InstanceState::Working,
        InstanceState::Error,
    ];
    const ALL_EVENTS: [InstanceEvent; 4] = [
        InstanceEvent::SendMessage,
        InstanceEvent::ProcessExit,
        InstanceEvent::ProcessError,
        InstanceEvent::AcknowledgeError,
    ];

    /// Drive a fresh machine into `state`.
    fn machine_in(state: InstanceState) -> InstanceStateMachine {
        let m = InstanceStateMachine::new();
        match state {
            InstanceState::Idle => {}
            InstanceState::Working => {
                m.transition("s", InstanceEvent::SendMessage);
            }
            InstanceState::Error => {
                m.transition("s", InstanceEvent::SendMessage);
                m.transition("s", InstanceEvent::ProcessError);
            }
        }
        assert_eq!(m.get_state("s"), state);
        m
    }

    #[test]
    fn test_unknown_session_is_idle() {
        let m = InstanceStateMachine::new();
        assert_eq!(m.get_state("nobody"), InstanceState::Idle);
    }

    #[test]
    fn test_every_pair_matches_table() {
        for state in ALL_STATES {
            for event in ALL_EVENTS {
                let m = machine_in(state);
                let mut rx = m.subscribe();
                let result = m.transition("s", event);

                match next_state(state, event) {
                    Some(next) => {
                        assert_eq!(result, next, "{state:?} + {event:?}");
                        let change = rx.try_recv().unwrap();
                        assert_eq!(change.state, next);
                        assert_eq!(change.previous_state, state);
                        assert_eq!(change.session_id, "s");
                        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
                    }
                    None => {
                        assert_eq!(result, state, "{state:?} + {event:?}");
                        assert_eq!(m.get_state("s"), state);
                        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
                    }
                }
            }
        }
    }

    #[test]
    fn test_table_has_exactly_five_transitions() {
        let count = ALL_STATES
            .iter()
            .flat_map(|s| ALL_EVENTS.iter().map(move |e| next_state(*s, *e)))
            .filter(Option::is_some)
            .count();
        assert_eq!(count, 5);
    }

    #[test]
    fn test_transfer_state_is_silent() {
        let m = InstanceStateMachine::new();
        m.transition("pending-1", InstanceEvent::SendMessage);
        let mut rx = m.subscribe();

        m.transfer_state("pending-1", "real");
        assert_eq!(m.get_state("real"), InstanceState::Working);
        assert_eq!(m.get_state("pending-1"), InstanceState::Idle);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_remove_session_returns_to_idle() {
        let m = machine_in(InstanceState::Error);
        assert!(m.is_tracked("s"));
        m.remove_session("s");
        assert_eq!(m.get_state("s"), InstanceState::Idle);
        assert!(!m.is_tracked("s"));
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&InstanceState::Working).unwrap(),
            "\"working\""
        );
        assert_eq!(
            serde_json::to_string(&InstanceEvent::AcknowledgeError).unwrap(),
            "\"ACKNOWLEDGE_ERROR\""
        );
    }
}
