//! Session lifecycle states.

use crate::SessionError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle state of a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    #[default]
    Created,
    SetUp,
    Registered,
    Online,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    /// Returns true once the session can no longer make protocol progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Returns true if the session reached a state a supervisor can stop waiting on.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            SessionState::Online | SessionState::Failed | SessionState::Closed
        )
    }

    /// Returns true if the transition `self -> next` is allowed.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Closed, _) => false,
            // Failed only leaves through cleanup.
            (Failed, Closing) => true,
            (Failed, _) => false,
            (Closing, Closed) => true,
            (Closing, _) => false,
            (_, Failed) | (_, Closing) => true,
            (Created, SetUp) => true,
            (SetUp, Registered) => true,
            (Registered, Online) | (Registered, SetUp) => true,
            _ => false,
        }
    }

    /// Returns the string representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::SetUp => "set_up",
            SessionState::Registered => "registered",
            SessionState::Online => "online",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for SessionState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SessionState {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "created" => Ok(SessionState::Created),
            "set_up" => Ok(SessionState::SetUp),
            "registered" => Ok(SessionState::Registered),
            "online" => Ok(SessionState::Online),
            "closing" => Ok(SessionState::Closing),
            "closed" => Ok(SessionState::Closed),
            "failed" => Ok(SessionState::Failed),
            other => Err(serde::de::Error::custom(format!("unknown session state: {}", other))),
        }
    }
}

/// Shared, observable holder of a session's current state.
///
/// The session and its child tasks hold clones; observers subscribe through
/// the watch channel. The error that moved the session to `Failed` is kept
/// alongside.
#[derive(Debug, Clone)]
pub(crate) struct StateCell {
    tx: Arc<watch::Sender<SessionState>>,
    last_error: Arc<Mutex<Option<SessionError>>>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::Created);
        Self {
            tx: Arc::new(tx),
            last_error: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn last_error(&self) -> Option<SessionError> {
        self.last_error.lock().clone()
    }

    /// Moves any non-terminal state to `Failed`, recording `err`.
    pub(crate) fn fail(&self, err: SessionError) -> bool {
        let mut slot = self.last_error.lock();
        let failed = self.transition(SessionState::Failed).is_some();
        if failed {
            *slot = Some(err);
        }
        failed
    }

    /// Moves `from -> Failed` only if the session is currently in `from`.
    pub(crate) fn fail_from(&self, from: SessionState, err: SessionError) -> bool {
        let mut slot = self.last_error.lock();
        let failed = self.compare_and_set(from, SessionState::Failed);
        if failed {
            *slot = Some(err);
        }
        failed
    }

    pub(crate) fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Moves to `next` if the transition is legal. Returns the previous state on success.
    pub(crate) fn transition(&self, next: SessionState) -> Option<SessionState> {
        let mut prev = None;
        self.tx.send_if_modified(|current| {
            if current.can_transition_to(next) {
                prev = Some(*current);
                *current = next;
                true
            } else {
                false
            }
        });
        prev
    }

    /// Moves `from -> to` only if the session is currently in `from`.
    pub(crate) fn compare_and_set(&self, from: SessionState, to: SessionState) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == from && current.can_transition_to(to) {
                *current = to;
                true
            } else {
                false
            }
        })
    }
}
