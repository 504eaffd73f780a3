//! Endpoint lifecycle state machine
//!
//! Every runtime (and every accepted server session) owns one [`StateCell`].
//! Transitions only move forward:
//!
//! ```text
//! DOWN ──init──▶ READY ──run──▶ RUNNING
//!   │              │
//!   └────────┬─────┘
//!            ▼
//!          BROKEN
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;

/// Operational state of an endpoint runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LifecycleState {
    /// Not yet initialized
    #[default]
    Down,
    /// Resource acquired, handler bound
    Ready,
    /// Actively serving or receiving
    Running,
    /// Unrecoverable failure during acquisition or binding
    Broken,
}

impl LifecycleState {
    /// Whether `self -> to` is a legal forward transition
    pub fn can_advance_to(&self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, to),
            (Down, Ready) | (Down, Broken) | (Ready, Running) | (Ready, Broken)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Running | LifecycleState::Broken)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Down => "DOWN",
            LifecycleState::Ready => "READY",
            LifecycleState::Running => "RUNNING",
            LifecycleState::Broken => "BROKEN",
        };
        f.write_str(name)
    }
}

/// Observable holder of a [`LifecycleState`].
///
/// Updates are serialized by the underlying watch channel, so concurrent
/// callers racing on the same transition see exactly one winner.
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<LifecycleState>,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(LifecycleState::Down);
        Self { tx }
    }

    /// Current state
    pub fn get(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    /// Move to `to`, returning the previous state.
    ///
    /// Illegal transitions leave the state untouched.
    pub fn advance(&self, to: LifecycleState) -> Result<LifecycleState> {
        let mut outcome = Err(Error::InvalidTransition {
            from: LifecycleState::Down,
            to,
        });
        self.tx.send_if_modified(|current| {
            if current.can_advance_to(to) {
                outcome = Ok(*current);
                *current = to;
                true
            } else {
                outcome = Err(Error::InvalidTransition { from: *current, to });
                false
            }
        });
        outcome
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }

    /// Wait until the state satisfies `pred`, or `timeout` elapses
    pub async fn wait_for<F>(&self, mut pred: F, timeout: Duration) -> Result<LifecycleState>
    where
        F: FnMut(&LifecycleState) -> bool,
    {
        let mut rx = self.subscribe();
        // The watch::Ref must drop before `rx`
        let reached = match tokio::time::timeout(timeout, rx.wait_for(|s| pred(s))).await {
            Ok(Ok(state)) => Ok(*state),
            // The sender lives in `self`, so the channel cannot close here
            Ok(Err(_)) => Ok(self.get()),
            Err(_) => Err(Error::Timeout),
        };
        reached
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
