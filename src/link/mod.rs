//! Link monitor
//!
//! Holds the one authoritative copy of the station link state. Only the
//! coordinator writes it; anything may read a snapshot or watch for changes.

use std::fmt;

use tokio::sync::watch;

pub mod driver;

pub use driver::{DriverEvent, LinkDriver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    NotInitialized,
    Connecting,
    Connected,
    Disconnected,
}

impl LinkState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotInitialized => "not_initialized",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct LinkMonitor {
    state: watch::Sender<LinkState>,
}

impl LinkMonitor {
    pub fn new() -> Self {
        let (state, _) = watch::channel(LinkState::NotInitialized);
        Self { state }
    }

    /// Commit a new state. Writing the current value again is a no-op and
    /// does not wake observers.
    pub fn set_state(&self, new_state: LinkState) -> bool {
        self.state.send_if_modified(|current| {
            if *current == new_state {
                return false;
            }
            *current = new_state;
            true
        })
    }

    pub fn get_state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn reader(&self) -> LinkStateReader {
        LinkStateReader {
            state: self.state.subscribe(),
        }
    }
}

impl Default for LinkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Read side of the monitor handed to observers
#[derive(Clone)]
pub struct LinkStateReader {
    state: watch::Receiver<LinkState>,
}

impl LinkStateReader {
    pub fn get(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Wait until the state satisfies `pred`, returning the matching state.
    /// Returns `None` if the monitor was dropped first.
    pub async fn wait_for(&mut self, pred: impl FnMut(&LinkState) -> bool) -> Option<LinkState> {
        self.state.wait_for(pred).await.ok().map(|state| *state)
    }

    pub fn watch(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }
}
