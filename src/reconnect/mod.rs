//! Reconnection scheduler
//!
//! Owns the retry timer. Each tick only enqueues a retry request on the
//! coordinator's event channel; the coordinator decides whether to act on it.

use std::sync::{Arc, Mutex};

use log::*;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::coordinator::LinkEvent;

mod policy;

pub use policy::ReconnectPolicy;

pub struct ReconnectScheduler {
    policy: Arc<Mutex<ReconnectPolicy>>,
    events: mpsc::Sender<LinkEvent>,
    timer: Option<JoinHandle<()>>,
    next_run: u64,
    stopped: u64,
}

impl ReconnectScheduler {
    pub(crate) fn new(policy: ReconnectPolicy, events: mpsc::Sender<LinkEvent>) -> Self {
        Self {
            policy: Arc::new(Mutex::new(policy)),
            events,
            timer: None,
            next_run: 0,
            stopped: 0,
        }
    }

    /// Begin the retry cycle. Does nothing if a cycle is already running.
    pub fn start(&mut self) -> bool {
        if self.is_running() {
            debug!("reconnect: already running");
            return false;
        }

        self.next_run += 1;
        let run = self.next_run;
        let policy = self.policy.clone();
        let events = self.events.clone();

        info!("reconnect: starting retry cycle {}", run);
        self.timer = Some(tokio::spawn(async move {
            loop {
                let delay = match policy.lock() {
                    Ok(mut policy) => policy.next_delay(),
                    Err(_) => {
                        error!("reconnect: policy lock poisoned, cycle {} halted", run);
                        return;
                    }
                };
                debug!("reconnect: next retry in {:?}", delay);
                tokio::time::sleep(delay).await;

                if events.send(LinkEvent::RetryNow { run }).await.is_err() {
                    // Coordinator is gone
                    return;
                }
            }
        }));
        true
    }

    /// Cancel any pending retry. Safe to call when not running; returns
    /// whether a cycle was actually stopped.
    pub fn stop(&mut self) -> bool {
        match self.timer.take() {
            Some(timer) => {
                timer.abort();
                self.stopped += 1;
                info!("reconnect: stopped retry cycle {}", self.next_run);
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer
            .as_ref()
            .map(|timer| !timer.is_finished())
            .unwrap_or(false)
    }

    /// Run id of the current cycle, used to ignore ticks from a stopped one
    pub fn current_run(&self) -> Option<u64> {
        self.is_running().then_some(self.next_run)
    }

    pub fn cycles_started(&self) -> u64 {
        self.next_run
    }

    pub fn cycles_stopped(&self) -> u64 {
        self.stopped
    }

    pub fn reset_attempts(&self) {
        if let Ok(mut policy) = self.policy.lock() {
            policy.reset();
        }
    }

    pub fn policy(&self) -> ReconnectPolicy {
        match self.policy.lock() {
            Ok(policy) => policy.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Drop for ReconnectScheduler {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
