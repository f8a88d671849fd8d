//! Provisioning fallback
//!
//! A bounded listening session for credentials delivered out of band while
//! the station link is down. Runs alongside the reconnection scheduler.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use log::*;
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};

use crate::{coordinator::LinkEvent, credential::Credential};

mod driver;

pub use driver::{ProvisioningDriver, ProvisioningEvent};

struct ProvisioningSession {
    id: u64,
    deadline: Instant,
    received: Option<Credential>,
    timer: JoinHandle<()>,
}

pub struct ProvisioningFallback {
    driver: Arc<dyn ProvisioningDriver>,
    events: mpsc::Sender<LinkEvent>,
    session: Option<ProvisioningSession>,
    next_id: u64,
    closed: u64,
}

impl ProvisioningFallback {
    pub(crate) fn new(
        driver: Arc<dyn ProvisioningDriver>,
        events: mpsc::Sender<LinkEvent>,
    ) -> Self {
        Self {
            driver,
            events,
            session: None,
            next_id: 0,
            closed: 0,
        }
    }

    /// Open a session unless one is already active. The deadline timer
    /// reports back through the event channel tagged with the session id.
    pub fn start(&mut self, timeout: Duration) -> anyhow::Result<bool> {
        if let Some(session) = &self.session {
            debug!("provisioning: session {} already active", session.id);
            return Ok(false);
        }

        self.driver
            .start_listening(timeout)
            .context("provisioning driver refused to start listening")?;

        self.next_id += 1;
        let id = self.next_id;
        let events = self.events.clone();
        let deadline = Instant::now() + timeout;

        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = events.send(LinkEvent::ProvisioningDeadline { session: id }).await;
        });

        info!("provisioning: session {} listening for {:?}", id, timeout);
        self.session = Some(ProvisioningSession {
            id,
            deadline,
            received: None,
            timer,
        });
        Ok(true)
    }

    /// Tear down the active session. Safe when idle; returns whether a
    /// session was actually stopped.
    pub fn stop(&mut self) -> bool {
        let Some(session) = self.session.take() else {
            return false;
        };

        session.timer.abort();
        self.closed += 1;
        if let Err(e) = self.driver.stop_listening() {
            warn!("provisioning: stop listening failed: {:#}", e);
        }
        info!("provisioning: session {} closed", session.id);
        true
    }

    /// Deadline fired. Stale deadlines from an earlier session are ignored.
    pub fn expire(&mut self, id: u64) -> bool {
        match &self.session {
            Some(session) if session.id == id => {
                warn!("provisioning: session {} timed out without a credential exchange", id);
                self.stop()
            }
            _ => {
                debug!("provisioning: ignoring stale deadline for session {}", id);
                false
            }
        }
    }

    pub fn record_credential(&mut self, credential: Credential) {
        if let Some(session) = self.session.as_mut() {
            session.received = Some(credential);
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn session_id(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.id)
    }

    pub fn sessions_started(&self) -> u64 {
        self.next_id
    }

    pub fn sessions_closed(&self) -> u64 {
        self.closed
    }

    pub fn received_credential(&self) -> Option<&Credential> {
        self.session.as_ref().and_then(|s| s.received.as_ref())
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.session
            .as_ref()
            .map(|s| s.deadline.saturating_duration_since(Instant::now()))
    }
}

impl Drop for ProvisioningFallback {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.timer.abort();
        }
    }
}
