//! Dependent services
//!
//! The message bus client and the update agent only make sense with a usable
//! link. The coordinator starts them on Connected and tears them down on link
//! loss; nothing else starts or stops them. A broker that can't be reached
//! is retried on its own timer while the link stays up.

use std::sync::Arc;

use log::*;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{coordinator::LinkEvent, reconnect::ReconnectPolicy};

pub mod bus;
pub mod command;
pub mod http;
pub mod update;
mod version;

pub use bus::{BusSession, BusTransport, InboundSender, MessageBusClient};
pub use command::{Command, CommandSink};
pub use update::{
    FirmwareFetch, FirmwareSink, ImageDescriptor, UpdateAgent, UpdateTransport, UpgradeRequest,
    UpgradeStatus,
};
pub use version::{Version, VersionError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DependentServiceSet {
    pub message_bus_running: bool,
    pub update_agent_running: bool,
}

impl DependentServiceSet {
    pub fn any_running(&self) -> bool {
        self.message_bus_running || self.update_agent_running
    }
}

struct BusRetry {
    run: u64,
    timer: JoinHandle<()>,
}

pub struct ServiceLifecycle {
    bus: MessageBusClient,
    update: Arc<UpdateAgent>,
    state: watch::Sender<DependentServiceSet>,
    events: mpsc::Sender<LinkEvent>,
    // Spaces out broker attempts while the link stays up
    bus_policy: ReconnectPolicy,
    bus_retry: Option<BusRetry>,
    bus_runs: u64,
}

impl ServiceLifecycle {
    pub(crate) fn new(
        bus: MessageBusClient,
        update: Arc<UpdateAgent>,
        bus_policy: ReconnectPolicy,
        events: mpsc::Sender<LinkEvent>,
    ) -> Self {
        let (state, _) = watch::channel(DependentServiceSet::default());
        Self {
            bus,
            update,
            state,
            events,
            bus_policy,
            bus_retry: None,
            bus_runs: 0,
        }
    }

    /// Start both services. Each start is idempotent. A bus that can't
    /// reach its broker is retried on a timer for as long as the link is up.
    pub async fn on_link_connected(&mut self) {
        self.start_bus().await;
        self.update.start();
        self.publish();
    }

    /// Stop both services. Pending bus commands are discarded, an upgrade in
    /// flight is cancelled and no further broker attempt is made.
    pub async fn on_link_lost(&mut self) {
        self.cancel_bus_retry();
        self.bus_policy.reset();
        let bus_stopped = self.bus.stop().await;
        let update_stopped = self.update.stop();
        if bus_stopped || update_stopped {
            info!("services: torn down after link loss");
        }
        self.publish();
    }

    /// Broker retry timer fired. Ticks from a cancelled retry are ignored.
    pub(crate) async fn retry_bus(&mut self, run: u64) {
        match &self.bus_retry {
            Some(retry) if retry.run == run => self.bus_retry = None,
            _ => {
                debug!("services: ignoring stale broker retry {}", run);
                return;
            }
        }
        self.start_bus().await;
        self.publish();
    }

    pub fn bus_retry_pending(&self) -> bool {
        self.bus_retry.is_some()
    }

    async fn start_bus(&mut self) {
        match self.bus.start().await {
            Ok(true) => {
                self.cancel_bus_retry();
                self.bus_policy.reset();
            }
            Ok(false) => debug!("services: bus already running"),
            Err(e) => {
                warn!("services: bus unavailable: {:#}", e);
                self.schedule_bus_retry();
            }
        }
    }

    fn schedule_bus_retry(&mut self) {
        self.cancel_bus_retry();
        self.bus_runs += 1;
        let run = self.bus_runs;
        let delay = self.bus_policy.next_delay();
        let events = self.events.clone();

        info!("services: next broker attempt in {:?}", delay);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(LinkEvent::RetryBus { run }).await;
        });
        self.bus_retry = Some(BusRetry { run, timer });
    }

    fn cancel_bus_retry(&mut self) {
        if let Some(retry) = self.bus_retry.take() {
            retry.timer.abort();
        }
    }

    pub fn snapshot(&self) -> DependentServiceSet {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<DependentServiceSet> {
        self.state.subscribe()
    }

    pub fn update_agent(&self) -> Arc<UpdateAgent> {
        self.update.clone()
    }

    fn publish(&self) {
        let set = DependentServiceSet {
            message_bus_running: self.bus.is_running(),
            update_agent_running: self.update.is_running(),
        };
        self.state.send_if_modified(|current| {
            if *current == set {
                return false;
            }
            *current = set;
            true
        });
    }
}

impl Drop for ServiceLifecycle {
    fn drop(&mut self) {
        self.cancel_bus_retry();
    }
}
