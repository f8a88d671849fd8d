//! Connectivity coordinator
//!
//! The only writer of the link state. Driver callbacks, provisioning
//! callbacks, retry ticks, provisioning deadlines and caller requests all
//! arrive as [`LinkEvent`]s on one channel, and a single task handles them
//! in order.

use std::{net::Ipv4Addr, sync::Arc};

use anyhow::{Context, Result};
use log::*;
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};

use crate::{
    config::Config,
    credential::{Credential, RawCredential},
    error::InitError,
    link::{DriverEvent, LinkDriver, LinkMonitor, LinkState, LinkStateReader},
    provisioning::{ProvisioningDriver, ProvisioningEvent, ProvisioningFallback},
    reconnect::ReconnectScheduler,
    services::{
        BusTransport, CommandSink, DependentServiceSet, FirmwareSink, MessageBusClient,
        ServiceLifecycle, UpdateAgent, UpdateTransport, UpgradeRequest, UpgradeStatus,
    },
    store::CredentialStore,
};

mod event;

pub(crate) use event::LinkEvent;
pub use event::{DriverEvents, ProvisioningEvents};

/// External collaborators the coordinator drives
pub struct Collaborators {
    pub link_driver: Arc<dyn LinkDriver>,
    pub provisioning_driver: Arc<dyn ProvisioningDriver>,
    pub store: Arc<dyn CredentialStore>,
    pub bus_transport: Arc<dyn BusTransport>,
    pub command_sink: Arc<dyn CommandSink>,
    pub update_transport: Arc<dyn UpdateTransport>,
    pub firmware_sink: Arc<dyn FirmwareSink>,
}

/// Which recovery paths are active, plus lifetime counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStatus {
    pub reconnect_running: bool,
    pub provisioning_active: bool,
    pub reconnect_cycles_started: u64,
    pub reconnect_cycles_stopped: u64,
    pub provisioning_sessions_started: u64,
    pub provisioning_sessions_closed: u64,
}

struct Coordinator {
    config: Config,
    monitor: LinkMonitor,
    driver: Arc<dyn LinkDriver>,
    store: Arc<dyn CredentialStore>,
    reconnect: ReconnectScheduler,
    provisioning: ProvisioningFallback,
    services: ServiceLifecycle,
    recovery: watch::Sender<RecoveryStatus>,
    events: mpsc::Receiver<LinkEvent>,
    // Set when we dropped an established link ourselves to switch credentials
    expect_disconnect: bool,
}

/// Bring the link up with the stored credential, or `default_credential`
/// when nothing usable is stored, and spawn the coordinator task.
///
/// Must be called from within a tokio runtime. Fails only on problems that
/// can't be recovered from at runtime.
pub fn init_connectivity(
    config: Config,
    default_credential: Credential,
    collaborators: Collaborators,
) -> Result<Connectivity, InitError> {
    let runtime = Handle::try_current().map_err(|_| InitError::NoRuntime)?;
    config.validate()?;

    let credential = match collaborators
        .store
        .load()
        .map_err(InitError::CredentialStore)?
    {
        Some(stored) if !stored.ssid().is_empty() => {
            info!("coordinator: using stored credential for {}", stored.ssid());
            stored
        }
        _ => {
            info!(
                "coordinator: no stored credential, using default {}",
                default_credential.ssid()
            );
            default_credential
        }
    };

    let (tx, rx) = mpsc::channel(config.event_queue_depth);

    let update = Arc::new(
        UpdateAgent::new(
            config.update.clone(),
            collaborators.update_transport,
            collaborators.firmware_sink,
        )
        .map_err(|e| InitError::InvalidConfig(format!("{:#}", e)))?,
    );
    let bus = MessageBusClient::new(
        config.message_bus.clone(),
        collaborators.bus_transport,
        collaborators.command_sink,
    );
    let services = ServiceLifecycle::new(bus, update.clone(), config.reconnect.clone(), tx.clone());

    let monitor = LinkMonitor::new();
    let (recovery, recovery_rx) = watch::channel(RecoveryStatus::default());

    let mut coordinator = Coordinator {
        reconnect: ReconnectScheduler::new(config.reconnect.clone(), tx.clone()),
        provisioning: ProvisioningFallback::new(collaborators.provisioning_driver, tx.clone()),
        config,
        monitor,
        driver: collaborators.link_driver,
        store: collaborators.store,
        services,
        recovery,
        events: rx,
        expect_disconnect: false,
    };

    coordinator
        .driver
        .reconfigure(&credential)
        .map_err(InitError::DriverConfig)?;
    coordinator.monitor.set_state(LinkState::Connecting);
    coordinator.issue_connect();
    coordinator.publish_recovery();

    let handle = CoordinatorHandle {
        events: tx,
        link: coordinator.monitor.reader(),
        services: coordinator.services.subscribe(),
        recovery: recovery_rx,
        update,
    };

    let task = runtime.spawn(coordinator.run());
    Ok(Connectivity { handle, task })
}

impl Coordinator {
    async fn run(mut self) {
        info!("coordinator: running");
        while let Some(event) = self.events.recv().await {
            if let LinkEvent::Shutdown = event {
                self.shutdown().await;
                break;
            }
            self.handle(event).await;
            self.publish_recovery();
        }
        info!("coordinator: stopped");
    }

    async fn handle(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Driver(DriverEvent::LinkUp) => self.on_link_up(),
            LinkEvent::Driver(DriverEvent::LinkDown { reason }) => {
                self.on_link_down(&reason).await
            }
            LinkEvent::Driver(DriverEvent::IpAcquired { address }) => {
                self.on_ip_acquired(address).await
            }
            LinkEvent::Provisioning(ProvisioningEvent::CredentialReceived(raw)) => {
                self.on_credential_received(raw).await
            }
            LinkEvent::Provisioning(ProvisioningEvent::ExchangeComplete) => {
                if self.provisioning.stop() {
                    info!("coordinator: provisioning exchange complete");
                }
            }
            LinkEvent::ProvisioningDeadline { session } => {
                self.provisioning.expire(session);
            }
            LinkEvent::RetryNow { run } => {
                if self.reconnect.current_run() == Some(run) {
                    self.on_retry();
                } else {
                    debug!("coordinator: ignoring tick from stopped retry cycle {}", run);
                }
            }
            LinkEvent::RetryBus { run } => {
                if self.monitor.get_state() == LinkState::Connected {
                    self.services.retry_bus(run).await;
                } else {
                    debug!("coordinator: broker retry {} while not connected, ignored", run);
                }
            }
            LinkEvent::ReconnectRequested => self.on_retry(),
            LinkEvent::ApplyCredential { credential, reply } => {
                let result = self.apply_credential(credential).await;
                let _ = reply.send(result);
            }
            // Handled by the run loop
            LinkEvent::Shutdown => {}
        }
    }

    fn on_link_up(&mut self) {
        match self.monitor.get_state() {
            LinkState::Connecting => self.issue_connect(),
            LinkState::Disconnected => {
                self.monitor.set_state(LinkState::Connecting);
                self.issue_connect();
            }
            state => debug!("coordinator: link up while {}, ignored", state),
        }
    }

    async fn on_link_down(&mut self, reason: &str) {
        let expected = std::mem::take(&mut self.expect_disconnect);
        match self.monitor.get_state() {
            LinkState::Connecting if expected => {
                // Our own disconnect before a credential switch. A connect
                // with the new credential is already out; the scheduler
                // covers the case where this was really its failure.
                info!("coordinator: link down ({}) after credential switch", reason);
                self.reconnect.start();
            }
            LinkState::Connected | LinkState::Connecting => {
                warn!("coordinator: link down ({})", reason);
                self.monitor.set_state(LinkState::Disconnected);

                // A fresh loss opens both recovery paths. A failed attempt
                // inside an ongoing recovery leaves provisioning alone.
                if self.reconnect.start() {
                    let timeout = self.config.provisioning.timeout();
                    if let Err(e) = self.provisioning.start(timeout) {
                        error!("coordinator: provisioning unavailable: {:#}", e);
                    }
                }
                self.services.on_link_lost().await;
            }
            LinkState::Disconnected => {
                info!("coordinator: connect attempt failed ({})", reason);
                self.reconnect.start();
            }
            LinkState::NotInitialized => {
                debug!("coordinator: link down before init ({}), ignored", reason)
            }
        }
    }

    async fn on_ip_acquired(&mut self, address: Ipv4Addr) {
        match self.monitor.get_state() {
            LinkState::NotInitialized => {
                warn!("coordinator: ip {} acquired before init, dropped", address);
                return;
            }
            LinkState::Disconnected => {
                info!("coordinator: link recovered while disconnected");
            }
            LinkState::Connecting | LinkState::Connected => {}
        }

        if self.monitor.set_state(LinkState::Connected) {
            info!("coordinator: connected, ip {}", address);
        }
        self.expect_disconnect = false;
        self.reconnect.stop();
        self.reconnect.reset_attempts();
        self.provisioning.stop();
        self.services.on_link_connected().await;
    }

    async fn on_credential_received(&mut self, raw: RawCredential) {
        if !self.provisioning.is_active() {
            warn!("coordinator: credential received outside a provisioning session, dropped");
            return;
        }

        let bounded = match Credential::from_raw(&raw) {
            Ok(bounded) => bounded,
            Err(e) => {
                warn!("coordinator: discarding malformed provisioning payload: {}", e);
                return;
            }
        };
        for truncation in &bounded.truncations {
            error!("coordinator: oversize provisioned credential, {}", truncation);
        }

        let credential = bounded.credential;
        self.provisioning.record_credential(credential.clone());
        if let Err(e) = self.apply_credential(credential).await {
            warn!("coordinator: provisioned credential applied with errors: {:#}", e);
        }
    }

    fn on_retry(&mut self) {
        match self.monitor.get_state() {
            LinkState::Disconnected => {
                self.monitor.set_state(LinkState::Connecting);
                self.issue_connect();
            }
            LinkState::Connecting => self.issue_connect(),
            state => debug!("coordinator: retry while {}, ignored", state),
        }
    }

    /// Switch the station to a new credential. Persisting is best effort:
    /// a store failure is reported to the caller but the credential is still
    /// used.
    async fn apply_credential(&mut self, credential: Credential) -> Result<()> {
        let state = self.monitor.get_state();
        info!(
            "coordinator: applying credential for {} while {}",
            credential.ssid(),
            state
        );

        if matches!(state, LinkState::Connected | LinkState::Connecting) {
            match self.driver.disconnect() {
                // Only an established link reliably reports its teardown
                Ok(()) => self.expect_disconnect = state == LinkState::Connected,
                Err(e) => warn!("coordinator: disconnect before reconfigure failed: {:#}", e),
            }
        }
        if state == LinkState::Connected {
            self.services.on_link_lost().await;
        }

        let persisted = self.store.save(&credential);
        if let Err(e) = &persisted {
            error!("coordinator: failed to persist credential: {:#}", e);
        }

        let reconfigured = self.driver.reconfigure(&credential);
        if let Err(e) = &reconfigured {
            error!("coordinator: driver rejected credential: {:#}", e);
        }

        self.monitor.set_state(LinkState::Connecting);
        self.issue_connect();

        reconfigured.context("driver rejected credential")?;
        persisted.context("credential applied but not persisted")?;
        Ok(())
    }

    // A refused connect request produces no driver event, so make sure a
    // retry tick will come.
    fn issue_connect(&mut self) {
        if let Err(e) = self.driver.connect() {
            warn!("coordinator: connect request failed, waiting for next retry: {:#}", e);
            self.reconnect.start();
        }
    }

    async fn shutdown(&mut self) {
        self.reconnect.stop();
        self.provisioning.stop();
        self.services.on_link_lost().await;
        self.publish_recovery();
    }

    fn publish_recovery(&self) {
        let status = RecoveryStatus {
            reconnect_running: self.reconnect.is_running(),
            provisioning_active: self.provisioning.is_active(),
            reconnect_cycles_started: self.reconnect.cycles_started(),
            reconnect_cycles_stopped: self.reconnect.cycles_stopped(),
            provisioning_sessions_started: self.provisioning.sessions_started(),
            provisioning_sessions_closed: self.provisioning.sessions_closed(),
        };
        self.recovery.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }
}

/// Cheap, cloneable access to a running coordinator from any task
#[derive(Clone)]
pub struct CoordinatorHandle {
    events: mpsc::Sender<LinkEvent>,
    link: LinkStateReader,
    services: watch::Receiver<DependentServiceSet>,
    recovery: watch::Receiver<RecoveryStatus>,
    update: Arc<UpdateAgent>,
}

impl CoordinatorHandle {
    pub fn link_state(&self) -> LinkState {
        self.link.get()
    }

    pub fn subscribe_link_state(&self) -> LinkStateReader {
        self.link.clone()
    }

    pub async fn request_reconnect_now(&self) -> Result<()> {
        self.events
            .send(LinkEvent::ReconnectRequested)
            .await
            .map_err(|_| anyhow::anyhow!("connectivity coordinator has stopped"))
    }

    /// Disconnect if needed, persist, reconfigure and reconnect. Resolves
    /// once the coordinator has issued the connect.
    pub async fn apply_new_credential(&self, credential: Credential) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.events
            .send(LinkEvent::ApplyCredential { credential, reply })
            .await
            .map_err(|_| anyhow::anyhow!("connectivity coordinator has stopped"))?;
        response
            .await
            .context("connectivity coordinator dropped the request")?
    }

    pub fn request_upgrade(&self) -> UpgradeRequest {
        self.update.request_upgrade()
    }

    pub fn services(&self) -> DependentServiceSet {
        *self.services.borrow()
    }

    pub fn subscribe_services(&self) -> watch::Receiver<DependentServiceSet> {
        self.services.clone()
    }

    pub fn recovery(&self) -> RecoveryStatus {
        *self.recovery.borrow()
    }

    pub fn subscribe_recovery(&self) -> watch::Receiver<RecoveryStatus> {
        self.recovery.clone()
    }

    pub fn upgrade_status(&self) -> watch::Receiver<UpgradeStatus> {
        self.update.status()
    }

    pub fn driver_events(&self) -> DriverEvents {
        DriverEvents::new(self.events.clone())
    }

    pub fn provisioning_events(&self) -> ProvisioningEvents {
        ProvisioningEvents::new(self.events.clone())
    }
}

pub struct Connectivity {
    handle: CoordinatorHandle,
    task: JoinHandle<()>,
}

impl Connectivity {
    pub fn handle(&self) -> CoordinatorHandle {
        self.handle.clone()
    }

    /// Stop recovery, tear down services and wait for the coordinator task
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.handle.events.send(LinkEvent::Shutdown).await;
        self.task.await.context("coordinator task failed")?;
        Ok(())
    }
}
