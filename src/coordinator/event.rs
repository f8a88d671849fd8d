use std::net::Ipv4Addr;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};

use crate::{
    credential::{Credential, RawCredential},
    link::DriverEvent,
    provisioning::ProvisioningEvent,
};

/// Everything the coordinator reacts to, in arrival order
#[derive(Debug)]
pub(crate) enum LinkEvent {
    Driver(DriverEvent),
    Provisioning(ProvisioningEvent),
    /// Provisioning deadline timer fired for the given session
    ProvisioningDeadline { session: u64 },
    /// Reconnect timer fired for the given cycle
    RetryNow { run: u64 },
    /// Broker retry timer fired while the link was up
    RetryBus { run: u64 },
    /// Caller asked for an immediate reconnect
    ReconnectRequested,
    ApplyCredential {
        credential: Credential,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

fn closed() -> anyhow::Error {
    anyhow!("connectivity coordinator has stopped")
}

/// Typed producer for the link driver's callbacks
#[derive(Clone)]
pub struct DriverEvents {
    tx: mpsc::Sender<LinkEvent>,
}

impl DriverEvents {
    pub(crate) fn new(tx: mpsc::Sender<LinkEvent>) -> Self {
        Self { tx }
    }

    pub async fn emit(&self, event: DriverEvent) -> Result<()> {
        self.tx
            .send(LinkEvent::Driver(event))
            .await
            .map_err(|_| closed())
    }

    /// For driver callbacks running on a plain thread outside the runtime
    pub fn emit_blocking(&self, event: DriverEvent) -> Result<()> {
        self.tx
            .blocking_send(LinkEvent::Driver(event))
            .map_err(|_| closed())
    }

    pub async fn link_up(&self) -> Result<()> {
        self.emit(DriverEvent::LinkUp).await
    }

    pub async fn link_down(&self, reason: impl Into<String>) -> Result<()> {
        self.emit(DriverEvent::LinkDown {
            reason: reason.into(),
        })
        .await
    }

    pub async fn ip_acquired(&self, address: Ipv4Addr) -> Result<()> {
        self.emit(DriverEvent::IpAcquired { address }).await
    }
}

/// Typed producer for the provisioning protocol's callbacks
#[derive(Clone)]
pub struct ProvisioningEvents {
    tx: mpsc::Sender<LinkEvent>,
}

impl ProvisioningEvents {
    pub(crate) fn new(tx: mpsc::Sender<LinkEvent>) -> Self {
        Self { tx }
    }

    pub async fn emit(&self, event: ProvisioningEvent) -> Result<()> {
        self.tx
            .send(LinkEvent::Provisioning(event))
            .await
            .map_err(|_| closed())
    }

    pub fn emit_blocking(&self, event: ProvisioningEvent) -> Result<()> {
        self.tx
            .blocking_send(LinkEvent::Provisioning(event))
            .map_err(|_| closed())
    }

    pub async fn credential_received(&self, raw: RawCredential) -> Result<()> {
        self.emit(ProvisioningEvent::CredentialReceived(raw)).await
    }

    pub async fn exchange_complete(&self) -> Result<()> {
        self.emit(ProvisioningEvent::ExchangeComplete).await
    }
}
