use std::net::Ipv4Addr;

use crate::credential::Credential;

/// Raw station events as the radio driver reports them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// Station interface started
    LinkUp,
    /// Association lost or a connect attempt failed
    LinkDown { reason: String },
    /// DHCP lease obtained
    IpAcquired { address: Ipv4Addr },
}

/// Station-mode radio control. Calls return as soon as the request is
/// accepted; outcomes arrive later as [`DriverEvent`]s.
pub trait LinkDriver: Send + Sync {
    fn connect(&self) -> anyhow::Result<()>;

    fn disconnect(&self) -> anyhow::Result<()>;

    fn reconfigure(&self, credential: &Credential) -> anyhow::Result<()>;
}
