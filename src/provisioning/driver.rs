use std::time::Duration;

use crate::credential::RawCredential;

/// Events from the over-the-air provisioning protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningEvent {
    /// Companion app delivered a credential. Fields are unbounded here.
    CredentialReceived(RawCredential),
    /// Protocol acknowledged the exchange; the session can end
    ExchangeComplete,
}

pub trait ProvisioningDriver: Send + Sync {
    fn start_listening(&self, timeout: Duration) -> anyhow::Result<()>;

    fn stop_listening(&self) -> anyhow::Result<()>;
}
