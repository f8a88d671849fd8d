pub mod config;
pub mod coordinator;
pub mod credential;
pub mod error;
pub mod link;
pub mod logging;
pub mod provisioning;
pub mod reconnect;
pub mod services;
pub mod sim;
pub mod store;

pub mod prelude {
    pub use crate::{
        config::Config,
        coordinator::{
            init_connectivity, Collaborators, Connectivity, CoordinatorHandle, DriverEvents,
            ProvisioningEvents, RecoveryStatus,
        },
        credential::{Credential, RawCredential},
        error::InitError,
        link::{DriverEvent, LinkDriver, LinkState},
        provisioning::{ProvisioningDriver, ProvisioningEvent},
        services::{DependentServiceSet, UpgradeRequest, UpgradeStatus},
        store::{CredentialStore, MemoryStore, RonFileStore},
    };
}
