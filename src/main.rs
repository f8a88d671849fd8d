use std::{sync::Arc, time::Duration};

use anyhow::Error;
use link_keeper::{
    prelude::*,
    services::Version,
    sim::{
        RecordingCommandSink, SimBusTransport, SimFirmwareSink, SimLinkDriver,
        SimProvisioningDriver, SimUpdateTransport,
    },
};
use log::*;

/// Drives one full lifecycle against simulated collaborators: connect, take
/// a command and an upgrade, lose the access point, recover through the
/// retry timer, then recover again through provisioning.
#[tokio::main]
async fn main() -> Result<(), Error> {
    link_keeper::logging::init()?;

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            warn!("No usable config.ron ({:#}), using defaults", e);
            Config::default()
        }
    };
    let default_credential = config.default_credential.to_credential()?;

    let store: Arc<dyn CredentialStore> = match &config.credential_path {
        Some(path) => Arc::new(RonFileStore::new(path)),
        None => Arc::new(MemoryStore::new()),
    };

    let radio = Arc::new(SimLinkDriver::with_access_point(default_credential.ssid()));
    let provisioning = Arc::new(SimProvisioningDriver::default());
    let broker = Arc::new(SimBusTransport::default());
    let running = Version::parse(&config.update.running_version)?;
    let next = Version {
        minor: running.minor + 1,
        ..running
    };

    info!("Starting connectivity...");
    let connectivity = init_connectivity(
        config,
        default_credential.clone(),
        Collaborators {
            link_driver: radio.clone(),
            provisioning_driver: provisioning.clone(),
            store,
            bus_transport: broker.clone(),
            command_sink: Arc::new(RecordingCommandSink::default()),
            update_transport: Arc::new(SimUpdateTransport::with_image(next, 64 * 1024)),
            firmware_sink: Arc::new(SimFirmwareSink::default()),
        },
    )?;
    let handle = connectivity.handle();
    radio.attach(handle.driver_events());

    let mut link = handle.subscribe_link_state();
    link.wait_for(|s| *s == LinkState::Connected).await;
    info!("Link up, services {:?}", handle.services());

    if let Some(inbound) = broker.inbound() {
        inbound.deliver("firstLightCommand", b"on").await?;
        inbound.deliver("firstRgbCommand", b"255,96,0").await?;
    }

    info!("Upgrade request: {:?}", handle.request_upgrade());
    let mut upgrade = handle.upgrade_status();
    let status = upgrade
        .wait_for(|s| matches!(s, UpgradeStatus::Ready { .. } | UpgradeStatus::Failed { .. }))
        .await?
        .clone();
    info!("Upgrade finished: {:?}", status);

    info!("Taking the access point away...");
    radio.set_access_point_online(false, "beacon timeout");
    link.wait_for(|s| *s == LinkState::Disconnected).await;
    info!("Recovery paths: {:?}", handle.recovery());

    tokio::time::sleep(Duration::from_secs(3)).await;
    radio.set_access_point_online(true, "");
    link.wait_for(|s| *s == LinkState::Connected).await;
    info!("Recovered through the retry timer: {:?}", handle.recovery());

    info!("Taking the access point away again...");
    radio.set_access_point_online(false, "user disconnect");
    link.wait_for(|s| *s == LinkState::Disconnected).await;
    radio.set_access_point_online(true, "");

    let companion = handle.provisioning_events();
    companion
        .credential_received(RawCredential {
            ssid: default_credential.ssid().as_bytes().to_vec(),
            secret: default_credential.secret().as_bytes().to_vec(),
            bssid: None,
        })
        .await?;
    link.wait_for(|s| *s == LinkState::Connected).await;
    companion.exchange_complete().await?;
    info!(
        "Recovered through provisioning: {:?}, {} session(s) opened",
        handle.recovery(),
        provisioning.starts()
    );

    connectivity.shutdown().await?;
    Ok(())
}
