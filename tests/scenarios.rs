use std::{sync::Arc, time::Duration};

use link_keeper::{
    prelude::*,
    reconnect::ReconnectPolicy,
    services::{command::Switch, Command, Version},
    sim::{
        DriverCall, RecordingCommandSink, SimBusTransport, SimFirmwareSink, SimLinkDriver,
        SimProvisioningDriver, SimUpdateTransport, SIM_ADDRESS,
    },
};
use tokio::time::Instant;

struct Rig {
    connectivity: Connectivity,
    handle: CoordinatorHandle,
    radio: Arc<SimLinkDriver>,
    provisioning: Arc<SimProvisioningDriver>,
    broker: Arc<SimBusTransport>,
    store: Arc<MemoryStore>,
    commands: Arc<RecordingCommandSink>,
}

fn v(version: &str) -> Version {
    Version::parse(version).unwrap()
}

fn config() -> Config {
    let mut config = Config::default();
    config.update.running_version = "1.0.0".to_string();
    config
}

fn greenhouse() -> Credential {
    Credential::new("greenhouse", "tomatoes").unwrap()
}

fn rig_with(
    config: Config,
    radio: SimLinkDriver,
    store: MemoryStore,
    update: SimUpdateTransport,
) -> Rig {
    let radio = Arc::new(radio);
    let provisioning = Arc::new(SimProvisioningDriver::default());
    let broker = Arc::new(SimBusTransport::default());
    let store = Arc::new(store);
    let commands = Arc::new(RecordingCommandSink::default());

    let connectivity = init_connectivity(
        config,
        greenhouse(),
        Collaborators {
            link_driver: radio.clone(),
            provisioning_driver: provisioning.clone(),
            store: store.clone(),
            bus_transport: broker.clone(),
            command_sink: commands.clone(),
            update_transport: Arc::new(update),
            firmware_sink: Arc::new(SimFirmwareSink::default()),
        },
    )
    .unwrap();
    let handle = connectivity.handle();
    radio.attach(handle.driver_events());

    Rig {
        connectivity,
        handle,
        radio,
        provisioning,
        broker,
        store,
        commands,
    }
}

fn rig() -> Rig {
    rig_with(
        config(),
        SimLinkDriver::manual(),
        MemoryStore::new(),
        SimUpdateTransport::with_image(v("1.1.0"), 4096),
    )
}

async fn wait_state(handle: &CoordinatorHandle, state: LinkState) {
    handle
        .subscribe_link_state()
        .wait_for(|s| *s == state)
        .await
        .unwrap();
}

async fn wait_recovery(
    handle: &CoordinatorHandle,
    pred: impl FnMut(&RecoveryStatus) -> bool,
) -> RecoveryStatus {
    let mut recovery = handle.subscribe_recovery();
    let status = *recovery.wait_for(pred).await.unwrap();
    status
}

async fn wait_services(handle: &CoordinatorHandle, pred: impl FnMut(&DependentServiceSet) -> bool) {
    handle.subscribe_services().wait_for(pred).await.unwrap();
}

async fn bring_up(rig: &Rig) {
    rig.handle
        .driver_events()
        .ip_acquired(SIM_ADDRESS)
        .await
        .unwrap();
    wait_state(&rig.handle, LinkState::Connected).await;
    wait_services(&rig.handle, |s| s.message_bus_running && s.update_agent_running).await;
}

async fn drop_link(rig: &Rig, reason: &str) {
    rig.handle.driver_events().link_down(reason).await.unwrap();
    wait_state(&rig.handle, LinkState::Disconnected).await;
}

#[tokio::test(start_paused = true)]
async fn test_init_configures_then_connects() {
    let rig = rig();

    assert_eq!(rig.handle.link_state(), LinkState::Connecting);
    assert_eq!(
        rig.radio.calls(),
        vec![
            DriverCall::Reconfigure("greenhouse".to_string()),
            DriverCall::Connect
        ]
    );
    assert_eq!(rig.handle.services(), DependentServiceSet::default());

    rig.connectivity.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stored_credential_wins_over_default() {
    let stored = Credential::new("barn", "hay-bale-42").unwrap();
    let rig = rig_with(
        config(),
        SimLinkDriver::manual(),
        MemoryStore::with_credential(stored),
        SimUpdateTransport::with_image(v("1.1.0"), 64),
    );

    assert_eq!(rig.radio.configured_ssid().as_deref(), Some("barn"));
}

#[tokio::test]
async fn test_init_failures_are_fatal() {
    let store = MemoryStore::new();
    store.set_failing(true);
    let collaborators = || Collaborators {
        link_driver: Arc::new(SimLinkDriver::manual()),
        provisioning_driver: Arc::new(SimProvisioningDriver::default()),
        store: Arc::new(MemoryStore::new()),
        bus_transport: Arc::new(SimBusTransport::default()),
        command_sink: Arc::new(RecordingCommandSink::default()),
        update_transport: Arc::new(SimUpdateTransport::with_image(v("1.1.0"), 64)),
        firmware_sink: Arc::new(SimFirmwareSink::default()),
    };

    let failing = Collaborators {
        store: Arc::new(store),
        ..collaborators()
    };
    assert!(matches!(
        init_connectivity(config(), greenhouse(), failing),
        Err(InitError::CredentialStore(_))
    ));

    let mut zero_queue = config();
    zero_queue.message_bus.queue_depth = 0;
    assert!(matches!(
        init_connectivity(zero_queue, greenhouse(), collaborators()),
        Err(InitError::InvalidConfig(_))
    ));

    let mut zero_period = config();
    zero_period.reconnect.short_interval_secs = 0;
    assert!(matches!(
        init_connectivity(zero_period, greenhouse(), collaborators()),
        Err(InitError::InvalidConfig(_))
    ));
}

#[test]
fn test_init_outside_runtime_is_fatal() {
    let result = init_connectivity(
        config(),
        greenhouse(),
        Collaborators {
            link_driver: Arc::new(SimLinkDriver::manual()),
            provisioning_driver: Arc::new(SimProvisioningDriver::default()),
            store: Arc::new(MemoryStore::new()),
            bus_transport: Arc::new(SimBusTransport::default()),
            command_sink: Arc::new(RecordingCommandSink::default()),
            update_transport: Arc::new(SimUpdateTransport::with_image(v("1.1.0"), 64)),
            firmware_sink: Arc::new(SimFirmwareSink::default()),
        },
    );
    assert!(matches!(result, Err(InitError::NoRuntime)));
}

#[tokio::test(start_paused = true)]
async fn test_recovery_paths_stop_exactly_once() {
    let rig = rig();
    bring_up(&rig).await;

    drop_link(&rig, "beacon timeout").await;
    let status = wait_recovery(&rig.handle, |r| r.reconnect_running && r.provisioning_active).await;
    assert_eq!(status.reconnect_cycles_started, 1);
    assert_eq!(status.provisioning_sessions_started, 1);
    assert_eq!(rig.handle.services(), DependentServiceSet::default());

    let events = rig.handle.driver_events();
    events.link_up().await.unwrap();
    wait_state(&rig.handle, LinkState::Connecting).await;
    events.ip_acquired(SIM_ADDRESS).await.unwrap();
    wait_state(&rig.handle, LinkState::Connected).await;

    let status =
        wait_recovery(&rig.handle, |r| !r.reconnect_running && !r.provisioning_active).await;
    assert_eq!(status.reconnect_cycles_stopped, 1);
    assert_eq!(status.provisioning_sessions_closed, 1);
    assert_eq!(rig.provisioning.stops(), 1);

    // Nothing left running fires later
    tokio::time::sleep(Duration::from_secs(120)).await;
    let status = rig.handle.recovery();
    assert_eq!(status.reconnect_cycles_started, 1);
    assert_eq!(status.provisioning_sessions_started, 1);
    assert_eq!(rig.handle.link_state(), LinkState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_link_down_never_doubles_recovery() {
    let rig = rig();
    bring_up(&rig).await;

    drop_link(&rig, "beacon timeout").await;
    rig.handle.driver_events().link_down("auth expire").await.unwrap();
    rig.handle.driver_events().link_down("auth expire").await.unwrap();
    let status = wait_recovery(&rig.handle, |r| r.reconnect_running).await;

    // Let the coordinator drain the duplicates
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(rig.handle.recovery().reconnect_cycles_started, 1);
    assert_eq!(status.provisioning_sessions_started, 1);
    assert_eq!(rig.provisioning.starts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_two_rapid_upgrade_requests() {
    let rig = rig_with(
        config(),
        SimLinkDriver::manual(),
        MemoryStore::new(),
        SimUpdateTransport::with_image(v("1.1.0"), 4096).chunk_delay(Duration::from_millis(20)),
    );
    assert_eq!(rig.handle.request_upgrade(), UpgradeRequest::Rejected);

    bring_up(&rig).await;
    assert_eq!(rig.handle.request_upgrade(), UpgradeRequest::Accepted);
    assert_eq!(rig.handle.request_upgrade(), UpgradeRequest::Busy);

    let status = rig
        .handle
        .upgrade_status()
        .wait_for(|s| matches!(s, UpgradeStatus::Ready { .. }))
        .await
        .unwrap()
        .clone();
    assert_eq!(
        status,
        UpgradeStatus::Ready {
            version: v("1.1.0")
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_applied_credential_reconfigures_before_connect() {
    let rig = rig();
    bring_up(&rig).await;

    let orchard = Credential::new("orchard", "apples-and-pears").unwrap();
    rig.handle
        .apply_new_credential(orchard.clone())
        .await
        .unwrap();
    assert_eq!(rig.handle.link_state(), LinkState::Connecting);
    assert_eq!(rig.store.stored(), Some(orchard));

    // Disconnect, then reconnect through the retry timer
    drop_link(&rig, "assoc leave").await;
    tokio::time::sleep(Duration::from_secs(6)).await;
    wait_state(&rig.handle, LinkState::Connecting).await;

    let calls = rig.radio.calls();
    let reconfigure = calls
        .iter()
        .rposition(|c| *c == DriverCall::Reconfigure("orchard".to_string()))
        .unwrap();
    let disconnect = calls.iter().rposition(|c| *c == DriverCall::Disconnect).unwrap();
    assert!(disconnect < reconfigure);
    // Only connects follow the reconfigure
    assert!(calls[reconfigure + 1..]
        .iter()
        .all(|c| *c == DriverCall::Connect));
    assert!(calls[reconfigure + 1..].len() >= 2);
    assert_eq!(rig.radio.configured_ssid().as_deref(), Some("orchard"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_persist_still_applies_credential() {
    let rig = rig();
    bring_up(&rig).await;
    rig.store.set_failing(true);

    let orchard = Credential::new("orchard", "apples-and-pears").unwrap();
    let result = rig.handle.apply_new_credential(orchard).await;

    assert!(result.is_err());
    assert_eq!(rig.radio.configured_ssid().as_deref(), Some("orchard"));
    assert_eq!(rig.handle.link_state(), LinkState::Connecting);
}

#[tokio::test(start_paused = true)]
async fn test_tiered_retry_delays() {
    let mut config = config();
    config.reconnect = ReconnectPolicy::new(5, 30, 3);
    let rig = rig_with(
        config,
        SimLinkDriver::manual(),
        MemoryStore::new(),
        SimUpdateTransport::with_image(v("1.1.0"), 64),
    );
    bring_up(&rig).await;

    let connects_before = rig.radio.connects();
    drop_link(&rig, "beacon timeout").await;
    let lost_at = Instant::now();

    for attempt in 1..=4 {
        while rig.radio.connects() < connects_before + attempt {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        // Each attempt fails
        rig.handle
            .driver_events()
            .link_down("no ap found")
            .await
            .unwrap();
        wait_state(&rig.handle, LinkState::Disconnected).await;
    }

    let attempts: Vec<Instant> = rig
        .radio
        .call_log()
        .into_iter()
        .filter(|(_, call)| *call == DriverCall::Connect)
        .skip(connects_before)
        .map(|(at, _)| at)
        .collect();
    assert_eq!(attempts.len(), 4);

    let mut delays = Vec::new();
    let mut previous = lost_at;
    for at in attempts {
        delays.push(((at - previous).as_millis() + 500) / 1000);
        previous = at;
    }
    assert_eq!(delays, vec![5, 5, 5, 30]);

    // Failed attempts never reopen provisioning
    assert_eq!(rig.provisioning.starts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_user_disconnect_provisioning_times_out_then_timer_reconnects() {
    let rig = rig_with(
        config(),
        SimLinkDriver::with_access_point("greenhouse"),
        MemoryStore::new(),
        SimUpdateTransport::with_image(v("1.1.0"), 64),
    );
    wait_state(&rig.handle, LinkState::Connected).await;

    rig.radio.set_access_point_online(false, "user disconnect");
    wait_state(&rig.handle, LinkState::Disconnected).await;
    let status = wait_recovery(&rig.handle, |r| r.reconnect_running && r.provisioning_active).await;
    assert_eq!(status.provisioning_sessions_started, 1);
    assert_eq!(rig.provisioning.last_timeout(), Some(Duration::from_secs(60)));

    // Provisioning gives up first, the timer keeps going
    let dropped_at = Instant::now();
    let status = wait_recovery(&rig.handle, |r| r.provisioning_sessions_closed == 1).await;
    assert!(!status.provisioning_active);
    assert!(status.reconnect_running);
    assert!(dropped_at.elapsed() >= Duration::from_secs(59));
    assert_ne!(rig.handle.link_state(), LinkState::Connected);

    rig.radio.set_access_point_online(true, "");
    wait_state(&rig.handle, LinkState::Connected).await;

    let status = wait_recovery(&rig.handle, |r| !r.reconnect_running).await;
    assert_eq!(status.reconnect_cycles_stopped, 1);
    assert_eq!(status.provisioning_sessions_started, 1);
    assert_eq!(rig.provisioning.stops(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_oversized_provisioned_ssid_is_truncated_and_applied() {
    let rig = rig();
    bring_up(&rig).await;
    drop_link(&rig, "beacon timeout").await;
    wait_recovery(&rig.handle, |r| r.provisioning_active).await;

    rig.handle
        .provisioning_events()
        .credential_received(RawCredential {
            ssid: b"a-very-long-network-name-that-overflows".to_vec(),
            secret: b"hunter22".to_vec(),
            bssid: None,
        })
        .await
        .unwrap();
    wait_state(&rig.handle, LinkState::Connecting).await;

    let expected = "a-very-long-network-name-that-ov";
    assert_eq!(rig.radio.configured_ssid().as_deref(), Some(expected));
    assert_eq!(rig.store.stored().unwrap().ssid(), expected);

    // Session stays open until the exchange is acknowledged
    assert!(rig.handle.recovery().provisioning_active);
    rig.handle
        .provisioning_events()
        .exchange_complete()
        .await
        .unwrap();
    wait_recovery(&rig.handle, |r| !r.provisioning_active).await;
}

#[tokio::test(start_paused = true)]
async fn test_malformed_provisioning_payload_keeps_session() {
    let rig = rig();
    bring_up(&rig).await;
    drop_link(&rig, "beacon timeout").await;
    wait_recovery(&rig.handle, |r| r.provisioning_active).await;
    let calls_before = rig.radio.calls().len();

    rig.handle
        .provisioning_events()
        .credential_received(RawCredential {
            ssid: vec![0xff, 0xfe, 0xfd],
            secret: b"whatever".to_vec(),
            bssid: None,
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(rig.radio.calls().len(), calls_before);
    assert!(rig.handle.recovery().provisioning_active);
    assert_eq!(rig.handle.link_state(), LinkState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_tears_down_services() {
    let rig = rig();
    bring_up(&rig).await;
    assert_eq!(rig.broker.connects(), 1);
    assert!(rig.broker.subscriptions().contains(&"pumpCommand".to_string()));
    assert!(rig
        .broker
        .published()
        .contains(&("fanSpeedState".to_string(), b"100".to_vec())));

    let inbound = rig.broker.inbound().unwrap();
    inbound.deliver("pumpCommand", b"on").await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(rig.commands.commands(), vec![Command::Pump(Switch::On)]);

    drop_link(&rig, "beacon timeout").await;
    wait_services(&rig.handle, |s| !s.any_running()).await;
    assert_eq!(rig.broker.disconnects(), 1);
    assert_eq!(rig.handle.request_upgrade(), UpgradeRequest::Rejected);

    // The old session's sender is dead
    assert!(inbound.deliver("pumpCommand", b"off").await.is_err());
    assert_eq!(rig.commands.commands().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_broker_is_retried_while_link_stays_up() {
    let rig = rig();
    rig.broker.set_unreachable(true);
    rig.handle
        .driver_events()
        .ip_acquired(SIM_ADDRESS)
        .await
        .unwrap();
    wait_services(&rig.handle, |s| s.update_agent_running).await;
    assert!(!rig.handle.services().message_bus_running);

    tokio::time::sleep(Duration::from_secs(1)).await;
    rig.broker.set_unreachable(false);
    wait_services(&rig.handle, |s| s.message_bus_running).await;

    assert_eq!(rig.handle.link_state(), LinkState::Connected);
    assert_eq!(rig.broker.connects(), 1);
    assert!(rig.broker.subscriptions().contains(&"fanCommand".to_string()));
    // The link itself was never touched
    assert_eq!(rig.radio.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_broker_retry_stops_with_the_link() {
    let rig = rig();
    rig.broker.set_unreachable(true);
    rig.handle
        .driver_events()
        .ip_acquired(SIM_ADDRESS)
        .await
        .unwrap();
    wait_services(&rig.handle, |s| s.update_agent_running).await;

    drop_link(&rig, "beacon timeout").await;
    rig.broker.set_unreachable(false);
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(rig.broker.connects(), 0);
    assert!(!rig.handle.services().any_running());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_broker_never_blocks_link_events() {
    let rig = rig();
    rig.broker.set_stalled(true);
    let events = rig.handle.driver_events();
    events.ip_acquired(SIM_ADDRESS).await.unwrap();
    events.link_down("beacon timeout").await.unwrap();

    wait_state(&rig.handle, LinkState::Disconnected).await;
    let status = wait_recovery(&rig.handle, |r| r.reconnect_running && r.provisioning_active).await;
    assert_eq!(status.reconnect_cycles_started, 1);
    assert_eq!(rig.broker.connects(), 1);
    assert!(!rig.handle.services().any_running());
}

#[tokio::test(start_paused = true)]
async fn test_credential_switch_does_not_open_provisioning() {
    let rig = rig_with(
        config(),
        SimLinkDriver::with_access_point("greenhouse"),
        MemoryStore::new(),
        SimUpdateTransport::with_image(v("1.1.0"), 64),
    );
    wait_state(&rig.handle, LinkState::Connected).await;

    let mut seen = rig.handle.subscribe_link_state().watch();
    seen.borrow_and_update();
    let watcher = tokio::spawn(async move {
        let mut states = Vec::new();
        while seen.changed().await.is_ok() {
            let state = *seen.borrow_and_update();
            states.push(state);
            if state == LinkState::Connected {
                break;
            }
        }
        states
    });

    let rotated = Credential::new("greenhouse", "new-season-secret").unwrap();
    rig.handle.apply_new_credential(rotated).await.unwrap();
    let states = watcher.await.unwrap();
    assert!(!states.contains(&LinkState::Disconnected), "{:?}", states);

    let status = wait_recovery(&rig.handle, |r| !r.reconnect_running).await;
    assert_eq!(status.provisioning_sessions_started, 0);
    assert_eq!(rig.provisioning.starts(), 0);
    assert_eq!(rig.handle.link_state(), LinkState::Connected);

    // A genuine loss afterwards still opens both recovery paths
    rig.radio.set_access_point_online(false, "beacon timeout");
    wait_state(&rig.handle, LinkState::Disconnected).await;
    wait_recovery(&rig.handle, |r| r.provisioning_active).await;
    assert_eq!(rig.provisioning.starts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_now_while_disconnected() {
    let rig = rig();
    bring_up(&rig).await;
    drop_link(&rig, "beacon timeout").await;
    let connects_before = rig.radio.connects();

    rig.handle.request_reconnect_now().await.unwrap();
    wait_state(&rig.handle, LinkState::Connecting).await;

    assert_eq!(rig.radio.connects(), connects_before + 1);
    // Well before the first timer tick
    assert!(rig.handle.recovery().reconnect_running);
}

#[tokio::test(start_paused = true)]
async fn test_tick_from_stopped_cycle_is_ignored() {
    let rig = rig();
    bring_up(&rig).await;

    // Hold the coordinator in the bus teardown so the first retry tick
    // queues up behind the recovery and a second loss.
    rig.broker.set_stalled(true);
    drop_link(&rig, "beacon timeout").await;
    let connects_before = rig.radio.connects();

    let events = rig.handle.driver_events();
    events.ip_acquired(SIM_ADDRESS).await.unwrap();
    events.link_down("beacon timeout").await.unwrap();
    rig.broker.set_stalled(false);

    let status = wait_recovery(&rig.handle, |r| r.reconnect_cycles_started == 2).await;
    assert_eq!(status.reconnect_cycles_stopped, 1);

    // The first cycle's tick is drained right after the second loss
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(rig.handle.link_state(), LinkState::Disconnected);
    assert_eq!(rig.radio.connects(), connects_before);

    // The live cycle still retries on schedule
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(rig.radio.connects(), connects_before + 1);
}

#[tokio::test(start_paused = true)]
async fn test_refused_connect_falls_back_to_timer() {
    let radio = SimLinkDriver::manual();
    radio.set_fail_connect(true);
    let rig = rig_with(
        config(),
        radio,
        MemoryStore::new(),
        SimUpdateTransport::with_image(v("1.1.0"), 64),
    );

    assert_eq!(rig.handle.link_state(), LinkState::Connecting);
    assert!(rig.handle.recovery().reconnect_running);
    assert_eq!(rig.radio.connects(), 0);

    rig.radio.set_fail_connect(false);
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(rig.radio.connects(), 1);

    rig.handle.request_reconnect_now().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(rig.radio.connects(), 2);

    bring_up(&rig).await;
    assert!(!rig.handle.recovery().reconnect_running);
}
