//! Simulated collaborators
//!
//! In-process stand-ins for the radio, the provisioning protocol, the broker
//! and the update server. Used by the demo binary and the tests.

use std::{
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use crc::{Crc, CRC_32_ISO_HDLC};
use log::*;
use tokio::time::Instant;

use crate::{
    coordinator::DriverEvents,
    credential::Credential,
    link::{DriverEvent, LinkDriver},
    provisioning::ProvisioningDriver,
    services::{
        BusSession, BusTransport, Command, CommandSink, FirmwareFetch, FirmwareSink,
        ImageDescriptor, InboundSender, UpdateTransport, Version,
    },
};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub const SIM_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    Connect,
    Disconnect,
    /// Carries the SSID the station was reconfigured for
    Reconfigure(String),
}

struct AccessPoint {
    ssid: String,
    online: bool,
}

/// Simulated station radio.
///
/// In manual mode it only records calls and the test emits every event
/// itself. With an access point it answers connect requests on its own: an
/// IP lease when the configured SSID matches a reachable access point, a
/// link-down otherwise.
pub struct SimLinkDriver {
    calls: Mutex<Vec<(Instant, DriverCall)>>,
    events: Mutex<Option<DriverEvents>>,
    access_point: Mutex<Option<AccessPoint>>,
    configured: Mutex<Option<String>>,
    connect_delay: Duration,
    fail_connect: AtomicBool,
}

impl SimLinkDriver {
    pub fn manual() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            events: Mutex::new(None),
            access_point: Mutex::new(None),
            configured: Mutex::new(None),
            connect_delay: Duration::from_millis(200),
            fail_connect: AtomicBool::new(false),
        }
    }

    pub fn with_access_point(ssid: &str) -> Self {
        let driver = Self::manual();
        if let Ok(mut ap) = driver.access_point.lock() {
            *ap = Some(AccessPoint {
                ssid: ssid.to_string(),
                online: true,
            });
        }
        driver
    }

    /// Start emitting events. A connect issued before attaching is answered
    /// now.
    pub fn attach(&self, events: DriverEvents) {
        if let Ok(mut slot) = self.events.lock() {
            *slot = Some(events);
        }
        let pending = self
            .calls
            .lock()
            .map(|calls| matches!(calls.last(), Some((_, DriverCall::Connect))))
            .unwrap_or(false);
        if pending {
            self.answer_connect();
        }
    }

    /// Take the access point down (emitting a link-down) or bring it back
    pub fn set_access_point_online(&self, online: bool, reason: &str) {
        if let Ok(mut ap) = self.access_point.lock() {
            if let Some(ap) = ap.as_mut() {
                ap.online = online;
            }
        }
        if !online {
            self.emit_after(
                Duration::ZERO,
                DriverEvent::LinkDown {
                    reason: reason.to_string(),
                },
            );
        }
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.call_log().into_iter().map(|(_, call)| call).collect()
    }

    pub fn call_log(&self) -> Vec<(Instant, DriverCall)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn connects(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| **call == DriverCall::Connect)
            .count()
    }

    pub fn configured_ssid(&self) -> Option<String> {
        self.configured.lock().ok().and_then(|c| c.clone())
    }

    fn record(&self, call: DriverCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((Instant::now(), call));
        }
    }

    fn answer_connect(&self) {
        let reachable = {
            let ap = self.access_point.lock();
            let configured = self.configured_ssid();
            match ap.as_deref() {
                Ok(Some(ap)) => Some(ap.online && configured.as_deref() == Some(ap.ssid.as_str())),
                _ => None,
            }
        };

        match reachable {
            Some(true) => self.emit_after(
                self.connect_delay,
                DriverEvent::IpAcquired {
                    address: SIM_ADDRESS,
                },
            ),
            Some(false) => self.emit_after(
                self.connect_delay,
                DriverEvent::LinkDown {
                    reason: "no ap found".to_string(),
                },
            ),
            // Manual mode
            None => {}
        }
    }

    fn emit_after(&self, delay: Duration, event: DriverEvent) {
        let Some(events) = self.events.lock().ok().and_then(|e| e.clone()) else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = events.emit(event).await {
                debug!("sim: {:#}", e);
            }
        });
    }
}

impl LinkDriver for SimLinkDriver {
    fn connect(&self) -> Result<()> {
        if self.fail_connect.load(Ordering::SeqCst) {
            bail!("radio busy");
        }
        self.record(DriverCall::Connect);
        self.answer_connect();
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        self.record(DriverCall::Disconnect);
        let auto = self
            .access_point
            .lock()
            .map(|ap| ap.is_some())
            .unwrap_or(false);
        if auto {
            self.emit_after(
                Duration::ZERO,
                DriverEvent::LinkDown {
                    reason: "assoc leave".to_string(),
                },
            );
        }
        Ok(())
    }

    fn reconfigure(&self, credential: &Credential) -> Result<()> {
        self.record(DriverCall::Reconfigure(credential.ssid().to_string()));
        if let Ok(mut configured) = self.configured.lock() {
            *configured = Some(credential.ssid().to_string());
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct SimProvisioningDriver {
    starts: AtomicUsize,
    stops: AtomicUsize,
    last_timeout: Mutex<Option<Duration>>,
}

impl SimProvisioningDriver {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn last_timeout(&self) -> Option<Duration> {
        self.last_timeout.lock().ok().and_then(|t| *t)
    }
}

impl ProvisioningDriver for SimProvisioningDriver {
    fn start_listening(&self, timeout: Duration) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_timeout.lock() {
            *last = Some(timeout);
        }
        Ok(())
    }

    fn stop_listening(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct BusState {
    inbound: Option<InboundSender>,
    subscriptions: Vec<String>,
    published: Vec<(String, Vec<u8>)>,
    connects: usize,
    disconnects: usize,
    stalled: bool,
}

/// Simulated broker. Keeps the inbound sender of the latest session so tests
/// can push commands at the client.
#[derive(Default)]
pub struct SimBusTransport {
    state: Arc<Mutex<BusState>>,
    unreachable: AtomicBool,
}

impl SimBusTransport {
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Accept connects but never answer anything sent on the session
    pub fn set_stalled(&self, stalled: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.stalled = stalled;
        }
    }

    pub fn inbound(&self) -> Option<InboundSender> {
        self.state.lock().ok().and_then(|s| s.inbound.clone())
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.subscriptions.clone())
            .unwrap_or_default()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.state
            .lock()
            .map(|s| s.published.clone())
            .unwrap_or_default()
    }

    pub fn connects(&self) -> usize {
        self.state.lock().map(|s| s.connects).unwrap_or(0)
    }

    pub fn disconnects(&self) -> usize {
        self.state.lock().map(|s| s.disconnects).unwrap_or(0)
    }
}

struct SimBusSession {
    state: Arc<Mutex<BusState>>,
}

impl SimBusSession {
    async fn answer(&self) {
        let stalled = self.state.lock().map(|s| s.stalled).unwrap_or(false);
        if stalled {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl BusTransport for SimBusTransport {
    async fn connect(
        &self,
        broker_uri: &str,
        inbound: InboundSender,
    ) -> Result<Box<dyn BusSession>> {
        if self.unreachable.load(Ordering::SeqCst) {
            bail!("broker {} unreachable", broker_uri);
        }
        if let Ok(mut state) = self.state.lock() {
            state.connects += 1;
            state.inbound = Some(inbound);
        }
        Ok(Box::new(SimBusSession {
            state: self.state.clone(),
        }))
    }
}

#[async_trait]
impl BusSession for SimBusSession {
    async fn subscribe(&mut self, topic: &str, _qos: u8) -> Result<()> {
        self.answer().await;
        if let Ok(mut state) = self.state.lock() {
            state.subscriptions.push(topic.to_string());
        }
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &[u8], _qos: u8) -> Result<()> {
        self.answer().await;
        if let Ok(mut state) = self.state.lock() {
            state.published.push((topic.to_string(), payload.to_vec()));
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.answer().await;
        if let Ok(mut state) = self.state.lock() {
            state.disconnects += 1;
            state.inbound = None;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingCommandSink {
    commands: Mutex<Vec<Command>>,
}

impl RecordingCommandSink {
    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl CommandSink for RecordingCommandSink {
    fn execute(&self, command: Command) -> Result<()> {
        info!("sim: executing {:?}", command);
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(command);
        }
        Ok(())
    }
}

/// Simulated update server serving a single image
pub struct SimUpdateTransport {
    descriptor: ImageDescriptor,
    body: Vec<u8>,
    chunk_size: usize,
    chunk_delay: Duration,
    unreachable: bool,
    silent: bool,
}

impl SimUpdateTransport {
    pub fn with_image(version: Version, size: usize) -> Self {
        let body: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let descriptor = ImageDescriptor {
            version,
            size: body.len() as u32,
            crc32: CRC32.checksum(&body),
        };
        Self {
            descriptor,
            body,
            chunk_size: 256,
            chunk_delay: Duration::ZERO,
            unreachable: false,
            silent: false,
        }
    }

    pub fn chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Advertise a checksum the body does not have
    pub fn corrupt_crc(mut self) -> Self {
        self.descriptor.crc32 = !self.descriptor.crc32;
        self
    }

    /// Serve only the first `len` body bytes while advertising the full size
    pub fn truncate_body(mut self, len: usize) -> Self {
        self.body.truncate(len);
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    /// Accept the request but never send the image header
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn descriptor(&self) -> &ImageDescriptor {
        &self.descriptor
    }
}

struct SimFetch {
    descriptor: ImageDescriptor,
    chunks: std::vec::IntoIter<Vec<u8>>,
    delay: Duration,
}

#[async_trait]
impl UpdateTransport for SimUpdateTransport {
    async fn begin_fetch(&self, url: &str) -> Result<Box<dyn FirmwareFetch>> {
        if self.unreachable {
            bail!("{} unreachable", url);
        }
        if self.silent {
            std::future::pending::<()>().await;
        }
        let chunks: Vec<Vec<u8>> = self
            .body
            .chunks(self.chunk_size)
            .map(|c| c.to_vec())
            .collect();
        Ok(Box::new(SimFetch {
            descriptor: self.descriptor.clone(),
            chunks: chunks.into_iter(),
            delay: self.chunk_delay,
        }))
    }
}

#[async_trait]
impl FirmwareFetch for SimFetch {
    fn descriptor(&self) -> &ImageDescriptor {
        &self.descriptor
    }

    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.chunks.next())
    }
}

#[derive(Default)]
struct SlotState {
    began: bool,
    written: Vec<u8>,
    finalized: bool,
    aborted: bool,
}

/// Simulated inactive firmware slot
#[derive(Default)]
pub struct SimFirmwareSink {
    slot: Mutex<SlotState>,
}

impl SimFirmwareSink {
    pub fn began(&self) -> bool {
        self.slot.lock().map(|s| s.began).unwrap_or(false)
    }

    pub fn finalized(&self) -> bool {
        self.slot.lock().map(|s| s.finalized).unwrap_or(false)
    }

    pub fn aborted(&self) -> bool {
        self.slot.lock().map(|s| s.aborted).unwrap_or(false)
    }

    pub fn written(&self) -> usize {
        self.slot.lock().map(|s| s.written.len()).unwrap_or(0)
    }
}

impl FirmwareSink for SimFirmwareSink {
    fn begin(&self, image: &ImageDescriptor) -> Result<()> {
        debug!("sim: writing image {} to inactive slot", image.version);
        if let Ok(mut slot) = self.slot.lock() {
            *slot = SlotState {
                began: true,
                ..Default::default()
            };
        }
        Ok(())
    }

    fn write(&self, chunk: &[u8]) -> Result<()> {
        match self.slot.lock() {
            Ok(mut slot) => {
                slot.written.extend_from_slice(chunk);
                Ok(())
            }
            Err(_) => bail!("slot lock poisoned"),
        }
    }

    fn finalize(&self) -> Result<()> {
        match self.slot.lock() {
            Ok(mut slot) => {
                slot.finalized = true;
                Ok(())
            }
            Err(_) => bail!("slot lock poisoned"),
        }
    }

    fn abort(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            slot.aborted = true;
        }
    }
}
