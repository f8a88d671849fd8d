//! Firmware update agent
//!
//! A background worker that runs at most one upgrade at a time. Requests
//! never queue: a single busy flag decides between accepted and busy.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use crc::{Crc, CRC_32_ISO_HDLC};
use log::*;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};

use super::version::Version;
use crate::config::UpdateConfig;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// What the image header says about the image body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub version: Version,
    pub size: u32,
    pub crc32: u32,
}

#[async_trait]
pub trait UpdateTransport: Send + Sync {
    async fn begin_fetch(&self, url: &str) -> Result<Box<dyn FirmwareFetch>>;
}

#[async_trait]
pub trait FirmwareFetch: Send {
    fn descriptor(&self) -> &ImageDescriptor;

    /// Next slice of the image body, `None` once the body is exhausted
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Inactive firmware slot. Nothing written here affects the running image
/// until `finalize` succeeds.
pub trait FirmwareSink: Send + Sync {
    fn begin(&self, image: &ImageDescriptor) -> Result<()>;

    fn write(&self, chunk: &[u8]) -> Result<()>;

    fn finalize(&self) -> Result<()>;

    fn abort(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeRequest {
    Accepted,
    Busy,
    /// Agent not running, typically because the link is down
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeStatus {
    Idle,
    Downloading { received: u32, total: u32 },
    /// Image written and validated, waiting for a reboot into it
    Ready { version: Version },
    Failed { reason: String },
}

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("fetch failed: {0:#}")]
    Transport(anyhow::Error),
    #[error("fetch stalled for {0:?}")]
    Stalled(Duration),
    #[error("image version {offered} is not newer than running {running}")]
    VersionRejected { offered: Version, running: Version },
    #[error("image incomplete: {received} of {expected} bytes")]
    Incomplete { received: u32, expected: u32 },
    #[error("image larger than advertised {expected} bytes")]
    Oversize { expected: u32 },
    #[error("image checksum {actual:08x} does not match {expected:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("firmware slot write failed: {0:#}")]
    Sink(anyhow::Error),
    #[error("upgrade cancelled")]
    Cancelled,
}

impl UpgradeError {
    /// Network trouble that a later request may well get past
    pub fn is_transient(&self) -> bool {
        matches!(self, UpgradeError::Transport(_) | UpgradeError::Stalled(_))
    }
}

struct Worker {
    jobs: mpsc::Sender<()>,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

struct Shared {
    settings: UpdateConfig,
    running_version: Version,
    transport: Arc<dyn UpdateTransport>,
    sink: Arc<dyn FirmwareSink>,
    busy: AtomicBool,
    status: watch::Sender<UpgradeStatus>,
}

pub struct UpdateAgent {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl UpdateAgent {
    pub fn new(
        settings: UpdateConfig,
        transport: Arc<dyn UpdateTransport>,
        sink: Arc<dyn FirmwareSink>,
    ) -> Result<Self> {
        let running_version = Version::parse(&settings.running_version)?;
        let (status, _) = watch::channel(UpgradeStatus::Idle);

        Ok(Self {
            shared: Arc::new(Shared {
                settings,
                running_version,
                transport,
                sink,
                busy: AtomicBool::new(false),
                status,
            }),
            worker: Mutex::new(None),
        })
    }

    /// Spawn the background worker. Does nothing if it is already running.
    pub fn start(&self) -> bool {
        let Ok(mut worker) = self.worker.lock() else {
            error!("update: worker lock poisoned");
            return false;
        };
        if worker.is_some() {
            return false;
        }

        let (jobs, jobs_rx) = mpsc::channel(1);
        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run_worker(self.shared.clone(), jobs_rx, shutdown_rx));

        *worker = Some(Worker {
            jobs,
            shutdown,
            handle,
        });
        info!("update: agent running at {}", self.shared.running_version);
        true
    }

    /// Stop the worker, cancelling an upgrade in flight. Safe when stopped.
    pub fn stop(&self) -> bool {
        let taken = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(worker) = taken else {
            return false;
        };

        // The worker cleans up an in-flight upgrade itself; only force it
        // down if it already went away.
        if worker.shutdown.send(()).is_err() {
            worker.handle.abort();
        }
        drop(worker.jobs);
        info!("update: agent stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .map(|worker| worker.is_some())
            .unwrap_or(false)
    }

    pub fn request_upgrade(&self) -> UpgradeRequest {
        let Ok(worker) = self.worker.lock() else {
            return UpgradeRequest::Rejected;
        };
        let Some(worker) = worker.as_ref() else {
            debug!("update: request rejected, agent not running");
            return UpgradeRequest::Rejected;
        };

        if self
            .shared
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("update: request refused, upgrade already in flight");
            return UpgradeRequest::Busy;
        }

        match worker.jobs.try_send(()) {
            Ok(()) => {
                info!("update: upgrade accepted");
                UpgradeRequest::Accepted
            }
            Err(_) => {
                self.shared.busy.store(false, Ordering::Release);
                UpgradeRequest::Rejected
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::Acquire)
    }

    pub fn status(&self) -> watch::Receiver<UpgradeStatus> {
        self.shared.status.subscribe()
    }
}

impl Drop for UpdateAgent {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    mut jobs: mpsc::Receiver<()>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = &mut shutdown => {
                // Accepted but never started
                if jobs.try_recv().is_ok() {
                    shared.busy.store(false, Ordering::Release);
                }
                return;
            }
            job = jobs.recv() => job,
        };
        if job.is_none() {
            return;
        }

        let (outcome, cancelled) = tokio::select! {
            biased;
            _ = &mut shutdown => (Err(UpgradeError::Cancelled), true),
            outcome = perform(&shared) => (outcome, false),
        };

        let status = match outcome {
            Ok(version) => {
                info!("update: image {} written and validated", version);
                UpgradeStatus::Ready { version }
            }
            Err(e) => {
                shared.sink.abort();
                if e.is_transient() {
                    warn!("update: upgrade failed, will accept a new request: {}", e);
                } else {
                    error!("update: upgrade aborted, running firmware untouched: {}", e);
                }
                UpgradeStatus::Failed {
                    reason: e.to_string(),
                }
            }
        };
        shared.busy.store(false, Ordering::Release);
        shared.status.send_replace(status);

        if cancelled {
            return;
        }
    }
}

async fn perform(shared: &Shared) -> Result<Version, UpgradeError> {
    let settings = &shared.settings;
    let fetch = shared.transport.begin_fetch(&settings.image_url);
    let mut fetch = tokio::time::timeout(settings.chunk_timeout(), fetch)
        .await
        .map_err(|_| UpgradeError::Stalled(settings.chunk_timeout()))?
        .map_err(UpgradeError::Transport)?;

    let image = fetch.descriptor().clone();
    if !image.version.is_newer_than(&shared.running_version) {
        return Err(UpgradeError::VersionRejected {
            offered: image.version,
            running: shared.running_version.clone(),
        });
    }

    shared.sink.begin(&image).map_err(UpgradeError::Sink)?;
    shared.status.send_replace(UpgradeStatus::Downloading {
        received: 0,
        total: image.size,
    });

    let mut digest = CRC32.digest();
    let mut received: u32 = 0;
    loop {
        let chunk = tokio::time::timeout(settings.chunk_timeout(), fetch.read_chunk())
            .await
            .map_err(|_| UpgradeError::Stalled(settings.chunk_timeout()))?
            .map_err(UpgradeError::Transport)?;
        let Some(chunk) = chunk else {
            break;
        };

        let len = u32::try_from(chunk.len()).unwrap_or(u32::MAX);
        received = received.saturating_add(len);
        if received > image.size {
            return Err(UpgradeError::Oversize {
                expected: image.size,
            });
        }

        digest.update(&chunk);
        shared.sink.write(&chunk).map_err(UpgradeError::Sink)?;
        shared.status.send_replace(UpgradeStatus::Downloading {
            received,
            total: image.size,
        });
    }

    if received < image.size {
        return Err(UpgradeError::Incomplete {
            received,
            expected: image.size,
        });
    }

    let actual = digest.finalize();
    if actual != image.crc32 {
        return Err(UpgradeError::ChecksumMismatch {
            expected: image.crc32,
            actual,
        });
    }

    shared.sink.finalize().map_err(UpgradeError::Sink)?;
    Ok(image.version)
}
