//! Credential persistence
//!
//! `MemoryStore` for tests and hosts without storage, `RonFileStore` for a
//! credential file next to `config.ron`.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use anyhow::{bail, Context, Result};
use log::*;

use crate::credential::Credential;

pub trait CredentialStore: Send + Sync {
    /// Last saved credential, `None` if nothing was ever saved
    fn load(&self) -> Result<Option<Credential>>;

    fn save(&self, credential: &Credential) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryStore {
    credential: Mutex<Option<Credential>>,
    fail: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        Self {
            credential: Mutex::new(Some(credential)),
            fail: AtomicBool::new(false),
        }
    }

    /// Make every subsequent load and save fail
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn stored(&self) -> Option<Credential> {
        self.credential.lock().ok().and_then(|c| c.clone())
    }
}

impl CredentialStore for MemoryStore {
    fn load(&self) -> Result<Option<Credential>> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("credential storage unavailable");
        }
        match self.credential.lock() {
            Ok(credential) => Ok(credential.clone()),
            Err(_) => bail!("credential storage lock poisoned"),
        }
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("credential storage unavailable");
        }
        match self.credential.lock() {
            Ok(mut stored) => {
                *stored = Some(credential.clone());
                Ok(())
            }
            Err(_) => bail!("credential storage lock poisoned"),
        }
    }
}

pub struct RonFileStore {
    path: PathBuf,
}

impl RonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for RonFileStore {
    fn load(&self) -> Result<Option<Credential>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("store: no credential file at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read {}", self.path.display()))
            }
        };

        let credential: Credential = ron::from_str(&contents)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        Ok(Some(credential))
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        let contents = ron::ser::to_string_pretty(credential, ron::ser::PrettyConfig::default())
            .context("failed to serialize credential")?;

        // Write then rename so a crash never leaves half a file behind
        let tmp = self.path.with_extension("ron.tmp");
        std::fs::write(&tmp, contents)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;

        info!("store: saved credential for {}", credential.ssid());
        Ok(())
    }
}
