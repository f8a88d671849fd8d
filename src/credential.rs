use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Station SSID buffer size on the radio
pub const SSID_MAX_LEN: usize = 32;
/// Station passphrase buffer size on the radio
pub const SECRET_MAX_LEN: usize = 64;

pub type Ssid = heapless::String<SSID_MAX_LEN>;
pub type Secret = heapless::String<SECRET_MAX_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialField {
    Ssid,
    Secret,
}

impl fmt::Display for CredentialField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialField::Ssid => write!(f, "ssid"),
            CredentialField::Secret => write!(f, "secret"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("ssid is empty")]
    EmptySsid,
    #[error("{field} is {len} bytes, limit is {max}")]
    TooLong {
        field: CredentialField,
        len: usize,
        max: usize,
    },
    #[error("{field} is not valid utf-8")]
    InvalidUtf8 { field: CredentialField },
}

/// Access point hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bssid(pub [u8; 6]);

impl fmt::Display for Bssid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Station-mode network credential, bounded to the radio's fixed buffers.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    ssid: Ssid,
    secret: Secret,
    #[serde(default)]
    bssid: Option<Bssid>,
}

/// Credential bytes exactly as a provisioning exchange delivered them.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct RawCredential {
    pub ssid: Vec<u8>,
    pub secret: Vec<u8>,
    pub bssid: Option<[u8; 6]>,
}

/// A field that had to be cut to fit its buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Truncation {
    pub field: CredentialField,
    pub original_len: usize,
    pub kept_len: usize,
}

impl fmt::Display for Truncation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} truncated from {} to {} bytes",
            self.field, self.original_len, self.kept_len
        )
    }
}

/// Result of bounding a raw credential: the credential that will be used and
/// every field that lost bytes on the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedCredential {
    pub credential: Credential,
    pub truncations: Vec<Truncation>,
}

impl BoundedCredential {
    pub fn was_truncated(&self) -> bool {
        !self.truncations.is_empty()
    }
}

impl Credential {
    /// Strict constructor, rejects anything that would not fit.
    pub fn new(ssid: &str, secret: &str) -> Result<Self, CredentialError> {
        if ssid.is_empty() {
            return Err(CredentialError::EmptySsid);
        }

        let ssid = Ssid::try_from(ssid).map_err(|_| CredentialError::TooLong {
            field: CredentialField::Ssid,
            len: ssid.len(),
            max: SSID_MAX_LEN,
        })?;
        let secret = Secret::try_from(secret).map_err(|_| CredentialError::TooLong {
            field: CredentialField::Secret,
            len: secret.len(),
            max: SECRET_MAX_LEN,
        })?;

        Ok(Self {
            ssid,
            secret,
            bssid: None,
        })
    }

    pub fn with_bssid(mut self, bssid: Bssid) -> Self {
        self.bssid = Some(bssid);
        self
    }

    /// Bound a provisioning payload. Oversize fields are cut at the last
    /// character boundary that fits and reported; empty or non utf-8 fields
    /// make the payload unusable.
    pub fn from_raw(raw: &RawCredential) -> Result<BoundedCredential, CredentialError> {
        let ssid = std::str::from_utf8(&raw.ssid).map_err(|_| CredentialError::InvalidUtf8 {
            field: CredentialField::Ssid,
        })?;
        let secret =
            std::str::from_utf8(&raw.secret).map_err(|_| CredentialError::InvalidUtf8 {
                field: CredentialField::Secret,
            })?;

        if ssid.is_empty() {
            return Err(CredentialError::EmptySsid);
        }

        let mut truncations = Vec::new();
        let ssid_kept = fit(ssid, SSID_MAX_LEN);
        if ssid_kept.len() < ssid.len() {
            truncations.push(Truncation {
                field: CredentialField::Ssid,
                original_len: ssid.len(),
                kept_len: ssid_kept.len(),
            });
        }
        let secret_kept = fit(secret, SECRET_MAX_LEN);
        if secret_kept.len() < secret.len() {
            truncations.push(Truncation {
                field: CredentialField::Secret,
                original_len: secret.len(),
                kept_len: secret_kept.len(),
            });
        }

        let mut credential = Credential::new(ssid_kept, secret_kept)?;
        credential.bssid = raw.bssid.map(Bssid);

        Ok(BoundedCredential {
            credential,
            truncations,
        })
    }

    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn bssid(&self) -> Option<Bssid> {
        self.bssid
    }
}

// Longest prefix of `s` within `max` bytes that ends on a char boundary
fn fit(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// Secrets never reach the logs
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("ssid", &self.ssid.as_str())
            .field("secret", &"<redacted>")
            .field("bssid", &self.bssid)
            .finish()
    }
}

impl fmt::Debug for RawCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawCredential")
            .field("ssid", &String::from_utf8_lossy(&self.ssid))
            .field("secret_len", &self.secret.len())
            .field("bssid", &self.bssid)
            .finish()
    }
}
