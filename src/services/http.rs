//! HTTP firmware transport
//!
//! Images start with a fixed header followed by the raw firmware body:
//!
//! | offset | len | field                          |
//! |--------|-----|--------------------------------|
//! | 0      | 4   | magic `LKFW`                   |
//! | 4      | 32  | version string, NUL padded     |
//! | 36     | 4   | body size, little endian       |
//! | 40     | 4   | CRC-32 of the body, little end |

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::*;
use thiserror::Error;

use super::{
    update::{FirmwareFetch, ImageDescriptor, UpdateTransport},
    version::Version,
};

pub const IMAGE_MAGIC: [u8; 4] = *b"LKFW";
pub const VERSION_FIELD_LEN: usize = 32;
pub const HEADER_LEN: usize = 4 + VERSION_FIELD_LEN + 4 + 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageHeaderError {
    #[error("image header truncated at {0} bytes")]
    Short(usize),
    #[error("bad image magic {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("unreadable image version {0:?}")]
    BadVersion(String),
}

pub fn parse_image_header(bytes: &[u8]) -> Result<ImageDescriptor, ImageHeaderError> {
    if bytes.len() < HEADER_LEN {
        return Err(ImageHeaderError::Short(bytes.len()));
    }

    let mut magic = [0u8; 4];
    magic.copy_from_slice(&bytes[0..4]);
    if magic != IMAGE_MAGIC {
        return Err(ImageHeaderError::BadMagic(magic));
    }

    let version_field = &bytes[4..4 + VERSION_FIELD_LEN];
    let version_text = String::from_utf8_lossy(version_field);
    let version = Version::parse(&version_text).map_err(|_| {
        ImageHeaderError::BadVersion(version_text.trim_end_matches('\0').to_string())
    })?;

    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[36..40]);
    let size = u32::from_le_bytes(word);
    word.copy_from_slice(&bytes[40..44]);
    let crc32 = u32::from_le_bytes(word);

    Ok(ImageDescriptor {
        version,
        size,
        crc32,
    })
}

pub fn encode_image_header(image: &ImageDescriptor) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&IMAGE_MAGIC);

    let version = image.version.to_string();
    let len = version.len().min(VERSION_FIELD_LEN);
    header[4..4 + len].copy_from_slice(&version.as_bytes()[..len]);

    header[36..40].copy_from_slice(&image.size.to_le_bytes());
    header[40..44].copy_from_slice(&image.crc32.to_le_bytes());
    header
}

pub struct HttpUpdateTransport {
    client: reqwest::Client,
}

impl HttpUpdateTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpUpdateTransport {
    fn default() -> Self {
        Self::new()
    }
}

struct HttpFetch {
    response: reqwest::Response,
    descriptor: ImageDescriptor,
    // Body bytes that arrived in the same chunk as the header
    pending: Option<Vec<u8>>,
}

#[async_trait]
impl UpdateTransport for HttpUpdateTransport {
    async fn begin_fetch(&self, url: &str) -> Result<Box<dyn FirmwareFetch>> {
        info!("update: fetching {}", url);
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("request to {} failed", url))?
            .error_for_status()?;

        let mut head = Vec::with_capacity(HEADER_LEN);
        while head.len() < HEADER_LEN {
            match response.chunk().await.context("failed reading image header")? {
                Some(chunk) => head.extend_from_slice(&chunk),
                None => break,
            }
        }

        let descriptor = parse_image_header(&head)?;
        let rest = head.split_off(HEADER_LEN);
        debug!(
            "update: image {} is {} bytes, crc {:08x}",
            descriptor.version, descriptor.size, descriptor.crc32
        );

        Ok(Box::new(HttpFetch {
            response,
            descriptor,
            pending: (!rest.is_empty()).then_some(rest),
        }))
    }
}

#[async_trait]
impl FirmwareFetch for HttpFetch {
    fn descriptor(&self) -> &ImageDescriptor {
        &self.descriptor
    }

    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(pending) = self.pending.take() {
            return Ok(Some(pending));
        }
        let chunk = self
            .response
            .chunk()
            .await
            .context("failed reading image body")?;
        Ok(chunk.map(|bytes| bytes.to_vec()))
    }
}
