//! FPGA bitstream image loading and change detection.
//!
//! The loader keeps the last good image in memory and polls the backing
//! file's modification time so an external rebuild is picked up on the next
//! flash check. Load failures never discard the previous image; they arm a
//! retry that the next [`BitstreamLoader::check_for_update`] honours.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// How far into the raw image the payload marker may complete.
pub const HEADER_SCAN_LIMIT: usize = 256;

/// Length of the 0xFF run that marks the start of the payload.
pub const PAYLOAD_MARKER_RUN: usize = 16;

#[derive(Debug, Error)]
pub enum BitstreamError {
    #[error("failed to read bitstream {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The active flash payload and the metadata it was loaded with.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BitstreamImage {
    /// Header-stripped bytes, exactly as they should appear in flash.
    pub payload: Vec<u8>,
    pub modified: Option<SystemTime>,
    /// SHA-256 of the raw file contents.
    pub digest: [u8; 32],
    pub raw_len: usize,
}

impl BitstreamImage {
    /// Builds an image from raw file bytes.
    #[must_use]
    pub fn from_raw(raw: &[u8], modified: Option<SystemTime>) -> Self {
        Self {
            payload: fix_bitstream(raw).to_vec(),
            modified,
            digest: Sha256::digest(raw).into(),
            raw_len: raw.len(),
        }
    }

    /// Lowercase hex rendering of [`BitstreamImage::digest`].
    #[must_use]
    pub fn digest_hex(&self) -> String {
        let mut out = String::with_capacity(self.digest.len() * 2);
        for byte in self.digest {
            let _ = write!(out, "{byte:02x}");
        }
        out
    }
}

/// Loads and hot-reloads a bitstream file.
pub struct BitstreamLoader {
    path: PathBuf,
    image: Option<BitstreamImage>,
    retry: bool,
}

impl BitstreamLoader {
    /// Creates a loader and attempts the first load immediately. A failed
    /// first load is logged and retried on the next update check.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let mut loader = Self {
            path: path.into(),
            image: None,
            retry: false,
        };
        let _ = loader.load();
        loader
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn image(&self) -> Option<&BitstreamImage> {
        self.image.as_ref()
    }

    /// Active payload, if an image has ever loaded.
    #[must_use]
    pub fn payload(&self) -> Option<&[u8]> {
        self.image.as_ref().map(|image| image.payload.as_slice())
    }

    #[must_use]
    pub fn retry_pending(&self) -> bool {
        self.retry
    }

    /// Reads the file and replaces the active image.
    ///
    /// # Errors
    ///
    /// Returns [`BitstreamError::Read`] when the file cannot be read. The
    /// previous image stays active and a retry is armed.
    pub fn load(&mut self) -> Result<(), BitstreamError> {
        match self.read() {
            Ok(image) => {
                info!(
                    "loaded bitstream {} ({} bytes, {} after header strip) mtime={} sha256={}",
                    self.path.display(),
                    image.raw_len,
                    image.payload.len(),
                    image.modified.map_or_else(|| "?".to_string(), |t| unix_seconds(t).to_string()),
                    image.digest_hex(),
                );
                self.image = Some(image);
                self.retry = false;
                Ok(())
            }
            Err(err) => {
                warn!("{err}; will retry");
                self.retry = true;
                Err(err)
            }
        }
    }

    /// Reloads when a retry is pending or the file's mtime changed.
    /// Returns `true` when a new image became active.
    pub fn check_for_update(&mut self) -> bool {
        if self.retry {
            return self.load().is_ok();
        }

        let modified = match fs::metadata(&self.path).and_then(|meta| meta.modified()) {
            Ok(modified) => modified,
            Err(err) => {
                warn!("cannot stat bitstream {}: {err}; will retry", self.path.display());
                self.retry = true;
                return false;
            }
        };

        let recorded = self.image.as_ref().and_then(|image| image.modified);
        if recorded == Some(modified) {
            return false;
        }
        info!("bitstream {} changed on disk, reloading", self.path.display());
        self.load().is_ok()
    }

    fn read(&self) -> Result<BitstreamImage, BitstreamError> {
        let read_err = |source| BitstreamError::Read {
            path: self.path.clone(),
            source,
        };
        let raw = fs::read(&self.path).map_err(read_err)?;
        let modified = fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .ok();
        Ok(BitstreamImage::from_raw(&raw, modified))
    }
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

/// Strips tool-generated metadata ahead of the payload.
///
/// Some images carry a tracking header before a run of sixteen 0xFF bytes
/// that marks the real start of the configuration data. When such a run
/// completes within the first 256 bytes, the slice from its first 0xFF is
/// returned. Shorter inputs and inputs without the marker come back
/// unchanged. This is a heuristic, not a format parser.
#[must_use]
pub fn fix_bitstream(raw: &[u8]) -> &[u8] {
    if raw.len() < HEADER_SCAN_LIMIT {
        return raw;
    }

    let mut run = 0;
    for (offset, &byte) in raw[..HEADER_SCAN_LIMIT].iter().enumerate() {
        if byte == 0xFF {
            run += 1;
            if run == PAYLOAD_MARKER_RUN {
                return &raw[offset + 1 - PAYLOAD_MARKER_RUN..];
            }
        } else {
            run = 0;
        }
    }
    raw
}
