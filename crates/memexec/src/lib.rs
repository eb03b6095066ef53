//! # memexec
//!
//! Run a trusted executable that ships *inside* the service binary, without
//! ever writing it to a path in a visible directory.
//!
//! ## How it works
//!
//! 1. At build time (feature `bundled`) `build.rs` embeds the converter
//!    executable named by `CONVERTER_BUNDLE_BIN`. Without the feature the
//!    bytes are loaded once from a file at startup ([`Payload::from_file`]).
//! 2. [`AnonymousImage::create`] copies the bytes into a sealed,
//!    kernel-backed anonymous memory object (`memfd_create`) and keeps a
//!    read-only descriptor to it.
//! 3. [`ProcessLauncher::launch`] forks a child which execs
//!    `/proc/self/fd/N`. The serving process never replaces its own image.
//!
//! The image is created once and shared read-only by every concurrent
//! launch; no locking is needed after creation.
//!
//! ```rust,no_run
//! use memexec::{AnonymousImage, ProcessLauncher, Payload};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let payload = Payload::from_file("./crop")?;
//! let image = AnonymousImage::create("crop", payload.as_bytes())?;
//! let launcher = ProcessLauncher::new(Arc::new(image))
//!     .program_name("crop")
//!     .timeout(Duration::from_secs(30));
//!
//! let outcome = launcher.launch(["in.pdf", "out.png"]).await;
//! assert!(outcome.is_success());
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform support
//!
//! Linux only: anonymous images rely on `memfd_create(2)`, file seals and
//! the `/proc/self/fd` magic links.

use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

mod image;
mod launcher;

pub use image::{AnonymousImage, PathImage, ProgramImage};
pub use launcher::{ExitOutcome, ProcessLauncher, DEFAULT_PROGRAM_NAME};

// ── Error type ───────────────────────────────────────────────────────────────

/// Errors raised while loading a payload or building an anonymous image.
///
/// Every variant is fatal for the image being built: no partially written
/// image is ever handed out.
#[derive(Error, Debug)]
pub enum ImageError {
    /// There is nothing to execute.
    #[error("Converter payload is empty")]
    EmptyPayload,

    /// The payload file could not be read at startup.
    #[error("Failed to read converter payload from '{path}': {source}")]
    PayloadRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `memfd_create` failed (descriptor or memory exhaustion, old kernel).
    #[error("Failed to create anonymous memory image: {0}")]
    Create(#[source] nix::Error),

    /// Writing the payload into the memory object failed.
    #[error("Failed to write payload into memory image: {0}")]
    Write(#[source] std::io::Error),

    /// The memory object ended up with a different size than the payload.
    #[error("Memory image holds {written} bytes, expected {expected}")]
    ShortWrite { written: u64, expected: u64 },

    /// Sealing the memory object against modification failed.
    #[error("Failed to seal memory image: {0}")]
    Seal(#[source] nix::Error),

    /// The sealed image could not be reopened read-only.
    #[error("Failed to reopen memory image read-only: {0}")]
    Reopen(#[source] std::io::Error),
}

// ── Payload ──────────────────────────────────────────────────────────────────

/// Immutable executable bytes, loaded once per process.
#[derive(Clone)]
pub struct Payload {
    bytes: Cow<'static, [u8]>,
}

impl Payload {
    /// Wrap bytes that live for the whole process (e.g. `include_bytes!`).
    pub fn from_static(bytes: &'static [u8]) -> Self {
        Self {
            bytes: Cow::Borrowed(bytes),
        }
    }

    /// Take ownership of bytes produced at runtime.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Cow::Owned(bytes),
        }
    }

    /// Read the payload from an executable on disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ImageError> {
        let path = path.as_ref();
        std::fs::read(path)
            .map(Self::from_vec)
            .map_err(|source| ImageError::PayloadRead {
                path: path.to_path_buf(),
                source,
            })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload").field("len", &self.len()).finish()
    }
}

// ── Bundled converter ────────────────────────────────────────────────────────

#[cfg(feature = "bundled")]
mod bundled {
    include!(concat!(env!("OUT_DIR"), "/bundled.rs"));
}

/// The converter embedded at compile time, if built with `bundled`.
#[cfg(feature = "bundled")]
pub fn bundled_payload() -> Option<Payload> {
    Some(Payload::from_static(bundled::CONVERTER_BYTES))
}

/// The converter embedded at compile time, if built with `bundled`.
#[cfg(not(feature = "bundled"))]
pub fn bundled_payload() -> Option<Payload> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn payload_from_file_reads_all_bytes() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"#!/bin/sh\nexit 0\n").unwrap();

        let payload = Payload::from_file(f.path()).unwrap();
        assert_eq!(payload.as_bytes(), b"#!/bin/sh\nexit 0\n");
        assert_eq!(payload.len(), 17);
    }

    #[test]
    fn payload_from_missing_file_reports_path() {
        let err = Payload::from_file("/definitely/not/here/crop").unwrap_err();
        assert!(matches!(err, ImageError::PayloadRead { .. }));
        assert!(err.to_string().contains("/definitely/not/here/crop"));
    }

    #[test]
    fn payload_debug_hides_bytes() {
        let p = Payload::from_static(b"secret-bytes");
        let dbg = format!("{p:?}");
        assert!(dbg.contains("len: 12"), "got: {dbg}");
        assert!(!dbg.contains("secret"));
    }

    #[cfg(not(feature = "bundled"))]
    #[test]
    fn no_bundled_payload_without_feature() {
        assert!(bundled_payload().is_none());
    }
}
