//! Anonymous, memory-backed program images.

use std::ffi::CString;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;

use nix::fcntl::{fcntl, FcntlArg, SealFlag};
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use tracing::debug;

use crate::ImageError;

/// Something the launcher can exec.
///
/// This is the seam between [`crate::ProcessLauncher`] and the program it
/// runs, so tests can hand the launcher a plain executable on disk instead
/// of a memory image.
pub trait ProgramImage: Send + Sync + fmt::Debug {
    /// Path passed to `execve` in the child.
    fn exec_path(&self) -> PathBuf;

    /// Descriptor that must survive into the child's `execve`.
    fn inherited_fd(&self) -> Option<RawFd> {
        None
    }
}

/// A complete copy of an executable held in a sealed `memfd`.
///
/// The only handle kept is a read-only descriptor; the object has no name in
/// any directory and disappears when the handle is dropped.
pub struct AnonymousImage {
    file: File,
    len: u64,
    name: String,
}

impl AnonymousImage {
    /// Copy `payload` into a new anonymous memory object.
    ///
    /// `name` only shows up in `/proc/<pid>/fd` listings as `memfd:<name>`.
    /// The image is returned only once every byte is written and the object
    /// is sealed; on any failure all descriptors are closed.
    pub fn create(name: &str, payload: &[u8]) -> Result<Self, ImageError> {
        if payload.is_empty() {
            return Err(ImageError::EmptyPayload);
        }

        let c_name = CString::new(name.replace('\0', "")).unwrap_or_default();
        let fd = memfd_create(
            &c_name,
            MemFdCreateFlag::MFD_CLOEXEC | MemFdCreateFlag::MFD_ALLOW_SEALING,
        )
        .map_err(ImageError::Create)?;

        let mut writer = File::from(fd);
        writer.write_all(payload).map_err(ImageError::Write)?;

        let written = writer.metadata().map_err(ImageError::Write)?.len();
        let expected = payload.len() as u64;
        if written != expected {
            return Err(ImageError::ShortWrite { written, expected });
        }

        fcntl(
            writer.as_raw_fd(),
            FcntlArg::F_ADD_SEALS(
                SealFlag::F_SEAL_SHRINK
                    | SealFlag::F_SEAL_GROW
                    | SealFlag::F_SEAL_WRITE
                    | SealFlag::F_SEAL_SEAL,
            ),
        )
        .map_err(ImageError::Seal)?;

        // exec refuses a file with open writable descriptors (ETXTBSY).
        let file = OpenOptions::new()
            .read(true)
            .open(fd_path(writer.as_raw_fd()))
            .map_err(ImageError::Reopen)?;
        drop(writer);

        debug!(
            "Created anonymous image '{}' ({} bytes, fd {})",
            name,
            expected,
            file.as_raw_fd()
        );

        Ok(Self {
            file,
            len: expected,
            name: name.to_string(),
        })
    }

    /// Size of the image in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl AsRawFd for AnonymousImage {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl ProgramImage for AnonymousImage {
    fn exec_path(&self) -> PathBuf {
        fd_path(self.file.as_raw_fd())
    }

    fn inherited_fd(&self) -> Option<RawFd> {
        Some(self.file.as_raw_fd())
    }
}

impl fmt::Debug for AnonymousImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnonymousImage")
            .field("name", &self.name)
            .field("fd", &self.file.as_raw_fd())
            .field("len", &self.len)
            .finish()
    }
}

/// An executable that already has a path on disk.
#[derive(Debug, Clone)]
pub struct PathImage {
    path: PathBuf,
}

impl PathImage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ProgramImage for PathImage {
    fn exec_path(&self) -> PathBuf {
        self.path.clone()
    }
}

fn fd_path(fd: RawFd) -> PathBuf {
    PathBuf::from(format!("/proc/self/fd/{fd}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    const SCRIPT: &[u8] = b"#!/bin/sh\nexit 0\n";

    #[test]
    fn empty_payload_is_rejected() {
        let err = AnonymousImage::create("empty", b"").unwrap_err();
        assert!(matches!(err, ImageError::EmptyPayload));
    }

    #[test]
    fn image_holds_exact_payload() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(300_000).collect();
        let image = AnonymousImage::create("bytes", &payload).unwrap();
        assert_eq!(image.len(), payload.len() as u64);

        let mut copy = Vec::new();
        File::open(image.exec_path())
            .unwrap()
            .read_to_end(&mut copy)
            .unwrap();
        assert_eq!(copy, payload);
    }

    #[test]
    fn image_has_no_directory_path() {
        let image = AnonymousImage::create("crop", SCRIPT).unwrap();
        let path = image.exec_path();
        assert!(path.starts_with("/proc/self/fd"), "got: {}", path.display());
        assert_eq!(image.inherited_fd(), Some(image.as_raw_fd()));

        let target = std::fs::read_link(&path).unwrap();
        assert!(
            target.to_string_lossy().starts_with("/memfd:crop"),
            "got: {}",
            target.display()
        );
    }

    #[test]
    fn image_rejects_writes_after_creation() {
        let image = AnonymousImage::create("sealed", SCRIPT).unwrap();
        let result = OpenOptions::new()
            .write(true)
            .open(image.exec_path())
            .and_then(|mut f| f.write_all(b"tamper"));
        assert!(result.is_err());

        let mut copy = Vec::new();
        File::open(image.exec_path())
            .unwrap()
            .read_to_end(&mut copy)
            .unwrap();
        assert_eq!(copy, SCRIPT);
    }

    #[test]
    fn separate_images_get_separate_descriptors() {
        let a = AnonymousImage::create("a", SCRIPT).unwrap();
        let b = AnonymousImage::create("b", SCRIPT).unwrap();
        assert_ne!(a.as_raw_fd(), b.as_raw_fd());
        assert_ne!(a.exec_path(), b.exec_path());
    }

    #[test]
    fn path_image_execs_its_path() {
        let image = PathImage::new("/bin/sh");
        assert_eq!(image.exec_path(), PathBuf::from("/bin/sh"));
        assert_eq!(image.inherited_fd(), None);
    }
}
