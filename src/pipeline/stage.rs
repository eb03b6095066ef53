//! Per-request staging files.
//!
//! Each job owns two paths in the work directory, derived from one fresh
//! identifier: `temp-<id>.pdf` (the fetched document) and
//! `output_image-<id>.png` (where the converter writes). [`StagedFiles`]
//! holds both as [`TempPath`]s and deletes them when cleaned up or dropped,
//! so early returns, timeouts and cancelled requests all leave the
//! directory as they found it.
//!
//! A process killed between staging and cleanup leaves its files behind;
//! [`prepare_work_dir`] sweeps those at the next startup.

use crate::error::CropError;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const INPUT_PREFIX: &str = "temp-";
pub const INPUT_SUFFIX: &str = ".pdf";
pub const OUTPUT_PREFIX: &str = "output_image-";
pub const OUTPUT_SUFFIX: &str = ".png";

/// Source of staging identifiers.
///
/// Identifiers must be unique across concurrent jobs; a collision is
/// caught at staging time and fails the later job.
pub trait IdSource: Send + Sync {
    fn next_id(&self) -> String;
}

/// Random v4 UUIDs.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdSource;

impl IdSource for UuidIdSource {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Input and output paths for `id` inside `dir`.
pub fn staged_paths(dir: &Path, id: &str) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{INPUT_PREFIX}{id}{INPUT_SUFFIX}")),
        dir.join(format!("{OUTPUT_PREFIX}{id}{OUTPUT_SUFFIX}")),
    )
}

/// The input/output pair of one job, removed on cleanup or drop.
#[derive(Debug)]
pub struct StagedFiles {
    input: TempPath,
    output: TempPath,
}

impl StagedFiles {
    /// Write `bytes` to a freshly created input file for `id`.
    ///
    /// The input is created exclusively: if another job already holds the
    /// name this fails without touching that job's files. A stale file at
    /// the output path is removed so that only this job's converter run can
    /// produce it.
    pub async fn stage(dir: &Path, id: &str, bytes: &[u8]) -> Result<Self, CropError> {
        let (input_path, output_path) = staged_paths(dir, id);
        if !is_single_component(id) {
            return Err(CropError::Stage {
                path: input_path,
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("staging id {id:?} is not a plain file name"),
                ),
            });
        }

        let prefix = format!("{INPUT_PREFIX}{id}");
        let (file, input) = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(INPUT_SUFFIX)
            .rand_bytes(0)
            .tempfile_in(dir)
            .map_err(|source| CropError::Stage {
                path: input_path.clone(),
                source,
            })?
            .into_parts();

        // `input` owns the file from here on; an early return removes it.
        let mut file = tokio::fs::File::from_std(file);
        let written = async {
            file.write_all(bytes).await?;
            file.flush().await
        }
        .await;
        drop(file);
        if let Err(source) = written {
            return Err(CropError::Stage {
                path: input_path,
                source,
            });
        }

        match tokio::fs::remove_file(&output_path).await {
            Ok(()) => warn!("Removed stale output {}", output_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(CropError::Stage {
                    path: output_path,
                    source,
                })
            }
        }

        Ok(Self {
            input,
            output: TempPath::from_path(output_path),
        })
    }

    pub fn input(&self) -> &Path {
        &self.input
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Delete both files. Failures are logged, never returned.
    ///
    /// Dropping `StagedFiles` without calling this still removes both
    /// files, synchronously and silently.
    pub async fn cleanup(self) {
        let Self { input, output } = self;
        let removed = tokio::task::spawn_blocking(move || {
            for path in [input, output] {
                let shown = path.to_path_buf();
                match path.close() {
                    Ok(()) => debug!("Removed {}", shown.display()),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => warn!("Failed to remove {}: {}", shown.display(), e),
                }
            }
        })
        .await;
        if let Err(e) = removed {
            warn!("Staging cleanup task failed: {}", e);
        }
    }
}

fn is_single_component(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains(['/', '\0'])
}

/// Create the work directory and delete files left by a killed process.
///
/// Returns the number of stale files removed.
pub fn prepare_work_dir(dir: &Path) -> Result<usize, CropError> {
    let stage_err = |source| CropError::Stage {
        path: dir.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(dir).map_err(stage_err)?;
    let removed = sweep_stale(dir).map_err(stage_err)?;
    if removed > 0 {
        info!("Removed {} stale staging files from {}", removed, dir.display());
    }
    Ok(removed)
}

/// Delete every staging-named file in `dir`.
///
/// Only safe while no job is running against `dir`.
pub fn sweep_stale(dir: &Path) -> io::Result<usize> {
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let staged = (name.starts_with(INPUT_PREFIX) && name.ends_with(INPUT_SUFFIX))
            || (name.starts_with(OUTPUT_PREFIX) && name.ends_with(OUTPUT_SUFFIX));
        if !staged || !entry.file_type()?.is_file() {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", entry.path().display(), e),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    #[test]
    fn paths_follow_naming_scheme() {
        let (input, output) = staged_paths(Path::new("/work"), "abc");
        assert_eq!(input, PathBuf::from("/work/temp-abc.pdf"));
        assert_eq!(output, PathBuf::from("/work/output_image-abc.png"));
    }

    #[test]
    fn uuid_ids_do_not_repeat() {
        let ids: HashSet<String> = (0..1000).map(|_| UuidIdSource.next_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[tokio::test]
    async fn stage_writes_input_and_cleanup_removes_both() {
        let dir = TempDir::new().unwrap();
        let staged = StagedFiles::stage(dir.path(), "job1", b"%PDF-1.7").await.unwrap();
        assert_eq!(staged.input(), dir.path().join("temp-job1.pdf"));
        assert_eq!(std::fs::read(staged.input()).unwrap(), b"%PDF-1.7");

        std::fs::write(staged.output(), b"png").unwrap();
        let (input, output) = (staged.input().to_path_buf(), staged.output().to_path_buf());
        staged.cleanup().await;
        assert!(!input.exists());
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn cleanup_tolerates_missing_output() {
        let dir = TempDir::new().unwrap();
        let staged = StagedFiles::stage(dir.path(), "no-output", b"doc").await.unwrap();
        assert!(!staged.output().exists());

        staged.cleanup().await;
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn drop_removes_files() {
        let dir = TempDir::new().unwrap();
        let (input, output) = {
            let staged = StagedFiles::stage(dir.path(), "job2", b"data").await.unwrap();
            std::fs::write(staged.output(), b"png").unwrap();
            (staged.input().to_path_buf(), staged.output().to_path_buf())
        };
        assert!(!input.exists());
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn colliding_id_fails_without_touching_owner() {
        let dir = TempDir::new().unwrap();
        let owner = StagedFiles::stage(dir.path(), "same", b"first").await.unwrap();

        let err = StagedFiles::stage(dir.path(), "same", b"second")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "stage");
        assert_eq!(std::fs::read(owner.input()).unwrap(), b"first");
    }

    #[tokio::test]
    async fn stale_output_is_removed_at_stage_time() {
        let dir = TempDir::new().unwrap();
        let (_, output) = staged_paths(dir.path(), "old");
        std::fs::write(&output, b"stale image").unwrap();

        let staged = StagedFiles::stage(dir.path(), "old", b"doc").await.unwrap();
        assert!(!staged.output().exists());
    }

    #[tokio::test]
    async fn path_like_ids_are_rejected() {
        let dir = TempDir::new().unwrap();
        for id in ["", "..", "a/b", "../escape"] {
            let err = StagedFiles::stage(dir.path(), id, b"doc").await.unwrap_err();
            assert!(matches!(err, CropError::Stage { .. }), "{id:?}: {err}");
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn missing_work_dir_is_a_stage_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("gone");
        let err = StagedFiles::stage(&missing, "x", b"doc").await.unwrap_err();
        assert!(matches!(err, CropError::Stage { .. }));
    }

    #[test]
    fn sweep_removes_only_staging_files() {
        let dir = TempDir::new().unwrap();
        for name in [
            "temp-1.pdf",
            "output_image-1.png",
            "output_image-2.png",
            "keep.pdf",
            "temp-notes.txt",
        ] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("temp-dir.pdf")).unwrap();

        assert_eq!(sweep_stale(dir.path()).unwrap(), 3);
        let mut left: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, ["keep.pdf", "temp-dir.pdf", "temp-notes.txt"]);
    }

    #[test]
    fn prepare_creates_missing_dir() {
        let dir = TempDir::new().unwrap();
        let work = dir.path().join("nested/work");
        assert_eq!(prepare_work_dir(&work).unwrap(), 0);
        assert!(work.is_dir());
    }
}
