//! One conversion, end to end: fetch → stage → execute → harvest → cleanup.
//!
//! [`CropService`] holds what requests share: the launcher (and through it
//! the read-only converter image), the fetcher, the id source and the
//! admission semaphore. Each request gets its own [`ConversionJob`], its own
//! staging files and its own child process.
//!
//! ## Admission
//!
//! At most `max_concurrent_jobs` jobs run at once. A request waits up to
//! `queue_timeout` for a slot and is then rejected with
//! [`CropError::Busy`]. Once admitted, the job runs under
//! `request_timeout`; a job cut off by it is dropped, which kills the child
//! and removes the staging files.

use crate::config::ServiceConfig;
use crate::error::CropError;
use crate::pipeline::fetch::{Fetcher, HttpFetcher};
use crate::pipeline::stage::{IdSource, StagedFiles, UuidIdSource};
use memexec::{ExitOutcome, ProcessLauncher, ProgramImage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// The source document of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    pub url: String,
}

impl ConversionRequest {
    pub fn new(url: impl Into<String>) -> Self {
        let url: String = url.into();
        Self {
            url: url.trim().to_string(),
        }
    }
}

/// Image bytes, or the first failure of the job. All or nothing.
pub type ConversionResult = Result<Vec<u8>, CropError>;

/// Build the converter launcher described by `config`.
pub fn build_launcher(config: &ServiceConfig, image: Arc<dyn ProgramImage>) -> ProcessLauncher {
    let launcher = ProcessLauncher::new(image)
        .program_name(&config.converter_name)
        .timeout(config.convert_timeout());
    match &config.converter_lib_dir {
        Some(dir) => launcher.env("LD_LIBRARY_PATH", dir),
        None => launcher,
    }
}

/// Shared state behind every conversion request.
pub struct CropService {
    launcher: ProcessLauncher,
    fetcher: Arc<dyn Fetcher>,
    ids: Arc<dyn IdSource>,
    work_dir: PathBuf,
    permits: Semaphore,
    capacity: usize,
    queue_timeout: Duration,
    request_timeout: Duration,
}

impl CropService {
    /// Create a service that fetches over HTTP and names files with UUIDs.
    ///
    /// The work directory must already exist (see
    /// [`crate::pipeline::stage::prepare_work_dir`]).
    pub fn new(config: &ServiceConfig, launcher: ProcessLauncher) -> Result<Self, CropError> {
        let fetcher = HttpFetcher::from_config(config)?;
        Ok(Self {
            launcher,
            fetcher: Arc::new(fetcher),
            ids: Arc::new(UuidIdSource),
            work_dir: config.work_dir.clone(),
            permits: Semaphore::new(config.max_concurrent_jobs),
            capacity: config.max_concurrent_jobs,
            queue_timeout: config.queue_timeout(),
            request_timeout: config.request_timeout(),
        })
    }

    /// Replace the document source.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Replace the staging id source.
    pub fn with_id_source(mut self, ids: Arc<dyn IdSource>) -> Self {
        self.ids = ids;
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Jobs currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.permits.available_permits())
    }

    /// Run one request through admission and the full pipeline.
    pub async fn convert(&self, request: ConversionRequest) -> ConversionResult {
        let queued = Instant::now();
        let _permit = match tokio::time::timeout(self.queue_timeout, self.permits.acquire()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => {
                warn!(
                    "Rejecting {}: {} jobs in flight",
                    request.url, self.capacity
                );
                return Err(CropError::Busy {
                    capacity: self.capacity,
                    waited_ms: queued.elapsed().as_millis() as u64,
                });
            }
        };

        let job = ConversionJob::new(self, request);
        match tokio::time::timeout(self.request_timeout, job.run()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Request abandoned after {}s",
                    self.request_timeout.as_secs()
                );
                Err(CropError::RequestTimeout {
                    secs: self.request_timeout.as_secs(),
                })
            }
        }
    }
}

/// A single request's trip through the pipeline.
pub struct ConversionJob<'a> {
    service: &'a CropService,
    request: ConversionRequest,
}

impl<'a> ConversionJob<'a> {
    /// Run the job outside admission control.
    pub fn new(service: &'a CropService, request: ConversionRequest) -> Self {
        Self { service, request }
    }

    pub async fn run(self) -> ConversionResult {
        let started = Instant::now();
        let url = &self.request.url;
        info!("Starting conversion: {}", url);

        // ── Step 1: Fetch ────────────────────────────────────────────────
        // Nothing is on disk yet, so a failure here needs no cleanup.
        let document = self.service.fetcher.fetch(url).await?;

        // ── Step 2: Stage ────────────────────────────────────────────────
        let id = self.service.ids.next_id();
        let staged = StagedFiles::stage(&self.service.work_dir, &id, &document).await?;
        debug!(
            "Staged {} bytes at {}",
            document.len(),
            staged.input().display()
        );
        drop(document);

        // ── Steps 3-5: Execute and harvest ───────────────────────────────
        let result = self.execute(&staged).await;

        // ── Step 6: Cleanup, whatever happened ───────────────────────────
        staged.cleanup().await;

        match &result {
            Ok(image) => info!(
                "Conversion complete: {} bytes in {}ms",
                image.len(),
                started.elapsed().as_millis()
            ),
            Err(e) => debug!("Conversion of {} failed ({}): {}", url, e.kind(), e),
        }
        result
    }

    async fn execute(&self, staged: &StagedFiles) -> ConversionResult {
        let outcome = self
            .service
            .launcher
            .launch([staged.input(), staged.output()])
            .await;

        match outcome {
            ExitOutcome::Success => harvest(staged.output()).await,
            ExitOutcome::Failed {
                code,
                signal,
                stderr,
            } => {
                let status = match (code, signal) {
                    (Some(code), _) => format!("exit status {code}"),
                    (None, Some(signal)) => format!("killed by signal {signal}"),
                    (None, None) => "unknown exit status".to_string(),
                };
                let detail = if stderr.is_empty() {
                    status
                } else {
                    format!("{status}: {stderr}")
                };
                Err(CropError::Conversion { detail })
            }
            ExitOutcome::LaunchFailed(e) => Err(CropError::Conversion {
                detail: format!("could not run converter: {e}"),
            }),
            ExitOutcome::TimedOut(limit) => Err(CropError::ConversionTimeout {
                ms: limit.as_millis() as u64,
            }),
        }
    }
}

/// Read the converter's output. A clean exit is not proof of output.
async fn harvest(output: &Path) -> ConversionResult {
    match tokio::fs::read(output).await {
        Ok(bytes) if bytes.is_empty() => Err(CropError::OutputMissing {
            path: output.to_path_buf(),
            reason: "file is empty".into(),
        }),
        Ok(bytes) => Ok(bytes),
        Err(e) => Err(CropError::OutputMissing {
            path: output.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memexec::PathImage;
    use tempfile::TempDir;

    fn service(dir: &Path) -> CropService {
        let config = ServiceConfig::builder()
            .work_dir(dir)
            .max_concurrent_jobs(3)
            .build()
            .unwrap();
        let launcher = build_launcher(&config, Arc::new(PathImage::new("/bin/true")));
        CropService::new(&config, launcher).unwrap()
    }

    #[test]
    fn request_url_is_trimmed() {
        let r = ConversionRequest::new(" https://example.test/doc.pdf \n");
        assert_eq!(r.url, "https://example.test/doc.pdf");
    }

    #[tokio::test]
    async fn idle_service_reports_capacity() {
        let dir = TempDir::new().unwrap();
        let service = service(dir.path());
        assert_eq!(service.capacity(), 3);
        assert_eq!(service.in_flight(), 0);
        assert_eq!(service.work_dir(), dir.path());
    }

    #[tokio::test]
    async fn harvest_rejects_missing_and_empty_output() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("output_image-x.png");

        let err = harvest(&path).await.unwrap_err();
        assert!(matches!(err, CropError::OutputMissing { .. }));

        std::fs::write(&path, b"").unwrap();
        let err = harvest(&path).await.unwrap_err();
        assert!(err.to_string().contains("empty"), "got: {err}");

        std::fs::write(&path, b"\x89PNG").unwrap();
        assert_eq!(harvest(&path).await.unwrap(), b"\x89PNG");
    }

    #[tokio::test]
    async fn invalid_url_never_stages() {
        let dir = TempDir::new().unwrap();
        let service = service(dir.path());
        let err = service
            .convert(ConversionRequest::new("not-a-url"))
            .await
            .unwrap_err();
        assert!(matches!(err, CropError::InvalidUrl { .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn job_runs_without_taking_a_slot() {
        let dir = TempDir::new().unwrap();
        let service = service(dir.path());
        let job = ConversionJob::new(&service, ConversionRequest::new("ftp://example.test/a"));
        let err = job.run().await.unwrap_err();
        assert!(matches!(err, CropError::InvalidUrl { .. }));
        assert_eq!(service.in_flight(), 0);
    }

    #[test]
    fn launcher_exports_library_dir() {
        let config = ServiceConfig::builder()
            .converter_lib_dir("/opt/poppler/lib")
            .build()
            .unwrap();
        let launcher = build_launcher(&config, Arc::new(PathImage::new("/bin/true")));
        let dbg = format!("{launcher:?}");
        assert!(dbg.contains("LD_LIBRARY_PATH"), "got: {dbg}");
        assert!(dbg.contains("/opt/poppler/lib"));
    }
}
