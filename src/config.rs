//! Service configuration.
//!
//! Every knob lives in [`ServiceConfig`], built through
//! [`ServiceConfigBuilder`]. The binary fills it from CLI flags and
//! environment variables; tests build it directly.

use crate::error::CropError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the crop service and its gateway.
///
/// # Example
/// ```rust
/// use pdf_crop_gateway::ServiceConfig;
///
/// let config = ServiceConfig::builder()
///     .max_concurrent_jobs(4)
///     .convert_timeout_secs(30)
///     .allow_origin("https://viewer.example.com")
///     .build()
///     .unwrap();
/// assert_eq!(config.max_concurrent_jobs, 4);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Directory holding the per-request staging files.
    /// Default: `$TMPDIR/pdf-crop`.
    pub work_dir: PathBuf,

    /// Value of `Access-Control-Allow-Origin` on `/fetch`. Default: `http://localhost:9000`.
    pub allow_origin: String,

    /// Directory of static viewer assets served as fallback. Default: none.
    pub static_dir: Option<PathBuf>,

    /// Maximum conversions running at once. Default: 8.
    ///
    /// Each job holds one child process and two files, so this bounds
    /// process-table and descriptor use under load.
    pub max_concurrent_jobs: usize,

    /// How long a request may wait for a free slot before it is rejected. Default: 30.
    pub queue_timeout_secs: u64,

    /// Timeout for downloading the source document. Default: 60.
    pub fetch_timeout_secs: u64,

    /// Timeout for one converter run; the child is killed after it. Default: 120.
    pub convert_timeout_secs: u64,

    /// End-to-end limit for fetch, staging, conversion and harvest. Default: 180.
    pub request_timeout_secs: u64,

    /// Largest accepted source document in bytes. Default: 50 MiB.
    pub max_document_bytes: u64,

    /// `argv[0]` given to the converter. Default: `crop`.
    pub converter_name: String,

    /// Runtime libraries the converter needs (exported as `LD_LIBRARY_PATH`). Default: none.
    pub converter_lib_dir: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("pdf-crop"),
            allow_origin: "http://localhost:9000".to_string(),
            static_dir: None,
            max_concurrent_jobs: 8,
            queue_timeout_secs: 30,
            fetch_timeout_secs: 60,
            convert_timeout_secs: 120,
            request_timeout_secs: 180,
            max_document_bytes: 50 * 1024 * 1024,
            converter_name: "crop".to_string(),
            converter_lib_dir: None,
        }
    }
}

impl ServiceConfig {
    /// Create a new builder for `ServiceConfig`.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn convert_timeout(&self) -> Duration {
        Duration::from_secs(self.convert_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Builder for [`ServiceConfig`].
#[derive(Debug)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.work_dir = dir.into();
        self
    }

    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.config.allow_origin = origin.into();
        self
    }

    pub fn static_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.static_dir = Some(dir.into());
        self
    }

    pub fn max_concurrent_jobs(mut self, n: usize) -> Self {
        self.config.max_concurrent_jobs = n.max(1);
        self
    }

    pub fn queue_timeout_secs(mut self, secs: u64) -> Self {
        self.config.queue_timeout_secs = secs;
        self
    }

    pub fn fetch_timeout_secs(mut self, secs: u64) -> Self {
        self.config.fetch_timeout_secs = secs;
        self
    }

    pub fn convert_timeout_secs(mut self, secs: u64) -> Self {
        self.config.convert_timeout_secs = secs;
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs;
        self
    }

    pub fn max_document_bytes(mut self, bytes: u64) -> Self {
        self.config.max_document_bytes = bytes;
        self
    }

    pub fn converter_name(mut self, name: impl Into<String>) -> Self {
        self.config.converter_name = name.into();
        self
    }

    pub fn converter_lib_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.converter_lib_dir = Some(dir.into());
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ServiceConfig, CropError> {
        let c = &self.config;
        if c.max_concurrent_jobs == 0 {
            return Err(CropError::InvalidConfig(
                "max_concurrent_jobs must be ≥ 1".into(),
            ));
        }
        for (name, secs) in [
            ("fetch_timeout_secs", c.fetch_timeout_secs),
            ("convert_timeout_secs", c.convert_timeout_secs),
            ("request_timeout_secs", c.request_timeout_secs),
        ] {
            if secs == 0 {
                return Err(CropError::InvalidConfig(format!("{name} must be ≥ 1")));
            }
        }
        if c.max_document_bytes == 0 {
            return Err(CropError::InvalidConfig(
                "max_document_bytes must be ≥ 1".into(),
            ));
        }
        if c.allow_origin.is_empty()
            || axum::http::HeaderValue::from_str(&c.allow_origin).is_err()
        {
            return Err(CropError::InvalidConfig(format!(
                "allow_origin is not a valid header value: {:?}",
                c.allow_origin
            )));
        }
        if c.converter_name.is_empty() {
            return Err(CropError::InvalidConfig(
                "converter_name must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}
