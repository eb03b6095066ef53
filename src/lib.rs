//! # pdf-crop-gateway
//!
//! An HTTP service that turns a PDF URL into a cropped image.
//!
//! A client POSTs a URL; the service downloads the document, stages it in a
//! uniquely named temp file, runs an embedded converter executable on it and
//! answers with the image the converter wrote. The converter lives only in
//! memory: it is loaded once at startup into a sealed anonymous file and
//! every job runs it as a fresh child process.
//!
//! ## Pipeline Overview
//!
//! ```text
//! POST /fetch  "https://…/doc.pdf"
//!  │
//!  ├─ 1. Admit    bounded concurrency, 503 when saturated
//!  ├─ 2. Fetch    reqwest GET with timeout and size cap
//!  ├─ 3. Stage    temp-<id>.pdf  (exclusive create)
//!  ├─ 4. Launch   memfd image as a child: <name> <input> <output>
//!  ├─ 5. Harvest  read output_image-<id>.png after exit 0
//!  └─ 6. Cleanup  both files removed on every path
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdf_crop_gateway::{build_launcher, prepare_work_dir, router, CropService, ServiceConfig};
//! use memexec::AnonymousImage;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServiceConfig::default();
//!     let payload = std::fs::read("/usr/local/lib/crop")?;
//!     let image = AnonymousImage::create("crop", &payload)?;
//!
//!     prepare_work_dir(&config.work_dir)?;
//!     let launcher = build_launcher(&config, Arc::new(image));
//!     let service = Arc::new(CropService::new(&config, launcher)?);
//!     let app = router(service, &config)?;
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature   | Default | Description |
//! |-----------|---------|-------------|
//! | `cli`     | on      | Enables the `pdf-crop-server` binary (clap + anyhow + tracing-subscriber) |
//! | `bundled` | off     | Embeds the converter at compile time (`CONVERTER_BUNDLE_BIN`) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod gateway;
pub mod pipeline;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ServiceConfig, ServiceConfigBuilder};
pub use error::CropError;
pub use gateway::router;
pub use pipeline::fetch::{Fetcher, HttpFetcher};
pub use pipeline::job::{
    build_launcher, ConversionJob, ConversionRequest, ConversionResult, CropService,
};
pub use pipeline::stage::{prepare_work_dir, IdSource, StagedFiles, UuidIdSource};
