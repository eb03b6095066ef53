//! Error types for the pdf-crop-gateway library.
//!
//! [`CropError`] covers every way a single conversion can fail. The gateway
//! maps all of them to a server error; the variants exist so logs can tell
//! a bad URL from a crashed converter. Only [`CropError::ImageCreation`] is
//! fatal, and only at startup: without the converter image nothing can be
//! served.
//!
//! Cleanup failures are deliberately absent: they are logged where they
//! happen and never replace the result of the conversion.

use std::path::PathBuf;
use thiserror::Error;

/// All errors returned by the pdf-crop-gateway library.
#[derive(Debug, Error)]
pub enum CropError {
    // ── Fetch errors ──────────────────────────────────────────────────────
    /// The request body is not an HTTP/HTTPS URL.
    #[error("Invalid document URL '{input}': not a valid HTTP/HTTPS URL")]
    InvalidUrl { input: String },

    /// The remote document could not be retrieved or its body read.
    #[error("Failed to fetch '{url}': {reason}")]
    Fetch { url: String, reason: String },

    /// The download exceeded the fetch timeout.
    #[error("Fetching '{url}' timed out after {secs}s")]
    FetchTimeout { url: String, secs: u64 },

    /// The remote document is larger than the configured cap.
    #[error("Document at '{url}' exceeds the {limit}-byte limit")]
    DocumentTooLarge { url: String, limit: u64 },

    // ── Startup errors ────────────────────────────────────────────────────
    /// The anonymous converter image could not be built.
    #[error("Failed to create converter image: {0}")]
    ImageCreation(#[from] memexec::ImageError),

    // ── Per-job errors ────────────────────────────────────────────────────
    /// The input file could not be staged.
    #[error("Failed to stage '{path}': {source}")]
    Stage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The converter could not run or reported failure.
    #[error("Converter failed: {detail}")]
    Conversion { detail: String },

    /// The converter was killed for running too long.
    #[error("Converter timed out after {ms}ms")]
    ConversionTimeout { ms: u64 },

    /// The converter exited cleanly but produced no usable output file.
    #[error("Converter produced no output at '{path}': {reason}")]
    OutputMissing { path: PathBuf, reason: String },

    // ── Admission errors ──────────────────────────────────────────────────
    /// Every conversion slot stayed busy for the whole queue timeout.
    #[error("All {capacity} conversion slots busy; gave up after {waited_ms}ms")]
    Busy { capacity: usize, waited_ms: u64 },

    /// The whole request exceeded the end-to-end timeout.
    #[error("Request timed out after {secs}s")]
    RequestTimeout { secs: u64 },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CropError {
    /// Short, stable label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CropError::InvalidUrl { .. }
            | CropError::Fetch { .. }
            | CropError::FetchTimeout { .. }
            | CropError::DocumentTooLarge { .. } => "fetch",
            CropError::ImageCreation(_) => "image_creation",
            CropError::Stage { .. } => "stage",
            CropError::Conversion { .. } | CropError::ConversionTimeout { .. } => "conversion",
            CropError::OutputMissing { .. } => "output_missing",
            CropError::Busy { .. } => "busy",
            CropError::RequestTimeout { .. } => "timeout",
            CropError::InvalidConfig(_) => "config",
        }
    }

    /// Whether the failure is due to load rather than this request.
    pub fn is_overload(&self) -> bool {
        matches!(self, CropError::Busy { .. })
    }
}
