//! Server binary for pdf-crop-gateway.
//!
//! A thin shim over the library crate: maps CLI flags and environment
//! variables to `ServiceConfig`, loads the converter into memory and serves
//! the gateway until Ctrl-C or SIGTERM.

use anyhow::{bail, Context, Result};
use clap::Parser;
use memexec::{AnonymousImage, Payload};
use pdf_crop_gateway::{build_launcher, prepare_work_dir, router, CropService, ServiceConfig};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const AFTER_HELP: &str = r#"EXAMPLES:
  # Serve with a converter binary loaded from disk
  pdf-crop-server --converter-path ./bin/crop

  # Converter needs its shared libraries next to it
  CONVERTER_PATH=./bin/crop CONVERTER_LIB_DIR=./bin/lib pdf-crop-server

  # Serve the viewer bundle and allow it as the CORS origin
  pdf-crop-server --static-dir ./dist --allow-origin https://viewer.example.com

  # Request a crop
  curl -X POST --data 'https://example.com/doc.pdf' http://localhost:8080/fetch -o page.png

CONVERTER:
  Built with `--features bundled`, the converter is embedded at compile time
  (CONVERTER_BUNDLE_BIN=/path/to/crop cargo build --features bundled) and
  --converter-path is optional; a path, when given, takes precedence.
"#;

/// Fetch PDFs by URL and crop them to images with an in-memory converter.
#[derive(Parser, Debug)]
#[command(
    name = "pdf-crop-server",
    version,
    about = "Fetch PDFs by URL and crop them to images with an in-memory converter",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// TCP port to listen on.
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Address to bind.
    #[arg(long, env = "BIND_ADDR", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,

    /// Converter executable to load into memory at startup.
    #[arg(long, env = "CONVERTER_PATH")]
    converter_path: Option<PathBuf>,

    /// Directory of shared libraries the converter needs.
    #[arg(long, env = "CONVERTER_LIB_DIR")]
    converter_lib_dir: Option<PathBuf>,

    /// argv[0] passed to the converter.
    #[arg(long, env = "CONVERTER_NAME", default_value = "crop")]
    converter_name: String,

    /// Directory for per-request staging files.
    #[arg(long, env = "CROP_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Access-Control-Allow-Origin value for /fetch.
    #[arg(long, env = "CROP_ALLOW_ORIGIN", default_value = "http://localhost:9000")]
    allow_origin: String,

    /// Serve static viewer assets from this directory.
    #[arg(long, env = "CROP_STATIC_DIR")]
    static_dir: Option<PathBuf>,

    /// Maximum conversions running at once.
    #[arg(long, env = "CROP_MAX_JOBS", default_value_t = 8)]
    max_jobs: usize,

    /// Seconds a request may wait for a free slot before a 503.
    #[arg(long, env = "CROP_QUEUE_TIMEOUT", default_value_t = 30)]
    queue_timeout: u64,

    /// Document download timeout in seconds.
    #[arg(long, env = "CROP_FETCH_TIMEOUT", default_value_t = 60)]
    fetch_timeout: u64,

    /// Converter run timeout in seconds.
    #[arg(long, env = "CROP_CONVERT_TIMEOUT", default_value_t = 120)]
    convert_timeout: u64,

    /// End-to-end request timeout in seconds.
    #[arg(long, env = "CROP_REQUEST_TIMEOUT", default_value_t = 180)]
    request_timeout: u64,

    /// Largest accepted source document in bytes.
    #[arg(long, env = "CROP_MAX_DOCUMENT_BYTES", default_value_t = 50 * 1024 * 1024)]
    max_document_bytes: u64,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "CROP_VERBOSE")]
    verbose: bool,
}

impl Cli {
    fn to_config(&self) -> Result<ServiceConfig> {
        let mut builder = ServiceConfig::builder()
            .allow_origin(&self.allow_origin)
            .max_concurrent_jobs(self.max_jobs)
            .queue_timeout_secs(self.queue_timeout)
            .fetch_timeout_secs(self.fetch_timeout)
            .convert_timeout_secs(self.convert_timeout)
            .request_timeout_secs(self.request_timeout)
            .max_document_bytes(self.max_document_bytes)
            .converter_name(&self.converter_name);
        if let Some(dir) = &self.work_dir {
            builder = builder.work_dir(dir);
        }
        if let Some(dir) = &self.static_dir {
            builder = builder.static_dir(dir);
        }
        if let Some(dir) = &self.converter_lib_dir {
            builder = builder.converter_lib_dir(dir);
        }
        builder.build().context("Invalid configuration")
    }
}

/// An explicit path wins over the embedded converter.
fn load_payload(path: Option<&PathBuf>) -> Result<Payload> {
    if let Some(path) = path {
        let payload = Payload::from_file(path)
            .with_context(|| format!("Failed to load converter from {}", path.display()))?;
        info!("Loaded converter from {} ({} bytes)", path.display(), payload.len());
        return Ok(payload);
    }
    match memexec::bundled_payload() {
        Some(payload) => {
            info!("Using embedded converter ({} bytes)", payload.len());
            Ok(payload)
        }
        None => bail!(
            "No converter available: pass --converter-path (CONVERTER_PATH) \
             or build with --features bundled"
        ),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received; draining in-flight requests");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = cli.to_config()?;

    // ── Converter image ──────────────────────────────────────────────────
    // Loaded once; every request runs a fresh child from the same sealed
    // image. Failure here is fatal: the service is useless without it.
    let payload = load_payload(cli.converter_path.as_ref())?;
    let image = AnonymousImage::create(&config.converter_name, payload.as_bytes())
        .context("Failed to create in-memory converter image")?;
    drop(payload);

    // ── Work directory ───────────────────────────────────────────────────
    prepare_work_dir(&config.work_dir).with_context(|| {
        format!("Failed to prepare work directory {}", config.work_dir.display())
    })?;

    let launcher = build_launcher(&config, Arc::new(image));
    let service = Arc::new(CropService::new(&config, launcher)?);
    let app = router(Arc::clone(&service), &config)?;

    // ── Serve ────────────────────────────────────────────────────────────
    let addr = SocketAddr::new(cli.bind, cli.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(
        "Listening on {} (work dir {}, {} job slots)",
        addr,
        config.work_dir.display(),
        service.capacity()
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}
