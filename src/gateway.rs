//! HTTP surface of the service.
//!
//! | Route            | Behaviour                                              |
//! |------------------|--------------------------------------------------------|
//! | `OPTIONS /fetch` | 204 with the fixed CORS policy                         |
//! | `POST /fetch`    | body is a PDF URL; 200 with image bytes, 5xx on failure |
//! | `GET /health`    | JSON admission snapshot                                |
//! | anything else    | static viewer assets, when a static dir is configured   |
//!
//! Failure causes are logged here and never returned to the caller: every
//! pipeline failure is a 500 with an empty body, except overload (503).

use crate::config::ServiceConfig;
use crate::error::CropError;
use crate::pipeline::job::{ConversionRequest, CropService};
use axum::{
    body::Bytes,
    extract::State,
    http::{
        header::{
            ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
            ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_LENGTH, CONTENT_TYPE,
        },
        HeaderName, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

const ALLOW_METHODS: &str = "OPTIONS, POST";
const ALLOW_HEADERS: &str = "Origin, Content-Type, Access-Control-Allow-Origin";

/// Used when the converter output matches no known image signature.
const FALLBACK_CONTENT_TYPE: &str = "image/jpeg";

#[derive(Clone)]
struct GatewayState {
    service: Arc<CropService>,
    allow_origin: HeaderValue,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    in_flight: usize,
    capacity: usize,
}

/// Build the router for `service`.
pub fn router(service: Arc<CropService>, config: &ServiceConfig) -> Result<Router, CropError> {
    let allow_origin = HeaderValue::from_str(&config.allow_origin).map_err(|_| {
        CropError::InvalidConfig(format!("invalid allow_origin {:?}", config.allow_origin))
    })?;

    let mut router = Router::new()
        .route("/fetch", post(fetch_image).options(fetch_preflight))
        .route("/health", get(health))
        .with_state(GatewayState {
            service,
            allow_origin,
        });

    if let Some(dir) = &config.static_dir {
        if dir.is_dir() {
            let assets = ServeDir::new(dir).fallback(ServeFile::new(dir.join("index.html")));
            router = router.fallback_service(assets);
        } else {
            warn!("Static directory {} not found; not serving assets", dir.display());
        }
    }

    Ok(router.layer(TraceLayer::new_for_http()))
}

fn cors_headers(origin: &HeaderValue) -> [(HeaderName, HeaderValue); 3] {
    [
        (ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone()),
        (
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOW_METHODS),
        ),
        (
            ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(ALLOW_HEADERS),
        ),
    ]
}

async fn fetch_preflight(State(state): State<GatewayState>) -> impl IntoResponse {
    (StatusCode::NO_CONTENT, cors_headers(&state.allow_origin))
}

async fn fetch_image(State(state): State<GatewayState>, body: Bytes) -> Response {
    let cors = cors_headers(&state.allow_origin);

    let url = match std::str::from_utf8(&body) {
        Ok(url) => url,
        Err(e) => {
            error!("Request body is not UTF-8: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, cors).into_response();
        }
    };

    match state.service.convert(ConversionRequest::new(url)).await {
        Ok(image) => {
            let headers = [
                (CONTENT_TYPE, HeaderValue::from_static(content_type_of(&image))),
                (CONTENT_LENGTH, HeaderValue::from(image.len())),
            ];
            (StatusCode::OK, cors, headers, image).into_response()
        }
        Err(e) => {
            error!("Conversion failed [{}]: {}", e.kind(), e);
            let status = if e.is_overload() {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (status, cors).into_response()
        }
    }
}

async fn health(State(state): State<GatewayState>) -> Json<HealthResponse> {
    let in_flight = state.service.in_flight();
    let capacity = state.service.capacity();
    Json(HealthResponse {
        status: if in_flight < capacity { "ok" } else { "saturated" },
        in_flight,
        capacity,
    })
}

/// MIME type of the converter output, sniffed from its signature.
pub fn content_type_of(image: &[u8]) -> &'static str {
    image::guess_format(image)
        .map(|format| format.to_mime_type())
        .unwrap_or(FALLBACK_CONTENT_TYPE)
}
