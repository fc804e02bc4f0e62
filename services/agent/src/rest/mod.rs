//! REST surface
//!
//! Routes Probe/Current/Sample/Asset requests into the agent core and
//! translates core errors into MTConnect error documents. The wire server
//! is axum; everything MTConnect-specific lives in the handlers.

pub mod handlers;
pub mod params;
pub mod stream;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::http::header::ACCEPT;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{get, put};
use axum::Router;
use tower_http::trace::TraceLayer;

use pipeline::Pipeline;

use crate::agent::{Agent, SourceContract};
use crate::error::ServiceError;
use crate::formatter::{Formatter, JsonFormatter};

/// Shared state of the REST surface
pub struct AppState {
    pub agent: Arc<Agent>,
    /// Contract REST writes (PUT assets/observations) deliver through
    pub rest_contract: Arc<SourceContract>,
    /// Per-device ingestion pipelines for PUT observations
    pub put_pipelines: Mutex<HashMap<String, Arc<Pipeline>>>,
    json: Arc<JsonFormatter>,
}

impl AppState {
    pub fn new(agent: Arc<Agent>) -> Arc<Self> {
        let rest_contract = SourceContract::new(Arc::clone(&agent), None);
        Arc::new(Self {
            agent,
            rest_contract,
            put_pipelines: Mutex::new(HashMap::new()),
            json: Arc::new(JsonFormatter),
        })
    }

    /// Select the formatter for the request's Accept header. JSON is served
    /// for `application/json`, wildcards, and absent headers; the XML
    /// printer is an external plug-in, so XML-only requests get 406.
    pub fn formatter_for(&self, headers: &HeaderMap) -> Option<Arc<dyn Formatter>> {
        let accept = headers
            .get(ACCEPT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("*/*");
        let acceptable = accept
            .split(',')
            .map(|part| part.split(';').next().unwrap_or("").trim())
            .any(|media| {
                matches!(media, "application/json" | "application/*" | "*/*" | "")
            });
        acceptable.then(|| Arc::clone(&self.json) as Arc<dyn Formatter>)
    }

    pub fn json_formatter(&self) -> Arc<dyn Formatter> {
        Arc::clone(&self.json) as Arc<dyn Formatter>
    }
}

/// Build the agent router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/probe", get(handlers::probe))
        .route("/current", get(handlers::current))
        .route("/sample", get(handlers::sample))
        .route("/assets", get(handlers::assets).delete(handlers::delete_all_assets))
        .route(
            "/asset/:ids",
            get(handlers::asset_by_ids)
                .put(handlers::put_asset)
                .post(handlers::put_asset)
                .delete(handlers::delete_asset),
        )
        .route("/:device/probe", get(handlers::probe_device))
        .route("/:device/current", get(handlers::current_device))
        .route("/:device/sample", get(handlers::sample_device))
        .route("/:device", put(handlers::put_observations).post(handlers::put_observations))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// HTTP status for a service error
fn status_for(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::Parameter { .. }
        | ServiceError::OutOfRange(_)
        | ServiceError::InvalidBody(_)
        | ServiceError::PutNotAllowed => StatusCode::BAD_REQUEST,
        ServiceError::UnknownDevice { .. } | ServiceError::UnknownAsset { .. } => {
            StatusCode::NOT_FOUND
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Wrap a document into a response with the standard headers
pub fn document_response(status: StatusCode, content_type: &str, body: String) -> Response {
    Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .header("Cache-Control", "private, max-age=0")
        .body(axum::body::Body::from(body))
        .expect("valid response")
}

/// Render a service error as an MTConnect error document
pub fn error_response(
    state: &AppState,
    formatter: &Arc<dyn Formatter>,
    err: &ServiceError,
) -> Response {
    let doc = formatter.format_error(
        &state.agent.document_meta(),
        err.error_code(),
        &err.to_string(),
    );
    document_response(status_for(err), formatter.content_type(), doc)
}

/// 406 for Accept headers no formatter serves
pub fn not_acceptable(state: &AppState) -> Response {
    let formatter = state.json_formatter();
    let doc = formatter.format_error(
        &state.agent.document_meta(),
        "UNSUPPORTED",
        "no formatter available for the requested media type",
    );
    document_response(StatusCode::NOT_ACCEPTABLE, formatter.content_type(), doc)
}
