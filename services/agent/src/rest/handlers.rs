//! Request handlers
//!
//! Each endpoint parses its typed parameters, asks the agent core for the
//! data, and hands the in-memory result to the negotiated formatter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use chrono::Utc;
use tracing::debug;

use pipeline::{build_adapter_pipeline, PipelineContext, PipelineContract, PipelineOptions};
use types::{Asset, AssetCommand};

use crate::agent::SourceContract;
use crate::error::ServiceError;
use crate::formatter::Formatter;
use crate::rest::params::QueryParams;
use crate::rest::stream::{current_stream, sample_stream, StreamParams};
use crate::rest::{document_response, error_response, not_acceptable, AppState};
use crate::Result;

type Params = Query<HashMap<String, String>>;

/// Upper bound for `count` query parameters
const MAX_REQUEST_COUNT: usize = 100_000;

fn streaming_response(boundary: &str, body: axum::body::Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(
            "Content-Type",
            format!("multipart/x-mixed-replace;boundary={boundary}"),
        )
        .header("Cache-Control", "private, max-age=0")
        .header("X-Session-Id", boundary.to_string())
        .body(body)
        .expect("valid streaming response")
}

fn respond(
    state: &Arc<AppState>,
    formatter: &Arc<dyn Formatter>,
    result: Result<Response>,
) -> Response {
    result.unwrap_or_else(|err| error_response(state, formatter, &err))
}

// ---------------------------------------------------------------- probe

pub async fn probe(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    probe_inner(state, headers, None)
}

pub async fn probe_device(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
    headers: HeaderMap,
) -> Response {
    probe_inner(state, headers, Some(device))
}

fn probe_inner(state: Arc<AppState>, headers: HeaderMap, device: Option<String>) -> Response {
    let Some(formatter) = state.formatter_for(&headers) else {
        return not_acceptable(&state);
    };
    let result = (|| {
        let devices = match &device {
            Some(name) => vec![Arc::clone(
                state
                    .agent
                    .registry()
                    .find_device(name)
                    .ok_or_else(|| ServiceError::UnknownDevice { device: name.clone() })?,
            )],
            None => state.agent.registry().devices().to_vec(),
        };
        let doc = formatter.format_probe(&state.agent.document_meta(), &devices);
        Ok(document_response(StatusCode::OK, formatter.content_type(), doc))
    })();
    respond(&state, &formatter, result)
}

// -------------------------------------------------------------- current

pub async fn current(
    State(state): State<Arc<AppState>>,
    Query(query): Params,
    headers: HeaderMap,
) -> Response {
    current_inner(state, headers, None, query)
}

pub async fn current_device(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
    Query(query): Params,
    headers: HeaderMap,
) -> Response {
    current_inner(state, headers, Some(device), query)
}

fn current_inner(
    state: Arc<AppState>,
    headers: HeaderMap,
    device: Option<String>,
    query: HashMap<String, String>,
) -> Response {
    let Some(formatter) = state.formatter_for(&headers) else {
        return not_acceptable(&state);
    };
    let q = QueryParams::new(&query);
    let result = (|| {
        let filter = state
            .agent
            .filter_for(device.as_deref(), q.string("path").as_deref())?;

        if let Some(interval_ms) = q.interval()? {
            if interval_ms < 0.0 {
                return Err(ServiceError::parameter("interval", "must be non-negative"));
            }
            let (boundary, body) = current_stream(
                Arc::clone(&state.agent),
                Arc::clone(&formatter),
                filter,
                // A zero interval would spin; snapshots at least pace to 1 ms
                Duration::from_millis((interval_ms as u64).max(1)),
            );
            return Ok(streaming_response(&boundary, body));
        }

        let at = q.unsigned("at")?;
        let snapshot = state.agent.buffer().current(Some(&filter), at)?;
        let doc = formatter.format_streams(&state.agent.document_meta(), &snapshot);
        Ok(document_response(StatusCode::OK, formatter.content_type(), doc))
    })();
    respond(&state, &formatter, result)
}

// --------------------------------------------------------------- sample

pub async fn sample(
    State(state): State<Arc<AppState>>,
    Query(query): Params,
    headers: HeaderMap,
) -> Response {
    sample_inner(state, headers, None, query)
}

pub async fn sample_device(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
    Query(query): Params,
    headers: HeaderMap,
) -> Response {
    sample_inner(state, headers, Some(device), query)
}

fn sample_inner(
    state: Arc<AppState>,
    headers: HeaderMap,
    device: Option<String>,
    query: HashMap<String, String>,
) -> Response {
    let Some(formatter) = state.formatter_for(&headers) else {
        return not_acceptable(&state);
    };
    let q = QueryParams::new(&query);
    let result = (|| {
        let filter = state
            .agent
            .filter_for(device.as_deref(), q.string("path").as_deref())?;
        let count = q.count(MAX_REQUEST_COUNT)?;
        let from = q.unsigned("from")?;
        let to = q.unsigned("to")?;
        if let (Some(from), Some(to)) = (from, to) {
            if to <= from {
                return Err(ServiceError::parameter(
                    "to",
                    format!("must be greater than from ({from}), was {to}"),
                ));
            }
        }

        if let Some(interval_ms) = q.interval()? {
            if interval_ms < 0.0 {
                return Err(ServiceError::parameter("interval", "must be non-negative"));
            }
            let heartbeat = q.heartbeat()?;
            let params = StreamParams {
                filter,
                from: from.unwrap_or_else(|| state.agent.buffer().first_sequence()),
                count,
                interval: Duration::from_millis(interval_ms as u64),
                heartbeat: Duration::from_millis(heartbeat as u64),
            };
            let (boundary, body) =
                sample_stream(Arc::clone(&state.agent), Arc::clone(&formatter), params);
            return Ok(streaming_response(&boundary, body));
        }

        let result = state.agent.buffer().sample(Some(&filter), from, to, count)?;
        let mut meta = state.agent.document_meta();
        meta.next_sequence = result.end_sequence;
        let doc = formatter.format_streams(&meta, &result.observations);
        Ok(document_response(StatusCode::OK, formatter.content_type(), doc))
    })();
    respond(&state, &formatter, result)
}

// --------------------------------------------------------------- assets

pub async fn assets(
    State(state): State<Arc<AppState>>,
    Query(query): Params,
    headers: HeaderMap,
) -> Response {
    let Some(formatter) = state.formatter_for(&headers) else {
        return not_acceptable(&state);
    };
    let q = QueryParams::new(&query);
    let result = (|| {
        let removed = q.boolean("removed")?.unwrap_or(false);
        let count = q.count(MAX_REQUEST_COUNT)?;
        let assets = state.agent.assets().query(
            q.string("type").as_deref(),
            q.string("device").as_deref(),
            removed,
            count,
        );
        let doc = formatter.format_assets(&state.agent.document_meta(), &assets);
        Ok(document_response(StatusCode::OK, formatter.content_type(), doc))
    })();
    respond(&state, &formatter, result)
}

pub async fn asset_by_ids(
    State(state): State<Arc<AppState>>,
    Path(ids): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(formatter) = state.formatter_for(&headers) else {
        return not_acceptable(&state);
    };
    let result = (|| {
        let mut assets = Vec::new();
        for id in ids.split(',').map(str::trim).filter(|id| !id.is_empty()) {
            let asset = state.agent.assets().get(id).ok_or_else(|| {
                ServiceError::UnknownAsset { asset_id: id.to_string() }
            })?;
            assets.push(asset);
        }
        let doc = formatter.format_assets(&state.agent.document_meta(), &assets);
        Ok(document_response(StatusCode::OK, formatter.content_type(), doc))
    })();
    respond(&state, &formatter, result)
}

pub async fn put_asset(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Params,
    headers: HeaderMap,
    body: String,
) -> Response {
    let Some(formatter) = state.formatter_for(&headers) else {
        return not_acceptable(&state);
    };
    let q = QueryParams::new(&query);
    let result = (|| {
        if !state.agent.allow_put() {
            return Err(ServiceError::PutNotAllowed);
        }
        let parsed: serde_json::Value = serde_json::from_str(&body)
            .unwrap_or(serde_json::Value::String(body.clone()));
        let asset_type = q
            .string("type")
            .or_else(|| {
                parsed
                    .get("assetType")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            })
            .ok_or_else(|| ServiceError::parameter("type", "asset type is required"))?;

        let mut asset = Asset::new(id.clone(), asset_type, Utc::now(), parsed);
        if let Some(device) = q.string("device") {
            let device = state
                .agent
                .registry()
                .find_device(&device)
                .ok_or_else(|| ServiceError::UnknownDevice { device: device.clone() })?;
            asset = asset.for_device(device.uuid.clone());
        }
        state.rest_contract.deliver_asset_command(AssetCommand::Upsert(asset));

        let stored = state
            .agent
            .assets()
            .get(&id)
            .ok_or(ServiceError::UnknownAsset { asset_id: id.clone() })?;
        let doc = formatter.format_assets(&state.agent.document_meta(), &[stored]);
        Ok(document_response(StatusCode::OK, formatter.content_type(), doc))
    })();
    respond(&state, &formatter, result)
}

pub async fn delete_asset(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(formatter) = state.formatter_for(&headers) else {
        return not_acceptable(&state);
    };
    let result = (|| {
        if !state.agent.allow_put() {
            return Err(ServiceError::PutNotAllowed);
        }
        if state.agent.assets().get(&id).is_none() {
            return Err(ServiceError::UnknownAsset { asset_id: id.clone() });
        }
        state.rest_contract.deliver_asset_command(AssetCommand::Remove {
            asset_id: id.clone(),
            timestamp: Utc::now(),
        });
        let removed = state
            .agent
            .assets()
            .get(&id)
            .ok_or(ServiceError::UnknownAsset { asset_id: id.clone() })?;
        let doc = formatter.format_assets(&state.agent.document_meta(), &[removed]);
        Ok(document_response(StatusCode::OK, formatter.content_type(), doc))
    })();
    respond(&state, &formatter, result)
}

pub async fn delete_all_assets(
    State(state): State<Arc<AppState>>,
    Query(query): Params,
    headers: HeaderMap,
) -> Response {
    let Some(formatter) = state.formatter_for(&headers) else {
        return not_acceptable(&state);
    };
    let q = QueryParams::new(&query);
    let result = (|| {
        if !state.agent.allow_put() {
            return Err(ServiceError::PutNotAllowed);
        }
        state.rest_contract.deliver_asset_command(AssetCommand::RemoveAll {
            asset_type: q.string("type"),
            device_uuid: q.string("device"),
            timestamp: Utc::now(),
        });
        let remaining = state.agent.assets().query(None, None, true, usize::MAX);
        let doc = formatter.format_assets(&state.agent.document_meta(), &remaining);
        Ok(document_response(StatusCode::OK, formatter.content_type(), doc))
    })();
    respond(&state, &formatter, result)
}

// ----------------------------------------------------- put observations

pub async fn put_observations(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
    Query(query): Params,
    headers: HeaderMap,
) -> Response {
    let Some(formatter) = state.formatter_for(&headers) else {
        return not_acceptable(&state);
    };
    let result = (|| {
        if !state.agent.allow_put() {
            return Err(ServiceError::PutNotAllowed);
        }
        if state.agent.registry().find_device(&device).is_none() {
            return Err(ServiceError::UnknownDevice { device: device.clone() });
        }

        // Rebuild the request as one SHDR frame and push it through the
        // device's ingestion pipeline, exactly as an adapter line would go.
        let timestamp = query.get("time").cloned().unwrap_or_default();
        let mut line = timestamp;
        let mut pairs = 0;
        for (name, value) in &query {
            if name == "time" {
                continue;
            }
            line.push('|');
            line.push_str(name);
            line.push('|');
            line.push_str(value);
            pairs += 1;
        }
        if pairs == 0 {
            return Err(ServiceError::parameter(
                "observation",
                "at least one data item parameter is required",
            ));
        }

        let pipeline = put_pipeline(&state, &device);
        debug!(device = %device, line = %line, "put observation");
        pipeline
            .feed_line(&line)
            .map_err(|err| ServiceError::InvalidBody(err.to_string()))?;

        let filter = state.agent.filter_for(Some(&device), None)?;
        let snapshot = state.agent.buffer().current(Some(&filter), None)?;
        let doc = formatter.format_streams(&state.agent.document_meta(), &snapshot);
        Ok(document_response(StatusCode::OK, formatter.content_type(), doc))
    })();
    respond(&state, &formatter, result)
}

/// Ingestion pipeline for PUT observations, one per device
fn put_pipeline(state: &Arc<AppState>, device: &str) -> Arc<pipeline::Pipeline> {
    let mut pipelines = state.put_pipelines.lock().unwrap();
    if let Some(existing) = pipelines.get(device) {
        return Arc::clone(existing);
    }
    let source = format!("put:{device}");
    let contract = SourceContract::new(Arc::clone(&state.agent), Some(device.to_string()));
    let context = PipelineContext::new(
        source.clone(),
        contract as Arc<dyn pipeline::PipelineContract>,
    );
    let options = PipelineOptions {
        device: Some(device.to_string()),
        ..PipelineOptions::default()
    };
    let built = Arc::new(build_adapter_pipeline(&source, context, &options));
    pipelines.insert(device.to_string(), Arc::clone(&built));
    built
}
