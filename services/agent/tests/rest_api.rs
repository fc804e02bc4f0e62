//! End-to-end tests for the REST surface against a live agent core

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use agent_service::rest::{router, AppState};
use agent_service::Agent;
use types::{
    Asset, DataItem, DataItemRegistry, Device, Observation, ObservedValue, Scalar,
};

fn test_agent(buffer_size: usize) -> Arc<Agent> {
    let registry = DataItemRegistry::from_devices(vec![Device {
        id: "d1".into(),
        uuid: "uuid-1".into(),
        name: "Mill-1".into(),
        data_items: vec![
            DataItem::event("avail", "AVAILABILITY"),
            DataItem::event("exec", "EXECUTION"),
            DataItem::sample("pos", "POSITION"),
        ],
    }])
    .unwrap();
    Agent::new(Arc::new(registry), buffer_size, 16, 4, "test-agent", true)
}

fn observation(id: &str, value: f64) -> Observation {
    Observation::new(id, Utc::now(), ObservedValue::Scalar(Scalar::Number(value)))
}

async fn get_json(app: &axum::Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn probe_lists_devices() {
    let agent = test_agent(64);
    let app = router(AppState::new(agent));

    let (status, doc) = get_json(&app, "/probe").await;
    assert_eq!(StatusCode::OK, status);
    let devices = doc["MTConnectDevices"]["Devices"].as_array().unwrap();
    assert_eq!(1, devices.len());
    assert_eq!("Mill-1", devices[0]["name"]);

    let (status, _) = get_json(&app, "/Mill-1/probe").await;
    assert_eq!(StatusCode::OK, status);

    let (status, doc) = get_json(&app, "/NoSuch/probe").await;
    assert_eq!(StatusCode::NOT_FOUND, status);
    assert_eq!("NO_DEVICE", doc["MTConnectError"]["Errors"][0]["errorCode"]);
}

#[tokio::test]
async fn current_serves_latest_per_item() {
    let agent = test_agent(64);
    agent.seed_unavailable();
    agent.buffer().add(observation("pos", 1.0));
    agent.buffer().add(observation("pos", 2.0));
    let app = router(AppState::new(Arc::clone(&agent)));

    let (status, doc) = get_json(&app, "/current").await;
    assert_eq!(StatusCode::OK, status);
    let streams = doc["MTConnectStreams"]["Streams"].as_array().unwrap();
    assert_eq!(3, streams.len());
    let pos = streams
        .iter()
        .find(|o| o["dataItemId"] == "pos")
        .expect("pos present");
    assert_eq!(2.0, pos["value"]["value"].as_f64().unwrap());
}

#[tokio::test]
async fn current_at_validates_range() {
    let agent = test_agent(64);
    agent.buffer().add(observation("pos", 1.0));
    let app = router(AppState::new(agent));

    let (status, _) = get_json(&app, "/current?at=1").await;
    assert_eq!(StatusCode::OK, status);

    let (status, doc) = get_json(&app, "/current?at=99").await;
    assert_eq!(StatusCode::BAD_REQUEST, status);
    assert_eq!(
        "OUT_OF_RANGE",
        doc["MTConnectError"]["Errors"][0]["errorCode"]
    );
}

#[tokio::test]
async fn sample_wrap_around_semantics() {
    // Buffer of 4, add 6: first_sequence 3; from=2 out of range, from=3 full
    let agent = test_agent(4);
    for i in 1..=6 {
        agent.buffer().add(observation("pos", i as f64));
    }
    let app = router(AppState::new(agent));

    let (status, doc) = get_json(&app, "/sample?from=2").await;
    assert_eq!(StatusCode::BAD_REQUEST, status);
    assert_eq!(
        "OUT_OF_RANGE",
        doc["MTConnectError"]["Errors"][0]["errorCode"]
    );

    let (status, doc) = get_json(&app, "/sample?from=3").await;
    assert_eq!(StatusCode::OK, status);
    let streams = doc["MTConnectStreams"]["Streams"].as_array().unwrap();
    assert_eq!(4, streams.len());
    let sequences: Vec<u64> = streams
        .iter()
        .map(|o| o["sequence"].as_u64().unwrap())
        .collect();
    assert_eq!(vec![3, 4, 5, 6], sequences);
    assert_eq!(7, doc["MTConnectStreams"]["Header"]["nextSequence"]);
}

#[tokio::test]
async fn sample_parameter_errors() {
    let agent = test_agent(64);
    agent.buffer().add(observation("pos", 1.0));
    let app = router(AppState::new(agent));

    let (status, _) = get_json(&app, "/sample?count=xxx").await;
    assert_eq!(StatusCode::BAD_REQUEST, status);

    let (status, _) = get_json(&app, "/sample?count=0").await;
    assert_eq!(StatusCode::BAD_REQUEST, status);

    let (status, _) = get_json(&app, "/sample?from=1&to=1").await;
    assert_eq!(StatusCode::BAD_REQUEST, status);

    // Unknown parameters are ignored
    let (status, _) = get_json(&app, "/sample?dummy=1").await;
    assert_eq!(StatusCode::OK, status);
}

#[tokio::test]
async fn path_filter_narrows_results() {
    let agent = test_agent(64);
    agent.buffer().add(observation("pos", 1.0));
    agent.buffer().add(Observation::new(
        "exec",
        Utc::now(),
        ObservedValue::Scalar(Scalar::Text("ACTIVE".into())),
    ));
    let app = router(AppState::new(agent));

    let (status, doc) =
        get_json(&app, "/current?path=//DataItem[@type='POSITION']").await;
    assert_eq!(StatusCode::OK, status);
    let streams = doc["MTConnectStreams"]["Streams"].as_array().unwrap();
    assert_eq!(1, streams.len());
    assert_eq!("pos", streams[0]["dataItemId"]);
}

#[tokio::test]
async fn asset_lifecycle_over_rest() {
    let agent = test_agent(64);
    let app = router(AppState::new(Arc::clone(&agent)));

    // PUT a new asset
    let response = app
        .clone()
        .oneshot(
            Request::put("/asset/TOOL-1?type=CuttingTool&device=Mill-1")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"life": 42}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(StatusCode::OK, response.status());
    assert_eq!(1, agent.assets().count(true));

    // Read it back, by id and by filter
    let (status, doc) = get_json(&app, "/asset/TOOL-1").await;
    assert_eq!(StatusCode::OK, status);
    assert_eq!(
        "CuttingTool",
        doc["MTConnectAssets"]["Assets"][0]["assetType"]
    );

    let (status, doc) = get_json(&app, "/assets?type=CuttingTool").await;
    assert_eq!(StatusCode::OK, status);
    assert_eq!(1, doc["MTConnectAssets"]["Assets"].as_array().unwrap().len());

    // DELETE tombstones it
    let response = app
        .clone()
        .oneshot(Request::delete("/asset/TOOL-1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(StatusCode::OK, response.status());
    assert_eq!(0, agent.assets().count(true));

    let (_, doc) = get_json(&app, "/assets").await;
    assert_eq!(0, doc["MTConnectAssets"]["Assets"].as_array().unwrap().len());
    let (_, doc) = get_json(&app, "/assets?removed=true").await;
    assert_eq!(1, doc["MTConnectAssets"]["Assets"].as_array().unwrap().len());

    let (status, _) = get_json(&app, "/asset/GHOST").await;
    assert_eq!(StatusCode::NOT_FOUND, status);
}

#[tokio::test]
async fn put_observation_routes_through_pipeline() {
    let agent = test_agent(64);
    agent.seed_unavailable();
    let app = router(AppState::new(Arc::clone(&agent)));

    let response = app
        .clone()
        .oneshot(
            Request::put("/Mill-1?exec=ACTIVE&time=2021-01-19T12:00:00Z")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(StatusCode::OK, response.status());

    let (_, doc) = get_json(&app, "/current?path=EXECUTION").await;
    let streams = doc["MTConnectStreams"]["Streams"].as_array().unwrap();
    assert_eq!("ACTIVE", streams[0]["value"]["value"]);
    assert_eq!("2021-01-19T12:00:00.000000Z", streams[0]["timestamp"]);
}

#[tokio::test]
async fn put_rejected_when_disabled() {
    let registry = DataItemRegistry::from_devices(vec![Device {
        id: "d1".into(),
        uuid: "uuid-1".into(),
        name: "Mill-1".into(),
        data_items: vec![DataItem::event("exec", "EXECUTION")],
    }])
    .unwrap();
    let agent = Agent::new(Arc::new(registry), 64, 16, 4, "test", false);
    let app = router(AppState::new(agent));

    let response = app
        .oneshot(
            Request::put("/Mill-1?exec=ACTIVE")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(StatusCode::BAD_REQUEST, response.status());
}

#[tokio::test]
async fn xml_only_accept_is_not_acceptable() {
    let agent = test_agent(64);
    let app = router(AppState::new(agent));

    let response = app
        .oneshot(
            Request::get("/probe")
                .header(header::ACCEPT, "text/xml")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(StatusCode::NOT_ACCEPTABLE, response.status());
}

#[tokio::test]
async fn assets_survive_replacement_with_same_id() {
    let agent = test_agent(64);
    agent.assets().add(Asset::new(
        "TOOL-9",
        "CuttingTool",
        Utc::now(),
        serde_json::json!({"rev": 1}),
    ));
    agent.assets().add(Asset::new(
        "TOOL-9",
        "CuttingTool",
        Utc::now(),
        serde_json::json!({"rev": 2}),
    ));
    let app = router(AppState::new(Arc::clone(&agent)));

    assert_eq!(1, agent.assets().count(true));
    let (_, doc) = get_json(&app, "/asset/TOOL-9").await;
    assert_eq!(2, doc["MTConnectAssets"]["Assets"][0]["body"]["rev"]);
}
