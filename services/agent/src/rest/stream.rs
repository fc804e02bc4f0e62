//! Long-poll streaming
//!
//! Each streaming request owns one [`ChangeObserver`] registered on its
//! filter set and one forwarding task that serializes writes. Chunks are
//! multipart frames; a heartbeat chunk goes out when no observation
//! arrives within the client's heartbeat window. Falling off the back of
//! the buffer ends the stream with an OUT_OF_RANGE document.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use buffer::ChangeObserver;

use crate::agent::Agent;
use crate::formatter::Formatter;

static STREAM_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Parameters of one streaming sample session
pub struct StreamParams {
    pub filter: HashSet<String>,
    pub from: u64,
    pub count: usize,
    pub interval: Duration,
    pub heartbeat: Duration,
}

enum Wakeup {
    Data,
    Heartbeat,
}

/// Session id doubling as the multipart boundary
pub fn next_stream_id() -> String {
    format!("mtc-stream-{:08x}", STREAM_COUNTER.fetch_add(1, Ordering::Relaxed))
}

fn frame(boundary: &str, content_type: &str, doc: &str) -> Bytes {
    Bytes::from(format!(
        "--{boundary}\r\nContent-type: {content_type}\r\nContent-length: {}\r\n\r\n{doc}\r\n",
        doc.len()
    ))
}

/// Start a streaming sample response; returns the boundary and the body.
pub fn sample_stream(
    agent: Arc<Agent>,
    formatter: Arc<dyn Formatter>,
    params: StreamParams,
) -> (String, Body) {
    let boundary = next_stream_id();
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::convert::Infallible>>(4);

    let task_boundary = boundary.clone();
    tokio::spawn(async move {
        run_sample_stream(agent, formatter, params, task_boundary, tx).await;
    });

    (boundary, Body::from_stream(ReceiverStream::new(rx)))
}

async fn run_sample_stream(
    agent: Arc<Agent>,
    formatter: Arc<dyn Formatter>,
    params: StreamParams,
    boundary: String,
    tx: mpsc::Sender<Result<Bytes, std::convert::Infallible>>,
) {
    let observer = ChangeObserver::new();
    let signalers: Vec<_> = params
        .filter
        .iter()
        .map(|id| agent.signaler(id))
        .collect();
    for signaler in &signalers {
        signaler.add_observer(&observer);
    }

    let content_type = formatter.content_type();
    let mut from = params.from;
    let mut last_write: Option<Instant> = None;

    loop {
        observer.reset();

        let result = match agent.buffer().sample(
            Some(&params.filter),
            Some(from),
            None,
            params.count,
        ) {
            Ok(result) => result,
            Err(err) => {
                // The reader fell off the back of the buffer; tell it
                // rather than silently realigning.
                let doc = formatter.format_error(
                    &agent.document_meta(),
                    "OUT_OF_RANGE",
                    &err.to_string(),
                );
                let _ = tx.send(Ok(frame(&boundary, content_type, &doc))).await;
                break;
            }
        };

        let mut meta = agent.document_meta();
        meta.first_sequence = result.first_sequence;
        meta.next_sequence = result.end_sequence;
        let doc = formatter.format_streams(&meta, &result.observations);
        if tx.send(Ok(frame(&boundary, content_type, &doc))).await.is_err() {
            // Peer closed; tear down.
            break;
        }
        last_write = Some(Instant::now());
        from = result.end_sequence;

        // When the count limit truncated the chunk there is more data
        // already buffered; skip the wait and continue after pacing.
        if result.end_of_buffer {
            match wait_for_data(&observer, from, params.heartbeat).await {
                Wakeup::Data => {}
                Wakeup::Heartbeat => {
                    debug!(boundary = %boundary, "heartbeat keepalive");
                }
            }
        }

        if let Some(written) = last_write {
            let elapsed = written.elapsed();
            if elapsed < params.interval {
                tokio::time::sleep(params.interval - elapsed).await;
            }
        }
    }

    for signaler in &signalers {
        signaler.remove_observer(&observer);
    }
}

/// Wait for a sequence at or past `from`, re-arming on stale signals left
/// over from data this session already served.
async fn wait_for_data(observer: &ChangeObserver, from: u64, heartbeat: Duration) -> Wakeup {
    loop {
        if !observer.wait_for(heartbeat).await {
            return Wakeup::Heartbeat;
        }
        match observer.sequence() {
            Some(seq) if seq < from => observer.reset(),
            _ => return Wakeup::Data,
        }
    }
}

/// Streaming Current: a full snapshot every interval until the peer closes.
pub fn current_stream(
    agent: Arc<Agent>,
    formatter: Arc<dyn Formatter>,
    filter: HashSet<String>,
    interval: Duration,
) -> (String, Body) {
    let boundary = next_stream_id();
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::convert::Infallible>>(4);

    let task_boundary = boundary.clone();
    tokio::spawn(async move {
        let content_type = formatter.content_type();
        loop {
            let snapshot = match agent.buffer().current(Some(&filter), None) {
                Ok(snapshot) => snapshot,
                Err(_) => break,
            };
            let doc = formatter.format_streams(&agent.document_meta(), &snapshot);
            if tx
                .send(Ok(frame(&task_boundary, content_type, &doc)))
                .await
                .is_err()
            {
                break;
            }
            tokio::time::sleep(interval).await;
        }
    });

    (boundary, Body::from_stream(ReceiverStream::new(rx)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures_util::StreamExt;
    use types::{DataItem, DataItemRegistry, Device, Observation, ObservedValue, Scalar};

    fn agent() -> Arc<Agent> {
        let registry = DataItemRegistry::from_devices(vec![Device {
            id: "d1".into(),
            uuid: "u1".into(),
            name: "M".into(),
            data_items: vec![DataItem::sample("pos", "POSITION")],
        }])
        .unwrap();
        Agent::new(Arc::new(registry), 64, 8, 4, "test", false)
    }

    fn obs(value: f64) -> Observation {
        Observation::new("pos", Utc::now(), ObservedValue::Scalar(Scalar::Number(value)))
    }

    async fn next_doc(
        body: &mut axum::body::BodyDataStream,
    ) -> serde_json::Value {
        let chunk = body.next().await.expect("chunk").expect("bytes");
        let text = String::from_utf8(chunk.to_vec()).unwrap();
        let json_start = text.find("\r\n\r\n").expect("frame header") + 4;
        serde_json::from_str(text[json_start..].trim_end()).expect("chunk document")
    }

    #[tokio::test]
    async fn chunks_carry_observations_in_sequence_order() {
        let agent = agent();
        agent.buffer().add(obs(1.0));

        let params = StreamParams {
            filter: HashSet::from(["pos".to_string()]),
            from: 1,
            count: 100,
            interval: Duration::from_millis(10),
            heartbeat: Duration::from_secs(5),
        };
        let (boundary, body) =
            sample_stream(Arc::clone(&agent), Arc::new(crate::JsonFormatter), params);
        assert!(boundary.starts_with("mtc-stream-"));
        let mut stream = body.into_data_stream();

        let first = next_doc(&mut stream).await;
        let streams = &first["MTConnectStreams"]["Streams"];
        assert_eq!(1, streams.as_array().unwrap().len());
        assert_eq!(1, streams[0]["sequence"]);

        // New observations wake the stream and arrive in order
        agent.buffer().add(obs(2.0));
        agent.buffer().add(obs(3.0));
        let second = next_doc(&mut stream).await;
        let streams = second["MTConnectStreams"]["Streams"].as_array().unwrap();
        let sequences: Vec<u64> =
            streams.iter().map(|o| o["sequence"].as_u64().unwrap()).collect();
        assert!(sequences == vec![2, 3] || sequences == vec![2] || sequences == vec![3],
            "unexpected sequences {sequences:?}");
        let mut sorted = sequences.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, sequences);
    }

    #[tokio::test]
    async fn heartbeat_chunk_when_idle() {
        let agent = agent();
        agent.buffer().add(obs(1.0));

        let params = StreamParams {
            filter: HashSet::from(["pos".to_string()]),
            from: 1,
            count: 10,
            interval: Duration::from_millis(1),
            heartbeat: Duration::from_millis(50),
        };
        let (_, body) =
            sample_stream(Arc::clone(&agent), Arc::new(crate::JsonFormatter), params);
        let mut stream = body.into_data_stream();

        let _first = next_doc(&mut stream).await;
        // No new data: the next chunk is an empty keepalive
        let keepalive = next_doc(&mut stream).await;
        assert_eq!(
            0,
            keepalive["MTConnectStreams"]["Streams"].as_array().unwrap().len()
        );
    }

    #[tokio::test]
    async fn out_of_range_terminates_stream() {
        let agent = agent();
        for i in 0..10 {
            agent.buffer().add(obs(i as f64));
        }

        let params = StreamParams {
            filter: HashSet::from(["pos".to_string()]),
            from: 99,
            count: 10,
            interval: Duration::from_millis(1),
            heartbeat: Duration::from_millis(50),
        };
        let (_, body) =
            sample_stream(Arc::clone(&agent), Arc::new(crate::JsonFormatter), params);
        let mut stream = body.into_data_stream();

        let doc = next_doc(&mut stream).await;
        assert_eq!(
            "OUT_OF_RANGE",
            doc["MTConnectError"]["Errors"][0]["errorCode"]
        );
        assert!(stream.next().await.is_none());
    }
}
