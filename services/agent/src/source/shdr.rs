//! SHDR adapter connection manager
//!
//! One instance per configured adapter. Drives the socket through the
//! connect/read/reconnect state machine, answers for heartbeats, applies
//! protocol commands to the runtime options (rebuilding the pipeline
//! between frames), and feeds data lines into the transform chain.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use codec::command::{is_command_line, is_pong, ProtocolCommand};
use config::AdapterConfig;
use pipeline::{build_adapter_pipeline, Entity, Pipeline, PipelineContext, PipelineOptions};

use crate::agent::{Agent, SourceContract};
use crate::source::{source_identity, ConnectionState, Source};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_LINE_LENGTH: usize = 1 << 20;

/// Why the read loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReadEnd {
    Eof,
    ReadError(String),
    WriteError,
    HeartbeatTimeout,
    /// Peer sent `* disconnect:`
    Disconnect,
    Stopped,
}

/// SHDR adapter source
pub struct ShdrAdapter {
    config: AdapterConfig,
    identity: String,
    url: String,
    contract: Arc<SourceContract>,
    context: Arc<PipelineContext>,
    pipeline: Mutex<Pipeline>,
    options: Mutex<PipelineOptions>,
    state: Mutex<ConnectionState>,
    shutdown: CancellationToken,
}

impl ShdrAdapter {
    pub fn new(agent: Arc<Agent>, config: AdapterConfig) -> Arc<Self> {
        let identity = source_identity(&config.host, config.port, &config.topics);
        let url = format!("shdr://{}:{}", config.host, config.port);
        let contract = SourceContract::new(agent, config.device.clone());
        let context = PipelineContext::new(
            url.clone(),
            Arc::clone(&contract) as Arc<dyn pipeline::PipelineContract>,
        );
        let options = PipelineOptions {
            device: config.device.clone(),
            relative_time: config.relative_time,
            real_time: config.real_time,
            conversion_required: config.conversion_required,
            upcase_values: config.upcase_values,
        };
        let pipeline = build_adapter_pipeline(&url, Arc::clone(&context), &options);

        Arc::new(Self {
            config,
            identity,
            url,
            contract,
            context,
            pipeline: Mutex::new(pipeline),
            options: Mutex::new(options),
            state: Mutex::new(ConnectionState::Idle),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    fn device(&self) -> Option<String> {
        self.options.lock().unwrap().device.clone()
    }

    /// Feed one received line: heartbeat responses and protocol commands
    /// are handled here, everything else goes through the pipeline.
    fn process_line(&self, line: &str) -> Option<ReadEnd> {
        if is_pong(line) {
            return None;
        }
        if is_command_line(line) {
            return self.process_command(line);
        }
        if let Err(err) = self.pipeline.lock().unwrap().feed_line(line) {
            warn!(source = %self.url, error = %err, "dropped frame");
        }
        None
    }

    fn process_command(&self, line: &str) -> Option<ReadEnd> {
        let Some(command) = ProtocolCommand::parse(line) else {
            debug!(source = %self.url, line, "ignoring malformed command line");
            return None;
        };

        let mut changed = false;
        {
            let mut options = self.options.lock().unwrap();
            match command.key.as_str() {
                "conversionrequired" => {
                    options.conversion_required = command.bool_value();
                    changed = true;
                }
                "relativetime" => {
                    options.relative_time = command.bool_value();
                    changed = true;
                }
                "realtime" => {
                    options.real_time = command.bool_value();
                    changed = true;
                }
                "device" => {
                    options.device = Some(command.value.clone());
                    changed = true;
                }
                "shdrversion" => {
                    let version = command.value.parse().unwrap_or(1);
                    debug!(source = %self.url, version, "shdr version set");
                    changed = true;
                }
                "disconnect" => return Some(ReadEnd::Disconnect),
                _ => {
                    // Unknown commands are forwarded verbatim
                    if let Err(err) = self
                        .pipeline
                        .lock()
                        .unwrap()
                        .run(Entity::Command(command))
                    {
                        warn!(source = %self.url, error = %err, "command delivery failed");
                    }
                }
            }
        }

        if changed {
            self.rebuild_pipeline();
        }
        None
    }

    /// Rebuild the transform chain with the current options. Already-parsed
    /// frames were drained through the old chain before the command line
    /// reached us, so no frame straddles the rebuild. Filter state lives in
    /// the context and carries over.
    fn rebuild_pipeline(&self) {
        let options = self.options.lock().unwrap().clone();
        self.contract.set_device(options.device.clone());
        let rebuilt = build_adapter_pipeline(&self.url, Arc::clone(&self.context), &options);
        *self.pipeline.lock().unwrap() = rebuilt;
        info!(source = %self.url, "pipeline rebuilt after option change");
    }

    async fn read_loop(&self, stream: TcpStream) -> ReadEnd {
        let framed = Framed::new(
            stream,
            LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        );
        let (mut sink, mut lines) = framed.split();

        // Probe for heartbeat support; the peer's first PONG arms it
        if sink.send("* PING".to_string()).await.is_err() {
            return ReadEnd::WriteError;
        }
        self.set_state(ConnectionState::Reading);

        let mut heartbeats_armed = false;
        let mut last_activity = Instant::now();
        let mut ticker = interval(self.config.heartbeat());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.reset();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return ReadEnd::Stopped,

                _ = ticker.tick() => {
                    if last_activity.elapsed() >= self.config.legacy_timeout() {
                        warn!(
                            source = %self.url,
                            idle_ms = last_activity.elapsed().as_millis() as u64,
                            "no activity within legacy timeout"
                        );
                        return ReadEnd::HeartbeatTimeout;
                    }
                    if heartbeats_armed
                        && sink.send("* PING".to_string()).await.is_err()
                    {
                        return ReadEnd::WriteError;
                    }
                }

                line = lines.next() => match line {
                    None => return ReadEnd::Eof,
                    Some(Err(err)) => return ReadEnd::ReadError(err.to_string()),
                    Some(Ok(line)) => {
                        last_activity = Instant::now();
                        let line = line.trim_end_matches('\r');
                        if is_pong(line) && !heartbeats_armed {
                            heartbeats_armed = true;
                            info!(source = %self.url, "heartbeat protocol armed");
                        }
                        if let Some(end) = self.process_line(line) {
                            return end;
                        }
                    }
                },
            }
        }
    }
}

#[async_trait]
impl Source for ShdrAdapter {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    async fn run(self: Arc<Self>) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            info!(source = %self.url, identity = %self.identity, "connecting");

            let connect =
                TcpStream::connect((self.config.host.as_str(), self.config.port));
            match timeout(CONNECT_TIMEOUT, connect).await {
                Ok(Ok(stream)) => {
                    self.set_state(ConnectionState::Connected);
                    info!(source = %self.url, "connected");
                    self.contract
                        .agent()
                        .source_connected(self.device().as_deref(), self.config.auto_available);

                    let end = self.read_loop(stream).await;
                    self.contract
                        .agent()
                        .source_disconnected(self.device().as_deref());

                    match end {
                        ReadEnd::Stopped => break,
                        other => {
                            warn!(source = %self.url, reason = ?other, "connection ended");
                        }
                    }
                }
                Ok(Err(err)) => {
                    warn!(source = %self.url, error = %err, "connect failed");
                }
                Err(_) => {
                    warn!(
                        source = %self.url,
                        timeout_ms = CONNECT_TIMEOUT.as_millis() as u64,
                        "connect timed out"
                    );
                }
            }

            if self.shutdown.is_cancelled() {
                break;
            }
            self.set_state(ConnectionState::Reconnecting);
            info!(
                source = %self.url,
                interval_ms = self.config.reconnect_interval().as_millis() as u64,
                "will reconnect"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_interval()) => {}
            }
        }
        self.set_state(ConnectionState::Stopped);
        info!(source = %self.url, "adapter stopped");
    }

    fn stop(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use types::{DataItemRegistry, Device, ObservedValue, Scalar};

    fn agent() -> Arc<Agent> {
        let registry = DataItemRegistry::from_devices(vec![Device {
            id: "d1".into(),
            uuid: "uuid-1".into(),
            name: "Mill-1".into(),
            data_items: vec![
                types::DataItem::event("avail", "AVAILABILITY"),
                types::DataItem::event("exec", "EXECUTION"),
            ],
        }])
        .unwrap();
        Agent::new(Arc::new(registry), 128, 16, 8, "test", false)
    }

    fn adapter_for(agent: &Arc<Agent>, port: u16) -> Arc<ShdrAdapter> {
        ShdrAdapter::new(
            Arc::clone(agent),
            AdapterConfig {
                host: "127.0.0.1".into(),
                port,
                device: Some("Mill-1".into()),
                auto_available: true,
                reconnect_interval_ms: 50,
                ..AdapterConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn connects_reads_and_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let agent = agent();
        agent.seed_unavailable();

        let adapter = adapter_for(&agent, port);
        let handle = tokio::spawn(Arc::clone(&adapter).run());

        // First connection: answer the PING, send one observation, drop.
        {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            assert_eq!(Some("* PING".to_string()), lines.next_line().await.unwrap());
            write.write_all(b"* PONG 60000\n").await.unwrap();
            write
                .write_all(b"2021-01-19T12:00:00Z|exec|ACTIVE\n")
                .await
                .unwrap();
            write.flush().await.unwrap();
            // Wait for delivery before dropping the socket
            tokio::time::timeout(Duration::from_secs(2), async {
                loop {
                    let current = agent.buffer().current(None, None).unwrap();
                    let exec = current.iter().find(|o| o.data_item_id == "exec").unwrap();
                    if exec.value
                        == ObservedValue::Scalar(Scalar::Text("ACTIVE".into()))
                    {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("observation delivered");
        }

        // After the drop the adapter reconnects and the items went
        // unavailable in between.
        let (_socket, _) = listener.accept().await.unwrap();
        let current = agent.buffer().current(None, None).unwrap();
        let exec = current.iter().find(|o| o.data_item_id == "exec").unwrap();
        assert!(exec.is_unavailable());

        adapter.stop();
        handle.await.unwrap();
        assert_eq!(ConnectionState::Stopped, adapter.state());
    }

    #[tokio::test]
    async fn disconnect_command_forces_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let agent = agent();
        let adapter = adapter_for(&agent, port);
        let handle = tokio::spawn(Arc::clone(&adapter).run());

        {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            lines.next_line().await.unwrap();
            write.write_all(b"* disconnect: now\n").await.unwrap();
            write.flush().await.unwrap();
            // Keep the socket open; the adapter drops it from its side
            let (_next, _) = listener.accept().await.unwrap();
        }

        adapter.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn commands_rebuild_options() {
        let agent = agent();
        let adapter = adapter_for(&agent, 1);

        adapter.process_command("* relativeTime: yes");
        assert!(adapter.options.lock().unwrap().relative_time);

        adapter.process_command("* conversionRequired: no");
        assert!(!adapter.options.lock().unwrap().conversion_required);

        adapter.process_command("* device: Mill-2");
        assert_eq!(
            Some("Mill-2".to_string()),
            adapter.options.lock().unwrap().device
        );

        assert_eq!(
            Some(ReadEnd::Disconnect),
            adapter.process_command("* disconnect: ")
        );
    }
}
