//! Upstream agent source
//!
//! Mirrors a peer MTConnect agent: seed from its Current document, then
//! poll Sample from the tracked `nextSequence`. A changed `instanceId`
//! or an upstream OUT_OF_RANGE answer resets the cursor and re-seeds.
//! Asset change notifications trigger a fetch of the asset body, which
//! flows back through the same pipeline as an Assets document.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use config::UpstreamConfig;
use pipeline::{
    build_upstream_pipeline, Entity, Pipeline, PipelineContext, PipelineContract, UpstreamState,
};
use types::AssetEventKind;

use crate::agent::{Agent, SourceContract};
use crate::error::ServiceError;
use crate::source::{source_identity, ConnectionState, Source};
use crate::Result;

/// One HTTP exchange with the peer agent. Separated from the driver so
/// tests can script document sequences.
#[async_trait]
pub trait Session: Send + Sync {
    /// Fetch a path + query relative to the agent base URL, returning the
    /// response body regardless of HTTP status (error documents arrive on
    /// 4xx answers).
    async fn fetch(&self, path_and_query: &str) -> Result<String>;
}

/// Polling HTTP session over reqwest
pub struct HttpSession {
    client: reqwest::Client,
    base: Url,
    source_name: String,
}

impl HttpSession {
    pub fn new(base_url: &str) -> Result<Self> {
        let base = Url::parse(base_url)?;
        Ok(Self {
            client: reqwest::Client::new(),
            source_name: base_url.to_string(),
            base,
        })
    }
}

#[async_trait]
impl Session for HttpSession {
    async fn fetch(&self, path_and_query: &str) -> Result<String> {
        let url = self
            .base
            .join(path_and_query)
            .map_err(ServiceError::Url)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| ServiceError::transport(&self.source_name, err))?;
        response
            .text()
            .await
            .map_err(|err| ServiceError::transport(&self.source_name, err))
    }
}

/// Driver for one upstream agent
pub struct AgentSource {
    config: UpstreamConfig,
    identity: String,
    contract: Arc<SourceContract>,
    pipeline: Pipeline,
    upstream: Arc<UpstreamState>,
    session: Arc<dyn Session>,
    state: Mutex<ConnectionState>,
    shutdown: CancellationToken,
}

impl AgentSource {
    pub fn new(
        agent: Arc<Agent>,
        config: UpstreamConfig,
        session: Arc<dyn Session>,
    ) -> Arc<Self> {
        let identity = source_identity(&config.url, 0, &[]);
        let contract = SourceContract::new(agent, config.device.clone());
        let context = PipelineContext::new(
            config.url.clone(),
            Arc::clone(&contract) as Arc<dyn pipeline::PipelineContract>,
        );
        let upstream = UpstreamState::cell(&context);
        let pipeline = build_upstream_pipeline(&config.url, context);

        Arc::new(Self {
            config,
            identity,
            contract,
            pipeline,
            upstream,
            session,
            state: Mutex::new(ConnectionState::Idle),
            shutdown: CancellationToken::new(),
        })
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Feed one fetched document. Reseed-class failures clear the cursor.
    fn ingest(&self, body: String) -> bool {
        match self.pipeline.run(Entity::Raw { line: body }) {
            Ok(()) => true,
            Err(err) if err.requires_reseed() => {
                warn!(source = %self.config.url, error = %err, "reseeding from current");
                self.upstream.reset();
                false
            }
            Err(err) => {
                warn!(source = %self.config.url, error = %err, "dropped upstream document");
                true
            }
        }
    }

    async fn drain_asset_events(&self) {
        for event in self.contract.take_asset_events() {
            match event.kind {
                AssetEventKind::Changed => {
                    match self.session.fetch(&format!("asset/{}", event.asset_id)).await {
                        Ok(body) => {
                            self.ingest(body);
                        }
                        Err(err) => {
                            warn!(
                                source = %self.config.url,
                                asset_id = %event.asset_id,
                                error = %err,
                                "asset fetch failed"
                            );
                        }
                    }
                }
                AssetEventKind::Removed => {
                    self.contract.deliver_asset_command(types::AssetCommand::Remove {
                        asset_id: event.asset_id,
                        timestamp: event.timestamp,
                    });
                }
            }
        }
    }

    /// One poll turn: seed when the cursor is unset, sample otherwise.
    async fn poll_once(&self) -> Result<()> {
        let request = match self.upstream.next() {
            None => "current".to_string(),
            Some(next) => format!("sample?from={}&count={}", next, self.config.count),
        };
        debug!(source = %self.config.url, request = %request, "fetching");
        let body = self.session.fetch(&request).await?;
        self.ingest(body);
        self.drain_asset_events().await;
        Ok(())
    }
}

#[async_trait]
impl Source for AgentSource {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    async fn run(self: Arc<Self>) {
        info!(source = %self.config.url, identity = %self.identity, "upstream source starting");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            self.set_state(ConnectionState::Reading);

            let wait = match self.poll_once().await {
                Ok(()) => self.config.poll_interval(),
                Err(err) => {
                    warn!(source = %self.config.url, error = %err, "upstream fetch failed");
                    self.set_state(ConnectionState::Reconnecting);
                    self.config.reconnect_interval()
                }
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        self.set_state(ConnectionState::Stopped);
        info!(source = %self.config.url, "upstream source stopped");
    }

    fn stop(&self) {
        self.shutdown.cancel();
    }
}
