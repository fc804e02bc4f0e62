//! # Transform Pipeline
//!
//! Per-source chain of transforms that turns raw payloads into typed
//! observations and asset commands. Each transform declares the entity
//! kinds it accepts; an entity flows through the chain in bind order and is
//! handled by the first transform that accepts it, with that transform's
//! output continuing down the remainder of the chain. Returning no entities
//! drops the item.
//!
//! Transforms are synchronous and side-effect-free except through the
//! shared [`PipelineContext`], which survives pipeline rebuilds so
//! duplicate-suppression state, relative-time baselines, and the upstream
//! `next` cursor carry across option changes.

pub mod builder;
pub mod context;
pub mod delivery;
pub mod error;
pub mod filters;
pub mod shdr;
pub mod units;
pub mod upstream;

use std::sync::Arc;

use tracing::debug;

pub use builder::{build_adapter_pipeline, build_upstream_pipeline, PipelineOptions};
pub use context::{PipelineContext, PipelineContract};
pub use error::PipelineError;
pub use shdr::ShdrTokenMapper;
pub use units::UnitConversion;
pub use upstream::UpstreamState;

use codec::{ProtocolCommand, Timestamped, Tokens};
use types::{AssetCommand, AssetEvent, Observation};

/// Result type for transform operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// The entity kinds that flow between transforms
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    /// One raw line or payload from a source
    Raw { line: String },
    Tokens(Tokens),
    Timestamped(Timestamped),
    Observations(Vec<Observation>),
    AssetCommands(Vec<AssetCommand>),
    AssetEvents(Vec<AssetEvent>),
    Command(ProtocolCommand),
}

/// One node of the pipeline
pub trait Transform: Send + Sync {
    fn name(&self) -> &'static str;

    /// Type guard: the entity kinds this transform consumes
    fn accepts(&self, entity: &Entity) -> bool;

    /// Consume one entity, producing zero or more downstream entities.
    fn apply(&self, entity: Entity, context: &PipelineContext) -> Result<Vec<Entity>>;
}

/// An ordered transform chain bound to one source
pub struct Pipeline {
    source: String,
    stages: Vec<Box<dyn Transform>>,
    context: Arc<PipelineContext>,
}

impl Pipeline {
    pub fn new(source: impl Into<String>, context: Arc<PipelineContext>) -> Self {
        Self {
            source: source.into(),
            stages: Vec::new(),
            context,
        }
    }

    /// Append a transform; bind order is dispatch order.
    pub fn bind(&mut self, transform: Box<dyn Transform>) -> &mut Self {
        self.stages.push(transform);
        self
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.context
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Run one entity through the chain.
    ///
    /// A transform error drops the entity being processed and surfaces the
    /// error to the caller; entities already produced by earlier stages
    /// keep flowing. Entities no stage accepts are silently discarded.
    pub fn run(&self, entity: Entity) -> Result<()> {
        let mut pending = vec![entity];
        let mut first_error = None;

        for stage in &self.stages {
            let mut next = Vec::with_capacity(pending.len());
            for entity in pending {
                if stage.accepts(&entity) {
                    match stage.apply(entity, &self.context) {
                        Ok(produced) => next.extend(produced),
                        Err(err) => {
                            debug!(
                                source = %self.source,
                                stage = stage.name(),
                                error = %err,
                                "transform dropped entity"
                            );
                            if first_error.is_none() {
                                first_error = Some(err);
                            }
                        }
                    }
                } else {
                    next.push(entity);
                }
            }
            pending = next;
            if pending.is_empty() {
                break;
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Feed one raw line from the source.
    pub fn feed_line(&self, line: &str) -> Result<()> {
        self.run(Entity::Raw { line: line.to_string() })
    }
}
