//! Terminal delivery stages
//!
//! The last transforms of every pipeline: hand finished entities to the
//! contract sinks. Each returns no entities, ending the chain.

use crate::context::PipelineContext;
use crate::{Entity, Result, Transform};

/// Delivers observations to the observation sink
pub struct DeliverObservations;

impl Transform for DeliverObservations {
    fn name(&self) -> &'static str {
        "DeliverObservations"
    }

    fn accepts(&self, entity: &Entity) -> bool {
        matches!(entity, Entity::Observations(_))
    }

    fn apply(&self, entity: Entity, context: &PipelineContext) -> Result<Vec<Entity>> {
        if let Entity::Observations(observations) = entity {
            for obs in observations {
                context.contract.deliver_observation(obs);
            }
        }
        Ok(vec![])
    }
}

/// Delivers asset commands to the asset sink
pub struct DeliverAssetCommands;

impl Transform for DeliverAssetCommands {
    fn name(&self) -> &'static str {
        "DeliverAssetCommands"
    }

    fn accepts(&self, entity: &Entity) -> bool {
        matches!(entity, Entity::AssetCommands(_))
    }

    fn apply(&self, entity: Entity, context: &PipelineContext) -> Result<Vec<Entity>> {
        if let Entity::AssetCommands(commands) = entity {
            for command in commands {
                context.contract.deliver_asset_command(command);
            }
        }
        Ok(vec![])
    }
}

/// Delivers upstream asset notifications
pub struct DeliverAssetEvents;

impl Transform for DeliverAssetEvents {
    fn name(&self) -> &'static str {
        "DeliverAssetEvents"
    }

    fn accepts(&self, entity: &Entity) -> bool {
        matches!(entity, Entity::AssetEvents(_))
    }

    fn apply(&self, entity: Entity, context: &PipelineContext) -> Result<Vec<Entity>> {
        if let Entity::AssetEvents(events) = entity {
            for event in events {
                context.contract.deliver_asset_event(event);
            }
        }
        Ok(vec![])
    }
}

/// Forwards unhandled protocol commands to the command handler
pub struct DeliverCommands;

impl Transform for DeliverCommands {
    fn name(&self) -> &'static str {
        "DeliverCommands"
    }

    fn accepts(&self, entity: &Entity) -> bool {
        matches!(entity, Entity::Command(_))
    }

    fn apply(&self, entity: Entity, context: &PipelineContext) -> Result<Vec<Entity>> {
        if let Entity::Command(command) = entity {
            let source = context.source().to_string();
            context.contract.deliver_command(command, &source);
        }
        Ok(vec![])
    }
}
