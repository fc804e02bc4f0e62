//! Pipeline construction
//!
//! Builds the fixed transform chains. The stage set and order are driven by
//! the source kind; filter behavior is driven by data-item metadata, so the
//! filters are always present.

use std::sync::Arc;

use crate::context::PipelineContext;
use crate::delivery::{
    DeliverAssetCommands, DeliverAssetEvents, DeliverCommands, DeliverObservations,
};
use crate::filters::{DeltaFilter, DuplicateFilter, PeriodFilter, UnitConverter};
use crate::shdr::{MapperOptions, ShdrTokenMapper, TimestampTransform, TokenizerTransform};
use crate::upstream::MTConnectXmlTransform;
use crate::Pipeline;

/// Options a source pipeline is built with. Rebuilt pipelines share their
/// context, so filter state and time baselines survive option changes.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Device bare data-item keys resolve against
    pub device: Option<String>,
    /// Interpret leading timestamps as relative offsets
    pub relative_time: bool,
    /// Stamp frames with the agent clock instead of adapter timestamps
    pub real_time: bool,
    /// Apply native-unit conversion
    pub conversion_required: bool,
    /// Uppercase event values
    pub upcase_values: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            device: None,
            relative_time: false,
            real_time: false,
            conversion_required: true,
            upcase_values: false,
        }
    }
}

/// The SHDR adapter chain: tokenize, timestamp, map, filter, convert,
/// deliver.
pub fn build_adapter_pipeline(
    source: &str,
    context: Arc<PipelineContext>,
    options: &PipelineOptions,
) -> Pipeline {
    TimestampTransform::extractor(&context)
        .lock()
        .unwrap()
        .set_relative_time(options.relative_time);

    let mut pipeline = Pipeline::new(source, context);
    pipeline
        .bind(Box::new(TokenizerTransform))
        .bind(Box::new(TimestampTransform::new().with_real_time(options.real_time)))
        .bind(Box::new(ShdrTokenMapper::new(MapperOptions {
            device: options.device.clone(),
            upcase_values: options.upcase_values,
        })))
        .bind(Box::new(DuplicateFilter))
        .bind(Box::new(DeltaFilter))
        .bind(Box::new(PeriodFilter));
    if options.conversion_required {
        pipeline.bind(Box::new(UnitConverter));
    }
    pipeline
        .bind(Box::new(DeliverAssetCommands))
        .bind(Box::new(DeliverObservations))
        .bind(Box::new(DeliverCommands));
    pipeline
}

/// The upstream-agent chain: parse the document, deliver everything it
/// yields. Duplicate suppression already happened on the peer.
pub fn build_upstream_pipeline(source: &str, context: Arc<PipelineContext>) -> Pipeline {
    let mut pipeline = Pipeline::new(source, context);
    pipeline
        .bind(Box::new(MTConnectXmlTransform))
        .bind(Box::new(DeliverObservations))
        .bind(Box::new(DeliverAssetCommands))
        .bind(Box::new(DeliverAssetEvents));
    pipeline
}
