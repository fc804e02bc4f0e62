//! # Agent Type System
//!
//! Shared type definitions for the MTConnect agent: the observation model,
//! the data-item metadata consumed from the device model, the asset model,
//! and the registry used to resolve incoming data to recognized channels.
//!
//! ## Design Philosophy
//!
//! - **Tagged sum types over entity trees**: observed values are a closed
//!   enum ([`ObservedValue`]), not a dynamically-typed property bag.
//!   Validation lives in typed constructors returning `Result`.
//! - **Immutable metadata**: [`DataItem`] and [`Device`] are read-only once
//!   the registry is built; lookups after startup need no locking.
//! - **No wire concerns**: parsing and serialization of transport formats
//!   live in `codec` and the service formatters, not here.

pub mod asset;
pub mod condition;
pub mod data_item;
pub mod error;
pub mod observation;
pub mod registry;
pub mod time;

pub use asset::{Asset, AssetCommand, AssetEvent, AssetEventKind};
pub use condition::ConditionSet;
pub use data_item::{Category, DataItem, DataItemFilter, FilterKind, Representation};
pub use error::ModelError;
pub use observation::{
    Condition, ConditionLevel, DataSet, DataSetEntry, ObservedValue, Observation, Scalar,
};
pub use registry::{DataItemRegistry, Device};
pub use time::{format_timestamp, Timestamp};

/// Result type alias for model construction and registry operations
pub type Result<T> = std::result::Result<T, ModelError>;

/// Sequence number assigned by the observation buffer
pub type SequenceNumber = u64;

/// Sequence value meaning "not yet signaled" for change observers
pub const UNSIGNALED: SequenceNumber = u64::MAX;
