//! # Observation and Asset Buffers
//!
//! In-memory bounded storage for everything the agent serves:
//!
//! - [`CircularBuffer`]: the sequence-numbered observation ring with
//!   per-item latest tracking and periodic checkpoints for historical
//!   Current reconstruction
//! - [`AssetBuffer`]: the bounded keyed asset store with type/device
//!   secondary indexes and tombstone counting
//! - [`ChangeSignaler`] / [`ChangeObserver`]: the wakeup mechanism that
//!   long-poll streaming builds on
//!
//! All mutation happens under the buffers' own locks; readers receive
//! owned `Arc` copies and never pin slots.

pub mod asset;
pub mod checkpoint;
pub mod circular;
pub mod error;
pub mod observer;

pub use asset::AssetBuffer;
pub use checkpoint::Checkpoint;
pub use circular::{CircularBuffer, SampleResult};
pub use error::BufferError;
pub use observer::{ChangeObserver, ChangeSignaler};

/// Result type for buffer operations
pub type Result<T> = std::result::Result<T, BufferError>;
