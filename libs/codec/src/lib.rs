//! # Agent Wire Codec
//!
//! Decoding rules for everything the agent reads off the wire:
//!
//! - SHDR lines: pipe-delimited frames with quote/escape handling and
//!   `--multiline--` capture ([`tokenizer`])
//! - leading timestamps, `@duration` suffixes, and relative-time adjustment
//!   ([`timestamp`])
//! - `* key: value` protocol commands ([`command`])
//! - Streams/Assets/Errors documents fetched from an upstream agent
//!   ([`response`])
//!
//! This crate only parses. Delivery, filtering, and storage decisions
//! belong to `pipeline` and the service.

pub mod command;
pub mod error;
pub mod response;
pub mod timestamp;
pub mod tokenizer;

pub use command::ProtocolCommand;
pub use error::ParseError;
pub use response::{DocumentError, ResponseDocument, UpstreamSample};
pub use timestamp::{Timestamped, TimestampExtractor};
pub use tokenizer::{ShdrTokenizer, Tokens};

/// Result type for decode operations
pub type Result<T> = std::result::Result<T, ParseError>;
