//! SysBlock Relay Library
//!
//! This crate provides components for watching new Bitcoin blocks, detecting
//! the "sys" marker in coinbase and OP_RETURN data, attributing the mining
//! pool, and relaying matches to WebSocket subscribers.

pub mod api;
pub mod config;
pub mod filter;
pub mod inspector;
pub mod provider;
pub mod publisher;
pub mod relay;
pub mod script;
pub mod store;
pub mod upstream;

// Re-export commonly used types
pub use filter::{attribute_pool, contains_marker, PoolInfo};
pub use inspector::{BlockInspector, MatchLocation, MatchRecord};
pub use provider::{BlockSource, HttpBlockSource};
pub use publisher::{ClientRequest, RelayMessage, SubscriberHub};
pub use relay::Relay;
pub use script::extract_payload_after_marker;
pub use store::ResultStore;
pub use upstream::{ConnectionState, UpstreamFeed};
