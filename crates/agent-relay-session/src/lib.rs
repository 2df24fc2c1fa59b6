//! Session orchestration for event-log agents.
//!
//! Provides:
//! - `MemoryRegistry` - In-memory agent store with optional eviction
//! - `InboundPipeline` - Dedup, reassembly, decryption of transport events
//! - `Dispatcher` - Sequenced, ordered outbound sends
//! - `RelayServer` - Wires the above to a transport and crypto provider
//! - `RelayConfig` - TOML configuration

pub mod config;
pub mod dispatcher;
pub mod inbound;
pub mod registry;
pub mod server;

pub use config::RelayConfig;
pub use dispatcher::{Dispatcher, SendError};
pub use inbound::{DropReason, InboundPipeline, InboundStats, InboundStatsSnapshot};
#[cfg(feature = "memory")]
pub use registry::MemoryRegistry;
pub use registry::EvictionPolicy;
pub use server::{RelayServer, ServerError};
