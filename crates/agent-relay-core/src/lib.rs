//! Core abstractions for event-log agent sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `Agent` - Per-agent session state (sequence watermarks, fragment buffer, key)
//! - `CommandEnvelope` / `TransportEvent` - Logical and transport units
//! - `CommandFeed` - Broadcast + history sink for decoded commands
//! - Registry, Transport and Crypto traits

pub mod command_feed;
pub mod traits;
pub mod types;

pub use command_feed::CommandFeed;
pub use traits::{AgentRegistry, CryptoProvider, Transport};
pub use types::{
    Agent, AgentHandle, AgentId, AgentSnapshot, CommandEnvelope, Confirmation, Keypair,
    SessionKey, SessionStatus, Submission, TransportEvent,
};
