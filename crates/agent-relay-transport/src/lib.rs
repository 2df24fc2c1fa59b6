//! Transport layer for agent sessions.
//!
//! Provides:
//! - Wire protocol (JSON envelope + fragmentation)
//! - Agent-side endpoint for producing and opening traffic
//! - In-process event-log transport (feature: memory)

pub mod endpoint;
pub mod protocol;

#[cfg(feature = "memory")]
pub mod memory;

pub use endpoint::{AgentEndpoint, EndpointError};
#[cfg(feature = "memory")]
pub use memory::MemoryTransport;
pub use protocol::{CodecError, decode_envelope, encode_envelope, fragment};
