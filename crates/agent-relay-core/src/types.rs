//! Session data model shared by the registry, pipeline and dispatcher.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::traits::SessionError;

/// Opaque, stable agent identifier.
pub type AgentId = String;

/// Shared handle to one agent record.
///
/// The mutex guards the record itself. Hold it only for short state
/// updates, never across a transport round trip: the inbound consumer
/// needs it for every event from this agent.
pub type AgentHandle = Arc<Mutex<Agent>>;

/// Session lifecycle state. Only ever advances forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No session key negotiated yet.
    Handshake,
    /// Session key negotiated; traffic is encrypted.
    Active,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handshake => f.write_str("handshake"),
            Self::Active => f.write_str("active"),
        }
    }
}

/// Symmetric session key material, wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey(Vec<u8>);

impl SessionKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub const fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey(<{} bytes>)", self.0.len())
    }
}

/// Asymmetric keypair in provider-defined encoding.
#[derive(Clone)]
pub struct Keypair {
    /// Public half, safe to publish to agents.
    pub public: Vec<u8>,
    secret: Zeroizing<Vec<u8>>,
}

impl Keypair {
    /// Build a keypair from its public and secret halves.
    #[must_use]
    pub fn new(public: Vec<u8>, secret: Vec<u8>) -> Self {
        Self {
            public,
            secret: Zeroizing::new(secret),
        }
    }

    /// Secret half.
    #[must_use]
    pub fn secret(&self) -> &[u8] {
        &self.secret
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public_len", &self.public.len())
            .finish_non_exhaustive()
    }
}

/// One remote participant and its session state.
#[derive(Debug)]
pub struct Agent {
    /// Unique key in the registry.
    pub agent_id: AgentId,
    /// Unix epoch seconds of the last accepted inbound event.
    pub last_seen: i64,
    /// Highest accepted inbound sequence number (anti-replay watermark).
    pub in_seq: u64,
    /// Last outbound sequence number used.
    pub out_seq: u64,
    /// Fragments of the logical message currently being reassembled.
    pub data_buffer: String,
    /// Negotiated symmetric key, fixed once set.
    pub session_key: Option<SessionKey>,
    /// Lifecycle state.
    pub status: SessionStatus,
    /// User the agent reports running as.
    pub current_user: Option<String>,
    /// Hostname the agent reports.
    pub hostname: Option<String>,
}

impl Agent {
    /// Fresh record in the `Handshake` state.
    #[must_use]
    pub fn new(agent_id: impl Into<AgentId>, now: i64) -> Self {
        Self {
            agent_id: agent_id.into(),
            last_seen: now,
            in_seq: 0,
            out_seq: 0,
            data_buffer: String::new(),
            session_key: None,
            status: SessionStatus::Handshake,
            current_user: None,
            hostname: None,
        }
    }

    /// Accept an inbound fragment if `seq` is above the watermark.
    ///
    /// Returns `false` (and leaves the record untouched) for duplicates and
    /// stale events.
    pub fn accept_fragment(&mut self, seq: u64, fragment: &str, now: i64) -> bool {
        if seq <= self.in_seq {
            return false;
        }
        self.in_seq = seq;
        self.last_seen = now;
        self.data_buffer.push_str(fragment);
        true
    }

    /// Take the reassembled buffer, leaving it empty.
    pub fn take_buffer(&mut self) -> String {
        std::mem::take(&mut self.data_buffer)
    }

    /// Reserve the next outbound sequence number.
    pub const fn next_out_seq(&mut self) -> u64 {
        self.out_seq += 1;
        self.out_seq
    }

    /// Move the lifecycle forward. Moving to the current state is a no-op.
    ///
    /// # Errors
    /// Returns `SessionError::StatusRegression` when `to` precedes the
    /// current state.
    pub fn advance_status(&mut self, to: SessionStatus) -> Result<(), SessionError> {
        if to < self.status {
            return Err(SessionError::StatusRegression {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Install the negotiated session key and mark the session active.
    ///
    /// # Errors
    /// Returns `SessionError::KeyAlreadyNegotiated` if a key is already set.
    pub fn install_session_key(&mut self, key: SessionKey) -> Result<(), SessionError> {
        if self.session_key.is_some() {
            return Err(SessionError::KeyAlreadyNegotiated(self.agent_id.clone()));
        }
        self.session_key = Some(key);
        self.advance_status(SessionStatus::Active)
    }
}

/// Read-only view of an agent for listings. Carries no key material and no
/// buffered payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentSnapshot {
    pub agent_id: AgentId,
    pub last_seen: i64,
    pub in_seq: u64,
    pub out_seq: u64,
    pub status: SessionStatus,
    pub current_user: Option<String>,
    pub hostname: Option<String>,
    /// Whether a session key has been negotiated.
    pub has_session_key: bool,
    /// Bytes of a partially reassembled message.
    pub buffered_bytes: usize,
}

impl From<&Agent> for AgentSnapshot {
    fn from(agent: &Agent) -> Self {
        Self {
            agent_id: agent.agent_id.clone(),
            last_seen: agent.last_seen,
            in_seq: agent.in_seq,
            out_seq: agent.out_seq,
            status: agent.status,
            current_user: agent.current_user.clone(),
            hostname: agent.hostname.clone(),
            has_session_key: agent.session_key.is_some(),
            buffered_bytes: agent.data_buffer.len(),
        }
    }
}

/// Logical unit of communication, serialized as the wire envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(rename = "agentID")]
    pub agent_id: AgentId,
    #[serde(rename = "msgID")]
    pub msg_id: i64,
    pub data: String,
}

/// One unit carried by the transport; many may compose one envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportEvent {
    pub agent_id: AgentId,
    pub seq: u64,
    pub data: String,
    /// Last fragment of a logical message.
    #[serde(rename = "final")]
    pub final_fragment: bool,
    pub encrypted: bool,
}

/// Outbound payload handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub agent_id: AgentId,
    /// Per-agent outbound sequence number.
    pub seq: u64,
    pub payload: String,
    /// Transport-level ordering token (nonce).
    pub ordering_token: u64,
    pub final_fragment: bool,
    pub encrypted: bool,
}

impl Submission {
    /// View the submission as the event an agent will observe.
    #[must_use]
    pub fn to_event(&self) -> TransportEvent {
        TransportEvent {
            agent_id: self.agent_id.clone(),
            seq: self.seq,
            data: self.payload.clone(),
            final_fragment: self.final_fragment,
            encrypted: self.encrypted,
        }
    }
}

/// Acknowledgement returned by the transport for an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub ordering_token: u64,
    /// Transport-specific receipt (transaction hash, log offset, ...).
    pub receipt: String,
}
