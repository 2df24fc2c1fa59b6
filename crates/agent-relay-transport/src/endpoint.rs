//! Agent-side endpoint: frames outgoing envelopes and opens server traffic.

use agent_relay_core::{
    AgentId, CommandEnvelope, CryptoProvider, SessionKey, TransportEvent, traits::CryptoError,
};
use thiserror::Error;

use crate::protocol::{CodecError, decode_envelope, encode_envelope, fragment};

/// Endpoint error.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Encrypted traffic but no session key")]
    MissingSessionKey,
}

/// The agent's half of a session.
///
/// Produces the fragmented, optionally encrypted transport events an agent
/// writes, and decodes the events a server sends back.
pub struct AgentEndpoint<C> {
    agent_id: AgentId,
    crypto: C,
    session_key: Option<SessionKey>,
    next_seq: u64,
    max_fragment: usize,
}

impl<C: CryptoProvider> AgentEndpoint<C> {
    /// Create an endpoint that sends unfragmented, cleartext events.
    #[must_use]
    pub fn new(agent_id: impl Into<AgentId>, crypto: C) -> Self {
        Self {
            agent_id: agent_id.into(),
            crypto,
            session_key: None,
            next_seq: 1,
            max_fragment: 0,
        }
    }

    /// Split payloads into fragments of at most `max_fragment` bytes.
    #[must_use]
    pub const fn with_max_fragment(mut self, max_fragment: usize) -> Self {
        self.max_fragment = max_fragment;
        self
    }

    /// Encrypt subsequent traffic with `key`.
    pub fn set_session_key(&mut self, key: SessionKey) {
        self.session_key = Some(key);
    }

    /// Agent identifier.
    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Sequence number the next event will carry.
    #[must_use]
    pub const fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Frame a command as transport events with fresh sequence numbers.
    ///
    /// # Errors
    /// Returns error if serialization or encryption fails.
    pub fn frame(&mut self, msg_id: i64, data: &str) -> Result<Vec<TransportEvent>, EndpointError> {
        let envelope = CommandEnvelope {
            agent_id: self.agent_id.clone(),
            msg_id,
            data: data.to_owned(),
        };
        let wire = encode_envelope(&envelope)?;

        let (payload, encrypted) = match &self.session_key {
            Some(key) => (self.crypto.symmetric_encrypt(wire.as_bytes(), key)?, true),
            None => (wire, false),
        };

        let parts = fragment(&payload, self.max_fragment);
        let last = parts.len() - 1;
        let events = parts
            .into_iter()
            .enumerate()
            .map(|(i, data)| {
                let seq = self.next_seq;
                self.next_seq += 1;
                TransportEvent {
                    agent_id: self.agent_id.clone(),
                    seq,
                    data,
                    final_fragment: i == last,
                    encrypted,
                }
            })
            .collect();
        Ok(events)
    }

    /// Decode a single-fragment event sent by the server.
    ///
    /// # Errors
    /// Returns error if decryption or parsing fails.
    pub fn open(&self, event: &TransportEvent) -> Result<CommandEnvelope, EndpointError> {
        if event.encrypted {
            let key = self
                .session_key
                .as_ref()
                .ok_or(EndpointError::MissingSessionKey)?;
            let plain = self.crypto.symmetric_decrypt(&event.data, key)?;
            Ok(decode_envelope(&plain)?)
        } else {
            Ok(decode_envelope(event.data.as_bytes())?)
        }
    }
}
