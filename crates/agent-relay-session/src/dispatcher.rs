//! Outbound dispatcher.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
};

use agent_relay_core::{
    AgentHandle, AgentId, AgentRegistry, CommandEnvelope, Confirmation, CryptoProvider,
    Submission, Transport,
    traits::{CryptoError, TransportError},
};
use agent_relay_transport::{CodecError, encode_envelope};
use thiserror::Error;
use tokio::sync::Mutex;

/// Outbound send error.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),
    #[error("Serialization error: {0}")]
    Serialization(#[from] CodecError),
    #[error("Encryption error: {0}")]
    Encrypt(#[from] CryptoError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Sends commands to registered agents.
///
/// Three locks order every send, always taken in this order:
/// - the agent's send lock covers `out_seq` reservation through
///   submission, so sends to one agent leave in sequence order;
/// - the agent's record lock is held only to read the key and bump
///   `out_seq`, never across the transport round trip, so the inbound
///   consumer is never stalled by an outbound send;
/// - the transport token lock covers token assignment and submission, so
///   submissions reach the transport in token order.
pub struct Dispatcher<R, T, C> {
    registry: Arc<R>,
    transport: Arc<T>,
    crypto: Arc<C>,
    next_token: Mutex<u64>,
    send_locks: StdMutex<HashMap<AgentId, Arc<Mutex<()>>>>,
}

impl<R, T, C> Dispatcher<R, T, C>
where
    R: AgentRegistry,
    T: Transport,
    C: CryptoProvider,
{
    /// Create a dispatcher whose first submission uses `initial_token`.
    #[must_use]
    pub fn new(registry: Arc<R>, transport: Arc<T>, crypto: Arc<C>, initial_token: u64) -> Self {
        Self {
            registry,
            transport,
            crypto,
            next_token: Mutex::new(initial_token),
            send_locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Token the next submission will carry.
    pub async fn next_ordering_token(&self) -> u64 {
        *self.next_token.lock().await
    }

    /// Send `payload` to `agent_id` as command `msg_id`.
    ///
    /// Unknown agents are rejected before any transport interaction; only
    /// inbound traffic registers agents. Once a sequence number and token
    /// are assigned they are consumed even if the submission fails.
    ///
    /// # Errors
    /// Returns `AgentNotFound`, `Serialization`, `Encrypt`, or the
    /// transport's error unchanged.
    pub async fn send(
        &self,
        agent_id: &str,
        payload: &str,
        msg_id: i64,
    ) -> Result<Confirmation, SendError> {
        let handle = self
            .registry
            .lookup(agent_id)
            .await
            .ok_or_else(|| SendError::AgentNotFound(agent_id.to_owned()))?;

        let wire = encode_envelope(&CommandEnvelope {
            agent_id: agent_id.to_owned(),
            msg_id,
            data: payload.to_owned(),
        })?;

        let send_lock = self.send_lock(agent_id);
        let result = {
            let _sending = send_lock.lock().await;
            self.submit_in_order(&handle, agent_id, wire, msg_id).await
        };
        self.release_send_lock(agent_id, &send_lock);
        result
    }

    /// Reserve `out_seq` and a token, then submit. Caller holds the agent's
    /// send lock.
    async fn submit_in_order(
        &self,
        handle: &AgentHandle,
        agent_id: &str,
        wire: String,
        msg_id: i64,
    ) -> Result<Confirmation, SendError> {
        let (payload, encrypted, seq) = {
            let mut agent = handle.lock().await;
            let (payload, encrypted) = match &agent.session_key {
                Some(key) => (self.crypto.symmetric_encrypt(wire.as_bytes(), key)?, true),
                None => (wire, false),
            };
            (payload, encrypted, agent.next_out_seq())
        };

        let mut next_token = self.next_token.lock().await;
        let ordering_token = *next_token;
        *next_token += 1;

        let submission = Submission {
            agent_id: agent_id.to_owned(),
            seq,
            payload,
            ordering_token,
            final_fragment: true,
            encrypted,
        };
        let result = self.transport.submit(submission).await;
        drop(next_token);

        match result {
            Ok(confirmation) => {
                tracing::debug!(agent_id, seq, ordering_token, msg_id, encrypted, "sent command");
                Ok(confirmation)
            }
            Err(e) => {
                tracing::warn!(agent_id, seq, ordering_token, "submission failed: {e}");
                Err(e.into())
            }
        }
    }

    fn send_lock(&self, agent_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.send_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(agent_id.to_owned()).or_default())
    }

    /// Drop the agent's send lock once no other sender holds or awaits it.
    fn release_send_lock(&self, agent_id: &str, lock: &Arc<Mutex<()>>) {
        let mut locks = self.send_locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one held by the caller.
        if Arc::strong_count(lock) == 2 {
            locks.remove(agent_id);
        }
    }
}
