//! Inbound reassembly pipeline.
//!
//! Turns the transport's event stream into decoded commands:
//! sequence-gated dedup per agent, fragment reassembly, optional decryption,
//! envelope parsing. Failed messages are dropped and counted, never emitted.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use agent_relay_core::{
    Agent, AgentRegistry, CommandEnvelope, CommandFeed, CryptoProvider, TransportEvent,
    traits::{CryptoError, EventStream, TransportError},
};
use agent_relay_transport::{CodecError, decode_envelope};
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::registry::now;

/// Why a completed inbound message produced no command.
#[derive(Debug, Error)]
pub enum DropReason {
    #[error("encrypted message but no session key negotiated")]
    MissingSessionKey,
    #[error("decryption failed: {0}")]
    Decrypt(#[from] CryptoError),
    #[error("envelope decode failed: {0}")]
    Decode(#[from] CodecError),
}

/// Inbound counters, updated lock-free.
#[derive(Debug, Default)]
pub struct InboundStats {
    accepted: AtomicU64,
    duplicates: AtomicU64,
    emitted: AtomicU64,
    decrypt_failures: AtomicU64,
    decode_failures: AtomicU64,
}

/// Point-in-time copy of [`InboundStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboundStatsSnapshot {
    /// Fragments above the watermark.
    pub accepted: u64,
    /// Fragments at or below the watermark.
    pub duplicates: u64,
    /// Commands pushed to the sink.
    pub emitted: u64,
    /// Messages dropped for a missing or wrong key, or bad ciphertext.
    pub decrypt_failures: u64,
    /// Messages dropped because the envelope did not parse.
    pub decode_failures: u64,
}

impl InboundStats {
    /// Read all counters.
    #[must_use]
    pub fn snapshot(&self) -> InboundStatsSnapshot {
        InboundStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            decrypt_failures: self.decrypt_failures.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
        }
    }

    fn record_drop(&self, reason: &DropReason) {
        let counter = match reason {
            DropReason::MissingSessionKey | DropReason::Decrypt(_) => &self.decrypt_failures,
            DropReason::Decode(_) => &self.decode_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Reassembles transport events into commands.
///
/// Must be driven by a single consumer: per-agent buffers assume events
/// arrive in transport order.
pub struct InboundPipeline<R, C> {
    registry: Arc<R>,
    crypto: Arc<C>,
    feed: Arc<CommandFeed>,
    stats: Arc<InboundStats>,
}

impl<R, C> InboundPipeline<R, C>
where
    R: AgentRegistry,
    C: CryptoProvider,
{
    /// Create a pipeline emitting into `feed`.
    #[must_use]
    pub fn new(registry: Arc<R>, crypto: Arc<C>, feed: Arc<CommandFeed>) -> Self {
        Self {
            registry,
            crypto,
            feed,
            stats: Arc::new(InboundStats::default()),
        }
    }

    /// Shared counters.
    #[must_use]
    pub fn stats(&self) -> Arc<InboundStats> {
        Arc::clone(&self.stats)
    }

    /// Process one transport event.
    ///
    /// Returns the decoded command when `event` completes a message. The
    /// caller decides where the command goes; [`Self::run`] pushes it to the
    /// feed.
    pub async fn process(&self, event: TransportEvent) -> Option<CommandEnvelope> {
        let handle = self.registry.get_or_create(&event.agent_id).await;
        let mut agent = handle.lock().await;

        if !agent.accept_fragment(event.seq, &event.data, now()) {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                agent_id = %event.agent_id,
                seq = event.seq,
                watermark = agent.in_seq,
                "discarding duplicate or stale event"
            );
            return None;
        }
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);

        if !event.final_fragment {
            return None;
        }

        // Cleared before decoding so a failed message never leaks forward.
        let buffer = agent.take_buffer();
        let decoded = if event.encrypted {
            self.open_encrypted(&agent, &buffer)
        } else {
            decode_envelope(buffer.as_bytes()).map_err(DropReason::from)
        };

        match decoded {
            Ok(command) => {
                self.stats.emitted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    agent_id = %event.agent_id,
                    seq = event.seq,
                    msg_id = command.msg_id,
                    "reassembled command"
                );
                Some(command)
            }
            Err(reason) => {
                self.stats.record_drop(&reason);
                tracing::warn!(
                    agent_id = %event.agent_id,
                    seq = event.seq,
                    bytes = buffer.len(),
                    %reason,
                    "dropping inbound message"
                );
                None
            }
        }
    }

    fn open_encrypted(&self, agent: &Agent, sealed: &str) -> Result<CommandEnvelope, DropReason> {
        let key = agent
            .session_key
            .as_ref()
            .ok_or(DropReason::MissingSessionKey)?;
        let plain = self.crypto.symmetric_decrypt(sealed, key)?;
        Ok(decode_envelope(&plain)?)
    }

    /// Consume `events` until `stop` fires or the subscription fails.
    ///
    /// The stop signal (or its sender being dropped) is only observed
    /// between events, never while one is being processed.
    ///
    /// # Errors
    /// Returns the transport error that ended the subscription, or
    /// `TransportError::SubscriptionClosed` if the stream ended.
    pub async fn run(
        &self,
        mut events: EventStream,
        mut stop: oneshot::Receiver<()>,
    ) -> Result<(), TransportError> {
        tracing::info!("inbound pipeline started");
        loop {
            tokio::select! {
                biased;
                _ = &mut stop => {
                    tracing::info!("inbound pipeline stopped");
                    return Ok(());
                }
                next = events.next() => match next {
                    Some(Ok(event)) => {
                        if let Some(command) = self.process(event).await {
                            self.feed.push(command);
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!("inbound subscription failed: {e}");
                        return Err(e);
                    }
                    None => {
                        tracing::error!("inbound subscription ended");
                        return Err(TransportError::SubscriptionClosed);
                    }
                },
            }
        }
    }
}
