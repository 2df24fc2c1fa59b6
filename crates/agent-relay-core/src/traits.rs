//! Core traits for the registry, transport and crypto seams.

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::types::{
    AgentHandle, AgentId, AgentSnapshot, Confirmation, Keypair, SessionKey, SessionStatus,
    Submission, TransportEvent,
};

/// Session state error.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),
    #[error("Session key already negotiated for agent {0}")]
    KeyAlreadyNegotiated(AgentId),
    #[error("Session status cannot move from {from} to {to}")]
    StatusRegression {
        from: SessionStatus,
        to: SessionStatus,
    },
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Transport adapter error.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Submission failed: {0}")]
    Submit(String),
    #[error("Ordering token out of order: expected {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },
    #[error("Subscription failed: {0}")]
    Subscription(String),
    #[error("Subscription closed")]
    SubscriptionClosed,
}

/// Crypto provider error.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Unsupported key size: {0} bits")]
    UnsupportedKeySize(usize),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Encryption failed: {0}")]
    Encrypt(String),
    #[error("Decryption failed: {0}")]
    Decrypt(String),
    #[error("Encoding error: {0}")]
    Encoding(String),
}

/// Ordered, unbounded stream of inbound transport events.
pub type EventStream = BoxStream<'static, Result<TransportEvent, TransportError>>;

/// Trait for agent session stores.
///
/// Implementations must allow concurrent readers and hand out one
/// [`AgentHandle`] per agent, so writers for different agents never block
/// each other.
#[async_trait]
pub trait AgentRegistry: Send + Sync {
    /// Get an agent by ID.
    async fn lookup(&self, agent_id: &str) -> Option<AgentHandle>;

    /// Get an agent, creating it in the `Handshake` state if absent.
    async fn get_or_create(&self, agent_id: &str) -> AgentHandle;

    /// Snapshot of every known agent.
    async fn list_all(&self) -> Vec<AgentSnapshot>;
}

/// Trait for the broadcast event log carrying traffic to and from agents.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Subscribe to inbound events. The stream is not restartable.
    ///
    /// # Errors
    /// Returns error if the subscription cannot be established.
    fn subscribe(&self) -> Result<EventStream, TransportError>;

    /// Submit one outbound event.
    ///
    /// Callers supply a strictly increasing `ordering_token` per channel.
    async fn submit(&self, submission: Submission) -> Result<Confirmation, TransportError>;
}

/// Trait for the primitive cryptography the session layer applies.
pub trait CryptoProvider: Send + Sync {
    /// Generate an asymmetric keypair of the given strength.
    ///
    /// # Errors
    /// Returns `CryptoError::UnsupportedKeySize` for sizes the provider
    /// cannot produce.
    fn generate_asymmetric_keypair(&self, bits: usize) -> Result<Keypair, CryptoError>;

    /// Encrypt `plaintext` into a transport-safe string.
    ///
    /// # Errors
    /// Returns error on invalid key material.
    fn symmetric_encrypt(&self, plaintext: &[u8], key: &SessionKey) -> Result<String, CryptoError>;

    /// Decrypt a string produced by [`CryptoProvider::symmetric_encrypt`].
    ///
    /// # Errors
    /// Returns error on wrong key, malformed or tampered ciphertext.
    fn symmetric_decrypt(&self, ciphertext: &str, key: &SessionKey)
    -> Result<Vec<u8>, CryptoError>;

    /// Derive the session key shared with the holder of `peer_public`.
    ///
    /// # Errors
    /// Returns error if either key is malformed.
    fn derive_session_key(
        &self,
        local: &Keypair,
        peer_public: &[u8],
    ) -> Result<SessionKey, CryptoError>;
}
