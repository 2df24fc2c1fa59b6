//! Relay server for orchestrating agent sessions.

use std::sync::Arc;

use agent_relay_core::{
    AgentHandle, AgentRegistry, AgentSnapshot, CommandFeed, Confirmation, CryptoProvider, Keypair,
    SessionKey, SessionStatus, Transport,
    traits::{CryptoError, SessionError, TransportError},
};
use tokio::{
    sync::{Mutex, oneshot, watch},
    task::JoinHandle,
};

use crate::{
    config::RelayConfig,
    dispatcher::{Dispatcher, SendError},
    inbound::{InboundPipeline, InboundStatsSnapshot},
};

/// Relay server error.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Send error: {0}")]
    Send(#[from] SendError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Inbound consumer already running")]
    AlreadyRunning,
    #[error("Inbound consumer not running")]
    NotRunning,
    #[error("Inbound consumer task failed: {0}")]
    TaskFailed(String),
}

/// Lifecycle of the inbound consumer.
#[derive(Debug, Clone)]
enum ConsumerState {
    Idle,
    Running,
    Exited(Result<(), TransportError>),
}

/// Running inbound consumer.
struct InboundTask {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<Result<(), TransportError>>,
}

/// Server side of every agent session on one transport.
pub struct RelayServer<R, T, C>
where
    R: AgentRegistry,
    T: Transport,
    C: CryptoProvider,
{
    registry: Arc<R>,
    transport: Arc<T>,
    crypto: Arc<C>,
    dispatcher: Dispatcher<R, T, C>,
    pipeline: Arc<InboundPipeline<R, C>>,
    feed: Arc<CommandFeed>,
    keypair: Keypair,
    inbound: Mutex<Option<InboundTask>>,
    state: Arc<watch::Sender<ConsumerState>>,
}

impl<R, T, C> RelayServer<R, T, C>
where
    R: AgentRegistry + 'static,
    T: Transport + 'static,
    C: CryptoProvider + 'static,
{
    /// Create a server and its bootstrap keypair.
    ///
    /// # Errors
    /// Returns error if the keypair cannot be generated.
    pub fn new(
        registry: Arc<R>,
        transport: Arc<T>,
        crypto: Arc<C>,
        config: &RelayConfig,
    ) -> Result<Self, ServerError> {
        let keypair = crypto.generate_asymmetric_keypair(config.crypto.keypair_bits)?;
        let feed = Arc::new(CommandFeed::new(
            config.feed.history_limit,
            config.feed.channel_capacity,
        ));
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&transport),
            Arc::clone(&crypto),
            config.dispatcher.initial_ordering_token,
        );
        let pipeline = Arc::new(InboundPipeline::new(
            Arc::clone(&registry),
            Arc::clone(&crypto),
            Arc::clone(&feed),
        ));

        Ok(Self {
            registry,
            transport,
            crypto,
            dispatcher,
            pipeline,
            feed,
            keypair,
            inbound: Mutex::new(None),
            state: Arc::new(watch::channel(ConsumerState::Idle).0),
        })
    }

    /// Public half of the bootstrap keypair, handed to agents.
    #[must_use]
    pub fn public_key(&self) -> &[u8] {
        &self.keypair.public
    }

    /// Agent registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<R> {
        &self.registry
    }

    /// Feed of decoded inbound commands.
    #[must_use]
    pub fn feed(&self) -> Arc<CommandFeed> {
        Arc::clone(&self.feed)
    }

    /// Inbound counters.
    #[must_use]
    pub fn inbound_stats(&self) -> InboundStatsSnapshot {
        self.pipeline.stats().snapshot()
    }

    /// Snapshot of every known agent.
    pub async fn list_agents(&self) -> Vec<AgentSnapshot> {
        self.registry.list_all().await
    }

    /// Subscribe to the transport and start the inbound consumer.
    ///
    /// # Errors
    /// Returns error if already running or the subscription fails.
    pub async fn start(&self) -> Result<(), ServerError> {
        let mut inbound = self.inbound.lock().await;
        if inbound.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            return Err(ServerError::AlreadyRunning);
        }

        let events = self.transport.subscribe()?;
        let (stop_tx, stop_rx) = oneshot::channel();
        let pipeline = Arc::clone(&self.pipeline);
        let state = Arc::clone(&self.state);
        state.send_replace(ConsumerState::Running);
        let handle = tokio::spawn(async move {
            let result = pipeline.run(events, stop_rx).await;
            state.send_replace(ConsumerState::Exited(result.clone()));
            result
        });

        *inbound = Some(InboundTask { stop_tx, handle });
        tracing::info!("relay server started");
        Ok(())
    }

    /// Stop the inbound consumer between events and wait for it to exit.
    ///
    /// # Errors
    /// Returns the transport error that had already ended the consumer, or
    /// `NotRunning` if it was never started.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let task = self.inbound.lock().await.take().ok_or(ServerError::NotRunning)?;

        // The consumer may already have exited on a transport error.
        let _ = task.stop_tx.send(());
        let result = task.handle.await.map_err(|e| {
            self.state.send_replace(ConsumerState::Exited(Err(TransportError::Subscription(
                format!("inbound consumer task failed: {e}"),
            ))));
            ServerError::TaskFailed(e.to_string())
        })?;

        tracing::info!("relay server stopped");
        Ok(result?)
    }

    /// Whether the inbound consumer is processing events.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(*self.state.borrow(), ConsumerState::Running)
    }

    /// Wait until the inbound consumer exits.
    ///
    /// Resolves immediately if it has already exited. Lets the owning
    /// process observe a fatal subscription failure without calling
    /// [`Self::stop`].
    ///
    /// # Errors
    /// Returns the transport error that ended the consumer, or
    /// `NotRunning` if it was never started.
    pub async fn closed(&self) -> Result<(), ServerError> {
        let mut state = self.state.subscribe();
        let outcome = state
            .wait_for(|s| !matches!(s, ConsumerState::Running))
            .await
            .map_err(|e| ServerError::TaskFailed(e.to_string()))?
            .clone();

        match outcome {
            ConsumerState::Idle => Err(ServerError::NotRunning),
            ConsumerState::Exited(result) => Ok(result?),
            ConsumerState::Running => Ok(()),
        }
    }

    /// Send a command to a registered agent.
    ///
    /// # Errors
    /// See [`Dispatcher::send`].
    pub async fn send(
        &self,
        agent_id: &str,
        payload: &str,
        msg_id: i64,
    ) -> Result<Confirmation, SendError> {
        self.dispatcher.send(agent_id, payload, msg_id).await
    }

    /// Derive the session key from the agent's bootstrap public key and
    /// activate the session.
    ///
    /// # Errors
    /// Returns error if the agent is unknown, the key is malformed, or a
    /// session key is already negotiated.
    pub async fn complete_handshake(
        &self,
        agent_id: &str,
        agent_public_key: &[u8],
    ) -> Result<(), ServerError> {
        let key = self
            .crypto
            .derive_session_key(&self.keypair, agent_public_key)?;
        self.install_session_key(agent_id, key).await
    }

    /// Install an externally negotiated session key and activate the session.
    ///
    /// # Errors
    /// Returns error if the agent is unknown or already has a key.
    pub async fn install_session_key(
        &self,
        agent_id: &str,
        key: SessionKey,
    ) -> Result<(), ServerError> {
        let handle = self.lookup(agent_id).await?;
        handle.lock().await.install_session_key(key)?;
        tracing::info!(agent_id, "session key negotiated");
        Ok(())
    }

    /// Move an agent's session lifecycle forward.
    ///
    /// # Errors
    /// Returns error if the agent is unknown or the move is backwards.
    pub async fn advance_status(
        &self,
        agent_id: &str,
        status: SessionStatus,
    ) -> Result<(), ServerError> {
        let handle = self.lookup(agent_id).await?;
        handle.lock().await.advance_status(status)?;
        Ok(())
    }

    /// Record descriptive metadata reported by an agent. `None` leaves the
    /// current value unchanged.
    ///
    /// # Errors
    /// Returns error if the agent is unknown.
    pub async fn update_metadata(
        &self,
        agent_id: &str,
        current_user: Option<String>,
        hostname: Option<String>,
    ) -> Result<(), ServerError> {
        let handle = self.lookup(agent_id).await?;
        let mut agent = handle.lock().await;
        if let Some(user) = current_user {
            agent.current_user = Some(user);
        }
        if let Some(host) = hostname {
            agent.hostname = Some(host);
        }
        Ok(())
    }

    async fn lookup(&self, agent_id: &str) -> Result<AgentHandle, ServerError> {
        self.registry
            .lookup(agent_id)
            .await
            .ok_or_else(|| SessionError::AgentNotFound(agent_id.to_owned()).into())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use agent_relay_crypto::StandardCrypto;
    use agent_relay_transport::MemoryTransport;

    use super::*;
    use crate::registry::MemoryRegistry;

    type TestServer = RelayServer<MemoryRegistry, MemoryTransport, StandardCrypto>;

    fn server() -> (Arc<MemoryTransport>, TestServer) {
        let transport = Arc::new(MemoryTransport::new());
        let server = RelayServer::new(
            Arc::new(MemoryRegistry::new()),
            Arc::clone(&transport),
            Arc::new(StandardCrypto),
            &RelayConfig::default(),
        )
        .unwrap();
        (transport, server)
    }

    #[test]
    fn test_unsupported_keypair_bits() {
        let mut config = RelayConfig::default();
        config.crypto.keypair_bits = 2048;
        let result = RelayServer::new(
            Arc::new(MemoryRegistry::new()),
            Arc::new(MemoryTransport::new()),
            Arc::new(StandardCrypto),
            &config,
        );
        assert!(matches!(
            result,
            Err(ServerError::Crypto(CryptoError::UnsupportedKeySize(2048)))
        ));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (_transport, server) = server();
        server.start().await.unwrap();
        assert!(matches!(server.start().await, Err(ServerError::AlreadyRunning)));
        server.stop().await.unwrap();
        assert!(matches!(server.stop().await, Err(ServerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_handshake_activates_session() {
        let (_transport, server) = server();
        server.registry().get_or_create("a1").await;

        let agent_keys = StandardCrypto.generate_asymmetric_keypair(256).unwrap();
        server
            .complete_handshake("a1", &agent_keys.public)
            .await
            .unwrap();

        let agents = server.list_agents().await;
        assert_eq!(agents[0].status, SessionStatus::Active);
        assert!(agents[0].has_session_key);

        let expected = StandardCrypto
            .derive_session_key(&agent_keys, server.public_key())
            .unwrap();
        let handle = server.registry().lookup("a1").await.unwrap();
        assert_eq!(handle.lock().await.session_key.as_ref(), Some(&expected));

        let again = server.complete_handshake("a1", &agent_keys.public).await;
        assert!(matches!(
            again,
            Err(ServerError::Session(SessionError::KeyAlreadyNegotiated(_)))
        ));
    }

    #[tokio::test]
    async fn test_session_ops_require_known_agent() {
        let (_transport, server) = server();
        assert!(matches!(
            server.install_session_key("ghost", SessionKey::new(vec![0; 32])).await,
            Err(ServerError::Session(SessionError::AgentNotFound(_)))
        ));
        assert!(matches!(
            server.update_metadata("ghost", None, None).await,
            Err(ServerError::Session(SessionError::AgentNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_metadata_and_status() {
        let (_transport, server) = server();
        server.registry().get_or_create("a1").await;

        server
            .update_metadata("a1", Some("svc".into()), Some("build-01".into()))
            .await
            .unwrap();
        server.update_metadata("a1", None, None).await.unwrap();
        server.advance_status("a1", SessionStatus::Active).await.unwrap();

        let agent = &server.list_agents().await[0];
        assert_eq!(agent.current_user.as_deref(), Some("svc"));
        assert_eq!(agent.hostname.as_deref(), Some("build-01"));
        assert!(matches!(
            server.advance_status("a1", SessionStatus::Handshake).await,
            Err(ServerError::Session(SessionError::StatusRegression { .. }))
        ));
    }

    #[tokio::test]
    async fn test_stop_reports_transport_failure() {
        let (transport, server) = server();
        server.start().await.unwrap();
        transport.close();

        let _ = server.closed().await;
        assert!(matches!(
            server.stop().await,
            Err(ServerError::Transport(TransportError::SubscriptionClosed))
        ));
    }

    #[tokio::test]
    async fn test_closed_surfaces_subscription_failure() {
        let (transport, server) = server();
        assert!(!server.is_running());
        server.start().await.unwrap();
        assert!(server.is_running());

        transport.close();
        let result = tokio::time::timeout(Duration::from_secs(1), server.closed())
            .await
            .expect("closed resolves once the consumer exits");
        assert!(matches!(
            result,
            Err(ServerError::Transport(TransportError::SubscriptionClosed))
        ));
        assert!(!server.is_running());

        // Later callers see the same outcome.
        assert!(matches!(
            server.closed().await,
            Err(ServerError::Transport(TransportError::SubscriptionClosed))
        ));
    }

    #[tokio::test]
    async fn test_closed_after_clean_stop() {
        let (_transport, server) = server();
        assert!(matches!(server.closed().await, Err(ServerError::NotRunning)));

        server.start().await.unwrap();
        let waiter = server.closed();
        server.stop().await.unwrap();
        assert!(waiter.await.is_ok());
        assert!(!server.is_running());
    }
}
