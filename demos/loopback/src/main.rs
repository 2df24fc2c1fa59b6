//! Loopback demo: a relay server and a simulated agent sharing one
//! in-memory event log.
//!
//! Run with: cargo run -p loopback-demo [-- path/to/relay.toml]

use std::{path::PathBuf, sync::Arc};

use agent_relay_core::CryptoProvider;
use agent_relay_crypto::StandardCrypto;
use agent_relay_session::{MemoryRegistry, RelayConfig, RelayServer};
use agent_relay_transport::{AgentEndpoint, MemoryTransport};
use futures::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = RelayConfig::load(config_path.as_deref())?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .init();

    let transport = Arc::new(MemoryTransport::new());
    let registry = Arc::new(MemoryRegistry::with_policy(
        config.registry.eviction_policy(),
    ));
    let server = RelayServer::new(
        registry,
        Arc::clone(&transport),
        Arc::new(StandardCrypto),
        &config,
    )?;

    let mut commands = server.feed().history_plus_stream();
    let mut to_agent = transport.subscribe_outbound();
    server.start().await?;

    // Agent checks in over cleartext.
    let mut agent = AgentEndpoint::new("demo-agent", StandardCrypto).with_max_fragment(24);
    for event in agent.frame(0, "checkin")? {
        transport.publish(event)?;
    }
    if let Some(command) = commands.next().await {
        tracing::info!(agent_id = %command.agent_id, data = %command.data, "received");
    }

    // Bootstrap the session key from both public halves.
    let agent_keys = StandardCrypto.generate_asymmetric_keypair(config.crypto.keypair_bits)?;
    server
        .complete_handshake(agent.agent_id(), &agent_keys.public)
        .await?;
    agent.set_session_key(StandardCrypto.derive_session_key(&agent_keys, server.public_key())?);
    server
        .update_metadata(agent.agent_id(), Some("operator".into()), Some("demo-host".into()))
        .await?;

    // Encrypted round trip.
    server.send(agent.agent_id(), "hostname", 1).await?;
    let submission = to_agent.recv().await?;
    let task = agent.open(&submission.to_event())?;
    tracing::info!(msg_id = task.msg_id, data = %task.data, "agent received task");

    for event in agent.frame(task.msg_id, "demo-host")? {
        transport.publish(event)?;
    }
    if let Some(command) = commands.next().await {
        tracing::info!(agent_id = %command.agent_id, data = %command.data, "received");
    }

    for snapshot in server.list_agents().await {
        tracing::info!(
            agent_id = %snapshot.agent_id,
            status = %snapshot.status,
            in_seq = snapshot.in_seq,
            out_seq = snapshot.out_seq,
            hostname = ?snapshot.hostname,
            "agent"
        );
    }
    tracing::info!(stats = ?server.inbound_stats(), "inbound stats");

    server.stop().await?;
    Ok(())
}
