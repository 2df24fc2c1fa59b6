//! End-to-end session flows over the in-memory transport and a counting
//! transport double.

use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use agent_relay_core::{
    AgentRegistry, CommandEnvelope, Confirmation, CryptoProvider, SessionKey, SessionStatus,
    Submission, Transport,
    traits::{EventStream, TransportError},
};
use agent_relay_crypto::StandardCrypto;
use agent_relay_session::{MemoryRegistry, RelayConfig, RelayServer, SendError};
use agent_relay_transport::{AgentEndpoint, MemoryTransport};
use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};

/// Transport double that counts submissions and never delivers events.
#[derive(Default)]
struct CountingTransport {
    submits: AtomicUsize,
    seen: Mutex<Vec<Submission>>,
}

#[async_trait]
impl Transport for CountingTransport {
    fn subscribe(&self) -> Result<EventStream, TransportError> {
        Ok(futures::stream::pending().boxed())
    }

    async fn submit(&self, submission: Submission) -> Result<Confirmation, TransportError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        let token = submission.ordering_token;
        self.seen.lock().unwrap().push(submission);
        Ok(Confirmation {
            ordering_token: token,
            receipt: format!("tx-{token}"),
        })
    }
}

fn memory_server() -> (
    Arc<MemoryTransport>,
    RelayServer<MemoryRegistry, MemoryTransport, StandardCrypto>,
) {
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

fn counting_server() -> (
    Arc<CountingTransport>,
    RelayServer<MemoryRegistry, CountingTransport, StandardCrypto>,
) {
    let transport = Arc::new(CountingTransport::default());
    let server = RelayServer::new(
        Arc::new(MemoryRegistry::new()),
        Arc::clone(&transport),
        Arc::new(StandardCrypto),
        &RelayConfig::default(),
    )
    .unwrap();
    (transport, server)
}

async fn next_command(commands: &mut BoxStream<'static, CommandEnvelope>) -> CommandEnvelope {
    tokio::time::timeout(Duration::from_secs(1), commands.next())
        .await
        .expect("command within a second")
        .expect("feed stream open")
}

#[tokio::test]
async fn test_fragmented_checkin_reaches_feed() {
    let (transport, server) = memory_server();
    let mut commands = server.feed().history_plus_stream();
    server.start().await.unwrap();

    let mut agent = AgentEndpoint::new("agent-7", StandardCrypto).with_max_fragment(12);
    let events = agent.frame(1, "checkin").unwrap();
    assert_eq!(events.len(), 4);
    for event in &events {
        transport.publish(event.clone()).unwrap();
    }
    // Redelivery of the whole message must not produce a second command.
    for event in events {
        transport.publish(event).unwrap();
    }

    // Events are consumed serially, so this marker lands after the replays.
    let mut marker = AgentEndpoint::new("agent-8", StandardCrypto);
    for event in marker.frame(1, "done").unwrap() {
        transport.publish(event).unwrap();
    }

    let command = next_command(&mut commands).await;
    assert_eq!(command.agent_id, "agent-7");
    assert_eq!(command.data, "checkin");
    assert_eq!(next_command(&mut commands).await.agent_id, "agent-8");

    server.stop().await.unwrap();
    let stats = server.inbound_stats();
    assert_eq!(stats.emitted, 2);
    assert_eq!(stats.duplicates, 4);
    assert_eq!(server.feed().get_history().len(), 2);

    let agents = server.list_agents().await;
    assert_eq!(agents.len(), 2);
    assert_eq!(agents[0].status, SessionStatus::Handshake);
    assert_eq!(agents[0].buffered_bytes, 0);
}

#[tokio::test]
async fn test_send_to_unregistered_agent_never_submits() {
    let (transport, server) = counting_server();

    let err = server.send("nobody", "ls", 1).await.unwrap_err();
    assert!(matches!(err, SendError::AgentNotFound(_)));
    assert_eq!(transport.submits.load(Ordering::SeqCst), 0);
    assert!(server.list_agents().await.is_empty());
}

#[tokio::test]
async fn test_concurrent_sends_same_agent() {
    let (transport, server) = counting_server();
    let server = Arc::new(server);
    server.registry().get_or_create("a1").await;

    let mut tasks = Vec::new();
    for msg_id in 0..32 {
        let server = Arc::clone(&server);
        tasks.push(tokio::spawn(async move {
            server.send("a1", "ping", msg_id).await
        }));
    }
    let mut ok = 0;
    for task in tasks {
        if task.await.unwrap().is_ok() {
            ok += 1;
        }
    }

    let seen = transport.seen.lock().unwrap().clone();
    let seqs: HashSet<u64> = seen.iter().map(|s| s.seq).collect();
    let tokens: HashSet<u64> = seen.iter().map(|s| s.ordering_token).collect();
    assert_eq!(ok, 32);
    assert_eq!(seqs.len(), ok);
    assert_eq!(tokens.len(), ok);
    assert_eq!(seqs, (1..=32).collect::<HashSet<u64>>());
}

#[tokio::test]
async fn test_handshake_then_encrypted_traffic_both_ways() {
    let (transport, server) = memory_server();
    let mut outbound = transport.subscribe_outbound();
    let mut commands = server.feed().get_receiver();
    server.start().await.unwrap();

    // Cleartext first contact registers the agent.
    let agent_keys = StandardCrypto.generate_asymmetric_keypair(256).unwrap();
    let mut agent = AgentEndpoint::new("a1", StandardCrypto);
    for event in agent.frame(0, "hello").unwrap() {
        transport.publish(event).unwrap();
    }
    assert_eq!(commands.recv().await.unwrap().data, "hello");

    server
        .complete_handshake("a1", &agent_keys.public)
        .await
        .unwrap();
    let key = StandardCrypto
        .derive_session_key(&agent_keys, server.public_key())
        .unwrap();
    agent.set_session_key(key);

    // Agent -> server, encrypted and fragmented.
    let mut agent = agent.with_max_fragment(20);
    for event in agent.frame(2, "uid=0(root)").unwrap() {
        assert!(event.encrypted);
        transport.publish(event).unwrap();
    }
    assert_eq!(commands.recv().await.unwrap().data, "uid=0(root)");

    // Server -> agent, encrypted.
    server.send("a1", "id", 3).await.unwrap();
    let submission = outbound.recv().await.unwrap();
    assert!(submission.encrypted);
    let opened = agent.open(&submission.to_event()).unwrap();
    assert_eq!(opened.msg_id, 3);
    assert_eq!(opened.data, "id");

    server.stop().await.unwrap();
    assert_eq!(server.inbound_stats().decrypt_failures, 0);
}

#[tokio::test]
async fn test_wrong_key_message_is_dropped_not_fatal() {
    let (transport, server) = memory_server();
    let mut commands = server.feed().get_receiver();
    server.start().await.unwrap();

    let mut agent = AgentEndpoint::new("a1", StandardCrypto);
    for event in agent.frame(0, "hello").unwrap() {
        transport.publish(event).unwrap();
    }
    commands.recv().await.unwrap();

    let server_side = StandardCrypto.generate_asymmetric_keypair(256).unwrap();
    server
        .complete_handshake("a1", &server_side.public)
        .await
        .unwrap();
    agent.set_session_key(SessionKey::new(vec![0x55; 32]));
    for event in agent.frame(1, "lost").unwrap() {
        transport.publish(event).unwrap();
    }

    // The pipeline keeps going after the drop.
    let handle = server.registry().lookup("a1").await.unwrap();
    let mut plain = AgentEndpoint::new("a2", StandardCrypto);
    for event in plain.frame(2, "still alive").unwrap() {
        transport.publish(event).unwrap();
    }
    let next = commands.recv().await.unwrap();
    assert_eq!(next.agent_id, "a2");

    assert!(handle.lock().await.data_buffer.is_empty());
    assert_eq!(server.inbound_stats().decrypt_failures, 1);
    server.stop().await.unwrap();
}
