//! In-memory agent registry.

use std::{collections::HashMap, sync::Arc};

use agent_relay_core::{Agent, AgentHandle, AgentId, AgentRegistry, AgentSnapshot};
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use super::{EvictionPolicy, now};

/// In-memory registry implementation.
///
/// The map lock is only held for lookups and inserts; each agent lives
/// behind its own mutex, so work on different agents proceeds in parallel.
/// Data is lost on restart.
pub struct MemoryRegistry {
    agents: RwLock<HashMap<AgentId, AgentHandle>>,
    policy: EvictionPolicy,
}

impl MemoryRegistry {
    /// Create a registry that never evicts.
    #[must_use]
    pub fn new() -> Self {
        Self::with_policy(EvictionPolicy::default())
    }

    /// Create a registry with the given eviction policy.
    #[must_use]
    pub fn with_policy(policy: EvictionPolicy) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            policy,
        }
    }

    /// Active eviction policy.
    #[must_use]
    pub const fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Number of known agents.
    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    /// Whether no agent is known.
    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }

    /// Remove agents idle longer than the policy's TTL.
    ///
    /// Returns the evicted IDs. A no-op when no TTL is configured.
    pub async fn evict_idle(&self) -> Vec<AgentId> {
        self.evict_idle_at(now()).await
    }

    /// [`Self::evict_idle`] against an explicit clock (Unix epoch seconds).
    pub async fn evict_idle_at(&self, now: i64) -> Vec<AgentId> {
        let Some(ttl) = self.policy.idle_ttl else {
            return Vec::new();
        };
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);

        let mut agents = self.agents.write().await;
        let expired: Vec<AgentId> = agents
            .iter()
            .filter(|(_, handle)| Arc::strong_count(handle) == 1)
            .filter_map(|(id, handle)| {
                let agent = handle.try_lock().ok()?;
                (now.saturating_sub(agent.last_seen) > ttl).then(|| id.clone())
            })
            .collect();

        for id in &expired {
            agents.remove(id);
            tracing::info!(agent_id = %id, "evicted idle agent");
        }
        expired
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Remove the least recently seen agent nobody else holds a handle to.
fn evict_least_recent(agents: &mut HashMap<AgentId, AgentHandle>) -> Option<AgentId> {
    let victim = agents
        .iter()
        .filter(|(_, handle)| Arc::strong_count(handle) == 1)
        .filter_map(|(id, handle)| {
            let agent = handle.try_lock().ok()?;
            Some((agent.last_seen, id.clone()))
        })
        .min()
        .map(|(_, id)| id)?;

    agents.remove(&victim);
    Some(victim)
}

#[async_trait]
impl AgentRegistry for MemoryRegistry {
    async fn lookup(&self, agent_id: &str) -> Option<AgentHandle> {
        self.agents.read().await.get(agent_id).map(Arc::clone)
    }

    async fn get_or_create(&self, agent_id: &str) -> AgentHandle {
        if let Some(handle) = self.agents.read().await.get(agent_id) {
            return Arc::clone(handle);
        }

        let mut agents = self.agents.write().await;
        // Another writer may have raced us between the two locks.
        if let Some(handle) = agents.get(agent_id) {
            return Arc::clone(handle);
        }

        if let Some(max) = self.policy.max_agents {
            while agents.len() >= max.max(1) {
                if let Some(evicted) = evict_least_recent(&mut agents) {
                    tracing::info!(agent_id = %evicted, "evicted least recently seen agent");
                } else {
                    tracing::warn!(max, "registry full and every agent is in use");
                    break;
                }
            }
        }

        let handle = Arc::new(Mutex::new(Agent::new(agent_id, now())));
        agents.insert(agent_id.to_owned(), Arc::clone(&handle));
        tracing::debug!(agent_id, "registered new agent");
        handle
    }

    async fn list_all(&self) -> Vec<AgentSnapshot> {
        let handles: Vec<AgentHandle> = self.agents.read().await.values().cloned().collect();

        let mut result = Vec::with_capacity(handles.len());
        for handle in handles {
            result.push(AgentSnapshot::from(&*handle.lock().await));
        }
        result.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        result
    }
}
