//! Client-side sharding over a consistent hash ring
//!
//! The servers know nothing about each other: the key of each command decides
//! its node through a [`HashRing`]. Keys are reduced to their `{hash tag}`
//! first, so related keys can be kept on one node.

use crate::cluster::hash_tag;
use crate::command::Command;
use crate::connection::{apply_error_policy, Connection, NodeConnection};
use crate::factory::ConnectionFactory;
use crate::hashring::HashRing;
use async_trait::async_trait;
use futures_util::future::join_all;
use redis_conduit_core::{
    config::{ConnectionParameters, ShardingConfig},
    error::{RedisError, RedisResult},
    value::RespValue,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

struct ShardState {
    ring: HashRing,
    nodes: HashMap<String, Arc<NodeConnection>>,
    aliases: HashMap<String, String>,
}

/// Aggregate of independent nodes addressed through a hash ring
pub struct ShardedCluster {
    factory: ConnectionFactory,
    config: ShardingConfig,
    state: RwLock<ShardState>,
}

impl ShardedCluster {
    /// Build a cluster from node parameters; weights default to 1
    pub fn new(
        factory: ConnectionFactory,
        nodes: Vec<ConnectionParameters>,
        config: ShardingConfig,
    ) -> RedisResult<Self> {
        let mut state = ShardState {
            ring: HashRing::with_replicas(config.replicas_per_weight as usize),
            nodes: HashMap::new(),
            aliases: HashMap::new(),
        };
        for params in nodes {
            let conn = factory.create_shared(params)?;
            insert(&mut state, conn)?;
        }

        Ok(Self {
            factory,
            config,
            state: RwLock::new(state),
        })
    }

    /// Sharding configuration
    pub fn config(&self) -> &ShardingConfig {
        &self.config
    }

    /// Add a node, replacing any node with the same id
    pub async fn add(&self, params: ConnectionParameters) -> RedisResult<()> {
        let conn = self.factory.create_shared(params)?;
        insert(&mut *self.state.write().await, conn)
    }

    /// Remove a node by id, returning whether it was present
    pub async fn remove(&self, node_id: &str) -> bool {
        let mut state = self.state.write().await;
        if state.nodes.remove(node_id).is_none() {
            return false;
        }
        state.ring.remove(node_id);
        state.aliases.retain(|_, id| id != node_id);
        true
    }

    /// Identifiers of every node
    pub async fn nodes(&self) -> Vec<String> {
        self.state.read().await.ring.nodes().map(str::to_string).collect()
    }

    /// Node by identifier
    pub async fn get_connection_by_id(&self, node_id: &str) -> Option<Arc<NodeConnection>> {
        self.state.read().await.nodes.get(node_id).cloned()
    }

    /// Node by alias
    pub async fn get_connection_by_alias(&self, alias: &str) -> Option<Arc<NodeConnection>> {
        let state = self.state.read().await;
        let id = state.aliases.get(alias)?;
        state.nodes.get(id).cloned()
    }

    /// Node owning `key`
    pub async fn get_connection_by_key(&self, key: &[u8]) -> RedisResult<Arc<NodeConnection>> {
        let state = self.state.read().await;
        lookup(&state, key)
    }

    /// Node owning every key of `command`
    ///
    /// Keyless commands and keys spread over several nodes are routing errors.
    pub async fn get_connection(&self, command: &dyn Command) -> RedisResult<Arc<NodeConnection>> {
        let keys = command.keys();
        if keys.is_empty() {
            return Err(RedisError::Routing(format!(
                "{} has no key to shard on",
                command.name()
            )));
        }

        let state = self.state.read().await;
        let conn = lookup(&state, keys[0])?;
        for key in &keys[1..] {
            let other = lookup(&state, key)?;
            if !Arc::ptr_eq(&conn, &other) {
                return Err(RedisError::Routing(format!(
                    "{} touches keys on different nodes ({} and {})",
                    command.name(),
                    conn.id(),
                    other.id()
                )));
            }
        }
        Ok(conn)
    }

    /// Send a command and return its reply verbatim
    pub async fn execute(&self, command: &dyn Command) -> RedisResult<RespValue> {
        let conn = self.get_connection(command).await?;
        debug!("Routing {} to {}", command.name(), conn.id());
        conn.request(command).await
    }

    async fn connections(&self) -> Vec<Arc<NodeConnection>> {
        self.state.read().await.nodes.values().cloned().collect()
    }
}

fn insert(state: &mut ShardState, conn: Arc<NodeConnection>) -> RedisResult<()> {
    let id = conn.id().to_string();
    let params = conn.parameters();
    state.ring.add(&id, params.weight.unwrap_or(1))?;
    state.aliases.retain(|_, node| *node != id);
    if let Some(alias) = params.alias.clone() {
        state.aliases.insert(alias, id.clone());
    }
    state.nodes.insert(id, conn);
    Ok(())
}

fn lookup(state: &ShardState, key: &[u8]) -> RedisResult<Arc<NodeConnection>> {
    let id = state.ring.get(hash_tag(key))?;
    state
        .nodes
        .get(id)
        .cloned()
        .ok_or_else(|| RedisError::Routing(format!("ring points at unknown node {id}")))
}

#[async_trait]
impl Connection for ShardedCluster {
    async fn connect(&self) -> RedisResult<()> {
        let nodes = self.connections().await;
        for result in join_all(nodes.iter().map(|conn| conn.connect())).await {
            result?;
        }
        Ok(())
    }

    async fn disconnect(&self) {
        let nodes = self.connections().await;
        join_all(nodes.iter().map(|conn| conn.disconnect())).await;
    }

    async fn is_connected(&self) -> bool {
        self.connections().await.iter().any(|conn| conn.is_connected())
    }

    async fn send(&self, command: &dyn Command) -> RedisResult<RespValue> {
        let conn = self.get_connection(command).await?;
        let reply = conn.request(command).await?;
        apply_error_policy(reply, self.config.error_policy, conn.id())
    }
}
