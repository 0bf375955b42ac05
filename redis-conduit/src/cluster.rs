//! Redis Cluster support
//!
//! This module provides:
//! - Slot calculation using CRC16 with hash tags
//! - [`ClusterRouter`], which routes commands by slot, follows MOVED and ASK
//!   redirections and rebuilds its topology after connection failures

use crate::command::{Cmd, Command};
use crate::connection::{apply_error_policy, Connection, NodeConnection};
use crate::factory::ConnectionFactory;
use crate::slot_map::SlotMap;
use crate::topology;
use async_trait::async_trait;
use crc16::{State, XMODEM};
use futures_util::future::join_all;
use rand::Rng;
use redis_conduit_core::{
    config::{ClusterConfig, ConnectionParameters},
    error::{RedisError, RedisResult},
    types::{node_address, CLUSTER_SLOTS},
    value::{Redirect, RespValue},
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Calculate the hash slot for a given key
///
/// This implements the Redis Cluster key hashing algorithm:
/// - If the key contains {...}, only the part between the first { and first } is hashed
/// - Otherwise, the entire key is hashed
/// - The hash is CRC16 mod 16384
pub fn calculate_slot(key: &[u8]) -> u16 {
    State::<XMODEM>::calculate(hash_tag(key)) % CLUSTER_SLOTS
}

/// Extract the hash tag from a key
///
/// Hash tags allow you to ensure multiple keys are allocated to the same hash slot.
/// For example: `{user1000}.following` and `{user1000}.followers` will hash to the same slot.
pub fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(start) = key.iter().position(|&b| b == b'{') {
        if let Some(end) = key[start + 1..].iter().position(|&b| b == b'}') {
            let end = start + 1 + end;
            // Only use hash tag if there's at least one character between { and }
            if end > start + 1 {
                return &key[start + 1..end];
            }
        }
    }
    key
}

/// Slot shared by every key of a command, `None` for keyless commands
///
/// Keys spread over several slots make the command unroutable.
pub fn command_slot(command: &dyn Command) -> RedisResult<Option<u16>> {
    let mut slot = None;
    for key in command.keys() {
        let key_slot = calculate_slot(key);
        match slot {
            None => slot = Some(key_slot),
            Some(s) if s != key_slot => {
                return Err(RedisError::Routing(format!(
                    "{} touches keys in different slots ({s} and {key_slot})",
                    command.name()
                )))
            }
            Some(_) => {}
        }
    }
    Ok(slot)
}

/// Slot map plus the connections it points at, replaced as a whole on refresh
struct Topology {
    slots: SlotMap,
    nodes: HashMap<String, Arc<NodeConnection>>,
}

/// Routes commands across a Redis Cluster
pub struct ClusterRouter {
    factory: ConnectionFactory,
    /// Parameters new nodes inherit (credentials, timeouts, scheme)
    template: ConnectionParameters,
    seeds: Vec<ConnectionParameters>,
    config: ClusterConfig,
    topology: RwLock<Topology>,
    refresh_lock: Mutex<()>,
    discovered: AtomicBool,
}

impl ClusterRouter {
    /// Build a router from seed nodes
    ///
    /// Slot ranges given in the seeds' parameters pre-populate the slot map.
    /// No connection is opened here.
    pub fn new(
        factory: ConnectionFactory,
        seeds: Vec<ConnectionParameters>,
        config: ClusterConfig,
    ) -> RedisResult<Self> {
        let template = seeds
            .first()
            .cloned()
            .ok_or_else(|| RedisError::Config("cluster needs at least one seed node".to_string()))?;

        let mut slots = SlotMap::new();
        let mut nodes = HashMap::new();
        for params in &seeds {
            let conn = factory.create_shared(params.clone())?;
            for range in &params.slots {
                slots.set_slots(range.start, range.end, conn.id())?;
            }
            nodes.insert(conn.id().to_string(), conn);
        }

        Ok(Self {
            factory,
            template,
            discovered: AtomicBool::new(!slots.is_empty()),
            seeds,
            config,
            topology: RwLock::new(Topology { slots, nodes }),
            refresh_lock: Mutex::new(()),
        })
    }

    /// Router configuration
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Add a node to the pool, assigning any slots its parameters carry
    pub async fn add(&self, params: ConnectionParameters) -> RedisResult<()> {
        let conn = self.factory.create_shared(params.clone())?;
        let mut topology = self.topology.write().await;
        for range in &params.slots {
            topology.slots.set_slots(range.start, range.end, conn.id())?;
        }
        topology.nodes.insert(conn.id().to_string(), conn);
        Ok(())
    }

    /// Remove a node from the pool; slots keep pointing at it until the next refresh
    pub async fn remove(&self, node_id: &str) -> bool {
        self.topology.write().await.nodes.remove(node_id).is_some()
    }

    /// Identifiers of pooled nodes
    pub async fn nodes(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.topology.read().await.nodes.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Copy of the current slot map
    pub async fn slot_map(&self) -> SlotMap {
        self.topology.read().await.slots.clone()
    }

    /// Pooled connection by node identifier
    pub async fn get_connection_by_id(&self, node_id: &str) -> Option<Arc<NodeConnection>> {
        self.topology.read().await.nodes.get(node_id).cloned()
    }

    /// Connection owning `slot`, or a random known node when the slot is unassigned
    ///
    /// With every pooled node evicted the guess falls back to a seed, so a
    /// dead cluster surfaces as a connection error from an actual node.
    pub async fn get_connection_by_slot(&self, slot: u16) -> RedisResult<Arc<NodeConnection>> {
        let owner = {
            let topology = self.topology.read().await;
            match topology.slots.get(slot) {
                Some(id) => match topology.nodes.get(id) {
                    Some(conn) => return Ok(conn.clone()),
                    None => Some(id.to_string()),
                },
                None => {
                    debug!("Slot {} unassigned, guessing a node", slot);
                    if !topology.nodes.is_empty() {
                        return self.pick_random(&topology.nodes);
                    }
                    None
                }
            }
        };
        let Some(owner) = owner else {
            return self.random_connection().await;
        };
        let (host, port) = split_node_id(&owner).ok_or_else(|| {
            RedisError::Cluster(format!("slot {slot} owned by unparsable node id {owner}"))
        })?;
        self.connection_for_node(&host, port).await
    }

    /// Connection owning the slot of `key`
    pub async fn get_connection_by_key(&self, key: &[u8]) -> RedisResult<Arc<NodeConnection>> {
        self.get_connection_by_slot(calculate_slot(key)).await
    }

    /// Connection a command would be sent to first
    pub async fn get_connection(&self, command: &dyn Command) -> RedisResult<Arc<NodeConnection>> {
        match command_slot(command)? {
            Some(slot) => self.get_connection_by_slot(slot).await,
            None => self.random_connection().await,
        }
    }

    /// Send a command and return the final reply, error replies included
    ///
    /// Redirections are followed and never returned.
    pub async fn execute(&self, command: &dyn Command) -> RedisResult<RespValue> {
        self.dispatch(command).await.map(|(reply, _)| reply)
    }

    /// Rebuild the slot map and node table from a `CLUSTER SLOTS` or `CLUSTER SHARDS` reply
    ///
    /// Known nodes and seeds are queried in turn, `retry_limit` attempts in
    /// total. A node answering with an error reply fails the refresh at once.
    pub async fn refresh_topology(&self) -> RedisResult<()> {
        let _guard = self.refresh_lock.lock().await;
        self.discovered.store(true, Ordering::Release);

        let candidates = self.refresh_candidates().await;
        if candidates.is_empty() {
            return Err(RedisError::Cluster(
                "no known node to fetch the topology from".to_string(),
            ));
        }

        let (name, sub) = topology::discovery_args(self.config.discovery);
        let request = Cmd::new(name).arg(sub);
        let mut last_error = None;

        for conn in candidates.iter().cycle().take(self.config.retry_limit.max(1)) {
            let reply = match conn.request(&request).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("Topology refresh via {} failed: {}", conn.id(), e);
                    if e.is_connection_error() {
                        self.evict(conn.id()).await;
                    }
                    last_error = Some(e);
                    continue;
                }
            };
            if let RespValue::Error(err) = reply {
                return Err(RedisError::Server {
                    node: conn.id().to_string(),
                    message: err.to_string(),
                });
            }

            let answering_host = conn.parameters().host.clone();
            let nodes = topology::parse(self.config.discovery, &reply, &answering_host)?;
            let slots = topology::build_slot_map(&nodes)?;
            self.install(nodes, slots, conn.id()).await?;
            return Ok(());
        }

        Err(last_error.unwrap_or_else(|| {
            RedisError::Cluster("topology refresh made no attempt".to_string())
        }))
    }

    async fn install(
        &self,
        nodes: Vec<redis_conduit_core::NodeInfo>,
        slots: SlotMap,
        source: &str,
    ) -> RedisResult<()> {
        let current = self.topology.read().await.nodes.clone();
        let mut table = HashMap::new();
        for node in nodes.iter().filter(|n| n.is_master) {
            let id = node.address();
            let conn = match current.get(&id) {
                Some(conn) => conn.clone(),
                None => self
                    .factory
                    .create_shared(self.template.with_endpoint(node.host.clone(), node.port))?,
            };
            table.insert(id, conn);
        }
        // Open sockets to other nodes still in the cluster (replicas reached
        // through redirection) stay pooled
        let listed: HashSet<String> = nodes.iter().map(|n| n.address()).collect();
        for (id, conn) in current {
            if !table.contains_key(&id) && listed.contains(&id) && conn.is_connected() {
                debug!("Keeping pooled connection to {}", id);
                table.insert(id, conn);
            }
        }

        info!(
            "Cluster topology refreshed via {}: {} pooled nodes, {} slots assigned",
            source,
            table.len(),
            slots.count()
        );
        *self.topology.write().await = Topology {
            slots,
            nodes: table,
        };
        Ok(())
    }

    async fn refresh_candidates(&self) -> Vec<Arc<NodeConnection>> {
        let mut candidates: Vec<Arc<NodeConnection>> = {
            let topology = self.topology.read().await;
            let mut known: Vec<_> = topology.nodes.values().cloned().collect();
            known.sort_by(|a, b| a.id().cmp(b.id()));
            known
        };
        for seed in &self.seeds {
            if candidates.iter().any(|c| c.id() == seed.node_id()) {
                continue;
            }
            match self.factory.create_shared(seed.clone()) {
                Ok(conn) => candidates.push(conn),
                Err(e) => warn!("Skipping seed {}: {}", seed.node_id(), e),
            }
        }
        candidates
    }

    async fn dispatch(&self, command: &dyn Command) -> RedisResult<(RespValue, String)> {
        if self.config.discover_on_first_use && !self.discovered.load(Ordering::Acquire) {
            if let Err(e) = self.refresh_topology().await {
                warn!("Initial topology discovery failed: {}", e);
            }
        }

        let slot = command_slot(command)?;
        let mut conn = match slot {
            Some(slot) => self.get_connection_by_slot(slot).await?,
            None => self.random_connection().await?,
        };
        let mut failures = 0;
        let mut redirections = 0;
        let mut asking = false;

        loop {
            let result = if asking {
                conn.request_asking(command).await
            } else {
                conn.request(command).await
            };
            asking = false;

            match result {
                Ok(RespValue::Error(err)) => {
                    let Some(redirect) = err.redirect() else {
                        return Ok((RespValue::Error(err), conn.id().to_string()));
                    };
                    redirections += 1;
                    if redirections > self.config.max_redirections {
                        return Err(RedisError::Cluster(format!(
                            "too many redirections ({}) for {}",
                            self.config.max_redirections,
                            command.name()
                        )));
                    }

                    let (host, port) = redirect.target();
                    let host = if host.is_empty() {
                        conn.parameters().host.clone()
                    } else {
                        host.to_string()
                    };
                    match redirect {
                        Redirect::Moved { slot, .. } => {
                            debug!("MOVED slot {} to {}", slot, node_address(&host, port));
                            conn = self.connection_for_node(&host, port).await?;
                            self.topology
                                .write()
                                .await
                                .slots
                                .set(slot, conn.id())?;
                        }
                        Redirect::Ask { slot, .. } => {
                            debug!("ASK slot {} on {}", slot, node_address(&host, port));
                            conn = self.connection_for_node(&host, port).await?;
                            asking = true;
                        }
                    }
                }
                Ok(reply) => return Ok((reply, conn.id().to_string())),
                Err(e) if e.is_connection_error() => {
                    failures += 1;
                    warn!(
                        "Connection to {} failed (attempt {}/{}): {}",
                        conn.id(),
                        failures,
                        self.config.retry_limit,
                        e
                    );
                    self.evict(conn.id()).await;
                    if failures >= self.config.retry_limit {
                        return Err(e);
                    }
                    if !self.config.retry_interval.is_zero() {
                        tokio::time::sleep(self.config.retry_interval).await;
                    }
                    if let Err(refresh_error) = self.refresh_topology().await {
                        warn!("Topology refresh after failure did not complete: {}", refresh_error);
                    }
                    conn = match slot {
                        Some(slot) => self.get_connection_by_slot(slot).await?,
                        None => self.random_connection().await?,
                    };
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Pooled connection for `host:port`, created on first use
    async fn connection_for_node(&self, host: &str, port: u16) -> RedisResult<Arc<NodeConnection>> {
        let id = node_address(host, port);
        if let Some(conn) = self.topology.read().await.nodes.get(&id) {
            return Ok(conn.clone());
        }

        let conn = self
            .factory
            .create_shared(self.template.with_endpoint(host, port))?;
        let mut topology = self.topology.write().await;
        let conn = topology.nodes.entry(id).or_insert(conn).clone();
        Ok(conn)
    }

    async fn random_connection(&self) -> RedisResult<Arc<NodeConnection>> {
        {
            let topology = self.topology.read().await;
            if !topology.nodes.is_empty() {
                return self.pick_random(&topology.nodes);
            }
        }
        let seed = &self.seeds[rand::thread_rng().gen_range(0..self.seeds.len())];
        self.connection_for_node(&seed.host, seed.port).await
    }

    fn pick_random(
        &self,
        nodes: &HashMap<String, Arc<NodeConnection>>,
    ) -> RedisResult<Arc<NodeConnection>> {
        if nodes.is_empty() {
            return Err(RedisError::Cluster("no cluster node available".to_string()));
        }
        let idx = rand::thread_rng().gen_range(0..nodes.len());
        nodes
            .values()
            .nth(idx)
            .cloned()
            .ok_or_else(|| RedisError::Cluster("no cluster node available".to_string()))
    }

    async fn evict(&self, node_id: &str) {
        let evicted = self.topology.write().await.nodes.remove(node_id);
        if let Some(conn) = evicted {
            warn!("Evicting cluster node {}", node_id);
            conn.disconnect().await;
        }
    }
}

#[async_trait]
impl Connection for ClusterRouter {
    /// Connect every pooled node, succeeding if at least one connects
    async fn connect(&self) -> RedisResult<()> {
        let nodes: Vec<_> = self.topology.read().await.nodes.values().cloned().collect();
        let results = join_all(nodes.iter().map(|conn| conn.connect())).await;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        Err(first_error
            .unwrap_or_else(|| RedisError::Cluster("no cluster node to connect".to_string())))
    }

    async fn disconnect(&self) {
        let nodes: Vec<_> = self.topology.read().await.nodes.values().cloned().collect();
        join_all(nodes.iter().map(|conn| conn.disconnect())).await;
    }

    async fn is_connected(&self) -> bool {
        self.topology
            .read()
            .await
            .nodes
            .values()
            .any(|conn| conn.is_connected())
    }

    async fn send(&self, command: &dyn Command) -> RedisResult<RespValue> {
        let (reply, node) = self.dispatch(command).await?;
        apply_error_policy(reply, self.config.error_policy, &node)
    }
}

/// Split `host:port` (IPv6 hosts bracketed) into its parts
fn split_node_id(id: &str) -> Option<(String, u16)> {
    let (host, port) = id.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Some((host.to_string(), port))
}
