//! Master/replica routing
//!
//! Reads go to a replica until the first write; from then on every command
//! goes to the master until [`ReplicaRouter::reset`] is called. This keeps a
//! caller from reading its own write off a replica that has not caught up yet.

use crate::command::Command;
use crate::connection::{apply_error_policy, Connection, NodeConnection};
use crate::factory::ConnectionFactory;
use crate::readonly::ReadonlyOperationDetector;
use async_trait::async_trait;
use futures_util::future::join_all;
use rand::Rng;
use redis_conduit_core::{
    config::{ConnectionParameters, ReplicaSelection, ReplicationConfig},
    error::{RedisError, RedisResult},
    value::RespValue,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Routes commands between one master and any number of replicas
pub struct ReplicaRouter {
    factory: ConnectionFactory,
    config: ReplicationConfig,
    detector: ReadonlyOperationDetector,
    master: Arc<NodeConnection>,
    /// (name, connection) in insertion order; name is the alias or node id
    replicas: RwLock<Vec<(String, Arc<NodeConnection>)>>,
    pinned: AtomicBool,
    next_replica: AtomicUsize,
}

impl ReplicaRouter {
    /// Build a router; no connection is opened here
    pub fn new(
        factory: ConnectionFactory,
        master: ConnectionParameters,
        replicas: Vec<ConnectionParameters>,
        config: ReplicationConfig,
    ) -> RedisResult<Self> {
        let master = factory.create_shared(master)?;
        let mut named = Vec::with_capacity(replicas.len());
        for params in replicas {
            let name = replica_name(&params);
            if named.iter().any(|(n, _)| *n == name) {
                return Err(RedisError::Config(format!("duplicate replica {name}")));
            }
            named.push((name, factory.create_shared(params)?));
        }

        Ok(Self {
            factory,
            config,
            detector: ReadonlyOperationDetector::new(),
            master,
            replicas: RwLock::new(named),
            pinned: AtomicBool::new(false),
            next_replica: AtomicUsize::new(0),
        })
    }

    /// Replace the read-only classification table
    #[must_use]
    pub fn with_detector(mut self, detector: ReadonlyOperationDetector) -> Self {
        self.detector = detector;
        self
    }

    /// Classification table in use
    pub fn detector(&self) -> &ReadonlyOperationDetector {
        &self.detector
    }

    /// Router configuration
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Master connection
    pub fn master(&self) -> Arc<NodeConnection> {
        self.master.clone()
    }

    /// Replica connection by name
    pub async fn get_replica(&self, name: &str) -> Option<Arc<NodeConnection>> {
        self.replicas
            .read()
            .await
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, conn)| conn.clone())
    }

    /// Names of the configured replicas
    pub async fn replicas(&self) -> Vec<String> {
        self.replicas
            .read()
            .await
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Add a replica, replacing one with the same name
    pub async fn add_replica(&self, params: ConnectionParameters) -> RedisResult<()> {
        let name = replica_name(&params);
        let conn = self.factory.create_shared(params)?;
        let mut replicas = self.replicas.write().await;
        match replicas.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = conn,
            None => replicas.push((name, conn)),
        }
        Ok(())
    }

    /// Remove a replica by name, returning whether it existed
    pub async fn remove_replica(&self, name: &str) -> bool {
        let mut replicas = self.replicas.write().await;
        let before = replicas.len();
        replicas.retain(|(n, _)| n != name);
        replicas.len() != before
    }

    /// Whether every command currently goes to the master
    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Acquire)
    }

    /// Send every following command to the master until [`reset`](Self::reset)
    pub fn pin_to_master(&self) {
        if !self.pinned.swap(true, Ordering::AcqRel) {
            debug!("Pinned to master {}", self.master.id());
        }
    }

    /// Allow reads on replicas again
    pub fn reset(&self) {
        self.pinned.store(false, Ordering::Release);
    }

    /// Whether `command` may be served by a replica
    pub fn is_readonly(&self, command: &dyn Command) -> bool {
        self.detector.is_readonly(command)
    }

    /// Connection the next dispatch of `command` would use
    ///
    /// Updates the pinning state: the first write pins the router to the master.
    pub async fn get_connection(&self, command: &dyn Command) -> RedisResult<Arc<NodeConnection>> {
        if self.detector.is_disallowed(command) {
            return Err(RedisError::Routing(format!(
                "{} is not allowed with master/replica routing",
                command.name()
            )));
        }
        if self.is_pinned() {
            return Ok(self.master.clone());
        }
        if !self.is_readonly(command) {
            self.pin_to_master();
            return Ok(self.master.clone());
        }
        Ok(self.pick_replica().await.unwrap_or_else(|| self.master.clone()))
    }

    /// Send a command and return its reply verbatim
    ///
    /// A replica failing with a connection error is dropped from the pool and
    /// the read retried on another replica, then on the master.
    pub async fn execute(&self, command: &dyn Command) -> RedisResult<RespValue> {
        self.dispatch(command).await.map(|(reply, _)| reply)
    }

    async fn dispatch(&self, command: &dyn Command) -> RedisResult<(RespValue, String)> {
        let mut conn = self.get_connection(command).await?;
        loop {
            match conn.request(command).await {
                Ok(reply) => return Ok((reply, conn.id().to_string())),
                Err(e) if e.is_connection_error() && !Arc::ptr_eq(&conn, &self.master) => {
                    warn!("Replica {} failed, evicting: {}", conn.id(), e);
                    self.evict_replica(&conn).await;
                    conn = match self.pick_replica().await {
                        Some(next) => next,
                        None => {
                            warn!("No replica left, reading from master {}", self.master.id());
                            self.master.clone()
                        }
                    };
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn pick_replica(&self) -> Option<Arc<NodeConnection>> {
        let replicas = self.replicas.read().await;
        if replicas.is_empty() {
            return None;
        }
        let idx = match self.config.replica_selection {
            ReplicaSelection::Random => rand::thread_rng().gen_range(0..replicas.len()),
            ReplicaSelection::RoundRobin => {
                self.next_replica.fetch_add(1, Ordering::Relaxed) % replicas.len()
            }
        };
        Some(replicas[idx].1.clone())
    }

    async fn evict_replica(&self, conn: &Arc<NodeConnection>) {
        self.replicas
            .write()
            .await
            .retain(|(_, c)| !Arc::ptr_eq(c, conn));
        conn.disconnect().await;
    }
}

#[async_trait]
impl Connection for ReplicaRouter {
    /// Connect the master; replicas are connected on a best-effort basis
    async fn connect(&self) -> RedisResult<()> {
        let replicas: Vec<_> = self
            .replicas
            .read()
            .await
            .iter()
            .map(|(_, conn)| conn.clone())
            .collect();
        let (master, replica_results) = tokio::join!(
            self.master.connect(),
            join_all(replicas.iter().map(|conn| conn.connect()))
        );
        for (conn, result) in replicas.iter().zip(replica_results) {
            if let Err(e) = result {
                warn!("Replica {} did not connect: {}", conn.id(), e);
            }
        }
        master
    }

    async fn disconnect(&self) {
        let replicas: Vec<_> = self
            .replicas
            .read()
            .await
            .iter()
            .map(|(_, conn)| conn.clone())
            .collect();
        tokio::join!(
            self.master.disconnect(),
            join_all(replicas.iter().map(|conn| conn.disconnect()))
        );
    }

    async fn is_connected(&self) -> bool {
        self.master.is_connected()
            || self
                .replicas
                .read()
                .await
                .iter()
                .any(|(_, conn)| conn.is_connected())
    }

    async fn send(&self, command: &dyn Command) -> RedisResult<RespValue> {
        let (reply, node) = self.dispatch(command).await?;
        apply_error_policy(reply, self.config.error_policy, &node)
    }
}

fn replica_name(params: &ConnectionParameters) -> String {
    params.alias.clone().unwrap_or_else(|| params.node_id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Cmd;

    fn router(replicas: usize, selection: ReplicaSelection) -> ReplicaRouter {
        let replicas = (0..replicas)
            .map(|i| ConnectionParameters::tcp("127.0.0.1", 6380 + i as u16))
            .collect();
        ReplicaRouter::new(
            ConnectionFactory::new(),
            ConnectionParameters::tcp("127.0.0.1", 6379),
            replicas,
            ReplicationConfig::default().with_replica_selection(selection),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_reads_go_to_replicas_until_first_write() {
        let router = router(2, ReplicaSelection::Random);
        let get = Cmd::new("GET").key("k");

        for _ in 0..10 {
            let conn = router.get_connection(&get).await.unwrap();
            assert_ne!(conn.id(), "127.0.0.1:6379");
        }
        assert!(!router.is_pinned());

        let set = Cmd::new("SET").key("k").arg("v");
        assert_eq!(router.get_connection(&set).await.unwrap().id(), "127.0.0.1:6379");
        assert!(router.is_pinned());
        assert_eq!(router.get_connection(&get).await.unwrap().id(), "127.0.0.1:6379");

        router.reset();
        assert_ne!(router.get_connection(&get).await.unwrap().id(), "127.0.0.1:6379");
    }

    #[tokio::test]
    async fn test_sort_store_pins_master() {
        let router = router(1, ReplicaSelection::Random);
        let sort = Cmd::new("SORT").key("list").arg("STORE").key("dst");
        assert_eq!(router.get_connection(&sort).await.unwrap().id(), "127.0.0.1:6379");
        assert!(router.is_pinned());
    }

    #[tokio::test]
    async fn test_round_robin() {
        let router = router(3, ReplicaSelection::RoundRobin);
        let get = Cmd::new("GET").key("k");
        let mut ids = Vec::new();
        for _ in 0..6 {
            ids.push(router.get_connection(&get).await.unwrap().id().to_string());
        }
        assert_eq!(ids[0..3], ids[3..6]);
        assert_eq!(
            ids[0..3],
            ["127.0.0.1:6380", "127.0.0.1:6381", "127.0.0.1:6382"]
        );
    }

    #[tokio::test]
    async fn test_no_replicas_reads_from_master() {
        let router = router(0, ReplicaSelection::Random);
        let conn = router.get_connection(&Cmd::new("GET").key("k")).await.unwrap();
        assert_eq!(conn.id(), "127.0.0.1:6379");
        assert!(!router.is_pinned());
    }

    #[tokio::test]
    async fn test_disallowed_commands_rejected() {
        let router = router(1, ReplicaSelection::Random);
        let err = router
            .get_connection(&Cmd::new("MONITOR"))
            .await
            .unwrap_err();
        assert!(matches!(err, RedisError::Routing(_)));
        assert!(!router.is_pinned());
    }

    #[tokio::test]
    async fn test_replica_management() {
        let router = router(1, ReplicaSelection::Random);
        router
            .add_replica(ConnectionParameters::tcp("127.0.0.1", 7000).with_alias("reporting"))
            .await
            .unwrap();
        assert_eq!(router.replicas().await, vec!["127.0.0.1:6380", "reporting"]);
        assert!(router.get_replica("reporting").await.is_some());
        assert!(router.remove_replica("127.0.0.1:6380").await);
        assert!(!router.remove_replica("127.0.0.1:6380").await);
        assert_eq!(router.replicas().await, vec!["reporting"]);
    }

    #[test]
    fn test_duplicate_replica_rejected() {
        let result = ReplicaRouter::new(
            ConnectionFactory::new(),
            ConnectionParameters::tcp("127.0.0.1", 6379),
            vec![
                ConnectionParameters::tcp("127.0.0.1", 6380),
                ConnectionParameters::tcp("127.0.0.1", 6380),
            ],
            ReplicationConfig::default(),
        );
        assert!(matches!(result, Err(RedisError::Config(_))));
    }
}
