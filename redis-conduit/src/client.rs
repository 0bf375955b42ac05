//! High-level Redis client
//!
//! [`Client`] puts one of the routers behind the [`Connection`] interface so
//! callers do not need to care how their deployment is laid out.

use crate::cluster::ClusterRouter;
use crate::command::{Cmd, Command};
use crate::connection::{Connection, NodeConnection};
use crate::factory::ConnectionFactory;
use crate::replication::ReplicaRouter;
use crate::sharded::ShardedCluster;
use async_trait::async_trait;
use redis_conduit_core::{
    config::{ClusterConfig, ConnectionParameters},
    error::RedisResult,
    value::RespValue,
};
use std::sync::Arc;
use tracing::info;

/// Redis deployment type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyType {
    /// Standalone Redis server
    Standalone,
    /// Redis Cluster
    Cluster,
}

/// Routing strategy wrapped by a [`Client`]
pub enum Router {
    /// One node
    Single(Arc<NodeConnection>),
    /// Redis Cluster with slot routing
    Cluster(ClusterRouter),
    /// One master and its replicas
    Replication(ReplicaRouter),
    /// Independent nodes behind a hash ring
    Sharded(ShardedCluster),
}

/// High-level Redis client
pub struct Client {
    router: Router,
}

impl Client {
    /// Client over a single node
    pub fn single(conn: NodeConnection) -> Self {
        Self::from(Router::Single(Arc::new(conn)))
    }

    /// Client over a Redis Cluster
    pub fn cluster(router: ClusterRouter) -> Self {
        Self::from(Router::Cluster(router))
    }

    /// Client over a master and its replicas
    pub fn replication(router: ReplicaRouter) -> Self {
        Self::from(Router::Replication(router))
    }

    /// Client over client-side shards
    pub fn sharded(cluster: ShardedCluster) -> Self {
        Self::from(Router::Sharded(cluster))
    }

    /// Connect to `params` and pick single-node or cluster routing
    ///
    /// This will automatically detect whether you're connecting to a
    /// standalone Redis server or a Redis Cluster.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use redis_conduit::{Client, ClusterConfig, Cmd, Connection, ConnectionFactory, ConnectionParameters};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let params = ConnectionParameters::from_url("redis://localhost:6379")?;
    ///     let client = Client::detect(ConnectionFactory::new(), params, ClusterConfig::default()).await?;
    ///     client.send(&Cmd::new("SET").key("greeting").arg("hello")).await?;
    ///     Ok(())
    /// }
    /// ```
    pub async fn detect(
        factory: ConnectionFactory,
        params: ConnectionParameters,
        config: ClusterConfig,
    ) -> RedisResult<Self> {
        info!("Connecting to Redis...");
        let conn = factory.create(params.clone())?;
        match detect_topology(&conn).await? {
            TopologyType::Standalone => {
                info!("Using single-node routing for {}", conn.id());
                Ok(Self::single(conn))
            }
            TopologyType::Cluster => {
                info!("Using cluster routing seeded by {}", conn.id());
                drop(conn);
                Ok(Self::cluster(ClusterRouter::new(factory, vec![params], config)?))
            }
        }
    }

    /// Routing strategy in use
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Deployment type served by this client
    pub fn topology_type(&self) -> TopologyType {
        match self.router {
            Router::Cluster(_) => TopologyType::Cluster,
            _ => TopologyType::Standalone,
        }
    }

    /// Send a command and return its reply verbatim, error replies included
    pub async fn execute(&self, command: &dyn Command) -> RedisResult<RespValue> {
        match &self.router {
            Router::Single(conn) => conn.request(command).await,
            Router::Cluster(router) => router.execute(command).await,
            Router::Replication(router) => router.execute(command).await,
            Router::Sharded(cluster) => cluster.execute(command).await,
        }
    }

    fn inner(&self) -> &dyn Connection {
        match &self.router {
            Router::Single(conn) => conn.as_ref(),
            Router::Cluster(router) => router,
            Router::Replication(router) => router,
            Router::Sharded(cluster) => cluster,
        }
    }
}

impl From<Router> for Client {
    fn from(router: Router) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Connection for Client {
    async fn connect(&self) -> RedisResult<()> {
        self.inner().connect().await
    }

    async fn disconnect(&self) {
        self.inner().disconnect().await;
    }

    async fn is_connected(&self) -> bool {
        self.inner().is_connected().await
    }

    async fn send(&self, command: &dyn Command) -> RedisResult<RespValue> {
        self.inner().send(command).await
    }
}

/// Ask a node whether it is part of a cluster via `CLUSTER INFO`
///
/// Any error reply (cluster support disabled, unknown command) means standalone.
pub async fn detect_topology(conn: &NodeConnection) -> RedisResult<TopologyType> {
    info!("Detecting Redis topology");

    let reply = conn.request(&Cmd::new("CLUSTER").arg("INFO")).await?;
    let info = match reply {
        RespValue::BulkString(data) => String::from_utf8_lossy(&data).into_owned(),
        RespValue::SimpleString(info) => info,
        _ => {
            info!("Detected Standalone Redis (CLUSTER command not available)");
            return Ok(TopologyType::Standalone);
        }
    };

    if info.contains("cluster_enabled:1") || info.contains("cluster_state:ok") {
        info!("Detected Redis Cluster");
        Ok(TopologyType::Cluster)
    } else {
        info!("Detected Standalone Redis");
        Ok(TopologyType::Standalone)
    }
}
