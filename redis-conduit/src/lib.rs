//! Async Redis connection and routing layer
//!
//! `redis-conduit` turns commands into RESP frames, sends them to the right
//! node and reads the replies back. It knows three ways of spreading data over
//! several servers:
//!
//! - [`ShardedCluster`]: client-side sharding over a consistent hash ring
//! - [`ClusterRouter`]: Redis Cluster slots, with MOVED/ASK redirection and
//!   topology refresh after failures
//! - [`ReplicaRouter`]: one master and its replicas, reads on replicas until
//!   the first write
//!
//! All of them, and single [`NodeConnection`]s, implement the [`Connection`]
//! trait. Connections are built by a [`ConnectionFactory`], whose transports
//! are looked up by scheme (`tcp`, `unix`, `tls` with the `tls` feature, or
//! any scheme registered by the caller).
//!
//! # Quick Start
//!
//! ```no_run
//! use redis_conduit::{Cmd, Connection, ConnectionFactory, ConnectionParameters};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let factory = ConnectionFactory::new();
//!     let conn = factory.create(ConnectionParameters::from_url("redis://localhost:6379/1")?)?;
//!
//!     conn.send(&Cmd::new("SET").key("mykey").arg("myvalue")).await?;
//!     let value = conn.send(&Cmd::new("GET").key("mykey")).await?;
//!     println!("Value: {:?}", value);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::large_enum_variant)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod cluster;
pub mod command;
pub mod connection;
pub mod factory;
pub mod hashring;
pub mod protocol;
pub mod readonly;
pub mod replication;
pub mod sharded;
pub mod slot_map;
pub mod topology;

pub use client::{Client, Router, TopologyType};
pub use cluster::{calculate_slot, ClusterRouter};
pub use command::{Cmd, Command};
pub use connection::{Connection, NodeConnection, RedisStream, ReplyStream, StreamedReply};
pub use factory::{ConnectionFactory, Connector, TcpConnector};
pub use hashring::HashRing;
pub use readonly::{Classification, ReadonlyOperationDetector};
pub use replication::ReplicaRouter;
pub use sharded::ShardedCluster;
pub use slot_map::SlotMap;

#[cfg(unix)]
pub use factory::UnixConnector;
#[cfg(feature = "tls")]
pub use factory::TlsConnector;

pub use redis_conduit_core::{
    config::{
        ClusterConfig, ConnectionParameters, DiscoveryCommand, ErrorPolicy, ReplicaSelection,
        ReplicationConfig, ShardingConfig,
    },
    error::{RedisError, RedisResult},
    types::{NodeInfo, SlotRange},
    value::{ErrorReply, Redirect, RespValue},
};
