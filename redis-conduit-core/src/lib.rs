//! Core types for redis-conduit
//!
//! This crate provides the RESP value model, the error taxonomy and the
//! connection/router configuration shared by the redis-conduit routing layer.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod types;
pub mod value;

pub use config::{
    ClusterConfig, ConnectionParameters, DiscoveryCommand, ErrorPolicy, ReplicaSelection,
    ReplicationConfig, ShardingConfig,
};
pub use error::{RedisError, RedisResult};
pub use types::{node_address, NodeInfo, SlotRange, CLUSTER_SLOTS, MAX_SLOT};
pub use value::{ErrorReply, Redirect, RespValue};
