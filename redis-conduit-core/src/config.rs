//! Configuration types for Redis connections and routers

use crate::error::{RedisError, RedisResult};
use crate::types::{node_address, SlotRange};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default Redis port
pub const DEFAULT_PORT: u16 = 6379;

/// What to do with a `-ERR` reply that is not a cluster redirection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Turn the reply into `RedisError::Server`
    #[default]
    Raise,
    /// Hand the reply back as `RespValue::Error` for manual inspection
    Return,
}

/// Parameters describing how to reach one Redis node
///
/// Immutable once a connection has been built from them; routers clone and
/// retarget them (`with_endpoint`) when they discover new nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionParameters {
    /// Transport scheme: `tcp`, `unix`, `tls` or any scheme registered on the factory
    pub scheme: String,

    /// Host name or IP address (ignored for `unix`)
    pub host: String,

    /// TCP port (ignored for `unix`)
    pub port: u16,

    /// Socket path for the `unix` scheme
    pub path: Option<String>,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Read/write operation timeout
    pub read_write_timeout: Duration,

    /// Database selected with SELECT after connecting
    pub database: u32,

    /// ACL username sent with AUTH
    pub username: Option<String>,

    /// Password sent with AUTH
    pub password: Option<String>,

    /// Keep the socket open after the connection object is dropped
    pub persistent: bool,

    /// Optional node alias (used by sharded and replication routers)
    pub alias: Option<String>,

    /// Optional weight on the consistent-hashing ring
    pub weight: Option<u32>,

    /// Slot ranges this node is known to own before any discovery
    pub slots: Vec<SlotRange>,

    /// Enable TCP keepalive
    pub tcp_keepalive: Option<Duration>,

    /// Error reply handling for `NodeConnection::send`
    pub error_policy: ErrorPolicy,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        Self {
            scheme: "tcp".to_string(),
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            path: None,
            connect_timeout: Duration::from_secs(5),
            read_write_timeout: Duration::from_secs(30),
            database: 0,
            username: None,
            password: None,
            persistent: false,
            alias: None,
            weight: None,
            slots: Vec::new(),
            tcp_keepalive: Some(Duration::from_secs(60)),
            error_policy: ErrorPolicy::default(),
        }
    }
}

impl ConnectionParameters {
    /// TCP parameters for `host:port` with every other field defaulted
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Unix socket parameters
    pub fn unix(path: impl Into<String>) -> Self {
        Self {
            scheme: "unix".to_string(),
            path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Parse a connection URI
    ///
    /// Accepts `tcp://`, `redis://`, `rediss://` (TLS), `tls://`, `unix://`
    /// and custom schemes, or a bare `host[:port]`. Query options:
    /// `database`/`db`, `timeout`, `read_write_timeout`, `alias`, `weight`,
    /// `persistent`, `slots` (`0-5460,6000-6100`), `username`, `password`,
    /// `tcp_keepalive` (seconds, `0` disables).
    ///
    /// # Errors
    ///
    /// Returns `RedisError::Config` for malformed ports, numbers or slot ranges.
    pub fn from_url(url: &str) -> RedisResult<Self> {
        let url = url.trim();
        let mut params = Self::default();

        let (scheme, rest) = match url.split_once("://") {
            Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
            None => match url.strip_prefix("unix:") {
                Some(path) => ("unix".to_string(), path),
                None => ("tcp".to_string(), url),
            },
        };
        params.scheme = match scheme.as_str() {
            "redis" => "tcp".to_string(),
            "rediss" => "tls".to_string(),
            _ => scheme,
        };

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };

        if params.scheme == "unix" {
            if location.is_empty() {
                return Err(RedisError::Config(format!("Missing socket path in {url}")));
            }
            params.path = Some(location.to_string());
        } else {
            let (authority, db_path) = match location.split_once('/') {
                Some((authority, path)) => (authority, Some(path)),
                None => (location, None),
            };
            let host_port = match authority.rsplit_once('@') {
                Some((userinfo, host_port)) => {
                    params.apply_userinfo(userinfo);
                    host_port
                }
                None => authority,
            };
            params.apply_host_port(host_port)?;
            if let Some(db) = db_path.filter(|p| !p.is_empty()) {
                params.database = parse_number(db, "database")?;
            }
        }

        for pair in query.unwrap_or("").split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            params.apply_option(key, value)?;
        }

        Ok(params)
    }

    fn apply_userinfo(&mut self, userinfo: &str) {
        match userinfo.split_once(':') {
            Some((user, pass)) => {
                if !user.is_empty() {
                    self.username = Some(user.to_string());
                }
                self.password = Some(pass.to_string());
            }
            None if !userinfo.is_empty() => self.password = Some(userinfo.to_string()),
            None => {}
        }
    }

    fn apply_host_port(&mut self, host_port: &str) -> RedisResult<()> {
        if host_port.is_empty() {
            return Ok(());
        }
        if let Some(bracketed) = host_port.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| RedisError::Config(format!("Unterminated IPv6 host: {host_port}")))?;
            self.host = host.to_string();
            if let Some(port) = tail.strip_prefix(':') {
                self.port = parse_number(port, "port")?;
            }
            return Ok(());
        }
        match host_port.rsplit_once(':') {
            Some((host, port)) => {
                self.host = host.to_string();
                self.port = parse_number(port, "port")?;
            }
            None => self.host = host_port.to_string(),
        }
        Ok(())
    }

    fn apply_option(&mut self, key: &str, value: &str) -> RedisResult<()> {
        match key {
            "database" | "db" => self.database = parse_number(value, key)?,
            "timeout" => self.connect_timeout = parse_seconds(value, key)?,
            "read_write_timeout" => self.read_write_timeout = parse_seconds(value, key)?,
            "alias" => self.alias = Some(value.to_string()),
            "weight" => self.weight = Some(parse_weight(value)?),
            "persistent" => self.persistent = matches!(value, "1" | "true" | "on" | "yes"),
            "username" => self.username = Some(value.to_string()),
            "password" => self.password = Some(value.to_string()),
            "tcp_keepalive" => {
                let keepalive = parse_seconds(value, key)?;
                self.tcp_keepalive = (!keepalive.is_zero()).then_some(keepalive);
            }
            "slots" => {
                for range in value.split(',').filter(|s| !s.is_empty()) {
                    self.slots.push(parse_slot_range(range)?);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Identifier used as a map key: `host:port`, or `unix:<path>`
    #[must_use]
    pub fn node_id(&self) -> String {
        match (&self.path, self.scheme.as_str()) {
            (Some(path), "unix") => format!("unix:{path}"),
            _ => node_address(&self.host, self.port),
        }
    }

    /// Copy of these parameters pointed at another host and port
    ///
    /// Node-specific fields (alias, weight, slots) are cleared.
    #[must_use]
    pub fn with_endpoint(&self, host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            path: None,
            alias: None,
            weight: None,
            slots: Vec::new(),
            ..self.clone()
        }
    }

    /// Set the connection timeout
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the read/write timeout
    #[must_use]
    pub const fn with_read_write_timeout(mut self, timeout: Duration) -> Self {
        self.read_write_timeout = timeout;
        self
    }

    /// Set the password for authentication
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the ACL username
    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set the database number
    #[must_use]
    pub const fn with_database(mut self, database: u32) -> Self {
        self.database = database;
        self
    }

    /// Set the node alias
    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Set the ring weight
    #[must_use]
    pub const fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    /// Add a slot range owned by this node
    #[must_use]
    pub fn with_slots(mut self, range: SlotRange) -> Self {
        self.slots.push(range);
        self
    }

    /// Mark the connection persistent
    #[must_use]
    pub const fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Set the transport scheme
    #[must_use]
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into().to_ascii_lowercase();
        self
    }

    /// Set the error reply policy
    #[must_use]
    pub const fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }
}

/// Largest weight a node may carry on the consistent-hashing ring
pub const MAX_NODE_WEIGHT: u32 = 1024;

fn parse_weight(value: &str) -> RedisResult<u32> {
    let weight: u32 = parse_number(value, "weight")?;
    if weight == 0 || weight > MAX_NODE_WEIGHT {
        return Err(RedisError::Config(format!(
            "Invalid weight: {value:?} (must be 1-{MAX_NODE_WEIGHT})"
        )));
    }
    Ok(weight)
}

fn parse_number<T: std::str::FromStr>(value: &str, what: &str) -> RedisResult<T> {
    value
        .parse::<T>()
        .map_err(|_| RedisError::Config(format!("Invalid {what}: {value:?}")))
}

fn parse_seconds(value: &str, what: &str) -> RedisResult<Duration> {
    let secs: f64 = parse_number(value, what)?;
    Duration::try_from_secs_f64(secs)
        .map_err(|_| RedisError::Config(format!("Invalid {what}: {value:?}")))
}

fn parse_slot_range(text: &str) -> RedisResult<SlotRange> {
    let range = match text.split_once('-') {
        Some((start, end)) => SlotRange::new(
            parse_number(start, "slot")?,
            parse_number(end, "slot")?,
        ),
        None => {
            let slot = parse_number(text, "slot")?;
            SlotRange::new(slot, slot)
        }
    };
    if !range.is_valid() {
        return Err(RedisError::Config(format!("Invalid slot range: {text}")));
    }
    Ok(range)
}

/// Command used to discover a cluster's topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DiscoveryCommand {
    /// `CLUSTER SLOTS`
    #[default]
    Slots,
    /// `CLUSTER SHARDS` (Redis 7+)
    Shards,
}

/// Configuration for the Redis Cluster router
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Maximum attempts for a command hitting connection errors, and for a topology refresh
    pub retry_limit: usize,
    /// Pause between attempts after a connection error
    pub retry_interval: Duration,
    /// Maximum MOVED/ASK hops for a single command
    pub max_redirections: usize,
    /// Topology discovery command
    pub discovery: DiscoveryCommand,
    /// Refresh the topology before the first command if the slot map is empty
    pub discover_on_first_use: bool,
    /// Error reply handling
    pub error_policy: ErrorPolicy,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            retry_limit: 5,
            retry_interval: Duration::from_millis(10),
            max_redirections: 16,
            discovery: DiscoveryCommand::default(),
            discover_on_first_use: true,
            error_policy: ErrorPolicy::default(),
        }
    }
}

impl ClusterConfig {
    /// Set the retry limit
    #[must_use]
    pub const fn with_retry_limit(mut self, limit: usize) -> Self {
        self.retry_limit = limit;
        self
    }

    /// Set the pause between retries
    #[must_use]
    pub const fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the maximum number of redirections followed per command
    #[must_use]
    pub const fn with_max_redirections(mut self, max: usize) -> Self {
        self.max_redirections = max;
        self
    }

    /// Set the discovery command
    #[must_use]
    pub const fn with_discovery(mut self, discovery: DiscoveryCommand) -> Self {
        self.discovery = discovery;
        self
    }

    /// Enable or disable lazy discovery on first use
    #[must_use]
    pub const fn with_discover_on_first_use(mut self, enabled: bool) -> Self {
        self.discover_on_first_use = enabled;
        self
    }

    /// Set the error reply policy
    #[must_use]
    pub const fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }
}

/// How a read is assigned to a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReplicaSelection {
    /// Uniformly at random
    #[default]
    Random,
    /// Cycle through replicas in insertion order
    RoundRobin,
}

/// Configuration for the master/replica router
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Replica selection policy for reads
    pub replica_selection: ReplicaSelection,
    /// Error reply handling
    pub error_policy: ErrorPolicy,
}

impl ReplicationConfig {
    /// Set the replica selection policy
    #[must_use]
    pub const fn with_replica_selection(mut self, selection: ReplicaSelection) -> Self {
        self.replica_selection = selection;
        self
    }

    /// Set the error reply policy
    #[must_use]
    pub const fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }
}

/// Configuration for client-side sharding
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingConfig {
    /// Ring points inserted per unit of node weight
    pub replicas_per_weight: u32,
    /// Error reply handling
    pub error_policy: ErrorPolicy,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            replicas_per_weight: 128,
            error_policy: ErrorPolicy::default(),
        }
    }
}
