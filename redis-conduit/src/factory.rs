//! Building connections from parameters
//!
//! The factory keeps a table of [`Connector`]s keyed by scheme. `tcp` and
//! `unix` are always present, `tls` is added by [`ConnectionFactory::with_tls`]
//! when the `tls` feature is enabled, and callers can register their own
//! transports with [`ConnectionFactory::register`].

use crate::connection::{NodeConnection, RedisStream};
use async_trait::async_trait;
use redis_conduit_core::{
    config::ConnectionParameters,
    error::{RedisError, RedisResult},
};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tracing::debug;

/// Opens the raw byte stream for one scheme
///
/// The connect timeout is applied by the caller.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a stream to the endpoint described by `params`
    async fn connect(&self, params: &ConnectionParameters) -> RedisResult<Box<dyn RedisStream>>;
}

/// Plain TCP, with keepalive and `TCP_NODELAY`
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl TcpConnector {
    async fn open(params: &ConnectionParameters) -> RedisResult<TcpStream> {
        let addr = params.node_id();
        let stream = TcpStream::connect((params.host.as_str(), params.port))
            .await
            .map_err(|e| RedisError::connection(&addr, format!("failed to connect: {e}")))?;

        stream
            .set_nodelay(true)
            .map_err(|e| RedisError::connection(&addr, e))?;

        // Set TCP keepalive if configured
        if let Some(keepalive_duration) = params.tcp_keepalive {
            let socket = socket2::SockRef::from(&stream);
            let keepalive = socket2::TcpKeepalive::new().with_time(keepalive_duration);
            socket.set_tcp_keepalive(&keepalive).map_err(|e| {
                RedisError::connection(&addr, format!("failed to set TCP keepalive: {e}"))
            })?;
        }

        Ok(stream)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, params: &ConnectionParameters) -> RedisResult<Box<dyn RedisStream>> {
        Ok(Box::new(Self::open(params).await?))
    }
}

/// Unix domain sockets
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixConnector;

#[cfg(unix)]
#[async_trait]
impl Connector for UnixConnector {
    async fn connect(&self, params: &ConnectionParameters) -> RedisResult<Box<dyn RedisStream>> {
        let path = params.path.as_deref().ok_or_else(|| {
            RedisError::Config("unix scheme requires a socket path".to_string())
        })?;
        let stream = tokio::net::UnixStream::connect(path)
            .await
            .map_err(|e| RedisError::connection(params.node_id(), e))?;
        Ok(Box::new(stream))
    }
}

/// TLS over TCP using a caller-built rustls client configuration
#[cfg(feature = "tls")]
#[derive(Clone)]
pub struct TlsConnector {
    connector: tokio_rustls::TlsConnector,
}

#[cfg(feature = "tls")]
impl TlsConnector {
    /// Wrap a pre-built `ClientConfig` (root certificates, ALPN, client auth)
    pub fn new(config: Arc<tokio_rustls::rustls::ClientConfig>) -> Self {
        Self {
            connector: tokio_rustls::TlsConnector::from(config),
        }
    }
}

#[cfg(feature = "tls")]
#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self, params: &ConnectionParameters) -> RedisResult<Box<dyn RedisStream>> {
        use tokio_rustls::rustls::pki_types::ServerName;

        let tcp = TcpConnector::open(params).await?;
        let sni = ServerName::try_from(params.host.clone()).map_err(|e| {
            RedisError::Config(format!("invalid TLS server name {}: {e}", params.host))
        })?;
        let stream = self
            .connector
            .connect(sni, tcp)
            .await
            .map_err(|e| RedisError::connection(params.node_id(), format!("TLS handshake failed: {e}")))?;
        Ok(Box::new(stream))
    }
}

/// Initialized streams parked by dropped persistent connections
#[derive(Default)]
pub(crate) struct PersistentRegistry {
    streams: Mutex<HashMap<String, Vec<Box<dyn RedisStream>>>>,
}

impl PersistentRegistry {
    pub(crate) fn park(&self, key: String, stream: Box<dyn RedisStream>) {
        if let Ok(mut streams) = self.streams.lock() {
            streams.entry(key).or_default().push(stream);
        }
    }

    pub(crate) fn take(&self, key: &str) -> Option<Box<dyn RedisStream>> {
        let mut streams = self.streams.lock().ok()?;
        let parked = streams.get_mut(key)?;
        let stream = parked.pop();
        if parked.is_empty() {
            streams.remove(key);
        }
        stream
    }

    fn len(&self) -> usize {
        self.streams
            .lock()
            .map(|streams| streams.values().map(Vec::len).sum())
            .unwrap_or(0)
    }
}

/// Builds [`NodeConnection`]s, choosing the transport by scheme
///
/// Cloning is cheap and clones share connectors and parked persistent streams.
#[derive(Clone)]
pub struct ConnectionFactory {
    connectors: HashMap<String, Arc<dyn Connector>>,
    persistent: Arc<PersistentRegistry>,
}

impl ConnectionFactory {
    /// Factory with the `tcp` and `unix` schemes
    pub fn new() -> Self {
        let mut factory = Self {
            connectors: HashMap::new(),
            persistent: Arc::new(PersistentRegistry::default()),
        };
        factory.register("tcp", Arc::new(TcpConnector));
        #[cfg(unix)]
        factory.register("unix", Arc::new(UnixConnector));
        factory
    }

    /// Add the `tls` scheme
    #[cfg(feature = "tls")]
    #[must_use]
    pub fn with_tls(mut self, config: Arc<tokio_rustls::rustls::ClientConfig>) -> Self {
        self.register("tls", Arc::new(TlsConnector::new(config)));
        self
    }

    /// Register (or replace) the connector for a scheme
    pub fn register(&mut self, scheme: impl Into<String>, connector: Arc<dyn Connector>) {
        let scheme = scheme.into().to_ascii_lowercase();
        debug!("Registering connector for scheme {}", scheme);
        self.connectors.insert(scheme, connector);
    }

    /// Whether a connector is registered for `scheme`
    pub fn supports(&self, scheme: &str) -> bool {
        self.connectors.contains_key(&scheme.to_ascii_lowercase())
    }

    /// Build a disconnected connection
    ///
    /// Fails with [`RedisError::Config`] when no connector handles the scheme.
    pub fn create(&self, params: ConnectionParameters) -> RedisResult<NodeConnection> {
        let scheme = params.scheme.to_ascii_lowercase();
        let connector = self.connectors.get(&scheme).cloned().ok_or_else(|| {
            RedisError::Config(format!("unknown connection scheme: {}", params.scheme))
        })?;
        if scheme == "unix" && params.path.is_none() {
            return Err(RedisError::Config(
                "unix scheme requires a socket path".to_string(),
            ));
        }

        let persistent = params.persistent.then(|| self.persistent.clone());
        Ok(NodeConnection::new(params, connector, persistent))
    }

    /// [`create`](Self::create), wrapped for sharing between routers
    pub fn create_shared(&self, params: ConnectionParameters) -> RedisResult<Arc<NodeConnection>> {
        self.create(params).map(Arc::new)
    }

    /// Parse a connection URL and build a connection from it
    pub fn create_from_url(&self, url: &str) -> RedisResult<NodeConnection> {
        self.create(ConnectionParameters::from_url(url)?)
    }

    /// Number of streams parked by dropped persistent connections
    pub fn parked_connections(&self) -> usize {
        self.persistent.len()
    }
}

impl Default for ConnectionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut schemes: Vec<&str> = self.connectors.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        f.debug_struct("ConnectionFactory")
            .field("schemes", &schemes)
            .finish()
    }
}
