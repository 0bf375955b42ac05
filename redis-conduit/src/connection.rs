//! Single-node connections
//!
//! A [`NodeConnection`] owns at most one socket to one Redis node. It connects
//! lazily, replays its initialization commands (AUTH, SELECT, ...) on every
//! fresh socket, and performs one request/reply exchange at a time: the socket
//! lives behind an async mutex so concurrent callers queue up instead of
//! interleaving frames on the wire.

use crate::command::{Cmd, Command};
use crate::factory::{Connector, PersistentRegistry};
use crate::protocol::{ReplyHead, RespDecoder, RespEncoder};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use redis_conduit_core::{
    config::{ConnectionParameters, ErrorPolicy},
    error::{RedisError, RedisResult},
    value::RespValue,
};
use std::fmt;
use std::future::Future;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Byte stream a connection talks RESP over
pub trait RedisStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T> RedisStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

/// The narrow interface shared by single connections and every router
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open the underlying socket(s)
    async fn connect(&self) -> RedisResult<()>;

    /// Close the underlying socket(s)
    async fn disconnect(&self);

    /// Whether at least one socket is open
    async fn is_connected(&self) -> bool;

    /// Send a command and read its reply
    async fn send(&self, command: &dyn Command) -> RedisResult<RespValue>;
}

struct ConnState {
    stream: Option<Box<dyn RedisStream>>,
    read_buffer: BytesMut,
}

/// A connection to one Redis node
pub struct NodeConnection {
    id: String,
    params: Arc<ConnectionParameters>,
    connector: Arc<dyn Connector>,
    persistent: Option<Arc<PersistentRegistry>>,
    init_commands: Vec<Cmd>,
    state: Mutex<ConnState>,
    connected: AtomicBool,
}

impl NodeConnection {
    pub(crate) fn new(
        params: ConnectionParameters,
        connector: Arc<dyn Connector>,
        persistent: Option<Arc<PersistentRegistry>>,
    ) -> Self {
        let mut init_commands = Vec::new();
        if let Some(ref password) = params.password {
            let auth = match params.username {
                Some(ref user) => Cmd::new("AUTH").arg(user).arg(password),
                None => Cmd::new("AUTH").arg(password),
            };
            init_commands.push(auth);
        }
        if params.database != 0 {
            init_commands.push(Cmd::new("SELECT").arg(params.database.to_string()));
        }

        Self {
            id: params.node_id(),
            params: Arc::new(params),
            connector,
            persistent,
            init_commands,
            state: Mutex::new(ConnState {
                stream: None,
                read_buffer: BytesMut::with_capacity(8192),
            }),
            connected: AtomicBool::new(false),
        }
    }

    /// `host:port` (or `unix:<path>`) identifying this node
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Parameters this connection was built from
    pub fn parameters(&self) -> &ConnectionParameters {
        &self.params
    }

    /// Commands replayed, in order, on every fresh socket
    pub fn init_commands(&self) -> &[Cmd] {
        &self.init_commands
    }

    /// Queue a command to replay after every successful connect
    ///
    /// Takes effect on the next socket that is opened.
    pub fn push_init_command(&mut self, command: Cmd) {
        self.init_commands.push(command);
    }

    /// Open the socket if it is not open yet
    pub async fn connect(&self) -> RedisResult<()> {
        let mut state = self.state.lock().await;
        self.ensure_open(&mut state).await
    }

    /// Close the socket
    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        if state.stream.is_some() {
            debug!("Disconnecting from {}", self.id);
        }
        self.discard(&mut state);
    }

    /// Whether the socket is open
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Send a command and read its reply, applying this connection's error policy
    pub async fn send(&self, command: &dyn Command) -> RedisResult<RespValue> {
        let reply = self.request(command).await?;
        apply_error_policy(reply, self.params.error_policy, &self.id)
    }

    /// Send a command and return its reply verbatim, error replies included
    pub async fn request(&self, command: &dyn Command) -> RedisResult<RespValue> {
        let mut state = self.state.lock().await;
        self.ensure_open(&mut state).await?;
        self.exchange(&mut state, command).await
    }

    /// Send `ASKING` followed by `command` without letting another request in between
    pub async fn request_asking(&self, command: &dyn Command) -> RedisResult<RespValue> {
        let mut state = self.state.lock().await;
        self.ensure_open(&mut state).await?;
        let asking = self.exchange(&mut state, &Cmd::new("ASKING")).await?;
        if asking.is_error() {
            return Ok(asking);
        }
        self.exchange(&mut state, command).await
    }

    /// Send a command whose reply is consumed element by element
    ///
    /// Non-array replies come back whole. The connection stays locked until the
    /// returned stream is dropped.
    pub async fn send_streaming(&self, command: &dyn Command) -> RedisResult<StreamedReply<'_>> {
        let mut state = self.state.lock().await;
        self.ensure_open(&mut state).await?;

        let payload = RespEncoder::encode_command(command.name(), command.args());
        let written = self.io(self.write_frame(&mut state, &payload)).await;
        self.settle(&mut state, written)?;
        let head = self.io(self.read_head(&mut state)).await;
        let head = self.settle(&mut state, head)?;

        match head {
            ReplyHead::Complete(reply) => Ok(StreamedReply::Value(apply_error_policy(
                reply,
                self.params.error_policy,
                &self.id,
            )?)),
            ReplyHead::Array(len) => Ok(StreamedReply::Array(ReplyStream {
                conn: self,
                state,
                remaining: len,
                total: len,
            })),
        }
    }

    async fn ensure_open(&self, state: &mut ConnState) -> RedisResult<()> {
        if state.stream.is_some() {
            return Ok(());
        }

        if self.params.persistent {
            if let Some(stream) = self
                .persistent
                .as_ref()
                .and_then(|registry| registry.take(&persistent_key(&self.params)))
            {
                debug!("Reusing persistent connection to {}", self.id);
                state.stream = Some(stream);
                state.read_buffer.clear();
                self.connected.store(true, Ordering::Release);
                return Ok(());
            }
        }

        debug!("Connecting to Redis at {}", self.id);
        let stream = timeout(self.params.connect_timeout, self.connector.connect(&self.params))
            .await
            .map_err(|_| RedisError::Timeout {
                node: self.id.clone(),
            })??;

        state.stream = Some(stream);
        state.read_buffer.clear();

        for command in &self.init_commands {
            let reply = match self.exchange(state, command).await {
                Ok(reply) => reply,
                Err(e) => {
                    self.discard(state);
                    return Err(e);
                }
            };
            if let RespValue::Error(err) = reply {
                self.discard(state);
                return Err(if command.name() == "AUTH" {
                    RedisError::Auth {
                        node: self.id.clone(),
                        message: err.to_string(),
                    }
                } else {
                    RedisError::Initialization {
                        node: self.id.clone(),
                        command: command.name().to_string(),
                        message: err.to_string(),
                    }
                });
            }
        }

        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn exchange(&self, state: &mut ConnState, command: &dyn Command) -> RedisResult<RespValue> {
        let payload = RespEncoder::encode_command(command.name(), command.args());
        let written = self.io(self.write_frame(state, &payload)).await;
        self.settle(state, written)?;
        let reply = self.io(self.read_reply(state)).await;
        self.settle(state, reply)
    }

    /// Bound one I/O step by the read/write timeout (zero disables it)
    async fn io<T>(&self, step: impl Future<Output = RedisResult<T>>) -> RedisResult<T> {
        let limit = self.params.read_write_timeout;
        if limit.is_zero() {
            return step.await;
        }
        match timeout(limit, step).await {
            Ok(result) => result,
            Err(_) => Err(RedisError::Timeout {
                node: self.id.clone(),
            }),
        }
    }

    /// Drop the socket after a failure that leaves the stream unusable
    fn settle<T>(&self, state: &mut ConnState, result: RedisResult<T>) -> RedisResult<T> {
        match result {
            Err(e) if e.is_connection_error() || e.is_protocol_error() => {
                warn!("Dropping connection to {}: {}", self.id, e);
                self.discard(state);
                Err(e.at_node(&self.id))
            }
            other => other,
        }
    }

    async fn write_frame(&self, state: &mut ConnState, payload: &[u8]) -> RedisResult<()> {
        let stream = state
            .stream
            .as_mut()
            .ok_or_else(|| RedisError::connection(&self.id, "not connected"))?;

        let mut written = 0;
        while written < payload.len() {
            let n = stream
                .write(&payload[written..])
                .await
                .map_err(|e| RedisError::connection(&self.id, e))?;
            if n == 0 {
                return Err(RedisError::connection(
                    &self.id,
                    "socket accepted zero bytes of a non-empty write",
                ));
            }
            written += n;
        }
        stream
            .flush()
            .await
            .map_err(|e| RedisError::connection(&self.id, e))
    }

    async fn read_reply(&self, state: &mut ConnState) -> RedisResult<RespValue> {
        self.read_with(state, RespDecoder::decode).await
    }

    async fn read_head(&self, state: &mut ConnState) -> RedisResult<ReplyHead> {
        self.read_with(state, RespDecoder::decode_head).await
    }

    /// Decode from the buffer, reading more from the socket until a frame is complete
    async fn read_with<T>(
        &self,
        state: &mut ConnState,
        decode: fn(&mut Cursor<&[u8]>) -> RedisResult<Option<T>>,
    ) -> RedisResult<T> {
        loop {
            let mut cursor = Cursor::new(&state.read_buffer[..]);
            if let Some(value) = decode(&mut cursor)? {
                let pos = cursor.position() as usize;
                state.read_buffer.advance(pos);
                return Ok(value);
            }

            let stream = state
                .stream
                .as_mut()
                .ok_or_else(|| RedisError::connection(&self.id, "not connected"))?;
            let n = stream
                .read_buf(&mut state.read_buffer)
                .await
                .map_err(|e| RedisError::connection(&self.id, e))?;
            if n == 0 {
                return Err(RedisError::connection(
                    &self.id,
                    "connection closed by server",
                ));
            }
        }
    }

    fn discard(&self, state: &mut ConnState) {
        state.stream = None;
        state.read_buffer.clear();
        self.connected.store(false, Ordering::Release);
    }
}

impl Drop for NodeConnection {
    fn drop(&mut self) {
        if !self.params.persistent {
            return;
        }
        let Some(registry) = self.persistent.take() else {
            return;
        };
        let state = self.state.get_mut();
        if !state.read_buffer.is_empty() {
            return;
        }
        if let Some(stream) = state.stream.take() {
            debug!("Parking persistent connection to {}", self.id);
            registry.park(persistent_key(&self.params), stream);
        }
    }
}

impl fmt::Debug for NodeConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConnection")
            .field("id", &self.id)
            .field("scheme", &self.params.scheme)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl fmt::Display for NodeConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

#[async_trait]
impl Connection for NodeConnection {
    async fn connect(&self) -> RedisResult<()> {
        NodeConnection::connect(self).await
    }

    async fn disconnect(&self) {
        NodeConnection::disconnect(self).await;
    }

    async fn is_connected(&self) -> bool {
        NodeConnection::is_connected(self)
    }

    async fn send(&self, command: &dyn Command) -> RedisResult<RespValue> {
        NodeConnection::send(self, command).await
    }
}

/// Reply of [`NodeConnection::send_streaming`]
pub enum StreamedReply<'a> {
    /// A non-array reply
    Value(RespValue),
    /// An array whose elements are read on demand
    Array(ReplyStream<'a>),
}

/// Forward-only reader over the elements of an array reply
///
/// Dropping it before every element was read discards the connection, since
/// the unread elements would otherwise be taken for the next reply.
pub struct ReplyStream<'a> {
    conn: &'a NodeConnection,
    state: MutexGuard<'a, ConnState>,
    remaining: usize,
    total: usize,
}

impl ReplyStream<'_> {
    /// Number of elements announced by the array header
    pub fn len(&self) -> usize {
        self.total
    }

    /// Whether the array is empty
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Elements not read yet
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Read the next element, `None` once the array is exhausted
    pub async fn next(&mut self) -> Option<RedisResult<RespValue>> {
        if self.remaining == 0 {
            return None;
        }
        let conn = self.conn;
        let result = conn.io(conn.read_reply(&mut self.state)).await;
        let result = conn.settle(&mut self.state, result);
        match result {
            Ok(value) => {
                self.remaining -= 1;
                Some(Ok(value))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }

    /// Read every remaining element
    pub async fn collect(mut self) -> RedisResult<Vec<RespValue>> {
        let mut items = Vec::with_capacity(self.remaining.min(1024));
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }
}

impl Drop for ReplyStream<'_> {
    fn drop(&mut self) {
        if self.remaining > 0 {
            warn!(
                "Array reply from {} abandoned with {} unread elements, dropping connection",
                self.conn.id, self.remaining
            );
            self.conn.discard(&mut self.state);
        }
    }
}

/// Apply an [`ErrorPolicy`] to a raw reply
pub(crate) fn apply_error_policy(
    reply: RespValue,
    policy: ErrorPolicy,
    node: &str,
) -> RedisResult<RespValue> {
    match (reply, policy) {
        (RespValue::Error(err), ErrorPolicy::Raise) => Err(RedisError::Server {
            node: node.to_string(),
            message: err.to_string(),
        }),
        (reply, _) => Ok(reply),
    }
}

fn persistent_key(params: &ConnectionParameters) -> String {
    format!(
        "{}/{}/{}",
        params.node_id(),
        params.database,
        params.username.as_deref().unwrap_or("")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::ConnectionFactory;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    /// Connector handing out one end of an in-memory pipe per connect
    struct PipeConnector {
        server_ends: std::sync::Mutex<Vec<DuplexStream>>,
    }

    #[async_trait]
    impl Connector for PipeConnector {
        async fn connect(
            &self,
            params: &ConnectionParameters,
        ) -> RedisResult<Box<dyn RedisStream>> {
            let (client, server) = tokio::io::duplex(64 * 1024);
            self.server_ends
                .lock()
                .map_err(|_| RedisError::connection(params.node_id(), "poisoned"))?
                .push(server);
            Ok(Box::new(client))
        }
    }

    fn pipe_connection(params: ConnectionParameters) -> (NodeConnection, Arc<PipeConnector>) {
        let connector = Arc::new(PipeConnector {
            server_ends: std::sync::Mutex::new(Vec::new()),
        });
        let mut factory = ConnectionFactory::new();
        factory.register("pipe", connector.clone());
        let conn = factory
            .create(params.with_scheme("pipe"))
            .expect("pipe scheme registered");
        (conn, connector)
    }

    async fn server_end(connector: &PipeConnector) -> DuplexStream {
        connector.server_ends.lock().unwrap().remove(0)
    }

    async fn read_exactly(server: &mut DuplexStream, expected: &[u8]) {
        let mut buf = vec![0u8; expected.len()];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(
            String::from_utf8_lossy(&buf),
            String::from_utf8_lossy(expected)
        );
    }

    #[tokio::test]
    async fn test_lazy_connect_and_send() {
        let (conn, connector) = pipe_connection(ConnectionParameters::tcp("10.0.0.1", 7000));
        assert!(!conn.is_connected());

        let client = tokio::spawn(async move {
            let reply = conn.send(&Cmd::new("GET").key("k")).await;
            (conn, reply)
        });

        tokio::task::yield_now().await;
        let mut server = loop {
            if let Some(server) = connector.server_ends.lock().unwrap().pop() {
                break server;
            }
            tokio::task::yield_now().await;
        };
        read_exactly(&mut server, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n").await;
        server.write_all(b"$2\r\nhi\r\n").await.unwrap();

        let (conn, reply) = client.await.unwrap();
        assert_eq!(reply.unwrap(), RespValue::BulkString(Bytes::from("hi")));
        assert!(conn.is_connected());
        assert_eq!(conn.id(), "10.0.0.1:7000");
    }

    #[tokio::test]
    async fn test_init_commands_replayed_in_order() {
        let params = ConnectionParameters::tcp("10.0.0.1", 7000)
            .with_password("secret")
            .with_database(2);
        let (mut conn, connector) = pipe_connection(params);
        conn.push_init_command(Cmd::new("CLIENT").arg("SETNAME").arg("worker"));
        assert_eq!(conn.init_commands().len(), 3);

        let client = tokio::spawn(async move {
            let result = conn.connect().await;
            (conn, result)
        });
        let mut server = loop {
            if let Some(server) = connector.server_ends.lock().unwrap().pop() {
                break server;
            }
            tokio::task::yield_now().await;
        };
        read_exactly(&mut server, b"*2\r\n$4\r\nAUTH\r\n$6\r\nsecret\r\n").await;
        server.write_all(b"+OK\r\n").await.unwrap();
        read_exactly(&mut server, b"*2\r\n$6\r\nSELECT\r\n$1\r\n2\r\n").await;
        server.write_all(b"+OK\r\n").await.unwrap();
        read_exactly(
            &mut server,
            b"*3\r\n$6\r\nCLIENT\r\n$7\r\nSETNAME\r\n$6\r\nworker\r\n",
        )
        .await;
        server.write_all(b"+OK\r\n").await.unwrap();

        let (conn, result) = client.await.unwrap();
        result.unwrap();
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_auth_failure_aborts_connect() {
        let params = ConnectionParameters::tcp("10.0.0.1", 7000).with_password("wrong");
        let (conn, connector) = pipe_connection(params);

        let client = tokio::spawn(async move {
            let result = conn.connect().await;
            (conn, result)
        });
        let mut server = loop {
            if let Some(server) = connector.server_ends.lock().unwrap().pop() {
                break server;
            }
            tokio::task::yield_now().await;
        };
        read_exactly(&mut server, b"*2\r\n$4\r\nAUTH\r\n$5\r\nwrong\r\n").await;
        server
            .write_all(b"-WRONGPASS invalid username-password pair\r\n")
            .await
            .unwrap();

        let (conn, result) = client.await.unwrap();
        assert!(matches!(result, Err(RedisError::Auth { .. })));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_error_policy() {
        let reply = RespValue::Error(redis_conduit_core::ErrorReply::new("ERR nope"));
        let raised = apply_error_policy(reply.clone(), ErrorPolicy::Raise, "a:1").unwrap_err();
        assert!(matches!(raised, RedisError::Server { ref node, .. } if node == "a:1"));
        assert_eq!(
            apply_error_policy(reply.clone(), ErrorPolicy::Return, "a:1").unwrap(),
            reply
        );
    }

    #[tokio::test]
    async fn test_protocol_error_discards_connection() {
        let (conn, connector) = pipe_connection(ConnectionParameters::tcp("10.0.0.1", 7000));
        conn.connect().await.unwrap();
        let mut server = server_end(&connector).await;
        server.write_all(b"!garbage\r\n").await.unwrap();

        let err = conn.send(&Cmd::new("PING")).await.unwrap_err();
        assert!(err.is_protocol_error());
        assert_eq!(err.node(), Some("10.0.0.1:7000"));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_read_timeout_is_connection_error() {
        let params = ConnectionParameters::tcp("10.0.0.1", 7000)
            .with_read_write_timeout(Duration::from_millis(20));
        let (conn, connector) = pipe_connection(params);
        conn.connect().await.unwrap();
        let _server = server_end(&connector).await;

        let err = conn.send(&Cmd::new("PING")).await.unwrap_err();
        assert!(matches!(err, RedisError::Timeout { .. }));
        assert!(err.is_connection_error());
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_closed_socket_is_connection_error() {
        let (conn, connector) = pipe_connection(ConnectionParameters::tcp("10.0.0.1", 7000));
        conn.connect().await.unwrap();
        drop(server_end(&connector).await);

        let err = conn.send(&Cmd::new("PING")).await.unwrap_err();
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn test_streaming_array() {
        let (conn, connector) = pipe_connection(ConnectionParameters::tcp("10.0.0.1", 7000));
        conn.connect().await.unwrap();
        let mut server = server_end(&connector).await;
        server
            .write_all(b"*3\r\n$1\r\na\r\n:2\r\n$-1\r\n+after\r\n")
            .await
            .unwrap();

        match conn.send_streaming(&Cmd::new("LRANGE").key("l")).await.unwrap() {
            StreamedReply::Array(mut items) => {
                assert_eq!(items.len(), 3);
                assert_eq!(
                    items.next().await.unwrap().unwrap(),
                    RespValue::BulkString(Bytes::from("a"))
                );
                assert_eq!(items.remaining(), 2);
                let rest = items.collect().await.unwrap();
                assert_eq!(rest, vec![RespValue::Integer(2), RespValue::Null]);
            }
            StreamedReply::Value(v) => panic!("expected array, got {v:?}"),
        }

        assert_eq!(
            conn.send(&Cmd::new("PING")).await.unwrap(),
            RespValue::SimpleString("after".to_string())
        );
    }

    #[tokio::test]
    async fn test_abandoned_stream_discards_connection() {
        let (conn, connector) = pipe_connection(ConnectionParameters::tcp("10.0.0.1", 7000));
        conn.connect().await.unwrap();
        let mut server = server_end(&connector).await;
        server.write_all(b"*2\r\n:1\r\n:2\r\n").await.unwrap();

        match conn.send_streaming(&Cmd::new("SMEMBERS").key("s")).await.unwrap() {
            StreamedReply::Array(mut items) => {
                items.next().await.unwrap().unwrap();
            }
            StreamedReply::Value(v) => panic!("expected array, got {v:?}"),
        }
        assert!(!conn.is_connected());
    }
}
