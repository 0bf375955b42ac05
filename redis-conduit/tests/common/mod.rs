//! In-process fake Redis nodes for routing tests
//!
//! A [`MockConnector`] is registered in the factory under the `mock` scheme.
//! Each connect hands out one end of a `tokio::io::duplex` pipe whose other end
//! is served by the scripted [`MockNode`] registered for that `host:port`.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use redis_conduit::protocol::{RespDecoder, RespEncoder};
use redis_conduit::{
    ConnectionFactory, ConnectionParameters, Connector, RedisError, RedisResult, RedisStream,
    RespValue,
};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// What a mock node does with one request
pub enum Action {
    /// Write these bytes back
    Reply(Vec<u8>),
    /// Drop the connection without answering
    Close,
}

impl Action {
    pub fn value(value: RespValue) -> Self {
        let mut buf = BytesMut::new();
        RespEncoder::encode(&value, &mut buf);
        Self::Reply(buf.to_vec())
    }

    pub fn ok() -> Self {
        Self::Reply(b"+OK\r\n".to_vec())
    }

    pub fn bulk(data: &str) -> Self {
        Self::value(RespValue::from(data))
    }

    pub fn error(line: &str) -> Self {
        Self::Reply(format!("-{line}\r\n").into_bytes())
    }
}

type Handler = Box<dyn Fn(&[String]) -> Action + Send + Sync>;

/// A scripted node recording every request it receives
pub struct MockNode {
    pub id: String,
    handler: Handler,
    received: Mutex<Vec<Vec<String>>>,
    connects: AtomicUsize,
}

impl MockNode {
    /// Requests received so far, each as `[NAME, arg, ...]`
    pub fn received(&self) -> Vec<Vec<String>> {
        self.received.lock().unwrap().clone()
    }

    /// Number of received requests whose identifier is `name`
    pub fn count(&self, name: &str) -> usize {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|req| req[0].eq_ignore_ascii_case(name))
            .count()
    }

    /// Number of connections opened to this node
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

/// Connector serving registered mock nodes; unknown addresses refuse to connect
#[derive(Default)]
pub struct MockConnector {
    nodes: Mutex<HashMap<String, Arc<MockNode>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a node at `127.0.0.1:port`
    pub fn node<F>(&self, port: u16, handler: F) -> Arc<MockNode>
    where
        F: Fn(&[String]) -> Action + Send + Sync + 'static,
    {
        let id = format!("127.0.0.1:{port}");
        let node = Arc::new(MockNode {
            id: id.clone(),
            handler: Box::new(handler),
            received: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
        });
        self.nodes.lock().unwrap().insert(id, node.clone());
        node
    }

    /// Factory with the `mock` scheme registered
    pub fn factory(self: &Arc<Self>) -> ConnectionFactory {
        let mut factory = ConnectionFactory::new();
        factory.register("mock", self.clone());
        factory
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, params: &ConnectionParameters) -> RedisResult<Box<dyn RedisStream>> {
        let id = params.node_id();
        let node = self
            .nodes
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| RedisError::connection(&id, "connection refused"))?;
        node.connects.fetch_add(1, Ordering::SeqCst);

        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve(node, server));
        Ok(Box::new(client))
    }
}

async fn serve(node: Arc<MockNode>, mut stream: DuplexStream) {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        loop {
            let mut cursor = Cursor::new(&buf[..]);
            let request = match RespDecoder::decode(&mut cursor) {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(_) => return,
            };
            let pos = cursor.position() as usize;
            buf.advance(pos);

            let args: Vec<String> = match request.as_array() {
                Ok(items) => items
                    .iter()
                    .map(|item| {
                        let bytes = item.as_bytes().unwrap_or_else(|_| Bytes::new());
                        String::from_utf8_lossy(&bytes).into_owned()
                    })
                    .collect(),
                Err(_) => return,
            };
            node.received.lock().unwrap().push(args.clone());

            match (node.handler)(&args) {
                Action::Reply(bytes) => {
                    if stream.write_all(&bytes).await.is_err() {
                        return;
                    }
                }
                Action::Close => return,
            }
        }

        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

/// Parameters for the mock node at `127.0.0.1:port`
pub fn mock_params(port: u16) -> ConnectionParameters {
    ConnectionParameters::tcp("127.0.0.1", port).with_scheme("mock")
}

/// `CLUSTER SLOTS` reply for `(first, last, host, port)` entries
pub fn cluster_slots(entries: &[(i64, i64, &str, i64)]) -> RespValue {
    RespValue::Array(
        entries
            .iter()
            .map(|&(first, last, host, port)| {
                RespValue::Array(vec![
                    RespValue::Integer(first),
                    RespValue::Integer(last),
                    RespValue::Array(vec![RespValue::from(host), RespValue::Integer(port)]),
                ])
            })
            .collect(),
    )
}

/// Install a tracing subscriber honouring `RUST_LOG`, once per test binary
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
