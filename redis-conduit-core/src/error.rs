//! Error types for Redis operations

use thiserror::Error;

/// Result type for Redis operations
pub type RedisResult<T> = Result<T, RedisError>;

/// Comprehensive error type for Redis operations
///
/// Cluster redirections are deliberately absent: `MOVED` and `ASK` replies are
/// surfaced as [`crate::value::Redirect`] values and consumed by the routers.
#[derive(Error, Debug)]
pub enum RedisError {
    /// Malformed RESP framing. The connection that produced it has been dropped.
    #[error("Protocol error on {node}: {message} (connection discarded)")]
    Protocol {
        /// Node the stream belonged to
        node: String,
        /// What was wrong with the stream
        message: String,
    },

    /// Socket-level failure
    #[error("Connection error on {node}: {message}")]
    Connection {
        /// Node the socket pointed at
        node: String,
        /// Underlying failure
        message: String,
    },

    /// Connect, read or write timed out
    #[error("Operation on {node} timed out")]
    Timeout {
        /// Node the socket pointed at
        node: String,
    },

    /// Server returned an error reply that is not a redirection
    #[error("Server error from {node}: {message}")]
    Server {
        /// Node that replied
        node: String,
        /// Full error line, without the leading `-`
        message: String,
    },

    /// Command cannot be routed (no hashable key, keys in different slots, disallowed command)
    #[error("Routing error: {0}")]
    Routing(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// AUTH was rejected while initializing a connection
    #[error("Authentication failed on {node}: {message}")]
    Auth {
        /// Node that rejected the credentials
        node: String,
        /// Server message
        message: String,
    },

    /// An initialization command other than AUTH failed
    #[error("Initialization command {command} failed on {node}: {message}")]
    Initialization {
        /// Node being initialized
        node: String,
        /// Command identifier
        command: String,
        /// Server message
        message: String,
    },

    /// Cluster error
    #[error("Cluster error: {0}")]
    Cluster(String),

    /// Type conversion error
    #[error("Type conversion error: {0}")]
    Type(String),

    /// Unexpected response from server
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl RedisError {
    /// Build a protocol error that is not yet attributed to a node
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            node: String::new(),
            message: message.into(),
        }
    }

    /// Build a connection error for the given node
    pub fn connection(node: impl Into<String>, message: impl ToString) -> Self {
        Self::Connection {
            node: node.into(),
            message: message.to_string(),
        }
    }

    /// Attribute a node-less protocol error to `node`
    #[must_use]
    pub fn at_node(self, node: &str) -> Self {
        match self {
            Self::Protocol { node: n, message } if n.is_empty() => Self::Protocol {
                node: node.to_string(),
                message,
            },
            other => other,
        }
    }

    /// Whether this error is a socket failure or timeout (worth retrying elsewhere)
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Whether the stream was corrupt and the connection has been dropped
    #[must_use]
    pub const fn is_protocol_error(&self) -> bool {
        matches!(self, Self::Protocol { .. })
    }

    /// Node involved in the failure, if any
    #[must_use]
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::Protocol { node, .. }
            | Self::Connection { node, .. }
            | Self::Timeout { node }
            | Self::Server { node, .. }
            | Self::Auth { node, .. }
            | Self::Initialization { node, .. } => Some(node.as_str()),
            _ => None,
        }
    }
}
