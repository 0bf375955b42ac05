//! Read-only command classification for master/replica routing
//!
//! Most commands are read-only or not regardless of their arguments. A few
//! (`SORT`, `GEORADIUS`, `GEORADIUSBYMEMBER`, `BITFIELD`) write only when a
//! particular modifier is present, so they carry a predicate over the argument
//! list. Unknown commands are treated as writes.

use crate::command::{arg_is, Command};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Predicate returning `true` when a command is read-only given its arguments
pub type ReadonlyPredicate = Arc<dyn Fn(&[Bytes]) -> bool + Send + Sync>;

/// How a command identifier is classified
#[derive(Clone)]
pub enum Classification {
    /// Never modifies data
    AlwaysReadonly,
    /// Always routed to the master
    AlwaysWrite,
    /// Read-only when the predicate holds for the arguments
    ArgumentDependent(ReadonlyPredicate),
}

impl fmt::Debug for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlwaysReadonly => f.write_str("AlwaysReadonly"),
            Self::AlwaysWrite => f.write_str("AlwaysWrite"),
            Self::ArgumentDependent(_) => f.write_str("ArgumentDependent(..)"),
        }
    }
}

const READONLY_COMMANDS: &[&str] = &[
    "EXISTS",
    "TYPE",
    "KEYS",
    "SCAN",
    "RANDOMKEY",
    "TTL",
    "PTTL",
    "GET",
    "MGET",
    "SUBSTR",
    "STRLEN",
    "GETRANGE",
    "GETBIT",
    "LLEN",
    "LRANGE",
    "LINDEX",
    "SCARD",
    "SISMEMBER",
    "SINTER",
    "SUNION",
    "SDIFF",
    "SMEMBERS",
    "SSCAN",
    "SRANDMEMBER",
    "ZRANGE",
    "ZREVRANGE",
    "ZRANGEBYSCORE",
    "ZREVRANGEBYSCORE",
    "ZCARD",
    "ZSCORE",
    "ZCOUNT",
    "ZRANK",
    "ZREVRANK",
    "ZSCAN",
    "ZLEXCOUNT",
    "ZRANGEBYLEX",
    "ZREVRANGEBYLEX",
    "HGET",
    "HMGET",
    "HEXISTS",
    "HLEN",
    "HKEYS",
    "HVALS",
    "HGETALL",
    "HSCAN",
    "HSTRLEN",
    "PING",
    "AUTH",
    "SELECT",
    "ECHO",
    "QUIT",
    "OBJECT",
    "BITCOUNT",
    "BITPOS",
    "TIME",
    "PFCOUNT",
    "DUMP",
    "GEOHASH",
    "GEOPOS",
    "GEODIST",
];

/// Commands rejected outright when routing between a master and replicas
pub const DISALLOWED_COMMANDS: &[&str] = &[
    "SHUTDOWN",
    "INFO",
    "DBSIZE",
    "LASTSAVE",
    "CONFIG",
    "MONITOR",
    "SLAVEOF",
    "REPLICAOF",
    "SAVE",
    "BGSAVE",
    "BGREWRITEAOF",
    "SLOWLOG",
];

/// Whether any argument from `from` on equals one of `words`
fn has_modifier(args: &[Bytes], from: usize, words: &[&str]) -> bool {
    args.iter()
        .skip(from)
        .any(|arg| words.iter().any(|word| arg_is(arg, word)))
}

/// `SORT key [... STORE destination]`
fn sort_is_readonly(args: &[Bytes]) -> bool {
    !has_modifier(args, 1, &["STORE"])
}

/// `GEORADIUS key longitude latitude radius unit [... STORE|STOREDIST key]`
fn georadius_is_readonly(args: &[Bytes]) -> bool {
    !has_modifier(args, 5, &["STORE", "STOREDIST"])
}

/// `GEORADIUSBYMEMBER key member radius unit [... STORE|STOREDIST key]`
fn georadius_by_member_is_readonly(args: &[Bytes]) -> bool {
    !has_modifier(args, 4, &["STORE", "STOREDIST"])
}

/// `BITFIELD key [GET ...] [SET ...] [INCRBY ...]`
fn bitfield_is_readonly(args: &[Bytes]) -> bool {
    !has_modifier(args, 1, &["SET", "INCRBY"])
}

/// Table mapping command identifiers to their [`Classification`]
#[derive(Debug, Clone)]
pub struct ReadonlyOperationDetector {
    table: HashMap<String, Classification>,
}

impl ReadonlyOperationDetector {
    /// Detector with the built-in classification table
    pub fn new() -> Self {
        let mut table: HashMap<String, Classification> = READONLY_COMMANDS
            .iter()
            .map(|name| (name.to_string(), Classification::AlwaysReadonly))
            .collect();

        let dependent: [(&str, fn(&[Bytes]) -> bool); 4] = [
            ("SORT", sort_is_readonly),
            ("GEORADIUS", georadius_is_readonly),
            ("GEORADIUSBYMEMBER", georadius_by_member_is_readonly),
            ("BITFIELD", bitfield_is_readonly),
        ];
        for (name, predicate) in dependent {
            table.insert(
                name.to_string(),
                Classification::ArgumentDependent(Arc::new(predicate)),
            );
        }

        Self { table }
    }

    /// Override or add the classification of a command
    pub fn set_classification(&mut self, name: &str, classification: Classification) {
        self.table.insert(name.to_ascii_uppercase(), classification);
    }

    /// Classification of a command identifier (`AlwaysWrite` when unknown)
    pub fn classification(&self, name: &str) -> Classification {
        self.table
            .get(&name.to_ascii_uppercase())
            .cloned()
            .unwrap_or(Classification::AlwaysWrite)
    }

    /// Whether `command` can be served by a replica
    pub fn is_readonly(&self, command: &dyn Command) -> bool {
        match self.table.get(&command.name().to_ascii_uppercase()) {
            Some(Classification::AlwaysReadonly) => true,
            Some(Classification::ArgumentDependent(predicate)) => predicate(command.args()),
            Some(Classification::AlwaysWrite) | None => false,
        }
    }

    /// Whether `command` must not be routed at all
    pub fn is_disallowed(&self, command: &dyn Command) -> bool {
        DISALLOWED_COMMANDS
            .iter()
            .any(|name| name.eq_ignore_ascii_case(command.name()))
    }
}

impl Default for ReadonlyOperationDetector {
    fn default() -> Self {
        Self::new()
    }
}
