//! Command contract consumed by connections and routers
//!
//! Typed command builders live outside this crate; everything here needs only
//! an identifier, the raw arguments and the keys used for routing.

use bytes::Bytes;
use std::fmt;

/// Trait for commands that can be sent to a node
pub trait Command: Send + Sync {
    /// Uppercase command identifier, e.g. `GET`
    fn name(&self) -> &str;

    /// Arguments in wire order, identifier excluded
    fn args(&self) -> &[Bytes];

    /// Keys touched by the command (for sharding and cluster routing)
    fn keys(&self) -> Vec<&[u8]>;

    /// Key used to pick a node, `None` if the command is not hashable
    fn routing_key(&self) -> Option<&[u8]> {
        self.keys().into_iter().next()
    }
}

/// A generic command assembled from raw arguments
///
/// Arguments added with [`Cmd::key`] are remembered as keys.
///
/// ```
/// use redis_conduit::Cmd;
///
/// let cmd = Cmd::new("set").key("user:1").arg("alice");
/// assert_eq!(cmd.to_string(), "SET user:1 alice");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    name: String,
    args: Vec<Bytes>,
    key_positions: Vec<usize>,
}

impl Cmd {
    /// Create a command with no arguments; the identifier is uppercased
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_ascii_uppercase(),
            args: Vec::new(),
            key_positions: Vec::new(),
        }
    }

    /// Append a plain argument
    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.args.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    /// Append several plain arguments
    #[must_use]
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        self.args
            .extend(args.into_iter().map(|a| Bytes::copy_from_slice(a.as_ref())));
        self
    }

    /// Append an argument that is also a routing key
    #[must_use]
    pub fn key(mut self, key: impl AsRef<[u8]>) -> Self {
        self.key_positions.push(self.args.len());
        self.args.push(Bytes::copy_from_slice(key.as_ref()));
        self
    }

    /// Build from already-shaped arguments and the indices of the keys among them
    pub fn from_parts(name: &str, args: Vec<Bytes>, key_positions: Vec<usize>) -> Self {
        let key_positions = key_positions
            .into_iter()
            .filter(|&i| i < args.len())
            .collect();
        Self {
            name: name.to_ascii_uppercase(),
            args,
            key_positions,
        }
    }
}

impl Command for Cmd {
    fn name(&self) -> &str {
        &self.name
    }

    fn args(&self) -> &[Bytes] {
        &self.args
    }

    fn keys(&self) -> Vec<&[u8]> {
        self.key_positions
            .iter()
            .map(|&i| self.args[i].as_ref())
            .collect()
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for arg in &self.args {
            write!(f, " {}", String::from_utf8_lossy(arg))?;
        }
        Ok(())
    }
}

/// Whether an argument equals `word`, ignoring ASCII case
pub(crate) fn arg_is(arg: &[u8], word: &str) -> bool {
    arg.eq_ignore_ascii_case(word.as_bytes())
}
