use bytes::Bytes;

use crate::cluster::slots::key_slot;
use crate::proto::frame::Frame;

/// A command ready to be sent to a node.
///
/// Commands are built with the builder pattern and converted to frames for
/// transmission.
///
/// # Example
///
/// ```
/// use shoal::core::command::Cmd;
///
/// let cmd = Cmd::new("SET").arg("key").arg("value");
/// let get = Cmd::new("GET").arg("key");
/// ```
#[derive(Debug, Clone)]
pub struct Cmd {
    args: Vec<Bytes>,
}

impl Cmd {
    /// Creates a new command with the given name.
    #[inline]
    pub fn new(name: impl Into<Bytes>) -> Self {
        Self {
            args: vec![name.into()],
        }
    }

    /// Appends an argument to the command.
    #[inline]
    pub fn arg<T: Into<Bytes>>(mut self, arg: T) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Returns the command name, uppercased.
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.args[0]).to_ascii_uppercase()
    }

    /// Returns the raw arguments, name included.
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Returns the hash slot of the command's first key, if it has one.
    pub fn slot(&self) -> Option<u16> {
        self.first_key().map(|key| key_slot(&key))
    }

    /// Returns the first key argument, if the command carries keys.
    ///
    /// Most commands take their key as the first argument. Script commands
    /// declare a key count followed by the keys themselves; keyless
    /// commands have no key at all.
    pub fn first_key(&self) -> Option<Bytes> {
        let name = self.name();
        if is_keyless(&name) {
            return None;
        }
        match name.as_str() {
            "EVAL" | "EVALSHA" | "FCALL" | "FCALL_RO" => {
                let numkeys: u64 = std::str::from_utf8(self.args.get(2)?)
                    .ok()?
                    .parse()
                    .ok()?;
                if numkeys == 0 {
                    None
                } else {
                    self.args.get(3).cloned()
                }
            }
            _ => self.args.get(1).cloned(),
        }
    }

    /// Converts the command to an array frame.
    #[inline]
    pub fn into_frame(self) -> Frame {
        Frame::Array(
            self.args
                .into_iter()
                .map(|b| Frame::BulkString(Some(b)))
                .collect(),
        )
    }
}

/// Whether the subscriber mode of a connection is entered or left by a
/// command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberMode {
    /// SUBSCRIBE and PSUBSCRIBE.
    Enter,
    /// UNSUBSCRIBE and PUNSUBSCRIBE.
    Exit,
}

/// Commands that never carry a key.
const KEYLESS: &[&str] = &[
    "ASKING",
    "AUTH",
    "BGREWRITEAOF",
    "BGSAVE",
    "CLIENT",
    "CLUSTER",
    "COMMAND",
    "CONFIG",
    "DBSIZE",
    "ECHO",
    "FLUSHALL",
    "FLUSHDB",
    "HELLO",
    "INFO",
    "LASTSAVE",
    "PING",
    "PSUBSCRIBE",
    "PUNSUBSCRIBE",
    "QUIT",
    "READONLY",
    "READWRITE",
    "RESET",
    "SAVE",
    "SCRIPT",
    "SELECT",
    "SHUTDOWN",
    "SUBSCRIBE",
    "TIME",
    "UNSUBSCRIBE",
    "WAIT",
];

/// Commands that only read data and may be served by replicas.
const READONLY: &[&str] = &[
    "BITCOUNT",
    "BITPOS",
    "DBSIZE",
    "DUMP",
    "EXISTS",
    "EXPIRETIME",
    "GEODIST",
    "GEOHASH",
    "GEOPOS",
    "GEOSEARCH",
    "GET",
    "GETBIT",
    "GETRANGE",
    "HEXISTS",
    "HGET",
    "HGETALL",
    "HKEYS",
    "HLEN",
    "HMGET",
    "HRANDFIELD",
    "HSCAN",
    "HSTRLEN",
    "HVALS",
    "KEYS",
    "LCS",
    "LINDEX",
    "LLEN",
    "LPOS",
    "LRANGE",
    "MEMORY",
    "MGET",
    "OBJECT",
    "PEXPIRETIME",
    "PFCOUNT",
    "PTTL",
    "RANDOMKEY",
    "SCAN",
    "SCARD",
    "SDIFF",
    "SINTER",
    "SINTERCARD",
    "SISMEMBER",
    "SMEMBERS",
    "SMISMEMBER",
    "SORT_RO",
    "SRANDMEMBER",
    "SSCAN",
    "STRLEN",
    "SUNION",
    "TOUCH",
    "TTL",
    "TYPE",
    "XINFO",
    "XLEN",
    "XPENDING",
    "XRANGE",
    "XREAD",
    "XREVRANGE",
    "ZCARD",
    "ZCOUNT",
    "ZDIFF",
    "ZINTER",
    "ZINTERCARD",
    "ZLEXCOUNT",
    "ZMSCORE",
    "ZRANDMEMBER",
    "ZRANGE",
    "ZRANGEBYLEX",
    "ZRANGEBYSCORE",
    "ZRANK",
    "ZREVRANGE",
    "ZREVRANGEBYLEX",
    "ZREVRANGEBYSCORE",
    "ZREVRANK",
    "ZSCAN",
    "ZSCORE",
];

fn is_keyless(name: &str) -> bool {
    KEYLESS.contains(&name)
}

/// Returns true if the named command only reads data.
pub fn is_readonly(name: &str) -> bool {
    READONLY.contains(&name)
}

/// Returns the subscriber-mode transition of the named command, if any.
pub fn subscriber_mode(name: &str) -> Option<SubscriberMode> {
    match name {
        "SUBSCRIBE" | "PSUBSCRIBE" => Some(SubscriberMode::Enter),
        "UNSUBSCRIBE" | "PUNSUBSCRIBE" => Some(SubscriberMode::Exit),
        _ => None,
    }
}

/// Creates a CLUSTER SLOTS command, the topology discovery query.
pub fn cluster_slots() -> Cmd {
    Cmd::new("CLUSTER").arg("SLOTS")
}

/// Creates a CLUSTER INFO command, used for the ready check.
pub fn cluster_info() -> Cmd {
    Cmd::new("CLUSTER").arg("INFO")
}

/// Creates an ASKING command.
///
/// Sent immediately before retrying a command that received an ASK
/// redirect; it is a one-shot flag on the target connection.
pub fn asking() -> Cmd {
    Cmd::new("ASKING")
}

/// Creates a READONLY command, enabling reads on a replica connection.
pub fn readonly() -> Cmd {
    Cmd::new("READONLY")
}

/// Creates a QUIT command.
pub fn quit() -> Cmd {
    Cmd::new("QUIT")
}

/// Creates an AUTH command.
pub fn auth(password: impl Into<Bytes>) -> Cmd {
    Cmd::new("AUTH").arg(password)
}
