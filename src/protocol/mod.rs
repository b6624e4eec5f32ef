/// Memcached wire protocols
///
/// The client speaks exactly one protocol per instance, chosen at construction. Both
/// variants share the logical `Command`/`Reply` vocabulary below and differ only in
/// byte layout and in how responses are matched to requests:
/// - text replies arrive in submission order (`Discipline::Ordered`)
/// - binary replies carry the request's opaque token (`Discipline::Correlated`)
pub mod binary;
pub mod text;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub use binary::BinaryCodec;
pub use text::TextCodec;

/// Longest key memcached accepts
pub const MAX_KEY_LENGTH: usize = 250;

/// Protocol variant selected in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    #[default]
    Text,
    Binary,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolKind::Text => write!(f, "text"),
            ProtocolKind::Binary => write!(f, "binary"),
        }
    }
}

impl FromStr for ProtocolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "ascii" => Ok(ProtocolKind::Text),
            "binary" => Ok(ProtocolKind::Binary),
            other => Err(format!("unknown protocol: {}", other)),
        }
    }
}

/// Storage command flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

impl StoreMode {
    pub fn verb(&self) -> &'static str {
        match self {
            StoreMode::Set => "set",
            StoreMode::Add => "add",
            StoreMode::Replace => "replace",
            StoreMode::Append => "append",
            StoreMode::Prepend => "prepend",
        }
    }
}

/// Counter direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterOp {
    Incr,
    Decr,
}

/// Protocol-agnostic command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Get {
        key: Bytes,
    },
    Store {
        mode: StoreMode,
        key: Bytes,
        value: Bytes,
        flags: u32,
        ttl: u32,
    },
    Delete {
        key: Bytes,
    },
    Counter {
        op: CounterOp,
        key: Bytes,
        delta: u64,
    },
    Stats {
        group: Option<String>,
    },
    Version,
    FlushAll,
}

/// Command family, used to pick a decoder and to check capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Get,
    Store,
    Delete,
    Counter,
    Stats,
    Version,
    FlushAll,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::Get => "get",
            CommandKind::Store => "store",
            CommandKind::Delete => "delete",
            CommandKind::Counter => "counter",
            CommandKind::Stats => "stats",
            CommandKind::Version => "version",
            CommandKind::FlushAll => "flush_all",
        };
        f.write_str(name)
    }
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Get { .. } => CommandKind::Get,
            Command::Store { .. } => CommandKind::Store,
            Command::Delete { .. } => CommandKind::Delete,
            Command::Counter { .. } => CommandKind::Counter,
            Command::Stats { .. } => CommandKind::Stats,
            Command::Version => CommandKind::Version,
            Command::FlushAll => CommandKind::FlushAll,
        }
    }

    /// Key carried by the command, if any
    pub fn key(&self) -> Option<&Bytes> {
        match self {
            Command::Get { key }
            | Command::Store { key, .. }
            | Command::Delete { key }
            | Command::Counter { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// A value as stored on the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub value: Bytes,
    pub flags: u32,
    /// CAS unique, 0 when the server did not send one
    pub cas: u64,
}

/// Decoded, typed reply
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `None` is a miss
    Item(Option<Item>),
    /// Whether the storage command took effect
    Stored(bool),
    /// Whether a key existed and was removed
    Deleted(bool),
    /// New counter value; `None` when the key is absent
    Counter(Option<u64>),
    Stats(HashMap<String, String>),
    Version(String),
    Ok,
}

/// One complete response frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Correlation token for protocols that carry one
    pub opaque: Option<u32>,
    pub kind: CommandKind,
    /// `Err` holds a server-reported error message; the stream is still in sync
    pub outcome: Result<Reply, String>,
}

/// How responses are matched to requests on one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    /// Replies arrive in submission order
    Ordered,
    /// Replies carry an opaque token and may arrive in any order
    Correlated,
}

/// Codec failures; any of these poisons the byte stream
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid frame: {0}")]
    InvalidFormat(String),
    #[error("unexpected response to {expected}: {got}")]
    Unexpected { expected: CommandKind, got: String },
    #[error("response received with no command outstanding")]
    Unsolicited,
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
    #[error("{0} cannot be encoded by this protocol")]
    Unsupported(CommandKind),
}

/// The closed set of wire codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Text(TextCodec),
    Binary(BinaryCodec),
}

impl Codec {
    pub fn new(kind: ProtocolKind) -> Self {
        match kind {
            ProtocolKind::Text => Codec::Text(TextCodec),
            ProtocolKind::Binary => Codec::Binary(BinaryCodec),
        }
    }

    pub fn kind(&self) -> ProtocolKind {
        match self {
            Codec::Text(_) => ProtocolKind::Text,
            Codec::Binary(_) => ProtocolKind::Binary,
        }
    }

    pub fn discipline(&self) -> Discipline {
        match self {
            Codec::Text(_) => Discipline::Ordered,
            Codec::Binary(_) => Discipline::Correlated,
        }
    }

    /// Declared capability of this protocol
    pub fn supports(&self, kind: CommandKind) -> bool {
        match self {
            Codec::Text(codec) => codec.supports(kind),
            Codec::Binary(codec) => codec.supports(kind),
        }
    }

    /// Append the wire form of `command` to `dst`.
    ///
    /// `opaque` is ignored by protocols without correlation tokens.
    pub fn encode(
        &self,
        command: &Command,
        opaque: u32,
        dst: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        match self {
            Codec::Text(codec) => codec.encode(command, dst),
            Codec::Binary(codec) => codec.encode(command, opaque, dst),
        }
    }

    /// Decode one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` and leaves `src` untouched when the frame is incomplete.
    /// `expected` is the kind of the oldest outstanding command, needed by the text
    /// protocol whose replies are not self-describing.
    pub fn decode(
        &self,
        expected: Option<CommandKind>,
        src: &mut BytesMut,
    ) -> Result<Option<Frame>, ProtocolError> {
        match self {
            Codec::Text(codec) => codec.decode(expected, src),
            Codec::Binary(codec) => codec.decode(src),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_kind_parse() {
        assert_eq!("text".parse::<ProtocolKind>().unwrap(), ProtocolKind::Text);
        assert_eq!("Binary".parse::<ProtocolKind>().unwrap(), ProtocolKind::Binary);
        assert!("udp".parse::<ProtocolKind>().is_err());
        assert_eq!(ProtocolKind::default(), ProtocolKind::Text);
    }

    #[test]
    fn test_codec_capabilities() {
        let text = Codec::new(ProtocolKind::Text);
        let binary = Codec::new(ProtocolKind::Binary);

        assert!(text.supports(CommandKind::Stats));
        assert!(!binary.supports(CommandKind::Stats));
        assert!(binary.supports(CommandKind::Version));

        assert_eq!(text.discipline(), Discipline::Ordered);
        assert_eq!(binary.discipline(), Discipline::Correlated);
    }

    #[test]
    fn test_command_kind_and_key() {
        let cmd = Command::Delete {
            key: Bytes::from_static(b"k1"),
        };
        assert_eq!(cmd.kind(), CommandKind::Delete);
        assert_eq!(cmd.key().unwrap().as_ref(), b"k1");
        assert!(Command::Version.key().is_none());
    }

    #[test]
    fn test_same_reply_from_both_codecs() {
        // A set acknowledgement decodes to the same logical reply under both layouts
        let text = Codec::new(ProtocolKind::Text);
        let mut buf = BytesMut::from(&b"STORED\r\n"[..]);
        let text_frame = text.decode(Some(CommandKind::Store), &mut buf).unwrap().unwrap();

        let binary = Codec::new(ProtocolKind::Binary);
        let mut buf = BytesMut::new();
        binary::write_response(&mut buf, binary::opcode::SET, 0, 9, 0, &[], &[], &[]);
        let binary_frame = binary.decode(None, &mut buf).unwrap().unwrap();

        assert_eq!(text_frame.outcome, binary_frame.outcome);
        assert_eq!(binary_frame.opaque, Some(9));
        assert_eq!(text_frame.opaque, None);
    }
}
