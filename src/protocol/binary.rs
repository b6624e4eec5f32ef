/// Memcached binary protocol
///
/// Every packet starts with a fixed 24-byte header:
///
/// ```text
///  0        1        2        3
/// +--------+--------+--------+--------+
/// | magic  | opcode |   key length    |
/// +--------+--------+--------+--------+
/// | extras | dtype  | status/vbucket  |
/// +--------+--------+--------+--------+
/// |        total body length          |
/// +--------+--------+--------+--------+
/// |             opaque                |
/// +--------+--------+--------+--------+
/// |               CAS                 |
/// |                                   |
/// +--------+--------+--------+--------+
/// ```
///
/// followed by extras, key and value. Responses echo the request opaque, which lets
/// the connection complete requests out of order.
use super::{Command, CommandKind, CounterOp, Frame, Item, ProtocolError, Reply, StoreMode};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const HEADER_LEN: usize = 24;
pub const REQUEST_MAGIC: u8 = 0x80;
pub const RESPONSE_MAGIC: u8 = 0x81;

/// Largest body accepted from a server
const MAX_BODY_LENGTH: usize = 64 * 1024 * 1024;

/// Expiration value telling incr/decr not to create a missing key
const COUNTER_NO_CREATE: u32 = 0xffff_ffff;

pub mod opcode {
    pub const GET: u8 = 0x00;
    pub const SET: u8 = 0x01;
    pub const ADD: u8 = 0x02;
    pub const REPLACE: u8 = 0x03;
    pub const DELETE: u8 = 0x04;
    pub const INCREMENT: u8 = 0x05;
    pub const DECREMENT: u8 = 0x06;
    pub const FLUSH: u8 = 0x08;
    pub const VERSION: u8 = 0x0b;
    pub const APPEND: u8 = 0x0e;
    pub const PREPEND: u8 = 0x0f;
    pub const STAT: u8 = 0x10;
}

pub mod status {
    pub const OK: u16 = 0x0000;
    pub const KEY_NOT_FOUND: u16 = 0x0001;
    pub const KEY_EXISTS: u16 = 0x0002;
    pub const VALUE_TOO_LARGE: u16 = 0x0003;
    pub const INVALID_ARGUMENTS: u16 = 0x0004;
    pub const NOT_STORED: u16 = 0x0005;
    pub const NON_NUMERIC: u16 = 0x0006;
    pub const UNKNOWN_COMMAND: u16 = 0x0081;
    pub const OUT_OF_MEMORY: u16 = 0x0082;
}

/// Parsed packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u8,
    pub opcode: u8,
    pub key_len: u16,
    pub extras_len: u8,
    pub data_type: u8,
    /// vbucket id in requests, status in responses
    pub status: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl Header {
    /// Parse the first 24 bytes of `buf`; the caller checks the length
    pub fn parse(mut buf: &[u8]) -> Header {
        Header {
            magic: buf.get_u8(),
            opcode: buf.get_u8(),
            key_len: buf.get_u16(),
            extras_len: buf.get_u8(),
            data_type: buf.get_u8(),
            status: buf.get_u16(),
            body_len: buf.get_u32(),
            opaque: buf.get_u32(),
            cas: buf.get_u64(),
        }
    }

    pub fn write(&self, dst: &mut BytesMut) {
        dst.put_u8(self.magic);
        dst.put_u8(self.opcode);
        dst.put_u16(self.key_len);
        dst.put_u8(self.extras_len);
        dst.put_u8(self.data_type);
        dst.put_u16(self.status);
        dst.put_u32(self.body_len);
        dst.put_u32(self.opaque);
        dst.put_u64(self.cas);
    }
}

/// Stateless binary protocol codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BinaryCodec;

impl BinaryCodec {
    /// The stat command streams one packet per statistic; not implemented here.
    pub fn supports(&self, kind: CommandKind) -> bool {
        !matches!(kind, CommandKind::Stats)
    }

    pub fn encode(
        &self,
        command: &Command,
        opaque: u32,
        dst: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        match command {
            Command::Get { key } => write_request(dst, opcode::GET, opaque, &[], key, &[]),
            Command::Store {
                mode,
                key,
                value,
                flags,
                ttl,
            } => {
                let code = match mode {
                    StoreMode::Set => opcode::SET,
                    StoreMode::Add => opcode::ADD,
                    StoreMode::Replace => opcode::REPLACE,
                    StoreMode::Append => opcode::APPEND,
                    StoreMode::Prepend => opcode::PREPEND,
                };
                match mode {
                    StoreMode::Append | StoreMode::Prepend => {
                        write_request(dst, code, opaque, &[], key, value)
                    }
                    _ => {
                        let mut extras = [0u8; 8];
                        extras[..4].copy_from_slice(&flags.to_be_bytes());
                        extras[4..].copy_from_slice(&ttl.to_be_bytes());
                        write_request(dst, code, opaque, &extras, key, value)
                    }
                }
            }
            Command::Delete { key } => write_request(dst, opcode::DELETE, opaque, &[], key, &[]),
            Command::Counter { op, key, delta } => {
                let code = match op {
                    CounterOp::Incr => opcode::INCREMENT,
                    CounterOp::Decr => opcode::DECREMENT,
                };
                let mut extras = [0u8; 20];
                extras[..8].copy_from_slice(&delta.to_be_bytes());
                extras[16..].copy_from_slice(&COUNTER_NO_CREATE.to_be_bytes());
                write_request(dst, code, opaque, &extras, key, &[])
            }
            Command::Version => write_request(dst, opcode::VERSION, opaque, &[], &[], &[]),
            Command::FlushAll => write_request(dst, opcode::FLUSH, opaque, &[], &[], &[]),
            Command::Stats { .. } => return Err(ProtocolError::Unsupported(CommandKind::Stats)),
        }
        Ok(())
    }

    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = Header::parse(&src[..HEADER_LEN]);
        if header.magic != RESPONSE_MAGIC {
            return Err(ProtocolError::InvalidFormat(format!(
                "bad response magic 0x{:02x}",
                header.magic
            )));
        }

        let body_len = header.body_len as usize;
        if body_len > MAX_BODY_LENGTH {
            return Err(ProtocolError::FrameTooLarge(body_len));
        }
        let extras_len = header.extras_len as usize;
        let key_len = header.key_len as usize;
        if extras_len + key_len > body_len {
            return Err(ProtocolError::InvalidFormat(
                "extras and key exceed body length".to_string(),
            ));
        }
        if src.len() < HEADER_LEN + body_len {
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let mut body = src.split_to(body_len);
        let extras = body.split_to(extras_len).freeze();
        body.advance(key_len);
        let value = body.freeze();

        let kind = kind_of(header.opcode).ok_or_else(|| {
            ProtocolError::InvalidFormat(format!("unknown response opcode 0x{:02x}", header.opcode))
        })?;
        let outcome = decode_body(kind, &header, extras, value)?;
        Ok(Some(Frame {
            opaque: Some(header.opaque),
            kind,
            outcome,
        }))
    }
}

fn kind_of(code: u8) -> Option<CommandKind> {
    match code {
        opcode::GET => Some(CommandKind::Get),
        opcode::SET | opcode::ADD | opcode::REPLACE | opcode::APPEND | opcode::PREPEND => {
            Some(CommandKind::Store)
        }
        opcode::DELETE => Some(CommandKind::Delete),
        opcode::INCREMENT | opcode::DECREMENT => Some(CommandKind::Counter),
        opcode::VERSION => Some(CommandKind::Version),
        opcode::FLUSH => Some(CommandKind::FlushAll),
        opcode::STAT => Some(CommandKind::Stats),
        _ => None,
    }
}

fn decode_body(
    kind: CommandKind,
    header: &Header,
    mut extras: Bytes,
    value: Bytes,
) -> Result<Result<Reply, String>, ProtocolError> {
    let reply = match (kind, header.status) {
        (CommandKind::Get, status::OK) => {
            if extras.len() < 4 {
                return Err(ProtocolError::InvalidFormat(
                    "get response without flags".to_string(),
                ));
            }
            let flags = extras.get_u32();
            Reply::Item(Some(Item {
                value,
                flags,
                cas: header.cas,
            }))
        }
        (CommandKind::Get, status::KEY_NOT_FOUND) => Reply::Item(None),
        (CommandKind::Store, status::OK) => Reply::Stored(true),
        (CommandKind::Store, status::KEY_NOT_FOUND | status::KEY_EXISTS | status::NOT_STORED) => {
            Reply::Stored(false)
        }
        (CommandKind::Delete, status::OK) => Reply::Deleted(true),
        (CommandKind::Delete, status::KEY_NOT_FOUND) => Reply::Deleted(false),
        (CommandKind::Counter, status::OK) => {
            let mut value = value;
            if value.len() != 8 {
                return Err(ProtocolError::InvalidFormat(format!(
                    "counter response of {} bytes",
                    value.len()
                )));
            }
            Reply::Counter(Some(value.get_u64()))
        }
        (CommandKind::Counter, status::KEY_NOT_FOUND) => Reply::Counter(None),
        (CommandKind::Version, status::OK) => {
            Reply::Version(String::from_utf8_lossy(&value).into_owned())
        }
        (CommandKind::FlushAll, status::OK) => Reply::Ok,
        (_, code) => return Ok(Err(status_message(code, &value))),
    };
    Ok(Ok(reply))
}

fn status_message(code: u16, body: &[u8]) -> String {
    let name = match code {
        status::KEY_NOT_FOUND => "key not found",
        status::KEY_EXISTS => "key exists",
        status::VALUE_TOO_LARGE => "value too large",
        status::INVALID_ARGUMENTS => "invalid arguments",
        status::NOT_STORED => "item not stored",
        status::NON_NUMERIC => "incr/decr on non-numeric value",
        status::UNKNOWN_COMMAND => "unknown command",
        status::OUT_OF_MEMORY => "out of memory",
        _ => "unrecognized status",
    };
    if body.is_empty() {
        format!("{} (0x{:04x})", name, code)
    } else {
        format!("{} (0x{:04x}): {}", name, code, String::from_utf8_lossy(body))
    }
}

#[allow(clippy::too_many_arguments)]
fn write_packet(
    dst: &mut BytesMut,
    magic: u8,
    code: u8,
    status: u16,
    opaque: u32,
    cas: u64,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
) {
    let body_len = extras.len() + key.len() + value.len();
    dst.reserve(HEADER_LEN + body_len);
    Header {
        magic,
        opcode: code,
        key_len: key.len() as u16,
        extras_len: extras.len() as u8,
        data_type: 0,
        status,
        body_len: body_len as u32,
        opaque,
        cas,
    }
    .write(dst);
    dst.extend_from_slice(extras);
    dst.extend_from_slice(key);
    dst.extend_from_slice(value);
}

fn write_request(dst: &mut BytesMut, code: u8, opaque: u32, extras: &[u8], key: &[u8], value: &[u8]) {
    write_packet(dst, REQUEST_MAGIC, code, 0, opaque, 0, extras, key, value);
}

/// Write a response packet; used by servers and test doubles
#[allow(clippy::too_many_arguments)]
pub fn write_response(
    dst: &mut BytesMut,
    code: u8,
    status: u16,
    opaque: u32,
    cas: u64,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
) {
    write_packet(dst, RESPONSE_MAGIC, code, status, opaque, cas, extras, key, value);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(command: &Command, opaque: u32) -> BytesMut {
        let mut buf = BytesMut::new();
        BinaryCodec.encode(command, opaque, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_encode_get_header() {
        let buf = encode(
            &Command::Get {
                key: Bytes::from_static(b"foo"),
            },
            77,
        );
        assert_eq!(buf.len(), HEADER_LEN + 3);
        let header = Header::parse(&buf);
        assert_eq!(header.magic, REQUEST_MAGIC);
        assert_eq!(header.opcode, opcode::GET);
        assert_eq!(header.key_len, 3);
        assert_eq!(header.extras_len, 0);
        assert_eq!(header.body_len, 3);
        assert_eq!(header.opaque, 77);
        assert_eq!(&buf[HEADER_LEN..], b"foo");
    }

    #[test]
    fn test_encode_set_extras() {
        let buf = encode(
            &Command::Store {
                mode: StoreMode::Set,
                key: Bytes::from_static(b"k"),
                value: Bytes::from_static(b"value"),
                flags: 0xdead_beef,
                ttl: 300,
            },
            1,
        );
        let header = Header::parse(&buf);
        assert_eq!(header.opcode, opcode::SET);
        assert_eq!(header.extras_len, 8);
        assert_eq!(header.body_len, 8 + 1 + 5);
        let body = &buf[HEADER_LEN..];
        assert_eq!(&body[..4], &0xdead_beefu32.to_be_bytes());
        assert_eq!(&body[4..8], &300u32.to_be_bytes());
        assert_eq!(&body[8..9], b"k");
        assert_eq!(&body[9..], b"value");
    }

    #[test]
    fn test_encode_append_has_no_extras() {
        let buf = encode(
            &Command::Store {
                mode: StoreMode::Append,
                key: Bytes::from_static(b"k"),
                value: Bytes::from_static(b"tail"),
                flags: 1,
                ttl: 1,
            },
            1,
        );
        let header = Header::parse(&buf);
        assert_eq!(header.opcode, opcode::APPEND);
        assert_eq!(header.extras_len, 0);
    }

    #[test]
    fn test_stats_is_a_capability_gap() {
        assert!(!BinaryCodec.supports(CommandKind::Stats));
        let mut buf = BytesMut::new();
        let result = BinaryCodec.encode(&Command::Stats { group: None }, 0, &mut buf);
        assert_eq!(result, Err(ProtocolError::Unsupported(CommandKind::Stats)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_get_hit() {
        let mut buf = BytesMut::new();
        write_response(
            &mut buf,
            opcode::GET,
            status::OK,
            5,
            99,
            &7u32.to_be_bytes(),
            &[],
            b"bar",
        );
        let frame = BinaryCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.opaque, Some(5));
        assert_eq!(frame.kind, CommandKind::Get);
        assert_eq!(
            frame.outcome,
            Ok(Reply::Item(Some(Item {
                value: Bytes::from_static(b"bar"),
                flags: 7,
                cas: 99,
            })))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_miss_and_absent_delete() {
        let mut buf = BytesMut::new();
        write_response(&mut buf, opcode::GET, status::KEY_NOT_FOUND, 1, 0, &[], &[], b"Not found");
        write_response(&mut buf, opcode::DELETE, status::KEY_NOT_FOUND, 2, 0, &[], &[], b"Not found");

        let miss = BinaryCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(miss.outcome, Ok(Reply::Item(None)));
        let delete = BinaryCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(delete.outcome, Ok(Reply::Deleted(false)));
        assert_eq!(delete.opaque, Some(2));
    }

    #[test]
    fn test_decode_counter() {
        let mut buf = BytesMut::new();
        write_response(&mut buf, opcode::INCREMENT, status::OK, 3, 0, &[], &[], &42u64.to_be_bytes());
        let frame = BinaryCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.outcome, Ok(Reply::Counter(Some(42))));
    }

    #[test]
    fn test_decode_partial_frames() {
        let mut full = BytesMut::new();
        write_response(&mut full, opcode::VERSION, status::OK, 8, 0, &[], &[], b"1.6.21");

        for cut in 0..full.len() {
            let mut buf = BytesMut::from(&full[..cut]);
            assert!(BinaryCodec.decode(&mut buf).unwrap().is_none());
            assert_eq!(buf.len(), cut);
        }
        let frame = BinaryCodec.decode(&mut full).unwrap().unwrap();
        assert_eq!(frame.outcome, Ok(Reply::Version("1.6.21".to_string())));
    }

    #[test]
    fn test_decode_error_status() {
        let mut buf = BytesMut::new();
        write_response(&mut buf, opcode::INCREMENT, status::NON_NUMERIC, 4, 0, &[], &[], b"Non-numeric server-side value for incr or decr");
        let frame = BinaryCodec.decode(&mut buf).unwrap().unwrap();
        match frame.outcome {
            Err(message) => assert!(message.starts_with("incr/decr on non-numeric value")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut buf = BytesMut::new();
        write_request(&mut buf, opcode::GET, 1, &[], b"k", &[]);
        assert!(matches!(
            BinaryCodec.decode(&mut buf),
            Err(ProtocolError::InvalidFormat(_))
        ));
    }
}
