/// Memcached text (ASCII) protocol
///
/// Requests are CRLF-terminated command lines, storage commands followed by a data
/// block. Replies are not self-describing (`NOT_FOUND` answers delete and incr alike),
/// so decoding needs the kind of the command at the head of the queue.
use super::{Command, CommandKind, CounterOp, Frame, Item, ProtocolError, Reply};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::HashMap;
use std::str;

/// Upper bound for a single reply line; longer means the stream is garbage
const MAX_LINE_LENGTH: usize = 8 * 1024;

/// Upper bound for a single value block
const MAX_VALUE_LENGTH: usize = 64 * 1024 * 1024;

/// Stateless text protocol codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TextCodec;

impl TextCodec {
    pub fn supports(&self, _kind: CommandKind) -> bool {
        true
    }

    pub fn encode(&self, command: &Command, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match command {
            Command::Get { key } => {
                dst.extend_from_slice(b"get ");
                dst.extend_from_slice(key);
            }
            Command::Store {
                mode,
                key,
                value,
                flags,
                ttl,
            } => {
                dst.reserve(key.len() + value.len() + 48);
                dst.extend_from_slice(mode.verb().as_bytes());
                dst.extend_from_slice(b" ");
                dst.extend_from_slice(key);
                let header = format!(" {} {} {}\r\n", flags, ttl, value.len());
                dst.extend_from_slice(header.as_bytes());
                dst.extend_from_slice(value);
            }
            Command::Delete { key } => {
                dst.extend_from_slice(b"delete ");
                dst.extend_from_slice(key);
            }
            Command::Counter { op, key, delta } => {
                let verb: &[u8] = match op {
                    CounterOp::Incr => b"incr ",
                    CounterOp::Decr => b"decr ",
                };
                dst.extend_from_slice(verb);
                dst.extend_from_slice(key);
                dst.extend_from_slice(format!(" {}", delta).as_bytes());
            }
            Command::Stats { group } => {
                dst.extend_from_slice(b"stats");
                if let Some(group) = group {
                    dst.extend_from_slice(b" ");
                    dst.extend_from_slice(group.as_bytes());
                }
            }
            Command::Version => dst.extend_from_slice(b"version"),
            Command::FlushAll => dst.extend_from_slice(b"flush_all"),
        }
        dst.extend_from_slice(b"\r\n");
        Ok(())
    }

    pub fn decode(
        &self,
        expected: Option<CommandKind>,
        src: &mut BytesMut,
    ) -> Result<Option<Frame>, ProtocolError> {
        if src.is_empty() {
            return Ok(None);
        }
        let expected = expected.ok_or(ProtocolError::Unsolicited)?;

        let Some(line_end) = find_crlf(src, 0)? else {
            return Ok(None);
        };
        let line = &src[..line_end];

        if let Some(message) = server_error(line) {
            src.advance(line_end + 2);
            return Ok(Some(frame(expected, Err(message))));
        }

        let decoded = match expected {
            CommandKind::Get => return decode_get(src, line_end),
            CommandKind::Stats => return decode_stats(src),
            CommandKind::Store => match line {
                b"STORED" => Reply::Stored(true),
                b"NOT_STORED" | b"EXISTS" | b"NOT_FOUND" => Reply::Stored(false),
                _ => return Err(unexpected(expected, line)),
            },
            CommandKind::Delete => match line {
                b"DELETED" => Reply::Deleted(true),
                b"NOT_FOUND" => Reply::Deleted(false),
                _ => return Err(unexpected(expected, line)),
            },
            CommandKind::Counter => match line {
                b"NOT_FOUND" => Reply::Counter(None),
                // memcached pads counter replies with trailing spaces after a decr
                digits => match btoi::btou::<u64>(trim_ascii_end(digits)) {
                    Ok(value) => Reply::Counter(Some(value)),
                    Err(_) => return Err(unexpected(expected, line)),
                },
            },
            CommandKind::Version => match line.strip_prefix(b"VERSION ") {
                Some(version) => Reply::Version(String::from_utf8_lossy(version).into_owned()),
                None => return Err(unexpected(expected, line)),
            },
            CommandKind::FlushAll => match line {
                b"OK" => Reply::Ok,
                _ => return Err(unexpected(expected, line)),
            },
        };

        src.advance(line_end + 2);
        Ok(Some(frame(expected, Ok(decoded))))
    }
}

fn frame(kind: CommandKind, outcome: Result<Reply, String>) -> Frame {
    Frame {
        opaque: None,
        kind,
        outcome,
    }
}

/// `VALUE <key> <flags> <bytes> [<cas>]\r\n<data>\r\nEND\r\n` or a bare `END\r\n`
fn decode_get(src: &mut BytesMut, line_end: usize) -> Result<Option<Frame>, ProtocolError> {
    let line = &src[..line_end];
    if line == b"END" {
        src.advance(line_end + 2);
        return Ok(Some(frame(CommandKind::Get, Ok(Reply::Item(None)))));
    }

    let mut fields = line.split(|b| *b == b' ').filter(|f| !f.is_empty());
    if fields.next() != Some(b"VALUE".as_slice()) {
        return Err(unexpected(CommandKind::Get, line));
    }
    let _key = fields
        .next()
        .ok_or_else(|| invalid("VALUE line without key"))?;
    let flags = u32::try_from(parse_field(fields.next(), "flags")?)
        .map_err(|_| invalid("flags out of range"))?;
    let len = parse_field(fields.next(), "length")? as usize;
    let cas = match fields.next() {
        Some(cas) => btoi::btou::<u64>(cas).map_err(|_| invalid("bad cas field"))?,
        None => 0,
    };
    if len > MAX_VALUE_LENGTH {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let data_start = line_end + 2;
    let data_end = data_start + len;
    // data, its CRLF, then at least "END\r\n"
    if src.len() < data_end + 2 {
        return Ok(None);
    }
    if &src[data_end..data_end + 2] != b"\r\n" {
        return Err(invalid("value block not terminated by CRLF"));
    }
    let Some(end_line) = find_crlf(src, data_end + 2)? else {
        return Ok(None);
    };
    if &src[data_end + 2..end_line] != b"END" {
        return Err(invalid("multiple values in reply to a single-key get"));
    }

    let mut block = src.split_to(end_line + 2);
    block.advance(data_start);
    let value: Bytes = block.split_to(len).freeze();
    Ok(Some(frame(
        CommandKind::Get,
        Ok(Reply::Item(Some(Item { value, flags, cas }))),
    )))
}

/// `STAT <name> <value>\r\n` lines closed by `END\r\n`
fn decode_stats(src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    let mut stats = HashMap::new();
    let mut pos = 0;
    loop {
        let Some(line_end) = find_crlf(src, pos)? else {
            return Ok(None);
        };
        let line = &src[pos..line_end];
        if line == b"END" {
            src.advance(line_end + 2);
            return Ok(Some(frame(CommandKind::Stats, Ok(Reply::Stats(stats)))));
        }
        let entry = line
            .strip_prefix(b"STAT ")
            .ok_or_else(|| unexpected(CommandKind::Stats, line))?;
        let entry = str::from_utf8(entry).map_err(|e| invalid(e.to_string()))?;
        let (name, value) = entry.split_once(' ').unwrap_or((entry, ""));
        stats.insert(name.to_string(), value.to_string());
        pos = line_end + 2;
    }
}

/// Index of the next `\r\n` at or after `from`
fn find_crlf(buf: &[u8], from: usize) -> Result<Option<usize>, ProtocolError> {
    let window = &buf[from.min(buf.len())..];
    match window.windows(2).position(|w| w == b"\r\n") {
        Some(offset) => Ok(Some(from + offset)),
        None if window.len() > MAX_LINE_LENGTH => Err(ProtocolError::FrameTooLarge(window.len())),
        None => Ok(None),
    }
}

fn server_error(line: &[u8]) -> Option<String> {
    if line == b"ERROR" {
        return Some("ERROR".to_string());
    }
    if line.starts_with(b"CLIENT_ERROR") || line.starts_with(b"SERVER_ERROR") {
        return Some(String::from_utf8_lossy(line).into_owned());
    }
    None
}

fn parse_field(field: Option<&[u8]>, name: &str) -> Result<u64, ProtocolError> {
    let field = field.ok_or_else(|| invalid(format!("VALUE line without {}", name)))?;
    btoi::btou::<u64>(field).map_err(|_| invalid(format!("bad {} field", name)))
}

fn trim_ascii_end(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    &bytes[..end]
}

fn invalid<S: Into<String>>(message: S) -> ProtocolError {
    ProtocolError::InvalidFormat(message.into())
}

fn unexpected(expected: CommandKind, line: &[u8]) -> ProtocolError {
    ProtocolError::Unexpected {
        expected,
        got: String::from_utf8_lossy(line).into_owned(),
    }
}
