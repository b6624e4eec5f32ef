//! In-process memcached double speaking both wire protocols.
#![allow(dead_code)]

use alacena::protocol::binary::{self, opcode, status, Header, HEADER_LEN};
use alacena::{ProtocolKind, ServerSpec};
use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

pub const VERSION: &str = "1.6.21-mock";

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    flags: u32,
    cas: u64,
}

#[derive(Debug, Default)]
struct State {
    items: Mutex<HashMap<Vec<u8>, Entry>>,
    next_cas: AtomicU64,
    connections: AtomicUsize,
    commands: AtomicUsize,
    /// drop the connection instead of answering the next command
    hang_up: AtomicBool,
}

impl State {
    fn cas(&self) -> u64 {
        self.next_cas.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn get(&self, key: &[u8]) -> Option<Entry> {
        self.items.lock().unwrap().get(key).cloned()
    }

    /// Apply a storage verb, returning whether it stored
    fn store(&self, verb: &str, key: &[u8], value: Vec<u8>, flags: u32) -> bool {
        let mut items = self.items.lock().unwrap();
        let exists = items.contains_key(key);
        let cas = self.cas();
        match verb {
            "set" => {}
            "add" if exists => return false,
            "replace" if !exists => return false,
            "append" | "prepend" => {
                let Some(entry) = items.get_mut(key) else {
                    return false;
                };
                if verb == "append" {
                    entry.value.extend_from_slice(&value);
                } else {
                    let mut joined = value;
                    joined.extend_from_slice(&entry.value);
                    entry.value = joined;
                }
                entry.cas = cas;
                return true;
            }
            _ => {}
        }
        items.insert(key.to_vec(), Entry { value, flags, cas });
        true
    }

    fn delete(&self, key: &[u8]) -> bool {
        self.items.lock().unwrap().remove(key).is_some()
    }

    /// `None` when absent, `Err` when the value is not numeric
    fn counter(&self, key: &[u8], delta: u64, incr: bool) -> Option<Result<u64, ()>> {
        let mut items = self.items.lock().unwrap();
        let entry = items.get_mut(key)?;
        let current = match std::str::from_utf8(&entry.value).ok().and_then(|s| s.parse::<u64>().ok()) {
            Some(current) => current,
            None => return Some(Err(())),
        };
        let next = if incr {
            current.wrapping_add(delta)
        } else {
            current.saturating_sub(delta)
        };
        entry.value = next.to_string().into_bytes();
        Some(Ok(next))
    }

    fn stats(&self) -> Vec<(String, String)> {
        vec![
            ("pid".to_string(), std::process::id().to_string()),
            ("uptime".to_string(), "42".to_string()),
            ("version".to_string(), VERSION.to_string()),
            (
                "curr_items".to_string(),
                self.items.lock().unwrap().len().to_string(),
            ),
            (
                "curr_connections".to_string(),
                self.connections.load(Ordering::Relaxed).to_string(),
            ),
        ]
    }
}

/// A running mock server
pub struct MockServer {
    port: u16,
    state: Arc<State>,
}

impl MockServer {
    pub async fn start(protocol: ProtocolKind) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let state = Arc::new(State::default());

        let shared = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                shared.connections.fetch_add(1, Ordering::Relaxed);
                let state = Arc::clone(&shared);
                tokio::spawn(async move {
                    let _ = match protocol {
                        ProtocolKind::Text => serve_text(socket, state).await,
                        ProtocolKind::Binary => serve_binary(socket, state).await,
                    };
                });
            }
        });

        MockServer { port, state }
    }

    pub fn spec(&self) -> ServerSpec {
        ServerSpec::new("127.0.0.1", self.port)
    }

    /// Raw value as stored, including any namespace prefix in the key
    pub fn stored(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.state.get(key).map(|entry| entry.value)
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::Relaxed)
    }

    pub fn commands(&self) -> usize {
        self.state.commands.load(Ordering::Relaxed)
    }

    /// Close the socket on receipt of the next command, leaving it unanswered
    pub fn hang_up_next(&self) {
        self.state.hang_up.store(true, Ordering::Relaxed);
    }
}

/// A local address nothing listens on
pub async fn closed_server() -> ServerSpec {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    ServerSpec::new("127.0.0.1", port)
}

async fn serve_text(socket: TcpStream, state: Arc<State>) -> std::io::Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        state.commands.fetch_add(1, Ordering::Relaxed);
        if state.hang_up.swap(false, Ordering::Relaxed) {
            return Ok(());
        }
        let parts: Vec<&str> = line.trim_end().split(' ').collect();
        let mut out = Vec::new();

        match parts.as_slice() {
            ["get", keys @ ..] | ["gets", keys @ ..] => {
                for key in keys {
                    if let Some(entry) = state.get(key.as_bytes()) {
                        out.extend_from_slice(
                            format!("VALUE {} {} {}\r\n", key, entry.flags, entry.value.len()).as_bytes(),
                        );
                        out.extend_from_slice(&entry.value);
                        out.extend_from_slice(b"\r\n");
                    }
                }
                out.extend_from_slice(b"END\r\n");
            }
            [verb @ ("set" | "add" | "replace" | "append" | "prepend"), key, flags, _ttl, len] => {
                let len: usize = len.parse().unwrap_or(0);
                let mut data = vec![0u8; len + 2];
                reader.read_exact(&mut data).await?;
                data.truncate(len);
                let flags = flags.parse().unwrap_or(0);
                let stored = state.store(verb, key.as_bytes(), data, flags);
                out.extend_from_slice(if stored { &b"STORED\r\n"[..] } else { &b"NOT_STORED\r\n"[..] });
            }
            ["delete", key] => {
                let deleted = state.delete(key.as_bytes());
                out.extend_from_slice(if deleted { &b"DELETED\r\n"[..] } else { &b"NOT_FOUND\r\n"[..] });
            }
            [op @ ("incr" | "decr"), key, delta] => {
                let delta = delta.parse().unwrap_or(0);
                match state.counter(key.as_bytes(), delta, *op == "incr") {
                    Some(Ok(value)) => out.extend_from_slice(format!("{}\r\n", value).as_bytes()),
                    Some(Err(())) => out.extend_from_slice(
                        b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n",
                    ),
                    None => out.extend_from_slice(b"NOT_FOUND\r\n"),
                }
            }
            ["stats", ..] => {
                for (name, value) in state.stats() {
                    out.extend_from_slice(format!("STAT {} {}\r\n", name, value).as_bytes());
                }
                out.extend_from_slice(b"END\r\n");
            }
            ["version"] => out.extend_from_slice(format!("VERSION {}\r\n", VERSION).as_bytes()),
            ["flush_all", ..] => {
                state.items.lock().unwrap().clear();
                out.extend_from_slice(b"OK\r\n");
            }
            _ => out.extend_from_slice(b"ERROR\r\n"),
        }
        writer.write_all(&out).await?;
    }
}

async fn serve_binary(mut socket: TcpStream, state: Arc<State>) -> std::io::Result<()> {
    let mut header = [0u8; HEADER_LEN];
    loop {
        match socket.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
        state.commands.fetch_add(1, Ordering::Relaxed);
        if state.hang_up.swap(false, Ordering::Relaxed) {
            return Ok(());
        }
        let request = Header::parse(&header);
        let mut body = vec![0u8; request.body_len as usize];
        socket.read_exact(&mut body).await?;

        let extras_len = request.extras_len as usize;
        let key_len = request.key_len as usize;
        let extras = &body[..extras_len];
        let key = &body[extras_len..extras_len + key_len];
        let value = &body[extras_len + key_len..];

        let mut out = BytesMut::new();
        let code = request.opcode;
        let opaque = request.opaque;
        match code {
            opcode::GET => match state.get(key) {
                Some(entry) => binary::write_response(
                    &mut out, code, status::OK, opaque, entry.cas, &entry.flags.to_be_bytes(), &[], &entry.value,
                ),
                None => binary::write_response(&mut out, code, status::KEY_NOT_FOUND, opaque, 0, &[], &[], b"Not found"),
            },
            opcode::SET | opcode::ADD | opcode::REPLACE | opcode::APPEND | opcode::PREPEND => {
                let verb = match code {
                    opcode::SET => "set",
                    opcode::ADD => "add",
                    opcode::REPLACE => "replace",
                    opcode::APPEND => "append",
                    _ => "prepend",
                };
                let flags = if extras.len() >= 4 {
                    u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]])
                } else {
                    0
                };
                let response = if state.store(verb, key, value.to_vec(), flags) {
                    status::OK
                } else if code == opcode::ADD {
                    status::KEY_EXISTS
                } else {
                    status::NOT_STORED
                };
                binary::write_response(&mut out, code, response, opaque, 0, &[], &[], &[]);
            }
            opcode::DELETE => {
                let response = if state.delete(key) {
                    status::OK
                } else {
                    status::KEY_NOT_FOUND
                };
                binary::write_response(&mut out, code, response, opaque, 0, &[], &[], &[]);
            }
            opcode::INCREMENT | opcode::DECREMENT => {
                let mut delta = [0u8; 8];
                delta.copy_from_slice(&extras[..8]);
                let delta = u64::from_be_bytes(delta);
                match state.counter(key, delta, code == opcode::INCREMENT) {
                    Some(Ok(value)) => binary::write_response(
                        &mut out, code, status::OK, opaque, 0, &[], &[], &value.to_be_bytes(),
                    ),
                    Some(Err(())) => binary::write_response(
                        &mut out, code, status::NON_NUMERIC, opaque, 0, &[], &[], b"Non-numeric server-side value for incr or decr",
                    ),
                    None => binary::write_response(&mut out, code, status::KEY_NOT_FOUND, opaque, 0, &[], &[], b"Not found"),
                }
            }
            opcode::VERSION => {
                binary::write_response(&mut out, code, status::OK, opaque, 0, &[], &[], VERSION.as_bytes())
            }
            opcode::FLUSH => {
                state.items.lock().unwrap().clear();
                binary::write_response(&mut out, code, status::OK, opaque, 0, &[], &[], &[]);
            }
            _ => binary::write_response(&mut out, code, status::UNKNOWN_COMMAND, opaque, 0, &[], &[], b"Unknown command"),
        }
        socket.write_all(&out).await?;
    }
}
