//! An in-process stand-in for the server: a bare `TcpListener` task that
//! speaks the same length-prefixed framed protocol the client does, used by
//! the integration tests in this directory. Not a library surface — a real
//! server implementation is out of scope for this crate (`spec.md` §1).
//!
//! Each test binary under `tests/` compiles this module separately and uses
//! only a subset of it; the rest is dead code in that binary, not a bug.
#![allow(dead_code)]

use std::sync::Arc;

use rmp::encode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use tuplestore_client::wire::{body_key, header_key};

/// One decoded request header, enough for a scripted mock to decide how to
/// reply: the real server's full request-body grammar is reimplemented only
/// as far as these tests need it.
#[derive(Debug, Clone)]
pub struct MockRequest {
    pub request_type: u8,
    pub sync: u32,
    pub schema_id: Option<u64>,
}

/// What the mock server sends back for one request.
pub enum MockReply {
    /// A successful reply carrying zero or more tuples, each tuple a list
    /// of raw wire fields (already encoded: `Vec<u8>` per field).
    Tuples(Option<u64>, Vec<Vec<Vec<u8>>>),
    /// A successful reply carrying arbitrary nested MessagePack rows, used
    /// for `_vspace`/`_vindex` discovery replies.
    Rows(Option<u64>, Vec<MockRow>),
    /// A well-formed error reply.
    Error(Option<u64>, u32, &'static str),
    /// Close the socket without replying — simulates `CONNECTION_LOST`.
    Hangup,
}

/// One schema-discovery row, built with the small helpers below rather than
/// constructing raw `rmpv::Value`s inline at every call site.
pub type MockRow = rmpv::Value;

pub fn vspace_row(id: u32, name: &str, fields: &[(&str, &str)]) -> MockRow {
    let format: Vec<rmpv::Value> = fields
        .iter()
        .map(|(name, ty)| {
            rmpv::Value::Map(vec![
                (rmpv::Value::from("name"), rmpv::Value::from(*name)),
                (rmpv::Value::from("type"), rmpv::Value::from(*ty)),
            ])
        })
        .collect();
    rmpv::Value::Array(vec![
        rmpv::Value::from(id),
        rmpv::Value::from(1u32),
        rmpv::Value::from(name),
        rmpv::Value::from("memtx"),
        rmpv::Value::from(fields.len() as u32),
        rmpv::Value::Map(vec![]),
        rmpv::Value::Array(format),
    ])
}

pub fn vindex_row(space_id: u32, index_id: u32, name: &str, parts: &[(u32, &str)]) -> MockRow {
    let parts: Vec<rmpv::Value> = parts
        .iter()
        .map(|(position, ty)| {
            rmpv::Value::Array(vec![rmpv::Value::from(*position), rmpv::Value::from(*ty)])
        })
        .collect();
    rmpv::Value::Array(vec![
        rmpv::Value::from(space_id),
        rmpv::Value::from(index_id),
        rmpv::Value::from(name),
        rmpv::Value::from("tree"),
        rmpv::Value::Map(vec![]),
        rmpv::Value::Array(parts),
    ])
}

/// A running mock server: accepts exactly one connection, sends the
/// greeting, then replies to each request in turn from a scripted list.
/// Requests actually seen are recorded so tests can assert on what the
/// client sent (e.g. "discovery ran exactly twice").
pub struct MockServer {
    pub addr: std::net::SocketAddr,
    seen: Arc<std::sync::Mutex<Vec<MockRequest>>>,
    script_tx: mpsc::UnboundedSender<MockReply>,
}

impl MockServer {
    /// Start listening and spawn the server task. `script` is consumed one
    /// entry per request, in order; running out of script entries leaves
    /// later requests unanswered (the test will time out, which is the
    /// point — it means the client sent more than expected).
    pub async fn start(script: Vec<MockReply>) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local_addr");
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (script_tx, mut script_rx) = mpsc::unbounded_channel();
        for reply in script {
            script_tx.send(reply).expect("script channel open");
        }

        let seen_for_task = seen.clone();
        tokio::spawn(async move {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            send_greeting(&mut socket).await;

            loop {
                let request = match read_request(&mut socket).await {
                    Some(request) => request,
                    None => return,
                };
                seen_for_task.lock().unwrap().push(request.clone());

                let reply = match script_rx.try_recv() {
                    Ok(reply) => reply,
                    Err(_) => return,
                };
                if !send_reply(&mut socket, request.sync, reply).await {
                    return;
                }
            }
        });

        MockServer {
            addr,
            seen,
            script_tx,
        }
    }

    pub fn requests_seen(&self) -> Vec<MockRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    /// Append more scripted replies once the server is already running —
    /// used by the stale-schema test to queue a second discovery round
    /// on-the-fly based on what the first round already triggered.
    #[allow(dead_code)]
    pub fn push(&self, reply: MockReply) {
        let _ = self.script_tx.send(reply);
    }
}

async fn send_greeting(socket: &mut TcpStream) {
    let mut greeting = vec![0u8; tuplestore_client::defaults::GREETING_LENGTH];
    let banner = b"Tuplestore 1.0 (Binary) 00000000-0000-0000-0000-000000000000";
    greeting[..banner.len()].copy_from_slice(banner);

    let salt = base64::encode([0u8; 32]);
    let line_len = tuplestore_client::defaults::GREETING_LINE_LENGTH;
    greeting[line_len..line_len + salt.len()].copy_from_slice(salt.as_bytes());

    socket.write_all(&greeting).await.expect("write greeting");
}

async fn read_request(socket: &mut TcpStream) -> Option<MockRequest> {
    let len = read_length_prefix(socket).await?;
    let mut payload = vec![0u8; len as usize];
    socket.read_exact(&mut payload).await.ok()?;
    decode_request_header(&payload)
}

async fn read_length_prefix(socket: &mut TcpStream) -> Option<u64> {
    let marker = socket.read_u8().await.ok()?;
    let extra = match marker {
        0x00..=0x7f => return Some(marker as u64),
        0xcc => 1,
        0xcd => 2,
        0xce => 4,
        0xcf => 8,
        _ => return None,
    };
    let mut buf = [0u8; 8];
    socket.read_exact(&mut buf[..extra]).await.ok()?;
    let mut value = 0u64;
    for byte in &buf[..extra] {
        value = (value << 8) | (*byte as u64);
    }
    Some(value)
}

fn decode_request_header(payload: &[u8]) -> Option<MockRequest> {
    use rmp::decode;
    let mut cursor = payload;
    let len = decode::read_map_len(&mut cursor).ok()?;
    let mut request_type = 0u8;
    let mut sync = 0u32;
    let mut schema_id = None;
    for _ in 0..len {
        let key = decode::read_int::<u64, _>(&mut cursor).ok()?;
        match key {
            k if k == header_key::REQUEST_TYPE => {
                request_type = decode::read_int::<u64, _>(&mut cursor).ok()? as u8;
            }
            k if k == header_key::SYNC => {
                sync = decode::read_int::<u64, _>(&mut cursor).ok()? as u32;
            }
            k if k == header_key::SCHEMA_ID => {
                schema_id = Some(decode::read_int::<u64, _>(&mut cursor).ok()?);
            }
            _ => return None,
        }
    }
    Some(MockRequest {
        request_type,
        sync,
        schema_id,
    })
}

async fn send_reply(socket: &mut TcpStream, sync: u32, reply: MockReply) -> bool {
    let frame = match reply {
        MockReply::Tuples(schema_id, tuples) => encode_tuples_frame(sync, schema_id, &tuples, 0),
        MockReply::Rows(schema_id, rows) => encode_rows_frame(sync, schema_id, &rows),
        MockReply::Error(schema_id, code, message) => {
            encode_error_frame(sync, schema_id, code, message)
        }
        MockReply::Hangup => return false,
    };
    socket.write_all(&frame).await.is_ok()
}

fn encode_header(out: &mut Vec<u8>, sync: u32, schema_id: Option<u64>, code: u32) {
    let len = if schema_id.is_some() { 3 } else { 2 };
    encode::write_map_len(out, len).unwrap();
    encode::write_uint(out, header_key::REQUEST_TYPE).unwrap();
    encode::write_uint(out, code as u64).unwrap();
    encode::write_uint(out, header_key::SYNC).unwrap();
    encode::write_uint(out, sync as u64).unwrap();
    if let Some(schema_id) = schema_id {
        encode::write_uint(out, header_key::SCHEMA_ID).unwrap();
        encode::write_uint(out, schema_id).unwrap();
    }
}

fn frame_from_payload(payload: Vec<u8>) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 5);
    encode::write_uint(&mut frame, payload.len() as u64).unwrap();
    frame.extend_from_slice(&payload);
    frame
}

pub fn encode_tuples_frame(
    sync: u32,
    schema_id: Option<u64>,
    tuples: &[Vec<Vec<u8>>],
    code: u32,
) -> Vec<u8> {
    let mut payload = Vec::new();
    encode_header(&mut payload, sync, schema_id, code);
    encode::write_map_len(&mut payload, 1).unwrap();
    encode::write_uint(&mut payload, body_key::DATA).unwrap();
    encode::write_array_len(&mut payload, tuples.len() as u32).unwrap();
    for tuple in tuples {
        encode::write_array_len(&mut payload, tuple.len() as u32).unwrap();
        for field in tuple {
            encode::write_bin(&mut payload, field).unwrap();
        }
    }
    frame_from_payload(payload)
}

fn encode_rows_frame(sync: u32, schema_id: Option<u64>, rows: &[MockRow]) -> Vec<u8> {
    let mut payload = Vec::new();
    encode_header(&mut payload, sync, schema_id, 0);
    encode::write_map_len(&mut payload, 1).unwrap();
    encode::write_uint(&mut payload, body_key::DATA).unwrap();
    encode::write_array_len(&mut payload, rows.len() as u32).unwrap();
    for row in rows {
        rmpv::encode::write_value(&mut payload, row).expect("writing to a Vec never fails");
    }
    frame_from_payload(payload)
}

fn encode_error_frame(sync: u32, schema_id: Option<u64>, code: u32, message: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    encode_header(&mut payload, sync, schema_id, tuplestore_client::error::ERROR_FLAG | code);
    encode::write_map_len(&mut payload, 1).unwrap();
    encode::write_uint(&mut payload, body_key::ERROR).unwrap();
    encode::write_str(&mut payload, message).unwrap();
    frame_from_payload(payload)
}

/// Encode a `u32` as the little-endian wire field the client expects for a
/// `NUM` field.
pub fn num(value: u32) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

/// Encode a UTF-8 string as the wire field the client expects for a
/// `UTF8STR`/`STR` field.
pub fn text(value: &str) -> Vec<u8> {
    value.as_bytes().to_vec()
}
