//! Frame-level read/write and request/response (de)serialization.
//!
//! Encoding is done eagerly into an in-memory buffer with `rmp::encode`, then
//! the buffer is length-prefixed and written to the socket; decoding mirrors
//! this in reverse. The implementer consumes/produces whole frames only —
//! [`read_frame`] buffers until a complete frame is available.

use std::convert::TryFrom;
use std::io;

use rmp::decode::{self, ValueReadError};
use rmp::encode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;
use crate::wire::{body_key, header_key, request_type, Iterator, WireTuple};

/// An outgoing request envelope (`spec.md` §3).
#[derive(Debug, Clone)]
pub struct RequestHeader {
    pub request_type: u8,
    pub sync: u32,
    pub schema_id: Option<u64>,
}

/// The type-specific body of an outgoing request.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Ping,
    Auth {
        user: String,
        scramble: [u8; 20],
    },
    Call {
        function_name: String,
        args: Vec<rmpv::Value>,
    },
    Select {
        space_id: u32,
        index_id: u32,
        limit: u32,
        offset: u32,
        iterator: Iterator,
        key: WireTuple,
    },
    Insert {
        space_id: u32,
        tuple: WireTuple,
    },
    Replace {
        space_id: u32,
        tuple: WireTuple,
    },
    Delete {
        space_id: u32,
        index_id: u32,
        key: WireTuple,
    },
    Update {
        space_id: u32,
        index_id: u32,
        key: WireTuple,
        ops: Vec<EncodedOp>,
    },
    Upsert {
        space_id: u32,
        tuple: WireTuple,
        ops: Vec<EncodedOp>,
    },
}

/// An update operation once its field has been resolved to a numeric
/// position and its arguments have been packed to wire bytes.
#[derive(Debug, Clone)]
pub struct EncodedOp {
    pub code: char,
    pub field: u32,
    pub args: Vec<OpArg>,
}

#[derive(Debug, Clone)]
pub enum OpArg {
    Int(i64),
    Bytes(Vec<u8>),
}

/// A complete, decoded reply. The server overloads the `REQUEST_TYPE`
/// header key on responses to carry the response code instead: `0` for
/// success, otherwise [`crate::error::ERROR_FLAG`] set plus an error class
/// in the low bits.
#[derive(Debug, Clone)]
pub struct ResponseHeader {
    pub sync: u32,
    pub schema_id: Option<u64>,
    pub code: u32,
}

#[derive(Debug, Clone)]
pub enum ResponseBody {
    Data(Vec<WireTuple>),
    Error(String),
}

/// Encode a full frame (length prefix + header + body) ready to write to the
/// socket.
pub fn encode_frame(header: &RequestHeader, body: &RequestBody) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64);
    encode_header(&mut payload, header);
    encode_body(&mut payload, body);

    let mut frame = Vec::with_capacity(payload.len() + 5);
    encode::write_uint(&mut frame, payload.len() as u64).expect("writing to a Vec never fails");
    frame.extend_from_slice(&payload);
    frame
}

fn encode_header(out: &mut Vec<u8>, header: &RequestHeader) {
    let len = if header.schema_id.is_some() { 3 } else { 2 };
    encode::write_map_len(out, len).unwrap();
    encode::write_uint(out, header_key::REQUEST_TYPE).unwrap();
    encode::write_uint(out, header.request_type as u64).unwrap();
    encode::write_uint(out, header_key::SYNC).unwrap();
    encode::write_uint(out, header.sync as u64).unwrap();
    if let Some(schema_id) = header.schema_id {
        encode::write_uint(out, header_key::SCHEMA_ID).unwrap();
        encode::write_uint(out, schema_id).unwrap();
    }
}

fn encode_wire_field(out: &mut Vec<u8>, field: &[u8]) {
    encode::write_bin(out, field).unwrap();
}

fn encode_tuple(out: &mut Vec<u8>, tuple: &WireTuple) {
    encode::write_array_len(out, tuple.len() as u32).unwrap();
    for field in tuple {
        encode_wire_field(out, field);
    }
}

fn encode_op(out: &mut Vec<u8>, op: &EncodedOp) {
    encode::write_array_len(out, 2 + op.args.len() as u32).unwrap();
    encode::write_str(out, &op.code.to_string()).unwrap();
    encode::write_uint(out, op.field as u64).unwrap();
    for arg in &op.args {
        match arg {
            OpArg::Int(n) => {
                encode::write_sint(out, *n).unwrap();
            }
            OpArg::Bytes(bytes) => encode_wire_field(out, bytes),
        }
    }
}

fn encode_body(out: &mut Vec<u8>, body: &RequestBody) {
    match body {
        RequestBody::Ping => {
            encode::write_map_len(out, 0).unwrap();
        }
        RequestBody::Auth { user, scramble } => {
            encode::write_map_len(out, 2).unwrap();
            encode::write_uint(out, body_key::USER_NAME).unwrap();
            encode::write_str(out, user).unwrap();
            encode::write_uint(out, body_key::SCRAMBLE).unwrap();
            encode::write_bin(out, scramble).unwrap();
        }
        RequestBody::Call {
            function_name,
            args,
        } => {
            encode::write_map_len(out, 2).unwrap();
            encode::write_uint(out, body_key::FUNCTION_NAME).unwrap();
            encode::write_str(out, function_name).unwrap();
            encode::write_uint(out, body_key::TUPLE).unwrap();
            encode::write_array_len(out, args.len() as u32).unwrap();
            for arg in args {
                rmpv::encode::write_value(out, arg).expect("writing to a Vec never fails");
            }
        }
        RequestBody::Select {
            space_id,
            index_id,
            limit,
            offset,
            iterator,
            key,
        } => {
            encode::write_map_len(out, 6).unwrap();
            encode::write_uint(out, body_key::SPACE_ID).unwrap();
            encode::write_uint(out, *space_id as u64).unwrap();
            encode::write_uint(out, body_key::INDEX_ID).unwrap();
            encode::write_uint(out, *index_id as u64).unwrap();
            encode::write_uint(out, body_key::LIMIT).unwrap();
            encode::write_uint(out, *limit as u64).unwrap();
            encode::write_uint(out, body_key::OFFSET).unwrap();
            encode::write_uint(out, *offset as u64).unwrap();
            encode::write_uint(out, body_key::ITERATOR).unwrap();
            encode::write_uint(out, iterator.code() as u64).unwrap();
            encode::write_uint(out, body_key::KEY).unwrap();
            encode_tuple(out, key);
        }
        RequestBody::Insert { space_id, tuple } | RequestBody::Replace { space_id, tuple } => {
            encode::write_map_len(out, 2).unwrap();
            encode::write_uint(out, body_key::SPACE_ID).unwrap();
            encode::write_uint(out, *space_id as u64).unwrap();
            encode::write_uint(out, body_key::TUPLE).unwrap();
            encode_tuple(out, tuple);
        }
        RequestBody::Delete {
            space_id,
            index_id,
            key,
        } => {
            encode::write_map_len(out, 3).unwrap();
            encode::write_uint(out, body_key::SPACE_ID).unwrap();
            encode::write_uint(out, *space_id as u64).unwrap();
            encode::write_uint(out, body_key::INDEX_ID).unwrap();
            encode::write_uint(out, *index_id as u64).unwrap();
            encode::write_uint(out, body_key::KEY).unwrap();
            encode_tuple(out, key);
        }
        RequestBody::Update {
            space_id,
            index_id,
            key,
            ops,
        } => {
            encode::write_map_len(out, 4).unwrap();
            encode::write_uint(out, body_key::SPACE_ID).unwrap();
            encode::write_uint(out, *space_id as u64).unwrap();
            encode::write_uint(out, body_key::INDEX_ID).unwrap();
            encode::write_uint(out, *index_id as u64).unwrap();
            encode::write_uint(out, body_key::KEY).unwrap();
            encode_tuple(out, key);
            encode::write_uint(out, body_key::OPS).unwrap();
            encode::write_array_len(out, ops.len() as u32).unwrap();
            for op in ops {
                encode_op(out, op);
            }
        }
        RequestBody::Upsert {
            space_id,
            tuple,
            ops,
        } => {
            encode::write_map_len(out, 3).unwrap();
            encode::write_uint(out, body_key::SPACE_ID).unwrap();
            encode::write_uint(out, *space_id as u64).unwrap();
            encode::write_uint(out, body_key::TUPLE).unwrap();
            encode_tuple(out, tuple);
            encode::write_uint(out, body_key::OPS).unwrap();
            encode::write_array_len(out, ops.len() as u32).unwrap();
            for op in ops {
                encode_op(out, op);
            }
        }
    }
}

/// Read one complete frame's payload (header+body bytes, length prefix
/// already stripped) from an async reader. Suspends until the whole frame
/// has arrived; never returns a partial frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, TransportError> {
    let len = read_length_prefix(reader).await?;
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| connection_lost(&e))?;
    Ok(payload)
}

async fn read_length_prefix<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u64, TransportError> {
    let marker = reader.read_u8().await.map_err(|e| connection_lost(&e))?;
    let extra = match marker {
        0x00..=0x7f => return Ok(marker as u64),
        0xcc => 1,
        0xcd => 2,
        0xce => 4,
        0xcf => 8,
        other => {
            return Err(TransportError::Protocol(format!(
                "invalid length-prefix marker {:#04x}",
                other
            )))
        }
    };
    let mut buf = [0u8; 8];
    reader
        .read_exact(&mut buf[..extra])
        .await
        .map_err(|e| connection_lost(&e))?;
    let mut value = 0u64;
    for byte in &buf[..extra] {
        value = (value << 8) | (*byte as u64);
    }
    Ok(value)
}

fn connection_lost(err: &io::Error) -> TransportError {
    TransportError::ConnectionLost(err.to_string())
}

/// Write a full frame to the socket.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: &RequestHeader,
    body: &RequestBody,
) -> Result<(), TransportError> {
    let frame = encode_frame(header, body);
    writer
        .write_all(&frame)
        .await
        .map_err(|e| connection_lost(&e))?;
    writer.flush().await.map_err(|e| connection_lost(&e))?;
    Ok(())
}

/// Decode just the header, to learn the `sync` id before deciding which body
/// decoder a given pending request expects.
pub fn peek_header(payload: &[u8]) -> Result<ResponseHeader, TransportError> {
    let mut cursor = payload;
    decode_header(&mut cursor)
}

/// Decode a complete (header, body) pair from a frame's raw payload bytes.
pub fn decode_response(payload: &[u8]) -> Result<(ResponseHeader, ResponseBody), TransportError> {
    let mut cursor = payload;
    let header = decode_header(&mut cursor)?;
    let body = decode_body(&mut cursor, header.code)?;
    Ok((header, body))
}

/// A reply whose data payload is decoded as generic MessagePack values
/// rather than the fixed-width-per-field tuple encoding — used for schema
/// discovery (`_vspace`/`_vindex` rows carry nested maps and arrays) and for
/// `call`/`eval` results, neither of which is governed by a space
/// descriptor.
#[derive(Debug, Clone)]
pub enum GenericResponseBody {
    Data(Vec<rmpv::Value>),
    Error(String),
}

/// Like [`decode_response`], but for replies whose payload is not plain
/// per-field tuple data.
pub fn decode_generic_response(
    payload: &[u8],
) -> Result<(ResponseHeader, GenericResponseBody), TransportError> {
    let mut cursor = payload;
    let header = decode_header(&mut cursor)?;
    let body = decode_generic_body(&mut cursor, header.code)?;
    Ok((header, body))
}

fn decode_generic_body(
    cursor: &mut &[u8],
    code: u32,
) -> Result<GenericResponseBody, TransportError> {
    let len = decode::read_map_len(cursor).map_err(map_read_err)?;
    let mut data = None;
    let mut error = None;

    for _ in 0..len {
        let key = decode::read_int::<u64, _>(cursor).map_err(map_read_err)?;
        match key {
            body_key::DATA => {
                let value = rmpv::decode::read_value(cursor)
                    .map_err(|e| TransportError::Protocol(e.to_string()))?;
                data = Some(match value {
                    rmpv::Value::Array(items) => items,
                    other => vec![other],
                });
            }
            body_key::ERROR => error = Some(decode_str(cursor)?),
            _ => skip_value(cursor)?,
        }
    }

    if code & crate::error::ERROR_FLAG != 0 {
        Ok(GenericResponseBody::Error(
            error.unwrap_or_else(|| String::from("(no error message)")),
        ))
    } else {
        Ok(GenericResponseBody::Data(data.unwrap_or_default()))
    }
}

fn map_read_err(err: ValueReadError) -> TransportError {
    TransportError::Protocol(err.to_string())
}

fn decode_header(cursor: &mut &[u8]) -> Result<ResponseHeader, TransportError> {
    let len = decode::read_map_len(cursor).map_err(map_read_err)?;
    let mut sync = 0u32;
    let mut schema_id = None;
    let mut code = 0u32;

    for _ in 0..len {
        let key = decode::read_int::<u64, _>(cursor).map_err(map_read_err)?;
        match key {
            header_key::REQUEST_TYPE => {
                code = decode::read_int::<u64, _>(cursor).map_err(map_read_err)? as u32;
            }
            header_key::SYNC => {
                sync = decode::read_int::<u64, _>(cursor).map_err(map_read_err)? as u32;
            }
            header_key::SCHEMA_ID => {
                schema_id = Some(decode::read_int::<u64, _>(cursor).map_err(map_read_err)?);
            }
            _ => {
                return Err(TransportError::Protocol(format!(
                    "unknown header key {}",
                    key
                )))
            }
        }
    }

    Ok(ResponseHeader {
        sync,
        schema_id,
        code,
    })
}

fn decode_body(cursor: &mut &[u8], code: u32) -> Result<ResponseBody, TransportError> {
    let len = decode::read_map_len(cursor).map_err(map_read_err)?;
    let mut data = None;
    let mut error = None;

    for _ in 0..len {
        let key = decode::read_int::<u64, _>(cursor).map_err(map_read_err)?;
        match key {
            body_key::DATA => data = Some(decode_tuple_list(cursor)?),
            body_key::ERROR => error = Some(decode_str(cursor)?),
            _ => {
                // Unrecognized body keys are ignored rather than fatal; the
                // server may add fields this client does not yet understand.
                skip_value(cursor)?;
            }
        }
    }

    if code & crate::error::ERROR_FLAG as u32 != 0 {
        Ok(ResponseBody::Error(
            error.unwrap_or_else(|| String::from("(no error message)")),
        ))
    } else {
        Ok(ResponseBody::Data(data.unwrap_or_default()))
    }
}

fn decode_tuple_list(cursor: &mut &[u8]) -> Result<Vec<WireTuple>, TransportError> {
    let len = decode::read_array_len(cursor).map_err(map_read_err)?;
    let mut tuples = Vec::with_capacity(len as usize);
    for _ in 0..len {
        tuples.push(decode_tuple(cursor)?);
    }
    Ok(tuples)
}

fn decode_tuple(cursor: &mut &[u8]) -> Result<WireTuple, TransportError> {
    let len = decode::read_array_len(cursor).map_err(map_read_err)?;
    let mut fields = Vec::with_capacity(len as usize);
    for _ in 0..len {
        fields.push(decode_wire_field(cursor)?);
    }
    Ok(fields)
}

fn decode_wire_field(cursor: &mut &[u8]) -> Result<Vec<u8>, TransportError> {
    let marker = decode::read_marker(cursor).map_err(|e| TransportError::Protocol(e.to_string()))?;
    use rmp::Marker;
    match marker {
        Marker::FixStr(len) => read_exact(cursor, len as usize),
        Marker::Str8 => {
            let len = read_u8(cursor)? as usize;
            read_exact(cursor, len)
        }
        Marker::Str16 => {
            let len = read_be_u16(cursor)? as usize;
            read_exact(cursor, len)
        }
        Marker::Str32 => {
            let len = read_be_u32(cursor)? as usize;
            read_exact(cursor, len)
        }
        Marker::Bin8 => {
            let len = read_u8(cursor)? as usize;
            read_exact(cursor, len)
        }
        Marker::Bin16 => {
            let len = read_be_u16(cursor)? as usize;
            read_exact(cursor, len)
        }
        Marker::Bin32 => {
            let len = read_be_u32(cursor)? as usize;
            read_exact(cursor, len)
        }
        other => Err(TransportError::Protocol(format!(
            "expected a string or binary tuple field, got {:?}",
            other
        ))),
    }
}

fn decode_str(cursor: &mut &[u8]) -> Result<String, TransportError> {
    let bytes = decode_wire_field(cursor)?;
    String::from_utf8(bytes)
        .map_err(|e| TransportError::Protocol(format!("invalid UTF-8 in error message: {}", e)))
}

fn skip_value(cursor: &mut &[u8]) -> Result<(), TransportError> {
    // Best-effort skip of one MessagePack value, sufficient for the handful
    // of scalar/compound shapes this protocol actually sends.
    use rmp::Marker;
    let marker =
        decode::read_marker(cursor).map_err(|e| TransportError::Protocol(e.to_string()))?;
    match marker {
        Marker::FixPos(_) | Marker::FixNeg(_) | Marker::Null | Marker::True | Marker::False => {
            Ok(())
        }
        Marker::U8 | Marker::I8 => read_exact(cursor, 1).map(|_| ()),
        Marker::U16 | Marker::I16 => read_exact(cursor, 2).map(|_| ()),
        Marker::U32 | Marker::I32 | Marker::F32 => read_exact(cursor, 4).map(|_| ()),
        Marker::U64 | Marker::I64 | Marker::F64 => read_exact(cursor, 8).map(|_| ()),
        Marker::FixStr(len) => read_exact(cursor, len as usize).map(|_| ()),
        Marker::Str8 | Marker::Bin8 => {
            let len = read_u8(cursor)?;
            read_exact(cursor, len as usize).map(|_| ())
        }
        Marker::Str16 | Marker::Bin16 => {
            let len = read_be_u16(cursor)?;
            read_exact(cursor, len as usize).map(|_| ())
        }
        Marker::Str32 | Marker::Bin32 => {
            let len = read_be_u32(cursor)?;
            read_exact(cursor, len as usize).map(|_| ())
        }
        Marker::FixArray(len) => {
            for _ in 0..len {
                skip_value(cursor)?;
            }
            Ok(())
        }
        Marker::FixMap(len) => {
            for _ in 0..len * 2 {
                skip_value(cursor)?;
            }
            Ok(())
        }
        other => Err(TransportError::Protocol(format!(
            "cannot skip unsupported value {:?}",
            other
        ))),
    }
}

fn read_exact(cursor: &mut &[u8], len: usize) -> Result<Vec<u8>, TransportError> {
    if cursor.len() < len {
        return Err(TransportError::Protocol(
            "frame ended before expected value".into(),
        ));
    }
    let (value, rest) = cursor.split_at(len);
    *cursor = rest;
    Ok(value.to_vec())
}

fn read_u8(cursor: &mut &[u8]) -> Result<u8, TransportError> {
    Ok(read_exact(cursor, 1)?[0])
}

fn read_be_u16(cursor: &mut &[u8]) -> Result<u16, TransportError> {
    let bytes = read_exact(cursor, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_be_u32(cursor: &mut &[u8]) -> Result<u32, TransportError> {
    let bytes = read_exact(cursor, 4)?;
    Ok(u32::from_be_bytes(<[u8; 4]>::try_from(bytes.as_slice()).unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_ping_request() {
        let header = RequestHeader {
            request_type: request_type::PING,
            sync: 7,
            schema_id: Some(42),
        };
        let frame = encode_frame(&header, &RequestBody::Ping);
        assert!(!frame.is_empty());
    }

    #[test]
    fn decodes_success_with_data() {
        let mut payload = Vec::new();
        encode::write_map_len(&mut payload, 2).unwrap();
        encode::write_uint(&mut payload, header_key::REQUEST_TYPE).unwrap();
        encode::write_uint(&mut payload, request_type::PING as u64).unwrap();
        encode::write_uint(&mut payload, header_key::SYNC).unwrap();
        encode::write_uint(&mut payload, 7).unwrap();

        encode::write_map_len(&mut payload, 1).unwrap();
        encode::write_uint(&mut payload, body_key::DATA).unwrap();
        encode::write_array_len(&mut payload, 1).unwrap();
        encode::write_array_len(&mut payload, 2).unwrap();
        encode::write_bin(&mut payload, &1u32.to_le_bytes()).unwrap();
        encode::write_str(&mut payload, "abc").unwrap();

        let (header, body) = decode_response(&payload).unwrap();
        assert_eq!(header.sync, 7);
        match body {
            ResponseBody::Data(tuples) => {
                assert_eq!(tuples.len(), 1);
                assert_eq!(tuples[0][1], b"abc");
            }
            ResponseBody::Error(_) => panic!("expected data"),
        }
    }

    #[test]
    fn decodes_error_response() {
        let mut payload = Vec::new();
        encode::write_map_len(&mut payload, 2).unwrap();
        encode::write_uint(&mut payload, header_key::REQUEST_TYPE).unwrap();
        encode::write_uint(&mut payload, (crate::error::ERROR_FLAG | 4) as u64).unwrap();
        encode::write_uint(&mut payload, header_key::SYNC).unwrap();
        encode::write_uint(&mut payload, 9).unwrap();

        encode::write_map_len(&mut payload, 1).unwrap();
        encode::write_uint(&mut payload, body_key::ERROR).unwrap();
        encode::write_str(&mut payload, "already exists").unwrap();

        let (header, body) = decode_response(&payload).unwrap();
        assert_eq!(header.code, crate::error::ERROR_FLAG as u32 | 4);
        match body {
            ResponseBody::Error(message) => assert_eq!(message, "already exists"),
            ResponseBody::Data(_) => panic!("expected error"),
        }
    }

    #[test]
    fn decodes_generic_response_with_nested_values() {
        let mut payload = Vec::new();
        encode::write_map_len(&mut payload, 2).unwrap();
        encode::write_uint(&mut payload, header_key::REQUEST_TYPE).unwrap();
        encode::write_uint(&mut payload, 0).unwrap();
        encode::write_uint(&mut payload, header_key::SYNC).unwrap();
        encode::write_uint(&mut payload, 3).unwrap();

        encode::write_map_len(&mut payload, 1).unwrap();
        encode::write_uint(&mut payload, body_key::DATA).unwrap();
        // One metadata-shaped row: [space_no, uid, name, engine, field_count, {opts}, [format...]]
        encode::write_array_len(&mut payload, 1).unwrap();
        encode::write_array_len(&mut payload, 7).unwrap();
        encode::write_uint(&mut payload, 512).unwrap();
        encode::write_uint(&mut payload, 1).unwrap();
        encode::write_str(&mut payload, "widgets").unwrap();
        encode::write_str(&mut payload, "memtx").unwrap();
        encode::write_uint(&mut payload, 2).unwrap();
        encode::write_map_len(&mut payload, 0).unwrap();
        encode::write_array_len(&mut payload, 1).unwrap();
        encode::write_map_len(&mut payload, 2).unwrap();
        encode::write_str(&mut payload, "name").unwrap();
        encode::write_str(&mut payload, "id").unwrap();
        encode::write_str(&mut payload, "type").unwrap();
        encode::write_str(&mut payload, "unsigned").unwrap();

        let (_header, body) = decode_generic_response(&payload).unwrap();
        match body {
            GenericResponseBody::Data(rows) => {
                assert_eq!(rows.len(), 1);
                let row = rows[0].as_array().unwrap();
                assert_eq!(row[2].as_str().unwrap(), "widgets");
            }
            GenericResponseBody::Error(_) => panic!("expected data"),
        }
    }
}
