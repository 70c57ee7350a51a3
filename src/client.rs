//! L3: the public data-plane surface — insert/replace/delete/update/upsert/
//! select/call, each consulting the schema cache, packing its arguments
//! accordingly, issuing the request, decoding the reply, and retrying once
//! on a stale-schema error (`spec.md` §4.3).

use std::sync::Arc;

use tracing::instrument;

use crate::config::Config;
use crate::error::ClientError;
use crate::ops::{FieldRef, Space, SelectOptions, UpdateOp};
use crate::schema::value::Value;
use crate::schema::{FieldType, SchemaCache, SpaceDescriptor};
use crate::transport::connection::Connection;
use crate::wire::codec::{EncodedOp, GenericResponseBody, OpArg, RequestBody, ResponseBody};
use crate::wire::{request_type, WireTuple};
use crate::tuple::{Tuple, TupleSet};

/// `delete` and `update` key lookups always go through the primary index,
/// which the server always assigns id `0` (`spec.md` §4.3: neither op takes
/// an index argument).
const PRIMARY_INDEX_ID: u32 = 0;

/// A connected client. Cheap to `Clone`: the transport actor and the schema
/// cache are both shared handles, so clones observe the same connection and
/// the same cached schema.
#[derive(Clone)]
pub struct Client {
    connection: Connection,
    schema: SchemaCache,
}

impl Client {
    /// Connect to the server named by `config`, completing the handshake
    /// (and authentication, if credentials are configured) before
    /// returning. Schema discovery is lazy: it happens on the first
    /// operation that needs a named lookup, unless `config.spaces` supplies
    /// a pre-built schema that bypasses discovery entirely.
    pub async fn connect(config: Config) -> Result<Client, ClientError> {
        let preloaded = config.spaces.clone();
        let connection = Connection::connect(config).await?;
        let schema = match preloaded {
            Some(spaces) => SchemaCache::with_snapshot(spaces),
            None => SchemaCache::new(),
        };
        Ok(Client { connection, schema })
    }

    /// Close the underlying connection. Every request still in flight is
    /// completed with [`crate::error::TransportError::Closed`].
    pub fn close(&self) {
        self.connection.close();
    }

    /// A bare `ping`, bypassing the schema cache entirely (it carries no
    /// `schema_id`, per `spec.md` §3: "may be null for pre-schema ops such
    /// as ping").
    pub async fn ping(&self) -> Result<(), ClientError> {
        self.connection.ping().await?;
        Ok(())
    }

    /// Insert a new tuple into `space`. Fails with a server error if a
    /// tuple with a colliding primary key already exists.
    #[instrument(skip(self, tuple))]
    pub async fn insert(
        &self,
        space: impl Into<Space>,
        tuple: Vec<Value>,
    ) -> Result<TupleSet, ClientError> {
        let space = space.into();
        self.retry(|| self.insert_once(&space, &tuple)).await
    }

    async fn insert_once(&self, space: &Space, tuple: &[Value]) -> Result<TupleSet, ClientError> {
        let descriptor = self.resolve_space(space).await?;
        let space_id = self.space_id(space, descriptor.as_deref())?;
        let schema_id = self.schema.schema_id().await;
        let wire_tuple = encode_tuple(tuple);
        let (header, body) = self
            .connection
            .execute_typed(
                request_type::INSERT,
                schema_id,
                RequestBody::Insert {
                    space_id,
                    tuple: wire_tuple,
                },
            )
            .await?;
        decode_tuples(header.code, body, descriptor)
    }

    /// Insert a tuple, overwriting any existing tuple with the same primary
    /// key.
    #[instrument(skip(self, tuple))]
    pub async fn replace(
        &self,
        space: impl Into<Space>,
        tuple: Vec<Value>,
    ) -> Result<TupleSet, ClientError> {
        let space = space.into();
        self.retry(|| self.replace_once(&space, &tuple)).await
    }

    async fn replace_once(&self, space: &Space, tuple: &[Value]) -> Result<TupleSet, ClientError> {
        let descriptor = self.resolve_space(space).await?;
        let space_id = self.space_id(space, descriptor.as_deref())?;
        let schema_id = self.schema.schema_id().await;
        let wire_tuple = encode_tuple(tuple);
        let (header, body) = self
            .connection
            .execute_typed(
                request_type::REPLACE,
                schema_id,
                RequestBody::Replace {
                    space_id,
                    tuple: wire_tuple,
                },
            )
            .await?;
        decode_tuples(header.code, body, descriptor)
    }

    /// Remove the tuple matching `key` on the primary index.
    #[instrument(skip(self, key))]
    pub async fn delete(
        &self,
        space: impl Into<Space>,
        key: Vec<Value>,
    ) -> Result<TupleSet, ClientError> {
        let space = space.into();
        self.retry(|| self.delete_once(&space, &key)).await
    }

    async fn delete_once(&self, space: &Space, key: &[Value]) -> Result<TupleSet, ClientError> {
        let descriptor = self.resolve_space(space).await?;
        let space_id = self.space_id(space, descriptor.as_deref())?;
        let schema_id = self.schema.schema_id().await;
        let wire_key = encode_tuple(key);
        let (header, body) = self
            .connection
            .execute_typed(
                request_type::DELETE,
                schema_id,
                RequestBody::Delete {
                    space_id,
                    index_id: PRIMARY_INDEX_ID,
                    key: wire_key,
                },
            )
            .await?;
        decode_tuples(header.code, body, descriptor)
    }

    /// Search `space` via `index` for tuples matching `key`, subject to
    /// `options` (limit/offset/iterator).
    #[instrument(skip(self, key, options))]
    pub async fn select(
        &self,
        space: impl Into<Space>,
        index: impl Into<Space>,
        key: Vec<Value>,
        options: SelectOptions,
    ) -> Result<TupleSet, ClientError> {
        let space = space.into();
        let index = index.into();
        self.retry(|| self.select_once(&space, &index, &key, &options))
            .await
    }

    async fn select_once(
        &self,
        space: &Space,
        index: &Space,
        key: &[Value],
        options: &SelectOptions,
    ) -> Result<TupleSet, ClientError> {
        let descriptor = self.resolve_space(space).await?;
        let space_id = self.space_id(space, descriptor.as_deref())?;
        let index_id = self.index_id(index, descriptor.as_deref())?;
        let schema_id = self.schema.schema_id().await;
        let wire_key = encode_tuple(key);
        let (header, body) = self
            .connection
            .execute_typed(
                request_type::SELECT,
                schema_id,
                RequestBody::Select {
                    space_id,
                    index_id,
                    limit: options.limit,
                    offset: options.offset,
                    iterator: options.iterator,
                    key: wire_key,
                },
            )
            .await?;
        decode_tuples(header.code, body, descriptor)
    }

    /// Apply `ops` in order to the tuple matching `key` on the primary
    /// index, returning the updated tuple.
    #[instrument(skip(self, key, ops))]
    pub async fn update(
        &self,
        space: impl Into<Space>,
        key: Vec<Value>,
        ops: Vec<UpdateOp>,
    ) -> Result<TupleSet, ClientError> {
        let space = space.into();
        self.retry(|| self.update_once(&space, &key, &ops)).await
    }

    async fn update_once(
        &self,
        space: &Space,
        key: &[Value],
        ops: &[UpdateOp],
    ) -> Result<TupleSet, ClientError> {
        let descriptor = self.resolve_space(space).await?;
        let space_id = self.space_id(space, descriptor.as_deref())?;
        let schema_id = self.schema.schema_id().await;
        let wire_key = encode_tuple(key);
        let encoded_ops = encode_ops(descriptor.as_deref(), ops)?;
        let (header, body) = self
            .connection
            .execute_typed(
                request_type::UPDATE,
                schema_id,
                RequestBody::Update {
                    space_id,
                    index_id: PRIMARY_INDEX_ID,
                    key: wire_key,
                    ops: encoded_ops,
                },
            )
            .await?;
        decode_tuples(header.code, body, descriptor)
    }

    /// Insert `tuple` if no tuple with its primary key exists yet,
    /// otherwise apply `ops` to the existing tuple. The server never
    /// returns the resulting tuple for `upsert` (`spec.md` §4.3), so this
    /// always resolves to an empty [`TupleSet`] on success.
    #[instrument(skip(self, tuple, ops))]
    pub async fn upsert(
        &self,
        space: impl Into<Space>,
        tuple: Vec<Value>,
        ops: Vec<UpdateOp>,
    ) -> Result<(), ClientError> {
        let space = space.into();
        self.retry(|| self.upsert_once(&space, &tuple, &ops)).await
    }

    async fn upsert_once(
        &self,
        space: &Space,
        tuple: &[Value],
        ops: &[UpdateOp],
    ) -> Result<(), ClientError> {
        let descriptor = self.resolve_space(space).await?;
        let space_id = self.space_id(space, descriptor.as_deref())?;
        let schema_id = self.schema.schema_id().await;
        let wire_tuple = encode_tuple(tuple);
        let encoded_ops = encode_ops(descriptor.as_deref(), ops)?;
        let (header, body) = self
            .connection
            .execute_typed(
                request_type::UPSERT,
                schema_id,
                RequestBody::Upsert {
                    space_id,
                    tuple: wire_tuple,
                    ops: encoded_ops,
                },
            )
            .await?;
        match body {
            ResponseBody::Data(_) => Ok(()),
            ResponseBody::Error(message) => Err(ClientError::Server(
                crate::error::ServerError::new(header.code, message),
            )),
        }
    }

    /// Invoke a stored Lua procedure by name, with arbitrary MessagePack
    /// arguments. No space descriptor governs the result: `call` always
    /// returns raw rows.
    #[instrument(skip(self, args))]
    pub async fn call(
        &self,
        proc: impl Into<String>,
        args: Vec<rmpv::Value>,
    ) -> Result<Vec<rmpv::Value>, ClientError> {
        let proc = proc.into();
        self.retry(|| self.call_once(&proc, &args)).await
    }

    async fn call_once(
        &self,
        proc: &str,
        args: &[rmpv::Value],
    ) -> Result<Vec<rmpv::Value>, ClientError> {
        let schema_id = self.schema.schema_id().await;
        let (header, body) = self
            .connection
            .execute_generic(
                request_type::CALL,
                schema_id,
                RequestBody::Call {
                    function_name: proc.to_owned(),
                    args: args.to_vec(),
                },
            )
            .await?;
        match body {
            GenericResponseBody::Data(rows) => Ok(rows),
            GenericResponseBody::Error(message) => Err(ClientError::Server(
                crate::error::ServerError::new(header.code, message),
            )),
        }
    }

    /// Run `attempt` once; if it fails with `ER_WRONG_SCHEMA_VERSION`,
    /// invalidate the cache and run it exactly one more time. The second
    /// failure (of any kind) is surfaced as-is — no unbounded retry loop
    /// (`spec.md` §4.3, §7).
    async fn retry<T, F, Fut>(&self, attempt: F) -> Result<T, ClientError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, ClientError>>,
    {
        match attempt().await {
            Err(ClientError::Server(err)) if err.is_wrong_schema_version() => {
                self.schema.invalidate().await;
                attempt().await
            }
            other => other,
        }
    }

    /// Resolve `space` to its descriptor, running discovery first if the
    /// cache is empty. Numeric spaces never need a descriptor: the caller
    /// is responsible for using numeric index ids and raw byte encoding.
    async fn resolve_space(
        &self,
        space: &Space,
    ) -> Result<Option<Arc<SpaceDescriptor>>, ClientError> {
        match space {
            Space::Numbered(_) => Ok(None),
            Space::Named(name) => {
                if !self.schema.is_populated().await {
                    self.schema.discover(&self.connection).await?;
                }
                let descriptor = self.schema.lookup(space).await.ok_or_else(|| {
                    ClientError::Schema(format!("no such space: {}", name))
                })?;
                Ok(Some(Arc::new(descriptor)))
            }
        }
    }

    fn space_id(
        &self,
        space: &Space,
        descriptor: Option<&SpaceDescriptor>,
    ) -> Result<u32, ClientError> {
        match (space, descriptor) {
            (Space::Numbered(id), _) => Ok(*id),
            (Space::Named(_), Some(descriptor)) => Ok(descriptor.id),
            (Space::Named(name), None) => {
                Err(ClientError::Schema(format!("no such space: {}", name)))
            }
        }
    }

    fn index_id(
        &self,
        index: &Space,
        descriptor: Option<&SpaceDescriptor>,
    ) -> Result<u32, ClientError> {
        match (index, descriptor) {
            (Space::Numbered(id), _) => Ok(*id),
            (Space::Named(name), Some(descriptor)) => {
                descriptor.resolve_index(index).ok_or_else(|| {
                    ClientError::Schema(format!("no such index: {}", name))
                })
            }
            (Space::Named(name), None) => Err(ClientError::Schema(format!(
                "index {} requires a named space with a known descriptor",
                name
            ))),
        }
    }
}

fn encode_tuple(values: &[Value]) -> WireTuple {
    values.iter().map(Value::pack).collect()
}

fn decode_tuples(
    code: u32,
    body: ResponseBody,
    descriptor: Option<Arc<SpaceDescriptor>>,
) -> Result<TupleSet, ClientError> {
    match body {
        ResponseBody::Data(rows) => {
            let mut tuples = Vec::with_capacity(rows.len());
            for row in rows {
                tuples.push(decode_tuple(row, descriptor.as_ref())?);
            }
            Ok(TupleSet::new(tuples))
        }
        ResponseBody::Error(message) => Err(ClientError::Server(
            crate::error::ServerError::new(code, message),
        )),
    }
}

fn decode_tuple(
    row: WireTuple,
    descriptor: Option<&Arc<SpaceDescriptor>>,
) -> Result<Tuple, ClientError> {
    let mut fields = Vec::with_capacity(row.len());
    for (position, field) in row.into_iter().enumerate() {
        let field_type = descriptor
            .map(|d| d.field_type(position))
            .unwrap_or(FieldType::Str);
        fields.push(Value::unpack(field_type, &field)?);
    }
    Ok(Tuple::new(fields, descriptor.cloned()))
}

fn encode_ops(
    descriptor: Option<&SpaceDescriptor>,
    ops: &[UpdateOp],
) -> Result<Vec<EncodedOp>, ClientError> {
    ops.iter().map(|op| encode_op(descriptor, op)).collect()
}

fn encode_op(descriptor: Option<&SpaceDescriptor>, op: &UpdateOp) -> Result<EncodedOp, ClientError> {
    let field = resolve_field(descriptor, op.field())?;
    let code = op.opcode();
    let args = match op {
        UpdateOp::Set { value, .. } | UpdateOp::ListInsert { value, .. } => {
            vec![OpArg::Bytes(value.pack())]
        }
        UpdateOp::Splice {
            offset,
            count,
            insert,
            ..
        } => vec![
            OpArg::Int(*offset),
            OpArg::Int(*count),
            OpArg::Bytes(insert.clone()),
        ],
        UpdateOp::Bitwise { mask, .. } => vec![OpArg::Int(*mask as i64)],
        UpdateOp::ListDelete { .. } => vec![],
        UpdateOp::Arith { value, .. } => vec![OpArg::Int(*value)],
    };
    Ok(EncodedOp { code, field, args })
}

fn resolve_field(
    descriptor: Option<&SpaceDescriptor>,
    field: &FieldRef,
) -> Result<u32, ClientError> {
    match (field, descriptor) {
        (FieldRef::Position(p), _) => Ok(*p),
        (FieldRef::Name(name), Some(descriptor)) => {
            descriptor.field_position(field).ok_or_else(|| {
                ClientError::Schema(format!("no such field: {}", name))
            })
        }
        (FieldRef::Name(name), None) => Err(ClientError::Schema(format!(
            "field {} requires a named space with a known descriptor",
            name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::BitwiseOp;

    // `spec.md` §8 scenario 4: seven chained ops on a fresh tuple
    // `("abcdef", 0, "", "")` end up `("abeftail", 123, "third", "fourth")`.
    // The numeric end state depends on a real server, so this pins down the
    // one thing that's ours to get right: the wire-encoded op sequence.
    #[test]
    fn scenario_4_splice_and_insert_chain_encodes_literally() {
        let ops = vec![
            UpdateOp::Set {
                field: FieldRef::Position(1),
                value: Value::from("abcdef"),
            },
            UpdateOp::Splice {
                field: FieldRef::Position(1),
                offset: 2,
                count: 2,
                insert: vec![],
            },
            UpdateOp::Splice {
                field: FieldRef::Position(1),
                offset: 100,
                count: 1,
                insert: b"tail".to_vec(),
            },
            UpdateOp::ListDelete {
                field: FieldRef::Position(2),
            },
            UpdateOp::ListInsert {
                field: FieldRef::Position(2),
                value: Value::U32(123),
            },
            UpdateOp::ListInsert {
                field: FieldRef::Position(3),
                value: Value::from("third"),
            },
            UpdateOp::ListInsert {
                field: FieldRef::Position(4),
                value: Value::from("fourth"),
            },
        ];

        let encoded = encode_ops(None, &ops).expect("numeric field refs never need a descriptor");
        assert_eq!(encoded.len(), 7);

        assert_eq!(encoded[0].code, '=');
        assert_eq!(encoded[0].field, 1);
        match &encoded[0].args[..] {
            [OpArg::Bytes(b)] => assert_eq!(b, b"abcdef"),
            other => panic!("unexpected args {:?}", other),
        }

        assert_eq!(encoded[1].code, ':');
        assert_eq!(encoded[1].field, 1);
        match &encoded[1].args[..] {
            [OpArg::Int(offset), OpArg::Int(count), OpArg::Bytes(insert)] => {
                assert_eq!(*offset, 2);
                assert_eq!(*count, 2);
                assert!(insert.is_empty());
            }
            other => panic!("unexpected args {:?}", other),
        }

        assert_eq!(encoded[2].code, ':');
        assert_eq!(encoded[2].field, 1);
        match &encoded[2].args[..] {
            [OpArg::Int(offset), OpArg::Int(count), OpArg::Bytes(insert)] => {
                assert_eq!(*offset, 100);
                assert_eq!(*count, 1);
                assert_eq!(insert, b"tail");
            }
            other => panic!("unexpected args {:?}", other),
        }

        assert_eq!(encoded[3].code, '#');
        assert_eq!(encoded[3].field, 2);
        assert!(encoded[3].args.is_empty());

        assert_eq!(encoded[4].code, '!');
        assert_eq!(encoded[4].field, 2);
        match &encoded[4].args[..] {
            [OpArg::Bytes(b)] => assert_eq!(b, &123u32.to_le_bytes()),
            other => panic!("unexpected args {:?}", other),
        }

        assert_eq!(encoded[5].code, '!');
        assert_eq!(encoded[5].field, 3);
        match &encoded[5].args[..] {
            [OpArg::Bytes(b)] => assert_eq!(b, b"third"),
            other => panic!("unexpected args {:?}", other),
        }

        assert_eq!(encoded[6].code, '!');
        assert_eq!(encoded[6].field, 4);
        match &encoded[6].args[..] {
            [OpArg::Bytes(b)] => assert_eq!(b, b"fourth"),
            other => panic!("unexpected args {:?}", other),
        }
    }

    // `spec.md` §8 scenario 5: on a field holding `4567`, `|23` then `&345`
    // must land on `(4567 | 23) & 345`.
    #[test]
    fn scenario_5_bitwise_chain_matches_literal_result() {
        let ops = vec![
            UpdateOp::Bitwise {
                op: BitwiseOp::Or,
                field: FieldRef::Position(2),
                mask: 23,
            },
            UpdateOp::Bitwise {
                op: BitwiseOp::And,
                field: FieldRef::Position(2),
                mask: 345,
            },
        ];

        let encoded = encode_ops(None, &ops).expect("numeric field refs never need a descriptor");
        assert_eq!(encoded.len(), 2);

        assert_eq!(encoded[0].code, '|');
        assert_eq!(encoded[0].field, 2);
        match &encoded[0].args[..] {
            [OpArg::Int(mask)] => assert_eq!(*mask, 23),
            other => panic!("unexpected args {:?}", other),
        }

        assert_eq!(encoded[1].code, '&');
        assert_eq!(encoded[1].field, 2);
        match &encoded[1].args[..] {
            [OpArg::Int(mask)] => assert_eq!(*mask, 345),
            other => panic!("unexpected args {:?}", other),
        }

        let initial: u64 = 4567;
        assert_eq!((initial | 23) & 345, 345);
    }
}
