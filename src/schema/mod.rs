//! The schema cache: lazily-discovered space/index metadata, name↔id
//! resolution, and the coding services built on top of it.

pub mod value;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::defaults;
use crate::error::ClientError;
use crate::ops::{FieldRef, Space};
use crate::transport::connection::Connection;
use crate::wire::{Iterator, WireTuple};

pub use value::{FieldType, Value};

/// One field of a space's declared format.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: FieldType,
}

/// An index field reference, rewritten from the server's numeric position
/// to a name when the position falls within the space's declared format.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexField {
    Name(String),
    Position(u32),
}

/// One index of a space.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDescriptor {
    pub id: u32,
    pub name: String,
    pub fields: Vec<IndexField>,
}

/// Everything known about one space: its numeric id, its declared field
/// format, and its indexes.
#[derive(Debug, Clone, PartialEq)]
pub struct SpaceDescriptor {
    pub id: u32,
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
    pub default_field_type: FieldType,
    pub indexes_by_id: HashMap<u32, IndexDescriptor>,
    pub indexes_by_name: HashMap<String, u32>,
}

impl SpaceDescriptor {
    pub fn field_type(&self, position: usize) -> FieldType {
        self.fields
            .get(position)
            .map(|f| f.field_type)
            .unwrap_or(self.default_field_type)
    }

    /// Resolve a field name to its declared position.
    pub fn field_position(&self, field: &FieldRef) -> Option<u32> {
        match field {
            FieldRef::Position(p) => Some(*p),
            FieldRef::Name(name) => self
                .fields
                .iter()
                .position(|f| &f.name == name)
                .map(|p| p as u32),
        }
    }

    pub fn resolve_index(&self, index: &Space) -> Option<u32> {
        match index {
            Space::Numbered(id) => Some(*id),
            Space::Named(name) => self.indexes_by_name.get(name).copied(),
        }
    }
}

/// The name/id maps making up one consistent view of server schema.
#[derive(Debug, Clone, Default)]
pub struct SpacesSnapshot {
    by_name: HashMap<String, SpaceDescriptor>,
    by_id: HashMap<u32, String>,
}

impl SpacesSnapshot {
    pub fn empty() -> Self {
        SpacesSnapshot::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn get(&self, space: &Space) -> Option<&SpaceDescriptor> {
        match space {
            Space::Named(name) => self.by_name.get(name),
            Space::Numbered(id) => self
                .by_id
                .get(id)
                .and_then(|name| self.by_name.get(name)),
        }
    }

    fn insert(&mut self, descriptor: SpaceDescriptor) {
        self.by_id.insert(descriptor.id, descriptor.name.clone());
        self.by_name.insert(descriptor.name.clone(), descriptor);
    }
}

#[derive(Debug, Default)]
struct SchemaState {
    spaces: SpacesSnapshot,
    schema_id: Option<u64>,
}

/// `Arc<RwLock<SchemaState>>` shared between a `Client` handle and any of
/// its clones. Discovery and invalidation take the write lock; ordinary
/// lookups take the read lock and clone out the descriptor they need.
#[derive(Debug, Clone)]
pub struct SchemaCache(Arc<RwLock<SchemaState>>);

impl SchemaCache {
    pub fn new() -> Self {
        SchemaCache(Arc::new(RwLock::new(SchemaState::default())))
    }

    pub fn with_snapshot(spaces: SpacesSnapshot) -> Self {
        SchemaCache(Arc::new(RwLock::new(SchemaState {
            spaces,
            schema_id: None,
        })))
    }

    pub async fn schema_id(&self) -> Option<u64> {
        self.0.read().await.schema_id
    }

    pub async fn is_populated(&self) -> bool {
        !self.0.read().await.spaces.is_empty()
    }

    pub async fn lookup(&self, space: &Space) -> Option<SpaceDescriptor> {
        self.0.read().await.spaces.get(space).cloned()
    }

    /// Invalidate the cache: the next operation needing a named lookup will
    /// re-run discovery before proceeding. The single trigger, per the
    /// retry-on-stale-schema design, is a reply named `ER_WRONG_SCHEMA_VERSION`.
    pub async fn invalidate(&self) {
        let mut state = self.0.write().await;
        state.spaces = SpacesSnapshot::empty();
        state.schema_id = None;
    }

    /// Run the discovery protocol against `connection` and install the
    /// result: two selects against the metadata spaces, merged into
    /// descriptors, followed by a ping to harvest the current `schema_id`.
    #[instrument(skip(self, connection))]
    pub async fn discover(&self, connection: &Connection) -> Result<(), ClientError> {
        let space_rows = select_all_rows(connection, defaults::VSPACE_ID).await?;
        let index_rows = select_all_rows(connection, defaults::VINDEX_ID).await?;

        let mut spaces = SpacesSnapshot::empty();
        for row in &space_rows {
            if let Some(descriptor) = space_descriptor_from_row(row) {
                spaces.insert(descriptor);
            }
        }

        for row in &index_rows {
            apply_index_row(&mut spaces, row);
        }

        drop_empty_spaces(&mut spaces);

        let schema_id = connection.ping().await?.schema_id;

        let mut state = self.0.write().await;
        state.spaces = spaces;
        state.schema_id = schema_id;
        debug!(space_count = state.spaces.by_name.len(), "schema discovered");
        Ok(())
    }
}

impl Default for SchemaCache {
    fn default() -> Self {
        SchemaCache::new()
    }
}

async fn select_all_rows(
    connection: &Connection,
    meta_space_id: u32,
) -> Result<Vec<rmpv::Value>, ClientError> {
    connection
        .select_generic(
            meta_space_id,
            0,
            u32::MAX,
            0,
            Iterator::All,
            WireTuple::new(),
        )
        .await
}

fn row_field(row: &rmpv::Value, index: usize) -> Option<&rmpv::Value> {
    row.as_array().and_then(|fields| fields.get(index))
}

fn map_get<'v>(value: &'v rmpv::Value, key: &str) -> Option<&'v rmpv::Value> {
    value
        .as_map()?
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

fn space_descriptor_from_row(row: &rmpv::Value) -> Option<SpaceDescriptor> {
    let id = row_field(row, 0)?.as_u64()? as u32;
    let name = row_field(row, 2)?.as_str()?.to_owned();
    if name.starts_with('_') {
        return None;
    }

    let format = row_field(row, 6).and_then(|v| v.as_array()).cloned().unwrap_or_default();
    let fields = format
        .iter()
        .filter_map(|entry| {
            let name = map_get(entry, "name")?.as_str()?.to_owned();
            let field_type = map_get(entry, "type")
                .and_then(|v| v.as_str())
                .map(FieldType::from_wire_name)
                .unwrap_or_default();
            Some(FieldDescriptor { name, field_type })
        })
        .collect();

    Some(SpaceDescriptor {
        id,
        name,
        fields,
        default_field_type: FieldType::default(),
        indexes_by_id: HashMap::new(),
        indexes_by_name: HashMap::new(),
    })
}

fn apply_index_row(spaces: &mut SpacesSnapshot, row: &rmpv::Value) {
    let space_id = match row_field(row, 0).and_then(|v| v.as_u64()) {
        Some(id) => id as u32,
        None => return,
    };
    let index_id = match row_field(row, 1).and_then(|v| v.as_u64()) {
        Some(id) => id as u32,
        None => return,
    };
    let index_name = match row_field(row, 2).and_then(|v| v.as_str()) {
        Some(name) => name.to_owned(),
        None => return,
    };
    let parts = row_field(row, 5).and_then(|v| v.as_array()).cloned().unwrap_or_default();

    let space_name = match spaces.by_id.get(&space_id).cloned() {
        Some(name) => name,
        None => return,
    };
    let descriptor = spaces.by_name.get_mut(&space_name).expect("by_id/by_name agree");

    let mut needs_extension = Vec::new();
    let fields: Vec<IndexField> = parts
        .iter()
        .filter_map(|part| {
            let part = part.as_array()?;
            let position = part.get(0)?.as_u64()? as u32;
            let field_type = part
                .get(1)
                .and_then(|v| v.as_str())
                .map(FieldType::from_wire_name)
                .unwrap_or_default();
            if (position as usize) >= descriptor.fields.len() {
                needs_extension.push((position, field_type));
            }
            match descriptor.fields.get(position as usize) {
                Some(existing) => Some(IndexField::Name(existing.name.clone())),
                None => Some(IndexField::Position(position)),
            }
        })
        .collect();

    for (position, field_type) in needs_extension {
        while descriptor.fields.len() <= position as usize {
            descriptor.fields.push(FieldDescriptor {
                name: format!("field_{}", descriptor.fields.len()),
                field_type,
            });
        }
    }

    // Field positions may now resolve to names that did not exist on the
    // first pass; re-resolve before storing.
    let fields = fields
        .into_iter()
        .map(|field| match field {
            IndexField::Position(p) => descriptor
                .fields
                .get(p as usize)
                .map(|f| IndexField::Name(f.name.clone()))
                .unwrap_or(IndexField::Position(p)),
            named => named,
        })
        .collect();

    descriptor.indexes_by_id.insert(
        index_id,
        IndexDescriptor {
            id: index_id,
            name: index_name.clone(),
            fields,
        },
    );
    descriptor.indexes_by_name.insert(index_name, index_id);
}

fn drop_empty_spaces(spaces: &mut SpacesSnapshot) {
    let empty: Vec<String> = spaces
        .by_name
        .iter()
        .filter(|(_, d)| d.fields.is_empty() && d.indexes_by_id.is_empty())
        .map(|(name, _)| name.clone())
        .collect();
    for name in empty {
        if let Some(descriptor) = spaces.by_name.remove(&name) {
            spaces.by_id.remove(&descriptor.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> SpacesSnapshot {
        let mut spaces = SpacesSnapshot::empty();
        let mut indexes_by_id = HashMap::new();
        indexes_by_id.insert(
            0,
            IndexDescriptor {
                id: 0,
                name: "primary".into(),
                fields: vec![IndexField::Name("id".into())],
            },
        );
        let mut indexes_by_name = HashMap::new();
        indexes_by_name.insert("primary".into(), 0);
        spaces.insert(SpaceDescriptor {
            id: 512,
            name: "widgets".into(),
            fields: vec![
                FieldDescriptor {
                    name: "id".into(),
                    field_type: FieldType::Num,
                },
                FieldDescriptor {
                    name: "label".into(),
                    field_type: FieldType::Utf8Str,
                },
            ],
            default_field_type: FieldType::Str,
            indexes_by_id,
            indexes_by_name,
        });
        spaces
    }

    #[test]
    fn resolves_by_name_and_id() {
        let spaces = sample_snapshot();
        assert_eq!(
            spaces.get(&Space::Named("widgets".into())).unwrap().id,
            512
        );
        assert_eq!(
            spaces.get(&Space::Numbered(512)).unwrap().name,
            "widgets"
        );
        assert!(spaces.get(&Space::Named("missing".into())).is_none());
    }

    #[test]
    fn field_position_resolves_by_name() {
        let descriptor = sample_snapshot()
            .get(&Space::Numbered(512))
            .unwrap()
            .clone();
        assert_eq!(
            descriptor.field_position(&FieldRef::Name("label".into())),
            Some(1)
        );
        assert_eq!(
            descriptor.field_position(&FieldRef::Position(3)),
            Some(3)
        );
    }

    #[tokio::test]
    async fn cache_starts_empty_and_invalidate_clears_it() {
        let cache = SchemaCache::with_snapshot(sample_snapshot());
        assert!(cache.is_populated().await);
        cache.invalidate().await;
        assert!(!cache.is_populated().await);
        assert!(cache.schema_id().await.is_none());
    }
}
