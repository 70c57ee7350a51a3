//! The decoded result of a request: a sequence of tuples, each exposing
//! positional and (when a space descriptor is known) named field access.

use std::sync::Arc;

use crate::schema::value::Value;
use crate::schema::SpaceDescriptor;

/// One decoded tuple: an ordered sequence of [`Value`]s, with an optional
/// descriptor for resolving field names.
#[derive(Debug, Clone)]
pub struct Tuple {
    fields: Vec<Value>,
    descriptor: Option<Arc<SpaceDescriptor>>,
}

impl Tuple {
    pub(crate) fn new(fields: Vec<Value>, descriptor: Option<Arc<SpaceDescriptor>>) -> Self {
        Tuple { fields, descriptor }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field access by position.
    pub fn get(&self, position: usize) -> Option<&Value> {
        self.fields.get(position)
    }

    /// Field access by name, when a space descriptor was available at
    /// decode time.
    pub fn field(&self, name: &str) -> Option<&Value> {
        let descriptor = self.descriptor.as_ref()?;
        let position = descriptor.fields.iter().position(|f| f.name == name)?;
        self.fields.get(position)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.fields.iter()
    }
}

impl std::ops::Index<usize> for Tuple {
    type Output = Value;

    fn index(&self, position: usize) -> &Value {
        &self.fields[position]
    }
}

impl<'a> IntoIterator for &'a Tuple {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

/// The full result of an operation returning zero or more tuples, in the
/// order the server returned them.
#[derive(Debug, Clone, Default)]
pub struct TupleSet {
    tuples: Vec<Tuple>,
}

impl TupleSet {
    pub(crate) fn new(tuples: Vec<Tuple>) -> Self {
        TupleSet { tuples }
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    pub fn first(&self) -> Option<&Tuple> {
        self.tuples.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tuple> {
        self.tuples.iter()
    }
}

impl IntoIterator for TupleSet {
    type Item = Tuple;
    type IntoIter = std::vec::IntoIter<Tuple>;

    fn into_iter(self) -> Self::IntoIter {
        self.tuples.into_iter()
    }
}

impl<'a> IntoIterator for &'a TupleSet {
    type Item = &'a Tuple;
    type IntoIter = std::slice::Iter<'a, Tuple>;

    fn into_iter(self) -> Self::IntoIter {
        self.tuples.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDescriptor;
    use crate::schema::FieldType;
    use std::collections::HashMap;

    fn descriptor() -> Arc<SpaceDescriptor> {
        Arc::new(SpaceDescriptor {
            id: 0,
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
            indexes_by_id: HashMap::new(),
            indexes_by_name: HashMap::new(),
        })
    }

    #[test]
    fn positional_and_named_access_agree() {
        let tuple = Tuple::new(
            vec![Value::U32(1), Value::Str("abc".into())],
            Some(descriptor()),
        );
        assert_eq!(tuple.get(1), tuple.field("label"));
        assert_eq!(tuple.field("label").unwrap().as_str(), Some("abc"));
    }

    #[test]
    fn raw_tuple_has_no_named_access() {
        let tuple = Tuple::new(vec![Value::U32(1)], None);
        assert!(tuple.field("id").is_none());
        assert_eq!(tuple.get(0), Some(&Value::U32(1)));
    }

    #[test]
    fn tuple_set_iterates_in_order() {
        let set = TupleSet::new(vec![
            Tuple::new(vec![Value::U32(1)], None),
            Tuple::new(vec![Value::U32(2)], None),
        ]);
        let ids: Vec<u32> = set.iter().map(|t| t.get(0).unwrap().as_u32().unwrap()).collect();
        assert_eq!(ids, vec![1, 2]);
    }
}
