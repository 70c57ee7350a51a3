//! The request-surface vocabulary: space/field/index references, update
//! operations, and select options.

use crate::schema::value::Value;
use crate::wire::Iterator;

/// A space or index reference: a name, resolved through the schema cache,
/// or a numeric id used as-is. The only public entry point — no implicit
/// coercion from "strings that look like numbers".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Space {
    Named(String),
    Numbered(u32),
}

impl Space {
    pub fn name(name: impl Into<String>) -> Self {
        Space::Named(name.into())
    }

    pub fn id(id: u32) -> Self {
        Space::Numbered(id)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Space::Numbered(_))
    }

    /// Accept a numeric-looking string as a numeric id, otherwise treat it
    /// as a name. Opt-in only — never used internally.
    pub fn parse_loose(value: impl Into<String>) -> Self {
        let value = value.into();
        match value.parse::<u32>() {
            Ok(id) => Space::Numbered(id),
            Err(_) => Space::Named(value),
        }
    }
}

impl From<&str> for Space {
    fn from(name: &str) -> Self {
        Space::Named(name.to_owned())
    }
}

impl From<String> for Space {
    fn from(name: String) -> Self {
        Space::Named(name)
    }
}

impl From<u32> for Space {
    fn from(id: u32) -> Self {
        Space::Numbered(id)
    }
}

/// A reference to one field of a space, either by declared name or by
/// numeric position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldRef {
    Name(String),
    Position(u32),
}

impl From<&str> for FieldRef {
    fn from(name: &str) -> Self {
        FieldRef::Name(name.to_owned())
    }
}

impl From<u32> for FieldRef {
    fn from(position: u32) -> Self {
        FieldRef::Position(position)
    }
}

/// An `update`/`upsert` operation on a single field, in the order the
/// server applies them.
#[derive(Debug, Clone)]
pub enum UpdateOp {
    Set {
        field: FieldRef,
        value: Value,
    },
    Splice {
        field: FieldRef,
        offset: i64,
        count: i64,
        insert: Vec<u8>,
    },
    Bitwise {
        op: BitwiseOp,
        field: FieldRef,
        mask: u64,
    },
    ListInsert {
        field: FieldRef,
        value: Value,
    },
    ListDelete {
        field: FieldRef,
    },
    Arith {
        op: ArithOp,
        field: FieldRef,
        value: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitwiseOp {
    And,
    Or,
    Xor,
}

impl BitwiseOp {
    pub(crate) fn code(self) -> char {
        match self {
            BitwiseOp::And => '&',
            BitwiseOp::Or => '|',
            BitwiseOp::Xor => '^',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
}

impl ArithOp {
    pub(crate) fn code(self) -> char {
        match self {
            ArithOp::Add => '+',
            ArithOp::Sub => '-',
        }
    }
}

impl UpdateOp {
    pub(crate) fn field(&self) -> &FieldRef {
        match self {
            UpdateOp::Set { field, .. }
            | UpdateOp::Splice { field, .. }
            | UpdateOp::Bitwise { field, .. }
            | UpdateOp::ListInsert { field, .. }
            | UpdateOp::ListDelete { field }
            | UpdateOp::Arith { field, .. } => field,
        }
    }

    pub(crate) fn opcode(&self) -> char {
        match self {
            UpdateOp::Set { .. } => '=',
            UpdateOp::Splice { .. } => ':',
            UpdateOp::Bitwise { op, .. } => op.code(),
            UpdateOp::ListInsert { .. } => '!',
            UpdateOp::ListDelete { .. } => '#',
            UpdateOp::Arith { op, .. } => op.code(),
        }
    }
}

/// Options accepted by `select`, beyond the key itself.
#[derive(Debug, Clone)]
pub struct SelectOptions {
    pub limit: u32,
    pub offset: u32,
    pub iterator: Iterator,
}

impl Default for SelectOptions {
    fn default() -> Self {
        SelectOptions {
            limit: u32::MAX,
            offset: 0,
            iterator: Iterator::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_loose_distinguishes_numeric_strings() {
        assert_eq!(Space::parse_loose("42"), Space::Numbered(42));
        assert_eq!(Space::parse_loose("spaces"), Space::Named("spaces".into()));
    }

    #[test]
    fn default_space_conversion_is_named() {
        let space: Space = "widgets".into();
        assert_eq!(space, Space::Named("widgets".into()));
    }

    #[test]
    fn update_op_opcodes_match_wire_table() {
        assert_eq!(
            UpdateOp::Set {
                field: FieldRef::Position(0),
                value: Value::U32(1)
            }
            .opcode(),
            '='
        );
        assert_eq!(
            UpdateOp::Bitwise {
                op: BitwiseOp::Or,
                field: FieldRef::Position(2),
                mask: 23
            }
            .opcode(),
            '|'
        );
        assert_eq!(
            UpdateOp::ListInsert {
                field: FieldRef::Position(2),
                value: Value::U32(123)
            }
            .opcode(),
            '!'
        );
    }
}
