//! The tuple-level type system: three value types (int, float, char) and the
//! fields that carry them.

use std::cmp::Ordering;

use bytes::{Buf, BufMut};

/// The closed set of column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TypeId {
    Int = 1,
    Float = 2,
    Char = 3,
}

impl TypeId {
    pub fn from_u32(raw: u32) -> Option<TypeId> {
        match raw {
            1 => Some(TypeId::Int),
            2 => Some(TypeId::Float),
            3 => Some(TypeId::Char),
            _ => None,
        }
    }
}

/// One value slot of a row. A `None` payload is SQL NULL; a null field
/// contributes zero serialized bytes (its nullness lives in the row's
/// bitmap).
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Int(Option<i32>),
    Float(Option<f32>),
    Char(Option<String>),
}

impl Field {
    pub fn null(type_id: TypeId) -> Field {
        match type_id {
            TypeId::Int => Field::Int(None),
            TypeId::Float => Field::Float(None),
            TypeId::Char => Field::Char(None),
        }
    }

    pub fn from_int(value: i32) -> Field {
        Field::Int(Some(value))
    }

    pub fn from_float(value: f32) -> Field {
        Field::Float(Some(value))
    }

    pub fn from_chars(value: impl Into<String>) -> Field {
        Field::Char(Some(value.into()))
    }

    pub fn type_id(&self) -> TypeId {
        match self {
            Field::Int(_) => TypeId::Int,
            Field::Float(_) => TypeId::Float,
            Field::Char(_) => TypeId::Char,
        }
    }

    pub fn is_null(&self) -> bool {
        match self {
            Field::Int(value) => value.is_none(),
            Field::Float(value) => value.is_none(),
            Field::Char(value) => value.is_none(),
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Field::Int(value) => *value,
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            Field::Float(value) => *value,
            _ => None,
        }
    }

    pub fn as_chars(&self) -> Option<&str> {
        match self {
            Field::Char(value) => value.as_deref(),
            _ => None,
        }
    }

    /// Bytes this field contributes to a serialized row.
    pub fn serialized_size(&self) -> usize {
        match self {
            Field::Int(Some(_)) | Field::Float(Some(_)) => 4,
            Field::Char(Some(value)) => 4 + value.len(),
            _ => 0,
        }
    }

    /// Appends the field payload; null fields write nothing.
    pub fn serialize_to(&self, buf: &mut impl BufMut) {
        match self {
            Field::Int(Some(value)) => buf.put_i32_le(*value),
            Field::Float(Some(value)) => buf.put_f32_le(*value),
            Field::Char(Some(value)) => {
                buf.put_u32_le(value.len() as u32);
                buf.put_slice(value.as_bytes());
            }
            _ => {}
        }
    }

    /// Reads one field of the given type; `is_null` comes from the row's
    /// null bitmap.
    pub fn deserialize_from(buf: &mut impl Buf, type_id: TypeId, is_null: bool) -> Field {
        if is_null {
            return Field::null(type_id);
        }
        match type_id {
            TypeId::Int => Field::Int(Some(buf.get_i32_le())),
            TypeId::Float => Field::Float(Some(buf.get_f32_le())),
            TypeId::Char => {
                let len = buf.get_u32_le() as usize;
                let mut raw = vec![0u8; len];
                buf.copy_to_slice(&mut raw);
                Field::Char(Some(String::from_utf8_lossy(&raw).into_owned()))
            }
        }
    }

    /// Three-way comparison between same-typed fields; `None` when either
    /// side is NULL, mirroring SQL comparison semantics.
    pub fn compare(&self, other: &Field) -> Option<Ordering> {
        debug_assert_eq!(self.type_id(), other.type_id(), "fields are not comparable");
        match (self, other) {
            (Field::Int(Some(a)), Field::Int(Some(b))) => Some(a.cmp(b)),
            (Field::Float(Some(a)), Field::Float(Some(b))) => {
                Some(a.partial_cmp(b).unwrap_or(Ordering::Equal))
            }
            (Field::Char(Some(a)), Field::Char(Some(b))) => Some(a.as_bytes().cmp(b.as_bytes())),
            _ => None,
        }
    }
}
