//! Serialized composite keys and their ordering.
//!
//! Index nodes store keys as fixed-width byte strings so that node layout
//! is a dense array of equal pairs. The `KeyManager` owns the key schema,
//! fixes the key width (int/float: 4 bytes, char: the declared column
//! length, zero-padded) and encapsulates comparison; lookups and splits go
//! through it exclusively.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::record::{Field, Row, Schema, TypeId};

#[derive(Clone)]
pub struct KeyManager {
    key_schema: Arc<Schema>,
    key_size: usize,
}

impl KeyManager {
    pub fn new(key_schema: Arc<Schema>) -> KeyManager {
        let key_size = key_schema
            .columns()
            .iter()
            .map(|column| column.len() as usize)
            .sum();
        KeyManager {
            key_schema,
            key_size,
        }
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn key_schema(&self) -> &Arc<Schema> {
        &self.key_schema
    }

    /// Encodes a key row into its fixed-width byte string. Null fields
    /// encode as zeroes; char values are zero-padded (and truncated) to the
    /// declared column length.
    pub fn serialize_key(&self, key: &Row) -> Vec<u8> {
        debug_assert_eq!(key.field_count(), self.key_schema.column_count());
        let mut out = vec![0u8; self.key_size];
        let mut at = 0;
        for (field, column) in key.fields().iter().zip(self.key_schema.columns()) {
            let width = column.len() as usize;
            match field {
                Field::Int(Some(value)) => {
                    out[at..at + 4].copy_from_slice(&value.to_le_bytes());
                }
                Field::Float(Some(value)) => {
                    out[at..at + 4].copy_from_slice(&value.to_le_bytes());
                }
                Field::Char(Some(value)) => {
                    let raw = value.as_bytes();
                    let take = raw.len().min(width);
                    out[at..at + take].copy_from_slice(&raw[..take]);
                }
                _ => {}
            }
            at += width;
        }
        out
    }

    /// Decodes a serialized key back into a row (trailing zero padding is
    /// trimmed from char values).
    pub fn deserialize_key(&self, raw: &[u8]) -> Row {
        debug_assert_eq!(raw.len(), self.key_size);
        let mut fields = Vec::with_capacity(self.key_schema.column_count());
        let mut at = 0;
        for column in self.key_schema.columns() {
            let width = column.len() as usize;
            let chunk = &raw[at..at + width];
            let field = match column.type_id() {
                TypeId::Int => Field::from_int(i32::from_le_bytes(chunk.try_into().unwrap())),
                TypeId::Float => Field::from_float(f32::from_le_bytes(chunk.try_into().unwrap())),
                TypeId::Char => {
                    let end = chunk.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
                    Field::from_chars(String::from_utf8_lossy(&chunk[..end]).into_owned())
                }
            };
            fields.push(field);
            at += width;
        }
        Row::new(fields)
    }

    /// Column-wise three-way comparison of two serialized keys.
    pub fn compare(&self, left: &[u8], right: &[u8]) -> Ordering {
        debug_assert_eq!(left.len(), self.key_size);
        debug_assert_eq!(right.len(), self.key_size);
        let mut at = 0;
        for column in self.key_schema.columns() {
            let width = column.len() as usize;
            let a = &left[at..at + width];
            let b = &right[at..at + width];
            let ordering = match column.type_id() {
                TypeId::Int => {
                    let a = i32::from_le_bytes(a.try_into().unwrap());
                    let b = i32::from_le_bytes(b.try_into().unwrap());
                    a.cmp(&b)
                }
                TypeId::Float => {
                    let a = f32::from_le_bytes(a.try_into().unwrap());
                    let b = f32::from_le_bytes(b.try_into().unwrap());
                    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
                }
                TypeId::Char => a.cmp(b),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
            at += width;
        }
        Ordering::Equal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Column;

    fn int_char_manager() -> KeyManager {
        KeyManager::new(Arc::new(Schema::new(vec![
            Column::new("id", TypeId::Int, 0, false, false),
            Column::new_char("tag", 8, 1, false, false),
        ])))
    }

    #[test]
    fn key_width_is_fixed_by_the_schema() {
        let km = int_char_manager();
        assert_eq!(km.key_size(), 12);
        let key = km.serialize_key(&Row::new(vec![
            Field::from_int(5),
            Field::from_chars("ab"),
        ]));
        assert_eq!(key.len(), 12);
    }

    #[test]
    fn ordering_is_column_major() {
        let km = int_char_manager();
        let make = |id: i32, tag: &str| {
            km.serialize_key(&Row::new(vec![Field::from_int(id), Field::from_chars(tag)]))
        };
        assert_eq!(km.compare(&make(1, "z"), &make(2, "a")), Ordering::Less);
        assert_eq!(km.compare(&make(2, "a"), &make(2, "b")), Ordering::Less);
        assert_eq!(km.compare(&make(2, "b"), &make(2, "b")), Ordering::Equal);
        assert_eq!(km.compare(&make(-3, "b"), &make(2, "a")), Ordering::Less);
    }

    #[test]
    fn negative_ints_compare_numerically() {
        let km = KeyManager::new(Arc::new(Schema::new(vec![Column::new(
            "k",
            TypeId::Int,
            0,
            false,
            false,
        )])));
        let a = km.serialize_key(&Row::new(vec![Field::from_int(-10)]));
        let b = km.serialize_key(&Row::new(vec![Field::from_int(3)]));
        assert_eq!(km.compare(&a, &b), Ordering::Less);
    }

    #[test]
    fn keys_round_trip_through_deserialize() {
        let km = int_char_manager();
        let row = Row::new(vec![Field::from_int(42), Field::from_chars("tag")]);
        let raw = km.serialize_key(&row);
        let decoded = km.deserialize_key(&raw);
        assert_eq!(decoded.field(0).as_int(), Some(42));
        assert_eq!(decoded.field(1).as_chars(), Some("tag"));
    }
}
