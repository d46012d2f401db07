use std::io;

use bytes::{Buf, BufMut};

use super::{Field, Schema};
use crate::{RowId, INVALID_ROWID};

/// An ordered list of fields plus the physical address the row occupies
/// once stored.
///
/// Wire format: `field_count:u32 | null_bitmap | field_1 | field_2 | …`.
/// The bitmap holds ⌈field_count/8⌉ bytes, bit i (MSB-first) set iff field
/// i is null; null fields contribute no payload bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    fields: Vec<Field>,
    rid: RowId,
}

impl Row {
    pub fn new(fields: Vec<Field>) -> Row {
        Row {
            fields,
            rid: INVALID_ROWID,
        }
    }

    /// An empty row addressed by `rid`, to be filled by a heap read.
    pub fn with_rid(rid: RowId) -> Row {
        Row {
            fields: Vec::new(),
            rid,
        }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> &Field {
        &self.fields[index]
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn rid(&self) -> RowId {
        self.rid
    }

    pub fn set_rid(&mut self, rid: RowId) {
        self.rid = rid;
    }

    /// Projects the key fields for an index, in key-schema order.
    /// `key_map(i)` is the table-schema position of key column `i`.
    pub fn key_from_row(&self, key_map: &[usize]) -> Row {
        Row::new(key_map.iter().map(|&i| self.fields[i].clone()).collect())
    }

    pub fn serialized_size(&self, schema: &Schema) -> usize {
        debug_assert_eq!(
            schema.column_count(),
            self.fields.len(),
            "fields do not match schema"
        );
        let bitmap_bytes = self.fields.len().div_ceil(8);
        4 + bitmap_bytes
            + self
                .fields
                .iter()
                .map(Field::serialized_size)
                .sum::<usize>()
    }

    pub fn serialize_to(&self, buf: &mut impl BufMut, schema: &Schema) {
        debug_assert_eq!(
            schema.column_count(),
            self.fields.len(),
            "fields do not match schema"
        );
        buf.put_u32_le(self.fields.len() as u32);
        let mut bitmap = vec![0u8; self.fields.len().div_ceil(8)];
        for (i, field) in self.fields.iter().enumerate() {
            if field.is_null() {
                bitmap[i / 8] |= 1 << (7 - i % 8);
            }
        }
        buf.put_slice(&bitmap);
        for field in &self.fields {
            field.serialize_to(buf);
        }
    }

    pub fn deserialize_from(buf: &mut impl Buf, schema: &Schema) -> io::Result<Row> {
        let field_count = buf.get_u32_le() as usize;
        if field_count != schema.column_count() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "row has {field_count} fields but the schema declares {}",
                    schema.column_count()
                ),
            ));
        }
        let mut bitmap = vec![0u8; field_count.div_ceil(8)];
        buf.copy_to_slice(&mut bitmap);
        let mut fields = Vec::with_capacity(field_count);
        for i in 0..field_count {
            let is_null = bitmap[i / 8] & (1 << (7 - i % 8)) != 0;
            fields.push(Field::deserialize_from(
                buf,
                schema.column(i).type_id(),
                is_null,
            ));
        }
        Ok(Row::new(fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Column, TypeId};

    fn sample_schema() -> Schema {
        Schema::new(vec![
            Column::new("id", TypeId::Int, 0, false, true),
            Column::new("score", TypeId::Float, 1, true, false),
            Column::new_char("name", 16, 2, true, false),
        ])
    }

    #[test]
    fn row_round_trip() {
        let schema = sample_schema();
        let row = Row::new(vec![
            Field::from_int(12),
            Field::from_float(3.5),
            Field::from_chars("alice"),
        ]);
        let mut buf = Vec::new();
        row.serialize_to(&mut buf, &schema);
        assert_eq!(buf.len(), row.serialized_size(&schema));
        let decoded = Row::deserialize_from(&mut buf.as_slice(), &schema).unwrap();
        assert_eq!(decoded.fields(), row.fields());
    }

    #[test]
    fn null_fields_round_trip_through_the_bitmap() {
        let schema = sample_schema();
        let row = Row::new(vec![
            Field::from_int(1),
            Field::Float(None),
            Field::Char(None),
        ]);
        let mut buf = Vec::new();
        row.serialize_to(&mut buf, &schema);
        // count + 1 bitmap byte + one non-null int
        assert_eq!(buf.len(), 4 + 1 + 4);
        assert_eq!(buf[4], 0b0110_0000);
        let decoded = Row::deserialize_from(&mut buf.as_slice(), &schema).unwrap();
        assert!(decoded.field(1).is_null());
        assert!(decoded.field(2).is_null());
        assert_eq!(decoded.field(0).as_int(), Some(1));
    }

    #[test]
    fn field_count_mismatch_is_rejected() {
        let schema = sample_schema();
        let mut buf = Vec::new();
        buf.put_u32_le(2);
        buf.put_u8(0);
        assert!(Row::deserialize_from(&mut buf.as_slice(), &schema).is_err());
    }

    #[test]
    fn key_projection_selects_fields_in_key_order() {
        let row = Row::new(vec![
            Field::from_int(7),
            Field::from_float(1.25),
            Field::from_chars("bob"),
        ]);
        let key = row.key_from_row(&[2, 0]);
        assert_eq!(key.field(0).as_chars(), Some("bob"));
        assert_eq!(key.field(1).as_int(), Some(7));
    }
}
