use std::io;

use bytes::{Buf, BufMut};

use super::{Column, SCHEMA_MAGIC_NUM};

/// An ordered list of columns.
///
/// Wire format: `magic:u32 | count:u32 | columns… | is_manage:u8`. The
/// trailing byte is a column-ownership flag kept for format stability;
/// schemas always own their columns, so it is written as 1 and ignored on
/// read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Schema {
        Schema { columns }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, index: usize) -> &Column {
        &self.columns[index]
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Position of the named column, if it exists.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name() == name)
    }

    /// Builds a key schema from the columns at `attrs`, re-indexed to their
    /// new positions. `attrs(i)` maps key column `i` back to the table
    /// schema (e.g. table `(a, b, c, d)`, index `(d, a)` ⇒ `attrs = [3, 0]`).
    pub fn project(&self, attrs: &[usize]) -> Schema {
        let columns = attrs
            .iter()
            .enumerate()
            .map(|(new_ind, &old_ind)| self.columns[old_ind].with_table_ind(new_ind as u32))
            .collect();
        Schema { columns }
    }

    pub fn serialized_size(&self) -> usize {
        4 + 4
            + self
                .columns
                .iter()
                .map(Column::serialized_size)
                .sum::<usize>()
            + 1
    }

    pub fn serialize_to(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(SCHEMA_MAGIC_NUM);
        buf.put_u32_le(self.columns.len() as u32);
        for column in &self.columns {
            column.serialize_to(buf);
        }
        buf.put_u8(1);
    }

    pub fn deserialize_from(buf: &mut impl Buf) -> io::Result<Schema> {
        let magic = buf.get_u32_le();
        if magic != SCHEMA_MAGIC_NUM {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad schema magic number {magic:#010x}"),
            ));
        }
        let count = buf.get_u32_le() as usize;
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            columns.push(Column::deserialize_from(buf)?);
        }
        let _is_manage = buf.get_u8();
        Ok(Schema { columns })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::TypeId;

    fn sample_schema() -> Schema {
        Schema::new(vec![
            Column::new("id", TypeId::Int, 0, false, true),
            Column::new("score", TypeId::Float, 1, true, false),
            Column::new_char("name", 16, 2, true, false),
        ])
    }

    #[test]
    fn schema_round_trip() {
        let schema = sample_schema();
        let mut buf = Vec::new();
        schema.serialize_to(&mut buf);
        assert_eq!(buf.len(), schema.serialized_size());
        let decoded = Schema::deserialize_from(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, schema);
    }

    #[test]
    fn column_index_resolves_by_name() {
        let schema = sample_schema();
        assert_eq!(schema.column_index("name"), Some(2));
        assert_eq!(schema.column_index("missing"), None);
    }

    #[test]
    fn projection_reindexes_columns() {
        let schema = sample_schema();
        let key_schema = schema.project(&[2, 0]);
        assert_eq!(key_schema.column_count(), 2);
        assert_eq!(key_schema.column(0).name(), "name");
        assert_eq!(key_schema.column(0).table_ind(), 0);
        assert_eq!(key_schema.column(1).name(), "id");
        assert_eq!(key_schema.column(1).table_ind(), 1);
    }

    #[test]
    fn corrupt_magic_is_rejected() {
        let schema = sample_schema();
        let mut buf = Vec::new();
        schema.serialize_to(&mut buf);
        buf[2] ^= 0x40;
        assert!(Schema::deserialize_from(&mut buf.as_slice()).is_err());
    }
}
