use std::io;

use bytes::{Buf, BufMut};

use super::{TypeId, COLUMN_MAGIC_NUM};

/// One column of a table schema.
///
/// Wire format:
/// `magic:u32 | name_len:u32 | name | type:u32 | len:u32 | table_ind:u32 |
/// nullable:u8 | unique:u8`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    name: String,
    type_id: TypeId,
    /// Byte length of the value: declared length for char, 4 for int/float.
    len: u32,
    /// Position of the column inside its table schema.
    table_ind: u32,
    nullable: bool,
    unique: bool,
}

impl Column {
    /// A fixed-width column (int or float); the length is implied.
    pub fn new(
        name: impl Into<String>,
        type_id: TypeId,
        table_ind: u32,
        nullable: bool,
        unique: bool,
    ) -> Column {
        assert!(
            type_id != TypeId::Char,
            "char columns carry an explicit length"
        );
        Column {
            name: name.into(),
            type_id,
            len: 4,
            table_ind,
            nullable,
            unique,
        }
    }

    /// A char column with its declared byte length.
    pub fn new_char(
        name: impl Into<String>,
        len: u32,
        table_ind: u32,
        nullable: bool,
        unique: bool,
    ) -> Column {
        Column {
            name: name.into(),
            type_id: TypeId::Char,
            len,
            table_ind,
            nullable,
            unique,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn table_ind(&self) -> u32 {
        self.table_ind
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// Re-homes the column at a new schema position (used by projections).
    pub(crate) fn with_table_ind(&self, table_ind: u32) -> Column {
        let mut column = self.clone();
        column.table_ind = table_ind;
        column
    }

    pub fn serialized_size(&self) -> usize {
        4 + 4 + self.name.len() + 4 + 4 + 4 + 1 + 1
    }

    pub fn serialize_to(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(COLUMN_MAGIC_NUM);
        buf.put_u32_le(self.name.len() as u32);
        buf.put_slice(self.name.as_bytes());
        buf.put_u32_le(self.type_id as u32);
        buf.put_u32_le(self.len);
        buf.put_u32_le(self.table_ind);
        buf.put_u8(self.nullable as u8);
        buf.put_u8(self.unique as u8);
    }

    pub fn deserialize_from(buf: &mut impl Buf) -> io::Result<Column> {
        let magic = buf.get_u32_le();
        if magic != COLUMN_MAGIC_NUM {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad column magic number {magic:#010x}"),
            ));
        }
        let name_len = buf.get_u32_le() as usize;
        let mut raw_name = vec![0u8; name_len];
        buf.copy_to_slice(&mut raw_name);
        let name = String::from_utf8_lossy(&raw_name).into_owned();
        let type_id = TypeId::from_u32(buf.get_u32_le()).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "unknown column type id")
        })?;
        let len = buf.get_u32_le();
        let table_ind = buf.get_u32_le();
        let nullable = buf.get_u8() != 0;
        let unique = buf.get_u8() != 0;
        Ok(Column {
            name,
            type_id,
            len,
            table_ind,
            nullable,
            unique,
        })
    }
}
