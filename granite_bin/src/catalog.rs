//! The catalog: persistent table and index metadata plus the in-memory
//! dictionaries that mirror it.
//!
//! Logical page 0 holds the catalog meta record
//! (`magic | n_tables | n_indexes | (table_id, meta_page_id)… |
//! (index_id, meta_page_id)…`); every table and index owns one further
//! metadata page. The catalog exclusively owns the `TableInfo`/`IndexInfo`
//! objects it creates; callers receive borrowed views.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::Arc;

use bytes::{Buf, BufMut};

use strata::heap::TableHeap;
use strata::index::{BPlusTree, IndexId, KeyManager};
use strata::record::{Row, Schema};
use strata::txn::Txn;
use strata::{BufferPoolManager, PageId, RowId, CATALOG_META_PAGE_ID, PAGE_SIZE};

use crate::errors::DbError;

pub type TableId = u32;

pub const CATALOG_METADATA_MAGIC_NUM: u32 = 0x8984_9284;
pub const TABLE_METADATA_MAGIC_NUM: u32 = 0x344C_54A6;
pub const INDEX_METADATA_MAGIC_NUM: u32 = 0x3449_58B7;

/// The page-0 record: which metadata page each table and index lives on.
#[derive(Debug, Default)]
struct CatalogMeta {
    table_meta_pages: BTreeMap<TableId, PageId>,
    index_meta_pages: BTreeMap<IndexId, PageId>,
}

impl CatalogMeta {
    fn serialized_size(&self) -> usize {
        12 + 8 * (self.table_meta_pages.len() + self.index_meta_pages.len())
    }

    fn serialize_to(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(CATALOG_METADATA_MAGIC_NUM);
        buf.put_u32_le(self.table_meta_pages.len() as u32);
        buf.put_u32_le(self.index_meta_pages.len() as u32);
        for (&table_id, &page_id) in &self.table_meta_pages {
            buf.put_u32_le(table_id);
            buf.put_u32_le(page_id);
        }
        for (&index_id, &page_id) in &self.index_meta_pages {
            buf.put_u32_le(index_id);
            buf.put_u32_le(page_id);
        }
    }

    fn deserialize_from(buf: &mut impl Buf) -> io::Result<CatalogMeta> {
        let magic = buf.get_u32_le();
        if magic != CATALOG_METADATA_MAGIC_NUM {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad catalog meta magic number {magic:#010x}"),
            ));
        }
        let n_tables = buf.get_u32_le();
        let n_indexes = buf.get_u32_le();
        let mut meta = CatalogMeta::default();
        for _ in 0..n_tables {
            let table_id = buf.get_u32_le();
            let page_id = buf.get_u32_le();
            meta.table_meta_pages.insert(table_id, page_id);
        }
        for _ in 0..n_indexes {
            let index_id = buf.get_u32_le();
            let page_id = buf.get_u32_le();
            meta.index_meta_pages.insert(index_id, page_id);
        }
        Ok(meta)
    }

    fn next_table_id(&self) -> TableId {
        self.table_meta_pages
            .keys()
            .next_back()
            .map_or(0, |&id| id + 1)
    }

    fn next_index_id(&self) -> IndexId {
        self.index_meta_pages
            .keys()
            .next_back()
            .map_or(0, |&id| id + 1)
    }
}

fn put_string(buf: &mut impl BufMut, value: &str) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

fn get_string(buf: &mut impl Buf) -> String {
    let len = buf.get_u32_le() as usize;
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8_lossy(&raw).into_owned()
}

/// Persistent description of one table.
#[derive(Debug, Clone)]
pub struct TableMetadata {
    table_id: TableId,
    table_name: String,
    first_page_id: PageId,
    schema: Arc<Schema>,
}

impl TableMetadata {
    pub fn new(
        table_id: TableId,
        table_name: impl Into<String>,
        first_page_id: PageId,
        schema: Arc<Schema>,
    ) -> TableMetadata {
        TableMetadata {
            table_id,
            table_name: table_name.into(),
            first_page_id,
            schema,
        }
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn first_page_id(&self) -> PageId {
        self.first_page_id
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    fn serialize_to(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(TABLE_METADATA_MAGIC_NUM);
        buf.put_u32_le(self.table_id);
        put_string(buf, &self.table_name);
        buf.put_u32_le(self.first_page_id);
        self.schema.serialize_to(buf);
    }

    fn deserialize_from(buf: &mut impl Buf) -> io::Result<TableMetadata> {
        let magic = buf.get_u32_le();
        if magic != TABLE_METADATA_MAGIC_NUM {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad table metadata magic number {magic:#010x}"),
            ));
        }
        let table_id = buf.get_u32_le();
        let table_name = get_string(buf);
        let first_page_id = buf.get_u32_le();
        let schema = Arc::new(Schema::deserialize_from(buf)?);
        Ok(TableMetadata {
            table_id,
            table_name,
            first_page_id,
            schema,
        })
    }
}

/// Persistent description of one index.
#[derive(Debug, Clone)]
pub struct IndexMetadata {
    index_id: IndexId,
    index_name: String,
    table_id: TableId,
    /// Positions of the key columns inside the table schema, in key order.
    key_map: Vec<u32>,
}

impl IndexMetadata {
    pub fn new(
        index_id: IndexId,
        index_name: impl Into<String>,
        table_id: TableId,
        key_map: Vec<u32>,
    ) -> IndexMetadata {
        IndexMetadata {
            index_id,
            index_name: index_name.into(),
            table_id,
            key_map,
        }
    }

    pub fn index_id(&self) -> IndexId {
        self.index_id
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn key_map(&self) -> &[u32] {
        &self.key_map
    }

    fn serialize_to(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(INDEX_METADATA_MAGIC_NUM);
        buf.put_u32_le(self.index_id);
        put_string(buf, &self.index_name);
        buf.put_u32_le(self.table_id);
        buf.put_u32_le(self.key_map.len() as u32);
        for &column in &self.key_map {
            buf.put_u32_le(column);
        }
    }

    fn deserialize_from(buf: &mut impl Buf) -> io::Result<IndexMetadata> {
        let magic = buf.get_u32_le();
        if magic != INDEX_METADATA_MAGIC_NUM {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad index metadata magic number {magic:#010x}"),
            ));
        }
        let index_id = buf.get_u32_le();
        let index_name = get_string(buf);
        let table_id = buf.get_u32_le();
        let count = buf.get_u32_le() as usize;
        let mut key_map = Vec::with_capacity(count);
        for _ in 0..count {
            key_map.push(buf.get_u32_le());
        }
        Ok(IndexMetadata {
            index_id,
            index_name,
            table_id,
            key_map,
        })
    }
}

/// A live table: its metadata plus the heap storing its rows.
pub struct TableInfo {
    metadata: TableMetadata,
    heap: TableHeap,
}

impl TableInfo {
    pub fn table_id(&self) -> TableId {
        self.metadata.table_id()
    }

    pub fn table_name(&self) -> &str {
        self.metadata.table_name()
    }

    pub fn schema(&self) -> &Arc<Schema> {
        self.metadata.schema()
    }

    pub fn heap(&self) -> &TableHeap {
        &self.heap
    }

    pub fn metadata(&self) -> &TableMetadata {
        &self.metadata
    }
}

/// A live index: its metadata, the key schema view over the table schema,
/// and the B+ tree itself.
pub struct IndexInfo {
    metadata: IndexMetadata,
    key_schema: Arc<Schema>,
    tree: BPlusTree,
}

impl IndexInfo {
    pub fn index_id(&self) -> IndexId {
        self.metadata.index_id()
    }

    pub fn index_name(&self) -> &str {
        self.metadata.index_name()
    }

    pub fn table_id(&self) -> TableId {
        self.metadata.table_id()
    }

    pub fn key_schema(&self) -> &Arc<Schema> {
        &self.key_schema
    }

    pub fn metadata(&self) -> &IndexMetadata {
        &self.metadata
    }

    /// Projects the key fields out of a full table row.
    pub fn key_from_row(&self, row: &Row) -> Row {
        let key_map: Vec<usize> = self.metadata.key_map().iter().map(|&i| i as usize).collect();
        row.key_from_row(&key_map)
    }

    /// Inserts a table row's key into the index.
    pub fn insert_entry(&mut self, row: &Row, rid: RowId) -> Result<bool, DbError> {
        let key = self.key_from_row(row);
        Ok(self.tree.insert(&key, rid)?)
    }

    /// Removes a table row's key from the index.
    pub fn remove_entry(&mut self, row: &Row) -> Result<bool, DbError> {
        let key = self.key_from_row(row);
        Ok(self.tree.remove(&key)?)
    }

    /// Point lookup by key row; `KeyNotFound` on a miss.
    pub fn get_value(&self, key: &Row) -> Result<RowId, DbError> {
        self.tree.get_value(key)?.ok_or(DbError::KeyNotFound)
    }

    pub fn tree(&self) -> &BPlusTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut BPlusTree {
        &mut self.tree
    }
}

/// Owns every table and index of one database and keeps the on-disk
/// catalog in step.
pub struct CatalogManager {
    bpm: Arc<BufferPoolManager>,
    meta: CatalogMeta,
    table_names: HashMap<String, TableId>,
    tables: HashMap<TableId, TableInfo>,
    index_names: HashMap<String, HashMap<String, IndexId>>,
    indexes: HashMap<IndexId, IndexInfo>,
    next_table_id: TableId,
    next_index_id: IndexId,
}

impl CatalogManager {
    /// `init` formats a fresh catalog; otherwise the catalog meta page and
    /// every table and index it names are loaded back.
    pub fn new(bpm: Arc<BufferPoolManager>, init: bool) -> Result<CatalogManager, DbError> {
        let mut catalog = CatalogManager {
            bpm,
            meta: CatalogMeta::default(),
            table_names: HashMap::new(),
            tables: HashMap::new(),
            index_names: HashMap::new(),
            indexes: HashMap::new(),
            next_table_id: 0,
            next_index_id: 0,
        };

        if init {
            catalog.flush_catalog_meta_page()?;
        } else {
            let meta = {
                let guard = catalog.bpm.fetch_page(CATALOG_META_PAGE_ID)?;
                let page = guard.read();
                CatalogMeta::deserialize_from(&mut &page.data[..])?
            };
            let tables: Vec<(TableId, PageId)> =
                meta.table_meta_pages.iter().map(|(&t, &p)| (t, p)).collect();
            let indexes: Vec<(IndexId, PageId)> =
                meta.index_meta_pages.iter().map(|(&i, &p)| (i, p)).collect();
            catalog.next_table_id = meta.next_table_id();
            catalog.next_index_id = meta.next_index_id();
            catalog.meta = meta;
            for (table_id, page_id) in tables {
                catalog.load_table(table_id, page_id)?;
            }
            for (index_id, page_id) in indexes {
                catalog.load_index(index_id, page_id)?;
            }
        }
        Ok(catalog)
    }

    /// Creates a table and persists its metadata.
    pub fn create_table(
        &mut self,
        table_name: &str,
        schema: Schema,
        _txn: Option<&Txn>,
    ) -> Result<&TableInfo, DbError> {
        if self.table_names.contains_key(table_name) {
            return Err(DbError::TableAlreadyExist);
        }

        let schema = Arc::new(schema);
        let heap = TableHeap::create(Arc::clone(&self.bpm), Arc::clone(&schema))?;
        let table_id = self.next_table_id;
        self.next_table_id += 1;
        let metadata = TableMetadata::new(table_id, table_name, heap.first_page_id(), schema);

        let meta_page_id = {
            let guard = self.bpm.new_page()?;
            let mut page = guard.write();
            let mut target = &mut page.data[..];
            metadata.serialize_to(&mut target);
            guard.page_id()
        };

        self.table_names.insert(table_name.to_string(), table_id);
        self.tables.insert(table_id, TableInfo { metadata, heap });
        self.meta.table_meta_pages.insert(table_id, meta_page_id);
        self.flush_catalog_meta_page()?;
        crate::granite_debug_log!(
            "[CatalogManager::create_table] Created table '{table_name}' (id {table_id})"
        );
        Ok(&self.tables[&table_id])
    }

    pub fn get_table(&self, table_name: &str) -> Result<&TableInfo, DbError> {
        let table_id = self
            .table_names
            .get(table_name)
            .ok_or(DbError::TableNotExist)?;
        Ok(&self.tables[table_id])
    }

    pub fn get_table_by_id(&self, table_id: TableId) -> Result<&TableInfo, DbError> {
        self.tables.get(&table_id).ok_or(DbError::TableNotExist)
    }

    pub fn get_tables(&self) -> Vec<&TableInfo> {
        self.tables.values().collect()
    }

    /// Creates an index over the named columns and bulk-loads the table's
    /// existing rows into it.
    pub fn create_index(
        &mut self,
        table_name: &str,
        index_name: &str,
        key_columns: &[&str],
        txn: Option<&Txn>,
    ) -> Result<&IndexInfo, DbError> {
        let table_id = *self
            .table_names
            .get(table_name)
            .ok_or(DbError::TableNotExist)?;
        if let Some(per_table) = self.index_names.get(table_name) {
            if per_table.contains_key(index_name) {
                return Err(DbError::IndexAlreadyExist);
            }
        }

        let (key_map, key_schema) = {
            let table = &self.tables[&table_id];
            let mut key_map = Vec::with_capacity(key_columns.len());
            for column_name in key_columns {
                let index = table
                    .schema()
                    .column_index(column_name)
                    .ok_or(DbError::ColumnNameNotExist)?;
                key_map.push(index as u32);
            }
            let attrs: Vec<usize> = key_map.iter().map(|&i| i as usize).collect();
            (key_map, Arc::new(table.schema().project(&attrs)))
        };

        let index_id = self.next_index_id;
        self.next_index_id += 1;
        let metadata = IndexMetadata::new(index_id, index_name, table_id, key_map);
        let mut tree = BPlusTree::new(
            index_id,
            Arc::clone(&self.bpm),
            KeyManager::new(Arc::clone(&key_schema)),
            0,
            0,
        )?;

        // Existing rows enter the new index before it becomes visible.
        {
            let table = &self.tables[&table_id];
            let key_map: Vec<usize> = metadata.key_map().iter().map(|&i| i as usize).collect();
            for row in table.heap().iter(txn) {
                let row = row?;
                let key = row.key_from_row(&key_map);
                tree.insert(&key, row.rid())?;
            }
        }

        let meta_page_id = {
            let guard = self.bpm.new_page()?;
            let mut page = guard.write();
            let mut target = &mut page.data[..];
            metadata.serialize_to(&mut target);
            guard.page_id()
        };

        self.index_names
            .entry(table_name.to_string())
            .or_default()
            .insert(index_name.to_string(), index_id);
        self.indexes.insert(
            index_id,
            IndexInfo {
                metadata,
                key_schema,
                tree,
            },
        );
        self.meta.index_meta_pages.insert(index_id, meta_page_id);
        self.flush_catalog_meta_page()?;
        crate::granite_debug_log!(
            "[CatalogManager::create_index] Created index '{index_name}' on '{table_name}'"
        );
        Ok(&self.indexes[&index_id])
    }

    pub fn get_index(&self, table_name: &str, index_name: &str) -> Result<&IndexInfo, DbError> {
        if !self.table_names.contains_key(table_name) {
            return Err(DbError::TableNotExist);
        }
        let index_id = self
            .index_names
            .get(table_name)
            .and_then(|per_table| per_table.get(index_name))
            .ok_or(DbError::IndexNotFound)?;
        Ok(&self.indexes[index_id])
    }

    pub fn get_index_mut(
        &mut self,
        table_name: &str,
        index_name: &str,
    ) -> Result<&mut IndexInfo, DbError> {
        if !self.table_names.contains_key(table_name) {
            return Err(DbError::TableNotExist);
        }
        let index_id = *self
            .index_names
            .get(table_name)
            .and_then(|per_table| per_table.get(index_name))
            .ok_or(DbError::IndexNotFound)?;
        Ok(self.indexes.get_mut(&index_id).expect("index map out of sync"))
    }

    /// Every index declared on the table, in no particular order.
    pub fn get_table_indexes(&self, table_name: &str) -> Result<Vec<&IndexInfo>, DbError> {
        if !self.table_names.contains_key(table_name) {
            return Err(DbError::TableNotExist);
        }
        Ok(self
            .index_names
            .get(table_name)
            .map(|per_table| {
                per_table
                    .values()
                    .map(|index_id| &self.indexes[index_id])
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Drops a table, its indexes, its heap pages and its metadata page.
    pub fn drop_table(&mut self, table_name: &str) -> Result<(), DbError> {
        let table_id = *self
            .table_names
            .get(table_name)
            .ok_or(DbError::TableNotExist)?;

        let index_names: Vec<String> = self
            .index_names
            .get(table_name)
            .map(|per_table| per_table.keys().cloned().collect())
            .unwrap_or_default();
        for index_name in index_names {
            self.drop_index(table_name, &index_name)?;
        }
        self.index_names.remove(table_name);

        let table = self.tables.remove(&table_id).expect("table map out of sync");
        table.heap.delete_table()?;
        self.table_names.remove(table_name);
        if let Some(meta_page_id) = self.meta.table_meta_pages.remove(&table_id) {
            self.bpm.delete_page(meta_page_id)?;
        }
        self.flush_catalog_meta_page()?;
        crate::granite_debug_log!("[CatalogManager::drop_table] Dropped table '{table_name}'");
        Ok(())
    }

    /// Drops one index, destroying its tree pages and metadata page.
    pub fn drop_index(&mut self, table_name: &str, index_name: &str) -> Result<(), DbError> {
        let per_table = self
            .index_names
            .get_mut(table_name)
            .ok_or(DbError::TableNotExist)?;
        let index_id = per_table
            .remove(index_name)
            .ok_or(DbError::IndexNotFound)?;

        let mut index = self.indexes.remove(&index_id).expect("index map out of sync");
        index.tree.destroy()?;
        if let Some(meta_page_id) = self.meta.index_meta_pages.remove(&index_id) {
            self.bpm.delete_page(meta_page_id)?;
        }
        self.flush_catalog_meta_page()?;
        crate::granite_debug_log!(
            "[CatalogManager::drop_index] Dropped index '{index_name}' from '{table_name}'"
        );
        Ok(())
    }

    /// Rewrites page 0 from the in-memory meta record and forces it out.
    pub fn flush_catalog_meta_page(&self) -> Result<(), DbError> {
        debug_assert!(self.meta.serialized_size() <= PAGE_SIZE);
        {
            let guard = self.bpm.fetch_page(CATALOG_META_PAGE_ID)?;
            let mut page = guard.write();
            let mut target = &mut page.data[..];
            self.meta.serialize_to(&mut target);
        }
        self.bpm.flush_page(CATALOG_META_PAGE_ID)?;
        Ok(())
    }

    fn load_table(&mut self, table_id: TableId, meta_page_id: PageId) -> Result<(), DbError> {
        if self.tables.contains_key(&table_id) {
            return Err(DbError::Failed);
        }
        let metadata = {
            let guard = self.bpm.fetch_page(meta_page_id)?;
            let page = guard.read();
            TableMetadata::deserialize_from(&mut &page.data[..])?
        };
        let heap = TableHeap::open(
            Arc::clone(&self.bpm),
            metadata.first_page_id(),
            Arc::clone(metadata.schema()),
        );
        self.table_names
            .insert(metadata.table_name().to_string(), table_id);
        self.tables.insert(table_id, TableInfo { metadata, heap });
        Ok(())
    }

    fn load_index(&mut self, index_id: IndexId, meta_page_id: PageId) -> Result<(), DbError> {
        if self.indexes.contains_key(&index_id) {
            return Err(DbError::Failed);
        }
        let metadata = {
            let guard = self.bpm.fetch_page(meta_page_id)?;
            let page = guard.read();
            IndexMetadata::deserialize_from(&mut &page.data[..])?
        };
        if metadata.index_id() != index_id {
            return Err(DbError::Failed);
        }
        let table = self
            .tables
            .get(&metadata.table_id())
            .ok_or(DbError::TableNotExist)?;
        let attrs: Vec<usize> = metadata.key_map().iter().map(|&i| i as usize).collect();
        let key_schema = Arc::new(table.schema().project(&attrs));
        let tree = BPlusTree::new(
            index_id,
            Arc::clone(&self.bpm),
            KeyManager::new(Arc::clone(&key_schema)),
            0,
            0,
        )?;
        self.index_names
            .entry(table.table_name().to_string())
            .or_default()
            .insert(metadata.index_name().to_string(), index_id);
        self.indexes.insert(
            index_id,
            IndexInfo {
                metadata,
                key_schema,
                tree,
            },
        );
        Ok(())
    }
}
