//! A table heap: a singly linked chain of slotted table pages.

use std::io;
use std::sync::Arc;

use crate::heap::table_page::{PageUpdateResult, SIZE_MAX_ROW};
use crate::record::{Row, Schema};
use crate::txn::Txn;
use crate::{BufferPoolManager, PageId, RowId, INVALID_PAGE_ID};

pub struct TableHeap {
    bpm: Arc<BufferPoolManager>,
    first_page_id: PageId,
    schema: Arc<Schema>,
}

impl TableHeap {
    /// Creates a heap with one empty page.
    pub fn create(bpm: Arc<BufferPoolManager>, schema: Arc<Schema>) -> io::Result<TableHeap> {
        let first_page_id = {
            let guard = bpm.new_page()?;
            let page_id = guard.page_id();
            guard.write().table_init(page_id, INVALID_PAGE_ID);
            page_id
        };
        Ok(TableHeap {
            bpm,
            first_page_id,
            schema,
        })
    }

    /// Reattaches to an existing heap anchored at `first_page_id`.
    pub fn open(
        bpm: Arc<BufferPoolManager>,
        first_page_id: PageId,
        schema: Arc<Schema>,
    ) -> TableHeap {
        TableHeap {
            bpm,
            first_page_id,
            schema,
        }
    }

    pub fn first_page_id(&self) -> PageId {
        self.first_page_id
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Inserts a row, assigning its RowId. Walks the chain for the first
    /// page with room and appends a fresh page when every page refuses.
    pub fn insert_tuple(&self, row: &mut Row, _txn: Option<&Txn>) -> io::Result<bool> {
        if row.serialized_size(&self.schema) > SIZE_MAX_ROW {
            return Ok(false);
        }

        let mut current = self.first_page_id;
        loop {
            let guard = self.bpm.fetch_page(current)?;
            if guard.write().insert_tuple(row, &self.schema) {
                return Ok(true);
            }
            let next = guard.read().next_page_id();
            if next != INVALID_PAGE_ID {
                current = next;
                continue;
            }

            // Every existing page refused; append a successor to the tail.
            let new_guard = self.bpm.new_page()?;
            let new_page_id = new_guard.page_id();
            {
                let mut page = new_guard.write();
                page.table_init(new_page_id, current);
                if !page.insert_tuple(row, &self.schema) {
                    return Ok(false);
                }
            }
            guard.write().set_next_page_id(new_page_id);
            crate::strata_debug_log!(
                "[TableHeap::insert_tuple] Appended page {new_page_id} after {current}"
            );
            return Ok(true);
        }
    }

    /// Replaces the row at `rid`. When the new image no longer fits on its
    /// page the old row is physically deleted and the new one re-inserted,
    /// possibly under a new RowId.
    pub fn update_tuple(&self, row: &mut Row, rid: RowId, txn: Option<&Txn>) -> io::Result<bool> {
        let result = {
            let guard = self.bpm.fetch_page(rid.page_id())?;
            let mut page = guard.write();
            page.update_tuple(row, rid, &self.schema)
        };
        match result {
            PageUpdateResult::Updated { .. } => Ok(true),
            PageUpdateResult::SlotInvalid => Ok(false),
            PageUpdateResult::DoesNotFit => {
                crate::strata_debug_log!(
                    "[TableHeap::update_tuple] Relocating row {rid:?} to another page"
                );
                self.apply_delete(rid, txn)?;
                self.insert_tuple(row, txn)
            }
        }
    }

    /// Sets the tombstone on the row at `rid`.
    pub fn mark_delete(&self, rid: RowId, _txn: Option<&Txn>) -> io::Result<bool> {
        let guard = self.bpm.fetch_page(rid.page_id())?;
        let deleted = guard.write().mark_delete(rid);
        Ok(deleted)
    }

    /// Physically removes the row at `rid`.
    pub fn apply_delete(&self, rid: RowId, _txn: Option<&Txn>) -> io::Result<bool> {
        let guard = self.bpm.fetch_page(rid.page_id())?;
        let deleted = guard.write().apply_delete(rid);
        Ok(deleted)
    }

    /// Clears a tombstone set by `mark_delete`.
    pub fn rollback_delete(&self, rid: RowId, _txn: Option<&Txn>) -> io::Result<bool> {
        let guard = self.bpm.fetch_page(rid.page_id())?;
        let restored = guard.write().rollback_delete(rid);
        Ok(restored)
    }

    /// Materializes the live row at `rid`.
    pub fn get_tuple(&self, rid: RowId, _txn: Option<&Txn>) -> io::Result<Option<Row>> {
        if rid.page_id() == INVALID_PAGE_ID {
            return Ok(None);
        }
        let guard = self.bpm.fetch_page(rid.page_id())?;
        let row = guard.read().get_tuple(rid, &self.schema);
        Ok(row)
    }

    /// Walks the chain and deletes every page of the heap.
    pub fn delete_table(&self) -> io::Result<()> {
        let mut pages = Vec::new();
        let mut current = self.first_page_id;
        while current != INVALID_PAGE_ID {
            let guard = self.bpm.fetch_page(current)?;
            let next = guard.read().next_page_id();
            drop(guard);
            pages.push(current);
            current = next;
        }
        for page_id in pages {
            self.bpm.delete_page(page_id)?;
        }
        Ok(())
    }

    /// Forward iterator over the live rows of the heap.
    pub fn iter<'a>(&'a self, txn: Option<&'a Txn>) -> TableIterator<'a> {
        let next_rid = match self.first_live_rid(self.first_page_id) {
            Ok(rid) => rid,
            Err(err) => {
                crate::strata_debug_log!("[TableHeap::iter] Scan start failed: {err}");
                None
            }
        };
        TableIterator {
            heap: self,
            next_rid,
            txn,
        }
    }

    /// First live RowId at or after the start of page `page_id`'s chain
    /// suffix.
    fn first_live_rid(&self, mut page_id: PageId) -> io::Result<Option<RowId>> {
        while page_id != INVALID_PAGE_ID {
            let guard = self.bpm.fetch_page(page_id)?;
            let page = guard.read();
            if let Some(rid) = page.first_tuple_rid() {
                return Ok(Some(rid));
            }
            page_id = page.next_page_id();
        }
        Ok(None)
    }

    /// Live RowId following `current` in chain order.
    fn next_live_rid(&self, current: RowId) -> io::Result<Option<RowId>> {
        let next_page = {
            let guard = self.bpm.fetch_page(current.page_id())?;
            let page = guard.read();
            if let Some(rid) = page.next_tuple_rid(current) {
                return Ok(Some(rid));
            }
            page.next_page_id()
        };
        self.first_live_rid(next_page)
    }
}

/// Iterates the live rows of a heap in chain order, pinning at most one
/// page per step. The transaction handle is carried for interface
/// stability; single-threaded execution does not consult it.
pub struct TableIterator<'a> {
    heap: &'a TableHeap,
    next_rid: Option<RowId>,
    #[allow(dead_code)]
    txn: Option<&'a Txn>,
}

impl<'a> Iterator for TableIterator<'a> {
    type Item = io::Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        let rid = self.next_rid?;
        let row = match self.heap.get_tuple(rid, self.txn) {
            Ok(Some(row)) => row,
            Ok(None) => {
                self.next_rid = None;
                return None;
            }
            Err(err) => {
                self.next_rid = None;
                return Some(Err(err));
            }
        };
        match self.heap.next_live_rid(rid) {
            Ok(next) => self.next_rid = next,
            Err(err) => {
                self.next_rid = None;
                return Some(Err(err));
            }
        }
        Some(Ok(row))
    }
}
