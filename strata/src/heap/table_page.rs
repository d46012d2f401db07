//! Slotted table page layout.
//!
//! ```text
//!  ---------------------------------------------------------
//!  | HEADER | ... FREE SPACE ... | ... INSERTED TUPLES ... |
//!  ---------------------------------------------------------
//!                                ^ free space pointer
//! ```
//!
//! Header (24 bytes): `page_id | lsn | prev_page_id | next_page_id |
//! free_space_pointer | tuple_count`, all u32. The slot directory grows
//! forward from the header, one `(offset:u32, size:u32)` entry per tuple;
//! tuple bytes grow down from the page end. The high bit of a slot's size is
//! the tombstone marker; a size of 0 marks a dead slot that insert may
//! reuse (tombstones keep their size so a delete can be rolled back).

use bytes::Buf;

use crate::record::{Row, Schema};
use crate::{Page, PageId, RowId, INVALID_PAGE_ID, PAGE_SIZE};

const OFFSET_PREV_PAGE_ID: usize = 8;
const OFFSET_NEXT_PAGE_ID: usize = 12;
const OFFSET_FREE_SPACE: usize = 16;
const OFFSET_TUPLE_COUNT: usize = 20;
const SIZE_TABLE_PAGE_HEADER: usize = 24;
const SIZE_SLOT: usize = 8;

const DELETE_MASK: u32 = 1 << 31;

/// Largest serialized row a table page can hold.
pub const SIZE_MAX_ROW: usize = PAGE_SIZE - SIZE_TABLE_PAGE_HEADER - SIZE_SLOT;

/// Outcome of an in-page update.
#[derive(Debug, PartialEq)]
pub enum PageUpdateResult {
    /// The new row now lives on this page; the previous image is returned.
    Updated { old_row: Row },
    /// The new row cannot fit here; the caller must delete and re-insert.
    DoesNotFit,
    /// The slot is out of range, dead, or tombstoned.
    SlotInvalid,
}

fn is_dead(raw_size: u32) -> bool {
    raw_size & DELETE_MASK != 0 || raw_size == 0
}

fn tuple_len(raw_size: u32) -> u32 {
    raw_size & !DELETE_MASK
}

impl Page {
    /// Formats this page as an empty table page linked after `prev_page_id`.
    pub fn table_init(&mut self, page_id: PageId, prev_page_id: PageId) {
        self.data[..SIZE_TABLE_PAGE_HEADER].fill(0);
        self.write_u32(0, page_id);
        self.write_u32(OFFSET_PREV_PAGE_ID, prev_page_id);
        self.write_u32(OFFSET_NEXT_PAGE_ID, INVALID_PAGE_ID);
        self.set_free_space_pointer(PAGE_SIZE as u32);
        self.set_tuple_count(0);
    }

    pub fn table_page_id(&self) -> PageId {
        self.read_u32(0)
    }

    pub fn prev_page_id(&self) -> PageId {
        self.read_u32(OFFSET_PREV_PAGE_ID)
    }

    pub fn next_page_id(&self) -> PageId {
        self.read_u32(OFFSET_NEXT_PAGE_ID)
    }

    pub fn set_prev_page_id(&mut self, prev_page_id: PageId) {
        self.write_u32(OFFSET_PREV_PAGE_ID, prev_page_id);
    }

    pub fn set_next_page_id(&mut self, next_page_id: PageId) {
        self.write_u32(OFFSET_NEXT_PAGE_ID, next_page_id);
    }

    pub fn tuple_count(&self) -> u32 {
        self.read_u32(OFFSET_TUPLE_COUNT)
    }

    fn set_tuple_count(&mut self, count: u32) {
        self.write_u32(OFFSET_TUPLE_COUNT, count);
    }

    fn free_space_pointer(&self) -> u32 {
        self.read_u32(OFFSET_FREE_SPACE)
    }

    fn set_free_space_pointer(&mut self, pointer: u32) {
        self.write_u32(OFFSET_FREE_SPACE, pointer);
    }

    /// Bytes left between the slot directory and the tuple area.
    pub fn free_space_remaining(&self) -> u32 {
        self.free_space_pointer()
            - (SIZE_TABLE_PAGE_HEADER + SIZE_SLOT * self.tuple_count() as usize) as u32
    }

    fn slot_offset(&self, slot: u32) -> u32 {
        self.read_u32(SIZE_TABLE_PAGE_HEADER + SIZE_SLOT * slot as usize)
    }

    fn set_slot_offset(&mut self, slot: u32, offset: u32) {
        self.write_u32(SIZE_TABLE_PAGE_HEADER + SIZE_SLOT * slot as usize, offset);
    }

    fn slot_size(&self, slot: u32) -> u32 {
        self.read_u32(SIZE_TABLE_PAGE_HEADER + SIZE_SLOT * slot as usize + 4)
    }

    fn set_slot_size(&mut self, slot: u32, size: u32) {
        self.write_u32(SIZE_TABLE_PAGE_HEADER + SIZE_SLOT * slot as usize + 4, size);
    }

    /// Serializes `row` into this page, recording its RowId on success.
    pub fn insert_tuple(&mut self, row: &mut Row, schema: &Schema) -> bool {
        let tuple_size = row.serialized_size(schema);
        if tuple_size > SIZE_MAX_ROW {
            return false;
        }

        // Reuse a dead slot before growing the directory; tombstoned slots
        // are never reused.
        let recycled = (0..self.tuple_count()).find(|&slot| self.slot_size(slot) == 0);
        let needed = match recycled {
            Some(_) => tuple_size,
            None => tuple_size + SIZE_SLOT,
        };
        if needed as u32 > self.free_space_remaining() {
            return false;
        }

        let offset = self.free_space_pointer() - tuple_size as u32;
        {
            let mut target = self.slice_mut(offset as usize, tuple_size);
            row.serialize_to(&mut target, schema);
        }
        self.set_free_space_pointer(offset);

        let slot = match recycled {
            Some(slot) => slot,
            None => {
                let slot = self.tuple_count();
                self.set_tuple_count(slot + 1);
                slot
            }
        };
        self.set_slot_offset(slot, offset);
        self.set_slot_size(slot, tuple_size as u32);
        row.set_rid(RowId::new(self.table_page_id(), slot));
        true
    }

    /// Sets the tombstone bit. Fails on dead, tombstoned or out-of-range
    /// slots.
    pub fn mark_delete(&mut self, rid: RowId) -> bool {
        let slot = rid.slot_num();
        if slot >= self.tuple_count() {
            return false;
        }
        let raw = self.slot_size(slot);
        if is_dead(raw) {
            return false;
        }
        self.set_slot_size(slot, raw | DELETE_MASK);
        true
    }

    /// Clears the tombstone bit set by a prior `mark_delete`.
    pub fn rollback_delete(&mut self, rid: RowId) -> bool {
        let slot = rid.slot_num();
        if slot >= self.tuple_count() {
            return false;
        }
        let raw = self.slot_size(slot);
        if raw & DELETE_MASK == 0 {
            return false;
        }
        self.set_slot_size(slot, raw & !DELETE_MASK);
        true
    }

    /// Physically removes the tuple, compacting the tuple area and zeroing
    /// the slot for reuse.
    pub fn apply_delete(&mut self, rid: RowId) -> bool {
        let slot = rid.slot_num();
        if slot >= self.tuple_count() {
            return false;
        }
        let raw = self.slot_size(slot);
        if raw == 0 {
            return false;
        }
        let victim_offset = self.slot_offset(slot);
        let victim_size = tuple_len(raw);
        self.compact_out(victim_offset, victim_size);
        self.set_slot_offset(slot, 0);
        self.set_slot_size(slot, 0);
        true
    }

    /// Slides every tuple stored below `victim_offset` up by `victim_size`
    /// bytes and fixes the affected slots.
    fn compact_out(&mut self, victim_offset: u32, victim_size: u32) {
        let free_space = self.free_space_pointer();
        self.data.copy_within(
            free_space as usize..victim_offset as usize,
            (free_space + victim_size) as usize,
        );
        for other in 0..self.tuple_count() {
            let other_raw = self.slot_size(other);
            let other_offset = self.slot_offset(other);
            if other_raw != 0 && other_offset < victim_offset {
                self.set_slot_offset(other, other_offset + victim_size);
            }
        }
        self.set_free_space_pointer(free_space + victim_size);
    }

    /// Replaces the tuple at `rid` with `new_row` when it fits on this page.
    pub fn update_tuple(
        &mut self,
        new_row: &mut Row,
        rid: RowId,
        schema: &Schema,
    ) -> PageUpdateResult {
        let slot = rid.slot_num();
        if slot >= self.tuple_count() {
            return PageUpdateResult::SlotInvalid;
        }
        let raw = self.slot_size(slot);
        if is_dead(raw) {
            return PageUpdateResult::SlotInvalid;
        }

        let old_offset = self.slot_offset(slot);
        let old_size = tuple_len(raw);
        let old_row = {
            let mut source = self.slice(old_offset as usize, old_size as usize);
            match Row::deserialize_from(&mut source, schema) {
                Ok(mut row) => {
                    row.set_rid(rid);
                    row
                }
                Err(_) => return PageUpdateResult::SlotInvalid,
            }
        };

        let new_size = new_row.serialized_size(schema) as u32;
        if new_size <= old_size {
            // Shrink in place: the new image keeps the tuple-area top fixed
            // and the slack is compacted away immediately.
            let shrink = old_size - new_size;
            let new_offset = old_offset + shrink;
            {
                let mut target = self.slice_mut(new_offset as usize, new_size as usize);
                new_row.serialize_to(&mut target, schema);
            }
            if shrink > 0 {
                let free_space = self.free_space_pointer();
                self.data.copy_within(
                    free_space as usize..old_offset as usize,
                    (free_space + shrink) as usize,
                );
                for other in 0..self.tuple_count() {
                    let other_raw = self.slot_size(other);
                    let other_offset = self.slot_offset(other);
                    if other_raw != 0 && other != slot && other_offset < old_offset {
                        self.set_slot_offset(other, other_offset + shrink);
                    }
                }
                self.set_free_space_pointer(free_space + shrink);
            }
            self.set_slot_offset(slot, new_offset);
            self.set_slot_size(slot, new_size);
            new_row.set_rid(rid);
            return PageUpdateResult::Updated { old_row };
        }

        if new_size > old_size + self.free_space_remaining() {
            return PageUpdateResult::DoesNotFit;
        }

        // Grow: compact the old image out, then write the new one at a
        // fresh offset.
        self.compact_out(old_offset, old_size);
        let offset = self.free_space_pointer() - new_size;
        {
            let mut target = self.slice_mut(offset as usize, new_size as usize);
            new_row.serialize_to(&mut target, schema);
        }
        self.set_free_space_pointer(offset);
        self.set_slot_offset(slot, offset);
        self.set_slot_size(slot, new_size);
        new_row.set_rid(rid);
        PageUpdateResult::Updated { old_row }
    }

    /// Reads the live tuple at `rid`, skipping tombstones.
    pub fn get_tuple(&self, rid: RowId, schema: &Schema) -> Option<Row> {
        let slot = rid.slot_num();
        if slot >= self.tuple_count() {
            return None;
        }
        let raw = self.slot_size(slot);
        if is_dead(raw) {
            return None;
        }
        let offset = self.slot_offset(slot) as usize;
        let mut source = self.slice(offset, tuple_len(raw) as usize);
        let mut row = Row::deserialize_from(&mut source, schema).ok()?;
        debug_assert_eq!(source.remaining(), 0);
        row.set_rid(rid);
        Some(row)
    }

    /// RowId of the first live tuple on this page.
    pub fn first_tuple_rid(&self) -> Option<RowId> {
        (0..self.tuple_count())
            .find(|&slot| !is_dead(self.slot_size(slot)))
            .map(|slot| RowId::new(self.table_page_id(), slot))
    }

    /// RowId of the next live tuple after `current` on this page.
    pub fn next_tuple_rid(&self, current: RowId) -> Option<RowId> {
        (current.slot_num() + 1..self.tuple_count())
            .find(|&slot| !is_dead(self.slot_size(slot)))
            .map(|slot| RowId::new(self.table_page_id(), slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Column, Field, TypeId};

    fn schema() -> Schema {
        Schema::new(vec![
            Column::new("id", TypeId::Int, 0, false, false),
            Column::new_char("payload", 32, 1, true, false),
        ])
    }

    fn row(id: i32, payload: &str) -> Row {
        Row::new(vec![Field::from_int(id), Field::from_chars(payload)])
    }

    fn table_page() -> Page {
        let mut page = Page::new(5);
        page.table_init(5, INVALID_PAGE_ID);
        page
    }

    #[test]
    fn insert_assigns_sequential_slots() {
        let schema = schema();
        let mut page = table_page();
        let mut first = row(1, "one");
        let mut second = row(2, "two");
        assert!(page.insert_tuple(&mut first, &schema));
        assert!(page.insert_tuple(&mut second, &schema));
        assert_eq!(first.rid(), RowId::new(5, 0));
        assert_eq!(second.rid(), RowId::new(5, 1));
        assert_eq!(page.tuple_count(), 2);
        assert_eq!(
            page.get_tuple(first.rid(), &schema).unwrap().fields(),
            first.fields()
        );
    }

    #[test]
    fn mark_delete_is_rejecting_idempotent() {
        let schema = schema();
        let mut page = table_page();
        let mut r = row(1, "x");
        page.insert_tuple(&mut r, &schema);
        assert!(page.mark_delete(r.rid()));
        assert!(!page.mark_delete(r.rid()));
        assert!(page.get_tuple(r.rid(), &schema).is_none());
        assert!(page.rollback_delete(r.rid()));
        assert!(page.get_tuple(r.rid(), &schema).is_some());
    }

    #[test]
    fn apply_delete_compacts_and_frees_the_slot() {
        let schema = schema();
        let mut page = table_page();
        let mut a = row(1, "aaaa");
        let mut b = row(2, "bbbbbbbb");
        let mut c = row(3, "cc");
        page.insert_tuple(&mut a, &schema);
        page.insert_tuple(&mut b, &schema);
        page.insert_tuple(&mut c, &schema);

        let before = page.free_space_remaining();
        let b_size = b.serialized_size(&schema) as u32;
        assert!(page.apply_delete(b.rid()));
        assert_eq!(page.free_space_remaining(), before + b_size);

        // Neighbours survive the compaction.
        assert_eq!(page.get_tuple(a.rid(), &schema).unwrap().fields(), a.fields());
        assert_eq!(page.get_tuple(c.rid(), &schema).unwrap().fields(), c.fields());

        // The dead slot is recycled by the next insert.
        let mut d = row(4, "dd");
        assert!(page.insert_tuple(&mut d, &schema));
        assert_eq!(d.rid().slot_num(), b.rid().slot_num());
        assert_eq!(page.tuple_count(), 3);
    }

    #[test]
    fn tombstoned_slots_are_not_recycled() {
        let schema = schema();
        let mut page = table_page();
        let mut a = row(1, "aa");
        page.insert_tuple(&mut a, &schema);
        page.mark_delete(a.rid());
        let mut b = row(2, "bb");
        assert!(page.insert_tuple(&mut b, &schema));
        assert_eq!(b.rid().slot_num(), 1);
    }

    #[test]
    fn update_in_place_and_grow() {
        let schema = schema();
        let mut page = table_page();
        let mut a = row(1, "aaaaaaaaaa");
        let mut b = row(2, "bb");
        page.insert_tuple(&mut a, &schema);
        page.insert_tuple(&mut b, &schema);

        // Shrink.
        let mut smaller = row(1, "a");
        match page.update_tuple(&mut smaller, a.rid(), &schema) {
            PageUpdateResult::Updated { old_row } => {
                assert_eq!(old_row.fields(), a.fields())
            }
            other => panic!("unexpected update result {other:?}"),
        }
        assert_eq!(
            page.get_tuple(a.rid(), &schema).unwrap().field(1).as_chars(),
            Some("a")
        );
        assert_eq!(
            page.get_tuple(b.rid(), &schema).unwrap().fields(),
            b.fields()
        );

        // Grow within the page.
        let mut bigger = row(1, "cccccccccccccccc");
        assert!(matches!(
            page.update_tuple(&mut bigger, a.rid(), &schema),
            PageUpdateResult::Updated { .. }
        ));
        assert_eq!(
            page.get_tuple(a.rid(), &schema).unwrap().field(1).as_chars(),
            Some("cccccccccccccccc")
        );
        assert_eq!(
            page.get_tuple(b.rid(), &schema).unwrap().fields(),
            b.fields()
        );
    }

    #[test]
    fn update_rejects_dead_slots_and_overflow() {
        let schema = schema();
        let mut page = table_page();
        let mut a = row(1, "aa");
        page.insert_tuple(&mut a, &schema);

        let mut replacement = row(9, "zz");
        assert_eq!(
            page.update_tuple(&mut replacement, RowId::new(5, 7), &schema),
            PageUpdateResult::SlotInvalid
        );
        page.mark_delete(a.rid());
        assert_eq!(
            page.update_tuple(&mut replacement, a.rid(), &schema),
            PageUpdateResult::SlotInvalid
        );
    }

    #[test]
    fn page_refuses_rows_that_do_not_fit() {
        let schema = Schema::new(vec![
            Column::new("id", TypeId::Int, 0, false, false),
            Column::new_char("payload", 4000, 1, true, false),
        ]);
        let mut page = table_page();
        let mut big = Row::new(vec![
            Field::from_int(1),
            Field::from_chars("x".repeat(2000)),
        ]);
        assert!(page.insert_tuple(&mut big, &schema));
        let mut second = Row::new(vec![
            Field::from_int(2),
            Field::from_chars("y".repeat(2100)),
        ]);
        assert!(!page.insert_tuple(&mut second, &schema));
    }

    #[test]
    fn scan_skips_tombstones_across_slots() {
        let schema = schema();
        let mut page = table_page();
        let mut rows: Vec<Row> = (0..4).map(|i| row(i, "p")).collect();
        for r in rows.iter_mut() {
            page.insert_tuple(r, &schema);
        }
        page.mark_delete(rows[0].rid());
        page.mark_delete(rows[2].rid());

        let first = page.first_tuple_rid().unwrap();
        assert_eq!(first.slot_num(), 1);
        let second = page.next_tuple_rid(first).unwrap();
        assert_eq!(second.slot_num(), 3);
        assert!(page.next_tuple_rid(second).is_none());
    }
}
