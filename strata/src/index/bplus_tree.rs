//! Disk-resident B+ tree keyed by serialized composite keys.
//!
//! Interior pages map separator keys to children; leaves map keys to
//! RowIds and chain forward through `next_page_id`. Keys are unique.
//! Every root change is mirrored into the index-roots page.

use std::cmp::Ordering;
use std::io;
use std::sync::Arc;

use super::key::KeyManager;
use super::tree_page::{LEAF_PAGE_HEADER_SIZE, TREE_PAGE_HEADER_SIZE};
use super::IndexId;
use crate::record::Row;
use crate::{
    BufferPoolManager, PageId, RowId, INDEX_ROOTS_PAGE_ID, INVALID_PAGE_ID, PAGE_SIZE,
};

pub struct BPlusTree {
    index_id: IndexId,
    bpm: Arc<BufferPoolManager>,
    km: KeyManager,
    root_page_id: PageId,
    /// Max key/value pairs a leaf may hold at rest; a leaf reaching this
    /// size splits.
    leaf_max_size: u32,
    /// Max separator keys an internal node may hold; the slot-0 dummy is
    /// not counted, so an internal node spans up to `internal_max_size + 1`
    /// children.
    internal_max_size: u32,
}

impl BPlusTree {
    /// Opens the tree for `index_id`, recovering its root from the
    /// index-roots page. Passing 0 for either size computes the largest
    /// value the page geometry allows.
    pub fn new(
        index_id: IndexId,
        bpm: Arc<BufferPoolManager>,
        km: KeyManager,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> io::Result<BPlusTree> {
        let key_size = km.key_size();
        let leaf_max_size = if leaf_max_size != 0 {
            leaf_max_size
        } else {
            ((PAGE_SIZE - LEAF_PAGE_HEADER_SIZE) / (key_size + 8) - 1) as u32
        };
        let internal_max_size = if internal_max_size != 0 {
            internal_max_size
        } else {
            ((PAGE_SIZE - TREE_PAGE_HEADER_SIZE) / (key_size + 4) - 2) as u32
        };

        let root_page_id = {
            let guard = bpm.fetch_page(INDEX_ROOTS_PAGE_ID)?;
            let roots = guard.read();
            roots.roots_get(index_id).unwrap_or(INVALID_PAGE_ID)
        };

        Ok(BPlusTree {
            index_id,
            bpm,
            km,
            root_page_id,
            leaf_max_size,
            internal_max_size,
        })
    }

    pub fn index_id(&self) -> IndexId {
        self.index_id
    }

    pub fn key_manager(&self) -> &KeyManager {
        &self.km
    }

    pub fn root_page_id(&self) -> PageId {
        self.root_page_id
    }

    pub fn is_empty(&self) -> bool {
        self.root_page_id == INVALID_PAGE_ID
    }

    /// Child capacity of an internal node.
    fn internal_capacity(&self) -> u32 {
        self.internal_max_size + 1
    }

    /// Point lookup.
    pub fn get_value(&self, key: &Row) -> io::Result<Option<RowId>> {
        if self.is_empty() {
            return Ok(None);
        }
        let key = self.km.serialize_key(key);
        let leaf_id = self.find_leaf_page_id(Some(&key), false)?;
        let guard = self.bpm.fetch_page(leaf_id)?;
        let value = guard.read().leaf_lookup(&key, &self.km);
        Ok(value)
    }

    /// Inserts a unique key. Returns false on a duplicate.
    pub fn insert(&mut self, key: &Row, value: RowId) -> io::Result<bool> {
        let key = self.km.serialize_key(key);
        if self.is_empty() {
            self.start_new_tree(&key, value)?;
            return Ok(true);
        }

        let leaf_id = self.find_leaf_page_id(Some(&key), false)?;
        let size = {
            let guard = self.bpm.fetch_page(leaf_id)?;
            let index = guard.read().leaf_key_index(&key, &self.km);
            {
                let page = guard.read();
                if index < page.tree_size()
                    && self.km.compare(page.tree_key_at(index), &key) == Ordering::Equal
                {
                    return Ok(false);
                }
            }
            let mut page = guard.write();
            page.leaf_insert_at(index, &key, value);
            page.tree_size()
        };

        if size >= self.leaf_max_size {
            self.split_leaf(leaf_id)?;
        }
        Ok(true)
    }

    /// Removes a key. Returns false when the key is absent.
    pub fn remove(&mut self, key: &Row) -> io::Result<bool> {
        if self.is_empty() {
            return Ok(false);
        }
        let key = self.km.serialize_key(key);
        let leaf_id = self.find_leaf_page_id(Some(&key), false)?;
        let (size, removed_at, min_size) = {
            let guard = self.bpm.fetch_page(leaf_id)?;
            let index = {
                let page = guard.read();
                let index = page.leaf_key_index(&key, &self.km);
                if index == page.tree_size()
                    || self.km.compare(page.tree_key_at(index), &key) != Ordering::Equal
                {
                    return Ok(false);
                }
                index
            };
            let mut page = guard.write();
            page.leaf_remove_at(index);
            (page.tree_size(), index, page.tree_min_size())
        };

        if leaf_id == self.root_page_id {
            if size == 0 {
                self.root_page_id = INVALID_PAGE_ID;
                self.update_root_page_id(false)?;
                self.bpm.delete_page(leaf_id)?;
            }
            return Ok(true);
        }

        if size < min_size {
            self.coalesce_or_redistribute(leaf_id)?;
        } else if removed_at == 0 {
            self.refresh_parent_separator(leaf_id)?;
        }
        Ok(true)
    }

    /// Iterator over the whole tree from the leftmost entry.
    pub fn begin(&self) -> io::Result<IndexIterator> {
        if self.is_empty() {
            return Ok(IndexIterator::exhausted(Arc::clone(&self.bpm)));
        }
        let leaf_id = self.find_leaf_page_id(None, true)?;
        Ok(IndexIterator {
            bpm: Arc::clone(&self.bpm),
            page_id: leaf_id,
            index: 0,
        })
    }

    /// Iterator positioned at the first entry >= `key`.
    pub fn begin_at(&self, key: &Row) -> io::Result<IndexIterator> {
        if self.is_empty() {
            return Ok(IndexIterator::exhausted(Arc::clone(&self.bpm)));
        }
        let key = self.km.serialize_key(key);
        let leaf_id = self.find_leaf_page_id(Some(&key), false)?;
        let index = {
            let guard = self.bpm.fetch_page(leaf_id)?;
            let __result = guard.read().leaf_key_index(&key, &self.km);
            __result
        };
        Ok(IndexIterator {
            bpm: Arc::clone(&self.bpm),
            page_id: leaf_id,
            index,
        })
    }

    /// Deletes every page of the tree and its index-roots record.
    pub fn destroy(&mut self) -> io::Result<()> {
        if !self.is_empty() {
            self.destroy_subtree(self.root_page_id)?;
            self.root_page_id = INVALID_PAGE_ID;
        }
        let guard = self.bpm.fetch_page(INDEX_ROOTS_PAGE_ID)?;
        guard.write().roots_remove(self.index_id);
        Ok(())
    }

    fn destroy_subtree(&mut self, page_id: PageId) -> io::Result<()> {
        let children: Vec<PageId> = {
            let guard = self.bpm.fetch_page(page_id)?;
            let page = guard.read();
            if page.tree_is_leaf() {
                Vec::new()
            } else {
                (0..page.tree_size()).map(|i| page.internal_value_at(i)).collect()
            }
        };
        for child in children {
            self.destroy_subtree(child)?;
        }
        self.bpm.delete_page(page_id)?;
        Ok(())
    }

    /// Descends to the leaf that owns `key` (or the leftmost leaf),
    /// unpinning each ancestor along the way.
    fn find_leaf_page_id(&self, key: Option<&[u8]>, left_most: bool) -> io::Result<PageId> {
        let mut current = self.root_page_id;
        loop {
            let guard = self.bpm.fetch_page(current)?;
            let page = guard.read();
            if page.tree_is_leaf() {
                return Ok(current);
            }
            current = if left_most {
                page.internal_value_at(0)
            } else {
                page.internal_lookup(key.expect("key required for a guided descent"), &self.km)
            };
        }
    }

    fn start_new_tree(&mut self, key: &[u8], value: RowId) -> io::Result<()> {
        let root_id = {
            let guard = self.bpm.new_page()?;
            let root_id = guard.page_id();
            let mut page = guard.write();
            page.tree_init_leaf(
                root_id,
                INVALID_PAGE_ID,
                self.km.key_size() as u32,
                self.leaf_max_size,
            );
            page.leaf_insert_at(0, key, value);
            root_id
        };
        self.root_page_id = root_id;
        self.update_root_page_id(true)
    }

    /// Splits a full leaf, the sibling taking the upper half, and pushes the
    /// separator into the parent.
    fn split_leaf(&mut self, leaf_id: PageId) -> io::Result<()> {
        let sibling_guard = self.bpm.new_page()?;
        let sibling_id = sibling_guard.page_id();
        let separator = {
            let leaf_guard = self.bpm.fetch_page(leaf_id)?;
            let mut leaf = leaf_guard.write();
            let mut sibling = sibling_guard.write();
            let size = leaf.tree_size();
            let start = size / 2;
            sibling.tree_init_leaf(
                sibling_id,
                leaf.tree_parent_page_id(),
                self.km.key_size() as u32,
                self.leaf_max_size,
            );
            sibling.tree_copy_pairs_from(&leaf, start, 0, size - start);
            sibling.tree_set_size(size - start);
            leaf.tree_set_size(start);
            sibling.leaf_set_next_page_id(leaf.leaf_next_page_id());
            leaf.leaf_set_next_page_id(sibling_id);
            sibling.tree_key_at(0).to_vec()
        };
        drop(sibling_guard);
        crate::strata_debug_log!("[BPlusTree::split_leaf] Split leaf {leaf_id} -> {sibling_id}");
        self.insert_into_parent(leaf_id, separator, sibling_id)
    }

    /// Splits an overflowing internal node and promotes its median key.
    fn split_internal(&mut self, node_id: PageId) -> io::Result<()> {
        let sibling_guard = self.bpm.new_page()?;
        let sibling_id = sibling_guard.page_id();
        let (separator, moved_children) = {
            let node_guard = self.bpm.fetch_page(node_id)?;
            let mut node = node_guard.write();
            let mut sibling = sibling_guard.write();
            let size = node.tree_size();
            let start = (size + 1) / 2;
            sibling.tree_init_internal(
                sibling_id,
                node.tree_parent_page_id(),
                self.km.key_size() as u32,
                self.internal_max_size,
            );
            sibling.tree_copy_pairs_from(&node, start, 0, size - start);
            sibling.tree_set_size(size - start);
            node.tree_set_size(start);
            // The moved block's first key separates the two nodes; in its
            // new home that slot is the dummy.
            let separator = sibling.tree_key_at(0).to_vec();
            let moved: Vec<PageId> = (0..sibling.tree_size())
                .map(|i| sibling.internal_value_at(i))
                .collect();
            (separator, moved)
        };
        drop(sibling_guard);
        for child in moved_children {
            let guard = self.bpm.fetch_page(child)?;
            guard.write().tree_set_parent_page_id(sibling_id);
        }
        self.insert_into_parent(node_id, separator, sibling_id)
    }

    /// Links `right` (with `separator`) into `left`'s parent, splitting
    /// upward as needed and growing a new root at the top.
    fn insert_into_parent(
        &mut self,
        left_id: PageId,
        separator: Vec<u8>,
        right_id: PageId,
    ) -> io::Result<()> {
        let parent_id = {
            let guard = self.bpm.fetch_page(left_id)?;
            let __result = guard.read().tree_parent_page_id();
            __result
        };

        if parent_id == INVALID_PAGE_ID {
            let root_id = {
                let guard = self.bpm.new_page()?;
                let root_id = guard.page_id();
                let mut page = guard.write();
                page.tree_init_internal(
                    root_id,
                    INVALID_PAGE_ID,
                    self.km.key_size() as u32,
                    self.internal_max_size,
                );
                page.internal_populate_new_root(left_id, &separator, right_id);
                root_id
            };
            for child in [left_id, right_id] {
                let guard = self.bpm.fetch_page(child)?;
                guard.write().tree_set_parent_page_id(root_id);
            }
            self.root_page_id = root_id;
            return self.update_root_page_id(false);
        }

        let new_size = {
            let parent_guard = self.bpm.fetch_page(parent_id)?;
            {
                let right_guard = self.bpm.fetch_page(right_id)?;
                right_guard.write().tree_set_parent_page_id(parent_id);
            }
            let mut parent = parent_guard.write();
            parent.internal_insert_after(left_id, &separator, right_id)
        };
        if new_size > self.internal_capacity() {
            self.split_internal(parent_id)?;
        }
        Ok(())
    }

    /// Rebalances an under-full non-root node against a sibling: merge when
    /// both fit in one node, otherwise move one entry across the boundary.
    fn coalesce_or_redistribute(&mut self, node_id: PageId) -> io::Result<()> {
        if node_id == self.root_page_id {
            return self.adjust_root();
        }

        let (parent_id, is_leaf, node_size) = {
            let guard = self.bpm.fetch_page(node_id)?;
            let page = guard.read();
            (page.tree_parent_page_id(), page.tree_is_leaf(), page.tree_size())
        };

        let (index, parent_size) = {
            let guard = self.bpm.fetch_page(parent_id)?;
            let parent = guard.read();
            let index = parent
                .internal_value_index(node_id)
                .expect("node missing from its parent");
            (index, parent.tree_size())
        };

        // A leaf's smallest key may have changed before we got here; keep
        // the parent separator honest first.
        if is_leaf && index > 0 && node_size > 0 {
            let first_key = {
                let guard = self.bpm.fetch_page(node_id)?;
                let __result = guard.read().tree_key_at(0).to_vec();
                __result
            };
            let guard = self.bpm.fetch_page(parent_id)?;
            guard.write().tree_set_key_at(index, &first_key);
        }

        let capacity = if is_leaf {
            self.leaf_max_size
        } else {
            self.internal_capacity()
        };
        let sibling_size = |tree: &Self, sibling_id: PageId| -> io::Result<u32> {
            let guard = tree.bpm.fetch_page(sibling_id)?;
            let size = guard.read().tree_size();
            Ok(size)
        };

        if index == 0 {
            // Leftmost child: the only sibling is on the right.
            let right_id = {
                let guard = self.bpm.fetch_page(parent_id)?;
                let __result = guard.read().internal_value_at(1);
                __result
            };
            if node_size + sibling_size(self, right_id)? <= capacity {
                self.merge(node_id, right_id, parent_id, 1)
            } else {
                self.redistribute_from_right(node_id, right_id, parent_id, 1)
            }
        } else {
            let left_id = {
                let guard = self.bpm.fetch_page(parent_id)?;
                let __result = guard.read().internal_value_at(index - 1);
                __result
            };
            if node_size + sibling_size(self, left_id)? <= capacity {
                return self.merge(left_id, node_id, parent_id, index);
            }
            if index + 1 < parent_size {
                let right_id = {
                    let guard = self.bpm.fetch_page(parent_id)?;
                    let __result = guard.read().internal_value_at(index + 1);
                    __result
                };
                if node_size + sibling_size(self, right_id)? <= capacity {
                    return self.merge(node_id, right_id, parent_id, index + 1);
                }
            }
            self.redistribute_from_left(node_id, left_id, parent_id, index)
        }
    }

    /// Folds `right` into `left` and drops `right`'s separator from the
    /// parent, recursing when the parent under-flows.
    fn merge(
        &mut self,
        left_id: PageId,
        right_id: PageId,
        parent_id: PageId,
        right_index: u32,
    ) -> io::Result<()> {
        let middle_key = {
            let guard = self.bpm.fetch_page(parent_id)?;
            let __result = guard.read().tree_key_at(right_index).to_vec();
            __result
        };

        let moved_children = {
            let left_guard = self.bpm.fetch_page(left_id)?;
            let right_guard = self.bpm.fetch_page(right_id)?;
            let mut left = left_guard.write();
            let mut right = right_guard.write();
            let left_size = left.tree_size();
            let right_size = right.tree_size();
            let moved = if left.tree_is_leaf() {
                left.tree_copy_pairs_from(&right, 0, left_size, right_size);
                left.tree_set_size(left_size + right_size);
                left.leaf_set_next_page_id(right.leaf_next_page_id());
                Vec::new()
            } else {
                // The parent's separator comes down as the first moved key.
                right.tree_set_key_at(0, &middle_key);
                left.tree_copy_pairs_from(&right, 0, left_size, right_size);
                left.tree_set_size(left_size + right_size);
                (0..right_size).map(|i| right.internal_value_at(i)).collect()
            };
            right.tree_set_size(0);
            moved
        };
        for child in moved_children {
            let guard = self.bpm.fetch_page(child)?;
            guard.write().tree_set_parent_page_id(left_id);
        }
        self.bpm.delete_page(right_id)?;

        let (parent_size, parent_min) = {
            let guard = self.bpm.fetch_page(parent_id)?;
            let mut parent = guard.write();
            parent.internal_remove_at(right_index);
            (parent.tree_size(), parent.tree_min_size())
        };
        crate::strata_debug_log!(
            "[BPlusTree::merge] Folded page {right_id} into {left_id}, parent {parent_id} now {parent_size}"
        );

        if parent_id == self.root_page_id {
            if parent_size == 1 {
                return self.adjust_root();
            }
        } else if parent_size < parent_min {
            return self.coalesce_or_redistribute(parent_id);
        }
        Ok(())
    }

    /// Moves the right sibling's first entry onto the end of `node`.
    fn redistribute_from_right(
        &mut self,
        node_id: PageId,
        sibling_id: PageId,
        parent_id: PageId,
        sibling_index: u32,
    ) -> io::Result<()> {
        let mut reparented = None;
        let new_separator = {
            let node_guard = self.bpm.fetch_page(node_id)?;
            let sibling_guard = self.bpm.fetch_page(sibling_id)?;
            let mut node = node_guard.write();
            let mut sibling = sibling_guard.write();
            if node.tree_is_leaf() {
                let key = sibling.tree_key_at(0).to_vec();
                let value = sibling.leaf_value_at(0);
                let at = node.tree_size();
                node.leaf_insert_at(at, &key, value);
                sibling.leaf_remove_at(0);
                sibling.tree_key_at(0).to_vec()
            } else {
                // The old separator comes down with the sibling's first
                // child; the sibling's next key goes up in its place.
                let middle_key = {
                    let guard = self.bpm.fetch_page(parent_id)?;
                    let __result = guard.read().tree_key_at(sibling_index).to_vec();
                    __result
                };
                let moved_child = sibling.internal_value_at(0);
                let promoted = sibling.tree_key_at(1).to_vec();
                let at = node.tree_size();
                node.internal_insert_at(at, &middle_key, moved_child);
                sibling.internal_remove_at(0);
                reparented = Some(moved_child);
                promoted
            }
        };
        if let Some(child) = reparented {
            let guard = self.bpm.fetch_page(child)?;
            guard.write().tree_set_parent_page_id(node_id);
        }
        let guard = self.bpm.fetch_page(parent_id)?;
        guard.write().tree_set_key_at(sibling_index, &new_separator);
        Ok(())
    }

    /// Moves the left sibling's last entry onto the front of `node`.
    fn redistribute_from_left(
        &mut self,
        node_id: PageId,
        sibling_id: PageId,
        parent_id: PageId,
        node_index: u32,
    ) -> io::Result<()> {
        let mut reparented = None;
        let new_separator = {
            let node_guard = self.bpm.fetch_page(node_id)?;
            let sibling_guard = self.bpm.fetch_page(sibling_id)?;
            let mut node = node_guard.write();
            let mut sibling = sibling_guard.write();
            let last = sibling.tree_size() - 1;
            if node.tree_is_leaf() {
                let key = sibling.tree_key_at(last).to_vec();
                let value = sibling.leaf_value_at(last);
                sibling.tree_set_size(last);
                node.leaf_insert_at(0, &key, value);
                key
            } else {
                let middle_key = {
                    let guard = self.bpm.fetch_page(parent_id)?;
                    let __result = guard.read().tree_key_at(node_index).to_vec();
                    __result
                };
                let moved_child = sibling.internal_value_at(last);
                let promoted = sibling.tree_key_at(last).to_vec();
                sibling.tree_set_size(last);
                // The moved child becomes slot 0; the old separator slides
                // down to bound the node's former first child.
                let dummy = vec![0u8; self.km.key_size()];
                node.internal_insert_at(0, &dummy, moved_child);
                node.tree_set_key_at(1, &middle_key);
                reparented = Some(moved_child);
                promoted
            }
        };
        if let Some(child) = reparented {
            let guard = self.bpm.fetch_page(child)?;
            guard.write().tree_set_parent_page_id(node_id);
        }
        let guard = self.bpm.fetch_page(parent_id)?;
        guard.write().tree_set_key_at(node_index, &new_separator);
        Ok(())
    }

    /// Shrinks the root after a delete: an internal root left with a single
    /// child hands the root over to it; an empty leaf root empties the tree.
    fn adjust_root(&mut self) -> io::Result<()> {
        let root_id = self.root_page_id;
        let (is_leaf, size, only_child) = {
            let guard = self.bpm.fetch_page(root_id)?;
            let page = guard.read();
            let only_child = if page.tree_is_leaf() {
                INVALID_PAGE_ID
            } else {
                page.internal_value_at(0)
            };
            (page.tree_is_leaf(), page.tree_size(), only_child)
        };

        if !is_leaf && size == 1 {
            self.root_page_id = only_child;
            self.update_root_page_id(false)?;
            {
                let guard = self.bpm.fetch_page(only_child)?;
                guard.write().tree_set_parent_page_id(INVALID_PAGE_ID);
            }
            self.bpm.delete_page(root_id)?;
        } else if is_leaf && size == 0 {
            self.root_page_id = INVALID_PAGE_ID;
            self.update_root_page_id(false)?;
            self.bpm.delete_page(root_id)?;
        }
        Ok(())
    }

    /// Copies a node's new first key into its parent separator slot.
    fn refresh_parent_separator(&mut self, node_id: PageId) -> io::Result<()> {
        let (parent_id, first_key) = {
            let guard = self.bpm.fetch_page(node_id)?;
            let page = guard.read();
            if page.tree_size() == 0 {
                return Ok(());
            }
            (page.tree_parent_page_id(), page.tree_key_at(0).to_vec())
        };
        if parent_id == INVALID_PAGE_ID {
            return Ok(());
        }
        let guard = self.bpm.fetch_page(parent_id)?;
        let mut parent = guard.write();
        if let Some(index) = parent.internal_value_index(node_id) {
            if index > 0 {
                parent.tree_set_key_at(index, &first_key);
            }
        }
        Ok(())
    }

    /// Mirrors the current root into the index-roots page. `insert_record`
    /// registers a brand-new index; either way the latest root wins.
    fn update_root_page_id(&self, insert_record: bool) -> io::Result<()> {
        let guard = self.bpm.fetch_page(INDEX_ROOTS_PAGE_ID)?;
        let mut roots = guard.write();
        if insert_record {
            if !roots.roots_insert(self.index_id, self.root_page_id) {
                roots.roots_update(self.index_id, self.root_page_id);
            }
        } else if !roots.roots_update(self.index_id, self.root_page_id) {
            roots.roots_insert(self.index_id, self.root_page_id);
        }
        Ok(())
    }
}

/// Forward iterator over leaf entries; pins at most one leaf at a time.
pub struct IndexIterator {
    bpm: Arc<BufferPoolManager>,
    page_id: PageId,
    index: u32,
}

impl IndexIterator {
    fn exhausted(bpm: Arc<BufferPoolManager>) -> IndexIterator {
        IndexIterator {
            bpm,
            page_id: INVALID_PAGE_ID,
            index: 0,
        }
    }
}

impl Iterator for IndexIterator {
    type Item = io::Result<(Vec<u8>, RowId)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.page_id == INVALID_PAGE_ID {
                return None;
            }
            let guard = match self.bpm.fetch_page(self.page_id) {
                Ok(guard) => guard,
                Err(err) => {
                    self.page_id = INVALID_PAGE_ID;
                    return Some(Err(err));
                }
            };
            let page = guard.read();
            if self.index < page.tree_size() {
                let pair = (
                    page.tree_key_at(self.index).to_vec(),
                    page.leaf_value_at(self.index),
                );
                self.index += 1;
                return Some(Ok(pair));
            }
            self.page_id = page.leaf_next_page_id();
            self.index = 0;
        }
    }
}
