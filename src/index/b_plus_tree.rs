use anyhow::{bail, Result};
use log::debug;

use crate::buffer_pool::ArcBufferPool;
use crate::errors::Error;
use crate::index::index_iterator::IndexIterator;
use crate::index::key_manager::KeyManager;
use crate::pages::b_plus_tree_internal_page::{internal_capacity, BTreeInternalPage};
use crate::pages::b_plus_tree_leaf_page::{leaf_capacity, BTreeLeafPage};
use crate::pages::b_plus_tree_page::BTreePage;
use crate::pages::index_roots_page::IndexRootsPage;
use crate::pages::{PageId, PageRef, INDEX_ROOTS_PAGE_ID, INVALID_PAGE_ID};
use crate::record::{Row, RowId};

/// Unique-key B+ tree persisted one node per page. The current root is
/// registered in the shared index-roots page under this tree's index id;
/// every pin goes through the buffer pool and every mutated page is
/// unpinned dirty.
pub struct BPlusTree {
    index_id: u32,
    bpm: ArcBufferPool,
    km: KeyManager,
    root_page_id: PageId,
    leaf_max_size: u32,
    internal_max_size: u32,
}

impl BPlusTree {
    /// Open (or lazily create on first insert) the tree registered under
    /// `index_id`. Max sizes default to the page capacity for this key
    /// width; tests pass small values to force structural changes.
    pub fn new(
        index_id: u32,
        bpm: ArcBufferPool,
        km: KeyManager,
        leaf_max_size: Option<u32>,
        internal_max_size: Option<u32>,
    ) -> Result<Self> {
        let leaf_max_size = leaf_max_size.unwrap_or_else(|| leaf_capacity(km.key_size()));
        let internal_max_size =
            internal_max_size.unwrap_or_else(|| internal_capacity(km.key_size()));

        let page = bpm.lock().fetch_page(INDEX_ROOTS_PAGE_ID)?;
        let root_page_id = {
            let guard = page.read();
            IndexRootsPage::new(&*guard)
                .root_id(index_id)
                .unwrap_or(INVALID_PAGE_ID)
        };
        bpm.lock().unpin_page(INDEX_ROOTS_PAGE_ID, false);

        Ok(BPlusTree {
            index_id,
            bpm,
            km,
            root_page_id,
            leaf_max_size,
            internal_max_size,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.root_page_id == INVALID_PAGE_ID
    }

    pub fn root_page_id(&self) -> PageId {
        self.root_page_id
    }

    pub fn key_manager(&self) -> &KeyManager {
        &self.km
    }

    /// Point lookup.
    pub fn get_value(&self, key: &Row) -> Result<Option<RowId>> {
        if self.is_empty() {
            return Ok(None);
        }
        let encoded = self.km.encode(key);
        let page = self.find_leaf(Some(&encoded))?;
        let value = {
            let guard = page.read();
            BTreeLeafPage::new(&*guard).lookup(&encoded, &self.km)
        };
        self.bpm.lock().unpin_page(page.page_id(), false);
        Ok(value)
    }

    /// Insert a unique key. Fails with [`Error::DuplicateKey`] if present.
    pub fn insert(&mut self, key: &Row, value: RowId) -> Result<()> {
        let encoded = self.km.encode(key);
        if self.is_empty() {
            return self.start_new_tree(&encoded, value);
        }
        self.insert_into_leaf(&encoded, value)
    }

    fn start_new_tree(&mut self, key: &[u8], value: RowId) -> Result<()> {
        let page = self.bpm.lock().new_page()?;
        let page_id = page.page_id();
        {
            let mut guard = page.write();
            let mut leaf = BTreeLeafPage::new(&mut *guard);
            leaf.init(
                page_id,
                INVALID_PAGE_ID,
                self.km.key_size(),
                self.leaf_max_size,
            );
            leaf.insert(key, value, &self.km);
        }
        self.bpm.lock().unpin_page(page_id, true);

        self.root_page_id = page_id;
        self.register_root()?;
        debug!("index {}: new root leaf {page_id}", self.index_id);
        Ok(())
    }

    fn insert_into_leaf(&mut self, key: &[u8], value: RowId) -> Result<()> {
        let page = self.find_leaf(Some(key))?;
        let leaf_id = page.page_id();

        let mut split = None;
        {
            let mut guard = page.write();
            let mut leaf = BTreeLeafPage::new(&mut *guard);
            if leaf.lookup(key, &self.km).is_some() {
                drop(guard);
                self.bpm.lock().unpin_page(leaf_id, false);
                bail!(Error::DuplicateKey);
            }

            let size = leaf.insert(key, value, &self.km);
            if size > leaf.max_size() {
                let sibling_page = self.bpm.lock().new_page()?;
                let sibling_id = sibling_page.page_id();
                let mut sibling_guard = sibling_page.write();
                let mut sibling = BTreeLeafPage::new(&mut *sibling_guard);
                sibling.init(
                    sibling_id,
                    leaf.parent_page_id(),
                    self.km.key_size(),
                    self.leaf_max_size,
                );
                leaf.move_half_to(&mut sibling);
                // splice into the leaf chain
                sibling.set_next_page_id(leaf.next_page_id());
                leaf.set_next_page_id(sibling_id);

                split = Some((sibling.key_at(0).to_vec(), sibling_id, leaf.parent_page_id()));
            }
        }
        self.bpm.lock().unpin_page(leaf_id, true);

        if let Some((separator, sibling_id, parent_id)) = split {
            self.bpm.lock().unpin_page(sibling_id, true);
            debug!(
                "index {}: leaf {leaf_id} split, new sibling {sibling_id}",
                self.index_id
            );
            self.insert_into_parent(leaf_id, parent_id, &separator, sibling_id)?;
        }
        Ok(())
    }

    /// Propagate `(separator, new_node)` into the parent of `old_node`,
    /// splitting upward as long as parents overflow.
    fn insert_into_parent(
        &mut self,
        old_id: PageId,
        parent_id: PageId,
        key: &[u8],
        new_id: PageId,
    ) -> Result<()> {
        if parent_id == INVALID_PAGE_ID {
            // the old node was the root: grow the tree by one level
            let root_page = self.bpm.lock().new_page()?;
            let root_id = root_page.page_id();
            {
                let mut guard = root_page.write();
                let mut root = BTreeInternalPage::new(&mut *guard);
                root.init(
                    root_id,
                    INVALID_PAGE_ID,
                    self.km.key_size(),
                    self.internal_max_size,
                );
                root.populate_new_root(old_id, key, new_id);
            }
            self.bpm.lock().unpin_page(root_id, true);

            self.reparent(&[old_id, new_id], root_id)?;
            self.root_page_id = root_id;
            self.register_root()?;
            debug!("index {}: new root {root_id}", self.index_id);
            return Ok(());
        }

        let page = self.bpm.lock().fetch_page(parent_id)?;
        let mut split = None;
        {
            let mut guard = page.write();
            let mut parent = BTreeInternalPage::new(&mut *guard);
            let size = parent.insert_node_after(old_id, key, new_id);

            if size > parent.max_size() {
                let sibling_page = self.bpm.lock().new_page()?;
                let sibling_id = sibling_page.page_id();
                let mut sibling_guard = sibling_page.write();
                let mut sibling = BTreeInternalPage::new(&mut *sibling_guard);
                sibling.init(
                    sibling_id,
                    parent.parent_page_id(),
                    self.km.key_size(),
                    self.internal_max_size,
                );
                let (separator, adopted) = parent.move_half_to(&mut sibling);
                split = Some((separator, sibling_id, parent.parent_page_id(), adopted));
            }
        }
        self.bpm.lock().unpin_page(parent_id, true);

        if let Some((separator, sibling_id, grandparent_id, adopted)) = split {
            self.bpm.lock().unpin_page(sibling_id, true);
            self.reparent(&adopted, sibling_id)?;
            debug!(
                "index {}: internal {parent_id} split, new sibling {sibling_id}",
                self.index_id
            );
            self.insert_into_parent(parent_id, grandparent_id, &separator, sibling_id)?;
        }
        Ok(())
    }

    /// Remove a key. Fails with [`Error::KeyNotFound`] when absent.
    pub fn remove(&mut self, key: &Row) -> Result<()> {
        if self.is_empty() {
            bail!(Error::KeyNotFound);
        }
        let encoded = self.km.encode(key);
        let page = self.find_leaf(Some(&encoded))?;
        let leaf_id = page.page_id();

        let (new_size, min_size, parent_id) = {
            let mut guard = page.write();
            let mut leaf = BTreeLeafPage::new(&mut *guard);
            match leaf.remove_record(&encoded, &self.km) {
                None => {
                    drop(guard);
                    self.bpm.lock().unpin_page(leaf_id, false);
                    bail!(Error::KeyNotFound);
                }
                Some(size) => (size, leaf.min_size(), leaf.parent_page_id()),
            }
        };
        self.bpm.lock().unpin_page(leaf_id, true);

        if parent_id == INVALID_PAGE_ID {
            // a root leaf may shrink freely; an empty one ends the tree
            if new_size == 0 {
                self.bpm.lock().delete_page(leaf_id)?;
                self.root_page_id = INVALID_PAGE_ID;
                self.register_root()?;
                debug!("index {}: tree emptied", self.index_id);
            }
            return Ok(());
        }
        if new_size < min_size {
            self.coalesce_or_redistribute(leaf_id)?;
        }
        Ok(())
    }

    /// Bring an underflowing node back within bounds by borrowing from or
    /// merging with a sibling, recursing when the parent underflows in
    /// turn.
    fn coalesce_or_redistribute(&mut self, page_id: PageId) -> Result<()> {
        // every page stays pinned until redistribute/coalesce hands it back
        let page = self.bpm.lock().fetch_page(page_id)?;
        let (is_leaf, size, max_size, parent_id) = {
            let guard = page.read();
            let header = BTreePage::new(&*guard);
            (
                header.is_leaf(),
                header.size(),
                header.max_size(),
                header.parent_page_id(),
            )
        };

        if parent_id == INVALID_PAGE_ID {
            self.bpm.lock().unpin_page(page_id, false);
            return self.adjust_root(page_id);
        }

        // prefer the left sibling; only the leftmost child borrows right
        let parent_page = self.bpm.lock().fetch_page(parent_id)?;
        let (index, neighbor_id) = {
            let guard = parent_page.read();
            let parent = BTreeInternalPage::new(&*guard);
            let index = parent
                .value_index(page_id)
                .expect("node missing from its parent");
            let neighbor_index = if index == 0 { 1 } else { index - 1 };
            (index, parent.value_at(neighbor_index))
        };

        let neighbor_page = self.bpm.lock().fetch_page(neighbor_id)?;
        let neighbor_size = {
            let guard = neighbor_page.read();
            BTreePage::new(&*guard).size()
        };

        if neighbor_size + size > max_size {
            self.redistribute(page, neighbor_page, parent_page, is_leaf, index)
        } else {
            self.coalesce(page, neighbor_page, parent_page, is_leaf, index)
        }
    }

    /// Shift one entry across the sibling boundary and rewrite the parent
    /// separator.
    fn redistribute(
        &mut self,
        node_page: PageRef,
        neighbor_page: PageRef,
        parent_page: PageRef,
        is_leaf: bool,
        index: u32,
    ) -> Result<()> {
        let node_id = node_page.page_id();
        let neighbor_id = neighbor_page.page_id();
        let parent_id = parent_page.page_id();
        // the separator slot between node and neighbor
        let separator_slot = if index == 0 { 1 } else { index };

        let mut adopted = None;
        let new_separator;
        if is_leaf {
            let mut node_guard = node_page.write();
            let mut neighbor_guard = neighbor_page.write();
            let mut node = BTreeLeafPage::new(&mut *node_guard);
            let mut neighbor = BTreeLeafPage::new(&mut *neighbor_guard);
            if index == 0 {
                neighbor.move_first_to_end_of(&mut node);
                new_separator = neighbor.key_at(0).to_vec();
            } else {
                neighbor.move_last_to_front_of(&mut node);
                new_separator = node.key_at(0).to_vec();
            }
        } else {
            let middle_key = {
                let guard = parent_page.read();
                BTreeInternalPage::new(&*guard)
                    .key_at(separator_slot)
                    .to_vec()
            };
            let mut node_guard = node_page.write();
            let mut neighbor_guard = neighbor_page.write();
            let mut node = BTreeInternalPage::new(&mut *node_guard);
            let mut neighbor = BTreeInternalPage::new(&mut *neighbor_guard);
            if index == 0 {
                // separator becomes the moved child's key in the parent
                new_separator = neighbor.key_at(1).to_vec();
                adopted = Some(neighbor.move_first_to_end_of(&mut node, &middle_key));
            } else {
                new_separator = neighbor.key_at(neighbor.size() - 1).to_vec();
                adopted = Some(neighbor.move_last_to_front_of(&mut node, &middle_key));
            }
        }

        {
            let mut guard = parent_page.write();
            let mut parent = BTreeInternalPage::new(&mut *guard);
            parent.set_key_at(separator_slot, &new_separator);
        }

        let mut bpm = self.bpm.lock();
        bpm.unpin_page(node_id, true);
        bpm.unpin_page(neighbor_id, true);
        bpm.unpin_page(parent_id, true);
        drop(bpm);

        if let Some(child) = adopted {
            self.reparent(&[child], node_id)?;
        }
        Ok(())
    }

    /// Merge node and sibling into the left of the two, drop the separator
    /// from the parent and free the emptied page.
    fn coalesce(
        &mut self,
        node_page: PageRef,
        neighbor_page: PageRef,
        parent_page: PageRef,
        is_leaf: bool,
        index: u32,
    ) -> Result<()> {
        let node_id = node_page.page_id();
        let neighbor_id = neighbor_page.page_id();
        let parent_id = parent_page.page_id();

        // merge right-into-left: at slot 0 the neighbor is our right sibling
        let (left_page, right_page, removed_slot) = if index == 0 {
            (&node_page, &neighbor_page, 1)
        } else {
            (&neighbor_page, &node_page, index)
        };
        let left_id = left_page.page_id();
        let right_id = right_page.page_id();

        let mut adopted = vec![];
        if is_leaf {
            let mut left_guard = left_page.write();
            let mut right_guard = right_page.write();
            let mut left = BTreeLeafPage::new(&mut *left_guard);
            let mut right = BTreeLeafPage::new(&mut *right_guard);
            right.move_all_to(&mut left);
        } else {
            let middle_key = {
                let guard = parent_page.read();
                BTreeInternalPage::new(&*guard).key_at(removed_slot).to_vec()
            };
            let mut left_guard = left_page.write();
            let mut right_guard = right_page.write();
            let mut left = BTreeInternalPage::new(&mut *left_guard);
            let mut right = BTreeInternalPage::new(&mut *right_guard);
            adopted = right.move_all_to(&mut left, &middle_key);
        }

        let (parent_size, parent_min, grandparent_id) = {
            let mut guard = parent_page.write();
            let mut parent = BTreeInternalPage::new(&mut *guard);
            parent.remove(removed_slot);
            (parent.size(), parent.min_size(), parent.parent_page_id())
        };

        let mut bpm = self.bpm.lock();
        bpm.unpin_page(left_id, true);
        bpm.unpin_page(right_id, false);
        bpm.unpin_page(parent_id, true);
        bpm.delete_page(right_id)?;
        drop(bpm);

        self.reparent(&adopted, left_id)?;
        debug!(
            "index {}: node {right_id} coalesced into {left_id}",
            self.index_id
        );

        if grandparent_id == INVALID_PAGE_ID {
            if parent_size == 1 {
                return self.adjust_root(parent_id);
            }
        } else if parent_size < parent_min {
            return self.coalesce_or_redistribute(parent_id);
        }
        Ok(())
    }

    /// Shrink the tree at the top: a one-child internal root is replaced
    /// by that child.
    fn adjust_root(&mut self, root_id: PageId) -> Result<()> {
        let page = self.bpm.lock().fetch_page(root_id)?;
        let new_root = {
            let mut guard = page.write();
            let header = BTreePage::new(&*guard);
            if !header.is_leaf() && header.size() == 1 {
                let mut root = BTreeInternalPage::new(&mut *guard);
                Some(root.remove_and_return_only_child())
            } else {
                None
            }
        };

        let Some(new_root) = new_root else {
            self.bpm.lock().unpin_page(root_id, false);
            return Ok(());
        };

        let mut bpm = self.bpm.lock();
        bpm.unpin_page(root_id, false);
        bpm.delete_page(root_id)?;
        drop(bpm);

        let child_page = self.bpm.lock().fetch_page(new_root)?;
        {
            let mut guard = child_page.write();
            BTreePage::new(&mut *guard).set_parent_page_id(INVALID_PAGE_ID);
        }
        self.bpm.lock().unpin_page(new_root, true);

        self.root_page_id = new_root;
        self.register_root()?;
        debug!("index {}: root collapsed to {new_root}", self.index_id);
        Ok(())
    }

    /// Forward iterator over the whole tree.
    pub fn iter(&self) -> Result<IndexIterator> {
        if self.is_empty() {
            return Ok(IndexIterator::end(self.bpm.clone(), self.km.clone()));
        }
        let page = self.find_leaf(None)?;
        let page_id = page.page_id();
        self.bpm.lock().unpin_page(page_id, false);
        Ok(IndexIterator::new(self.bpm.clone(), self.km.clone(), page_id, 0))
    }

    /// Iterator positioned at the first key `>=` the given key.
    pub fn iter_from(&self, key: &Row) -> Result<IndexIterator> {
        if self.is_empty() {
            return Ok(IndexIterator::end(self.bpm.clone(), self.km.clone()));
        }
        let encoded = self.km.encode(key);
        let page = self.find_leaf(Some(&encoded))?;
        let page_id = page.page_id();
        let slot = {
            let guard = page.read();
            BTreeLeafPage::new(&*guard).key_index(&encoded, &self.km)
        };
        self.bpm.lock().unpin_page(page_id, false);
        Ok(IndexIterator::new(
            self.bpm.clone(),
            self.km.clone(),
            page_id,
            slot,
        ))
    }

    /// Free every page of the tree and drop its root registration.
    pub fn destroy(&mut self) -> Result<()> {
        if !self.is_empty() {
            self.destroy_subtree(self.root_page_id)?;
            self.root_page_id = INVALID_PAGE_ID;
        }
        let page = self.bpm.lock().fetch_page(INDEX_ROOTS_PAGE_ID)?;
        {
            let mut guard = page.write();
            IndexRootsPage::new(&mut *guard).remove(self.index_id);
        }
        self.bpm.lock().unpin_page(INDEX_ROOTS_PAGE_ID, true);
        Ok(())
    }

    fn destroy_subtree(&mut self, page_id: PageId) -> Result<()> {
        let page = self.bpm.lock().fetch_page(page_id)?;
        let children = {
            let guard = page.read();
            let header = BTreePage::new(&*guard);
            if header.is_leaf() {
                vec![]
            } else {
                BTreeInternalPage::new(&*guard).children()
            }
        };
        self.bpm.lock().unpin_page(page_id, false);
        for child in children {
            self.destroy_subtree(child)?;
        }
        self.bpm.lock().delete_page(page_id)?;
        Ok(())
    }

    /// Descend to the leaf that owns `key`, or the leftmost leaf when no
    /// key is given. The returned page is pinned.
    fn find_leaf(&self, key: Option<&[u8]>) -> Result<PageRef> {
        let mut page_id = self.root_page_id;
        loop {
            let page = self.bpm.lock().fetch_page(page_id)?;
            let next = {
                let guard = page.read();
                let header = BTreePage::new(&*guard);
                if header.is_leaf() {
                    None
                } else {
                    let internal = BTreeInternalPage::new(&*guard);
                    Some(match key {
                        Some(key) => internal.lookup(key, &self.km),
                        None => internal.value_at(0),
                    })
                }
            };
            match next {
                None => return Ok(page),
                Some(child) => {
                    self.bpm.lock().unpin_page(page_id, false);
                    page_id = child;
                }
            }
        }
    }

    fn reparent(&self, children: &[PageId], parent_id: PageId) -> Result<()> {
        for &child in children {
            let page = self.bpm.lock().fetch_page(child)?;
            {
                let mut guard = page.write();
                BTreePage::new(&mut *guard).set_parent_page_id(parent_id);
            }
            self.bpm.lock().unpin_page(child, true);
        }
        Ok(())
    }

    /// Record the current root under our index id, creating the entry on
    /// first registration.
    fn register_root(&self) -> Result<()> {
        let page = self.bpm.lock().fetch_page(INDEX_ROOTS_PAGE_ID)?;
        {
            let mut guard = page.write();
            let mut roots = IndexRootsPage::new(&mut *guard);
            if !roots.update(self.index_id, self.root_page_id) {
                roots.insert(self.index_id, self.root_page_id);
            }
        }
        self.bpm.lock().unpin_page(INDEX_ROOTS_PAGE_ID, true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::tests::test_arc_bpm;
    use crate::pages::b_plus_tree_page::BTreePageType;
    use crate::record::{Column, Field, Schema, TypeId};
    use rand::seq::SliceRandom;
    use rand::thread_rng;
    use tempfile::TempDir;

    fn int_key(v: i32) -> Row {
        Row::new(vec![Field::Int(v)])
    }

    fn rid(v: i32) -> RowId {
        RowId::new(v, v as u32)
    }

    fn setup(pool_size: usize, leaf_max: u32, internal_max: u32) -> (TempDir, BPlusTree) {
        let (dir, bpm) = test_arc_bpm(pool_size);
        // reserve the catalog meta and index roots pages
        {
            let mut guard = bpm.lock();
            for expected in [0, 1] {
                let page = guard.new_page().unwrap();
                assert_eq!(page.page_id(), expected);
                guard.unpin_page(expected, false);
            }
        }
        let km = KeyManager::new(Schema::new(vec![Column::new(
            "id",
            TypeId::Int,
            0,
            false,
            true,
        )]));
        let tree = BPlusTree::new(0, bpm, km, Some(leaf_max), Some(internal_max)).unwrap();
        (dir, tree)
    }

    /// Walk the whole tree checking ordering, fill and parent invariants.
    fn check_integrity(tree: &BPlusTree) {
        if tree.is_empty() {
            return;
        }
        check_node(tree, tree.root_page_id, INVALID_PAGE_ID);
        assert!(tree.bpm.lock().all_unpinned(), "leaked pins after check");
    }

    fn check_node(tree: &BPlusTree, page_id: PageId, expected_parent: PageId) {
        let page = tree.bpm.lock().fetch_page(page_id).unwrap();
        let guard = page.read();
        let header = BTreePage::new(&*guard);
        assert_eq!(header.parent_page_id(), expected_parent);
        if expected_parent != INVALID_PAGE_ID {
            assert!(header.size() >= header.min_size(), "underfull node");
        }
        assert!(header.size() <= header.max_size(), "overfull node");

        let children = if header.is_leaf() {
            let leaf = BTreeLeafPage::new(&*guard);
            for i in 1..leaf.size() {
                assert_eq!(
                    tree.km.compare(leaf.key_at(i - 1), leaf.key_at(i)),
                    std::cmp::Ordering::Less
                );
            }
            vec![]
        } else {
            let internal = BTreeInternalPage::new(&*guard);
            for i in 2..internal.size() {
                assert_eq!(
                    tree.km.compare(internal.key_at(i - 1), internal.key_at(i)),
                    std::cmp::Ordering::Less
                );
            }
            internal.children()
        };
        drop(guard);
        tree.bpm.lock().unpin_page(page_id, false);

        for child in children {
            check_node(tree, child, page_id);
        }
    }

    fn collect(tree: &BPlusTree) -> Vec<i32> {
        tree.iter()
            .unwrap()
            .map(|(key, _)| match key.field(0) {
                Field::Int(v) => *v,
                _ => unreachable!(),
            })
            .collect()
    }

    #[test]
    fn test_insert_and_get() {
        let (_dir, mut tree) = setup(16, 4, 4);
        for v in [5, 1, 3, 2, 4] {
            tree.insert(&int_key(v), rid(v)).unwrap();
        }
        for v in 1..=5 {
            assert_eq!(tree.get_value(&int_key(v)).unwrap(), Some(rid(v)));
        }
        assert_eq!(tree.get_value(&int_key(99)).unwrap(), None);
        check_integrity(&tree);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let (_dir, mut tree) = setup(16, 4, 4);
        tree.insert(&int_key(7), rid(7)).unwrap();
        let err = tree.insert(&int_key(7), rid(8)).unwrap_err();
        assert_eq!(err.downcast::<Error>().unwrap(), Error::DuplicateKey);
        assert!(tree.bpm.lock().all_unpinned());
    }

    #[test]
    fn test_fifth_insert_splits_leaf() {
        let (_dir, mut tree) = setup(16, 4, 4);
        for v in 1..=5 {
            tree.insert(&int_key(v), rid(v)).unwrap();
        }

        // root must now be internal with a single separator of 3
        let root_id = tree.root_page_id();
        let page = tree.bpm.lock().fetch_page(root_id).unwrap();
        let (left_id, right_id) = {
            let guard = page.read();
            let root = BTreeInternalPage::new(&*guard);
            assert_eq!(
                BTreePage::new(&*guard).page_type(),
                BTreePageType::Internal
            );
            assert_eq!(root.size(), 2);
            assert_eq!(tree.km.decode(root.key_at(1)).field(0), &Field::Int(3));
            (root.value_at(0), root.value_at(1))
        };
        tree.bpm.lock().unpin_page(root_id, false);

        // left leaf {1,2} chained to right leaf {3,4,5}
        let page = tree.bpm.lock().fetch_page(left_id).unwrap();
        {
            let guard = page.read();
            let leaf = BTreeLeafPage::new(&*guard);
            assert_eq!(leaf.size(), 2);
            assert_eq!(leaf.next_page_id(), right_id);
        }
        tree.bpm.lock().unpin_page(left_id, false);

        let page = tree.bpm.lock().fetch_page(right_id).unwrap();
        {
            let guard = page.read();
            let leaf = BTreeLeafPage::new(&*guard);
            assert_eq!(leaf.size(), 3);
            assert_eq!(tree.km.decode(leaf.key_at(0)).field(0), &Field::Int(3));
        }
        tree.bpm.lock().unpin_page(right_id, false);

        assert_eq!(collect(&tree), vec![1, 2, 3, 4, 5]);
        check_integrity(&tree);
    }

    #[test]
    fn test_delete_coalesces_back_to_single_leaf() {
        let (_dir, mut tree) = setup(16, 4, 4);
        for v in 1..=5 {
            tree.insert(&int_key(v), rid(v)).unwrap();
        }
        tree.remove(&int_key(5)).unwrap();
        tree.remove(&int_key(4)).unwrap();

        // the right leaf underflowed and merged; the root collapsed
        let root_id = tree.root_page_id();
        let page = tree.bpm.lock().fetch_page(root_id).unwrap();
        {
            let guard = page.read();
            assert_eq!(BTreePage::new(&*guard).page_type(), BTreePageType::Leaf);
            assert_eq!(BTreeLeafPage::new(&*guard).size(), 3);
        }
        tree.bpm.lock().unpin_page(root_id, false);

        assert_eq!(collect(&tree), vec![1, 2, 3]);
        check_integrity(&tree);
    }

    #[test]
    fn test_remove_missing_key() {
        let (_dir, mut tree) = setup(16, 4, 4);
        let err = tree.remove(&int_key(1)).unwrap_err();
        assert_eq!(err.downcast::<Error>().unwrap(), Error::KeyNotFound);

        tree.insert(&int_key(1), rid(1)).unwrap();
        let err = tree.remove(&int_key(2)).unwrap_err();
        assert_eq!(err.downcast::<Error>().unwrap(), Error::KeyNotFound);
        assert!(tree.bpm.lock().all_unpinned());
    }

    #[test]
    fn test_insert_all_remove_all_returns_storage() {
        let (_dir, mut tree) = setup(32, 4, 4);
        let allocated_before = tree.bpm.lock().disk_manager().num_allocated_pages();

        let mut keys: Vec<i32> = (0..120).collect();
        keys.shuffle(&mut thread_rng());
        for &v in &keys {
            tree.insert(&int_key(v), rid(v)).unwrap();
        }
        check_integrity(&tree);
        assert_eq!(collect(&tree), (0..120).collect::<Vec<i32>>());

        keys.shuffle(&mut thread_rng());
        for &v in &keys {
            tree.remove(&int_key(v)).unwrap();
            check_integrity(&tree);
        }

        assert!(tree.is_empty());
        assert_eq!(tree.root_page_id(), INVALID_PAGE_ID);
        assert_eq!(
            tree.bpm.lock().disk_manager().num_allocated_pages(),
            allocated_before
        );
    }

    #[test]
    fn test_registry_survives_reopen_of_tree() {
        let (_dir, mut tree) = setup(16, 4, 4);
        for v in 1..=20 {
            tree.insert(&int_key(v), rid(v)).unwrap();
        }
        let root = tree.root_page_id();
        let bpm = tree.bpm.clone();
        let km = tree.km.clone();
        drop(tree);

        let tree = BPlusTree::new(0, bpm, km, Some(4), Some(4)).unwrap();
        assert_eq!(tree.root_page_id(), root);
        assert_eq!(tree.get_value(&int_key(13)).unwrap(), Some(rid(13)));
    }

    #[test]
    fn test_iter_from_positions_at_lower_bound() {
        let (_dir, mut tree) = setup(16, 4, 4);
        for v in [1, 3, 5, 7, 9] {
            tree.insert(&int_key(v), rid(v)).unwrap();
        }

        let from_existing: Vec<i32> = tree
            .iter_from(&int_key(5))
            .unwrap()
            .map(|(k, _)| match k.field(0) {
                Field::Int(v) => *v,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(from_existing, vec![5, 7, 9]);

        let from_gap: Vec<i32> = tree
            .iter_from(&int_key(4))
            .unwrap()
            .map(|(k, _)| match k.field(0) {
                Field::Int(v) => *v,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(from_gap, vec![5, 7, 9]);
        assert!(tree.bpm.lock().all_unpinned());
    }

    #[test]
    fn test_destroy_frees_every_page() {
        let (_dir, mut tree) = setup(32, 4, 4);
        let allocated_before = tree.bpm.lock().disk_manager().num_allocated_pages();
        for v in 0..100 {
            tree.insert(&int_key(v), rid(v)).unwrap();
        }
        tree.destroy().unwrap();
        assert!(tree.is_empty());
        assert_eq!(
            tree.bpm.lock().disk_manager().num_allocated_pages(),
            allocated_before
        );
    }

    #[test]
    fn test_empty_tree_iteration() {
        let (_dir, tree) = setup(8, 4, 4);
        assert_eq!(tree.iter().unwrap().count(), 0);
        assert_eq!(tree.get_value(&int_key(1)).unwrap(), None);
    }
}
