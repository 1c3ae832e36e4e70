//! Table lifecycle and every structural operation on the tree.
//!
//! An open table owns the pager and the header fields mirrored from page 0.
//! Inserts and deletes find a leaf through a cursor, mutate it in place,
//! then repair ancestors: splits propagate upward on overflow, borrows and
//! merges propagate upward on underflow. Page mutations become durable only
//! when [`Table::close`] flushes the pager.
//!
//! Internal nodes are always rewritten through [`rebuild_internal`], which
//! regenerates every separator key from the actual subtree maxima and
//! re-points child parent links. Keeping that one choke point is what makes
//! the borrow/merge shuffles safe to express as plain child-list edits.
use super::btree::{
    Node, NodeType, INTERNAL_NODE_MAX_CHILDREN, INTERNAL_NODE_MIN_KEYS, LEAF_NODE_MAX_CELLS,
    LEAF_NODE_MIN_CELLS,
};
use super::cursor::Cursor;
use super::pager::{
    decode_header, encode_header, DbHeader, Pager, HEADER_PAGE_NUM, TABLE_MAX_PAGES,
};
use super::row::Row;
use crate::errors::Error;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// An open single-table database.
pub struct Table {
    pub path: PathBuf,
    pub root_page_num: u32,
    pub num_rows: u32,
    /// Monotonic page allocator cursor. Pages are never reused within a
    /// session; deletions leave orphaned pages behind.
    pub next_free_page: u32,
    pub pager: Pager,
}

impl Table {
    /// Opens a database file, bootstrapping a fresh one when the file is
    /// empty: page 0 becomes the header, page 1 an empty leaf root.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let mut pager = Pager::open(&path)?;

        if pager.file_pages() == 0 {
            pager.fetch(HEADER_PAGE_NUM)?;
            pager.fetch(1)?;
            {
                let mut root = pager.get(1)?;
                root.init_leaf();
                root.set_root(true);
            }
            info!(path = %path.display(), "Initialized a fresh database");
            return Ok(Table {
                path,
                root_page_num: 1,
                num_rows: 0,
                next_free_page: 2,
                pager,
            });
        }

        pager.fetch(HEADER_PAGE_NUM)?;
        let header = {
            let page = pager.get(HEADER_PAGE_NUM)?;
            decode_header(&page.data)?
        };
        if header.root_page_num < 1
            || header.root_page_num >= header.next_free_page
            || header.next_free_page < 2
            || header.next_free_page as usize > TABLE_MAX_PAGES
        {
            return Err(err!(
                Corrupt,
                "Implausible db header (root={}, next_free={})",
                header.root_page_num,
                header.next_free_page
            ));
        }

        let mut table = Table {
            path,
            root_page_num: header.root_page_num,
            num_rows: header.num_rows,
            next_free_page: header.next_free_page,
            pager,
        };
        info!(
            path = %table.path.display(),
            num_rows = table.num_rows,
            root_page_num = table.root_page_num,
            "Opened database"
        );

        #[cfg(debug_assertions)]
        {
            let counted = count_leaf_cells(&mut table)?;
            debug_assert_eq!(
                counted, table.num_rows,
                "header row count does not match the leaf chain"
            );
        }

        Ok(table)
    }

    /// Writes the header back to page 0 and flushes every resident page.
    pub fn close(&mut self) -> Result<(), Error> {
        let header = DbHeader {
            num_rows: self.num_rows,
            root_page_num: self.root_page_num,
            next_free_page: self.next_free_page,
        };
        self.pager.fetch(HEADER_PAGE_NUM)?;
        {
            let mut page = self.pager.get(HEADER_PAGE_NUM)?;
            encode_header(&header, &mut page.data)?;
        }
        self.pager.flush_all()?;
        info!(path = %self.path.display(), num_rows = self.num_rows, "Closed database");
        Ok(())
    }
}

/// Hands out the next page number and makes the page resident.
fn alloc_page(table: &mut Table) -> Result<u32, Error> {
    let page_num = table.next_free_page;
    table.pager.fetch(page_num)?;
    table.next_free_page += 1;
    Ok(page_num)
}

/// Inserts a row keyed by its id, splitting the target leaf on overflow.
/// A row with an existing key is rejected before anything is touched.
pub fn insert_row(table: &mut Table, row: &Row) -> Result<(), Error> {
    let key = row.key();
    let row_bytes = row.serialize();
    debug!(key, "Inserting row");

    let (leaf_page, cell_num) = {
        let cursor = Cursor::find(table, key)?;
        (cursor.page_num, cursor.cell_num)
    };

    {
        let mut node = table.pager.get_or_fetch(leaf_page)?;
        let num_cells = node.leaf_num_cells();
        if cell_num < num_cells && node.leaf_key(cell_num)? == key {
            return Err(Error::DuplicateKey(key));
        }

        if (num_cells as usize) < LEAF_NODE_MAX_CELLS {
            // Make room for the new cell.
            for i in (cell_num..num_cells).rev() {
                let cell = node.leaf_cell(i)?.to_vec();
                node.leaf_cell_mut(i + 1)?.copy_from_slice(&cell);
            }
            node.set_leaf_num_cells(num_cells + 1);
            node.set_leaf_key(cell_num, key)?;
            node.set_leaf_value(cell_num, &row_bytes)?;
            table.num_rows += 1;
            return Ok(());
        }
    }

    leaf_split_insert(table, leaf_page, cell_num, key, &row_bytes)?;
    table.num_rows += 1;
    Ok(())
}

/// Deletes the row with `key`, rebalancing the leaf when it falls below the
/// minimum. A missing key is rejected before anything is touched.
pub fn delete_row(table: &mut Table, key: u32) -> Result<(), Error> {
    debug!(key, "Deleting row");

    let (leaf_page, cell_num) = {
        let cursor = Cursor::find(table, key)?;
        (cursor.page_num, cursor.cell_num)
    };

    let (remaining, is_root, deleted_max) = {
        let mut node = table.pager.get_or_fetch(leaf_page)?;
        let num_cells = node.leaf_num_cells();
        if cell_num >= num_cells || node.leaf_key(cell_num)? != key {
            return Err(Error::KeyNotFound(key));
        }

        for i in cell_num..num_cells - 1 {
            let cell = node.leaf_cell(i + 1)?.to_vec();
            node.leaf_cell_mut(i)?.copy_from_slice(&cell);
        }
        node.set_leaf_num_cells(num_cells - 1);
        (num_cells - 1, node.is_root(), cell_num == num_cells - 1)
    };
    table.num_rows -= 1;

    if !is_root {
        if deleted_max {
            // The leaf's max shrank, so ancestor separators built on it are
            // stale until refreshed.
            refresh_ancestor_keys(table, leaf_page)?;
        }
        if (remaining as usize) < LEAF_NODE_MIN_CELLS {
            rebalance_leaf(table, leaf_page)?;
        }
    }
    Ok(())
}

/// Full scan through the leaf chain, ascending key order.
pub fn select_rows(table: &mut Table) -> Result<Vec<Row>, Error> {
    let mut rows = Vec::new();
    let mut cursor = Cursor::start(table)?;
    while !cursor.end_of_table {
        rows.push(cursor.read_row()?);
        cursor.advance()?;
    }
    Ok(rows)
}

/// Splits a full leaf around an insertion: the combined cells are dealt
/// left-low/right-high, the new leaf is spliced into the sibling chain, and
/// the parent takes the new child.
fn leaf_split_insert(
    table: &mut Table,
    old_page: u32,
    at: u32,
    key: u32,
    value: &[u8],
) -> Result<(), Error> {
    let new_page = alloc_page(table)?;
    debug!(old_page, new_page, "Leaf full, splitting");

    table.pager.fetch(old_page)?;
    let (mut cells, old_parent, old_next, old_is_root) = {
        let node = table.pager.get(old_page)?;
        let num_cells = node.leaf_num_cells();
        let mut cells: Vec<(u32, Vec<u8>)> = Vec::with_capacity(num_cells as usize + 1);
        for i in 0..num_cells {
            cells.push((node.leaf_key(i)?, node.leaf_value(i)?.to_vec()));
        }
        (cells, node.parent(), node.leaf_next_leaf(), node.is_root())
    };
    cells.insert(at as usize, (key, value.to_vec()));
    let left_count = cells.len() / 2;

    {
        let mut node = table.pager.get(old_page)?;
        node.set_leaf_num_cells(left_count as u32);
        for (i, (k, v)) in cells[..left_count].iter().enumerate() {
            node.set_leaf_key(i as u32, *k)?;
            node.set_leaf_value(i as u32, v)?;
        }
        node.set_leaf_next_leaf(new_page);
    }
    {
        let mut node = table.pager.get(new_page)?;
        node.init_leaf();
        node.set_parent(old_parent);
        node.set_leaf_next_leaf(old_next);
        node.set_leaf_num_cells((cells.len() - left_count) as u32);
        for (i, (k, v)) in cells[left_count..].iter().enumerate() {
            node.set_leaf_key(i as u32, *k)?;
            node.set_leaf_value(i as u32, v)?;
        }
    }

    if old_is_root {
        create_new_root(table, new_page)
    } else {
        // The old leaf kept the low half, so its separator shrank.
        update_parent_key(table, old_parent, old_page)?;
        insert_child_into_internal(table, old_parent, new_page)
    }
}

/// Adds `new_child` under `parent_page`, splitting the internal node when
/// it cannot take another child. Children are kept as a max-key-sorted list
/// and the node is rebuilt from it, so separators never go stale here.
fn insert_child_into_internal(
    table: &mut Table,
    parent_page: u32,
    new_child: u32,
) -> Result<(), Error> {
    let mut children = collect_children(table, parent_page)?;
    children.push(new_child);

    let mut keyed: Vec<(u32, u32)> = Vec::with_capacity(children.len());
    for &child in &children {
        keyed.push((table.pager.node_max_key(child)?, child));
    }
    keyed.sort_by_key(|&(max_key, _)| max_key);
    let children: Vec<u32> = keyed.into_iter().map(|(_, child)| child).collect();

    if children.len() <= INTERNAL_NODE_MAX_CHILDREN {
        return rebuild_internal(table, parent_page, &children);
    }

    debug!(parent_page, "Internal node full, splitting");
    let (was_root, grandparent) = {
        let node = table.pager.get(parent_page)?;
        (node.is_root(), node.parent())
    };

    let new_page = alloc_page(table)?;
    {
        let mut node = table.pager.get(new_page)?;
        node.init_internal();
        node.set_parent(grandparent);
    }

    let left_count = children.len() / 2;
    rebuild_internal(table, parent_page, &children[..left_count])?;
    rebuild_internal(table, new_page, &children[left_count..])?;

    if was_root {
        create_new_root(table, new_page)
    } else {
        update_parent_key(table, grandparent, parent_page)?;
        insert_child_into_internal(table, grandparent, new_page)
    }
}

/// Grows the tree by one level while keeping the root page number stable:
/// the current root's bytes move to a fresh page which becomes the left
/// child, and the root page is rebuilt as an internal node over both halves.
fn create_new_root(table: &mut Table, right_child_page: u32) -> Result<(), Error> {
    let root_page = table.root_page_num;
    let left_page = alloc_page(table)?;
    debug!(root_page, left_page, right_child_page, "Splitting the root");

    table.pager.fetch(root_page)?;
    {
        let root = table.pager.get(root_page)?;
        let mut left = table.pager.get(left_page)?;
        left.data = root.data;
    }

    // The relocated node's children still point at the root page.
    let moved_children = {
        let left = table.pager.get(left_page)?;
        match left.node_type()? {
            NodeType::Leaf => Vec::new(),
            NodeType::Internal => collect_children_of(&left)?,
        }
    };
    for child in moved_children {
        let mut node = table.pager.get_or_fetch(child)?;
        node.set_parent(left_page);
    }

    {
        let mut root = table.pager.get(root_page)?;
        root.init_internal();
        root.set_root(true);
    }

    let left_max = table.pager.node_max_key(left_page)?;
    let right_max = table.pager.node_max_key(right_child_page)?;
    let children = if left_max <= right_max {
        [left_page, right_child_page]
    } else {
        [right_child_page, left_page]
    };
    rebuild_internal(table, root_page, &children)
}

/// Rewrites an internal node from an ordered child list: separators are
/// recomputed from the subtrees, the last child becomes the right child,
/// and every child is re-pointed at this page. `is_root` and `parent` are
/// preserved.
fn rebuild_internal(table: &mut Table, page: u32, children: &[u32]) -> Result<(), Error> {
    debug_assert!(children.len() >= 2 && children.len() <= INTERNAL_NODE_MAX_CHILDREN);

    table.pager.fetch(page)?;
    let (was_root, parent) = {
        let node = table.pager.get(page)?;
        (node.is_root(), node.parent())
    };

    let mut max_keys: Vec<u32> = Vec::with_capacity(children.len());
    for &child in children {
        max_keys.push(table.pager.node_max_key(child)?);
    }

    {
        let mut node = table.pager.get(page)?;
        node.init_internal();
        node.set_root(was_root);
        node.set_parent(parent);
        node.set_internal_num_keys(children.len() as u32 - 1);
        for i in 0..children.len() - 1 {
            node.set_internal_cell_child(i as u32, children[i])?;
            node.set_internal_key(i as u32, max_keys[i])?;
        }
        node.set_internal_right_child(children[children.len() - 1]);
    }

    for &child in children {
        let mut node = table.pager.get_or_fetch(child)?;
        node.set_parent(page);
        node.set_root(false);
    }
    Ok(())
}

/// Children of an internal node, cell order first, right child last.
fn collect_children(table: &mut Table, page: u32) -> Result<Vec<u32>, Error> {
    table.pager.fetch(page)?;
    let node = table.pager.get(page)?;
    collect_children_of(&node)
}

fn collect_children_of(node: &Node) -> Result<Vec<u32>, Error> {
    let num_keys = node.internal_num_keys();
    let mut children = Vec::with_capacity(num_keys as usize + 1);
    for i in 0..num_keys {
        children.push(node.internal_child(i)?);
    }
    children.push(node.internal_right_child());
    Ok(children)
}

/// Position of `child_page` among the parent's children, `num_keys` meaning
/// the right child. A miss means the parent link is broken.
fn child_index_in_parent(table: &mut Table, parent_page: u32, child_page: u32) -> Result<u32, Error> {
    table.pager.fetch(parent_page)?;
    let node = table.pager.get(parent_page)?;
    let num_keys = node.internal_num_keys();
    for i in 0..num_keys {
        if node.internal_child(i)? == child_page {
            return Ok(i);
        }
    }
    if node.internal_right_child() == child_page {
        return Ok(num_keys);
    }
    Err(err!(
        Corrupt,
        "Page {} is not a child of its parent {}",
        child_page,
        parent_page
    ))
}

/// Refreshes the separator the parent stores for `child_page`. The right
/// child has no separator, so that position is a no-op.
fn update_parent_key(table: &mut Table, parent_page: u32, child_page: u32) -> Result<(), Error> {
    let index = child_index_in_parent(table, parent_page, child_page)?;
    let num_keys = {
        let node = table.pager.get(parent_page)?;
        node.internal_num_keys()
    };
    if index < num_keys {
        let max_key = table.pager.node_max_key(child_page)?;
        let mut node = table.pager.get(parent_page)?;
        node.set_internal_key(index, max_key)?;
    }
    Ok(())
}

/// Walks up from a node whose max key shrank, rewriting separators. The
/// climb continues only while the node is its parent's right child, since
/// that is the one case where the parent's own max changed too.
fn refresh_ancestor_keys(table: &mut Table, page: u32) -> Result<(), Error> {
    let mut page = page;
    loop {
        let parent = {
            let node = table.pager.get_or_fetch(page)?;
            node.parent()
        };
        if parent == 0 {
            return Ok(());
        }
        let index = child_index_in_parent(table, parent, page)?;
        let num_keys = {
            let node = table.pager.get(parent)?;
            node.internal_num_keys()
        };
        if index < num_keys {
            let max_key = table.pager.node_max_key(page)?;
            let mut node = table.pager.get(parent)?;
            node.set_internal_key(index, max_key)?;
            return Ok(());
        }
        page = parent;
    }
}

/// Brings an under-full leaf back into its band: borrow a cell from a
/// sibling that can spare one, otherwise merge with a sibling and drop one
/// child from the parent.
fn rebalance_leaf(table: &mut Table, page: u32) -> Result<(), Error> {
    let parent = {
        let node = table.pager.get_or_fetch(page)?;
        node.parent()
    };
    if parent == 0 {
        return Err(err!(Corrupt, "Non-root leaf {} has no parent", page));
    }

    let index = child_index_in_parent(table, parent, page)?;
    let num_keys = {
        let node = table.pager.get(parent)?;
        node.internal_num_keys()
    };
    let left = if index > 0 {
        let node = table.pager.get(parent)?;
        Some(node.internal_child(index - 1)?)
    } else {
        None
    };
    let right = if index < num_keys {
        let node = table.pager.get(parent)?;
        Some(node.internal_child(index + 1)?)
    } else {
        None
    };

    if let Some(left_page) = left {
        table.pager.fetch(left_page)?;
        let left_cells = {
            let node = table.pager.get(left_page)?;
            node.leaf_num_cells()
        };
        if left_cells as usize > LEAF_NODE_MIN_CELLS {
            debug!(page, left_page, "Borrowing a cell from the left sibling");
            {
                let mut node = table.pager.get(page)?;
                let mut left_node = table.pager.get(left_page)?;
                let num_cells = node.leaf_num_cells();
                for i in (0..num_cells).rev() {
                    let cell = node.leaf_cell(i)?.to_vec();
                    node.leaf_cell_mut(i + 1)?.copy_from_slice(&cell);
                }
                let cell = left_node.leaf_cell(left_cells - 1)?.to_vec();
                node.leaf_cell_mut(0)?.copy_from_slice(&cell);
                node.set_leaf_num_cells(num_cells + 1);
                left_node.set_leaf_num_cells(left_cells - 1);
            }
            // The donor's max moved over.
            update_parent_key(table, parent, left_page)?;
            return Ok(());
        }
    }

    if let Some(right_page) = right {
        table.pager.fetch(right_page)?;
        let right_cells = {
            let node = table.pager.get(right_page)?;
            node.leaf_num_cells()
        };
        if right_cells as usize > LEAF_NODE_MIN_CELLS {
            debug!(page, right_page, "Borrowing a cell from the right sibling");
            {
                let mut node = table.pager.get(page)?;
                let mut right_node = table.pager.get(right_page)?;
                let num_cells = node.leaf_num_cells();
                let cell = right_node.leaf_cell(0)?.to_vec();
                node.leaf_cell_mut(num_cells)?.copy_from_slice(&cell);
                node.set_leaf_num_cells(num_cells + 1);
                for i in 0..right_cells - 1 {
                    let cell = right_node.leaf_cell(i + 1)?.to_vec();
                    right_node.leaf_cell_mut(i)?.copy_from_slice(&cell);
                }
                right_node.set_leaf_num_cells(right_cells - 1);
            }
            // This leaf's max grew.
            update_parent_key(table, parent, page)?;
            return Ok(());
        }
    }

    if let Some(left_page) = left {
        debug!(page, left_page, "Merging into the left sibling");
        {
            let node = table.pager.get(page)?;
            let mut left_node = table.pager.get(left_page)?;
            let num_cells = node.leaf_num_cells();
            let left_cells = left_node.leaf_num_cells();
            for i in 0..num_cells {
                let cell = node.leaf_cell(i)?.to_vec();
                left_node.leaf_cell_mut(left_cells + i)?.copy_from_slice(&cell);
            }
            left_node.set_leaf_num_cells(left_cells + num_cells);
            left_node.set_leaf_next_leaf(node.leaf_next_leaf());
        }
        remove_child_from_internal(table, parent, page)?;
    } else if let Some(right_page) = right {
        debug!(page, right_page, "Merging the right sibling into this leaf");
        {
            let mut node = table.pager.get(page)?;
            let right_node = table.pager.get(right_page)?;
            let num_cells = node.leaf_num_cells();
            let right_cells = right_node.leaf_num_cells();
            for i in 0..right_cells {
                let cell = right_node.leaf_cell(i)?.to_vec();
                node.leaf_cell_mut(num_cells + i)?.copy_from_slice(&cell);
            }
            node.set_leaf_num_cells(num_cells + right_cells);
            node.set_leaf_next_leaf(right_node.leaf_next_leaf());
        }
        remove_child_from_internal(table, parent, right_page)?;
    } else {
        return Err(err!(Corrupt, "Leaf {} has no sibling to rebalance with", page));
    }

    maybe_shrink_root(table)
}

/// Drops one child from an internal node and rebuilds it from the rest.
/// With a single child left the node enters a keyless transient state that
/// only a root collapse or the caller's rebalance may resolve.
fn remove_child_from_internal(
    table: &mut Table,
    parent_page: u32,
    child_page: u32,
) -> Result<(), Error> {
    let children = collect_children(table, parent_page)?;
    let remaining: Vec<u32> = children.into_iter().filter(|&c| c != child_page).collect();
    debug!(
        parent_page,
        child_page,
        remaining = remaining.len(),
        "Removing child from internal node"
    );

    if remaining.len() >= 2 {
        rebuild_internal(table, parent_page, &remaining)?;
    } else if remaining.len() == 1 {
        let mut node = table.pager.get(parent_page)?;
        node.set_internal_num_keys(0);
        node.set_internal_right_child(remaining[0]);
    } else {
        return Err(err!(Corrupt, "Internal node {} lost all children", parent_page));
    }

    let (num_keys, is_root) = {
        let node = table.pager.get(parent_page)?;
        (node.internal_num_keys(), node.is_root())
    };
    let min_keys = if is_root { 0 } else { INTERNAL_NODE_MIN_KEYS as u32 };
    if num_keys < min_keys {
        rebalance_internal(table, parent_page)?;
    }
    Ok(())
}

/// Mirror of [`rebalance_leaf`] one level up. Borrows and merges shuffle
/// whole child lists and let [`rebuild_internal`] regenerate the keys, so
/// separators stay consistent by construction.
fn rebalance_internal(table: &mut Table, page: u32) -> Result<(), Error> {
    let parent = {
        let node = table.pager.get_or_fetch(page)?;
        node.parent()
    };
    if parent == 0 {
        return Err(err!(Corrupt, "Non-root internal node {} has no parent", page));
    }

    let index = child_index_in_parent(table, parent, page)?;
    let num_keys = {
        let node = table.pager.get(parent)?;
        node.internal_num_keys()
    };
    let left = if index > 0 {
        let node = table.pager.get(parent)?;
        Some(node.internal_child(index - 1)?)
    } else {
        None
    };
    let right = if index < num_keys {
        let node = table.pager.get(parent)?;
        Some(node.internal_child(index + 1)?)
    } else {
        None
    };

    let own_children = collect_children(table, page)?;

    if let Some(left_page) = left {
        table.pager.fetch(left_page)?;
        let left_keys = {
            let node = table.pager.get(left_page)?;
            node.internal_num_keys()
        };
        if left_keys as usize > INTERNAL_NODE_MIN_KEYS {
            debug!(page, left_page, "Borrowing a child from the left sibling");
            let mut left_children = collect_children(table, left_page)?;
            let moved = match left_children.pop() {
                Some(child) => child,
                None => return Err(err!(Corrupt, "Internal node {} has no children", left_page)),
            };
            let mut merged = Vec::with_capacity(own_children.len() + 1);
            merged.push(moved);
            merged.extend_from_slice(&own_children);
            rebuild_internal(table, left_page, &left_children)?;
            rebuild_internal(table, page, &merged)?;
            update_parent_key(table, parent, left_page)?;
            update_parent_key(table, parent, page)?;
            return Ok(());
        }
    }

    if let Some(right_page) = right {
        table.pager.fetch(right_page)?;
        let right_keys = {
            let node = table.pager.get(right_page)?;
            node.internal_num_keys()
        };
        if right_keys as usize > INTERNAL_NODE_MIN_KEYS {
            debug!(page, right_page, "Borrowing a child from the right sibling");
            let mut right_children = collect_children(table, right_page)?;
            let moved = right_children.remove(0);
            let mut merged = own_children.clone();
            merged.push(moved);
            rebuild_internal(table, page, &merged)?;
            rebuild_internal(table, right_page, &right_children)?;
            update_parent_key(table, parent, page)?;
            update_parent_key(table, parent, right_page)?;
            return Ok(());
        }
    }

    if let Some(left_page) = left {
        debug!(page, left_page, "Merging into the left internal sibling");
        let mut merged = collect_children(table, left_page)?;
        merged.extend_from_slice(&own_children);
        rebuild_internal(table, left_page, &merged)?;
        remove_child_from_internal(table, parent, page)?;
    } else if let Some(right_page) = right {
        debug!(page, right_page, "Merging the right internal sibling into this node");
        let mut merged = own_children;
        merged.extend(collect_children(table, right_page)?);
        rebuild_internal(table, page, &merged)?;
        remove_child_from_internal(table, parent, right_page)?;
    } else {
        return Err(err!(
            Corrupt,
            "Internal node {} has no sibling to rebalance with",
            page
        ));
    }

    maybe_shrink_root(table)
}

/// Collapses a keyless internal root by promoting its sole child. This is
/// the only operation that changes `root_page_num` after initialization.
fn maybe_shrink_root(table: &mut Table) -> Result<(), Error> {
    let root_page = table.root_page_num;
    let sole_child = {
        let node = table.pager.get_or_fetch(root_page)?;
        match node.node_type()? {
            NodeType::Leaf => return Ok(()),
            NodeType::Internal => {
                if node.internal_num_keys() > 0 {
                    return Ok(());
                }
                node.internal_right_child()
            }
        }
    };

    info!(old_root = root_page, new_root = sole_child, "Collapsing the root");
    {
        let mut node = table.pager.get_or_fetch(sole_child)?;
        node.set_root(true);
        node.set_parent(0);
    }
    table.root_page_num = sole_child;
    Ok(())
}

/// Renders the tree as an indented snapshot for the `.btree` meta-command.
pub fn render_tree(table: &mut Table) -> Result<String, Error> {
    let mut out = String::new();
    let root = table.root_page_num;
    render_node(table, root, 0, &mut out)?;
    Ok(out)
}

fn render_node(table: &mut Table, page: u32, indent: usize, out: &mut String) -> Result<(), Error> {
    use std::fmt::Write as _;

    let pad = "  ".repeat(indent);
    let node_type = {
        let node = table.pager.get_or_fetch(page)?;
        node.node_type()?
    };
    match node_type {
        NodeType::Leaf => {
            let num_cells = {
                let node = table.pager.get(page)?;
                node.leaf_num_cells()
            };
            let _ = writeln!(out, "{}- leaf (size {})", pad, num_cells);
            for i in 0..num_cells {
                let key = {
                    let node = table.pager.get(page)?;
                    node.leaf_key(i)?
                };
                let _ = writeln!(out, "{}  - {}", pad, key);
            }
        }
        NodeType::Internal => {
            let num_keys = {
                let node = table.pager.get(page)?;
                node.internal_num_keys()
            };
            let _ = writeln!(out, "{}- internal (size {})", pad, num_keys);
            for i in 0..num_keys {
                let (child, key) = {
                    let node = table.pager.get(page)?;
                    (node.internal_child(i)?, node.internal_key(i)?)
                };
                render_node(table, child, indent + 1, out)?;
                let _ = writeln!(out, "{}  - key {}", pad, key);
            }
            let right = {
                let node = table.pager.get(page)?;
                node.internal_right_child()
            };
            render_node(table, right, indent + 1, out)?;
        }
    }
    Ok(())
}

/// Row count recomputed from the leaf chain, used to validate the header.
#[cfg(debug_assertions)]
fn count_leaf_cells(table: &mut Table) -> Result<u32, Error> {
    let mut page = table.root_page_num;
    loop {
        let (is_leaf, first_child) = {
            let node = table.pager.get_or_fetch(page)?;
            match node.node_type()? {
                NodeType::Leaf => (true, 0),
                NodeType::Internal => (false, node.internal_child(0)?),
            }
        };
        if is_leaf {
            break;
        }
        page = first_child;
    }

    let mut total = 0;
    loop {
        let (num_cells, next_leaf) = {
            let node = table.pager.get_or_fetch(page)?;
            (node.leaf_num_cells(), node.leaf_next_leaf())
        };
        total += num_cells;
        if next_leaf == 0 {
            return Ok(total);
        }
        page = next_leaf;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::INTERNAL_NODE_MAX_KEYS;
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, Table) {
        let dir = tempfile::tempdir().unwrap();
        let table = Table::open(dir.path().join("test.db")).unwrap();
        (dir, table)
    }

    fn row(id: i32) -> Row {
        Row::new(id, &format!("user{}", id), &format!("user{}@example.com", id))
    }

    fn insert_keys(table: &mut Table, keys: impl IntoIterator<Item = i32>) {
        for id in keys {
            insert_row(table, &row(id)).unwrap();
        }
    }

    fn scan_keys(table: &mut Table) -> Vec<u32> {
        select_rows(table)
            .unwrap()
            .iter()
            .map(|r| r.key())
            .collect()
    }

    /// Keys in ascending order through the sibling chain.
    fn chain_keys(table: &mut Table) -> Vec<u32> {
        let mut page = table.root_page_num;
        loop {
            let (is_leaf, first_child) = {
                let node = table.pager.get_or_fetch(page).unwrap();
                match node.node_type().unwrap() {
                    NodeType::Leaf => (true, 0),
                    NodeType::Internal => (false, node.internal_child(0).unwrap()),
                }
            };
            if is_leaf {
                break;
            }
            page = first_child;
        }

        let mut keys = Vec::new();
        loop {
            let (cell_keys, next_leaf) = {
                let node = table.pager.get_or_fetch(page).unwrap();
                let mut cell_keys = Vec::new();
                for i in 0..node.leaf_num_cells() {
                    cell_keys.push(node.leaf_key(i).unwrap());
                }
                (cell_keys, node.leaf_next_leaf())
            };
            keys.extend(cell_keys);
            if next_leaf == 0 {
                return keys;
            }
            page = next_leaf;
        }
    }

    /// Recursively checks balance, occupancy bands, separator correctness
    /// and parent links; returns the keys in in-order traversal order.
    fn walk(
        table: &mut Table,
        page: u32,
        depth: u32,
        expected_parent: u32,
        expect_root: bool,
        leaf_depths: &mut Vec<u32>,
        in_order: &mut Vec<u32>,
    ) {
        let (node_type, parent, is_root) = {
            let node = table.pager.get_or_fetch(page).unwrap();
            (node.node_type().unwrap(), node.parent(), node.is_root())
        };
        assert_eq!(parent, expected_parent, "parent link of page {}", page);
        assert_eq!(is_root, expect_root, "root flag of page {}", page);

        match node_type {
            NodeType::Leaf => {
                let num_cells = {
                    let node = table.pager.get(page).unwrap();
                    node.leaf_num_cells()
                };
                assert!(num_cells as usize <= LEAF_NODE_MAX_CELLS);
                if !expect_root {
                    assert!(
                        num_cells as usize >= LEAF_NODE_MIN_CELLS,
                        "leaf {} below minimum occupancy",
                        page
                    );
                }
                for i in 0..num_cells {
                    let key = {
                        let node = table.pager.get(page).unwrap();
                        node.leaf_key(i).unwrap()
                    };
                    in_order.push(key);
                }
                leaf_depths.push(depth);
            }
            NodeType::Internal => {
                let num_keys = {
                    let node = table.pager.get(page).unwrap();
                    node.internal_num_keys()
                };
                assert!(num_keys as usize <= INTERNAL_NODE_MAX_KEYS);
                let floor = if expect_root { 1 } else { INTERNAL_NODE_MIN_KEYS as u32 };
                assert!(
                    num_keys >= floor,
                    "internal {} below minimum keys ({} < {})",
                    page,
                    num_keys,
                    floor
                );
                for i in 0..num_keys {
                    let (child, key) = {
                        let node = table.pager.get(page).unwrap();
                        (node.internal_child(i).unwrap(), node.internal_key(i).unwrap())
                    };
                    walk(table, child, depth + 1, page, false, leaf_depths, in_order);
                    let max_key = table.pager.node_max_key(child).unwrap();
                    assert_eq!(key, max_key, "separator {} of internal {}", i, page);
                }
                let right = {
                    let node = table.pager.get(page).unwrap();
                    node.internal_right_child()
                };
                walk(table, right, depth + 1, page, false, leaf_depths, in_order);
            }
        }
    }

    fn check_invariants(table: &mut Table) {
        let root = table.root_page_num;
        let mut leaf_depths = Vec::new();
        let mut in_order = Vec::new();
        walk(table, root, 0, 0, true, &mut leaf_depths, &mut in_order);

        assert!(
            leaf_depths.windows(2).all(|w| w[0] == w[1]),
            "leaves at unequal depths: {:?}",
            leaf_depths
        );
        assert!(
            in_order.windows(2).all(|w| w[0] < w[1]),
            "keys not strictly ascending"
        );
        assert_eq!(chain_keys(table), in_order, "sibling chain disagrees with traversal");
        assert_eq!(table.num_rows as usize, in_order.len(), "row count drifted");
    }

    fn tree_height(table: &mut Table) -> u32 {
        let mut page = table.root_page_num;
        let mut height = 1;
        loop {
            let (is_leaf, first_child) = {
                let node = table.pager.get_or_fetch(page).unwrap();
                match node.node_type().unwrap() {
                    NodeType::Leaf => (true, 0),
                    NodeType::Internal => (false, node.internal_child(0).unwrap()),
                }
            };
            if is_leaf {
                return height;
            }
            height += 1;
            page = first_child;
        }
    }

    #[test]
    fn test_insert_and_scan_roundtrip() {
        let (_dir, mut table) = open_tmp();
        insert_row(&mut table, &Row::new(1, "a", "a@a.com")).unwrap();
        insert_row(&mut table, &Row::new(2, "b", "b@b.com")).unwrap();
        insert_row(&mut table, &Row::new(3, "c", "c@c.com")).unwrap();

        let rows = select_rows(&mut table).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].to_string(), "(1, a, a@a.com)");
        assert_eq!(rows[1].to_string(), "(2, b, b@b.com)");
        assert_eq!(rows[2].to_string(), "(3, c, c@c.com)");
        check_invariants(&mut table);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let (_dir, mut table) = open_tmp();
        insert_row(&mut table, &Row::new(1, "a", "a@a.com")).unwrap();
        match insert_row(&mut table, &Row::new(1, "x", "x@x.com")) {
            Err(Error::DuplicateKey(1)) => {}
            other => panic!("expected duplicate key error, got {:?}", other),
        }

        let rows = select_rows(&mut table).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].username(), "a");
        check_invariants(&mut table);
    }

    #[test]
    fn test_out_of_order_inserts_scan_sorted() {
        let (_dir, mut table) = open_tmp();
        let mut rejected = 0;
        for id in [3, 1, 4, 1, 5, 9, 2, 6] {
            match insert_row(&mut table, &row(id)) {
                Ok(()) => {}
                Err(Error::DuplicateKey(_)) => rejected += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(rejected, 1);
        assert_eq!(scan_keys(&mut table), vec![1, 2, 3, 4, 5, 6, 9]);
        check_invariants(&mut table);
    }

    #[test]
    fn test_fill_leaf_to_exact_capacity() {
        let (_dir, mut table) = open_tmp();
        insert_keys(&mut table, 1..=LEAF_NODE_MAX_CELLS as i32);
        assert_eq!(tree_height(&mut table), 1);
        check_invariants(&mut table);

        // One more forces the first split and an internal root.
        insert_row(&mut table, &row(LEAF_NODE_MAX_CELLS as i32 + 1)).unwrap();
        assert_eq!(tree_height(&mut table), 2);
        let root_type = {
            let node = table.pager.get_or_fetch(table.root_page_num).unwrap();
            node.node_type().unwrap()
        };
        assert_eq!(root_type, NodeType::Internal);
        check_invariants(&mut table);
    }

    #[test]
    fn test_leaf_split_keeps_scan_order() {
        let (_dir, mut table) = open_tmp();
        insert_keys(&mut table, 1..=20);
        assert_eq!(scan_keys(&mut table), (1..=20).collect::<Vec<u32>>());
        assert_eq!(tree_height(&mut table), 2);
        check_invariants(&mut table);
    }

    #[test]
    fn test_root_page_num_stable_across_splits() {
        let (_dir, mut table) = open_tmp();
        insert_keys(&mut table, 1..=60);
        // Splits reuse the root page; only a collapse moves it.
        assert_eq!(table.root_page_num, 1);
        check_invariants(&mut table);
    }

    #[test]
    fn test_internal_split_grows_height() {
        let (_dir, mut table) = open_tmp();
        // Sequential inserts split the rightmost leaf repeatedly; once the
        // root holds INTERNAL_NODE_MAX_CHILDREN leaves the next split must
        // split the root itself.
        insert_keys(&mut table, 1..=60);
        assert_eq!(tree_height(&mut table), 3);
        assert_eq!(scan_keys(&mut table), (1..=60).collect::<Vec<u32>>());
        check_invariants(&mut table);
    }

    #[test]
    fn test_btree_snapshot_after_split() {
        let (_dir, mut table) = open_tmp();
        insert_keys(&mut table, 1..=20);
        let rendered = render_tree(&mut table).unwrap();
        assert!(rendered.starts_with("- internal"));
        assert!(rendered.contains("- leaf"));
        assert!(rendered.contains("- key"));
    }

    #[test]
    fn test_delete_missing_key() {
        let (_dir, mut table) = open_tmp();
        insert_keys(&mut table, 1..=3);
        match delete_row(&mut table, 9) {
            Err(Error::KeyNotFound(9)) => {}
            other => panic!("expected key-not-found error, got {:?}", other),
        }
        assert_eq!(scan_keys(&mut table), vec![1, 2, 3]);
        check_invariants(&mut table);
    }

    #[test]
    fn test_delete_then_insert_roundtrip() {
        let (_dir, mut table) = open_tmp();
        let r = row(5);
        insert_row(&mut table, &r).unwrap();
        delete_row(&mut table, 5).unwrap();
        insert_row(&mut table, &r).unwrap();

        let rows = select_rows(&mut table).unwrap();
        assert_eq!(rows, vec![r]);
        check_invariants(&mut table);
    }

    #[test]
    fn test_delete_from_single_leaf() {
        let (_dir, mut table) = open_tmp();
        insert_keys(&mut table, 1..=5);
        delete_row(&mut table, 3).unwrap();
        assert_eq!(scan_keys(&mut table), vec![1, 2, 4, 5]);
        delete_row(&mut table, 1).unwrap();
        delete_row(&mut table, 5).unwrap();
        assert_eq!(scan_keys(&mut table), vec![2, 4]);
        check_invariants(&mut table);
    }

    #[test]
    fn test_delete_with_rebalance() {
        let (_dir, mut table) = open_tmp();
        insert_keys(&mut table, 1..=20);
        for id in 1..=5 {
            delete_row(&mut table, id).unwrap();
            check_invariants(&mut table);
        }
        assert_eq!(scan_keys(&mut table), (6..=20).collect::<Vec<u32>>());
    }

    #[test]
    fn test_delete_to_exact_min_then_below() {
        let (_dir, mut table) = open_tmp();
        insert_keys(&mut table, 1..=20);
        // The left leaf holds keys 1..=7 after the split at 14.
        delete_row(&mut table, 1).unwrap();
        check_invariants(&mut table);
        // Now exactly at the minimum; the next delete triggers a borrow or
        // merge.
        delete_row(&mut table, 2).unwrap();
        check_invariants(&mut table);
        assert_eq!(scan_keys(&mut table), (3..=20).collect::<Vec<u32>>());
    }

    #[test]
    fn test_delete_max_key_refreshes_separators() {
        let (_dir, mut table) = open_tmp();
        insert_keys(&mut table, 1..=20);
        // Key 7 is the left leaf's max and therefore a root separator.
        delete_row(&mut table, 7).unwrap();
        check_invariants(&mut table);
        assert_eq!(
            scan_keys(&mut table),
            (1..=20).filter(|&k| k != 7).collect::<Vec<u32>>()
        );
    }

    #[test]
    fn test_root_collapse_updates_root_page() {
        let (_dir, mut table) = open_tmp();
        insert_keys(&mut table, 1..=20);
        assert_eq!(table.root_page_num, 1);

        for id in 1..=15 {
            delete_row(&mut table, id).unwrap();
            check_invariants(&mut table);
        }

        // The two leaves merged and the sole survivor was promoted.
        assert_ne!(table.root_page_num, 1);
        let (root_type, is_root, parent) = {
            let node = table.pager.get_or_fetch(table.root_page_num).unwrap();
            (node.node_type().unwrap(), node.is_root(), node.parent())
        };
        assert_eq!(root_type, NodeType::Leaf);
        assert!(is_root);
        assert_eq!(parent, 0);
        assert_eq!(scan_keys(&mut table), (16..=20).collect::<Vec<u32>>());
    }

    #[test]
    fn test_delete_everything_then_reinsert() {
        let (_dir, mut table) = open_tmp();
        insert_keys(&mut table, 1..=20);
        for id in 1..=20 {
            delete_row(&mut table, id).unwrap();
        }
        assert_eq!(table.num_rows, 0);
        assert!(scan_keys(&mut table).is_empty());

        insert_keys(&mut table, [10, 20, 30]);
        assert_eq!(scan_keys(&mut table), vec![10, 20, 30]);
        check_invariants(&mut table);
    }

    #[test]
    fn test_height_three_grow_and_shrink() {
        let (_dir, mut table) = open_tmp();
        insert_keys(&mut table, 1..=200);
        assert!(tree_height(&mut table) >= 3);
        check_invariants(&mut table);

        for id in 1..=200 {
            delete_row(&mut table, id).unwrap();
            check_invariants(&mut table);
        }
        assert!(scan_keys(&mut table).is_empty());
        assert_eq!(tree_height(&mut table), 1);
    }

    #[test]
    fn test_descending_deletes_cascade() {
        let (_dir, mut table) = open_tmp();
        insert_keys(&mut table, 1..=200);
        for id in (1..=200).rev() {
            delete_row(&mut table, id).unwrap();
            check_invariants(&mut table);
        }
        assert_eq!(table.num_rows, 0);
    }

    #[test]
    fn test_permutation_independence() {
        // 37 is coprime with 101, so this visits 1..=100 exactly once in a
        // scrambled order.
        let scrambled: Vec<i32> = (1..=100).map(|i| (i * 37) % 101).collect();

        let (_dir_a, mut shuffled) = open_tmp();
        insert_keys(&mut shuffled, scrambled);
        let (_dir_b, mut sequential) = open_tmp();
        insert_keys(&mut sequential, 1..=100);

        assert_eq!(scan_keys(&mut shuffled), scan_keys(&mut sequential));
        check_invariants(&mut shuffled);
        check_invariants(&mut sequential);
    }

    #[test]
    fn test_reopen_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persist.db");

        {
            let mut table = Table::open(&path).unwrap();
            insert_keys(&mut table, 1..=50);
            table.close().unwrap();
        }
        {
            let mut table = Table::open(&path).unwrap();
            assert_eq!(table.num_rows, 50);
            assert_eq!(scan_keys(&mut table), (1..=50).collect::<Vec<u32>>());
            check_invariants(&mut table);
            for id in 1..=25 {
                delete_row(&mut table, id).unwrap();
            }
            table.close().unwrap();
        }
        let mut table = Table::open(&path).unwrap();
        assert_eq!(table.num_rows, 25);
        assert_eq!(scan_keys(&mut table), (26..=50).collect::<Vec<u32>>());
        check_invariants(&mut table);
    }

    #[test]
    fn test_reopen_after_root_collapse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collapse.db");

        {
            let mut table = Table::open(&path).unwrap();
            insert_keys(&mut table, 1..=20);
            for id in 1..=15 {
                delete_row(&mut table, id).unwrap();
            }
            assert_ne!(table.root_page_num, 1);
            table.close().unwrap();
        }
        let mut table = Table::open(&path).unwrap();
        assert_ne!(table.root_page_num, 1);
        assert_eq!(scan_keys(&mut table), (16..=20).collect::<Vec<u32>>());
        check_invariants(&mut table);
    }

    #[test]
    fn test_unmutated_table_is_unchanged_by_caller_errors() {
        let (_dir, mut table) = open_tmp();
        insert_keys(&mut table, 1..=20);
        let before = render_tree(&mut table).unwrap();

        assert!(insert_row(&mut table, &row(5)).is_err());
        assert!(delete_row(&mut table, 999).is_err());

        assert_eq!(render_tree(&mut table).unwrap(), before);
        check_invariants(&mut table);
    }
}
