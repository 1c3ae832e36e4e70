//! On-page node layout for the B+tree.
//!
//! Every page past the header is a tree node. Internal nodes route lookups,
//! leaf nodes hold the rows:
//!
//! | **Property**       | **Internal node**             | **Leaf node**       |
//! |--------------------|-------------------------------|---------------------|
//! | Stores             | keys and child page numbers   | keys and rows       |
//! | Number of keys     | up to `INTERNAL_NODE_MAX_KEYS`| as many as will fit |
//! | Number of children | number of keys + 1            | none                |
//! | Key purpose        | max key of the child subtree  | paired with a row   |
//!
//! The key in internal cell *i* is the largest key reachable through that
//! cell's child; the rightmost subtree carries no separator and lives in the
//! node header instead. Leaves are chained through `next_leaf` in ascending
//! key order, which gives the full scan without touching internal nodes.
//!
//! [`Node`] owns a page-sized buffer and exposes typed accessors that
//! compute byte offsets from the constants below. Writing through an
//! accessor mutates the buffer in place; whatever the pager flushes is
//! exactly what these accessors wrote.
use super::pager::PAGE_SIZE;
use super::row::ROW_SIZE;
use crate::errors::Error;
use std::fmt;

// Common Node Header Layout

pub const NODE_TYPE_SIZE: usize = std::mem::size_of::<u8>();
pub const NODE_TYPE_OFFSET: usize = 0;
pub const IS_ROOT_SIZE: usize = std::mem::size_of::<u8>();
pub const IS_ROOT_OFFSET: usize = NODE_TYPE_OFFSET + NODE_TYPE_SIZE;
pub const PARENT_POINTER_SIZE: usize = std::mem::size_of::<u32>();
pub const PARENT_POINTER_OFFSET: usize = IS_ROOT_OFFSET + IS_ROOT_SIZE;
pub const COMMON_NODE_HEADER_SIZE: usize = NODE_TYPE_SIZE + IS_ROOT_SIZE + PARENT_POINTER_SIZE;

// Leaf Node Header Layout

pub const LEAF_NODE_NUM_CELLS_SIZE: usize = std::mem::size_of::<u32>();
pub const LEAF_NODE_NUM_CELLS_OFFSET: usize = COMMON_NODE_HEADER_SIZE;
pub const LEAF_NODE_NEXT_LEAF_SIZE: usize = std::mem::size_of::<u32>();
pub const LEAF_NODE_NEXT_LEAF_OFFSET: usize = LEAF_NODE_NUM_CELLS_OFFSET + LEAF_NODE_NUM_CELLS_SIZE;
pub const LEAF_NODE_HEADER_SIZE: usize =
    COMMON_NODE_HEADER_SIZE + LEAF_NODE_NUM_CELLS_SIZE + LEAF_NODE_NEXT_LEAF_SIZE;

// Leaf Node Body Layout

pub const LEAF_NODE_KEY_SIZE: usize = std::mem::size_of::<u32>();
pub const LEAF_NODE_KEY_OFFSET: usize = 0;
pub const LEAF_NODE_VALUE_SIZE: usize = ROW_SIZE;
pub const LEAF_NODE_VALUE_OFFSET: usize = LEAF_NODE_KEY_OFFSET + LEAF_NODE_KEY_SIZE;
pub const LEAF_NODE_CELL_SIZE: usize = LEAF_NODE_KEY_SIZE + LEAF_NODE_VALUE_SIZE;
pub const LEAF_NODE_SPACE_FOR_CELLS: usize = PAGE_SIZE - LEAF_NODE_HEADER_SIZE;
pub const LEAF_NODE_MAX_CELLS: usize = LEAF_NODE_SPACE_FOR_CELLS / LEAF_NODE_CELL_SIZE;

/// Under-full threshold for rebalancing. The root is exempt.
pub const LEAF_NODE_MIN_CELLS: usize = LEAF_NODE_MAX_CELLS / 2;

// Internal Node Header Layout

pub const INTERNAL_NODE_NUM_KEYS_SIZE: usize = std::mem::size_of::<u32>();
pub const INTERNAL_NODE_NUM_KEYS_OFFSET: usize = COMMON_NODE_HEADER_SIZE;
pub const INTERNAL_NODE_RIGHT_CHILD_SIZE: usize = std::mem::size_of::<u32>();
pub const INTERNAL_NODE_RIGHT_CHILD_OFFSET: usize =
    INTERNAL_NODE_NUM_KEYS_OFFSET + INTERNAL_NODE_NUM_KEYS_SIZE;
pub const INTERNAL_NODE_HEADER_SIZE: usize =
    COMMON_NODE_HEADER_SIZE + INTERNAL_NODE_NUM_KEYS_SIZE + INTERNAL_NODE_RIGHT_CHILD_SIZE;

// Internal Node Body Layout

pub const INTERNAL_NODE_CHILD_SIZE: usize = std::mem::size_of::<u32>();
pub const INTERNAL_NODE_KEY_SIZE: usize = std::mem::size_of::<u32>();
pub const INTERNAL_NODE_CELL_SIZE: usize = INTERNAL_NODE_CHILD_SIZE + INTERNAL_NODE_KEY_SIZE;

/// Kept small, as in the C sources, so split and merge paths are reachable
/// in tests. A page could fit far more, but the byte layout is the same
/// either way.
pub const INTERNAL_NODE_MAX_KEYS: usize = 3;
pub const INTERNAL_NODE_MAX_CHILDREN: usize = INTERNAL_NODE_MAX_KEYS + 1;
pub const INTERNAL_NODE_MIN_KEYS: usize = INTERNAL_NODE_MAX_KEYS / 2;

/// Discriminant stored in the first byte of every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Leaf,
    Internal,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeType::Leaf => write!(f, "leaf"),
            NodeType::Internal => write!(f, "internal"),
        }
    }
}

/// A page interpreted as a B+tree node.
///
/// All multi-byte fields are little-endian. Accessors taking a cell or key
/// index validate it; fixed-offset fields cannot fail and return plain
/// values.
#[derive(Debug)]
pub struct Node {
    pub data: [u8; PAGE_SIZE],
}

impl Node {
    pub fn new() -> Self {
        Node {
            data: [0u8; PAGE_SIZE],
        }
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.data[offset..offset + 4]);
        u32::from_le_bytes(buf)
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Resets the page to an empty non-root leaf with no sibling.
    pub fn init_leaf(&mut self) {
        self.set_node_type(NodeType::Leaf);
        self.set_root(false);
        self.set_parent(0);
        self.set_leaf_num_cells(0);
        self.set_leaf_next_leaf(0);
    }

    /// Resets the page to an empty non-root internal node.
    pub fn init_internal(&mut self) {
        self.set_node_type(NodeType::Internal);
        self.set_root(false);
        self.set_parent(0);
        self.set_internal_num_keys(0);
        self.set_internal_right_child(0);
    }

    pub fn node_type(&self) -> Result<NodeType, Error> {
        match self.data[NODE_TYPE_OFFSET] {
            0 => Ok(NodeType::Internal),
            1 => Ok(NodeType::Leaf),
            invalid => Err(err!(Corrupt, "Invalid node type byte: {}", invalid)),
        }
    }

    pub fn set_node_type(&mut self, node_type: NodeType) {
        self.data[NODE_TYPE_OFFSET] = match node_type {
            NodeType::Internal => 0,
            NodeType::Leaf => 1,
        };
    }

    pub fn is_root(&self) -> bool {
        self.data[IS_ROOT_OFFSET] == 1
    }

    pub fn set_root(&mut self, is_root: bool) {
        self.data[IS_ROOT_OFFSET] = is_root as u8;
    }

    /// Page number of the parent internal node, 0 for the root.
    pub fn parent(&self) -> u32 {
        self.read_u32(PARENT_POINTER_OFFSET)
    }

    pub fn set_parent(&mut self, parent: u32) {
        self.write_u32(PARENT_POINTER_OFFSET, parent);
    }

    // Leaf accessors

    pub fn leaf_num_cells(&self) -> u32 {
        self.read_u32(LEAF_NODE_NUM_CELLS_OFFSET)
    }

    pub fn set_leaf_num_cells(&mut self, num: u32) {
        self.write_u32(LEAF_NODE_NUM_CELLS_OFFSET, num);
    }

    /// Page number of the next leaf in key order, 0 for the last leaf.
    pub fn leaf_next_leaf(&self) -> u32 {
        self.read_u32(LEAF_NODE_NEXT_LEAF_OFFSET)
    }

    pub fn set_leaf_next_leaf(&mut self, next: u32) {
        self.write_u32(LEAF_NODE_NEXT_LEAF_OFFSET, next);
    }

    fn leaf_cell_offset(&self, cell_num: u32) -> Result<usize, Error> {
        if cell_num as usize >= LEAF_NODE_MAX_CELLS {
            return Err(err!(
                Storage,
                "Leaf cell number out of bounds (cell_num={}, max_cells={})",
                cell_num,
                LEAF_NODE_MAX_CELLS
            ));
        }
        Ok(LEAF_NODE_HEADER_SIZE + cell_num as usize * LEAF_NODE_CELL_SIZE)
    }

    pub fn leaf_cell(&self, cell_num: u32) -> Result<&[u8], Error> {
        let offset = self.leaf_cell_offset(cell_num)?;
        Ok(&self.data[offset..offset + LEAF_NODE_CELL_SIZE])
    }

    pub fn leaf_cell_mut(&mut self, cell_num: u32) -> Result<&mut [u8], Error> {
        let offset = self.leaf_cell_offset(cell_num)?;
        Ok(&mut self.data[offset..offset + LEAF_NODE_CELL_SIZE])
    }

    pub fn leaf_key(&self, cell_num: u32) -> Result<u32, Error> {
        let offset = self.leaf_cell_offset(cell_num)?;
        Ok(self.read_u32(offset + LEAF_NODE_KEY_OFFSET))
    }

    pub fn set_leaf_key(&mut self, cell_num: u32, key: u32) -> Result<(), Error> {
        let offset = self.leaf_cell_offset(cell_num)?;
        self.write_u32(offset + LEAF_NODE_KEY_OFFSET, key);
        Ok(())
    }

    pub fn leaf_value(&self, cell_num: u32) -> Result<&[u8], Error> {
        let offset = self.leaf_cell_offset(cell_num)?;
        let start = offset + LEAF_NODE_VALUE_OFFSET;
        Ok(&self.data[start..start + LEAF_NODE_VALUE_SIZE])
    }

    pub fn set_leaf_value(&mut self, cell_num: u32, buf: &[u8]) -> Result<(), Error> {
        if buf.len() != LEAF_NODE_VALUE_SIZE {
            return Err(err!(
                Storage,
                "Value size mismatch (expected={}, got={})",
                LEAF_NODE_VALUE_SIZE,
                buf.len()
            ));
        }
        let offset = self.leaf_cell_offset(cell_num)?;
        let start = offset + LEAF_NODE_VALUE_OFFSET;
        self.data[start..start + LEAF_NODE_VALUE_SIZE].copy_from_slice(buf);
        Ok(())
    }

    /// Largest key stored in this leaf, 0 when empty. An empty leaf is a
    /// transient state only; callers never observe it between operations.
    pub fn leaf_max_key(&self) -> Result<u32, Error> {
        let num_cells = self.leaf_num_cells();
        if num_cells == 0 {
            return Ok(0);
        }
        self.leaf_key(num_cells - 1)
    }

    /// Binary search for `key`, returning the match index or the slot where
    /// the key would be inserted.
    pub fn leaf_find_slot(&self, key: u32) -> Result<u32, Error> {
        let mut min = 0;
        let mut one_past_max = self.leaf_num_cells();
        while min != one_past_max {
            let mid = (min + one_past_max) / 2;
            let key_at_mid = self.leaf_key(mid)?;
            if key == key_at_mid {
                return Ok(mid);
            }
            if key < key_at_mid {
                one_past_max = mid;
            } else {
                min = mid + 1;
            }
        }
        Ok(min)
    }

    // Internal accessors

    pub fn internal_num_keys(&self) -> u32 {
        self.read_u32(INTERNAL_NODE_NUM_KEYS_OFFSET)
    }

    pub fn set_internal_num_keys(&mut self, num: u32) {
        self.write_u32(INTERNAL_NODE_NUM_KEYS_OFFSET, num);
    }

    pub fn internal_right_child(&self) -> u32 {
        self.read_u32(INTERNAL_NODE_RIGHT_CHILD_OFFSET)
    }

    pub fn set_internal_right_child(&mut self, child: u32) {
        self.write_u32(INTERNAL_NODE_RIGHT_CHILD_OFFSET, child);
    }

    fn internal_cell_offset(&self, cell_num: u32) -> Result<usize, Error> {
        if cell_num as usize >= INTERNAL_NODE_MAX_KEYS {
            return Err(err!(
                Storage,
                "Internal cell number out of bounds (cell_num={}, max_keys={})",
                cell_num,
                INTERNAL_NODE_MAX_KEYS
            ));
        }
        Ok(INTERNAL_NODE_HEADER_SIZE + cell_num as usize * INTERNAL_NODE_CELL_SIZE)
    }

    /// Child page number at position `child_num` in `[0..=num_keys]`, where
    /// `num_keys` addresses the right child.
    pub fn internal_child(&self, child_num: u32) -> Result<u32, Error> {
        let num_keys = self.internal_num_keys();
        if child_num > num_keys {
            return Err(err!(
                Storage,
                "Child index {} exceeds num_keys {}",
                child_num,
                num_keys
            ));
        }
        if child_num == num_keys {
            Ok(self.internal_right_child())
        } else {
            let offset = self.internal_cell_offset(child_num)?;
            Ok(self.read_u32(offset))
        }
    }

    /// Writes the child half of cell `cell_num`. The right child has its own
    /// setter.
    pub fn set_internal_cell_child(&mut self, cell_num: u32, child: u32) -> Result<(), Error> {
        let offset = self.internal_cell_offset(cell_num)?;
        self.write_u32(offset, child);
        Ok(())
    }

    pub fn internal_key(&self, key_num: u32) -> Result<u32, Error> {
        let num_keys = self.internal_num_keys();
        if key_num >= num_keys {
            return Err(err!(
                Storage,
                "Key index {} exceeds num_keys {}",
                key_num,
                num_keys
            ));
        }
        let offset = self.internal_cell_offset(key_num)?;
        Ok(self.read_u32(offset + INTERNAL_NODE_CHILD_SIZE))
    }

    pub fn set_internal_key(&mut self, key_num: u32, key: u32) -> Result<(), Error> {
        let num_keys = self.internal_num_keys();
        if key_num >= num_keys {
            return Err(err!(
                Storage,
                "Key index {} exceeds num_keys {}",
                key_num,
                num_keys
            ));
        }
        let offset = self.internal_cell_offset(key_num)?;
        self.write_u32(offset + INTERNAL_NODE_CHILD_SIZE, key);
        Ok(())
    }

    /// Binary search for the child position covering `key`: the smallest
    /// index whose separator is `>= key`, or `num_keys` (the right child)
    /// when every separator is smaller.
    pub fn internal_find_child(&self, key: u32) -> Result<u32, Error> {
        let mut min = 0;
        let mut max = self.internal_num_keys();
        while min != max {
            let mid = (min + max) / 2;
            if self.internal_key(mid)? >= key {
                max = mid;
            } else {
                min = mid + 1;
            }
        }
        Ok(min)
    }
}

impl Clone for Node {
    fn clone(&self) -> Self {
        Node { data: self.data }
    }
}
