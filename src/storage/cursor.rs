//! Cursor-based navigation over the leaf chain.
//!
//! A cursor is a position identified by (page number, cell index) plus an
//! end-of-table flag. It is a single-use position: any insert or delete may
//! relocate cells or split and merge pages, so a caller that mutates the
//! tree must refetch its cursor.
use super::btree::NodeType;
use super::row::Row;
use super::table::Table;
use crate::errors::Error;

pub struct Cursor<'a> {
    pub table: &'a mut Table,
    pub page_num: u32,
    pub cell_num: u32,
    /// A position one past the last row.
    pub end_of_table: bool,
}

impl<'a> Cursor<'a> {
    /// Positions a cursor at `key`, or at the slot where `key` would be
    /// inserted. Descends from the root through internal nodes by binary
    /// search, then binary-searches the leaf.
    pub fn find(table: &'a mut Table, key: u32) -> Result<Self, Error> {
        let mut page_num = table.root_page_num;

        loop {
            let node = table.pager.get_or_fetch(page_num)?;
            match node.node_type()? {
                NodeType::Leaf => {
                    let cell_num = node.leaf_find_slot(key)?;
                    let end_of_table = cell_num == node.leaf_num_cells();
                    drop(node);
                    return Ok(Cursor {
                        table,
                        page_num,
                        cell_num,
                        end_of_table,
                    });
                }
                NodeType::Internal => {
                    let child_index = node.internal_find_child(key)?;
                    let child = node.internal_child(child_index)?;
                    drop(node);
                    page_num = child;
                }
            }
        }
    }

    /// Positions a cursor at the first row in key order: the leftmost leaf,
    /// cell 0.
    pub fn start(table: &'a mut Table) -> Result<Self, Error> {
        let mut page_num = table.root_page_num;

        loop {
            let node = table.pager.get_or_fetch(page_num)?;
            match node.node_type()? {
                NodeType::Leaf => {
                    let end_of_table = node.leaf_num_cells() == 0;
                    drop(node);
                    return Ok(Cursor {
                        table,
                        page_num,
                        cell_num: 0,
                        end_of_table,
                    });
                }
                NodeType::Internal => {
                    let child = node.internal_child(0)?;
                    drop(node);
                    page_num = child;
                }
            }
        }
    }

    /// Moves to the next cell, hopping to the next leaf through the sibling
    /// chain when the current one is exhausted.
    pub fn advance(&mut self) -> Result<(), Error> {
        let (num_cells, next_leaf) = {
            let node = self.table.pager.get_or_fetch(self.page_num)?;
            (node.leaf_num_cells(), node.leaf_next_leaf())
        };

        self.cell_num += 1;
        if self.cell_num >= num_cells {
            if next_leaf == 0 {
                // Rightmost leaf.
                self.end_of_table = true;
            } else {
                self.page_num = next_leaf;
                self.cell_num = 0;
                let node = self.table.pager.get_or_fetch(next_leaf)?;
                self.end_of_table = node.leaf_num_cells() == 0;
            }
        }
        Ok(())
    }

    /// Key of the cell under the cursor.
    pub fn key(&mut self) -> Result<u32, Error> {
        let node = self.table.pager.get_or_fetch(self.page_num)?;
        node.leaf_key(self.cell_num)
    }

    /// Copies the row bytes under the cursor into `buf`.
    pub fn read_value(&mut self, buf: &mut Vec<u8>) -> Result<(), Error> {
        let node = self.table.pager.get_or_fetch(self.page_num)?;
        let value = node.leaf_value(self.cell_num)?;
        buf.clear();
        buf.extend_from_slice(value);
        Ok(())
    }

    /// Decodes the row under the cursor.
    pub fn read_row(&mut self) -> Result<Row, Error> {
        let node = self.table.pager.get_or_fetch(self.page_num)?;
        Row::deserialize(node.leaf_value(self.cell_num)?)
    }
}
