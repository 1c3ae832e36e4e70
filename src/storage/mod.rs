pub mod btree;
pub mod cursor;
pub mod pager;
pub mod row;
pub mod table;

pub use cursor::Cursor;
pub use row::Row;
pub use table::{delete_row, insert_row, render_tree, select_rows, Table};
