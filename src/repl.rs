//! The REPL (Read-Eval-Print-Loop) module.
//!
//! Reads statements and meta-commands from stdin and drives the storage
//! engine. Caller errors (duplicate key, missing key, bad syntax) are
//! reported and the loop continues; anything else ends the session.
use crate::console::print_prompt;
use crate::echo;
use crate::echo_lines;
use crate::errors::Error;
use crate::history;
use crate::statement::{self, Statement};
use crate::storage::btree::{
    INTERNAL_NODE_MAX_KEYS, LEAF_NODE_CELL_SIZE, LEAF_NODE_HEADER_SIZE, LEAF_NODE_MAX_CELLS,
    LEAF_NODE_MIN_CELLS,
};
use crate::storage::pager::{PAGE_SIZE, TABLE_MAX_PAGES};
use crate::storage::row::ROW_SIZE;
use crate::storage::{self, Table};
use std::io::{self, BufRead};
use std::path::Path;
use tracing::warn;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const HELP: &str = r#"Statements:
  insert <id> <username> <email>
  select
  delete <id>

Meta-commands:
  .btree      Show the B+tree layout.
  .constants  Show the storage layout constants.
  .help       Show this message.
  .exit       Flush to disk and quit.
"#;

pub fn start(db_path: &Path) -> Result<(), Error> {
    echo!("minisql {}.\n", VERSION);
    echo!("Connected to {}. Type .help for usage hints.\n", db_path.display());

    let mut table = Table::open(db_path)?;
    let history_path = history::history_path();
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        print_prompt()?;

        let line = match lines.next() {
            Some(line) => line?,
            None => break, // stdin closed
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if let Err(e) = history::append_history(input, &history_path) {
            warn!("Failed to append history: {}", e);
        }

        if input.starts_with('.') {
            match input {
                ".exit" => break,
                ".btree" => {
                    echo!("Tree:\n");
                    echo_lines!("{}", storage::render_tree(&mut table)?);
                }
                ".constants" => {
                    echo!("Constants:\n");
                    echo!("PAGE_SIZE: {}\n", PAGE_SIZE);
                    echo!("TABLE_MAX_PAGES: {}\n", TABLE_MAX_PAGES);
                    echo!("ROW_SIZE: {}\n", ROW_SIZE);
                    echo!("LEAF_NODE_HEADER_SIZE: {}\n", LEAF_NODE_HEADER_SIZE);
                    echo!("LEAF_NODE_CELL_SIZE: {}\n", LEAF_NODE_CELL_SIZE);
                    echo!("LEAF_NODE_MAX_CELLS: {}\n", LEAF_NODE_MAX_CELLS);
                    echo!("LEAF_NODE_MIN_CELLS: {}\n", LEAF_NODE_MIN_CELLS);
                    echo!("INTERNAL_NODE_MAX_KEYS: {}\n", INTERNAL_NODE_MAX_KEYS);
                }
                ".help" => echo_lines!("{}", HELP),
                unknown => echo!("Unrecognized command '{}'. Type .help for usage hints.\n", unknown),
            }
            continue;
        }

        match statement::parse(input) {
            Ok(statement) => {
                if let Err(e) = execute(&mut table, statement) {
                    if e.is_fatal() {
                        // Leave the file as the last close wrote it.
                        return Err(e);
                    }
                    echo!("Error: {}\n", e);
                }
            }
            Err(e) => echo!("Error: {}\n", e),
        }
    }

    table.close()?;
    echo!("Bye\n");
    Ok(())
}

fn execute(table: &mut Table, statement: Statement) -> Result<(), Error> {
    match statement {
        Statement::Insert(row) => {
            storage::insert_row(table, &row)?;
            echo!("Executed.\n");
        }
        Statement::Select => {
            for row in storage::select_rows(table)? {
                echo!("{}\n", row);
            }
            echo!("Executed.\n");
        }
        Statement::Delete(key) => {
            storage::delete_row(table, key)?;
            echo!("Executed.\n");
        }
    }
    Ok(())
}
