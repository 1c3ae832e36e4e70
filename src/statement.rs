//! The textual command grammar.
//!
//! Three statements, no SQL pretensions:
//!
//! ```text
//! insert <id> <username> <email>
//! select
//! delete <id>
//! ```
//!
//! Parsing never touches the engine; a parsed statement carries everything
//! the executor needs.
use crate::errors::Error;
use crate::storage::row::{Row, COLUMN_EMAIL_SIZE, COLUMN_USERNAME_SIZE};
use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, PartialEq)]
pub enum Statement {
    Insert(Row),
    Select,
    Delete(u32),
}

static INSERT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^insert\s+(-?\d+)\s+(\S+)\s+(\S+)$").expect("valid insert pattern"));

static DELETE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^delete\s+(-?\d+)$").expect("valid delete pattern"));

pub fn parse(input: &str) -> Result<Statement, Error> {
    let input = input.trim();

    if input == "select" {
        return Ok(Statement::Select);
    }

    if input.starts_with("insert") {
        let caps = INSERT_RE
            .captures(input)
            .ok_or_else(|| err!(Syntax, "Usage: insert <id> <username> <email>"))?;
        let id: i32 = caps[1]
            .parse()
            .map_err(|_| err!(Syntax, "Could not parse id '{}'", &caps[1]))?;
        if id < 0 {
            return Err(err!(Syntax, "Id must be positive"));
        }
        let username = &caps[2];
        let email = &caps[3];
        if username.len() > COLUMN_USERNAME_SIZE {
            return Err(err!(Syntax, "Username is too long ({} bytes max)", COLUMN_USERNAME_SIZE));
        }
        if email.len() > COLUMN_EMAIL_SIZE {
            return Err(err!(Syntax, "Email is too long ({} bytes max)", COLUMN_EMAIL_SIZE));
        }
        return Ok(Statement::Insert(Row::new(id, username, email)));
    }

    if input.starts_with("delete") {
        let caps = DELETE_RE
            .captures(input)
            .ok_or_else(|| err!(Syntax, "Usage: delete <id>"))?;
        let id: i32 = caps[1]
            .parse()
            .map_err(|_| err!(Syntax, "Could not parse id '{}'", &caps[1]))?;
        if id < 0 {
            return Err(err!(Syntax, "Id must be positive"));
        }
        return Ok(Statement::Delete(id as u32));
    }

    Err(err!(Syntax, "Unrecognized statement '{}'", input))
}
