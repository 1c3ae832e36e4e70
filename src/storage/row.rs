//! The fixed-width row and its byte codec.
//!
//! Rows never cross page boundaries, so a fixed serialized size keeps the
//! cell arithmetic in the node layout trivial. The username and email
//! columns reserve one extra byte for a NUL terminator so a full-length
//! string still round-trips through C-style tooling.
use crate::errors::Error;
use std::fmt;

pub const COLUMN_USERNAME_SIZE: usize = 32;
pub const COLUMN_EMAIL_SIZE: usize = 255;

pub const ID_SIZE: usize = std::mem::size_of::<u32>();
pub const USERNAME_SIZE: usize = COLUMN_USERNAME_SIZE + 1;
pub const EMAIL_SIZE: usize = COLUMN_EMAIL_SIZE + 1;
pub const ID_OFFSET: usize = 0;
pub const USERNAME_OFFSET: usize = ID_OFFSET + ID_SIZE;
pub const EMAIL_OFFSET: usize = USERNAME_OFFSET + USERNAME_SIZE;
pub const ROW_SIZE: usize = ID_SIZE + USERNAME_SIZE + EMAIL_SIZE;

/// A single table row: `id` (primary key), `username`, `email`.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub id: i32,
    pub username: [u8; USERNAME_SIZE],
    pub email: [u8; EMAIL_SIZE],
}

/// Copies a string into a zero-padded fixed-size buffer, truncating at `N`.
pub fn str_to_fixed_bytes<const N: usize>(input: &str) -> [u8; N] {
    let mut buf = [0u8; N];
    let bytes = input.as_bytes();
    let len = bytes.len().min(N);
    buf[..len].copy_from_slice(&bytes[..len]);
    buf
}

fn fixed_bytes_to_str(buf: &[u8]) -> String {
    String::from_utf8_lossy(buf)
        .trim_end_matches('\0')
        .to_string()
}

impl Row {
    pub fn new(id: i32, username: &str, email: &str) -> Self {
        Row {
            id,
            username: str_to_fixed_bytes(username),
            email: str_to_fixed_bytes(email),
        }
    }

    /// The B+tree key for this row.
    pub fn key(&self) -> u32 {
        self.id as u32
    }

    pub fn username(&self) -> String {
        fixed_bytes_to_str(&self.username)
    }

    pub fn email(&self) -> String {
        fixed_bytes_to_str(&self.email)
    }

    /// Serializes the row by raw byte copy into its on-page form.
    pub fn serialize(&self) -> [u8; ROW_SIZE] {
        let mut buf = [0u8; ROW_SIZE];
        buf[ID_OFFSET..ID_OFFSET + ID_SIZE].copy_from_slice(&self.id.to_le_bytes());
        buf[USERNAME_OFFSET..USERNAME_OFFSET + USERNAME_SIZE].copy_from_slice(&self.username);
        buf[EMAIL_OFFSET..EMAIL_OFFSET + EMAIL_SIZE].copy_from_slice(&self.email);
        buf
    }

    pub fn deserialize(buf: &[u8]) -> Result<Row, Error> {
        if buf.len() != ROW_SIZE {
            return Err(err!(
                Storage,
                "Row buffer size mismatch (expected={}, got={})",
                ROW_SIZE,
                buf.len()
            ));
        }

        let mut id_bytes = [0u8; ID_SIZE];
        id_bytes.copy_from_slice(&buf[ID_OFFSET..ID_OFFSET + ID_SIZE]);

        let mut username = [0u8; USERNAME_SIZE];
        username.copy_from_slice(&buf[USERNAME_OFFSET..USERNAME_OFFSET + USERNAME_SIZE]);

        let mut email = [0u8; EMAIL_SIZE];
        email.copy_from_slice(&buf[EMAIL_OFFSET..EMAIL_OFFSET + EMAIL_SIZE]);

        Ok(Row {
            id: i32::from_le_bytes(id_bytes),
            username,
            email,
        })
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.id, self.username(), self.email())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_roundtrip() {
        let row = Row::new(42, "alice", "alice@example.com");
        let buf = row.serialize();
        assert_eq!(buf.len(), ROW_SIZE);
        let back = Row::deserialize(&buf).unwrap();
        assert_eq!(back, row);
        assert_eq!(back.username(), "alice");
        assert_eq!(back.email(), "alice@example.com");
    }

    #[test]
    fn test_full_length_columns() {
        let username = "u".repeat(COLUMN_USERNAME_SIZE);
        let email = "e".repeat(COLUMN_EMAIL_SIZE);
        let row = Row::new(1, &username, &email);
        let back = Row::deserialize(&row.serialize()).unwrap();
        assert_eq!(back.username(), username);
        assert_eq!(back.email(), email);
    }

    #[test]
    fn test_deserialize_rejects_short_buffer() {
        assert!(Row::deserialize(&[0u8; ROW_SIZE - 1]).is_err());
    }

    #[test]
    fn test_display() {
        let row = Row::new(7, "bob", "bob@b.com");
        assert_eq!(row.to_string(), "(7, bob, bob@b.com)");
    }
}
