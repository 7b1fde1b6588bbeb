//! Fixed-width row codec.
//!
//! ```text
//! [id: u64 LE][username: 32 bytes][email: 255 bytes]   = 295 bytes
//! ```
//!
//! Strings are UTF-8, truncated on a character boundary and zero padded. A
//! field ends at its first zero byte, so strings with embedded NULs do not
//! survive a round trip.

use crate::{Result, StorageError};
use bytes::{Buf, BufMut};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const ID_SIZE: usize = 8;
pub const USERNAME_MAX: usize = 32;
pub const EMAIL_MAX: usize = 255;
pub const ROW_SIZE: usize = ID_SIZE + USERNAME_MAX + EMAIL_MAX;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Row {
    pub id: u64,
    pub username: String,
    pub email: String,
}

impl Row {
    pub fn new(id: u64, username: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            email: email.into(),
        }
    }

    /// Write the row into the first [`ROW_SIZE`] bytes of `dst`.
    pub fn encode(&self, dst: &mut [u8]) -> Result<usize> {
        check_len(dst.len())?;
        self.write_fields(&mut dst[..ROW_SIZE]);
        Ok(ROW_SIZE)
    }

    pub fn decode(src: &[u8]) -> Result<Row> {
        check_len(src.len())?;

        let mut input = &src[..ROW_SIZE];
        let id = input.get_u64_le();
        let username = get_fixed(&mut input, USERNAME_MAX);
        let email = get_fixed(&mut input, EMAIL_MAX);
        Ok(Row {
            id,
            username,
            email,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; ROW_SIZE];
        self.write_fields(&mut buf);
        buf
    }

    fn write_fields(&self, mut out: &mut [u8]) {
        out.put_u64_le(self.id);
        put_fixed(&mut out, &self.username, USERNAME_MAX);
        put_fixed(&mut out, &self.email, EMAIL_MAX);
    }
}

fn check_len(len: usize) -> Result<()> {
    if len < ROW_SIZE {
        return Err(StorageError::BufferTooSmall {
            needed: ROW_SIZE,
            actual: len,
        });
    }
    Ok(())
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a char.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn put_fixed(out: &mut &mut [u8], s: &str, width: usize) {
    let bytes = truncate_utf8(s, width).as_bytes();
    out.put_slice(bytes);
    out.put_bytes(0, width - bytes.len());
}

fn get_fixed(input: &mut &[u8], width: usize) -> String {
    let field = &input[..width];
    let end = field.iter().position(|&b| b == 0).unwrap_or(width);
    let s = String::from_utf8_lossy(&field[..end]).into_owned();
    input.advance(width);
    s
}
