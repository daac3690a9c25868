//! Growable byte buffer with independent write and read cursors.
//!
//! [`ByteStream`] is the staging area shared by the wire codec and the
//! socket I/O path: serialization produces into it, a read burst drains
//! into it, and deserialization consumes from it. The write length
//! tracks how much has been produced; the read offset tracks how much
//! has been consumed. Capacity grows by doubling or to exact fit,
//! whichever is larger, and never shrinks.

use byteorder::{BigEndian, ByteOrder};

#[derive(Debug, Default)]
pub struct ByteStream {
    data: Vec<u8>,
    len: usize,
    offset: usize,
}

impl ByteStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes not yet consumed by [`read`](Self::read).
    pub fn remaining(&self) -> usize {
        self.len - self.offset
    }

    /// The produced bytes, independent of the read offset.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Drops all content and rewinds both cursors.
    pub fn clear(&mut self) {
        self.len = 0;
        self.offset = 0;
    }

    /// Rewinds the read cursor to the start of the produced bytes.
    pub fn rewind(&mut self) {
        self.offset = 0;
    }

    /// Appends `bytes` at the write cursor, growing the buffer if needed.
    pub fn write(&mut self, bytes: &[u8]) {
        let needed = self.len + bytes.len();
        if needed > self.data.len() {
            let grown = (self.data.len() * 2).max(needed);
            self.data.resize(grown, 0);
        }
        self.data[self.len..needed].copy_from_slice(bytes);
        self.len = needed;
    }

    pub fn write_u16_be(&mut self, value: u16) {
        let mut buf = [0u8; 2];
        BigEndian::write_u16(&mut buf, value);
        self.write(&buf);
    }

    /// Consumes exactly `n` bytes at the read cursor.
    ///
    /// Returns `None` without moving the cursor when fewer than `n`
    /// bytes remain unread.
    pub fn read(&mut self, n: usize) -> Option<&[u8]> {
        if self.offset + n > self.len {
            return None;
        }
        let slice = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Some(slice)
    }

    pub fn read_u16_be(&mut self) -> Option<u16> {
        self.read(2).map(BigEndian::read_u16)
    }
}

// --- tests ------------------------------------------------------------------
